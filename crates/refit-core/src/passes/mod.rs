//! Built-in passes.
//!
//! | name | order | effect |
//! |------|-------|--------|
//! | `idem` | independent | nothing; exercises the round trip |
//! | `remove-calls` | independent | drops `call` statements to listed routines |
//! | `annotate-loops` | independent | puts a directive in front of matching loops |
//! | `rename-routines` | callee-first | appends a suffix to routine names and updates callers |
//! | `duplicate-routines` | callee-first | keeps listed routines, adds suffixed copies and calls them too |

mod annotate_loops;
mod duplicate;
mod idem;
mod remove_calls;
mod rename;

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::TransformError;
use crate::scheduler::{Pass, PassRegistry};

pub use annotate_loops::{AnnotateLoops, AnnotateLoopsOptions};
pub use duplicate::{DuplicateRoutines, DuplicateRoutinesOptions};
pub use idem::Idem;
pub use remove_calls::{RemoveCalls, RemoveCallsOptions};
pub use rename::{RenameRoutines, RenameRoutinesOptions};

/// Names of the built-in passes.
pub const BUILTIN_PASSES: &[&str] = &[
    "idem",
    "remove-calls",
    "annotate-loops",
    "rename-routines",
    "duplicate-routines",
];

/// Parse pass options; `null` means defaults.
pub(crate) fn parse_options<T: DeserializeOwned + Default>(
    pass: &str,
    options: &serde_json::Value,
) -> Result<T, TransformError> {
    if options.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(options.clone()).map_err(|e| TransformError::InvalidOptions {
        pass: pass.to_string(),
        message: e.to_string(),
    })
}

/// Instantiate a built-in pass by name.
pub fn builtin_pass(name: &str, options: &serde_json::Value) -> Option<Result<Arc<dyn Pass>, TransformError>> {
    let pass: Result<Arc<dyn Pass>, TransformError> = match name {
        "idem" => Ok(Arc::new(Idem)),
        "remove-calls" => {
            parse_options(name, options).and_then(|o| Ok(Arc::new(RemoveCalls::new(o)?) as Arc<dyn Pass>))
        }
        "annotate-loops" => {
            parse_options(name, options).and_then(|o| Ok(Arc::new(AnnotateLoops::new(o)?) as Arc<dyn Pass>))
        }
        "rename-routines" => {
            parse_options(name, options).and_then(|o| Ok(Arc::new(RenameRoutines::new(o)?) as Arc<dyn Pass>))
        }
        "duplicate-routines" => parse_options(name, options)
            .and_then(|o| Ok(Arc::new(DuplicateRoutines::new(o)?) as Arc<dyn Pass>)),
        _ => return None,
    };
    Some(pass)
}

/// Registry holding every built-in pass.
pub fn builtin_registry() -> PassRegistry {
    let mut registry = PassRegistry::new();
    for &name in BUILTIN_PASSES {
        registry.register(
            name,
            Arc::new(move |options: &serde_json::Value| {
                builtin_pass(name, options).unwrap_or_else(|| {
                    Err(TransformError::InvalidOptions {
                        pass: name.to_string(),
                        message: "not a built-in pass".to_string(),
                    })
                })
            }),
        );
    }
    registry
}

#[cfg(test)]
pub(crate) mod testing {
    //! Hand-built units for pass tests.

    use crate::callgraph::{UnitInfo, UnitKey, UnitKind};
    use crate::error::TransformError;
    use crate::ir::{ItemPath, NodeId};
    use crate::scheduler::{DependencySummary, Pass, PassContext, PassOutput};
    use crate::source::SourceUnit;
    use crate::types::SourceId;

    pub fn info(name: &str, kind: UnitKind) -> UnitInfo {
        UnitInfo {
            key: UnitKey::new(SourceId(0), ItemPath(vec![0])),
            name: name.to_string(),
            kind,
            file: "t.f90".into(),
            module: None,
        }
    }

    /// Run a pass directly on `node` of `unit`.
    pub fn run(
        pass: &dyn Pass,
        unit: &mut SourceUnit,
        info: &UnitInfo,
        node: NodeId,
        dependencies: Vec<DependencySummary>,
    ) -> Result<PassOutput, TransformError> {
        let mut cx = PassContext {
            unit: info,
            node,
            arena: &mut unit.arena,
            scopes: &unit.scopes,
            text: &unit.text,
            dependencies,
            round: 1,
        };
        pass.run(&mut cx)
    }
}
