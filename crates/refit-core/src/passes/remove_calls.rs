//! Removal of calls to given routines.

use serde::{Deserialize, Serialize};

use crate::error::TransformError;
use crate::ir::{Arena, NodeId, NodeKind, NodeType};
use crate::scheduler::{DependencyChanges, Pass, PassContext, PassOutput, PlanContext};
use crate::visit::{NodeFilter, Transform, Transformer};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoveCallsOptions {
    /// Routine names whose calls are removed (case-insensitive).
    pub names: Vec<String>,
}

/// Drops `call` statements to the listed routines. A one-line `if` whose
/// only statement was removed goes with it.
#[derive(Debug, Clone)]
pub struct RemoveCalls {
    options: RemoveCallsOptions,
}

impl RemoveCalls {
    pub fn new(options: RemoveCallsOptions) -> Result<Self, TransformError> {
        if options.names.iter().any(|n| n.trim().is_empty()) {
            return Err(TransformError::InvalidOptions {
                pass: "remove-calls".to_string(),
                message: "routine names must not be empty".to_string(),
            });
        }
        Ok(RemoveCalls { options })
    }

    fn matches(&self, name: &str) -> bool {
        self.options.names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }
}

struct CallRemover<'p> {
    pass: &'p RemoveCalls,
}

impl Transformer for CallRemover<'_> {
    fn filter(&self) -> NodeFilter {
        NodeFilter::only(&[NodeType::Call, NodeType::Conditional])
    }

    fn transform(
        &mut self,
        arena: &mut Arena,
        node: NodeId,
        original: NodeId,
    ) -> Result<Transform, TransformError> {
        match arena.kind(node) {
            NodeKind::Call { name, .. } if self.pass.matches(name) => Ok(Transform::Remove),
            NodeKind::Conditional {
                branches,
                inline: true,
                ..
            } if node != original && branches.iter().all(|b| b.body.is_empty()) => Ok(Transform::Remove),
            _ => Ok(Transform::Keep),
        }
    }
}

impl Pass for RemoveCalls {
    fn name(&self) -> &str {
        "remove-calls"
    }

    fn options_key(&self) -> String {
        serde_json::to_string(&self.options).unwrap_or_default()
    }

    fn plan(&self, cx: &PlanContext<'_>) -> DependencyChanges {
        let mut removed: Vec<String> = cx
            .called_names()
            .filter(|name| self.matches(name))
            .map(str::to_ascii_lowercase)
            .collect();
        removed.sort();
        removed.dedup();
        DependencyChanges {
            added: Vec::new(),
            removed,
        }
    }

    fn run(&self, cx: &mut PassContext<'_>) -> Result<PassOutput, TransformError> {
        let replacement = cx.rewrite(&mut CallRemover { pass: self })?;
        Ok(PassOutput::replaced(replacement))
    }
}
