//! Routine duplication with caller updates.
//!
//! Runs callee-first. A selected routine stays as it is and gets a copy under
//! a suffixed name, appended next to it; its summary is
//! `{"duplicate": {"old", "new", "module"}}`. Callers follow every `call` to
//! the original with the same call to the copy, and import the copy when it
//! lives in a module of its own.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::callgraph::UnitKind;
use crate::error::TransformError;
use crate::ir::{Arena, NodeId, NodeKind, NodeType, UseItem};
use crate::scheduler::{DependencyChanges, ExecutionOrder, Pass, PassContext, PassOutput, PlanContext};
use crate::visit::{NodeFilter, Transform, Transformer};

use super::rename::retitle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DuplicateRoutinesOptions {
    /// Routines to duplicate.
    pub routines: Vec<String>,
    /// Appended to the name of each copy.
    pub suffix: String,
}

impl Default for DuplicateRoutinesOptions {
    fn default() -> Self {
        DuplicateRoutinesOptions {
            routines: Vec::new(),
            suffix: "_duplicated".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DuplicateRoutines {
    options: DuplicateRoutinesOptions,
}

impl DuplicateRoutines {
    pub fn new(options: DuplicateRoutinesOptions) -> Result<Self, TransformError> {
        let invalid = |message: String| TransformError::InvalidOptions {
            pass: "duplicate-routines".to_string(),
            message,
        };
        if options.routines.is_empty() || options.routines.iter().any(|r| r.trim().is_empty()) {
            return Err(invalid("`routines` must list at least one routine name".to_string()));
        }
        let suffix = options.suffix.trim();
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid(format!(
                "suffix `{}` is not a valid name fragment",
                options.suffix
            )));
        }
        Ok(DuplicateRoutines { options })
    }

    fn selected(&self, name: &str) -> bool {
        self.options.routines.iter().any(|r| r.eq_ignore_ascii_case(name))
    }

    fn copy_name(&self, name: &str) -> String {
        format!("{}{}", name, self.options.suffix)
    }
}

/// Where callers find the copy of one routine.
#[derive(Debug, Clone)]
struct CopyTarget {
    name: String,
    module: Option<String>,
}

fn read_summary(summary: &serde_json::Value) -> Option<(String, CopyTarget)> {
    let duplicate = summary.get("duplicate")?;
    let old = duplicate.get("old")?.as_str()?;
    let new = duplicate.get("new")?.as_str()?;
    let module = duplicate.get("module").and_then(|m| m.as_str()).map(str::to_string);
    Some((
        old.to_ascii_lowercase(),
        CopyTarget {
            name: new.to_string(),
            module,
        },
    ))
}

/// Follows calls to duplicated routines with the same call to the copy.
struct CallDuplicator<'a> {
    /// Keyed by lowercase original name.
    copies: &'a HashMap<String, CopyTarget>,
    /// Lowercase names of the copies now called.
    used: BTreeSet<String>,
}

impl Transformer for CallDuplicator<'_> {
    fn filter(&self) -> NodeFilter {
        NodeFilter::only(&[NodeType::Call, NodeType::Conditional])
    }

    fn transform(
        &mut self,
        arena: &mut Arena,
        node: NodeId,
        original: NodeId,
    ) -> Result<Transform, TransformError> {
        match arena.kind(node).clone() {
            NodeKind::Call { name, args } => {
                let Some(copy) = self.copies.get(&name.to_ascii_lowercase()) else {
                    return Ok(Transform::Keep);
                };
                let args = args
                    .iter()
                    .map(|&arg| arena.deep_copy(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                self.used.insert(copy.name.to_ascii_lowercase());
                let twin = arena.alloc(NodeKind::Call {
                    name: copy.name.clone(),
                    args,
                });
                Ok(Transform::Flatten(vec![node, twin]))
            }
            // A one-line `if` now guarding two calls becomes a block.
            NodeKind::Conditional {
                branches,
                else_body,
                inline: true,
            } if node != original && branches.iter().any(|b| b.body.len() > 1) => {
                Ok(Transform::Replace(arena.alloc(NodeKind::Conditional {
                    branches,
                    else_body,
                    inline: false,
                })))
            }
            _ => Ok(Transform::Keep),
        }
    }
}

impl Pass for DuplicateRoutines {
    fn name(&self) -> &str {
        "duplicate-routines"
    }

    fn order(&self) -> ExecutionOrder {
        ExecutionOrder::CalleeFirst
    }

    fn unit_kinds(&self) -> &[UnitKind] {
        UnitKind::ALL
    }

    fn options_key(&self) -> String {
        serde_json::to_string(&self.options).unwrap_or_default()
    }

    fn plan(&self, cx: &PlanContext<'_>) -> DependencyChanges {
        let mut added: Vec<String> = cx
            .callees
            .iter()
            .filter(|c| c.kind.is_routine() && self.selected(&c.name))
            .map(|c| self.copy_name(&c.name))
            .collect();
        added.sort();
        added.dedup();
        DependencyChanges {
            added,
            removed: Vec::new(),
        }
    }

    fn run(&self, cx: &mut PassContext<'_>) -> Result<PassOutput, TransformError> {
        let mut output = PassOutput::unchanged();

        let name = cx.unit.name.clone();
        if matches!(cx.unit.kind, UnitKind::Subroutine | UnitKind::Function) && self.selected(&name) {
            let new = self.copy_name(&name);
            let copy = duplicate(cx.arena, cx.node, &name, &new)?;
            tracing::debug!(unit = %cx.unit.qualified_name(), copy = %new, "duplicated routine");
            output = output.with_added(vec![copy]).with_summary(json!({
                "duplicate": { "old": name, "new": new, "module": cx.unit.module }
            }));
        }

        let mut copies: HashMap<String, CopyTarget> = cx
            .dependencies
            .iter()
            .filter_map(|d| read_summary(&d.summary))
            .collect();
        // Calls already followed by their copy are left alone.
        for called in own_calls(cx.arena, cx.node) {
            copies.retain(|_, copy| !copy.name.eq_ignore_ascii_case(&called));
        }
        if copies.is_empty() {
            return Ok(output);
        }

        let mut duplicator = CallDuplicator {
            copies: &copies,
            used: BTreeSet::new(),
        };
        let Some(rewritten) = cx.rewrite(&mut duplicator)? else {
            return Ok(output);
        };
        let arena = &*cx.arena;
        let imports: Vec<(String, String)> = copies
            .values()
            .filter(|copy| duplicator.used.contains(&copy.name.to_ascii_lowercase()))
            .filter_map(|copy| {
                let module = copy.module.as_ref()?;
                let local = cx.unit.module.as_ref().is_some_and(|m| m.eq_ignore_ascii_case(module))
                    || cx.unit.name.eq_ignore_ascii_case(module);
                (!local && !imports_module(arena, rewritten, module, &copy.name))
                    .then(|| (module.clone(), copy.name.clone()))
            })
            .collect();
        let replacement = add_imports(cx.arena, rewritten, imports);
        output.replacement = Some(replacement);
        Ok(output)
    }
}

/// Copy of `routine` named `new`. Statements keep their source text; the
/// opening and closing lines are written for the new name.
fn duplicate(arena: &mut Arena, routine: NodeId, old: &str, new: &str) -> Result<NodeId, TransformError> {
    let kind = arena.kind(routine).clone();
    let mut kind = kind.try_map_children(|child, _| Ok(vec![arena.deep_copy(child)?]))?;
    retitle(&mut kind, old, new);
    Ok(arena.alloc(kind))
}

/// Names called by the unit itself, not by procedures it contains.
fn own_calls(arena: &Arena, unit: NodeId) -> Vec<String> {
    arena
        .descendants(unit)
        .into_iter()
        .filter(|&n| arena.enclosing_unit(n) == Some(unit))
        .filter_map(|n| match arena.kind(n) {
            NodeKind::Call { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}

/// Whether the unit's spec already makes `name` from `module` visible.
fn imports_module(arena: &Arena, unit: NodeId, module: &str, name: &str) -> bool {
    let NodeKind::Routine { spec, .. } = arena.kind(unit) else {
        return false;
    };
    spec.iter().any(|&s| match arena.kind(s) {
        NodeKind::Use { module: m, only, .. } if m.eq_ignore_ascii_case(module) => match only {
            None => true,
            Some(items) => items.iter().any(|i| i.name.eq_ignore_ascii_case(name)),
        },
        _ => false,
    })
}

/// Rebuild `routine` with `use module, only: name` statements in front of
/// its spec.
fn add_imports(arena: &mut Arena, routine: NodeId, imports: Vec<(String, String)>) -> NodeId {
    if imports.is_empty() {
        return routine;
    }
    let uses: Vec<NodeId> = imports
        .into_iter()
        .map(|(module, name)| {
            arena.alloc(NodeKind::Use {
                module,
                intrinsic: false,
                only: Some(vec![UseItem { name, rename: None }]),
            })
        })
        .collect();
    let data = arena.node(routine);
    let (head, tail, parent) = (data.head, data.tail, data.parent);
    let mut kind = data.kind.clone();
    let NodeKind::Routine { spec, .. } = &mut kind else {
        return routine;
    };
    spec.splice(0..0, uses);
    let fresh = arena.alloc_container(kind, None, head, tail);
    arena.set_parent(fresh, parent);
    arena.derive(fresh, routine);
    fresh
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Branch, JumpKind, RoutineKind};
    use crate::passes::testing;
    use crate::scheduler::DependencySummary;
    use crate::source::SourceUnit;
    use crate::types::{SourceId, Span};

    fn pass() -> DuplicateRoutines {
        DuplicateRoutines::new(DuplicateRoutinesOptions {
            routines: vec!["kernel".into()],
            suffix: "_gpu".into(),
        })
        .unwrap()
    }

    fn call(arena: &mut Arena, name: &str, arg: &str) -> NodeId {
        let arg = arena.alloc(NodeKind::var(arg));
        arena.alloc(NodeKind::Call {
            name: name.into(),
            args: vec![arg],
        })
    }

    fn routine(arena: &mut Arena, name: &str, spec: Vec<NodeId>, body: Vec<NodeId>) -> NodeId {
        arena.alloc(NodeKind::Routine {
            name: name.into(),
            kind: RoutineKind::Subroutine,
            prefixes: vec![],
            params: vec![],
            spec,
            body,
            routines: vec![],
        })
    }

    fn unit_of(arena: Arena, items: Vec<NodeId>) -> SourceUnit {
        let mut arena = arena;
        let root = arena.alloc(NodeKind::File { items });
        SourceUnit::new(SourceId(0), "t.f90", "", "test", arena, root)
    }

    fn kernel_summary(module: Option<&str>) -> DependencySummary {
        DependencySummary {
            unit: testing::info("kernel", UnitKind::Subroutine),
            summary: json!({ "duplicate": { "old": "kernel", "new": "kernel_gpu", "module": module } }),
        }
    }

    fn calls(arena: &Arena, statements: &[NodeId]) -> Vec<String> {
        statements
            .iter()
            .filter_map(|&s| match arena.kind(s) {
                NodeKind::Call { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn kernel_stays_and_gets_a_copy() {
        let mut arena = Arena::new();
        let body = arena.alloc_spanned(
            NodeKind::Jump {
                kind: JumpKind::Return,
            },
            Some(Span::new(20, 28)),
        );
        let kernel = arena.alloc_container(
            NodeKind::Routine {
                name: "kernel".into(),
                kind: RoutineKind::Subroutine,
                prefixes: vec![],
                params: vec![],
                spec: vec![],
                body: vec![body],
                routines: vec![],
            },
            Some(Span::new(0, 50)),
            Some(Span::new(0, 19)),
            Some(Span::new(29, 50)),
        );
        let mut unit = unit_of(arena, vec![kernel]);
        let mut info = testing::info("kernel", UnitKind::Subroutine);
        info.module = Some("kernels".into());
        let out = testing::run(&pass(), &mut unit, &info, kernel, vec![]).unwrap();

        assert_eq!(out.replacement, None);
        assert_eq!(
            out.summary,
            Some(json!({ "duplicate": { "old": "kernel", "new": "kernel_gpu", "module": "kernels" } }))
        );
        let [copy] = out.added.as_slice() else {
            panic!("expected one copy");
        };
        let NodeKind::Routine { name, body: copied, .. } = unit.arena.kind(*copy) else {
            panic!("not a routine");
        };
        assert_eq!(name, "kernel_gpu");
        assert_ne!(copied[0], body);
        assert_eq!(unit.arena.span(copied[0]), Some(Span::new(20, 28)));
        assert_eq!(unit.arena.head(*copy), None);
        // The original is untouched.
        assert_eq!(unit.arena.parent(body), Some(kernel));
    }

    #[test]
    fn callers_follow_each_call_with_the_copy() {
        let mut arena = Arena::new();
        let first = call(&mut arena, "KERNEL", "a");
        let other = call(&mut arena, "other", "a");
        let guarded = call(&mut arena, "kernel", "b");
        let cond = arena.alloc(NodeKind::var("ready"));
        let inline_if = arena.alloc(NodeKind::Conditional {
            branches: vec![Branch {
                condition: cond,
                body: vec![guarded],
            }],
            else_body: None,
            inline: true,
        });
        let driver = routine(&mut arena, "driver", vec![], vec![first, other, inline_if]);
        let mut unit = unit_of(arena, vec![driver]);
        let info = testing::info("driver", UnitKind::Subroutine);
        let out = testing::run(&pass(), &mut unit, &info, driver, vec![kernel_summary(None)]).unwrap();

        let new = out.replacement.unwrap();
        let NodeKind::Routine { spec, body, .. } = unit.arena.kind(new) else {
            panic!("not a routine");
        };
        assert!(spec.is_empty());
        assert_eq!(calls(&unit.arena, body), vec!["KERNEL", "kernel_gpu", "other"]);
        let NodeKind::Conditional { branches, inline, .. } = unit.arena.kind(body[3]) else {
            panic!("not a conditional");
        };
        assert!(!inline);
        assert_eq!(calls(&unit.arena, &branches[0].body), vec!["kernel", "kernel_gpu"]);
        // The copied call has its own arguments.
        assert_ne!(unit.arena.children(body[0]), unit.arena.children(body[1]));
        assert!(out.added.is_empty());
        assert_eq!(out.summary, None);

        // Running again over the result changes nothing.
        let again = testing::run(&pass(), &mut unit, &info, new, vec![kernel_summary(None)]).unwrap();
        assert_eq!(again.replacement, None);
    }

    #[test]
    fn module_copies_are_imported() {
        let mut arena = Arena::new();
        let existing = arena.alloc(NodeKind::Use {
            module: "kernels".into(),
            intrinsic: false,
            only: Some(vec![UseItem {
                name: "kernel".into(),
                rename: None,
            }]),
        });
        let first = call(&mut arena, "kernel", "a");
        let driver = routine(&mut arena, "driver", vec![existing], vec![first]);
        let mut unit = unit_of(arena, vec![driver]);
        let info = testing::info("driver", UnitKind::Subroutine);
        let deps = vec![kernel_summary(Some("kernels"))];
        let out = testing::run(&pass(), &mut unit, &info, driver, deps).unwrap();

        let NodeKind::Routine { spec, .. } = unit.arena.kind(out.replacement.unwrap()) else {
            panic!("not a routine");
        };
        assert_eq!(spec.len(), 2);
        assert_eq!(
            unit.arena.kind(spec[0]),
            &NodeKind::Use {
                module: "kernels".into(),
                intrinsic: false,
                only: Some(vec![UseItem {
                    name: "kernel_gpu".into(),
                    rename: None
                }]),
            }
        );
        assert_eq!(spec[1], existing);
    }

    #[test]
    fn callers_inside_the_module_need_no_import() {
        let mut arena = Arena::new();
        let first = call(&mut arena, "kernel", "a");
        let driver = routine(&mut arena, "driver", vec![], vec![first]);
        let mut unit = unit_of(arena, vec![driver]);
        let mut info = testing::info("driver", UnitKind::Subroutine);
        info.module = Some("KERNELS".into());
        let deps = vec![kernel_summary(Some("kernels"))];
        let out = testing::run(&pass(), &mut unit, &info, driver, deps).unwrap();
        let NodeKind::Routine { spec, body, .. } = unit.arena.kind(out.replacement.unwrap()) else {
            panic!("not a routine");
        };
        assert!(spec.is_empty());
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn plan_adds_copies_of_selected_callees() {
        let kernel = testing::info("Kernel", UnitKind::Subroutine);
        let other = testing::info("other", UnitKind::Subroutine);
        let driver = testing::info("driver", UnitKind::Program);
        let cx = PlanContext {
            unit: &driver,
            callees: vec![&kernel, &other],
            unresolved: vec![],
        };
        let changes = pass().plan(&cx);
        assert_eq!(changes.added, vec!["Kernel_gpu"]);
        assert!(changes.removed.is_empty());
    }

    #[test]
    fn options_are_checked() {
        assert!(DuplicateRoutines::new(DuplicateRoutinesOptions::default()).is_err());
        assert!(DuplicateRoutines::new(DuplicateRoutinesOptions {
            routines: vec!["k".into()],
            suffix: "-x".into(),
        })
        .is_err());
        let defaults: DuplicateRoutinesOptions = serde_json::from_value(json!({ "routines": ["k"] })).unwrap();
        assert_eq!(defaults.suffix, "_duplicated");
    }
}
