//! Routine renaming with caller updates.
//!
//! Runs callee-first: every renamed routine publishes `{"old", "new"}` as its
//! summary, and callers rewrite `call` statements, function references and
//! `use, only:` items according to the summaries of their callees.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::callgraph::UnitKind;
use crate::error::TransformError;
use crate::ir::{Arena, NodeId, NodeKind, NodeType, RoutineKind, UseItem};
use crate::scheduler::{DependencyChanges, ExecutionOrder, Pass, PassContext, PassOutput, PlanContext};
use crate::symbols::{Binding, ScopeTable, SymbolKind};
use crate::visit::{NodeFilter, Transform, Transformer};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenameRoutinesOptions {
    /// Appended to every renamed routine.
    pub suffix: String,
    /// Routines to rename; empty means all.
    pub routines: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RenameRoutines {
    options: RenameRoutinesOptions,
}

impl RenameRoutines {
    pub fn new(options: RenameRoutinesOptions) -> Result<Self, TransformError> {
        let suffix = options.suffix.trim();
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(TransformError::InvalidOptions {
                pass: "rename-routines".to_string(),
                message: format!("suffix `{}` is not a valid name fragment", options.suffix),
            });
        }
        Ok(RenameRoutines { options })
    }

    fn selected(&self, name: &str) -> bool {
        self.options.routines.is_empty()
            || self
                .options
                .routines
                .iter()
                .any(|r| r.eq_ignore_ascii_case(name) || r.eq_ignore_ascii_case(self.base_name(name)))
    }

    fn has_suffix(&self, name: &str) -> bool {
        let suffix = &self.options.suffix;
        name.len() > suffix.len()
            && name.is_char_boundary(name.len() - suffix.len())
            && name[name.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
    }

    fn base_name<'n>(&self, name: &'n str) -> &'n str {
        if self.has_suffix(name) {
            &name[..name.len() - self.options.suffix.len()]
        } else {
            name
        }
    }
}

/// Rewrites references according to an old→new name map.
struct ReferenceRenamer<'a> {
    /// Keyed by lowercase old name.
    renamed: HashMap<String, String>,
    /// The unit's own rename; applies to recursive `call`s only.
    own: Option<(String, String)>,
    scopes: &'a ScopeTable,
}

impl ReferenceRenamer<'_> {
    fn lookup(&self, name: &str) -> Option<&str> {
        self.renamed.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// A subscript renames only when it refers to a procedure, not an array
    /// that happens to share the name.
    fn is_procedure_reference(&self, original: NodeId) -> bool {
        match self.scopes.binding(original) {
            Some(Binding::Resolved { symbol, .. }) => symbol.kind == SymbolKind::Procedure,
            Some(Binding::Unresolved { .. }) | None => true,
        }
    }
}

impl Transformer for ReferenceRenamer<'_> {
    fn filter(&self) -> NodeFilter {
        NodeFilter::only(&[NodeType::Call, NodeType::Subscript, NodeType::Use])
    }

    fn transform(
        &mut self,
        arena: &mut Arena,
        node: NodeId,
        original: NodeId,
    ) -> Result<Transform, TransformError> {
        let kind = match arena.kind(node) {
            NodeKind::Call { name, args } => {
                let own = self
                    .own
                    .as_ref()
                    .filter(|(old, _)| old.eq_ignore_ascii_case(name))
                    .map(|(_, new)| new.as_str());
                match own.or_else(|| self.lookup(name)) {
                    Some(new) => NodeKind::Call {
                        name: new.to_string(),
                        args: args.clone(),
                    },
                    None => return Ok(Transform::Keep),
                }
            }
            NodeKind::Subscript { name, indices } if self.is_procedure_reference(original) => {
                match self.lookup(name) {
                    Some(new) => NodeKind::Subscript {
                        name: new.to_string(),
                        indices: indices.clone(),
                    },
                    None => return Ok(Transform::Keep),
                }
            }
            NodeKind::Use {
                module,
                intrinsic,
                only: Some(items),
            } => {
                let mut changed = false;
                let items: Vec<UseItem> = items
                    .iter()
                    .map(|item| match self.lookup(&item.name) {
                        Some(new) => {
                            changed = true;
                            UseItem {
                                name: new.to_string(),
                                rename: item.rename.clone(),
                            }
                        }
                        None => item.clone(),
                    })
                    .collect();
                if !changed {
                    return Ok(Transform::Keep);
                }
                NodeKind::Use {
                    module: module.clone(),
                    intrinsic: *intrinsic,
                    only: Some(items),
                }
            }
            _ => return Ok(Transform::Keep),
        };
        Ok(Transform::Replace(arena.alloc(kind)))
    }
}

impl Pass for RenameRoutines {
    fn name(&self) -> &str {
        "rename-routines"
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
        let mut changes = DependencyChanges::default();
        for callee in &cx.callees {
            if callee.kind.is_routine() && self.selected(&callee.name) && !self.has_suffix(&callee.name) {
                changes
                    .added
                    .push(format!("{}{}", callee.name, self.options.suffix));
                changes.removed.push(callee.name.clone());
            }
        }
        changes
    }

    fn run(&self, cx: &mut PassContext<'_>) -> Result<PassOutput, TransformError> {
        let mut renamed = HashMap::new();
        for dep in &cx.dependencies {
            let (Some(old), Some(new)) = (
                dep.summary.get("old").and_then(|v| v.as_str()),
                dep.summary.get("new").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            if !old.eq_ignore_ascii_case(new) {
                renamed.insert(old.to_ascii_lowercase(), new.to_string());
            }
        }

        let name = cx.unit.name.clone();
        let renames_self =
            matches!(cx.unit.kind, UnitKind::Subroutine | UnitKind::Function) && self.selected(&name);
        let base = self.base_name(&name).to_string();
        let target = format!("{}{}", base, self.options.suffix);
        let own = (renames_self && !self.has_suffix(&name)).then(|| (name.clone(), target.clone()));

        let mut renamer = ReferenceRenamer {
            renamed,
            own: own.clone(),
            scopes: cx.scopes,
        };
        let rewritten = cx.rewrite(&mut renamer)?;
        let current = rewritten.unwrap_or(cx.node);

        let replacement = match own {
            Some((old, new)) => Some(rename_routine(cx.arena, current, &old, &new)),
            None => rewritten,
        };
        let output = PassOutput::replaced(replacement);
        if renames_self {
            tracing::debug!(unit = %cx.unit.qualified_name(), new = %target, "renamed routine");
            Ok(output.with_summary(json!({ "old": base, "new": target })))
        } else {
            Ok(output)
        }
    }
}

/// Fresh copy of a routine under a new name. The head and tail lines mention
/// the name, so the copy carries no spans.
fn rename_routine(arena: &mut Arena, routine: NodeId, old: &str, new: &str) -> NodeId {
    let mut kind = arena.kind(routine).clone();
    retitle(&mut kind, old, new);
    let parent = arena.parent(routine);
    let fresh = arena.alloc(kind);
    arena.set_parent(fresh, parent);
    arena.derive(fresh, routine);
    fresh
}

/// Give a routine a new name. A function without a `result` clause keeps
/// `old` as its result variable.
pub(super) fn retitle(kind: &mut NodeKind, old: &str, new: &str) {
    if let NodeKind::Routine {
        name, kind: rk, ..
    } = kind
    {
        *name = new.to_string();
        if let RoutineKind::Function { result, .. } = rk {
            // The body assigns to the old name
            if result.is_none() {
                *result = Some(old.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callgraph::UnitInfo;
    use crate::passes::testing;
    use crate::scheduler::DependencySummary;
    use crate::source::SourceUnit;
    use crate::types::SourceId;

    fn pass(routines: &[&str]) -> RenameRoutines {
        RenameRoutines::new(RenameRoutinesOptions {
            suffix: "_gpu".into(),
            routines: routines.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    /// subroutine caller; call leaf(x); y = twice(x); call other; end
    fn caller() -> (SourceUnit, NodeId) {
        let mut arena = Arena::new();
        let x = arena.alloc(NodeKind::var("x"));
        let call = arena.alloc(NodeKind::Call {
            name: "LEAF".into(),
            args: vec![x],
        });
        let y = arena.alloc(NodeKind::var("y"));
        let x2 = arena.alloc(NodeKind::var("x"));
        let fref = arena.alloc(NodeKind::Subscript {
            name: "twice".into(),
            indices: vec![x2],
        });
        let assign = arena.alloc(NodeKind::Assignment {
            target: y,
            value: fref,
            pointer: false,
        });
        let other = arena.alloc(NodeKind::Call {
            name: "other".into(),
            args: vec![],
        });
        let routine = arena.alloc(NodeKind::Routine {
            name: "caller".into(),
            kind: RoutineKind::Subroutine,
            prefixes: vec![],
            params: vec![],
            spec: vec![],
            body: vec![call, assign, other],
            routines: vec![],
        });
        let root = arena.alloc(NodeKind::File {
            items: vec![routine],
        });
        (
            SourceUnit::new(SourceId(0), "t.f90", "", "test", arena, root),
            routine,
        )
    }

    fn dep(name: &str, kind: UnitKind, summary: serde_json::Value) -> DependencySummary {
        DependencySummary {
            unit: testing::info(name, kind),
            summary,
        }
    }

    fn names(unit: &SourceUnit, root: NodeId) -> Vec<String> {
        unit.arena
            .descendants(root)
            .into_iter()
            .filter_map(|n| match unit.arena.kind(n) {
                NodeKind::Call { name, .. } | NodeKind::Subscript { name, .. } => Some(name.clone()),
                NodeKind::Routine { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn callers_follow_callee_summaries() {
        let (mut unit, routine) = caller();
        let info: UnitInfo = testing::info("caller", UnitKind::Subroutine);
        let deps = vec![
            dep("leaf", UnitKind::Subroutine, json!({"old": "leaf", "new": "leaf_gpu"})),
            dep("twice", UnitKind::Function, json!({"old": "twice", "new": "twice_gpu"})),
            dep("other", UnitKind::Subroutine, serde_json::Value::Null),
        ];
        let out = testing::run(&pass(&["leaf", "twice"]), &mut unit, &info, routine, deps).unwrap();
        let new = out.replacement.unwrap();
        assert_eq!(names(&unit, new), vec!["caller", "leaf_gpu", "twice_gpu", "other"]);
        assert_eq!(out.summary, None);
    }

    #[test]
    fn function_keeps_its_result_name() {
        let mut arena = Arena::new();
        let target = arena.alloc(NodeKind::var("twice"));
        let value = arena.alloc(NodeKind::int(2));
        let assign = arena.alloc(NodeKind::Assignment {
            target,
            value,
            pointer: false,
        });
        let routine = arena.alloc(NodeKind::Routine {
            name: "twice".into(),
            kind: RoutineKind::Function {
                result: None,
                return_type: None,
            },
            prefixes: vec![],
            params: vec!["x".into()],
            spec: vec![],
            body: vec![assign],
            routines: vec![],
        });
        let root = arena.alloc(NodeKind::File {
            items: vec![routine],
        });
        let mut unit = SourceUnit::new(SourceId(0), "t.f90", "", "test", arena, root);
        let info = testing::info("twice", UnitKind::Function);
        let out = testing::run(&pass(&[]), &mut unit, &info, routine, vec![]).unwrap();
        let NodeKind::Routine { name, kind, body, .. } = unit.arena.kind(out.replacement.unwrap()) else {
            panic!("not a routine");
        };
        assert_eq!(name, "twice_gpu");
        assert_eq!(
            kind,
            &RoutineKind::Function {
                result: Some("twice".into()),
                return_type: None
            }
        );
        assert_eq!(body, &vec![assign]);
        assert_eq!(out.summary, Some(json!({"old": "twice", "new": "twice_gpu"})));
    }

    #[test]
    fn already_renamed_routine_is_left_alone() {
        let mut arena = Arena::new();
        let routine = arena.alloc(NodeKind::Routine {
            name: "leaf_GPU".into(),
            kind: RoutineKind::Subroutine,
            prefixes: vec![],
            params: vec![],
            spec: vec![],
            body: vec![],
            routines: vec![],
        });
        let root = arena.alloc(NodeKind::File {
            items: vec![routine],
        });
        let mut unit = SourceUnit::new(SourceId(0), "t.f90", "", "test", arena, root);
        let info = testing::info("leaf_GPU", UnitKind::Subroutine);
        let out = testing::run(&pass(&["leaf"]), &mut unit, &info, routine, vec![]).unwrap();
        assert_eq!(out.replacement, None);
        assert_eq!(out.summary, Some(json!({"old": "leaf", "new": "leaf_gpu"})));
    }

    #[test]
    fn plan_swaps_selected_callees() {
        let leaf = testing::info("leaf", UnitKind::Subroutine);
        let done = testing::info("done_gpu", UnitKind::Subroutine);
        let module = testing::info("leaf", UnitKind::Module);
        let caller = testing::info("caller", UnitKind::Program);
        let cx = PlanContext {
            unit: &caller,
            callees: vec![&leaf, &done, &module],
            unresolved: vec!["external_leaf"],
        };
        let changes = pass(&[]).plan(&cx);
        assert_eq!(changes.added, vec!["leaf_gpu"]);
        assert_eq!(changes.removed, vec!["leaf"]);
    }

    #[test]
    fn suffix_must_be_a_name_fragment() {
        assert!(RenameRoutines::new(RenameRoutinesOptions {
            suffix: "-x".into(),
            routines: vec![],
        })
        .is_err());
    }
}
