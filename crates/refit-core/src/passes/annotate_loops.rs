//! Directive insertion in front of loops.

use serde::{Deserialize, Serialize};

use crate::error::TransformError;
use crate::ir::{Arena, NodeId, NodeKind, NodeType};
use crate::scheduler::{Pass, PassContext, PassOutput};
use crate::text::split_directive;
use crate::visit::{NodeFilter, Transform, Transformer};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnnotateLoopsOptions {
    /// Full directive line, e.g. `!$acc loop vector`.
    pub directive: String,
    /// Only annotate loops over this variable.
    pub variable: Option<String>,
}

/// Inserts a directive before every counted `do` loop, unless the loop is
/// already preceded by the same directive.
#[derive(Debug, Clone)]
pub struct AnnotateLoops {
    options: AnnotateLoopsOptions,
    keyword: String,
    content: String,
}

impl AnnotateLoops {
    pub fn new(options: AnnotateLoopsOptions) -> Result<Self, TransformError> {
        let (keyword, content) = split_directive(&options.directive)
            .filter(|(keyword, _)| !keyword.is_empty())
            .ok_or_else(|| TransformError::InvalidOptions {
                pass: "annotate-loops".to_string(),
                message: format!("`{}` is not a directive of the form `!$<sentinel> ...`", options.directive),
            })?;
        Ok(AnnotateLoops {
            options,
            keyword,
            content,
        })
    }

    fn is_same_directive(&self, kind: &NodeKind) -> bool {
        match kind {
            NodeKind::Pragma { keyword, content } => {
                keyword.eq_ignore_ascii_case(&self.keyword) && normalized(content) == normalized(&self.content)
            }
            _ => false,
        }
    }
}

fn normalized(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

struct LoopAnnotator<'p> {
    pass: &'p AnnotateLoops,
    inserted: usize,
}

impl Transformer for LoopAnnotator<'_> {
    fn filter(&self) -> NodeFilter {
        NodeFilter::only(&[NodeType::Loop])
    }

    fn transform(
        &mut self,
        arena: &mut Arena,
        node: NodeId,
        original: NodeId,
    ) -> Result<Transform, TransformError> {
        let NodeKind::Loop { variable, .. } = arena.kind(node) else {
            return Ok(Transform::Keep);
        };
        if let Some(wanted) = &self.pass.options.variable {
            if !variable.eq_ignore_ascii_case(wanted) {
                return Ok(Transform::Keep);
            }
        }
        if let Some(previous) = arena.previous_sibling(original) {
            if self.pass.is_same_directive(arena.kind(previous)) {
                return Ok(Transform::Keep);
            }
        }
        let pragma = arena.alloc(NodeKind::Pragma {
            keyword: self.pass.keyword.clone(),
            content: self.pass.content.clone(),
        });
        self.inserted += 1;
        Ok(Transform::Flatten(vec![pragma, node]))
    }
}

impl Pass for AnnotateLoops {
    fn name(&self) -> &str {
        "annotate-loops"
    }

    fn options_key(&self) -> String {
        serde_json::to_string(&self.options).unwrap_or_default()
    }

    fn run(&self, cx: &mut PassContext<'_>) -> Result<PassOutput, TransformError> {
        let mut annotator = LoopAnnotator {
            pass: self,
            inserted: 0,
        };
        let replacement = cx.rewrite(&mut annotator)?;
        tracing::debug!(
            unit = %cx.unit.qualified_name(),
            inserted = annotator.inserted,
            "annotated loops"
        );
        Ok(PassOutput::replaced(replacement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callgraph::UnitKind;
    use crate::ir::RoutineKind;
    use crate::passes::testing;
    use crate::source::SourceUnit;
    use crate::types::SourceId;

    fn counted_loop(arena: &mut Arena, var: &str, body: Vec<NodeId>) -> NodeId {
        let start = arena.alloc(NodeKind::int(1));
        let end = arena.alloc(NodeKind::var("n"));
        arena.alloc(NodeKind::Loop {
            variable: var.into(),
            start,
            end,
            step: None,
            body,
        })
    }

    fn unit() -> (SourceUnit, NodeId) {
        let mut arena = Arena::new();
        let inner = counted_loop(&mut arena, "i", vec![]);
        let outer = counted_loop(&mut arena, "j", vec![inner]);
        let routine = arena.alloc(NodeKind::Routine {
            name: "s".into(),
            kind: RoutineKind::Subroutine,
            prefixes: vec![],
            params: vec![],
            spec: vec![],
            body: vec![outer],
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

    fn pass(variable: Option<&str>) -> AnnotateLoops {
        AnnotateLoops::new(AnnotateLoopsOptions {
            directive: "!$acc loop vector".into(),
            variable: variable.map(String::from),
        })
        .unwrap()
    }

    fn pragma_count(unit: &SourceUnit, root: NodeId) -> usize {
        unit.arena
            .descendants(root)
            .into_iter()
            .filter(|&n| unit.arena.node_type(n) == NodeType::Pragma)
            .count()
    }

    #[test]
    fn annotates_only_the_requested_variable() {
        let (mut unit, routine) = unit();
        let info = testing::info("s", UnitKind::Subroutine);
        let out = testing::run(&pass(Some("I")), &mut unit, &info, routine, vec![]).unwrap();
        let new = out.replacement.unwrap();
        assert_eq!(pragma_count(&unit, new), 1);
        let NodeKind::Routine { body, .. } = unit.arena.kind(new) else {
            panic!("not a routine");
        };
        let NodeKind::Loop { body: inner, .. } = unit.arena.kind(body[0]) else {
            panic!("not a loop");
        };
        assert_eq!(
            unit.arena.kind(inner[0]),
            &NodeKind::Pragma {
                keyword: "acc".into(),
                content: "loop vector".into()
            }
        );
    }

    #[test]
    fn existing_directive_is_not_duplicated() {
        let (mut unit, routine) = unit();
        let info = testing::info("s", UnitKind::Subroutine);
        let first = testing::run(&pass(None), &mut unit, &info, routine, vec![]).unwrap();
        let annotated = first.replacement.unwrap();
        assert_eq!(pragma_count(&unit, annotated), 2);
        let second = testing::run(&pass(None), &mut unit, &info, annotated, vec![]).unwrap();
        assert_eq!(second.replacement, None);
    }

    #[test]
    fn rejects_plain_comments() {
        let err = AnnotateLoops::new(AnnotateLoopsOptions {
            directive: "! not a directive".into(),
            variable: None,
        })
        .unwrap_err();
        assert!(matches!(err, TransformError::InvalidOptions { .. }));
    }
}
