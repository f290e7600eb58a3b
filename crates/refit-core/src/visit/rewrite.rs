//! Copy-on-write tree rewriting.
//!
//! [`rewrite`] walks a subtree in post-order and asks a [`Transformer`] what to
//! do with each matching node. Nodes whose children changed are rebuilt as
//! fresh arena entries without a span, so the regenerator synthesizes them;
//! untouched subtrees are shared with the original tree and keep their spans.

use crate::error::TransformError;
use crate::ir::{Arena, NodeId};

use super::NodeFilter;

/// What to put in place of a visited node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Transform {
    /// Leave the node where it is.
    #[default]
    Keep,
    /// Put another node in its place.
    Replace(NodeId),
    /// Splice a sequence of nodes in its place (statement lists only).
    Flatten(Vec<NodeId>),
    /// Drop the node (statement lists and optional slots only).
    Remove,
}

impl Transform {
    fn into_nodes(self, current: NodeId) -> Vec<NodeId> {
        match self {
            Transform::Keep => vec![current],
            Transform::Replace(node) => vec![node],
            Transform::Flatten(nodes) => nodes,
            Transform::Remove => Vec::new(),
        }
    }
}

/// Rewriting hooks.
pub trait Transformer {
    /// Node types passed to [`Transformer::transform`].
    fn filter(&self) -> NodeFilter {
        NodeFilter::all()
    }

    /// Decide the fate of `node`.
    ///
    /// `node` is the current version (already rebuilt if a descendant
    /// changed); `original` is the id before this rewrite started.
    fn transform(
        &mut self,
        arena: &mut Arena,
        node: NodeId,
        original: NodeId,
    ) -> Result<Transform, TransformError>;
}

/// Result of [`rewrite`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteOutcome {
    pub root: NodeId,
    pub changed: bool,
}

/// Rewrite the subtree at `root`.
///
/// Fails with [`TransformError::InvalidReplacement`] when a transform puts the
/// wrong number of nodes into a slot. On any error the original tree is left
/// intact, parent links included. On success, children shared with the new
/// tree point at their new parents; call [`Arena::relink`] on the original
/// root if the result is discarded.
pub fn rewrite<T: Transformer + ?Sized>(
    arena: &mut Arena,
    root: NodeId,
    transformer: &mut T,
) -> Result<RewriteOutcome, TransformError> {
    rewrite_from(arena, root, transformer, true)
}

/// Like [`rewrite`], but program units nested under `root` (contained
/// procedures, module procedures) are left alone. Each of them is a unit of
/// its own and gets rewritten separately.
pub fn rewrite_unit<T: Transformer + ?Sized>(
    arena: &mut Arena,
    root: NodeId,
    transformer: &mut T,
) -> Result<RewriteOutcome, TransformError> {
    rewrite_from(arena, root, transformer, false)
}

fn rewrite_from<T: Transformer + ?Sized>(
    arena: &mut Arena,
    root: NodeId,
    transformer: &mut T,
    nested_units: bool,
) -> Result<RewriteOutcome, TransformError> {
    let filter = transformer.filter();
    let mut walk = Walk {
        transformer,
        filter,
        descend_exprs: filter.descends_expressions(),
        nested_units,
        root,
    };
    let nodes = match walk.node(arena, root) {
        Ok(nodes) => nodes,
        Err(err) => {
            arena.relink(root);
            return Err(err);
        }
    };
    match nodes.as_slice() {
        [single] => {
            let parent = arena.parent(root);
            if *single != root {
                arena.set_parent(*single, parent);
            }
            Ok(RewriteOutcome {
                root: *single,
                changed: *single != root,
            })
        }
        _ => {
            arena.relink(root);
            Err(TransformError::InvalidReplacement {
                node: arena.node_type(root).to_string(),
                slot: "root".to_string(),
                count: nodes.len(),
            })
        }
    }
}

struct Walk<'t, T: ?Sized> {
    transformer: &'t mut T,
    filter: NodeFilter,
    descend_exprs: bool,
    nested_units: bool,
    root: NodeId,
}

impl<T: Transformer + ?Sized> Walk<'_, T> {
    fn node(&mut self, arena: &mut Arena, id: NodeId) -> Result<Vec<NodeId>, TransformError> {
        let ty = arena.node_type(id);
        if ty.is_expression() && !self.descend_exprs {
            return Ok(vec![id]);
        }
        if ty.is_program_unit() && !self.nested_units && id != self.root {
            return Ok(vec![id]);
        }

        let kind = arena.kind(id).clone();
        let mut changed = false;
        let new_kind = kind.try_map_children(|child, _slot| {
            let nodes = self.node(arena, child)?;
            if nodes.as_slice() != [child] {
                changed = true;
            }
            Ok(nodes)
        })?;

        let current = if changed {
            let data = arena.node(id);
            let head = if new_kind.header_children() == kind.header_children() {
                data.head
            } else {
                None
            };
            let tail = data.tail;
            let parent = data.parent;
            let fresh = arena.alloc_container(new_kind, None, head, tail);
            arena.set_parent(fresh, parent);
            arena.derive(fresh, id);
            fresh
        } else {
            id
        };

        if !self.filter.matches(ty) {
            return Ok(vec![current]);
        }
        let decision = self.transformer.transform(arena, current, id)?;
        if let Transform::Replace(new) = &decision {
            arena.derive(*new, id);
        }
        Ok(decision.into_nodes(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{NodeKind, NodeType, RoutineKind};
    use crate::types::Span;

    /// subroutine s; x = 1; call foo; call bar; end
    fn sample() -> (Arena, NodeId, [NodeId; 3]) {
        let mut arena = Arena::new();
        let x = arena.alloc(NodeKind::var("x"));
        let one = arena.alloc(NodeKind::int(1));
        let assign = arena.alloc_spanned(
            NodeKind::Assignment {
                target: x,
                value: one,
                pointer: false,
            },
            Some(Span::new(15, 22)),
        );
        let foo = arena.alloc_spanned(
            NodeKind::Call {
                name: "foo".into(),
                args: vec![],
            },
            Some(Span::new(23, 33)),
        );
        let bar = arena.alloc_spanned(
            NodeKind::Call {
                name: "bar".into(),
                args: vec![],
            },
            Some(Span::new(34, 44)),
        );
        let routine = arena.alloc_container(
            NodeKind::Routine {
                name: "s".into(),
                kind: RoutineKind::Subroutine,
                prefixes: vec![],
                params: vec![],
                spec: vec![],
                body: vec![assign, foo, bar],
                routines: vec![],
            },
            Some(Span::new(0, 60)),
            Some(Span::new(0, 14)),
            Some(Span::new(45, 60)),
        );
        (arena, routine, [assign, foo, bar])
    }

    struct DropCall(&'static str);

    impl Transformer for DropCall {
        fn filter(&self) -> NodeFilter {
            NodeFilter::only(&[NodeType::Call])
        }

        fn transform(
            &mut self,
            arena: &mut Arena,
            node: NodeId,
            _original: NodeId,
        ) -> Result<Transform, TransformError> {
            match arena.kind(node) {
                NodeKind::Call { name, .. } if name == self.0 => Ok(Transform::Remove),
                _ => Ok(Transform::Keep),
            }
        }
    }

    fn body(arena: &Arena, routine: NodeId) -> Vec<NodeId> {
        match arena.kind(routine) {
            NodeKind::Routine { body, .. } => body.clone(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn remove_rebuilds_parent_only() {
        let (mut arena, routine, [assign, foo, bar]) = sample();
        let outcome = rewrite(&mut arena, routine, &mut DropCall("foo")).unwrap();
        assert!(outcome.changed);
        assert_ne!(outcome.root, routine);
        assert_eq!(body(&arena, outcome.root), vec![assign, bar]);
        // Rebuilt node is synthesized but keeps its opening and closing lines.
        assert_eq!(arena.span(outcome.root), None);
        assert_eq!(arena.head(outcome.root), Some(Span::new(0, 14)));
        assert_eq!(arena.tail(outcome.root), Some(Span::new(45, 60)));
        assert_eq!(arena.origin(outcome.root), Some(routine));
        // Shared children keep their spans and follow the new parent.
        assert_eq!(arena.span(bar), Some(Span::new(34, 44)));
        assert_eq!(arena.parent(bar), Some(outcome.root));
        // The original tree is unchanged.
        assert_eq!(body(&arena, routine), vec![assign, foo, bar]);
    }

    #[test]
    fn no_match_is_unchanged() {
        let (mut arena, routine, _) = sample();
        let before = arena.len();
        let outcome = rewrite(&mut arena, routine, &mut DropCall("baz")).unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.root, routine);
        assert_eq!(arena.len(), before);
    }

    #[test]
    fn rewrite_is_idempotent() {
        let (mut arena, routine, _) = sample();
        let first = rewrite(&mut arena, routine, &mut DropCall("foo")).unwrap();
        let second = rewrite(&mut arena, first.root, &mut DropCall("foo")).unwrap();
        assert!(!second.changed);
        assert_eq!(second.root, first.root);
    }

    #[test]
    fn replacements_remember_the_statement_they_stand_for() {
        struct Retarget;
        impl Transformer for Retarget {
            fn filter(&self) -> NodeFilter {
                NodeFilter::only(&[NodeType::Call])
            }
            fn transform(
                &mut self,
                arena: &mut Arena,
                node: NodeId,
                _original: NodeId,
            ) -> Result<Transform, TransformError> {
                if !matches!(arena.kind(node), NodeKind::Call { name, .. } if name == "foo") {
                    return Ok(Transform::Keep);
                }
                Ok(Transform::Replace(arena.alloc(NodeKind::Call {
                    name: "baz".into(),
                    args: vec![],
                })))
            }
        }
        let (mut arena, routine, [assign, foo, bar]) = sample();
        let outcome = rewrite(&mut arena, routine, &mut Retarget).unwrap();
        let new_body = body(&arena, outcome.root);
        assert_eq!(new_body[0], assign);
        assert_eq!(arena.origin(new_body[1]), Some(foo));
        assert_eq!(arena.source_of(new_body[1]), Some(foo));
        assert_eq!(arena.source_of(bar), Some(bar));
        assert_eq!(arena.origin(bar), None);

        // A second rewrite keeps pointing at the source statement.
        let again = rewrite(&mut arena, outcome.root, &mut DropCall("bar")).unwrap();
        assert_eq!(arena.origin(again.root), Some(routine));
        assert_eq!(arena.origin(body(&arena, again.root)[1]), Some(foo));
    }

    #[test]
    fn flatten_into_single_slot_fails() {
        struct Duplicate;
        impl Transformer for Duplicate {
            fn filter(&self) -> NodeFilter {
                NodeFilter::only(&[NodeType::Literal])
            }
            fn transform(
                &mut self,
                _arena: &mut Arena,
                node: NodeId,
                _original: NodeId,
            ) -> Result<Transform, TransformError> {
                Ok(Transform::Flatten(vec![node, node]))
            }
        }
        let (mut arena, routine, _) = sample();
        let err = rewrite(&mut arena, routine, &mut Duplicate).unwrap_err();
        assert!(matches!(
            err,
            TransformError::InvalidReplacement { count: 2, .. }
        ));
    }

    #[test]
    fn failed_rewrite_keeps_parent_links() {
        // Drops `foo`, which rebuilds the routine, then refuses the routine.
        struct DropThenRefuse;
        impl Transformer for DropThenRefuse {
            fn filter(&self) -> NodeFilter {
                NodeFilter::only(&[NodeType::Call, NodeType::Routine])
            }
            fn transform(
                &mut self,
                arena: &mut Arena,
                node: NodeId,
                _original: NodeId,
            ) -> Result<Transform, TransformError> {
                match arena.kind(node) {
                    NodeKind::Call { name, .. } if name == "foo" => Ok(Transform::Remove),
                    NodeKind::Routine { .. } => Err(TransformError::pass_failed("t", "s", "refused")),
                    _ => Ok(Transform::Keep),
                }
            }
        }
        let (mut arena, routine, [assign, foo, bar]) = sample();
        let before = arena.len();
        assert!(rewrite(&mut arena, routine, &mut DropThenRefuse).is_err());
        // A rebuilt routine was allocated and then thrown away.
        assert!(arena.len() > before);
        for child in [assign, foo, bar] {
            assert_eq!(arena.parent(child), Some(routine));
        }
        assert_eq!(arena.previous_sibling(bar), Some(foo));
        let value = arena.children(assign)[1];
        assert_eq!(arena.parent(value), Some(assign));
    }

    #[test]
    fn unit_rewrite_skips_contained_procedures() {
        let (mut arena, inner, _) = sample();
        let call = arena.alloc(NodeKind::Call {
            name: "foo".into(),
            args: vec![],
        });
        let outer = arena.alloc(NodeKind::Routine {
            name: "outer".into(),
            kind: RoutineKind::Subroutine,
            prefixes: vec![],
            params: vec![],
            spec: vec![],
            body: vec![call],
            routines: vec![inner],
        });
        let outcome = rewrite_unit(&mut arena, outer, &mut DropCall("foo")).unwrap();
        let NodeKind::Routine { body, routines, .. } = arena.kind(outcome.root) else {
            panic!("not a routine");
        };
        assert!(body.is_empty());
        assert_eq!(routines, &vec![inner]);
    }

    #[test]
    fn removing_root_fails() {
        struct DropAll;
        impl Transformer for DropAll {
            fn transform(
                &mut self,
                _arena: &mut Arena,
                _node: NodeId,
                _original: NodeId,
            ) -> Result<Transform, TransformError> {
                Ok(Transform::Remove)
            }
        }
        let (mut arena, routine, _) = sample();
        assert!(rewrite(&mut arena, routine, &mut DropAll).is_err());
    }
}
