//! Ready-made visitors and transformers.

use std::collections::HashMap;

use crate::error::TransformError;
use crate::ir::{Arena, NodeId, NodeType};

use super::{NodeFilter, Transform, Transformer, VisitResult, Visitor, Walker};

/// Collects nodes of the requested types in pre-order.
#[derive(Debug, Default)]
pub struct FindNodes {
    pub found: Vec<NodeId>,
}

impl Visitor for FindNodes {
    fn enter(&mut self, _arena: &Arena, id: NodeId) -> VisitResult {
        self.found.push(id);
        VisitResult::Continue
    }

    fn leave(&mut self, _arena: &Arena, _id: NodeId) {}
}

/// All nodes of the given types under `root`, in pre-order.
pub fn find_nodes(arena: &Arena, root: NodeId, types: &[NodeType]) -> Vec<NodeId> {
    let mut finder = FindNodes::default();
    Walker::pre_order()
        .with_filter(NodeFilter::only(types))
        .walk(arena, root, &mut finder);
    finder.found
}

/// Replaces nodes by original id.
///
/// An empty replacement removes the node, one node replaces it, several are
/// spliced in.
#[derive(Debug, Clone)]
pub struct ReplaceNodes {
    map: HashMap<NodeId, Vec<NodeId>>,
    filter: NodeFilter,
}

impl ReplaceNodes {
    pub fn new(arena: &Arena, map: HashMap<NodeId, Vec<NodeId>>) -> Self {
        let filter = map
            .keys()
            .fold(NodeFilter::none(), |f, &id| f.with(arena.node_type(id)));
        ReplaceNodes { map, filter }
    }

    /// Remove every node in `ids`.
    pub fn remove(arena: &Arena, ids: impl IntoIterator<Item = NodeId>) -> Self {
        let map = ids.into_iter().map(|id| (id, Vec::new())).collect();
        Self::new(arena, map)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Transformer for ReplaceNodes {
    fn filter(&self) -> NodeFilter {
        self.filter
    }

    fn transform(
        &mut self,
        _arena: &mut Arena,
        _node: NodeId,
        original: NodeId,
    ) -> Result<Transform, TransformError> {
        Ok(match self.map.get(&original).map(Vec::as_slice) {
            None => Transform::Keep,
            Some([]) => Transform::Remove,
            Some([single]) => Transform::Replace(*single),
            Some(many) => Transform::Flatten(many.to_vec()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::NodeKind;
    use crate::visit::rewrite;

    fn sample() -> (Arena, NodeId, NodeId, NodeId) {
        let mut arena = Arena::new();
        let n = arena.alloc(NodeKind::var("n"));
        let call = arena.alloc(NodeKind::Call {
            name: "foo".into(),
            args: vec![n],
        });
        let stop = arena.alloc(NodeKind::Verbatim { text: "stop".into() });
        let file = arena.alloc(NodeKind::File {
            items: vec![call, stop],
        });
        (arena, file, call, stop)
    }

    #[test]
    fn find_nodes_by_type() {
        let (arena, file, call, _) = sample();
        assert_eq!(find_nodes(&arena, file, &[NodeType::Call]), vec![call]);
        assert_eq!(find_nodes(&arena, file, &[NodeType::Variable]).len(), 1);
        assert!(find_nodes(&arena, file, &[NodeType::Loop]).is_empty());
    }

    #[test]
    fn replace_nodes_splices() {
        let (mut arena, file, call, stop) = sample();
        let pragma = arena.alloc(NodeKind::Pragma {
            keyword: "acc".into(),
            content: "routine seq".into(),
        });
        let mut map = HashMap::new();
        map.insert(call, vec![pragma, call]);
        map.insert(stop, vec![]);
        let mut replace = ReplaceNodes::new(&arena, map);
        let outcome = rewrite(&mut arena, file, &mut replace).unwrap();
        assert_eq!(
            arena.kind(outcome.root),
            &NodeKind::File {
                items: vec![pragma, call]
            }
        );
    }
}
