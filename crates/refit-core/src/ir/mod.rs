//! Unified intermediate representation.
//!
//! A source unit owns one [`Arena`]. Nodes are append-only: rewriting
//! allocates new nodes and re-parents the reused children, so older node ids
//! stay valid (cache entries may refer to them) while only the nodes reachable
//! from the current root form the live tree.
//!
//! ## Spans
//!
//! Statement nodes produced by a frontend carry the byte span of their source
//! text (from the start of the first physical line, indentation included, to
//! the end of the last physical line, newline excluded). Containers also record
//! `head` and `tail` spans for their opening and closing lines. A node that is
//! rebuilt or newly created has no `span`, which tells the regenerator to
//! synthesize it.

mod canonical;
mod children;
mod node;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TransformError;
use crate::types::Span;

pub use canonical::{canonical_form, equivalent, first_difference, fingerprint, EquivalenceOptions};
pub use children::SlotKind;
pub use node::{
    Attr, BinaryOp, Branch, DeclEntity, Intent, JumpKind, LiteralKind, NodeKind, NodeType,
    RoutineKind, TypeSpec, UnaryOp, UseItem, ATOM_PRECEDENCE,
};

// ============================================================================
// Node Identity
// ============================================================================

/// Index of a node inside its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Arena slot: the node's content plus source bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeData {
    pub kind: NodeKind,
    /// Full source span; `None` once the node is rebuilt or synthesized.
    pub span: Option<Span>,
    /// Opening line of a container (`do i = 1, n`, `subroutine foo(a)`).
    pub head: Option<Span>,
    /// Closing line of a container (`end do`).
    pub tail: Option<Span>,
    /// Back-reference to the enclosing node; not an ownership edge.
    pub parent: Option<NodeId>,
    /// Spanned node a rebuilt or replacing node stands in for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<NodeId>,
}

// ============================================================================
// Arena
// ============================================================================

/// Append-only node storage for one source unit.
#[derive(Debug, Clone, Default)]
pub struct Arena {
    nodes: Vec<NodeData>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a synthesized node (no source spans).
    pub fn alloc(&mut self, kind: NodeKind) -> NodeId {
        self.push(NodeData {
            kind,
            span: None,
            head: None,
            tail: None,
            parent: None,
            origin: None,
        })
    }

    /// Allocate a node carrying its source span.
    pub fn alloc_spanned(&mut self, kind: NodeKind, span: Option<Span>) -> NodeId {
        self.push(NodeData {
            kind,
            span,
            head: None,
            tail: None,
            parent: None,
            origin: None,
        })
    }

    /// Allocate a container with its full, opening and closing spans.
    pub fn alloc_container(
        &mut self,
        kind: NodeKind,
        span: Option<Span>,
        head: Option<Span>,
        tail: Option<Span>,
    ) -> NodeId {
        self.push(NodeData {
            kind,
            span,
            head,
            tail,
            parent: None,
            origin: None,
        })
    }

    fn push(&mut self, data: NodeData) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        for child in data.kind.children() {
            self.nodes[child.index()].parent = Some(id);
        }
        self.nodes.push(data);
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.index() < self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.index()].kind
    }

    pub fn node_type(&self, id: NodeId) -> NodeType {
        self.kind(id).node_type()
    }

    pub fn span(&self, id: NodeId) -> Option<Span> {
        self.nodes[id.index()].span
    }

    pub fn head(&self, id: NodeId) -> Option<Span> {
        self.nodes[id.index()].head
    }

    pub fn tail(&self, id: NodeId) -> Option<Span> {
        self.nodes[id.index()].tail
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].parent
    }

    pub fn set_span(&mut self, id: NodeId, span: Option<Span>) {
        self.nodes[id.index()].span = span;
    }

    pub fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) {
        self.nodes[id.index()].parent = parent;
    }

    pub fn origin(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].origin
    }

    /// Source node `id` was derived from: itself while it has a span.
    pub fn source_of(&self, id: NodeId) -> Option<NodeId> {
        let data = &self.nodes[id.index()];
        if data.span.is_some() {
            Some(id)
        } else {
            data.origin
        }
    }

    /// Record that `id` stands in for `source`. A node that keeps its own
    /// span or already has an origin is left alone.
    pub fn derive(&mut self, id: NodeId, source: NodeId) {
        let Some(origin) = self.source_of(source) else {
            return;
        };
        let data = &mut self.nodes[id.index()];
        if data.span.is_none() && data.origin.is_none() {
            data.origin = Some(origin);
        }
    }

    /// Point the parent link of every node under `root` back at the node it
    /// is reached through. Rewrites re-parent shared children as they build
    /// new containers; this undoes that for a tree that stays live.
    pub fn relink(&mut self, root: NodeId) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            for child in self.children(id) {
                self.nodes[child.index()].parent = Some(id);
                stack.push(child);
            }
        }
    }

    /// Copy the subtree at `root` into fresh nodes. Copies keep the spans of
    /// their originals, so their source text can be reused elsewhere.
    pub fn deep_copy(&mut self, root: NodeId) -> Result<NodeId, TransformError> {
        let data = self.node(root).clone();
        let kind = data
            .kind
            .try_map_children(|child, _| Ok(vec![self.deep_copy(child)?]))?;
        Ok(self.push(NodeData {
            kind,
            parent: None,
            ..data
        }))
    }

    /// Direct children in source order.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.kind(id).children()
    }

    /// Enclosing nodes, nearest first.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.parent(id), move |&p| self.parent(p))
    }

    /// All nodes of the subtree rooted at `root`, in pre-order.
    pub fn descendants(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            let children = self.children(id);
            stack.extend(children.into_iter().rev());
        }
        out
    }

    /// Best source location for a node: its span, its head, or the nearest
    /// ancestor that still has a span.
    pub fn location_span(&self, id: NodeId) -> Option<Span> {
        let data = self.node(id);
        data.span
            .or(data.head)
            .or_else(|| self.ancestors(id).find_map(|a| self.span(a).or(self.head(a))))
    }

    /// The statement list that contains `id`, taken from its parent.
    pub fn siblings(&self, id: NodeId) -> Option<Vec<NodeId>> {
        let parent = self.parent(id)?;
        self.kind(parent)
            .statement_lists()
            .into_iter()
            .find(|list| list.contains(&id))
            .map(|list| list.to_vec())
    }

    /// The sibling right before `id` in its statement list.
    pub fn previous_sibling(&self, id: NodeId) -> Option<NodeId> {
        let siblings = self.siblings(id)?;
        let pos = siblings.iter().position(|&s| s == id)?;
        pos.checked_sub(1).map(|p| siblings[p])
    }

    /// Nearest enclosing module or routine (including `id` itself).
    pub fn enclosing_unit(&self, id: NodeId) -> Option<NodeId> {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .find(|&n| self.node_type(n).is_program_unit())
    }
}

// ============================================================================
// Item Paths
// ============================================================================

/// Position of a program unit inside its file, as indices into the program
/// unit lists from the root down (`File.items`, then `Module.routines` or
/// `Routine.routines`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemPath(pub Vec<usize>);

impl ItemPath {
    /// Follow the path from `root`.
    pub fn resolve(&self, arena: &Arena, root: NodeId) -> Option<NodeId> {
        let mut current = root;
        for &idx in &self.0 {
            current = *arena.kind(current).unit_children().get(idx)?;
        }
        Some(current)
    }

    pub fn child(&self, idx: usize) -> ItemPath {
        let mut path = self.0.clone();
        path.push(idx);
        ItemPath(path)
    }
}

impl fmt::Display for ItemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|i| i.to_string()).collect();
        write!(f, "/{}", parts.join("/"))
    }
}

/// Result of [`replace_at_path`]: the new root and the rebuilt ancestors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathReplacement {
    pub root: NodeId,
    /// `(old, new)` pairs for every ancestor rebuilt on the way up, root last.
    pub rebuilt: Vec<(NodeId, NodeId)>,
}

/// Replace the program unit at `path` with `new`, rebuilding its ancestors
/// copy-on-write. Ancestors keep their head and tail spans.
pub fn replace_at_path(
    arena: &mut Arena,
    root: NodeId,
    path: &ItemPath,
    new: NodeId,
) -> Option<PathReplacement> {
    let mut chain = vec![root];
    let mut current = root;
    for &idx in &path.0 {
        current = *arena.kind(current).unit_children().get(idx)?;
        chain.push(current);
    }
    let mut replacement = new;
    let mut rebuilt = Vec::new();
    for (depth, &idx) in path.0.iter().enumerate().rev() {
        let ancestor = chain[depth];
        let old_child = chain[depth + 1];
        if old_child == replacement {
            return Some(PathReplacement { root, rebuilt });
        }
        let mut kind = arena.kind(ancestor).clone();
        match &mut kind {
            NodeKind::File { items: list }
            | NodeKind::Module { routines: list, .. }
            | NodeKind::Routine { routines: list, .. } => list[idx] = replacement,
            _ => return None,
        }
        let data = arena.node(ancestor);
        let (head, tail) = (data.head, data.tail);
        let fresh = arena.alloc_container(kind, None, head, tail);
        arena.set_parent(fresh, arena.parent(ancestor));
        rebuilt.push((ancestor, fresh));
        replacement = fresh;
    }
    Some(PathReplacement {
        root: replacement,
        rebuilt,
    })
}
