//! Traversal framework over the IR.
//!
//! - [`Visitor`]: read-only hooks, one `visit_*`/`leave_*` pair per node type
//! - [`Walker`]: drives a visitor in pre-order or post-order, optionally
//!   restricted by a [`NodeFilter`]
//! - [`Transformer`]: copy-on-write rewriting through [`rewrite`]
//!
//! # Example
//!
//! ```
//! use refit_core::ir::{Arena, NodeId, NodeKind};
//! use refit_core::visit::{VisitResult, Visitor, Walker};
//!
//! struct CountCalls(usize);
//!
//! impl Visitor for CountCalls {
//!     fn visit_call(&mut self, _arena: &Arena, _id: NodeId) -> VisitResult {
//!         self.0 += 1;
//!         VisitResult::Continue
//!     }
//! }
//!
//! let mut arena = Arena::new();
//! let call = arena.alloc(NodeKind::Call { name: "foo".into(), args: vec![] });
//! let file = arena.alloc(NodeKind::File { items: vec![call] });
//! let mut counter = CountCalls(0);
//! Walker::pre_order().walk(&arena, file, &mut counter);
//! assert_eq!(counter.0, 1);
//! ```

mod helpers;
mod rewrite;

use crate::ir::{Arena, NodeId, NodeType};

pub use helpers::{find_nodes, FindNodes, ReplaceNodes};
pub use rewrite::{rewrite, rewrite_unit, RewriteOutcome, Transform, Transformer};

/// Result of visiting a node - controls traversal behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VisitResult {
    /// Continue traversal into children.
    #[default]
    Continue,
    /// Skip children, continue with siblings. `leave_*` is still called.
    ///
    /// Has no effect in post-order, where children come first.
    SkipChildren,
    /// Stop traversal entirely.
    Stop,
}

/// Order in which a [`Walker`] reports nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraversalOrder {
    /// Parents before children.
    #[default]
    PreOrder,
    /// Children before parents.
    PostOrder,
}

// ============================================================================
// Node Filter
// ============================================================================

/// Set of node types a traversal reports.
///
/// When no expression type is selected, expression subtrees are skipped
/// without being visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeFilter {
    mask: u32,
}

impl NodeFilter {
    pub fn all() -> Self {
        NodeFilter {
            mask: NodeType::ALL.iter().fold(0, |m, t| m | t.bit()),
        }
    }

    pub fn none() -> Self {
        NodeFilter { mask: 0 }
    }

    pub fn only(types: &[NodeType]) -> Self {
        NodeFilter {
            mask: types.iter().fold(0, |m, t| m | t.bit()),
        }
    }

    /// Every statement-level type (no expressions).
    pub fn statements() -> Self {
        NodeFilter {
            mask: NodeType::ALL
                .iter()
                .filter(|t| !t.is_expression())
                .fold(0, |m, t| m | t.bit()),
        }
    }

    pub fn with(mut self, ty: NodeType) -> Self {
        self.mask |= ty.bit();
        self
    }

    pub fn union(self, other: NodeFilter) -> Self {
        NodeFilter {
            mask: self.mask | other.mask,
        }
    }

    pub fn matches(&self, ty: NodeType) -> bool {
        self.mask & ty.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    /// Whether expression subtrees need to be entered at all.
    pub fn descends_expressions(&self) -> bool {
        NodeType::ALL
            .iter()
            .any(|t| t.is_expression() && self.matches(*t))
    }
}

impl Default for NodeFilter {
    fn default() -> Self {
        Self::all()
    }
}

// ============================================================================
// Visitor
// ============================================================================

/// Lists every node type with the suffix used in hook names.
macro_rules! for_each_node_type {
    ($mac:ident) => {
        $mac! {
            file: File,
            module: Module,
            routine: Routine,
            use_stmt: Use,
            implicit: Implicit,
            declaration: Declaration,
            include: Include,
            assignment: Assignment,
            loop_stmt: Loop,
            while_loop: WhileLoop,
            conditional: Conditional,
            call: Call,
            block: Block,
            jump: Jump,
            comment: Comment,
            pragma: Pragma,
            verbatim: Verbatim,
            literal: Literal,
            variable: Variable,
            subscript: Subscript,
            range: Range,
            keyword_arg: KeywordArg,
            binary: Binary,
            unary: Unary,
            paren: Paren,
        }
    };
}

/// Generates `visit_*`/`leave_*` pairs with default implementations.
macro_rules! visitor_methods {
    ($($base_name:ident : $node_type:ident),* $(,)?) => {
        paste::paste! {
            $(
                #[doc = concat!("Visit a `", stringify!($node_type), "` node.")]
                #[doc = ""]
                #[doc = "Return `VisitResult` to control traversal."]
                #[allow(unused_variables)]
                fn [<visit_ $base_name>](&mut self, arena: &Arena, id: NodeId) -> VisitResult {
                    VisitResult::Continue
                }

                #[doc = concat!("Leave a `", stringify!($node_type), "` node.")]
                #[allow(unused_variables)]
                fn [<leave_ $base_name>](&mut self, arena: &Arena, id: NodeId) {}
            )*
        }
    };
}

/// Generates the type-to-hook dispatch functions.
macro_rules! dispatch_functions {
    ($($base_name:ident : $node_type:ident),* $(,)?) => {
        paste::paste! {
            /// Call the `visit_*` hook matching the node's type.
            pub fn dispatch_visit<V: Visitor + ?Sized>(
                visitor: &mut V,
                arena: &Arena,
                id: NodeId,
            ) -> VisitResult {
                match arena.node_type(id) {
                    $(NodeType::$node_type => visitor.[<visit_ $base_name>](arena, id),)*
                }
            }

            /// Call the `leave_*` hook matching the node's type.
            pub fn dispatch_leave<V: Visitor + ?Sized>(visitor: &mut V, arena: &Arena, id: NodeId) {
                match arena.node_type(id) {
                    $(NodeType::$node_type => visitor.[<leave_ $base_name>](arena, id),)*
                }
            }
        }
    };
}

/// Read-only traversal hooks.
///
/// Override `enter`/`leave` to see every node, or the typed hooks to see one
/// kind of node.
pub trait Visitor {
    /// Called before children (pre-order) or after them (post-order).
    fn enter(&mut self, arena: &Arena, id: NodeId) -> VisitResult {
        dispatch_visit(self, arena, id)
    }

    /// Called after `enter` and the children.
    fn leave(&mut self, arena: &Arena, id: NodeId) {
        dispatch_leave(self, arena, id)
    }

    for_each_node_type!(visitor_methods);
}

for_each_node_type!(dispatch_functions);

// ============================================================================
// Walker
// ============================================================================

/// Drives a [`Visitor`] over a subtree.
#[derive(Debug, Clone, Copy, Default)]
pub struct Walker {
    order: TraversalOrder,
    filter: NodeFilter,
}

impl Walker {
    pub fn new(order: TraversalOrder, filter: NodeFilter) -> Self {
        Walker { order, filter }
    }

    pub fn pre_order() -> Self {
        Walker::new(TraversalOrder::PreOrder, NodeFilter::all())
    }

    pub fn post_order() -> Self {
        Walker::new(TraversalOrder::PostOrder, NodeFilter::all())
    }

    pub fn with_filter(mut self, filter: NodeFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn order(&self) -> TraversalOrder {
        self.order
    }

    /// Walk the subtree at `root`. Returns `Stop` if the visitor stopped.
    pub fn walk<V: Visitor + ?Sized>(&self, arena: &Arena, root: NodeId, visitor: &mut V) -> VisitResult {
        let descend_exprs = self.filter.descends_expressions();
        self.walk_node(arena, root, visitor, descend_exprs)
    }

    fn walk_node<V: Visitor + ?Sized>(
        &self,
        arena: &Arena,
        id: NodeId,
        visitor: &mut V,
        descend_exprs: bool,
    ) -> VisitResult {
        let ty = arena.node_type(id);
        if ty.is_expression() && !descend_exprs {
            return VisitResult::Continue;
        }
        let reported = self.filter.matches(ty);
        match self.order {
            TraversalOrder::PreOrder => {
                let mut result = VisitResult::Continue;
                if reported {
                    result = visitor.enter(arena, id);
                    if result == VisitResult::Stop {
                        return VisitResult::Stop;
                    }
                }
                if result != VisitResult::SkipChildren {
                    for child in arena.children(id) {
                        if self.walk_node(arena, child, visitor, descend_exprs) == VisitResult::Stop {
                            return VisitResult::Stop;
                        }
                    }
                }
                if reported {
                    visitor.leave(arena, id);
                }
            }
            TraversalOrder::PostOrder => {
                for child in arena.children(id) {
                    if self.walk_node(arena, child, visitor, descend_exprs) == VisitResult::Stop {
                        return VisitResult::Stop;
                    }
                }
                if reported {
                    if visitor.enter(arena, id) == VisitResult::Stop {
                        return VisitResult::Stop;
                    }
                    visitor.leave(arena, id);
                }
            }
        }
        VisitResult::Continue
    }
}
