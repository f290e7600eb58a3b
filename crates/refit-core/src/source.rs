//! Source units: one parsed file with its IR and scopes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::hash::ContentHash;
use crate::ir::{Arena, ItemPath, NodeId, NodeKind, NodeType};
use crate::symbols::ScopeTable;
use crate::text::byte_offset_to_position;
use crate::types::{SourceId, Span};

/// A source unit shared between worker threads.
pub type SharedUnit = Arc<Mutex<SourceUnit>>;

/// One parsed file: raw text, IR arena, current root and scope table.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    pub id: SourceId,
    pub path: PathBuf,
    /// Text the IR spans refer to.
    pub text: String,
    /// Name of the frontend backend that produced the IR.
    pub frontend: String,
    /// Whether comment lines are represented as IR nodes. When they are
    /// not, the regenerator keeps comment-only gaps between untouched
    /// statements verbatim.
    pub comments_in_ir: bool,
    pub arena: Arena,
    /// Current root; replaced whenever a rewrite commits.
    pub root: NodeId,
    pub scopes: ScopeTable,
}

impl SourceUnit {
    pub fn new(
        id: SourceId,
        path: impl Into<PathBuf>,
        text: impl Into<String>,
        frontend: impl Into<String>,
        arena: Arena,
        root: NodeId,
    ) -> Self {
        SourceUnit {
            id,
            path: path.into(),
            text: text.into(),
            frontend: frontend.into(),
            comments_in_ir: true,
            arena,
            root,
            scopes: ScopeTable::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Display name used in diagnostics and errors.
    pub fn file_name(&self) -> String {
        self.path.display().to_string()
    }

    pub fn into_shared(self) -> SharedUnit {
        Arc::new(Mutex::new(self))
    }

    /// Hash of the original text.
    pub fn text_hash(&self) -> ContentHash {
        ContentHash::compute(self.text.as_bytes())
    }

    /// 1-indexed line of a byte offset in the original text.
    pub fn line_of(&self, offset: usize) -> u32 {
        byte_offset_to_position(&self.text, offset).0
    }

    /// 1-indexed line of a node, when it or an ancestor has a span.
    pub fn node_line(&self, id: NodeId) -> Option<u32> {
        self.arena.location_span(id).map(|s| self.line_of(s.start))
    }

    /// Original text of a span.
    pub fn slice(&self, span: Span) -> &str {
        self.text.get(span.start..span.end).unwrap_or("")
    }

    /// All program units of the current tree with their item paths, in
    /// pre-order (a module before its routines).
    pub fn program_units(&self) -> Vec<(ItemPath, NodeId)> {
        let mut out = Vec::new();
        let mut stack: Vec<(ItemPath, NodeId)> = self
            .arena
            .kind(self.root)
            .unit_children()
            .iter()
            .enumerate()
            .map(|(i, &id)| (ItemPath(vec![i]), id))
            .rev()
            .collect();
        while let Some((path, id)) = stack.pop() {
            if !self.arena.node_type(id).is_program_unit() {
                continue;
            }
            let nested: Vec<(ItemPath, NodeId)> = self
                .arena
                .kind(id)
                .unit_children()
                .iter()
                .enumerate()
                .map(|(i, &child)| (path.child(i), child))
                .collect();
            out.push((path, id));
            stack.extend(nested.into_iter().rev());
        }
        out
    }

    /// Find a program unit by (case-insensitive) name.
    pub fn find_unit(&self, name: &str) -> Option<NodeId> {
        self.program_units()
            .into_iter()
            .map(|(_, id)| id)
            .find(|&id| {
                self.arena
                    .kind(id)
                    .unit_name()
                    .is_some_and(|n| n.eq_ignore_ascii_case(name))
            })
    }

    /// Every node of the current tree with the given type, in pre-order.
    pub fn find_all(&self, ty: NodeType) -> Vec<NodeId> {
        self.arena
            .descendants(self.root)
            .into_iter()
            .filter(|&id| self.arena.node_type(id) == ty)
            .collect()
    }

    /// Module a program unit is nested in, if any.
    pub fn enclosing_module(&self, id: NodeId) -> Option<NodeId> {
        self.arena
            .ancestors(id)
            .find(|&a| matches!(self.arena.kind(a), NodeKind::Module { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::RoutineKind;

    fn routine(arena: &mut Arena, name: &str, nested: Vec<NodeId>) -> NodeId {
        arena.alloc(NodeKind::Routine {
            name: name.into(),
            kind: RoutineKind::Subroutine,
            prefixes: vec![],
            params: vec![],
            spec: vec![],
            body: vec![],
            routines: nested,
        })
    }

    #[test]
    fn program_units_in_pre_order_with_paths() {
        let mut arena = Arena::new();
        let inner = routine(&mut arena, "inner", vec![]);
        let a = routine(&mut arena, "a", vec![inner]);
        let b = routine(&mut arena, "b", vec![]);
        let module = arena.alloc(NodeKind::Module {
            name: "m".into(),
            spec: vec![],
            routines: vec![a, b],
        });
        let comment = arena.alloc(NodeKind::Comment { text: "! c".into() });
        let top = routine(&mut arena, "top", vec![]);
        let file = arena.alloc(NodeKind::File {
            items: vec![comment, module, top],
        });
        let unit = SourceUnit::new(SourceId(0), "x.f90", "", "lines", arena, file);
        let units = unit.program_units();
        let names: Vec<(String, &str)> = units
            .iter()
            .map(|(p, id)| (p.to_string(), unit.arena.kind(*id).unit_name().unwrap()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("/1".to_string(), "m"),
                ("/1/0".to_string(), "a"),
                ("/1/0/0".to_string(), "inner"),
                ("/1/1".to_string(), "b"),
                ("/2".to_string(), "top"),
            ]
        );
        assert_eq!(unit.find_unit("INNER"), Some(inner));
        assert_eq!(unit.enclosing_module(inner), Some(module));
        assert_eq!(unit.enclosing_module(top), None);
    }
}
