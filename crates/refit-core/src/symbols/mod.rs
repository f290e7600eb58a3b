//! Symbols, lexical scopes and name bindings.
//!
//! Scopes nest as file ⊃ module ⊃ routine ⊃ block and mirror the IR. A lookup
//! walks outward from the innermost scope, so an inner declaration shadows an
//! outer one of the same name within its own extent only. Names are compared
//! case-insensitively; scope maps are keyed by the lowercase name.
//!
//! Symbols are immutable and shared through `Arc`. A rewrite that changes
//! declarations re-resolves the affected scope subtree, which rebuilds its
//! symbols instead of mutating them.

mod intrinsics;
mod modules;
mod resolver;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::error::ResolutionWarning;
use crate::ir::{Arena, Attr, Intent, NodeId, TypeSpec};
use crate::types::SourceId;

pub use intrinsics::{is_intrinsic_module, is_intrinsic_procedure};
pub use modules::{ExternalProcedure, ModuleInfo, ModuleTable, UseSpec};
pub use resolver::{resolve_unit, Resolver};

// ============================================================================
// Identifiers and Kinds
// ============================================================================

/// Index of a scope in its [`ScopeTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeId(pub u32);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScopeKind {
    File,
    Module,
    Routine,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolKind {
    /// Local or module variable.
    Variable,
    /// Named constant (`parameter` attribute).
    Constant,
    /// Dummy argument of the enclosing routine.
    Dummy,
    /// Function result variable.
    Result,
    /// Subroutine or function.
    Procedure,
    Module,
    /// Intrinsic procedure of the language.
    Intrinsic,
}

// ============================================================================
// Symbols
// ============================================================================

/// Resolved identity of a declared name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    /// Name as declared.
    pub name: String,
    pub kind: SymbolKind,
    pub type_spec: Option<TypeSpec>,
    /// Extent expressions in the declaring unit's arena; empty for scalars.
    pub shape: Vec<NodeId>,
    pub intent: Option<Intent>,
    pub attrs: Vec<Attr>,
    /// Declaring node (declaration statement, routine, module).
    pub declared_at: Option<NodeId>,
    /// Source unit the declaring node lives in.
    pub source: Option<SourceId>,
    /// Module the symbol was imported from, for `use`-associated names.
    pub origin: Option<String>,
}

impl Symbol {
    pub fn new(name: impl Into<String>, kind: SymbolKind) -> Self {
        Symbol {
            name: name.into(),
            kind,
            type_spec: None,
            shape: Vec::new(),
            intent: None,
            attrs: Vec::new(),
            declared_at: None,
            source: None,
            origin: None,
        }
    }

    pub fn with_type(mut self, type_spec: TypeSpec) -> Self {
        self.type_spec = Some(type_spec);
        self
    }

    pub fn with_shape(mut self, shape: Vec<NodeId>) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_intent(mut self, intent: Option<Intent>) -> Self {
        self.intent = intent;
        self
    }

    pub fn with_attrs(mut self, attrs: Vec<Attr>) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn declared_at(mut self, node: NodeId, source: SourceId) -> Self {
        self.declared_at = Some(node);
        self.source = Some(source);
        self
    }

    pub fn with_origin(mut self, module: impl Into<String>) -> Self {
        self.origin = Some(module.into());
        self
    }

    /// Copy of this symbol visible under another name (renamed import).
    pub fn renamed(&self, local: &str) -> Symbol {
        Symbol {
            name: local.to_string(),
            ..self.clone()
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn is_array(&self) -> bool {
        !self.shape.is_empty()
    }

    /// Lowercase lookup key.
    pub fn key(&self) -> String {
        self.name.to_ascii_lowercase()
    }
}

// ============================================================================
// Scopes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub id: ScopeId,
    pub kind: ScopeKind,
    /// IR node owning this scope.
    pub owner: NodeId,
    /// Owner name (module or routine name, file path, or `block`).
    pub name: String,
    pub parent: Option<ScopeId>,
    pub children: Vec<ScopeId>,
    pub symbols: BTreeMap<String, Arc<Symbol>>,
    /// `implicit none` is in effect.
    pub implicit_none: bool,
    /// Modules used without an `only` list that are not known to the session.
    pub opaque_imports: Vec<String>,
    /// False once the owner left the tree through re-resolution.
    pub alive: bool,
}

impl Scope {
    fn new(id: ScopeId, kind: ScopeKind, owner: NodeId, name: String, parent: Option<ScopeId>) -> Self {
        Scope {
            id,
            kind,
            owner,
            name,
            parent,
            children: Vec::new(),
            symbols: BTreeMap::new(),
            implicit_none: false,
            opaque_imports: Vec::new(),
            alive: true,
        }
    }

    /// Declare a symbol; a later declaration of the same name in the same
    /// scope replaces the earlier one.
    pub fn declare(&mut self, symbol: Symbol) -> Arc<Symbol> {
        let symbol = Arc::new(symbol);
        self.symbols.insert(symbol.key(), Arc::clone(&symbol));
        symbol
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Symbol>> {
        self.symbols.get(&name.to_ascii_lowercase())
    }

    /// Point symbols declared by `old` at `new`.
    fn redirect_declarations(&mut self, old: NodeId, new: NodeId) {
        for symbol in self.symbols.values_mut() {
            if symbol.declared_at == Some(old) {
                let mut moved = (**symbol).clone();
                moved.declared_at = Some(new);
                *symbol = Arc::new(moved);
            }
        }
    }
}

/// Resolution result for one reference node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// `scope` is `None` for intrinsics and external procedures found
    /// through the session-wide module table.
    Resolved {
        scope: Option<ScopeId>,
        symbol: Arc<Symbol>,
    },
    Unresolved { name: String },
}

impl Binding {
    pub fn symbol(&self) -> Option<&Arc<Symbol>> {
        match self {
            Binding::Resolved { symbol, .. } => Some(symbol),
            Binding::Unresolved { .. } => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Binding::Resolved { .. })
    }
}

// ============================================================================
// Scope Table
// ============================================================================

/// All scopes and bindings of one source unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeTable {
    scopes: Vec<Scope>,
    by_owner: HashMap<NodeId, ScopeId>,
    bindings: HashMap<NodeId, Binding>,
    warnings: Vec<(ScopeId, ResolutionWarning)>,
}

impl ScopeTable {
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.0 as usize]
    }

    /// Scope of the file root, if resolved.
    pub fn root(&self) -> Option<ScopeId> {
        self.scopes.iter().find(|s| s.alive && s.parent.is_none()).map(|s| s.id)
    }

    /// Live scopes in creation order.
    pub fn live_scopes(&self) -> impl Iterator<Item = &Scope> {
        self.scopes.iter().filter(|s| s.alive)
    }

    /// Scope owned by a node.
    pub fn scope_of_owner(&self, owner: NodeId) -> Option<ScopeId> {
        self.by_owner.get(&owner).copied()
    }

    /// Innermost scope enclosing `node` (its own scope if it owns one).
    pub fn enclosing_scope(&self, arena: &Arena, node: NodeId) -> Option<ScopeId> {
        std::iter::once(node)
            .chain(arena.ancestors(node))
            .find_map(|n| self.scope_of_owner(n))
    }

    /// Look `name` up from `scope` outward.
    pub fn lookup(&self, scope: ScopeId, name: &str) -> Option<(ScopeId, Arc<Symbol>)> {
        let key = name.to_ascii_lowercase();
        let mut current = Some(scope);
        while let Some(id) = current {
            let scope = self.scope(id);
            if let Some(symbol) = scope.symbols.get(&key) {
                return Some((id, Arc::clone(symbol)));
            }
            current = scope.parent;
        }
        None
    }

    /// Look `name` up as seen from `node`.
    pub fn lookup_at(&self, arena: &Arena, node: NodeId, name: &str) -> Option<Arc<Symbol>> {
        let scope = self.enclosing_scope(arena, node)?;
        self.lookup(scope, name).map(|(_, symbol)| symbol)
    }

    /// Binding recorded for a reference node.
    pub fn binding(&self, node: NodeId) -> Option<&Binding> {
        self.bindings.get(&node)
    }

    /// Warnings raised while resolving the live scopes.
    pub fn warnings(&self) -> Vec<ResolutionWarning> {
        self.warnings
            .iter()
            .filter(|(scope, _)| self.scope(*scope).alive)
            .map(|(_, w)| w.clone())
            .collect()
    }

    /// Whether `implicit none` applies at `scope` (own or inherited).
    pub fn implicit_none_at(&self, scope: ScopeId) -> bool {
        let mut current = Some(scope);
        while let Some(id) = current {
            let scope = self.scope(id);
            if scope.implicit_none {
                return true;
            }
            current = scope.parent;
        }
        false
    }

    /// Re-key a scope whose owner was rebuilt copy-on-write.
    ///
    /// The owner's own statements are reused by id, so symbols and bindings
    /// stay valid; only the owner link changes.
    pub fn remap_owner(&mut self, old: NodeId, new: NodeId) {
        let Some(id) = self.by_owner.remove(&old) else {
            return;
        };
        self.scope_mut(id).owner = new;
        self.by_owner.insert(new, id);
        if let Some(parent) = self.scope(id).parent {
            self.scope_mut(parent).redirect_declarations(old, new);
        }
    }

    fn push_scope(
        &mut self,
        kind: ScopeKind,
        owner: NodeId,
        name: String,
        parent: Option<ScopeId>,
    ) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope::new(id, kind, owner, name, parent));
        self.by_owner.insert(owner, id);
        if let Some(parent) = parent {
            self.scope_mut(parent).children.push(id);
        }
        id
    }

    /// Drop a scope subtree: mark scopes dead, forget their owners and the
    /// bindings of every node under the removed owners.
    fn drop_subtree(&mut self, arena: &Arena, id: ScopeId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let owner = self.scope(current).owner;
            for node in arena.descendants(owner) {
                self.bindings.remove(&node);
            }
            self.by_owner.remove(&owner);
            let scope = self.scope_mut(current);
            scope.alive = false;
            stack.extend(scope.children.drain(..));
        }
        if let Some(parent) = self.scope(id).parent {
            self.scope_mut(parent).children.retain(|&c| c != id);
        }
    }
}
