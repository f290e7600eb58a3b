//! Building scope tables from IR.
//!
//! Resolution of one source unit runs in two steps per scope: declare every
//! name the scope introduces (dummies, declarations, `use` imports, contained
//! routines), then bind every reference in the scope's own statements. Nested
//! scopes are built after their parent is complete, so lookups from inside see
//! the whole enclosing scope.

use std::sync::Arc;

use tracing::debug;

use crate::error::ResolutionWarning;
use crate::ir::{Arena, Attr, NodeId, NodeKind, RoutineKind, TypeSpec};
use crate::source::SourceUnit;
use crate::text::line_starts;
use crate::types::SourceId;

use super::intrinsics::{is_intrinsic_module, is_intrinsic_procedure};
use super::modules::ModuleTable;
use super::{Binding, ScopeId, ScopeKind, ScopeTable, Symbol, SymbolKind};

/// Resolve a whole source unit, replacing its scope table.
///
/// Returns the warnings raised for unresolved names.
pub fn resolve_unit(unit: &mut SourceUnit, modules: &ModuleTable) -> Vec<ResolutionWarning> {
    let mut table = ScopeTable::default();
    let file = unit.file_name();
    let resolver = Resolver::new(&unit.arena, &unit.text, file, unit.id, modules);
    resolver.resolve_file(&mut table, unit.root);
    let warnings = table.warnings();
    debug!(
        file = %unit.path.display(),
        scopes = table.scopes.len(),
        bindings = table.bindings.len(),
        warnings = warnings.len(),
        "resolved source unit"
    );
    unit.scopes = table;
    warnings
}

/// Symbols introduced by the declarations in a specification part.
pub(crate) fn spec_symbols(
    arena: &Arena,
    spec: &[NodeId],
    dummies: &[String],
    source: SourceId,
) -> Vec<Symbol> {
    let mut out = Vec::new();
    for &stmt in spec {
        let NodeKind::Declaration {
            type_spec,
            attrs,
            entities,
        } = arena.kind(stmt)
        else {
            continue;
        };
        let intent = attrs.iter().find_map(|a| match a {
            Attr::Intent(i) => Some(*i),
            _ => None,
        });
        let other: Vec<Attr> = attrs
            .iter()
            .filter(|a| !matches!(a, Attr::Intent(_)))
            .cloned()
            .collect();
        for entity in entities {
            let kind = if dummies.iter().any(|d| d.eq_ignore_ascii_case(&entity.name)) {
                SymbolKind::Dummy
            } else if other.contains(&Attr::Parameter) {
                SymbolKind::Constant
            } else if other.contains(&Attr::External) {
                SymbolKind::Procedure
            } else {
                SymbolKind::Variable
            };
            out.push(
                Symbol::new(entity.name.clone(), kind)
                    .with_type(type_spec.clone())
                    .with_shape(entity.shape.clone())
                    .with_intent(intent)
                    .with_attrs(other.clone())
                    .declared_at(stmt, source),
            );
        }
    }
    out
}

/// Type given to an undeclared name by the default implicit typing rules.
fn implicit_type(name: &str) -> TypeSpec {
    match name.chars().next().map(|c| c.to_ascii_lowercase()) {
        Some('i'..='n') => TypeSpec::new("integer", None),
        _ => TypeSpec::new("real", None),
    }
}

/// Base name of a designator: `a%b%c` refers to `a`.
fn base_name(name: &str) -> &str {
    name.split('%').next().unwrap_or(name).trim()
}

/// Builds scopes and bindings for one source unit.
pub struct Resolver<'a> {
    arena: &'a Arena,
    file: String,
    source: SourceId,
    modules: &'a ModuleTable,
    line_starts: Vec<usize>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        arena: &'a Arena,
        text: &str,
        file: String,
        source: SourceId,
        modules: &'a ModuleTable,
    ) -> Self {
        Resolver {
            arena,
            file,
            source,
            modules,
            line_starts: line_starts(text),
        }
    }

    /// Resolve everything under the file root.
    pub fn resolve_file(&self, table: &mut ScopeTable, root: NodeId) -> Option<ScopeId> {
        self.build_scope(table, root, None)
    }

    /// Replace the scope subtree of `old_owner` by one built for `new_owner`.
    ///
    /// Only the affected subtree is rebuilt. The parent scope's symbol for the
    /// unit is updated to the new owner (and its new name, after a rename).
    pub fn reresolve(
        &self,
        table: &mut ScopeTable,
        old_owner: NodeId,
        new_owner: NodeId,
    ) -> Option<ScopeId> {
        let old_scope = table.scope_of_owner(old_owner)?;
        let parent = table.scope(old_scope).parent;
        table.drop_subtree(self.arena, old_scope);
        if let Some(parent) = parent {
            let scope = table.scope_mut(parent);
            scope
                .symbols
                .retain(|_, s| s.declared_at != Some(old_owner));
            if let Some(name) = self.arena.kind(new_owner).unit_name() {
                let kind = match self.arena.kind(new_owner) {
                    NodeKind::Module { .. } => SymbolKind::Module,
                    _ => SymbolKind::Procedure,
                };
                scope.declare(Symbol::new(name, kind).declared_at(new_owner, self.source));
            }
        }
        self.build_scope(table, new_owner, parent)
    }

    fn build_scope(
        &self,
        table: &mut ScopeTable,
        owner: NodeId,
        parent: Option<ScopeId>,
    ) -> Option<ScopeId> {
        let (kind, name) = match self.arena.kind(owner) {
            NodeKind::File { .. } => (ScopeKind::File, self.file.clone()),
            NodeKind::Module { name, .. } => (ScopeKind::Module, name.clone()),
            NodeKind::Routine { name, .. } => (ScopeKind::Routine, name.clone()),
            NodeKind::Block { .. } => (ScopeKind::Block, "block".to_string()),
            _ => return None,
        };
        let id = table.push_scope(kind, owner, name, parent);
        self.declare(table, id, owner);

        let statements: Vec<NodeId> = match self.arena.kind(owner) {
            NodeKind::File { items } => items
                .iter()
                .copied()
                .filter(|&i| !self.arena.node_type(i).is_program_unit())
                .collect(),
            NodeKind::Module { spec, .. } => spec.clone(),
            NodeKind::Routine { spec, body, .. } | NodeKind::Block { spec, body } => {
                spec.iter().chain(body).copied().collect()
            }
            _ => Vec::new(),
        };
        self.bind_references(table, id, &statements);

        let nested: Vec<NodeId> = self.arena.kind(owner).unit_children().to_vec();
        for unit in nested {
            if self.arena.node_type(unit).is_program_unit() {
                self.build_scope(table, unit, Some(id));
            }
        }
        Some(id)
    }

    // ------------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------------

    fn declare(&self, table: &mut ScopeTable, scope: ScopeId, owner: NodeId) {
        match self.arena.kind(owner) {
            NodeKind::File { items } => {
                for &item in items {
                    let kind = match self.arena.kind(item) {
                        NodeKind::Module { .. } => SymbolKind::Module,
                        NodeKind::Routine { .. } => SymbolKind::Procedure,
                        _ => continue,
                    };
                    if let Some(name) = self.arena.kind(item).unit_name() {
                        table
                            .scope_mut(scope)
                            .declare(Symbol::new(name, kind).declared_at(item, self.source));
                    }
                }
            }
            NodeKind::Module { spec, routines, .. } => {
                self.declare_spec(table, scope, spec, &[]);
                self.declare_units(table, scope, routines);
            }
            NodeKind::Routine {
                name,
                kind,
                params,
                spec,
                routines,
                ..
            } => {
                for param in params {
                    table.scope_mut(scope).declare(
                        Symbol::new(param.clone(), SymbolKind::Dummy).declared_at(owner, self.source),
                    );
                }
                let result = match kind {
                    RoutineKind::Function {
                        result,
                        return_type,
                    } => {
                        let result_name = result.clone().unwrap_or_else(|| name.clone());
                        let mut symbol = Symbol::new(result_name.clone(), SymbolKind::Result)
                            .declared_at(owner, self.source);
                        symbol.type_spec = return_type.clone();
                        table.scope_mut(scope).declare(symbol);
                        Some(result_name)
                    }
                    _ => None,
                };
                self.declare_units(table, scope, routines);
                self.declare_spec(table, scope, spec, params);
                if let Some(result) = result {
                    let scope = table.scope_mut(scope);
                    if let Some(symbol) = scope.get(&result).cloned() {
                        if symbol.kind == SymbolKind::Variable {
                            let mut fixed = (*symbol).clone();
                            fixed.kind = SymbolKind::Result;
                            scope.declare(fixed);
                        }
                    }
                }
            }
            NodeKind::Block { spec, .. } => self.declare_spec(table, scope, spec, &[]),
            _ => {}
        }
    }

    fn declare_units(&self, table: &mut ScopeTable, scope: ScopeId, units: &[NodeId]) {
        for &unit in units {
            if let Some(name) = self.arena.kind(unit).unit_name() {
                table.scope_mut(scope).declare(
                    Symbol::new(name, SymbolKind::Procedure).declared_at(unit, self.source),
                );
            }
        }
    }

    fn declare_spec(&self, table: &mut ScopeTable, scope: ScopeId, spec: &[NodeId], dummies: &[String]) {
        for &stmt in spec {
            match self.arena.kind(stmt) {
                NodeKind::Use { module, only, .. } => {
                    self.import(table, scope, stmt, module, only.as_deref());
                }
                NodeKind::Implicit { spec } => {
                    if spec.trim().eq_ignore_ascii_case("none") {
                        table.scope_mut(scope).implicit_none = true;
                    }
                }
                _ => {}
            }
        }
        for symbol in spec_symbols(self.arena, spec, dummies, self.source) {
            table.scope_mut(scope).declare(symbol);
        }
    }

    fn import(
        &self,
        table: &mut ScopeTable,
        scope: ScopeId,
        stmt: NodeId,
        module: &str,
        only: Option<&[crate::ir::UseItem]>,
    ) {
        match self.modules.exports(module) {
            Some(exports) => match only {
                None => {
                    let target = table.scope_mut(scope);
                    for symbol in exports.into_values() {
                        target.symbols.insert(symbol.key(), symbol);
                    }
                }
                Some(items) => {
                    for item in items {
                        match exports.get(&item.name.to_ascii_lowercase()) {
                            Some(symbol) => {
                                table.scope_mut(scope).declare(symbol.renamed(item.local_name()));
                            }
                            None => self.warn(table, scope, stmt, &item.name, "module entity"),
                        }
                    }
                }
            },
            None => {
                if !is_intrinsic_module(module) {
                    self.warn(table, scope, stmt, module, "module");
                }
                match only {
                    None => table.scope_mut(scope).opaque_imports.push(module.to_string()),
                    Some(items) => {
                        for item in items {
                            table.scope_mut(scope).declare(
                                Symbol::new(item.local_name(), SymbolKind::Variable)
                                    .with_origin(module),
                            );
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // References
    // ------------------------------------------------------------------------

    fn bind_references(&self, table: &mut ScopeTable, scope: ScopeId, statements: &[NodeId]) {
        let mut stack: Vec<NodeId> = statements.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            match self.arena.kind(id) {
                NodeKind::Block { .. } => {
                    self.build_scope(table, id, Some(scope));
                    continue;
                }
                NodeKind::Module { .. } | NodeKind::Routine { .. } => continue,
                NodeKind::Variable { name } | NodeKind::Subscript { name, .. } => {
                    self.bind(table, scope, id, base_name(name), false);
                }
                NodeKind::Call { name, .. } => self.bind(table, scope, id, name, true),
                NodeKind::Loop { variable, .. } => self.bind(table, scope, id, variable, false),
                _ => {}
            }
            stack.extend(self.arena.children(id).into_iter().rev());
        }
    }

    fn bind(&self, table: &mut ScopeTable, scope: ScopeId, node: NodeId, name: &str, call: bool) {
        let binding = if let Some((found, symbol)) = table.lookup(scope, name) {
            Binding::Resolved {
                scope: Some(found),
                symbol,
            }
        } else if is_intrinsic_procedure(name) {
            Binding::Resolved {
                scope: None,
                symbol: Arc::new(Symbol::new(name, SymbolKind::Intrinsic)),
            }
        } else if let Some(external) = self.modules.external(name) {
            let mut symbol = Symbol::new(external.name.clone(), SymbolKind::Procedure);
            symbol.source = Some(external.source);
            Binding::Resolved {
                scope: None,
                symbol: Arc::new(symbol),
            }
        } else if !call && !table.implicit_none_at(scope) {
            Binding::Resolved {
                scope: None,
                symbol: Arc::new(
                    Symbol::new(name, SymbolKind::Variable).with_type(implicit_type(name)),
                ),
            }
        } else {
            if !self.has_opaque_import(table, scope) {
                let what = if call { "procedure" } else { "name" };
                self.warn(table, scope, node, name, what);
            }
            Binding::Unresolved {
                name: name.to_string(),
            }
        };
        table.bindings.insert(node, binding);
    }

    fn has_opaque_import(&self, table: &ScopeTable, scope: ScopeId) -> bool {
        let mut current = Some(scope);
        while let Some(id) = current {
            let s = table.scope(id);
            if !s.opaque_imports.is_empty() {
                return true;
            }
            current = s.parent;
        }
        false
    }

    fn warn(&self, table: &mut ScopeTable, scope: ScopeId, node: NodeId, name: &str, what: &str) {
        let already = table.warnings.iter().any(|(s, w)| {
            *s == scope && w.what == what && w.name.eq_ignore_ascii_case(name)
        });
        if already {
            return;
        }
        let line = self.arena.location_span(node).map(|span| {
            self.line_starts.partition_point(|&start| start <= span.start) as u32
        });
        let warning = ResolutionWarning {
            file: self.file.clone(),
            name: name.to_string(),
            scope: table.scope(scope).name.clone(),
            what: what.to_string(),
            line,
        };
        debug!(%warning, "unresolved reference");
        table.warnings.push((scope, warning));
    }
}
