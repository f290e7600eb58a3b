//! Session-wide table of modules and external procedures.
//!
//! Built from every loaded source unit before per-unit resolution, so that a
//! `use` in one file can see the declarations of a module defined in another.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::ir::{ItemPath, NodeKind, UseItem};
use crate::source::SourceUnit;
use crate::types::SourceId;

use super::resolver::spec_symbols;
use super::{Symbol, SymbolKind};

/// A `use` statement as seen from the module table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UseSpec {
    pub module: String,
    pub only: Option<Vec<UseItem>>,
}

/// Declarations of one module.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub name: String,
    pub source: SourceId,
    pub path: ItemPath,
    /// Own declarations and module procedures, keyed by lowercase name.
    pub symbols: BTreeMap<String, Arc<Symbol>>,
    pub uses: Vec<UseSpec>,
}

/// A top-level subroutine or function (not inside a module).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalProcedure {
    pub name: String,
    pub source: SourceId,
    pub path: ItemPath,
}

/// Modules and external procedures of all loaded sources.
#[derive(Debug, Clone, Default)]
pub struct ModuleTable {
    modules: HashMap<String, ModuleInfo>,
    externals: HashMap<String, ExternalProcedure>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table from a set of source units.
    pub fn build<'a>(units: impl IntoIterator<Item = &'a SourceUnit>) -> Self {
        let mut table = ModuleTable::new();
        for unit in units {
            table.add_unit(unit);
        }
        debug!(
            modules = table.modules.len(),
            externals = table.externals.len(),
            "built module table"
        );
        table
    }

    /// Register the modules and external procedures of one unit.
    pub fn add_unit(&mut self, unit: &SourceUnit) {
        let arena = &unit.arena;
        for (idx, &item) in arena.kind(unit.root).unit_children().iter().enumerate() {
            let path = ItemPath(vec![idx]);
            match arena.kind(item) {
                NodeKind::Module {
                    name,
                    spec,
                    routines,
                } => {
                    let mut symbols = BTreeMap::new();
                    for symbol in spec_symbols(arena, spec, &[], unit.id) {
                        let symbol = symbol.with_origin(name.clone());
                        symbols.insert(symbol.key(), Arc::new(symbol));
                    }
                    for &routine in routines {
                        if let Some(rname) = arena.kind(routine).unit_name() {
                            let symbol = Symbol::new(rname, SymbolKind::Procedure)
                                .declared_at(routine, unit.id)
                                .with_origin(name.clone());
                            symbols.insert(symbol.key(), Arc::new(symbol));
                        }
                    }
                    let uses = spec
                        .iter()
                        .filter_map(|&s| match arena.kind(s) {
                            NodeKind::Use { module, only, .. } => Some(UseSpec {
                                module: module.clone(),
                                only: only.clone(),
                            }),
                            _ => None,
                        })
                        .collect();
                    let key = name.to_ascii_lowercase();
                    if let Some(previous) = self.modules.get(&key) {
                        warn!(
                            module = %name,
                            first = %previous.source,
                            second = %unit.id,
                            "module defined twice; keeping the later definition"
                        );
                    }
                    self.modules.insert(
                        key,
                        ModuleInfo {
                            name: name.clone(),
                            source: unit.id,
                            path,
                            symbols,
                            uses,
                        },
                    );
                }
                NodeKind::Routine { name, .. } => {
                    self.externals.insert(
                        name.to_ascii_lowercase(),
                        ExternalProcedure {
                            name: name.clone(),
                            source: unit.id,
                            path,
                        },
                    );
                }
                _ => {}
            }
        }
    }

    pub fn module(&self, name: &str) -> Option<&ModuleInfo> {
        self.modules.get(&name.to_ascii_lowercase())
    }

    pub fn external(&self, name: &str) -> Option<&ExternalProcedure> {
        self.externals.get(&name.to_ascii_lowercase())
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.modules.values()
    }

    pub fn externals(&self) -> impl Iterator<Item = &ExternalProcedure> {
        self.externals.values()
    }

    /// Every name a module makes available through `use`, including names it
    /// re-exports from modules it uses itself.
    pub fn exports(&self, name: &str) -> Option<BTreeMap<String, Arc<Symbol>>> {
        let module = self.module(name)?;
        let mut out = BTreeMap::new();
        let mut visited = HashSet::new();
        self.collect_exports(module, &mut out, &mut visited);
        Some(out)
    }

    fn collect_exports(
        &self,
        module: &ModuleInfo,
        out: &mut BTreeMap<String, Arc<Symbol>>,
        visited: &mut HashSet<String>,
    ) {
        if !visited.insert(module.name.to_ascii_lowercase()) {
            return;
        }
        for used in &module.uses {
            let Some(inner) = self.module(&used.module) else {
                continue;
            };
            let mut inner_exports = BTreeMap::new();
            self.collect_exports(inner, &mut inner_exports, visited);
            match &used.only {
                None => out.extend(inner_exports),
                Some(items) => {
                    for item in items {
                        if let Some(symbol) = inner_exports.get(&item.name.to_ascii_lowercase()) {
                            let local = symbol.renamed(item.local_name());
                            out.insert(local.key(), Arc::new(local));
                        }
                    }
                }
            }
        }
        // Own declarations win over re-exports.
        for (key, symbol) in &module.symbols {
            out.insert(key.clone(), Arc::clone(symbol));
        }
    }
}
