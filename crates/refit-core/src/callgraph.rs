//! Program units and the dependency graph between them.
//!
//! Nodes are the modules, subroutines, functions and main programs of every
//! loaded source unit. Edges point from a unit to what it depends on: the
//! procedures it calls and the modules it uses. Names that cannot be mapped to
//! a loaded unit are kept as unresolved dependencies; they are reported but
//! never order anything.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ir::{Arena, ItemPath, NodeId, NodeKind, RoutineKind};
use crate::source::SourceUnit;
use crate::symbols::{is_intrinsic_module, is_intrinsic_procedure, Binding, ModuleTable, SymbolKind};
use crate::types::SourceId;

// ============================================================================
// Unit Identity
// ============================================================================

/// Kind of a program unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Module,
    Subroutine,
    Function,
    Program,
}

impl UnitKind {
    pub fn of(kind: &NodeKind) -> Option<UnitKind> {
        match kind {
            NodeKind::Module { .. } => Some(UnitKind::Module),
            NodeKind::Routine { kind, .. } => Some(match kind {
                RoutineKind::Subroutine => UnitKind::Subroutine,
                RoutineKind::Function { .. } => UnitKind::Function,
                RoutineKind::Program => UnitKind::Program,
            }),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            UnitKind::Module => "module",
            UnitKind::Subroutine => "subroutine",
            UnitKind::Function => "function",
            UnitKind::Program => "program",
        }
    }

    pub fn is_routine(self) -> bool {
        !matches!(self, UnitKind::Module)
    }

    /// Subroutines and functions.
    pub const ROUTINES: &'static [UnitKind] = &[UnitKind::Subroutine, UnitKind::Function];

    pub const ALL: &'static [UnitKind] = &[
        UnitKind::Module,
        UnitKind::Subroutine,
        UnitKind::Function,
        UnitKind::Program,
    ];
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stable identity of a program unit: its source and its position in the
/// file. Survives renames and copy-on-write rebuilds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitKey {
    pub source: SourceId,
    pub path: ItemPath,
}

impl UnitKey {
    pub fn new(source: SourceId, path: ItemPath) -> Self {
        UnitKey { source, path }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.source, self.path)
    }
}

/// Index of a unit in a [`CallGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProgramUnitId(pub usize);

/// Graph node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitInfo {
    pub key: UnitKey,
    pub name: String,
    pub kind: UnitKind,
    /// Display name of the file.
    pub file: String,
    /// Enclosing module, for module procedures.
    pub module: Option<String>,
}

impl UnitInfo {
    /// `module::name` for module procedures, the plain name otherwise.
    pub fn qualified_name(&self) -> String {
        match &self.module {
            Some(module) => format!("{}::{}", module, self.name),
            None => self.name.clone(),
        }
    }
}

/// One outgoing edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Dependency {
    /// Calls the target procedure.
    Call(ProgramUnitId),
    /// Uses the target module.
    Uses(ProgramUnitId),
    /// Refers to a procedure or module that is not loaded.
    Unresolved(String),
}

impl Dependency {
    pub fn target(&self) -> Option<ProgramUnitId> {
        match self {
            Dependency::Call(id) | Dependency::Uses(id) => Some(*id),
            Dependency::Unresolved(_) => None,
        }
    }
}

// ============================================================================
// Graph Options
// ============================================================================

/// Controls which units and edges a graph contains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphOptions {
    /// Names whose calls are neither followed nor reported.
    pub disable: Vec<String>,
    /// Units to start from; empty selects every unit.
    pub roots: Vec<String>,
    /// Also select everything the roots depend on, transitively.
    pub expand: bool,
}

impl GraphOptions {
    fn is_disabled(&self, name: &str) -> bool {
        self.disable.iter().any(|d| d.eq_ignore_ascii_case(name))
    }
}

// ============================================================================
// Call Graph
// ============================================================================

/// Dependency graph over all program units of a session.
#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    units: Vec<UnitInfo>,
    by_key: HashMap<UnitKey, ProgramUnitId>,
    dependencies: Vec<BTreeSet<Dependency>>,
    selected: Vec<bool>,
}

impl CallGraph {
    /// Build the graph for a set of resolved source units.
    ///
    /// `units` must be the same set the module table was built from.
    pub fn build<'a>(
        units: impl IntoIterator<Item = &'a SourceUnit>,
        modules: &ModuleTable,
        options: &GraphOptions,
    ) -> CallGraph {
        let mut sources: Vec<&SourceUnit> = units.into_iter().collect();
        sources.sort_by_key(|u| u.id);

        let mut graph = CallGraph::default();
        let mut by_node: HashMap<(SourceId, NodeId), ProgramUnitId> = HashMap::new();
        let mut unit_nodes = Vec::new();
        for source in &sources {
            for (path, node) in source.program_units() {
                let Some(kind) = UnitKind::of(source.arena.kind(node)) else {
                    continue;
                };
                let id = ProgramUnitId(graph.units.len());
                let module = source
                    .enclosing_module(node)
                    .and_then(|m| source.arena.kind(m).unit_name())
                    .map(str::to_string);
                let key = UnitKey::new(source.id, path);
                graph.units.push(UnitInfo {
                    key: key.clone(),
                    name: source.arena.kind(node).unit_name().unwrap_or_default().to_string(),
                    kind,
                    file: source.file_name(),
                    module,
                });
                graph.by_key.insert(key, id);
                by_node.insert((source.id, node), id);
                unit_nodes.push((*source, node));
            }
        }

        let linker = Linker {
            graph: &graph,
            by_node: &by_node,
            modules,
            options,
        };
        let dependencies: Vec<BTreeSet<Dependency>> = unit_nodes
            .iter()
            .map(|(source, node)| linker.dependencies_of(source, *node))
            .collect();
        graph.dependencies = dependencies;
        graph.selected = graph.select(options);

        debug!(
            units = graph.units.len(),
            edges = graph.dependencies.iter().map(BTreeSet::len).sum::<usize>(),
            selected = graph.selected.iter().filter(|s| **s).count(),
            "built call graph"
        );
        graph
    }

    fn select(&self, options: &GraphOptions) -> Vec<bool> {
        if options.roots.is_empty() {
            return vec![true; self.units.len()];
        }
        let mut selected = vec![false; self.units.len()];
        let mut stack: Vec<ProgramUnitId> = self
            .ids()
            .filter(|&id| {
                let unit = self.unit(id);
                options
                    .roots
                    .iter()
                    .any(|r| r.eq_ignore_ascii_case(&unit.name) || r.eq_ignore_ascii_case(&unit.qualified_name()))
            })
            .collect();
        while let Some(id) = stack.pop() {
            if selected[id.0] {
                continue;
            }
            selected[id.0] = true;
            if options.expand {
                stack.extend(self.callees(id));
            }
        }
        selected
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ProgramUnitId> {
        (0..self.units.len()).map(ProgramUnitId)
    }

    pub fn unit(&self, id: ProgramUnitId) -> &UnitInfo {
        &self.units[id.0]
    }

    pub fn units(&self) -> &[UnitInfo] {
        &self.units
    }

    pub fn id_of(&self, key: &UnitKey) -> Option<ProgramUnitId> {
        self.by_key.get(key).copied()
    }

    /// Units whose name matches, in graph order.
    pub fn find(&self, name: &str) -> Vec<ProgramUnitId> {
        self.ids()
            .filter(|&id| {
                let unit = self.unit(id);
                unit.name.eq_ignore_ascii_case(name) || unit.qualified_name().eq_ignore_ascii_case(name)
            })
            .collect()
    }

    pub fn is_selected(&self, id: ProgramUnitId) -> bool {
        self.selected.get(id.0).copied().unwrap_or(false)
    }

    pub fn dependencies(&self, id: ProgramUnitId) -> impl Iterator<Item = &Dependency> {
        self.dependencies[id.0].iter()
    }

    /// Resolved dependencies (calls and used modules), without duplicates.
    pub fn callees(&self, id: ProgramUnitId) -> Vec<ProgramUnitId> {
        let set: BTreeSet<ProgramUnitId> = self.dependencies(id).filter_map(Dependency::target).collect();
        set.into_iter().collect()
    }

    /// Units that depend on `id`.
    pub fn callers(&self, id: ProgramUnitId) -> Vec<ProgramUnitId> {
        self.ids()
            .filter(|&caller| self.dependencies(caller).any(|d| d.target() == Some(id)))
            .collect()
    }

    /// Unresolved names per unit.
    pub fn unresolved(&self) -> Vec<(ProgramUnitId, String)> {
        self.ids()
            .flat_map(|id| {
                self.dependencies(id).filter_map(move |d| match d {
                    Dependency::Unresolved(name) => Some((id, name.clone())),
                    _ => None,
                })
            })
            .collect()
    }

    /// Strongly connected components in dependency order: every component
    /// comes after all components it depends on. Members are sorted.
    pub fn components(&self) -> Vec<Vec<ProgramUnitId>> {
        let mut tarjan = Tarjan::new(self);
        for id in self.ids() {
            if tarjan.index[id.0].is_none() {
                tarjan.connect(id);
            }
        }
        tarjan.components
    }

    /// Components grouped into levels. Level 0 depends on nothing; every
    /// component sits one level above its highest dependency. Components of
    /// one level are independent of each other.
    pub fn levels(&self) -> Vec<Vec<Vec<ProgramUnitId>>> {
        let components = self.components();
        let mut component_of = vec![0usize; self.units.len()];
        for (c, members) in components.iter().enumerate() {
            for id in members {
                component_of[id.0] = c;
            }
        }
        let mut level = vec![0usize; components.len()];
        for (c, members) in components.iter().enumerate() {
            let highest = members
                .iter()
                .flat_map(|&m| self.callees(m))
                .map(|t| component_of[t.0])
                .filter(|&t| t != c)
                .map(|t| level[t] + 1)
                .max();
            level[c] = highest.unwrap_or(0);
        }
        let depth = level.iter().copied().max().map_or(0, |m| m + 1);
        let mut out = vec![Vec::new(); depth];
        for (c, members) in components.into_iter().enumerate() {
            out[level[c]].push(members);
        }
        out
    }
}

// ============================================================================
// Edge Resolution
// ============================================================================

struct Linker<'g> {
    graph: &'g CallGraph,
    by_node: &'g HashMap<(SourceId, NodeId), ProgramUnitId>,
    modules: &'g ModuleTable,
    options: &'g GraphOptions,
}

impl Linker<'_> {
    fn dependencies_of(&self, source: &SourceUnit, unit: NodeId) -> BTreeSet<Dependency> {
        let arena = &source.arena;
        let mut out = BTreeSet::new();
        for id in own_nodes(arena, unit) {
            match arena.kind(id) {
                NodeKind::Use { module, .. } => {
                    if let Some(dep) = self.module_dependency(module) {
                        out.insert(dep);
                    }
                }
                NodeKind::Call { name, .. } => {
                    if let Some(dep) = self.call_dependency(source, id, name, true) {
                        out.insert(dep);
                    }
                }
                NodeKind::Subscript { name, .. } => {
                    if let Some(dep) = self.call_dependency(source, id, name, false) {
                        out.insert(dep);
                    }
                }
                _ => {}
            }
        }
        out
    }

    fn module_dependency(&self, name: &str) -> Option<Dependency> {
        if self.options.is_disabled(name) {
            return None;
        }
        match self.modules.module(name) {
            Some(info) => self
                .graph
                .id_of(&UnitKey::new(info.source, info.path.clone()))
                .map(Dependency::Uses),
            None if is_intrinsic_module(name) => None,
            None => Some(Dependency::Unresolved(name.to_ascii_lowercase())),
        }
    }

    /// `explicit` is true for `call` statements. Subscripts only produce an
    /// edge when they resolve to a procedure.
    fn call_dependency(&self, source: &SourceUnit, node: NodeId, name: &str, explicit: bool) -> Option<Dependency> {
        if name.contains('%') || self.options.is_disabled(name) {
            return None;
        }
        let binding = source.scopes.binding(node);
        if let Some(Binding::Resolved { symbol, .. }) = binding {
            match symbol.kind {
                SymbolKind::Intrinsic => return None,
                SymbolKind::Procedure => {
                    if let (Some(declared), Some(src)) = (symbol.declared_at, symbol.source) {
                        if let Some(&id) = self.by_node.get(&(src, declared)) {
                            return Some(Dependency::Call(id));
                        }
                    }
                    if let Some(id) = self.external(&symbol.name) {
                        return Some(Dependency::Call(id));
                    }
                }
                _ if !explicit => return None,
                _ => {}
            }
        }
        if let Some(id) = self.external(name) {
            return Some(Dependency::Call(id));
        }
        if !explicit || is_intrinsic_procedure(name) {
            return None;
        }
        Some(Dependency::Unresolved(name.to_ascii_lowercase()))
    }

    fn external(&self, name: &str) -> Option<ProgramUnitId> {
        let external = self.modules.external(name)?;
        self.graph
            .id_of(&UnitKey::new(external.source, external.path.clone()))
    }
}

/// Nodes belonging to a unit itself, excluding nested program units.
fn own_nodes(arena: &Arena, unit: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut stack: Vec<NodeId> = match arena.kind(unit) {
        NodeKind::Module { spec, .. } => spec.clone(),
        NodeKind::Routine { spec, body, .. } => spec.iter().chain(body).copied().collect(),
        _ => Vec::new(),
    };
    stack.reverse();
    while let Some(id) = stack.pop() {
        if arena.node_type(id).is_program_unit() {
            continue;
        }
        out.push(id);
        stack.extend(arena.children(id).into_iter().rev());
    }
    out
}

// ============================================================================
// Strongly Connected Components
// ============================================================================

struct Tarjan<'g> {
    graph: &'g CallGraph,
    next_index: usize,
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<ProgramUnitId>,
    components: Vec<Vec<ProgramUnitId>>,
}

impl<'g> Tarjan<'g> {
    fn new(graph: &'g CallGraph) -> Self {
        let n = graph.len();
        Tarjan {
            graph,
            next_index: 0,
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            components: Vec::new(),
        }
    }

    fn connect(&mut self, v: ProgramUnitId) {
        self.index[v.0] = Some(self.next_index);
        self.lowlink[v.0] = self.next_index;
        self.next_index += 1;
        self.stack.push(v);
        self.on_stack[v.0] = true;

        for w in self.graph.callees(v) {
            match self.index[w.0] {
                None => {
                    self.connect(w);
                    self.lowlink[v.0] = self.lowlink[v.0].min(self.lowlink[w.0]);
                }
                Some(w_index) if self.on_stack[w.0] => {
                    self.lowlink[v.0] = self.lowlink[v.0].min(w_index);
                }
                Some(_) => {}
            }
        }

        if Some(self.lowlink[v.0]) == self.index[v.0] {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w.0] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            component.sort();
            self.components.push(component);
        }
    }
}
