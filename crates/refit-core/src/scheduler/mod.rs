//! Pass scheduling over the call graph.
//!
//! A [`Pass`] transforms one program unit at a time. The [`Scheduler`] decides
//! the order from the call graph (callers first, callees first, or no order),
//! runs independent units on a worker pool, iterates mutually recursive units
//! to a fixed point, and caches per-unit results.

mod limits;
mod run;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::callgraph::{GraphOptions, UnitInfo, UnitKind};
use crate::error::TransformError;
use crate::ir::{Arena, NodeId};
use crate::lint::Diagnostic;
use crate::symbols::ScopeTable;
use crate::visit::{rewrite_unit, Transformer};

pub use limits::{ProcessLimiter, ProcessPermit};
pub use run::{RunReport, Scheduler};

// ============================================================================
// Pass Interface
// ============================================================================

/// Order in which a pass visits the call graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionOrder {
    /// A unit runs before everything it depends on.
    CallerFirst,
    /// A unit runs after everything it depends on.
    CalleeFirst,
    /// No ordering; every unit runs once, in parallel.
    #[default]
    Independent,
}

/// Summary published by an already processed neighbor in the call graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySummary {
    pub unit: UnitInfo,
    pub summary: serde_json::Value,
}

/// Everything a pass sees while processing one unit.
pub struct PassContext<'a> {
    pub unit: &'a UnitInfo,
    /// Current node of the unit.
    pub node: NodeId,
    pub arena: &'a mut Arena,
    pub scopes: &'a ScopeTable,
    /// Original text of the source unit.
    pub text: &'a str,
    /// Summaries of callees (callee-first) or callers (caller-first).
    pub dependencies: Vec<DependencySummary>,
    /// Fixed-point round, starting at 1. Always 1 outside cycles.
    pub round: usize,
}

impl PassContext<'_> {
    /// Rewrite the unit with `transformer`, leaving contained procedures to
    /// their own runs. Returns the new unit node if anything changed.
    pub fn rewrite<T: Transformer + ?Sized>(
        &mut self,
        transformer: &mut T,
    ) -> Result<Option<NodeId>, TransformError> {
        let outcome = rewrite_unit(self.arena, self.node, transformer)?;
        Ok(outcome.changed.then_some(outcome.root))
    }

    /// Summary of a dependency by unit name.
    pub fn dependency(&self, name: &str) -> Option<&serde_json::Value> {
        self.dependencies
            .iter()
            .find(|d| d.unit.name.eq_ignore_ascii_case(name))
            .map(|d| &d.summary)
    }

    /// Shorthand for a [`TransformError::PassFailed`] on this unit.
    pub fn fail(&self, pass: &str, message: impl Into<String>) -> TransformError {
        TransformError::pass_failed(pass, self.unit.qualified_name(), message)
    }
}

/// Result of running a pass on one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassOutput {
    /// New unit node, `None` if unchanged.
    pub replacement: Option<NodeId>,
    pub diagnostics: Vec<Diagnostic>,
    /// Data made visible to neighbors in the call graph.
    pub summary: Option<serde_json::Value>,
    /// New program units to append to the list holding this unit. A unit
    /// whose name is already taken there is not added.
    pub added: Vec<NodeId>,
}

impl PassOutput {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn replaced(node: Option<NodeId>) -> Self {
        PassOutput {
            replacement: node,
            ..Default::default()
        }
    }

    pub fn with_summary(mut self, summary: serde_json::Value) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_added(mut self, added: Vec<NodeId>) -> Self {
        self.added = added;
        self
    }
}

// ============================================================================
// Planning
// ============================================================================

/// What a pass sees of one unit when planning: the call graph only.
#[derive(Debug, Clone)]
pub struct PlanContext<'a> {
    pub unit: &'a UnitInfo,
    /// Loaded procedures the unit calls.
    pub callees: Vec<&'a UnitInfo>,
    /// Names the unit depends on that are not loaded.
    pub unresolved: Vec<&'a str>,
}

impl PlanContext<'_> {
    /// Every procedure name the unit calls, loaded or not.
    pub fn called_names(&self) -> impl Iterator<Item = &str> {
        self.callees
            .iter()
            .map(|c| c.name.as_str())
            .chain(self.unresolved.iter().copied())
    }
}

/// Dependencies a pass would add to or remove from one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl DependencyChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Dry run of one pass: the order units would run in and the dependency
/// changes each would make. Nothing is transformed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassPlan {
    pub pass: String,
    pub order: ExecutionOrder,
    /// Stages of qualified unit names; units of one stage are independent.
    pub stages: Vec<Vec<String>>,
    /// Units with dependency changes, by qualified name.
    pub changes: BTreeMap<String, DependencyChanges>,
}

/// A transformation applied per program unit.
pub trait Pass: Send + Sync {
    fn name(&self) -> &str;

    fn order(&self) -> ExecutionOrder {
        ExecutionOrder::Independent
    }

    /// Kinds of program units this pass runs on.
    fn unit_kinds(&self) -> &[UnitKind] {
        UnitKind::ROUTINES
    }

    /// Whether a failure on one unit aborts the whole run.
    fn fatal_on_error(&self) -> bool {
        false
    }

    /// Stable rendering of the options that affect output. Part of the cache
    /// key.
    fn options_key(&self) -> String {
        String::new()
    }

    fn run(&self, cx: &mut PassContext<'_>) -> Result<PassOutput, TransformError>;

    /// Dependencies [`Pass::run`] would add or remove on this unit.
    fn plan(&self, _cx: &PlanContext<'_>) -> DependencyChanges {
        DependencyChanges::default()
    }
}

/// Wraps a pass so that any unit failure aborts the run.
pub struct FatalPass(pub Arc<dyn Pass>);

impl Pass for FatalPass {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn order(&self) -> ExecutionOrder {
        self.0.order()
    }

    fn unit_kinds(&self) -> &[UnitKind] {
        self.0.unit_kinds()
    }

    fn fatal_on_error(&self) -> bool {
        true
    }

    fn options_key(&self) -> String {
        self.0.options_key()
    }

    fn run(&self, cx: &mut PassContext<'_>) -> Result<PassOutput, TransformError> {
        self.0.run(cx)
    }

    fn plan(&self, cx: &PlanContext<'_>) -> DependencyChanges {
        self.0.plan(cx)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Constructs a pass from its options.
pub type PassFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn Pass>, TransformError> + Send + Sync>;

/// Named pass factories.
#[derive(Clone, Default)]
pub struct PassRegistry {
    factories: BTreeMap<String, PassFactory>,
}

impl PassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: PassFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiate a pass. `None` if the name is unknown.
    pub fn create(
        &self,
        name: &str,
        options: &serde_json::Value,
    ) -> Option<Result<Arc<dyn Pass>, TransformError>> {
        self.factories.get(name).map(|factory| factory(options))
    }
}

impl fmt::Debug for PassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Scheduler limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads; 0 uses one per CPU.
    pub workers: usize,
    /// Maximum number of concurrent external frontend processes.
    pub max_processes: usize,
    /// Fixed-point round limit for mutually recursive units.
    pub max_rounds: usize,
    /// Whole-run timeout.
    #[serde(with = "duration_secs")]
    pub timeout: Option<Duration>,
    #[serde(flatten)]
    pub graph: GraphOptions,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            workers: 0,
            max_processes: 4,
            max_rounds: 8,
            timeout: None,
            graph: GraphOptions::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_graph(mut self, graph: GraphOptions) -> Self {
        self.graph = graph;
        self
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs: Option<f64> = Option::deserialize(d)?;
        Ok(secs.filter(|s| *s > 0.0).map(Duration::from_secs_f64))
    }
}
