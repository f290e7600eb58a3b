//! The scheduler proper.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheKey, PassCache};
use crate::callgraph::{CallGraph, Dependency, ProgramUnitId, UnitInfo};
use crate::error::{SchedulingError, TransformError, UnitFailure};
use crate::hash::ContentHash;
use crate::ir::{fingerprint, replace_at_path, ItemPath, NodeId, NodeKind};
use crate::lint::Diagnostic;
use crate::source::{SharedUnit, SourceUnit};
use crate::symbols::{ModuleTable, Resolver};
use crate::types::{format_timestamp, SourceId};

use super::{
    DependencySummary, ExecutionOrder, Pass, PassContext, PassPlan, PlanContext, SchedulerConfig,
};

// ============================================================================
// Run Report
// ============================================================================

/// Outcome of one pass over a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub pass: String,
    pub order: ExecutionOrder,
    /// Units the pass was scheduled on.
    pub units: usize,
    /// Units the pass actually ran on (cache misses).
    pub executed: usize,
    /// Units served from the cache.
    pub cached: usize,
    /// Units whose IR changed, by qualified name.
    pub changed: Vec<String>,
    pub failures: Vec<UnitFailure>,
    /// Highest fixed-point round reached (1 without cycles).
    pub rounds: usize,
    pub diagnostics: Vec<Diagnostic>,
    pub summaries: BTreeMap<String, serde_json::Value>,
    /// `unit -> name` for every dependency that could not be resolved.
    pub unresolved: Vec<String>,
    pub started_at: String,
    pub finished_at: String,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Runs passes over shared source units.
///
/// The scheduler owns its worker pool and cache; nothing is global, so
/// several schedulers can coexist in one process.
pub struct Scheduler {
    config: SchedulerConfig,
    pool: rayon::ThreadPool,
    cache: Arc<PassCache>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulingError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("refit-worker-{}", i))
            .build()
            .map_err(|e| SchedulingError::WorkerPool {
                message: e.to_string(),
            })?;
        Ok(Scheduler {
            config,
            pool,
            cache: Arc::new(PassCache::new()),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<PassCache> {
        &self.cache
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `pass` over every selected unit of `units`.
    ///
    /// Unit-scoped failures are collected in the report. A fatal pass
    /// failure, a cycle that does not converge, or the run timeout end the
    /// run with an error; changes committed before that point stay in place.
    pub fn run(&self, pass: &dyn Pass, units: &[SharedUnit]) -> Result<RunReport, SchedulingError> {
        let started = Instant::now();
        let started_at = format_timestamp(SystemTime::now());

        let (graph, modules, sources) = self.snapshot(units);
        let runnable = runnable(&graph, pass);
        let stages = schedule(&graph, pass.order(), &runnable);
        let scheduled = runnable.iter().filter(|r| **r).count();
        info!(
            pass = pass.name(),
            order = ?pass.order(),
            units = scheduled,
            stages = stages.len(),
            workers = self.workers(),
            "running pass"
        );

        let state = RunState {
            pass,
            graph: &graph,
            modules: &modules,
            sources,
            cache: &self.cache,
            summaries: Mutex::new(HashMap::new()),
            abort: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            executed: AtomicUsize::new(0),
            deadline: self.config.timeout.map(|t| started + t),
        };
        let mut tally = Tally::default();

        for stage in &stages {
            let (singles, cycles): (Vec<&Vec<ProgramUnitId>>, Vec<&Vec<ProgramUnitId>>) =
                stage.iter().partition(|c| c.len() == 1);
            let singles: Vec<ProgramUnitId> = singles.into_iter().map(|c| c[0]).collect();
            let outcomes: Vec<(ProgramUnitId, UnitOutcome)> = self.pool.install(|| {
                singles
                    .par_iter()
                    .map(|&id| (id, state.run_unit(id, 1)))
                    .collect()
            });
            for (id, outcome) in outcomes {
                tally.record(&graph, id, outcome);
            }
            tally.rounds = tally.rounds.max(1);

            for cycle in cycles {
                if state.stopped() {
                    break;
                }
                self.run_cycle(&state, cycle, &mut tally)?;
            }
            if state.stopped() {
                break;
            }
        }

        let executed = state.executed.load(Ordering::SeqCst);
        let summaries = state.summaries.into_inner();

        if state.abort.load(Ordering::SeqCst) {
            let fatal = tally.failures.first().cloned();
            if let Some(first) = fatal {
                warn!(pass = pass.name(), unit = %first.unit, "fatal pass failure aborted the run");
                return Err(SchedulingError::Aborted {
                    pass: pass.name().to_string(),
                    first,
                    failures: tally.failures,
                });
            }
        }
        if state.timed_out.load(Ordering::SeqCst) {
            let incomplete: Vec<String> = graph
                .ids()
                .filter(|id| runnable[id.0] && !tally.completed.contains(id))
                .map(|id| graph.unit(id).qualified_name())
                .collect();
            warn!(
                pass = pass.name(),
                completed = tally.completed.len(),
                incomplete = incomplete.len(),
                "pass timed out"
            );
            return Err(SchedulingError::Timeout {
                pass: pass.name().to_string(),
                completed: tally.completed.len(),
                incomplete,
                failures: tally.failures,
            });
        }

        let mut diagnostics: Vec<Diagnostic> = tally.diagnostics.into_values().flatten().collect();
        diagnostics.sort_by(|a, b| (&a.file, a.line, &a.rule_id).cmp(&(&b.file, b.line, &b.rule_id)));
        let report = RunReport {
            pass: pass.name().to_string(),
            order: pass.order(),
            units: scheduled,
            executed,
            cached: tally.cached,
            changed: tally.changed.into_iter().collect(),
            failures: tally.failures,
            rounds: tally.rounds,
            diagnostics,
            summaries: summaries
                .into_iter()
                .map(|(id, s)| (graph.unit(id).qualified_name(), s))
                .collect(),
            unresolved: graph
                .unresolved()
                .into_iter()
                .map(|(id, name)| format!("{} -> {}", graph.unit(id).qualified_name(), name))
                .collect(),
            started_at,
            finished_at: format_timestamp(SystemTime::now()),
        };
        info!(
            pass = pass.name(),
            executed = report.executed,
            cached = report.cached,
            changed = report.changed.len(),
            failures = report.failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pass finished"
        );
        Ok(report)
    }

    /// Dry run of `pass`: the stages it would run in and the dependency
    /// changes it would make. Nothing is transformed or cached.
    pub fn plan(&self, pass: &dyn Pass, units: &[SharedUnit]) -> PassPlan {
        let (graph, _, _) = self.snapshot(units);
        let runnable = runnable(&graph, pass);
        let stages: Vec<Vec<String>> = schedule(&graph, pass.order(), &runnable)
            .into_iter()
            .map(|stage| {
                stage
                    .into_iter()
                    .flatten()
                    .map(|id| graph.unit(id).qualified_name())
                    .collect()
            })
            .collect();

        let mut changes = BTreeMap::new();
        for id in graph.ids().filter(|id| runnable[id.0]) {
            let mut callees = Vec::new();
            let mut unresolved = Vec::new();
            for dependency in graph.dependencies(id) {
                match dependency {
                    Dependency::Call(target) => callees.push(graph.unit(*target)),
                    Dependency::Unresolved(name) => unresolved.push(name.as_str()),
                    Dependency::Uses(_) => {}
                }
            }
            let cx = PlanContext {
                unit: graph.unit(id),
                callees,
                unresolved,
            };
            let planned = pass.plan(&cx);
            if !planned.is_empty() {
                debug!(pass = pass.name(), unit = %cx.unit.qualified_name(), ?planned, "planned unit");
                changes.insert(cx.unit.qualified_name(), planned);
            }
        }
        info!(
            pass = pass.name(),
            order = ?pass.order(),
            stages = stages.len(),
            changed = changes.len(),
            "planned pass"
        );
        PassPlan {
            pass: pass.name().to_string(),
            order: pass.order(),
            stages,
            changes,
        }
    }

    /// Module table, call graph and unit lookup for the current state of
    /// `units`.
    fn snapshot(&self, units: &[SharedUnit]) -> (CallGraph, ModuleTable, HashMap<SourceId, SharedUnit>) {
        let guards: Vec<_> = units.iter().map(|u| u.lock()).collect();
        let modules = ModuleTable::build(guards.iter().map(|g| &**g));
        let graph = CallGraph::build(guards.iter().map(|g| &**g), &modules, &self.config.graph);
        let sources = guards
            .iter()
            .zip(units)
            .map(|(g, shared)| (g.id, Arc::clone(shared)))
            .collect();
        (graph, modules, sources)
    }

    /// Iterate a strongly connected component until a round changes nothing
    /// and every summary matches the previous round.
    fn run_cycle(
        &self,
        state: &RunState<'_>,
        members: &[ProgramUnitId],
        tally: &mut Tally,
    ) -> Result<(), SchedulingError> {
        let names: Vec<String> = members
            .iter()
            .map(|&id| state.graph.unit(id).qualified_name())
            .collect();
        debug!(pass = state.pass.name(), cycle = ?names, "iterating cycle");

        let mut previous: Option<Vec<(ContentHash, Option<serde_json::Value>)>> = None;
        for round in 1..=self.config.max_rounds {
            let mut changed = false;
            let mut snapshot = Vec::with_capacity(members.len());
            for &id in members {
                let outcome = state.run_unit(id, round);
                let interrupted = matches!(outcome, UnitOutcome::Skipped | UnitOutcome::TimedOut);
                if let UnitOutcome::Done(done) = &outcome {
                    changed |= done.changed;
                    snapshot.push((done.fingerprint.clone(), done.summary.clone()));
                }
                tally.record(state.graph, id, outcome);
                if interrupted {
                    return Ok(());
                }
            }
            tally.rounds = tally.rounds.max(round);
            if !changed && previous.as_ref() == Some(&snapshot) {
                debug!(pass = state.pass.name(), cycle = ?names, rounds = round, "cycle converged");
                return Ok(());
            }
            previous = Some(snapshot);
        }
        warn!(
            pass = state.pass.name(),
            cycle = ?names,
            rounds = self.config.max_rounds,
            "cycle did not converge"
        );
        Err(SchedulingError::NotConverged {
            pass: state.pass.name().to_string(),
            units: names,
            rounds: self.config.max_rounds,
            failures: tally.failures.clone(),
        })
    }
}

/// Units `pass` runs on: selected, and of a kind the pass accepts.
fn runnable(graph: &CallGraph, pass: &dyn Pass) -> Vec<bool> {
    graph
        .ids()
        .map(|id| graph.is_selected(id) && pass.unit_kinds().contains(&graph.unit(id).kind))
        .collect()
}

/// Stages of components in execution order. Components of one stage are
/// independent; members are limited to runnable units.
fn schedule(graph: &CallGraph, order: ExecutionOrder, runnable: &[bool]) -> Vec<Vec<Vec<ProgramUnitId>>> {
    let levels = match order {
        ExecutionOrder::CalleeFirst => graph.levels(),
        ExecutionOrder::CallerFirst => graph.levels().into_iter().rev().collect(),
        ExecutionOrder::Independent => vec![graph.ids().map(|id| vec![id]).collect()],
    };
    levels
        .into_iter()
        .map(|level| {
            level
                .into_iter()
                .map(|members| members.into_iter().filter(|id| runnable[id.0]).collect::<Vec<_>>())
                .filter(|members| !members.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|level| !level.is_empty())
        .collect()
}

// ============================================================================
// Per-Unit Execution
// ============================================================================

struct Done {
    changed: bool,
    cached: bool,
    fingerprint: ContentHash,
    summary: Option<serde_json::Value>,
    diagnostics: Vec<Diagnostic>,
}

enum UnitOutcome {
    Done(Done),
    Failed(UnitFailure),
    /// Not run: the run was aborted or the unit no longer exists.
    Skipped,
    TimedOut,
}

#[derive(Default)]
struct Tally {
    completed: BTreeSet<ProgramUnitId>,
    cached: usize,
    changed: BTreeSet<String>,
    failures: Vec<UnitFailure>,
    rounds: usize,
    /// Latest diagnostics per unit; later rounds replace earlier ones.
    diagnostics: BTreeMap<ProgramUnitId, Vec<Diagnostic>>,
}

impl Tally {
    fn record(&mut self, graph: &CallGraph, id: ProgramUnitId, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Done(done) => {
                self.completed.insert(id);
                if done.cached {
                    self.cached += 1;
                }
                if done.changed {
                    self.changed.insert(graph.unit(id).qualified_name());
                }
                self.diagnostics.insert(id, done.diagnostics);
            }
            UnitOutcome::Failed(failure) => {
                self.completed.insert(id);
                self.failures.push(failure);
            }
            UnitOutcome::Skipped | UnitOutcome::TimedOut => {}
        }
    }
}

struct RunState<'r> {
    pass: &'r dyn Pass,
    graph: &'r CallGraph,
    modules: &'r ModuleTable,
    sources: HashMap<SourceId, SharedUnit>,
    cache: &'r PassCache,
    summaries: Mutex<HashMap<ProgramUnitId, serde_json::Value>>,
    abort: AtomicBool,
    timed_out: AtomicBool,
    executed: AtomicUsize,
    deadline: Option<Instant>,
}

impl RunState<'_> {
    fn stopped(&self) -> bool {
        self.abort.load(Ordering::SeqCst) || self.timed_out.load(Ordering::SeqCst)
    }

    fn dependency_summaries(&self, id: ProgramUnitId) -> Vec<DependencySummary> {
        let neighbors = match self.pass.order() {
            ExecutionOrder::CalleeFirst => self.graph.callees(id),
            ExecutionOrder::CallerFirst => self.graph.callers(id),
            ExecutionOrder::Independent => Vec::new(),
        };
        let summaries = self.summaries.lock();
        neighbors
            .into_iter()
            .filter(|&n| n != id)
            .filter_map(|n| {
                summaries.get(&n).map(|s| DependencySummary {
                    unit: self.graph.unit(n).clone(),
                    summary: s.clone(),
                })
            })
            .collect()
    }

    fn run_unit(&self, id: ProgramUnitId, round: usize) -> UnitOutcome {
        if self.abort.load(Ordering::SeqCst) {
            return UnitOutcome::Skipped;
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            self.timed_out.store(true, Ordering::SeqCst);
            return UnitOutcome::TimedOut;
        }
        let info = self.graph.unit(id);
        let Some(shared) = self.sources.get(&info.key.source) else {
            return UnitOutcome::Skipped;
        };
        // Units of one source share an arena; the lock serializes them.
        let mut guard = shared.lock();
        let unit: &mut SourceUnit = &mut guard;
        let Some(node) = info.key.path.resolve(&unit.arena, unit.root) else {
            warn!(pass = self.pass.name(), unit = %info.qualified_name(), "unit vanished before it was processed");
            return UnitOutcome::Skipped;
        };

        let dependencies = self.dependency_summaries(id);
        let key = CacheKey {
            unit: info.key.clone(),
            pass: self.pass.name().to_string(),
            input: fingerprint(&unit.arena, node),
            context: context_hash(&self.pass.options_key(), &dependencies),
        };
        let slot = self.cache.slot(&key);
        let mut slot_guard = slot.lock();
        let existing = slot_guard.clone();
        let allocated = unit.arena.len();
        let (entry, cached) = match existing {
            Some(entry) => {
                self.cache.record_hit();
                (entry, true)
            }
            None => {
                self.cache.record_miss();
                self.executed.fetch_add(1, Ordering::SeqCst);
                match self.execute(unit, info, node, &key, dependencies, round) {
                    Ok(entry) => {
                        *slot_guard = Some(entry.clone());
                        (entry, false)
                    }
                    Err(error) => {
                        if unit.arena.len() > allocated {
                            unit.arena.relink(node);
                        }
                        return self.failed(info.qualified_name(), error);
                    }
                }
            }
        };
        drop(slot_guard);

        let changed = commit(unit, &info.key.path, node, &entry, self.modules);
        if changed {
            let evicted = self.cache.evict_stale(&info.key, &entry.output_fingerprint, &key);
            if evicted > 0 {
                debug!(unit = %info.qualified_name(), evicted, "evicted stale cache entries");
            }
        } else if unit.arena.len() > allocated {
            // Whatever the pass built is dropped; the unit stays live.
            unit.arena.relink(node);
        }
        if let Some(summary) = &entry.summary {
            self.summaries.lock().insert(id, summary.clone());
        }
        debug!(
            pass = self.pass.name(),
            unit = %info.qualified_name(),
            round,
            cached,
            changed,
            "processed unit"
        );
        UnitOutcome::Done(Done {
            changed,
            cached,
            fingerprint: entry.output_fingerprint,
            summary: entry.summary,
            diagnostics: entry.diagnostics,
        })
    }

    fn execute(
        &self,
        unit: &mut SourceUnit,
        info: &UnitInfo,
        node: NodeId,
        key: &CacheKey,
        dependencies: Vec<DependencySummary>,
        round: usize,
    ) -> Result<CacheEntry, TransformError> {
        let SourceUnit {
            arena, scopes, text, ..
        } = unit;
        let mut cx = PassContext {
            unit: info,
            node,
            arena,
            scopes,
            text: text.as_str(),
            dependencies,
            round,
        };
        let output = self.pass.run(&mut cx)?;

        let replacement = output.replacement.filter(|&r| r != node);
        if let Some(new) = replacement {
            let ty = unit.arena.node_type(new);
            if !ty.is_program_unit() {
                return Err(TransformError::UnitKindMismatch {
                    pass: self.pass.name().to_string(),
                    unit: info.qualified_name(),
                    found: ty.to_string(),
                });
            }
        }
        for &added in &output.added {
            let ty = unit.arena.node_type(added);
            if !ty.is_program_unit() {
                return Err(TransformError::UnitKindMismatch {
                    pass: self.pass.name().to_string(),
                    unit: info.qualified_name(),
                    found: ty.to_string(),
                });
            }
        }
        let output_fingerprint = match replacement {
            Some(new) => fingerprint(&unit.arena, new),
            None => key.input.clone(),
        };
        Ok(CacheEntry {
            output: replacement,
            output_fingerprint,
            diagnostics: output.diagnostics,
            summary: output.summary,
            added: output.added,
        })
    }

    fn failed(&self, unit: String, error: TransformError) -> UnitOutcome {
        let fatal = self.pass.fatal_on_error();
        warn!(pass = self.pass.name(), unit = %unit, error = %error, fatal, "pass failed on unit");
        if fatal {
            self.abort.store(true, Ordering::SeqCst);
        }
        UnitOutcome::Failed(UnitFailure {
            pass: self.pass.name().to_string(),
            unit,
            error,
        })
    }
}

/// Hash of the pass options and the dependency summaries a unit saw.
fn context_hash(options: &str, dependencies: &[DependencySummary]) -> ContentHash {
    let rendered: Vec<String> = dependencies
        .iter()
        .map(|d| format!("{}={}", d.unit.key, d.summary))
        .collect();
    let joined = rendered.join("\n");
    ContentHash::compute_parts([options.as_bytes(), joined.as_bytes()])
}

/// Apply a pass result to the unit at `path`. Returns whether the tree
/// changed.
fn commit(unit: &mut SourceUnit, path: &ItemPath, old: NodeId, entry: &CacheEntry, modules: &ModuleTable) -> bool {
    let replaced = match entry.output {
        Some(new) if new != old => install(unit, path, old, new, modules),
        _ => false,
    };
    let appended = !entry.added.is_empty() && append_units(unit, path, &entry.added, modules);
    replaced || appended
}

/// Install `new` in place of the unit at `path` and re-resolve the affected
/// scopes.
fn install(unit: &mut SourceUnit, path: &ItemPath, old: NodeId, new: NodeId, modules: &ModuleTable) -> bool {
    let Some(replacement) = replace_at_path(&mut unit.arena, unit.root, path, new) else {
        return false;
    };
    unit.root = replacement.root;
    // A cached output may share children with trees built since.
    unit.arena.relink(new);
    let file = unit.file_name();
    let SourceUnit {
        id,
        arena,
        text,
        scopes,
        ..
    } = unit;
    if !scopes.is_empty() {
        let resolver = Resolver::new(arena, text, file, *id, modules);
        resolver.reresolve(scopes, old, new);
        for (old_ancestor, new_ancestor) in &replacement.rebuilt {
            scopes.remap_owner(*old_ancestor, *new_ancestor);
        }
    }
    true
}

/// Append `added` to the program unit list holding the unit at `path`,
/// skipping names already taken there, and re-resolve the rebuilt list owner.
fn append_units(unit: &mut SourceUnit, path: &ItemPath, added: &[NodeId], modules: &ModuleTable) -> bool {
    let Some((_, owner_path)) = path.0.split_last() else {
        return false;
    };
    let owner_path = ItemPath(owner_path.to_vec());
    let Some(owner) = owner_path.resolve(&unit.arena, unit.root) else {
        return false;
    };
    let mut kind = unit.arena.kind(owner).clone();
    let list = match &mut kind {
        NodeKind::File { items } => items,
        NodeKind::Module { routines, .. } | NodeKind::Routine { routines, .. } => routines,
        _ => return false,
    };
    let mut appended = false;
    for &new in added {
        let Some(name) = unit.arena.kind(new).unit_name() else {
            continue;
        };
        let taken = list.iter().any(|&item| {
            unit.arena
                .kind(item)
                .unit_name()
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
        });
        if !taken {
            list.push(new);
            appended = true;
        }
    }
    if !appended {
        return false;
    }

    let data = unit.arena.node(owner);
    let (head, tail, parent) = (data.head, data.tail, data.parent);
    let fresh = unit.arena.alloc_container(kind, None, head, tail);
    unit.arena.set_parent(fresh, parent);
    unit.arena.derive(fresh, owner);
    let rebuilt = if owner_path.0.is_empty() {
        unit.root = fresh;
        Vec::new()
    } else {
        let Some(replacement) = replace_at_path(&mut unit.arena, unit.root, &owner_path, fresh) else {
            unit.arena.relink(unit.root);
            return false;
        };
        unit.root = replacement.root;
        replacement.rebuilt
    };
    unit.arena.relink(fresh);

    let file = unit.file_name();
    let SourceUnit {
        id,
        arena,
        text,
        scopes,
        ..
    } = unit;
    if !scopes.is_empty() {
        let resolver = Resolver::new(arena, text, file, *id, modules);
        resolver.reresolve(scopes, owner, fresh);
        for (old_ancestor, new_ancestor) in &rebuilt {
            scopes.remap_owner(*old_ancestor, *new_ancestor);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callgraph::UnitKind;
    use crate::ir::{Arena, NodeKind, RoutineKind};
    use crate::scheduler::PassOutput;
    use std::time::Duration;

    fn routine(arena: &mut Arena, name: &str, calls: &[&str]) -> NodeId {
        let body = calls
            .iter()
            .map(|c| {
                arena.alloc(NodeKind::Call {
                    name: c.to_string(),
                    args: vec![],
                })
            })
            .collect();
        arena.alloc(NodeKind::Routine {
            name: name.into(),
            kind: RoutineKind::Subroutine,
            prefixes: vec![],
            params: vec![],
            spec: vec![],
            body,
            routines: vec![],
        })
    }

    /// One source with the given routines and their calls.
    fn source(routines: &[(&str, &[&str])]) -> Vec<SharedUnit> {
        let mut arena = Arena::new();
        let items = routines
            .iter()
            .map(|(name, calls)| routine(&mut arena, name, calls))
            .collect();
        let root = arena.alloc(NodeKind::File { items });
        vec![SourceUnit::new(SourceId(0), "t.f90", "", "test", arena, root).into_shared()]
    }

    struct Recorder {
        order: ExecutionOrder,
        seen: Mutex<Vec<String>>,
        /// Publish the round number, so cycles never settle.
        restless: bool,
        fail_on: Option<&'static str>,
        fatal: bool,
    }

    impl Recorder {
        fn new(order: ExecutionOrder) -> Self {
            Recorder {
                order,
                seen: Mutex::new(Vec::new()),
                restless: false,
                fail_on: None,
                fatal: false,
            }
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().clone()
        }
    }

    impl Pass for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn order(&self) -> ExecutionOrder {
            self.order
        }

        fn unit_kinds(&self) -> &[UnitKind] {
            UnitKind::ALL
        }

        fn fatal_on_error(&self) -> bool {
            self.fatal
        }

        fn run(&self, cx: &mut PassContext<'_>) -> Result<PassOutput, TransformError> {
            self.seen.lock().push(cx.unit.name.clone());
            if self.fail_on == Some(cx.unit.name.as_str()) {
                return Err(cx.fail("recorder", "refused"));
            }
            let summary = if self.restless {
                serde_json::json!({ "round": cx.round })
            } else {
                serde_json::json!({ "deps": cx.dependencies.len() })
            };
            Ok(PassOutput::unchanged().with_summary(summary))
        }
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(SchedulerConfig::default().with_workers(2)).unwrap()
    }

    fn position(seen: &[String], name: &str) -> usize {
        seen.iter().position(|s| s == name).unwrap()
    }

    #[test]
    fn callee_first_runs_callees_before_callers() {
        let units = source(&[("main", &["a", "c"]), ("a", &["b"]), ("b", &[]), ("c", &["b"])]);
        let pass = Recorder::new(ExecutionOrder::CalleeFirst);
        let report = scheduler().run(&pass, &units).unwrap();
        let seen = pass.seen();
        assert_eq!(seen.len(), 4);
        assert!(position(&seen, "b") < position(&seen, "a"));
        assert!(position(&seen, "b") < position(&seen, "c"));
        assert!(position(&seen, "a") < position(&seen, "main"));
        assert!(position(&seen, "c") < position(&seen, "main"));
        assert_eq!(report.units, 4);
        assert_eq!(report.executed, 4);
        // Callers see their callees' summaries.
        assert_eq!(report.summaries["main"], serde_json::json!({ "deps": 2 }));
    }

    #[test]
    fn caller_first_runs_callers_before_callees() {
        let units = source(&[("main", &["a"]), ("a", &["b"]), ("b", &[])]);
        let pass = Recorder::new(ExecutionOrder::CallerFirst);
        scheduler().run(&pass, &units).unwrap();
        assert_eq!(pass.seen(), vec!["main", "a", "b"]);
    }

    #[test]
    fn mutual_recursion_converges() {
        let units = source(&[("a", &["b"]), ("b", &["a"])]);
        let pass = Recorder::new(ExecutionOrder::CalleeFirst);
        let report = scheduler().run(&pass, &units).unwrap();
        // Round 2 changes a's summary (it now sees b), round 3 is served
        // from the cache and matches round 2.
        assert_eq!(report.rounds, 3);
        assert_eq!(pass.seen(), vec!["a", "b", "a", "b"]);
        assert_eq!(report.summaries["a"], serde_json::json!({ "deps": 1 }));
    }

    #[test]
    fn mutual_recursion_without_fixed_point_fails_deterministically() {
        let run = || {
            let units = source(&[("a", &["b"]), ("b", &["a"])]);
            let mut pass = Recorder::new(ExecutionOrder::CalleeFirst);
            pass.restless = true;
            let sched = Scheduler::new(SchedulerConfig::default().with_max_rounds(3)).unwrap();
            sched.run(&pass, &units).unwrap_err()
        };
        let first = run();
        assert_eq!(
            first,
            SchedulingError::NotConverged {
                pass: "recorder".into(),
                units: vec!["a".into(), "b".into()],
                rounds: 3,
                failures: Vec::new(),
            }
        );
        assert_eq!(run(), first);
    }

    #[test]
    fn stopped_cycle_keeps_earlier_unit_failures() {
        let units = source(&[("a", &["b"]), ("b", &["a"]), ("c", &[])]);
        let mut pass = Recorder::new(ExecutionOrder::CalleeFirst);
        pass.restless = true;
        pass.fail_on = Some("c");
        let sched = Scheduler::new(SchedulerConfig::default().with_max_rounds(2)).unwrap();
        let err = sched.run(&pass, &units).unwrap_err();
        assert!(matches!(err, SchedulingError::NotConverged { .. }), "{err:?}");
        let failures = err.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].unit, "c");
    }

    #[test]
    fn unit_failures_do_not_stop_the_run() {
        let units = source(&[("a", &[]), ("b", &[]), ("c", &[])]);
        let mut pass = Recorder::new(ExecutionOrder::Independent);
        pass.fail_on = Some("b");
        let report = scheduler().run(&pass, &units).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].unit, "b");
        assert_eq!(pass.seen().len(), 3);
    }

    /// Removes every call of the unit, then either fails or reports no
    /// change, so the rewritten tree is never committed.
    struct DiscardRewrite {
        fail: bool,
    }

    struct DropCalls;

    impl crate::visit::Transformer for DropCalls {
        fn filter(&self) -> crate::visit::NodeFilter {
            crate::visit::NodeFilter::only(&[crate::ir::NodeType::Call])
        }

        fn transform(
            &mut self,
            _arena: &mut Arena,
            _node: NodeId,
            _original: NodeId,
        ) -> Result<crate::visit::Transform, TransformError> {
            Ok(crate::visit::Transform::Remove)
        }
    }

    impl Pass for DiscardRewrite {
        fn name(&self) -> &str {
            "discard"
        }

        fn run(&self, cx: &mut PassContext<'_>) -> Result<PassOutput, TransformError> {
            cx.rewrite(&mut DropCalls)?;
            if self.fail {
                Err(cx.fail("discard", "refused"))
            } else {
                Ok(PassOutput::unchanged())
            }
        }
    }

    struct StripCalls;

    impl Pass for StripCalls {
        fn name(&self) -> &str {
            "strip"
        }

        fn run(&self, cx: &mut PassContext<'_>) -> Result<PassOutput, TransformError> {
            Ok(PassOutput::replaced(cx.rewrite(&mut DropCalls)?))
        }
    }

    /// Appends a copy of `a` named `a_twin`.
    struct Twin;

    impl Pass for Twin {
        fn name(&self) -> &str {
            "twin"
        }

        fn run(&self, cx: &mut PassContext<'_>) -> Result<PassOutput, TransformError> {
            if cx.unit.name != "a" {
                return Ok(PassOutput::unchanged());
            }
            let copy = cx.arena.deep_copy(cx.node)?;
            let mut kind = cx.arena.kind(copy).clone();
            if let NodeKind::Routine { name, .. } = &mut kind {
                *name = "a_twin".into();
            }
            let twin = cx.arena.alloc(kind);
            Ok(PassOutput::unchanged().with_added(vec![twin]))
        }

        fn plan(&self, cx: &PlanContext<'_>) -> crate::scheduler::DependencyChanges {
            crate::scheduler::DependencyChanges {
                added: cx
                    .called_names()
                    .filter(|n| *n == "a")
                    .map(|_| "a_twin".to_string())
                    .collect(),
                removed: cx.unresolved.iter().map(|n| n.to_string()).collect(),
            }
        }
    }

    fn item_names(units: &[SharedUnit]) -> Vec<String> {
        let unit = units[0].lock();
        let NodeKind::File { items } = unit.arena.kind(unit.root) else {
            panic!("not a file");
        };
        for &item in items {
            assert_eq!(unit.arena.parent(item), Some(unit.root));
        }
        items
            .iter()
            .filter_map(|&i| unit.arena.kind(i).unit_name().map(str::to_string))
            .collect()
    }

    fn assert_body_parents(units: &[SharedUnit]) {
        let unit = units[0].lock();
        let NodeKind::File { items } = unit.arena.kind(unit.root) else {
            panic!("not a file");
        };
        let routine = items[0];
        let NodeKind::Routine { body, .. } = unit.arena.kind(routine) else {
            panic!("not a routine");
        };
        assert_eq!(body.len(), 2);
        for &stmt in body {
            assert_eq!(unit.arena.parent(stmt), Some(routine));
        }
        assert_eq!(unit.arena.previous_sibling(body[1]), Some(body[0]));
    }

    #[test]
    fn failed_unit_keeps_its_tree_linked() {
        let units = source(&[("a", &["x", "y"])]);
        let report = scheduler().run(&DiscardRewrite { fail: true }, &units).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(report.changed.is_empty());
        assert_body_parents(&units);
    }

    #[test]
    fn discarded_rewrite_keeps_the_tree_linked() {
        let units = source(&[("a", &["x", "y"])]);
        let report = scheduler().run(&DiscardRewrite { fail: false }, &units).unwrap();
        assert!(report.is_clean());
        assert!(report.changed.is_empty());
        assert_body_parents(&units);
    }

    #[test]
    fn fatal_failures_abort() {
        let units = source(&[("main", &["leaf"]), ("leaf", &[])]);
        let mut pass = Recorder::new(ExecutionOrder::CalleeFirst);
        pass.fail_on = Some("leaf");
        pass.fatal = true;
        let err = scheduler().run(&pass, &units).unwrap_err();
        match err {
            SchedulingError::Aborted { first, .. } => assert_eq!(first.unit, "leaf"),
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(pass.seen(), vec!["leaf"]);
    }

    #[test]
    fn timeout_reports_incomplete_units() {
        let units = source(&[("a", &[]), ("b", &[])]);
        let pass = Recorder::new(ExecutionOrder::Independent);
        let sched = Scheduler::new(SchedulerConfig::default().with_timeout(Duration::ZERO)).unwrap();
        match sched.run(&pass, &units).unwrap_err() {
            SchedulingError::Timeout {
                completed,
                incomplete,
                failures,
                ..
            } => {
                assert_eq!(completed, 0);
                assert_eq!(incomplete, vec!["a", "b"]);
                assert!(failures.is_empty());
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn second_run_is_served_from_cache() {
        let units = source(&[("main", &["a"]), ("a", &[])]);
        let sched = scheduler();
        let pass = Recorder::new(ExecutionOrder::CalleeFirst);
        let first = sched.run(&pass, &units).unwrap();
        assert_eq!((first.executed, first.cached), (2, 0));
        let second = sched.run(&pass, &units).unwrap();
        assert_eq!((second.executed, second.cached), (0, 2));
        assert_eq!(pass.seen().len(), 2);
    }

    #[test]
    fn rewritten_unit_evicts_its_stale_entries() {
        let units = source(&[("main", &[]), ("a", &["x"])]);
        let sched = scheduler();
        let recorder = Recorder::new(ExecutionOrder::Independent);
        sched.run(&recorder, &units).unwrap();
        assert_eq!(sched.cache().stats().entries, 2);

        let report = sched.run(&StripCalls, &units).unwrap();
        assert_eq!(report.changed.len(), 1);
        // The recorder entry for the old `a` is gone; `main` is untouched.
        assert_eq!(sched.cache().stats().entries, 3);

        let again = sched.run(&recorder, &units).unwrap();
        assert_eq!((again.executed, again.cached), (1, 1));
    }

    #[test]
    fn added_units_are_appended_once() {
        let units = source(&[("main", &["a"]), ("a", &["x"])]);
        let sched = scheduler();
        let report = sched.run(&Twin, &units).unwrap();
        assert_eq!(report.changed, vec!["a"]);
        assert_eq!(item_names(&units), vec!["main", "a", "a_twin"]);

        // The replayed entry finds the name taken.
        let again = sched.run(&Twin, &units).unwrap();
        assert_eq!(again.units, 3);
        assert!(again.changed.is_empty());
        assert_eq!(item_names(&units), vec!["main", "a", "a_twin"]);
    }

    #[test]
    fn plan_lists_stages_and_changes_without_running() {
        let units = source(&[("main", &["a", "missing"]), ("a", &[])]);
        let before = units[0].lock().arena.len();
        let plan = scheduler().plan(&Twin, &units);
        assert_eq!(plan.pass, "twin");
        assert_eq!(plan.stages, vec![vec!["main".to_string(), "a".to_string()]]);
        assert_eq!(plan.changes.len(), 1);
        let main = &plan.changes["main"];
        assert_eq!(main.added, vec!["a_twin"]);
        assert_eq!(main.removed, vec!["missing"]);
        assert_eq!(units[0].lock().arena.len(), before);
        assert_eq!(item_names(&units), vec!["main", "a"]);
    }

    #[test]
    fn plan_follows_the_pass_order() {
        let units = source(&[("main", &["a"]), ("a", &["b"]), ("b", &[])]);
        let plan = scheduler().plan(&Recorder::new(ExecutionOrder::CalleeFirst), &units);
        assert_eq!(plan.stages, vec![vec!["b"], vec!["a"], vec!["main"]]);
        assert!(plan.changes.is_empty());
    }

    #[test]
    fn roots_limit_the_run() {
        let units = source(&[("main", &["a"]), ("a", &[]), ("other", &[])]);
        let config = SchedulerConfig::default().with_graph(crate::callgraph::GraphOptions {
            roots: vec!["main".into()],
            expand: true,
            ..Default::default()
        });
        let pass = Recorder::new(ExecutionOrder::CalleeFirst);
        Scheduler::new(config).unwrap().run(&pass, &units).unwrap();
        assert_eq!(pass.seen(), vec!["a", "main"]);
    }
}
