//! The session: the only stateful entry point.
//!
//! A session owns everything a run needs: configuration, source units,
//! pass and rule registries, the scheduler with its worker pool and cache,
//! and the process limiter for the external frontend. Nothing is global;
//! dropping the session releases all of it.
//!
//! A full run is discover, load, passes, lint, regenerate, write:
//!
//! ```no_run
//! use std::path::Path;
//! use refit::session::Session;
//!
//! let mut session = Session::open(Path::new("src")).unwrap();
//! let summary = session.run().unwrap();
//! std::process::exit(summary.exit_code().code() as i32);
//! ```
//!
//! Each stage is also callable on its own.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use refit_core::lint::{
    render_diagnostics, Diagnostic, LintEngine, Rule, RuleRegistry, Severity,
};
use refit_core::passes::builtin_registry;
use refit_core::scheduler::{
    FatalPass, Pass, PassFactory, PassPlan, PassRegistry, ProcessLimiter, RunReport, Scheduler,
};
use refit_core::symbols::{resolve_unit, ModuleTable};
use refit_core::types::format_timestamp;
use refit_core::{ParseError, SchedulingError, SharedUnit, SourceId, SourceUnit};
use refit_fortran::{parse_source, regenerate, regenerate_checked, FrontendOptions};

use crate::config::{ConfigError, PassConfig, SessionConfig, SourceFilter};
use crate::error::RefitError;
use crate::report::SessionSummary;

/// Regenerated text of one source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOutput {
    pub path: PathBuf,
    pub text: String,
    /// Whether the text differs from what was read.
    pub changed: bool,
}

pub struct Session {
    root: PathBuf,
    config: SessionConfig,
    filter: SourceFilter,
    frontend_options: FrontendOptions,
    passes: PassRegistry,
    rules: RuleRegistry,
    scheduler: Scheduler,
    pool: rayon::ThreadPool,
    units: Vec<SharedUnit>,
    next_id: u32,
    summary: SessionSummary,
}

impl Session {
    /// Create a session rooted at `root`.
    ///
    /// Globs and the external frontend setup are checked here; pass and
    /// rule names are checked when they are used, so that plugins can be
    /// registered first.
    pub fn new(root: impl Into<PathBuf>, config: SessionConfig) -> Result<Self, RefitError> {
        let root = root.into();
        let filter = SourceFilter::new(&config)?;
        if config.uses_external() && config.external.command.is_none() {
            return Err(ConfigError::MissingCommand.into());
        }
        let limiter = ProcessLimiter::new(config.scheduler.max_processes.max(1));
        let frontend_options = config.frontend_options(&root).with_limiter(limiter);
        let scheduler = Scheduler::new(config.scheduler.clone())?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.scheduler.workers)
            .thread_name(|i| format!("refit-parse-{}", i))
            .build()
            .map_err(|e| RefitError::internal(format!("failed to start parse pool: {}", e)))?;
        debug!(
            root = %root.display(),
            frontend = %config.frontend.0,
            workers = scheduler.workers(),
            passes = config.passes.len(),
            "session created"
        );
        Ok(Session {
            root,
            config,
            filter,
            frontend_options,
            passes: builtin_registry(),
            rules: RuleRegistry::builtin(),
            scheduler,
            pool,
            units: Vec::new(),
            next_id: 0,
            summary: SessionSummary::default(),
        })
    }

    /// Create a session from `refit.toml` in `root`, or from defaults.
    pub fn open(root: &Path) -> Result<Self, RefitError> {
        let config = SessionConfig::discover(root)?;
        Self::new(root, config)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn units(&self) -> &[SharedUnit] {
        &self.units
    }

    pub fn summary(&self) -> &SessionSummary {
        &self.summary
    }

    /// Add a pass to the registry; a pass of the same name is replaced.
    pub fn register_pass(&mut self, name: impl Into<String>, factory: PassFactory) {
        self.passes.register(name, factory);
    }

    pub fn register_rule(&mut self, rule: Arc<dyn Rule>) {
        self.rules.register(rule);
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Source files under the root, relative to it, in sorted order.
    pub fn discover(&self) -> Result<Vec<PathBuf>, RefitError> {
        let mut found = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                RefitError::io(path.display(), e)
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            if self.filter.matches(relative) {
                found.push(relative.to_path_buf());
            }
        }
        found.sort();
        debug!(root = %self.root.display(), files = found.len(), "discovered sources");
        Ok(found)
    }

    /// Read and parse files given relative to the root.
    ///
    /// A file that is not valid UTF-8 is recorded as a parse error and left
    /// out; an unreadable file is an error.
    pub fn load_files(&mut self, paths: &[PathBuf]) -> Result<(), RefitError> {
        let mut sources = Vec::with_capacity(paths.len());
        for path in paths {
            let full = self.root.join(path);
            let bytes = fs::read(&full).map_err(|e| RefitError::io(full.display(), e))?;
            match String::from_utf8(bytes) {
                Ok(text) => sources.push((path.clone(), text)),
                Err(err) => {
                    let frontend = self.filter.frontend_for(path);
                    let err = undecodable(path, frontend.name(), err.as_bytes(), err.utf8_error().valid_up_to());
                    warn!(file = %err.file, line = ?err.line, "{}", err.message);
                    self.summary.files += 1;
                    self.summary.parse_errors.push(err);
                }
            }
        }
        self.load_sources(sources);
        Ok(())
    }

    /// Parse in-memory sources, then resolve the whole session again.
    ///
    /// Files that fail to parse are left out and recorded in the summary.
    pub fn load_sources(&mut self, sources: Vec<(PathBuf, String)>) {
        let started = Instant::now();
        let first = self.next_id;
        self.next_id += sources.len() as u32;
        self.summary.files += sources.len();

        let filter = &self.filter;
        let options = &self.frontend_options;
        let parsed: Vec<Result<SourceUnit, ParseError>> = self.pool.install(|| {
            sources
                .into_par_iter()
                .enumerate()
                .map(|(i, (path, text))| {
                    let frontend = filter.frontend_for(&path);
                    let mut unit = parse_source(frontend, options, &path, &text)?;
                    unit.id = SourceId(first + i as u32);
                    Ok(unit)
                })
                .collect()
        });

        for result in parsed {
            match result {
                Ok(unit) => {
                    self.summary.parsed += 1;
                    self.units.push(unit.into_shared());
                }
                Err(err) => {
                    warn!(file = %err.file, frontend = %err.frontend, line = ?err.line, "{}", err.message);
                    self.summary.parse_errors.push(err);
                }
            }
        }
        self.resolve();
        info!(
            files = self.summary.files,
            parsed = self.summary.parsed,
            errors = self.summary.parse_errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sources loaded"
        );
    }

    /// Add one in-memory source.
    pub fn add_source(&mut self, path: impl Into<PathBuf>, text: impl Into<String>) {
        self.load_sources(vec![(path.into(), text.into())]);
    }

    /// Rebuild the module table and resolve every unit against it.
    pub fn resolve(&mut self) {
        let modules = {
            let guards: Vec<_> = self.units.iter().map(|u| u.lock()).collect();
            ModuleTable::build(guards.iter().map(|g| &**g))
        };
        let units = &self.units;
        let mut warnings: Vec<_> = self.pool.install(|| {
            units
                .par_iter()
                .flat_map_iter(|unit| resolve_unit(&mut unit.lock(), &modules))
                .collect()
        });
        warnings.sort_by(|a, b| (&a.file, a.line, &a.name).cmp(&(&b.file, b.line, &b.name)));
        for warning in &warnings {
            debug!(%warning, "unresolved reference");
        }
        self.summary.warnings = warnings;
    }

    // ========================================================================
    // Passes
    // ========================================================================

    /// Instantiate a configured pass.
    pub fn create_pass(&self, pass: &PassConfig) -> Result<Arc<dyn Pass>, ConfigError> {
        let created = self
            .passes
            .create(&pass.name, &pass.options)
            .ok_or_else(|| ConfigError::UnknownPass {
                name: pass.name.clone(),
                known: self.passes.names().collect::<Vec<_>>().join(", "),
            })?
            .map_err(|e| ConfigError::PassOptions {
                name: pass.name.clone(),
                message: e.to_string(),
            })?;
        Ok(if pass.fatal {
            Arc::new(FatalPass(created))
        } else {
            created
        })
    }

    /// Run one pass over every unit.
    pub fn run_pass(&mut self, pass: &dyn Pass) -> Result<RunReport, SchedulingError> {
        match self.scheduler.run(pass, &self.units) {
            Ok(report) => {
                for failure in &report.failures {
                    warn!(%failure, "unit failed");
                }
                self.summary.diagnostics.extend(report.diagnostics.iter().cloned());
                self.summary.passes.push(report.clone());
                Ok(report)
            }
            Err(err) => {
                for failure in err.failures() {
                    warn!(%failure, "unit failed");
                }
                warn!(error = %err, "pass stopped");
                self.summary.scheduling_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Run the configured pass list in order. Stops at the first scheduling
    /// error; changes committed before it stay in place.
    pub fn run_passes(&mut self) -> Result<Vec<RunReport>, RefitError> {
        let passes = self
            .config
            .passes
            .iter()
            .map(|p| self.create_pass(p))
            .collect::<Result<Vec<_>, _>>()?;
        let mut reports = Vec::with_capacity(passes.len());
        for pass in passes {
            reports.push(self.run_pass(pass.as_ref())?);
        }
        Ok(reports)
    }

    /// Plan the configured pass list without running it. Every plan sees the
    /// units as loaded, since no earlier pass is applied.
    pub fn plan_passes(&mut self) -> Result<Vec<PassPlan>, RefitError> {
        let passes = self
            .config
            .passes
            .iter()
            .map(|p| self.create_pass(p))
            .collect::<Result<Vec<_>, _>>()?;
        let plans: Vec<PassPlan> = passes
            .iter()
            .map(|pass| self.scheduler.plan(pass.as_ref(), &self.units))
            .collect();
        self.summary.plans.extend(plans.iter().cloned());
        Ok(plans)
    }

    // ========================================================================
    // Lint
    // ========================================================================

    /// Check every unit against the configured rules.
    pub fn lint(&mut self) -> Result<Vec<Diagnostic>, RefitError> {
        let engine = LintEngine::new(&self.rules, &self.config.rule_settings())?;
        let units = &self.units;
        let reports: Vec<_> = self
            .pool
            .install(|| units.par_iter().map(|u| engine.check_unit(&u.lock())).collect());
        let mut diagnostics = Vec::new();
        for report in reports {
            self.summary.suppressed += report.suppressed;
            diagnostics.extend(report.diagnostics);
        }
        diagnostics.sort_by(|a, b| {
            (&a.file, a.line, &a.rule_id).cmp(&(&b.file, b.line, &b.rule_id))
        });
        info!(
            diagnostics = diagnostics.len(),
            suppressed = self.summary.suppressed,
            "lint finished"
        );
        self.summary.diagnostics.extend(diagnostics.iter().cloned());
        Ok(diagnostics)
    }

    /// Diagnostics with source excerpts, grouped by file.
    pub fn render_diagnostics(&self, diagnostics: &[Diagnostic], styled: bool) -> String {
        let mut out = Vec::new();
        for unit in &self.units {
            let unit = unit.lock();
            let file = unit.file_name();
            let own: Vec<Diagnostic> = diagnostics
                .iter()
                .filter(|d| d.file == file)
                .cloned()
                .collect();
            if !own.is_empty() {
                out.push(render_diagnostics(&own, &unit.text, styled));
            }
        }
        out.join("\n\n")
    }

    // ========================================================================
    // Output
    // ========================================================================

    /// Text of every unit after the passes. Text that fails the round-trip
    /// check is replaced by the original and the failure recorded.
    pub fn regenerate(&mut self) -> Vec<FileOutput> {
        let verify = self.config.verify.0;
        let options = &self.frontend_options;
        let units = &self.units;
        let results: Vec<_> = self.pool.install(|| {
            units
                .par_iter()
                .map(|unit| {
                    let unit = unit.lock();
                    let result = if verify {
                        regenerate_checked(&unit, options)
                    } else {
                        Ok(regenerate(&unit))
                    };
                    (unit.path.clone(), unit.text.clone(), result)
                })
                .collect()
        });

        let mut outputs = Vec::with_capacity(results.len());
        for (path, original, result) in results {
            let text = match result {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "keeping original text");
                    self.summary.regeneration_errors.push(err);
                    original.clone()
                }
            };
            let changed = text != original;
            if changed {
                self.summary.changed.push(path.display().to_string());
            }
            outputs.push(FileOutput {
                path,
                text,
                changed,
            });
        }
        outputs
    }

    /// Write changed outputs back, relative to the root.
    pub fn write(&mut self, outputs: &[FileOutput]) -> Result<(), RefitError> {
        for output in outputs.iter().filter(|o| o.changed) {
            let full = self.root.join(&output.path);
            fs::write(&full, &output.text).map_err(|e| RefitError::io(full.display(), e))?;
            debug!(file = %full.display(), bytes = output.text.len(), "wrote file");
            self.summary.written.push(output.path.display().to_string());
        }
        Ok(())
    }

    /// Discover, load, transform, lint and regenerate; write back when
    /// configured and no pass was stopped. With `plan` set the passes are
    /// only planned, so nothing changes.
    ///
    /// Configuration problems and I/O failures are errors; everything else
    /// is recorded in the returned summary.
    pub fn run(&mut self) -> Result<SessionSummary, RefitError> {
        let started = Instant::now();
        self.summary.started_at = format_timestamp(SystemTime::now());

        let files = self.discover()?;
        self.load_files(&files)?;
        if self.config.plan {
            self.plan_passes()?;
        } else {
            match self.run_passes() {
                Ok(_) | Err(RefitError::Scheduling(_)) => {}
                Err(other) => return Err(other),
            }
        }
        self.lint()?;
        let outputs = self.regenerate();
        if self.config.write && self.summary.scheduling_error.is_none() {
            self.write(&outputs)?;
        }

        self.summary.finished_at = format_timestamp(SystemTime::now());
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            errors = self.summary.count_at_least(Severity::Error),
            exit_code = self.summary.exit_code().code(),
            "{}",
            self.summary.headline()
        );
        Ok(self.summary.clone())
    }
}

/// Parse error for text that is not UTF-8, positioned at the first bad byte.
fn undecodable(path: &Path, frontend: &str, bytes: &[u8], valid_up_to: usize) -> ParseError {
    let valid = &bytes[..valid_up_to];
    let line = valid.iter().filter(|&&b| b == b'\n').count() as u32 + 1;
    let line_start = valid.iter().rposition(|&b| b == b'\n').map_or(0, |p| p + 1);
    let column = (valid_up_to - line_start) as u32 + 1;
    ParseError::new(
        path.display().to_string(),
        frontend,
        format!("not valid UTF-8 (byte 0x{:02x})", bytes[valid_up_to]),
    )
    .at(line, Some(column))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;
    use crate::config::RuleLevel;
    use serde_json::json;

    const ROUTINE: &str = "subroutine s(a, n)\n  integer, intent(in) :: n\n  real :: a(n)\n  call log_entry(n)\n  a = 0.0\nend subroutine s\n";

    fn session(config: SessionConfig) -> Session {
        Session::new("/nonexistent", config).unwrap()
    }

    #[test]
    fn in_memory_pipeline() {
        let config = SessionConfig::default()
            .with_pass(PassConfig::new("remove-calls").with_options(json!({"names": ["log_entry"]})));
        let mut session = session(config);
        session.add_source("s.f90", ROUTINE);
        assert_eq!(session.units().len(), 1);

        session.run_passes().unwrap();
        let diagnostics = session.lint().unwrap();
        assert!(diagnostics.iter().any(|d| d.rule_id == "array-intent"));

        let outputs = session.regenerate();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].changed);
        assert!(!outputs[0].text.contains("log_entry"));
        assert_eq!(session.summary().changed, vec!["s.f90"]);
        assert!(session.summary().is_success());
    }

    #[test]
    fn unknown_pass_is_a_config_error() {
        let config = SessionConfig::default().with_pass(PassConfig::new("inline-everything"));
        let mut session = session(config);
        let err = session.run_passes().unwrap_err();
        assert!(matches!(err, RefitError::Config(ConfigError::UnknownPass { .. })), "{}", err);
    }

    #[test]
    fn bad_pass_options_are_a_config_error() {
        let config = SessionConfig::default()
            .with_pass(PassConfig::new("annotate-loops").with_options(json!({"directive": "loop"})));
        let session = session(config);
        let err = session.create_pass(&session.config().passes[0]).err().unwrap();
        assert!(matches!(err, ConfigError::PassOptions { .. }));
    }

    #[test]
    fn disabled_rule_reports_nothing() {
        let config = SessionConfig::default().with_rule(
            "array-intent",
            RuleConfig {
                severity: Some(RuleLevel::Off),
                ..Default::default()
            },
        );
        let mut session = session(config);
        session.add_source("s.f90", ROUTINE);
        let diagnostics = session.lint().unwrap();
        assert!(diagnostics.iter().all(|d| d.rule_id != "array-intent"));
    }

    #[test]
    fn parse_failures_are_recorded() {
        let mut session = session(SessionConfig::default());
        session.load_sources(vec![
            (PathBuf::from("ok.f90"), ROUTINE.to_string()),
            (PathBuf::from("bad.f90"), "subroutine t\n  do i = 1, 2\nend subroutine t\n".to_string()),
        ]);
        assert_eq!(session.units().len(), 1);
        assert_eq!(session.summary().parse_errors.len(), 1);
        assert_eq!(session.summary().parse_errors[0].file, "bad.f90");
        assert_eq!(session.summary().exit_code(), crate::error::ExitCode::ParseFailure);
    }

    #[test]
    fn undecodable_text_points_at_the_first_bad_byte() {
        let bytes = b"subroutine s\n  ! r\xe9sum\xe9\nend subroutine s\n";
        let valid_up_to = std::str::from_utf8(bytes).unwrap_err().valid_up_to();
        let err = undecodable(Path::new("legacy.f90"), "lines", bytes, valid_up_to);
        assert_eq!(err.file, "legacy.f90");
        assert_eq!((err.line, err.column), (Some(2), Some(6)));
        assert_eq!(err.message, "not valid UTF-8 (byte 0xe9)");
    }

    #[test]
    fn external_without_command_is_rejected() {
        let config = SessionConfig::default().with_frontend(refit_fortran::FrontendKind::External);
        let err = Session::new("/nonexistent", config).err().unwrap();
        assert!(matches!(err, RefitError::Config(ConfigError::MissingCommand)));
    }

    #[test]
    fn units_get_distinct_ids() {
        let mut session = session(SessionConfig::default());
        session.add_source("a.f90", "subroutine a\nend subroutine a\n");
        session.add_source("b.f90", "subroutine b\n  call a\nend subroutine b\n");
        let ids: Vec<_> = session.units().iter().map(|u| u.lock().id).collect();
        assert_eq!(ids, vec![SourceId(0), SourceId(1)]);
        assert!(session.summary().warnings.is_empty(), "{:?}", session.summary().warnings);
    }
}
