//! Session configuration.
//!
//! A session is described by one TOML file, usually `refit.toml` at the root
//! of the source tree:
//!
//! ```toml
//! frontend = "lines"
//! include = ["src/**/*.f90"]
//! exclude = ["**/legacy/**"]
//! write = true
//!
//! [external]
//! command = "fxtran-json --free"
//! include_dirs = ["include"]
//! timeout = 30
//!
//! [frontends]
//! "src/generated/**" = "external"
//!
//! [scheduler]
//! workers = 8
//! max_rounds = 8
//! roots = ["driver"]
//! expand = true
//!
//! [[passes]]
//! name = "annotate-loops"
//! options = { directive = "!$acc loop vector", variable = "jl" }
//!
//! [rules.banned-statements]
//! severity = "error"
//! options = { statements = ["stop", "print"] }
//!
//! [rules.implicit-none]
//! severity = "off"
//! ```
//!
//! Every section is optional; an empty file is a valid configuration.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use refit_core::lint::{RuleSettings, Severity};
use refit_core::scheduler::SchedulerConfig;
use refit_fortran::{FrontendKind, FrontendOptions};

/// Default file name looked up by [`SessionConfig::discover`].
pub const CONFIG_FILE: &str = "refit.toml";

/// Source files picked up when no `include` patterns are given.
pub const DEFAULT_INCLUDES: &[&str] = &[
    "**/*.f90", "**/*.F90", "**/*.f95", "**/*.F95", "**/*.f03", "**/*.F03", "**/*.f08", "**/*.F08",
];

/// Directories that are never searched.
pub const DEFAULT_EXCLUSIONS: &[&str] = &["**/.git/**", "**/target/**", "**/build/**"];

// ============================================================================
// Errors
// ============================================================================

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },

    #[error("invalid configuration in {path}: {message}")]
    Syntax { path: String, message: String },

    #[error("invalid glob pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("unknown pass '{name}' (known: {known})")]
    UnknownPass { name: String, known: String },

    #[error("unknown rule '{id}'")]
    UnknownRule { id: String },

    #[error("invalid options for pass '{name}': {message}")]
    PassOptions { name: String, message: String },

    #[error("the external frontend is selected but no command is configured")]
    MissingCommand,

    #[error("invalid log filter '{filter}': {message}")]
    LogFilter { filter: String, message: String },
}

// ============================================================================
// Configuration Model
// ============================================================================

/// Complete configuration of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Frontend used for files without an override.
    pub frontend: FrontendSetting,
    /// Per-file frontend overrides, glob pattern to frontend. Patterns are
    /// matched against paths relative to the session root; the first
    /// matching pattern in lexicographic order wins.
    pub frontends: BTreeMap<String, FrontendKind>,
    pub external: ExternalConfig,
    /// Source selection; empty uses [`DEFAULT_INCLUDES`].
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Write regenerated files back in place.
    pub write: bool,
    /// Plan the passes instead of running them: report stages and the
    /// dependencies each unit would gain or lose, and change nothing.
    pub plan: bool,
    /// Check regenerated text by reparsing it.
    pub verify: VerifySetting,
    pub scheduler: SchedulerConfig,
    /// Passes, run in order.
    pub passes: Vec<PassConfig>,
    /// Rule settings by rule id.
    pub rules: BTreeMap<String, RuleConfig>,
    pub logging: LoggingConfig,
}

/// Default frontend; a newtype so an absent key still means `lines`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrontendSetting(pub FrontendKind);

impl Default for FrontendSetting {
    fn default() -> Self {
        FrontendSetting(FrontendKind::Lines)
    }
}

/// Round-trip checking of regenerated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerifySetting(pub bool);

impl Default for VerifySetting {
    fn default() -> Self {
        VerifySetting(true)
    }
}

/// The external frontend program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalConfig {
    /// Program plus leading arguments.
    pub command: Option<String>,
    /// Relative entries are resolved against the session root.
    pub include_dirs: Vec<PathBuf>,
    /// Per-invocation deadline, in seconds.
    pub timeout: Option<u64>,
}

/// One entry of the pass list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassConfig {
    pub name: String,
    /// Abort the whole run on the first unit failure.
    #[serde(default)]
    pub fatal: bool,
    #[serde(default = "empty_object")]
    pub options: serde_json::Value,
}

impl PassConfig {
    pub fn new(name: impl Into<String>) -> Self {
        PassConfig {
            name: name.into(),
            fatal: false,
            options: empty_object(),
        }
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Rule level as written in configuration; `off` disables the rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleLevel {
    Off,
    Info,
    Warning,
    Error,
    Fatal,
}

/// Configuration of one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// `None` keeps the rule's default severity.
    pub severity: Option<RuleLevel>,
    pub options: serde_json::Value,
}

impl Default for RuleConfig {
    fn default() -> Self {
        RuleConfig {
            severity: None,
            options: empty_object(),
        }
    }
}

impl RuleConfig {
    /// Engine settings for this rule.
    pub fn settings(&self) -> RuleSettings {
        let (enabled, severity) = match self.severity {
            None => (true, None),
            Some(RuleLevel::Off) => (false, None),
            Some(RuleLevel::Info) => (true, Some(Severity::Info)),
            Some(RuleLevel::Warning) => (true, Some(Severity::Warning)),
            Some(RuleLevel::Error) => (true, Some(Severity::Error)),
            Some(RuleLevel::Fatal) => (true, Some(Severity::Fatal)),
        };
        RuleSettings {
            enabled,
            severity,
            options: self.options.clone(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive; `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Human,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl SessionConfig {
    /// Parse a configuration from TOML text. `origin` names the text in
    /// error messages.
    pub fn from_toml(text: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Syntax {
            path: origin.to_string(),
            message: e.message().to_string(),
        })
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml(&text, &path.display().to_string())
    }

    /// Load `refit.toml` from `root`, or the defaults if there is none.
    pub fn discover(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join(CONFIG_FILE);
        if path.is_file() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn with_frontend(mut self, frontend: FrontendKind) -> Self {
        self.frontend = FrontendSetting(frontend);
        self
    }

    pub fn with_pass(mut self, pass: PassConfig) -> Self {
        self.passes.push(pass);
        self
    }

    pub fn with_rule(mut self, id: impl Into<String>, rule: RuleConfig) -> Self {
        self.rules.insert(id.into(), rule);
        self
    }

    pub fn with_write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    /// Rule settings in the form the lint engine takes.
    pub fn rule_settings(&self) -> BTreeMap<String, RuleSettings> {
        self.rules
            .iter()
            .map(|(id, rule)| (id.clone(), rule.settings()))
            .collect()
    }

    /// Frontend options for a session rooted at `root`.
    pub fn frontend_options(&self, root: &Path) -> FrontendOptions {
        let mut options = FrontendOptions::new();
        if let Some(command) = &self.external.command {
            options = options.with_command(command.as_str());
        }
        for dir in &self.external.include_dirs {
            let dir = if dir.is_relative() {
                root.join(dir)
            } else {
                dir.clone()
            };
            options = options.with_include_dir(dir);
        }
        if let Some(secs) = self.external.timeout {
            options = options.with_timeout(Duration::from_secs(secs));
        }
        options
    }

    /// Whether any file can end up on the external frontend.
    pub fn uses_external(&self) -> bool {
        self.frontend.0 == FrontendKind::External
            || self.frontends.values().any(|k| *k == FrontendKind::External)
    }
}

// ============================================================================
// Source Selection
// ============================================================================

/// Compiled include/exclude patterns and frontend overrides.
#[derive(Debug, Clone)]
pub struct SourceFilter {
    includes: GlobSet,
    exclusions: GlobSet,
    default_exclusions: GlobSet,
    default_frontend: FrontendKind,
    overrides: Vec<(GlobSet, FrontendKind)>,
}

impl SourceFilter {
    pub fn new(config: &SessionConfig) -> Result<Self, ConfigError> {
        let includes = if config.include.is_empty() {
            build_glob_set(DEFAULT_INCLUDES)?
        } else {
            build_glob_set(&config.include)?
        };
        let overrides = config
            .frontends
            .iter()
            .map(|(pattern, kind)| Ok((build_glob_set(&[pattern])?, *kind)))
            .collect::<Result<_, ConfigError>>()?;
        Ok(SourceFilter {
            includes,
            exclusions: build_glob_set(&config.exclude)?,
            default_exclusions: build_glob_set(DEFAULT_EXCLUSIONS)?,
            default_frontend: config.frontend.0,
            overrides,
        })
    }

    /// Whether a path, relative to the session root, is a source file of
    /// the session.
    pub fn matches(&self, path: &Path) -> bool {
        if self.default_exclusions.is_match(path) || self.exclusions.is_match(path) {
            return false;
        }
        self.includes.is_match(path)
    }

    /// Frontend for a path relative to the session root.
    pub fn frontend_for(&self, path: &Path) -> FrontendKind {
        self.overrides
            .iter()
            .find(|(set, _)| set.is_match(path))
            .map_or(self.default_frontend, |(_, kind)| *kind)
    }
}

fn build_glob_set<S: AsRef<str>>(patterns: &[S]) -> Result<GlobSet, ConfigError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let pattern = pattern.as_ref();
        let glob = Glob::new(pattern).map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| ConfigError::InvalidPattern {
        pattern: "<combined>".to_string(),
        message: e.to_string(),
    })
}
