//! refit: source-to-source transformation and lint toolbox for Fortran.
//!
//! The root crate is the session layer: configuration, source discovery,
//! logging setup, the [`session::Session`] that drives a run, and the run
//! summary with its exit code. Language infrastructure lives in the
//! workspace crates and is re-exported here.

// Infrastructure - re-exported from the workspace crates
pub use refit_core::{cache, callgraph, ir, lint, passes, scheduler, symbols, text, types, visit};
pub use refit_fortran::{adapter, regen};

pub use refit_core::{SharedUnit, SourceUnit};
pub use refit_fortran::{FrontendKind, FrontendOptions};

// Session layer
pub mod config;
pub mod error;
pub mod logging;
pub mod report;
pub mod session;

pub use config::{ConfigError, PassConfig, RuleConfig, RuleLevel, SessionConfig};
pub use error::{ExitCode, RefitError};
pub use report::SessionSummary;
pub use session::{FileOutput, Session};
