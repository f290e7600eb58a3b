//! Unified error type and exit codes.
//!
//! Subsystem errors are bridged into [`RefitError`] with `From` impls; each
//! variant maps to a stable process exit code:
//!
//! - `2`: invalid configuration
//! - `3`: parse failure
//! - `4`: transform or scheduling failure
//! - `5`: regeneration failure
//! - `10`: internal errors (I/O, unexpected state)

use std::fmt;

use thiserror::Error;

use refit_core::lint::LintConfigError;
use refit_core::{ParseError, RegenerationError, SchedulingError, TransformError};

use crate::config::ConfigError;

// ============================================================================
// Exit Codes
// ============================================================================

/// Stable exit codes of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,
    InvalidConfiguration = 2,
    ParseFailure = 3,
    TransformFailure = 4,
    RegenerationFailure = 5,
    Internal = 10,
}

impl ExitCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.code())
    }
}

// ============================================================================
// Unified Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum RefitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    #[error(transparent)]
    Regeneration(#[from] RegenerationError),

    #[error("i/o error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl RefitError {
    pub fn io(path: impl fmt::Display, err: impl fmt::Display) -> Self {
        RefitError::Io {
            path: path.to_string(),
            message: err.to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        RefitError::Internal {
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self)
    }
}

impl From<&RefitError> for ExitCode {
    fn from(err: &RefitError) -> Self {
        match err {
            RefitError::Config(_) => ExitCode::InvalidConfiguration,
            RefitError::Parse(_) => ExitCode::ParseFailure,
            RefitError::Transform(_) | RefitError::Scheduling(_) => ExitCode::TransformFailure,
            RefitError::Regeneration(_) => ExitCode::RegenerationFailure,
            RefitError::Io { .. } | RefitError::Internal { .. } => ExitCode::Internal,
        }
    }
}

impl From<LintConfigError> for RefitError {
    fn from(err: LintConfigError) -> Self {
        match err {
            LintConfigError::UnknownRule { id } => ConfigError::UnknownRule { id }.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::InvalidConfiguration.code(), 2);
        assert_eq!(ExitCode::ParseFailure.code(), 3);
        assert_eq!(ExitCode::TransformFailure.code(), 4);
        assert_eq!(ExitCode::RegenerationFailure.code(), 5);
        assert_eq!(ExitCode::Internal.code(), 10);
    }

    #[test]
    fn subsystem_errors_map_to_codes() {
        let parse: RefitError = ParseError::new("a.f90", "lines", "bad").into();
        assert_eq!(parse.exit_code(), ExitCode::ParseFailure);

        let unknown: RefitError = LintConfigError::UnknownRule { id: "x".into() }.into();
        assert_eq!(unknown.exit_code(), ExitCode::InvalidConfiguration);
        assert_eq!(unknown.to_string(), "unknown rule 'x'");

        let sched: RefitError = SchedulingError::UnknownPass { name: "p".into() }.into();
        assert_eq!(sched.exit_code(), ExitCode::TransformFailure);

        assert_eq!(RefitError::io("a.f90", "denied").exit_code(), ExitCode::Internal);
    }
}
