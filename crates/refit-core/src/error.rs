//! Error taxonomy shared by every refit subsystem.
//!
//! Each stage of a run has its own error type:
//!
//! - [`ParseError`]: a frontend rejected a source file
//! - [`ResolutionWarning`]: a name could not be resolved (non-fatal)
//! - [`TransformError`]: a pass or transformer produced an invalid result
//! - [`SchedulingError`]: a whole-run condition (cycle not converging, timeout,
//!   fatal pass failure)
//! - [`RegenerationError`]: regenerated text failed the round-trip check
//!
//! The session layer bridges all of these into its own unified error with
//! stable exit codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Parse Errors
// ============================================================================

/// A frontend failed to parse a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseError {
    /// File the error occurred in.
    pub file: String,
    /// Name of the frontend backend that reported the failure.
    pub frontend: String,
    /// Human-readable description.
    pub message: String,
    /// 1-indexed line, when known.
    pub line: Option<u32>,
    /// 1-indexed column, when known.
    pub column: Option<u32>,
}

impl ParseError {
    pub fn new(
        file: impl Into<String>,
        frontend: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ParseError {
            file: file.into(),
            frontend: frontend.into(),
            message: message.into(),
            line: None,
            column: None,
        }
    }

    /// Attach a line (and optionally column) to the error.
    pub fn at(mut self, line: u32, column: Option<u32>) -> Self {
        self.line = Some(line);
        self.column = column;
        self
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file)?;
        if let Some(line) = self.line {
            write!(f, ":{}", line)?;
            if let Some(col) = self.column {
                write!(f, ":{}", col)?;
            }
        }
        write!(f, ": {} [{}]", self.message, self.frontend)
    }
}

impl std::error::Error for ParseError {}

// ============================================================================
// Resolution Warnings
// ============================================================================

/// A reference whose declaration could not be found.
///
/// Warnings never stop a run; the reference is recorded as unresolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolutionWarning {
    pub file: String,
    /// The unresolved name, as written.
    pub name: String,
    /// Name of the enclosing program unit (or the file for top-level names).
    pub scope: String,
    /// What kind of reference failed (variable, call, module).
    pub what: String,
    pub line: Option<u32>,
}

impl fmt::Display for ResolutionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file)?;
        if let Some(line) = self.line {
            write!(f, ":{}", line)?;
        }
        write!(
            f,
            ": unresolved {} '{}' in {}",
            self.what, self.name, self.scope
        )
    }
}

// ============================================================================
// Transform Errors
// ============================================================================

/// Errors raised while rewriting IR.
///
/// These are unit-scoped: the scheduler records them against the program unit
/// being processed unless the pass is configured as fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TransformError {
    /// A single-node slot received zero or several replacement nodes.
    #[error("invalid replacement for {slot} slot of {node}: expected exactly one node, got {count}")]
    InvalidReplacement {
        node: String,
        slot: String,
        count: usize,
    },

    /// A pass replaced a program unit with a node that is not a program unit.
    #[error("pass '{pass}' replaced unit '{unit}' with a {found} node")]
    UnitKindMismatch {
        pass: String,
        unit: String,
        found: String,
    },

    /// A pass reported a failure of its own.
    #[error("pass '{pass}' failed on '{unit}': {message}")]
    PassFailed {
        pass: String,
        unit: String,
        message: String,
    },

    /// Pass or transformer options were invalid.
    #[error("invalid options for '{pass}': {message}")]
    InvalidOptions { pass: String, message: String },
}

impl TransformError {
    pub fn pass_failed(
        pass: impl Into<String>,
        unit: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        TransformError::PassFailed {
            pass: pass.into(),
            unit: unit.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Scheduling Errors
// ============================================================================

/// A transformation failure recorded against one program unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub pass: String,
    pub unit: String,
    pub error: TransformError,
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}: {}", self.pass, self.unit, self.error)
    }
}

/// Whole-run scheduling failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SchedulingError {
    /// A strongly connected component did not reach a fixed point.
    #[error("pass '{pass}' did not converge on cycle [{}] after {rounds} rounds", .units.join(", "))]
    NotConverged {
        pass: String,
        units: Vec<String>,
        rounds: usize,
        /// Unit failures recorded before the cycle gave up.
        failures: Vec<UnitFailure>,
    },

    /// The whole-run timeout expired before all units were processed.
    #[error("pass '{pass}' timed out with {} incomplete units", .incomplete.len())]
    Timeout {
        pass: String,
        completed: usize,
        incomplete: Vec<String>,
        failures: Vec<UnitFailure>,
    },

    /// A pass configured as fatal failed on some unit.
    #[error("fatal pass '{pass}' aborted the run: {first}")]
    Aborted {
        pass: String,
        first: UnitFailure,
        failures: Vec<UnitFailure>,
    },

    /// The requested pass is not registered.
    #[error("unknown pass '{name}'")]
    UnknownPass { name: String },

    /// The worker pool could not be created.
    #[error("failed to start worker pool: {message}")]
    WorkerPool { message: String },
}

impl SchedulingError {
    /// Unit failures collected before the run stopped.
    pub fn failures(&self) -> &[UnitFailure] {
        match self {
            SchedulingError::NotConverged { failures, .. }
            | SchedulingError::Timeout { failures, .. }
            | SchedulingError::Aborted { failures, .. } => failures,
            SchedulingError::UnknownPass { .. } | SchedulingError::WorkerPool { .. } => &[],
        }
    }
}

// ============================================================================
// Regeneration Errors
// ============================================================================

/// Why regenerated text was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegenerationFailure {
    /// The regenerated text did not parse.
    Reparse(ParseError),
    /// The regenerated text parsed to a different IR.
    Mismatch { detail: String },
}

/// Regenerated text failed the round-trip check; the original text is kept.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("regeneration of {file} failed: {}", describe_failure(.failure))]
pub struct RegenerationError {
    pub file: String,
    pub failure: RegenerationFailure,
}

fn describe_failure(failure: &RegenerationFailure) -> String {
    match failure {
        RegenerationFailure::Reparse(err) => format!("output does not parse ({})", err),
        RegenerationFailure::Mismatch { detail } => {
            format!("output is not equivalent to the IR ({})", detail)
        }
    }
}
