//! End-of-session summary.

use serde::{Deserialize, Serialize};

use refit_core::error::ResolutionWarning;
use refit_core::lint::{Diagnostic, Severity};
use refit_core::scheduler::{PassPlan, RunReport};
use refit_core::{ParseError, RegenerationError, SchedulingError};

use crate::error::ExitCode;

/// Everything a session run produced, short of the regenerated text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Source files selected for the session.
    pub files: usize,
    /// Files that parsed; the others are in `parse_errors`.
    pub parsed: usize,
    pub parse_errors: Vec<ParseError>,
    pub warnings: Vec<ResolutionWarning>,
    /// One report per pass that ran to completion.
    pub passes: Vec<RunReport>,
    /// One plan per pass when planning instead of running.
    pub plans: Vec<PassPlan>,
    /// Error that stopped the pass list, if any.
    pub scheduling_error: Option<SchedulingError>,
    pub diagnostics: Vec<Diagnostic>,
    /// Diagnostics dropped by suppression markers.
    pub suppressed: usize,
    /// Files whose regenerated text was rejected; their original text is kept.
    pub regeneration_errors: Vec<RegenerationError>,
    /// Files whose text changed.
    pub changed: Vec<String>,
    /// Files written back to disk.
    pub written: Vec<String>,
    pub started_at: String,
    pub finished_at: String,
}

impl SessionSummary {
    /// Process exit code; the most fundamental failure wins.
    pub fn exit_code(&self) -> ExitCode {
        if !self.parse_errors.is_empty() {
            ExitCode::ParseFailure
        } else if self.scheduling_error.is_some() {
            ExitCode::TransformFailure
        } else if !self.regeneration_errors.is_empty() {
            ExitCode::RegenerationFailure
        } else {
            ExitCode::Success
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == ExitCode::Success
    }

    /// Unit failures of all passes, including the one that was stopped.
    pub fn unit_failures(&self) -> usize {
        let finished: usize = self.passes.iter().map(|p| p.failures.len()).sum();
        finished + self.scheduling_error.as_ref().map_or(0, |e| e.failures().len())
    }

    /// Diagnostics at or above `severity`.
    pub fn count_at_least(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity >= severity)
            .count()
    }

    /// One line per outcome, for terminal output.
    pub fn headline(&self) -> String {
        format!(
            "{} files ({} parsed), {} passes, {} changed, {} diagnostics ({} suppressed), exit {}",
            self.files,
            self.parsed,
            self.passes.len(),
            self.changed.len(),
            self.diagnostics.len(),
            self.suppressed,
            self.exit_code()
        )
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refit_core::error::{RegenerationFailure, UnitFailure};
    use refit_core::TransformError;

    fn regeneration_error() -> RegenerationError {
        RegenerationError {
            file: "a.f90".into(),
            failure: RegenerationFailure::Mismatch {
                detail: "x".into(),
            },
        }
    }

    #[test]
    fn clean_summary_succeeds() {
        let summary = SessionSummary::default();
        assert_eq!(summary.exit_code(), ExitCode::Success);
        assert!(summary.is_success());
    }

    #[test]
    fn parse_errors_take_precedence() {
        let summary = SessionSummary {
            parse_errors: vec![ParseError::new("a.f90", "lines", "bad")],
            regeneration_errors: vec![regeneration_error()],
            ..Default::default()
        };
        assert_eq!(summary.exit_code(), ExitCode::ParseFailure);
    }

    #[test]
    fn scheduling_then_regeneration() {
        let mut summary = SessionSummary {
            regeneration_errors: vec![regeneration_error()],
            ..Default::default()
        };
        assert_eq!(summary.exit_code(), ExitCode::RegenerationFailure);
        summary.scheduling_error = Some(SchedulingError::Aborted {
            pass: "p".into(),
            first: UnitFailure {
                pass: "p".into(),
                unit: "s".into(),
                error: TransformError::pass_failed("p", "s", "boom"),
            },
            failures: Vec::new(),
        });
        assert_eq!(summary.exit_code(), ExitCode::TransformFailure);
        assert_eq!(summary.unit_failures(), 0);
    }

    #[test]
    fn stopped_pass_failures_are_counted() {
        let failure = UnitFailure {
            pass: "p".into(),
            unit: "c".into(),
            error: TransformError::pass_failed("p", "c", "boom"),
        };
        let summary = SessionSummary {
            scheduling_error: Some(SchedulingError::NotConverged {
                pass: "p".into(),
                units: vec!["a".into(), "b".into()],
                rounds: 8,
                failures: vec![failure],
            }),
            ..Default::default()
        };
        assert_eq!(summary.unit_failures(), 1);
        assert_eq!(summary.exit_code(), ExitCode::TransformFailure);
    }

    #[test]
    fn counts_diagnostics_by_severity() {
        let finding = |severity| Diagnostic {
            rule_id: "r".into(),
            severity,
            file: "a.f90".into(),
            span: None,
            line: Some(1),
            message: "m".into(),
        };
        let summary = SessionSummary {
            diagnostics: vec![
                finding(Severity::Info),
                finding(Severity::Warning),
                finding(Severity::Error),
                finding(Severity::Fatal),
            ],
            ..Default::default()
        };
        assert_eq!(summary.count_at_least(Severity::Info), 4);
        assert_eq!(summary.count_at_least(Severity::Error), 2);
        assert_eq!(summary.count_at_least(Severity::Fatal), 1);
    }

    #[test]
    fn summary_serializes() {
        let summary = SessionSummary {
            files: 2,
            parsed: 2,
            ..Default::default()
        };
        let json = summary.to_json().unwrap();
        assert!(json.contains("\"files\": 2"));
        assert!(summary.headline().starts_with("2 files (2 parsed)"));
    }
}
