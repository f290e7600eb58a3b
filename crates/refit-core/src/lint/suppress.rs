//! Inline suppression markers.
//!
//! ```fortran
//! real, intent(in) :: a(:)
//! real :: b(:)   ! refit: disable=array-intent
//! ! refit: disable=banned-statements
//! stop
//! ```
//!
//! A trailing marker covers the statement on its own line. A marker on a
//! comment-only line covers the next line holding code. `all` matches every
//! rule. A covered diagnostic is dropped whatever its severity.

use std::sync::LazyLock;

use regex::Regex;

use crate::text::span_to_line_range;

use super::Diagnostic;

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)!\s*refit\s*:\s*disable\s*=\s*([a-z0-9_\-]+(?:\s*,\s*[a-z0-9_\-]+)*)").unwrap()
});

/// One marker and the line it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suppression {
    /// 1-indexed line the marker applies to.
    pub line: u32,
    /// Lowercase rule ids; `all` matches any rule.
    pub rules: Vec<String>,
}

impl Suppression {
    pub fn matches_rule(&self, rule_id: &str) -> bool {
        self.rules
            .iter()
            .any(|r| r == "all" || r.eq_ignore_ascii_case(rule_id))
    }
}

/// All markers of one source text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Suppressions {
    markers: Vec<Suppression>,
}

impl Suppressions {
    pub fn scan(text: &str) -> Self {
        let lines: Vec<&str> = text.lines().collect();
        let mut markers = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            let Some(caps) = MARKER.captures(line) else {
                continue;
            };
            let rules: Vec<String> = caps[1]
                .split(',')
                .map(|r| r.trim().to_ascii_lowercase())
                .filter(|r| !r.is_empty())
                .collect();
            let target = if line.trim_start().starts_with('!') {
                // Comment-only line: applies to the next line with code.
                lines
                    .iter()
                    .enumerate()
                    .skip(idx + 1)
                    .find(|(_, l)| {
                        let t = l.trim_start();
                        !t.is_empty() && !t.starts_with('!')
                    })
                    .map(|(i, _)| i)
            } else {
                Some(idx)
            };
            if let Some(target) = target {
                markers.push(Suppression {
                    line: target as u32 + 1,
                    rules,
                });
            }
        }
        Suppressions { markers }
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn markers(&self) -> &[Suppression] {
        &self.markers
    }

    /// Whether a marker covers the diagnostic: same rule, and the marked
    /// line lies within the diagnostic's span.
    pub fn suppresses(&self, text: &str, diagnostic: &Diagnostic) -> bool {
        let Some(span) = diagnostic.span else {
            return false;
        };
        let (first, last) = span_to_line_range(text, &span);
        self.markers.iter().any(|m| {
            m.line >= first && m.line <= last && m.matches_rule(&diagnostic.rule_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lint::Severity;
    use crate::types::Span;

    const SOURCE: &str = "\
subroutine s(a, b)
  real :: a(:)   ! refit: disable=array-intent
  real :: b(:)
  ! refit: disable=banned-statements, implicit-none

  stop
end subroutine s
";

    fn diag(rule: &str, text: &str, needle: &str) -> Diagnostic {
        let start = text.find(needle).unwrap();
        Diagnostic {
            rule_id: rule.into(),
            severity: Severity::Fatal,
            file: "s.f90".into(),
            span: Some(Span::new(start, start + needle.len())),
            line: None,
            message: String::new(),
        }
    }

    #[test]
    fn scan_targets() {
        let s = Suppressions::scan(SOURCE);
        let lines: Vec<u32> = s.markers().iter().map(|m| m.line).collect();
        assert_eq!(lines, vec![2, 6]);
        assert_eq!(s.markers()[1].rules, vec!["banned-statements", "implicit-none"]);
    }

    #[test]
    fn trailing_marker_covers_only_its_line() {
        let s = Suppressions::scan(SOURCE);
        assert!(s.suppresses(SOURCE, &diag("array-intent", SOURCE, "  real :: a(:)")));
        assert!(!s.suppresses(SOURCE, &diag("array-intent", SOURCE, "  real :: b(:)")));
        assert!(!s.suppresses(SOURCE, &diag("max-dummy-args", SOURCE, "  real :: a(:)")));
    }

    #[test]
    fn comment_marker_covers_next_code_line() {
        let s = Suppressions::scan(SOURCE);
        assert!(s.suppresses(SOURCE, &diag("banned-statements", SOURCE, "  stop")));
    }

    #[test]
    fn all_matches_every_rule() {
        let text = "x = 1 ! REFIT: disable=all\n";
        let s = Suppressions::scan(text);
        assert!(s.suppresses(text, &diag("anything", text, "x = 1")));
    }
}
