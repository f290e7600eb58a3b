//! Human-readable diagnostic rendering with source excerpts.

use annotate_snippets::{Level, Renderer, Snippet};

use crate::text::byte_offset_to_position;

use super::{Diagnostic, Severity};

fn level(severity: Severity) -> Level {
    match severity {
        Severity::Info => Level::Info,
        Severity::Warning => Level::Warning,
        Severity::Error | Severity::Fatal => Level::Error,
    }
}

/// Render one diagnostic against the text its span refers to.
///
/// Diagnostics without a span render as a single title line.
pub fn render_diagnostic(diagnostic: &Diagnostic, text: &str, styled: bool) -> String {
    let renderer = if styled {
        Renderer::styled()
    } else {
        Renderer::plain()
    };
    let title = format!("{} [{}]", diagnostic.message, diagnostic.rule_id);
    let level = level(diagnostic.severity);

    let Some(span) = diagnostic.span.filter(|s| s.end <= text.len()) else {
        let message = level.title(&title);
        let rendered = renderer.render(message).to_string();
        return format!("{}: {}", diagnostic.file, rendered);
    };

    // Excerpt: the full lines covered by the span.
    let start = text[..span.start].rfind('\n').map_or(0, |p| p + 1);
    let end = text[span.end..]
        .find('\n')
        .map_or(text.len(), |p| span.end + p);
    let source = &text[start..end];
    let (line_start, _) = byte_offset_to_position(text, start);
    let local_start = span.start - start;
    let local_end = if span.end > span.start {
        span.end - start
    } else {
        (local_start + 1).min(source.len())
    };

    let message = level.title(&title).snippet(
        Snippet::source(source)
            .line_start(line_start as usize)
            .origin(&diagnostic.file)
            .fold(false)
            .annotation(level.span(local_start..local_end).label(diagnostic.rule_id.as_str())),
    );
    let rendered = renderer.render(message).to_string();
    rendered
}

/// Render several diagnostics of one file, separated by blank lines.
pub fn render_diagnostics(diagnostics: &[Diagnostic], text: &str, styled: bool) -> String {
    diagnostics
        .iter()
        .map(|d| render_diagnostic(d, text, styled))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Span;

    #[test]
    fn renders_excerpt_with_line_number() {
        let text = "subroutine s(b)\n  real :: b(:)\nend subroutine s\n";
        let start = text.find("  real").unwrap();
        let diagnostic = Diagnostic {
            rule_id: "array-intent".into(),
            severity: Severity::Warning,
            file: "s.f90".into(),
            span: Some(Span::new(start, start + "  real :: b(:)".len())),
            line: Some(2),
            message: "array dummy argument 'b' has no intent".into(),
        };
        let out = render_diagnostic(&diagnostic, text, false);
        assert!(out.contains("warning: array dummy argument 'b' has no intent [array-intent]"));
        assert!(out.contains("s.f90:2"));
        assert!(out.contains("real :: b(:)"));
    }

    #[test]
    fn renders_without_span() {
        let diagnostic = Diagnostic {
            rule_id: "implicit-none".into(),
            severity: Severity::Error,
            file: "m.f90".into(),
            span: None,
            line: None,
            message: "missing implicit none".into(),
        };
        let out = render_diagnostic(&diagnostic, "", false);
        assert!(out.starts_with("m.f90: error: missing implicit none"));
    }
}
