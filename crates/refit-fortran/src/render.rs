//! Parse error rendering with a source excerpt.

use annotate_snippets::{Level, Renderer, Snippet};

use refit_core::text::line_starts;
use refit_core::ParseError;

/// Render a parse error against the text that failed to parse.
///
/// Errors without a line (or with a line past the end of `text`) render as a
/// single title line.
pub fn render_parse_error(err: &ParseError, text: &str, styled: bool) -> String {
    let renderer = if styled {
        Renderer::styled()
    } else {
        Renderer::plain()
    };
    let title = format!("{} [{}]", err.message, err.frontend);
    let starts = line_starts(text);
    let Some(start) = err
        .line
        .and_then(|line| starts.get((line as usize).saturating_sub(1)).copied())
        .filter(|&start| start <= text.len())
    else {
        let message = Level::Error.title(&title);
        let rendered = renderer.render(message).to_string();
        return format!("{}: {}", err.file, rendered);
    };

    let end = text[start..].find('\n').map_or(text.len(), |p| start + p);
    let source = &text[start..end];
    let column = err.column.map_or(0, |c| (c as usize).saturating_sub(1));
    let local_start = column.min(source.len());
    let local_end = if local_start < source.len() {
        local_start + 1
    } else {
        local_start
    };

    let message = Level::Error.title(&title).snippet(
        Snippet::source(source)
            .line_start(err.line.unwrap_or(1) as usize)
            .origin(&err.file)
            .fold(false)
            .annotation(Level::Error.span(local_start..local_end).label("here")),
    );
    let rendered = renderer.render(message).to_string();
    rendered
}
