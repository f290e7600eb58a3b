//! Text position utilities for byte offsets, lines and indentation.
//!
//! ## Coordinate Conventions
//!
//! - Lines and columns are **1-indexed** (matching editor conventions)
//! - Byte offsets are **0-indexed**
//! - Columns count bytes; Fortran sources are overwhelmingly ASCII

use crate::types::Span;

// ============================================================================
// Position Conversions
// ============================================================================

/// Convert a byte offset to 1-indexed line and column.
///
/// If `offset` exceeds content length, returns position at end of content.
pub fn byte_offset_to_position(content: &str, offset: usize) -> (u32, u32) {
    let offset = offset.min(content.len());
    let before = &content.as_bytes()[..offset];
    let line = before.iter().filter(|&&b| b == b'\n').count() as u32 + 1;
    let line_start = before
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|p| p + 1)
        .unwrap_or(0);
    (line, (offset - line_start) as u32 + 1)
}

/// Get the line range spanned by a byte span.
///
/// Returns `(start_line, end_line)` both 1-indexed.
pub fn span_to_line_range(content: &str, span: &Span) -> (u32, u32) {
    let (start_line, _) = byte_offset_to_position(content, span.start);
    let (end_line, _) =
        byte_offset_to_position(content, span.end.saturating_sub(1).max(span.start));
    (start_line, end_line)
}

/// Extract the text content of a span.
///
/// Returns `None` if the span extends beyond content bounds.
pub fn extract_span<'a>(content: &'a str, span: &Span) -> Option<&'a str> {
    content.get(span.start..span.end)
}

/// Byte offsets at which each line starts.
pub fn line_starts(content: &str) -> Vec<usize> {
    let mut starts = vec![0];
    starts.extend(
        content
            .bytes()
            .enumerate()
            .filter(|(_, b)| *b == b'\n')
            .map(|(i, _)| i + 1),
    );
    starts
}

/// Count the number of lines in the content.
pub fn line_count(content: &str) -> u32 {
    let newlines = content.bytes().filter(|&b| b == b'\n').count() as u32;
    if content.is_empty() {
        0
    } else if content.ends_with('\n') {
        newlines
    } else {
        newlines + 1
    }
}

// ============================================================================
// Indentation
// ============================================================================

/// Width of the leading whitespace of `line` (tabs count as one column).
pub fn indent_width(line: &str) -> usize {
    line.len() - line.trim_start_matches([' ', '\t']).len()
}

/// Shift every non-blank line of `text` so the first line starts at `indent`.
///
/// Lines keep their indentation relative to the first line. Lines that would
/// need more dedent than they have leading whitespace are dedented fully.
pub fn reindent(text: &str, indent: usize) -> String {
    let first = text.lines().next().map(indent_width).unwrap_or(0);
    if first == indent {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len() + 16);
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if line.trim().is_empty() {
            continue;
        }
        let width = indent_width(line);
        let target = if indent >= first {
            width + (indent - first)
        } else {
            width.saturating_sub(first - indent)
        };
        out.push_str(&" ".repeat(target));
        out.push_str(&line[width..]);
    }
    out
}

// ============================================================================
// Directives
// ============================================================================

/// Split a directive comment such as `!$acc loop vector` into its sentinel
/// keyword (`acc`, lowercase) and the remaining content (`loop vector`).
///
/// Returns `None` for text that is not a `!$` directive. A bare `!$` sentinel
/// (conditional compilation) yields an empty keyword.
pub fn split_directive(text: &str) -> Option<(String, String)> {
    let rest = text.trim_start().strip_prefix("!$")?;
    let keyword_len = rest
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(rest.len());
    let (keyword, content) = rest.split_at(keyword_len);
    Some((keyword.to_ascii_lowercase(), content.trim().to_string()))
}
