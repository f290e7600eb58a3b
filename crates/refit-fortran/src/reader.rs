//! Free-form source reader.
//!
//! Splits raw text into logical lines shared by every in-process engine:
//!
//! - continuation lines (`&`) are joined into one code string, with comment
//!   lines in between skipped
//! - full-line comments, directives (`!$acc`, `!$omp`, ...) and preprocessor
//!   lines (`#ifdef`) are classified separately
//! - constructs the IR has no node for (derived type definitions, interface
//!   blocks, `select`, block `where`, named constructs, ...) are grouped into
//!   opaque items covering all of their lines
//!
//! Spans always cover whole physical lines: from the first byte of the first
//! line (indentation included) to the end of the last line, without the line
//! terminator.

use memchr::{memchr3, memchr_iter};

use refit_core::types::Span;

// ============================================================================
// Logical Lines
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Code,
    Comment,
    /// `!$` directive comment.
    Directive,
    /// `#` preprocessor line.
    Preprocessor,
}

/// One statement, comment or directive, possibly spanning several physical
/// lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalLine {
    pub kind: LineKind,
    pub span: Span,
    /// 1-indexed number of the first physical line.
    pub line: u32,
    /// Number of the last physical line.
    pub end_line: u32,
    /// Leading whitespace width of the first physical line.
    pub indent: usize,
    /// Code with continuations joined and comments stripped (code lines), or
    /// the trimmed line text (everything else).
    pub code: String,
    /// Statement label, if the line starts with one.
    pub label: Option<u32>,
    /// More than one statement separated by `;`.
    pub compound: bool,
}

impl LogicalLine {
    /// Code without the statement label.
    pub fn statement(&self) -> &str {
        if self.label.is_none() {
            return self.code.trim();
        }
        let code = self.code.trim_start();
        code.trim_start_matches(|c: char| c.is_ascii_digit()).trim()
    }

    /// First word of the statement, lowercase.
    pub fn keyword(&self) -> String {
        leading_word(self.statement())
    }
}

/// First identifier-like word of `text`, lowercase.
pub fn leading_word(text: &str) -> String {
    text.trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_ascii_lowercase()
}

/// A physical line: byte range without terminator.
#[derive(Debug, Clone, Copy)]
struct Physical {
    start: usize,
    end: usize,
}

fn physical_lines(text: &str) -> Vec<Physical> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    for nl in memchr_iter(b'\n', bytes) {
        out.push(Physical {
            start,
            end: trim_cr(bytes, start, nl),
        });
        start = nl + 1;
    }
    if start < bytes.len() {
        out.push(Physical {
            start,
            end: trim_cr(bytes, start, bytes.len()),
        });
    }
    out
}

fn trim_cr(bytes: &[u8], start: usize, end: usize) -> usize {
    if end > start && bytes[end - 1] == b'\r' {
        end - 1
    } else {
        end
    }
}

/// Code part of one physical line and the quote state at its end.
///
/// `quote` is the open string delimiter carried over from a continued line.
fn code_part(line: &str, mut quote: Option<char>) -> (&str, Option<char>) {
    if quote.is_none() && memchr3(b'!', b'\'', b'"', line.as_bytes()).is_none() {
        return (line, None);
    }
    let mut chars = line.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match quote {
            Some(q) if c == q => {
                if chars.peek().map(|&(_, n)| n) == Some(q) {
                    chars.next();
                } else {
                    quote = None;
                }
            }
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == '!' => return (&line[..i], None),
            None => {}
        }
    }
    (line, quote)
}

/// Comment closing the last line of a statement's source text, with the
/// blanks in front of it.
pub fn trailing_comment(text: &str) -> Option<&str> {
    let mut quote = None;
    let mut last = None;
    for line in text.lines() {
        let (code, open) = code_part(line, quote);
        quote = open;
        last = Some((line, code));
    }
    let (line, code) = last?;
    if code.len() == line.len() {
        return None;
    }
    Some(&line[code.trim_end().len()..])
}

fn is_comment_line(trimmed: &str) -> bool {
    trimmed.starts_with('!')
}

fn has_semicolon(code: &str) -> bool {
    let mut quote: Option<char> = None;
    for c in code.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == ';' => return true,
            None => {}
        }
    }
    false
}

fn parse_label(code: &str) -> Option<u32> {
    let trimmed = code.trim_start();
    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || digits.len() > 5 {
        return None;
    }
    let rest = &trimmed[digits.len()..];
    if rest.starts_with([' ', '\t']) {
        digits.parse().ok()
    } else {
        None
    }
}

/// Split `text` into logical lines. Blank lines produce nothing.
pub fn logical_lines(text: &str) -> Vec<LogicalLine> {
    let physical = physical_lines(text);
    let mut out = Vec::new();
    let mut i = 0;
    while i < physical.len() {
        let first = physical[i];
        let raw = &text[first.start..first.end];
        let trimmed = raw.trim();
        let indent = raw.len() - raw.trim_start().len();
        let line_no = i as u32 + 1;
        if trimmed.is_empty() {
            i += 1;
            continue;
        }
        let kind = if trimmed.starts_with('#') {
            Some(LineKind::Preprocessor)
        } else if trimmed.starts_with("!$") {
            Some(LineKind::Directive)
        } else if is_comment_line(trimmed) {
            Some(LineKind::Comment)
        } else {
            None
        };
        if let Some(kind) = kind {
            out.push(LogicalLine {
                kind,
                span: Span::new(first.start, first.end),
                line: line_no,
                end_line: line_no,
                indent,
                code: trimmed.to_string(),
                label: None,
                compound: false,
            });
            i += 1;
            continue;
        }

        // Code line, possibly continued.
        let mut code = String::new();
        let mut quote = None;
        let mut last = i;
        let mut current = raw;
        loop {
            let (part, open) = code_part(current, quote);
            let trimmed_part = part.trim_end();
            match trimmed_part.strip_suffix('&') {
                Some(head) => {
                    code.push_str(head);
                    quote = open;
                    // Next non-blank, non-comment line continues the statement.
                    let mut next = last + 1;
                    while next < physical.len() {
                        let candidate = text[physical[next].start..physical[next].end].trim();
                        if candidate.is_empty() || (quote.is_none() && is_comment_line(candidate)) {
                            next += 1;
                        } else {
                            break;
                        }
                    }
                    if next >= physical.len() {
                        break;
                    }
                    last = next;
                    let line = &text[physical[next].start..physical[next].end];
                    let stripped = line.trim_start();
                    current = match stripped.strip_prefix('&') {
                        Some(rest) => rest,
                        None if quote.is_some() => line,
                        None => stripped,
                    };
                }
                None => {
                    code.push_str(if open.is_some() { part } else { trimmed_part });
                    break;
                }
            }
        }
        let label = parse_label(&code);
        out.push(LogicalLine {
            kind: LineKind::Code,
            span: Span::new(first.start, physical[last].end),
            line: line_no,
            end_line: last as u32 + 1,
            indent,
            compound: has_semicolon(&code),
            code,
            label,
        });
        i = last + 1;
    }
    out
}

// ============================================================================
// Opaque Grouping
// ============================================================================

/// A logical line or a run of lines kept as one opaque statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Line(LogicalLine),
    Opaque(OpaqueBlock),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueBlock {
    pub span: Span,
    pub line: u32,
    pub end_line: u32,
    pub indent: usize,
    /// Leading keyword of the opening statement (`type`, `select`, ...).
    pub keyword: String,
}

impl Item {
    pub fn span(&self) -> Span {
        match self {
            Item::Line(l) => l.span,
            Item::Opaque(b) => b.span,
        }
    }

    pub fn line(&self) -> u32 {
        match self {
            Item::Line(l) => l.line,
            Item::Opaque(b) => b.line,
        }
    }
}

/// How an opaque construct ends.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Closer {
    /// `end <keyword>`, nesting on `opener`.
    Keyword { keyword: &'static str },
    /// `end <keyword> <name>` for a named construct.
    Named { keyword: String, name: String },
}

/// Does this statement open a construct kept opaque?
fn opaque_opener(stmt: &str) -> Option<(String, Closer)> {
    let lower = stmt.to_ascii_lowercase();
    let word = leading_word(&lower);
    let rest = lower[word.len()..].trim_start();

    // Named construct: `outer: do ...`
    if !word.is_empty() && rest.starts_with(':') && !rest.starts_with("::") {
        let body = rest[1..].trim_start();
        let keyword = leading_word(body);
        let keyword = match keyword.as_str() {
            "do" | "if" | "block" | "where" | "forall" | "associate" | "critical" => keyword,
            "select" => "select".to_string(),
            _ => return None,
        };
        if keyword == "if" && !lower.trim_end().ends_with("then") {
            return None;
        }
        return Some((
            keyword.clone(),
            Closer::Named {
                keyword,
                name: word,
            },
        ));
    }

    let keyword: &'static str = match word.as_str() {
        "type" => {
            // `type(point) :: p` and `type is (...)` are not definitions
            if rest.starts_with('(') || rest.starts_with("is ") || rest.starts_with("is(") {
                return None;
            }
            "type"
        }
        "interface" => "interface",
        "do" if leading_word(rest) == "concurrent" => "do",
        "abstract" if leading_word(rest) == "interface" => "interface",
        "enum" => "enum",
        "associate" => "associate",
        "critical" => "critical",
        "selectcase" | "selecttype" => "select",
        "select" => "select",
        "where" | "forall" => {
            // Block form only: nothing after the closing parenthesis
            let close = matching_paren(rest)?;
            if !rest[close + 1..].trim().is_empty() {
                return None;
            }
            if word == "where" {
                "where"
            } else {
                "forall"
            }
        }
        _ => return None,
    };
    Some((keyword.to_string(), Closer::Keyword { keyword }))
}

/// Index of the parenthesis closing the one `text` starts with.
fn matching_paren(text: &str) -> Option<usize> {
    if !text.starts_with('(') {
        return None;
    }
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in text.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' => quote = Some(c),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            },
        }
    }
    None
}

/// `end type`, `endtype`, `end select name`... as (keyword, name).
fn end_statement(stmt: &str) -> Option<(String, String)> {
    let lower = stmt.trim().to_ascii_lowercase();
    let rest = lower.strip_prefix("end")?;
    let mut words = rest.split_whitespace();
    let first = words.next().unwrap_or("");
    if first.is_empty() {
        return Some((String::new(), String::new()));
    }
    let (keyword, name) = match words.next() {
        Some(name) => (first.to_string(), name.to_string()),
        None => (first.to_string(), String::new()),
    };
    Some((keyword, name))
}

fn closes(closer: &Closer, stmt: &str) -> bool {
    let Some((keyword, name)) = end_statement(stmt) else {
        return false;
    };
    match closer {
        Closer::Keyword { keyword: k } => keyword == *k,
        Closer::Named { keyword: k, name: n } => keyword == *k && name == *n,
    }
}

fn opens_same(closer: &Closer, stmt: &str) -> bool {
    match closer {
        Closer::Keyword { keyword } => {
            (*keyword == "do" && leading_word(stmt) == "do")
                || matches!(opaque_opener(stmt), Some((_, Closer::Keyword { keyword: k })) if k == *keyword)
        }
        Closer::Named { .. } => false,
    }
}

/// Group constructs without an IR representation into opaque items.
///
/// An opener without its closing statement stays a plain line.
pub fn group_opaque(lines: Vec<LogicalLine>) -> Vec<Item> {
    let mut out = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        let line = &lines[i];
        let opener = (line.kind == LineKind::Code && !line.compound)
            .then(|| opaque_opener(line.statement()))
            .flatten();
        let Some((keyword, closer)) = opener else {
            out.push(Item::Line(lines[i].clone()));
            i += 1;
            continue;
        };
        let mut depth = 1usize;
        let mut end = None;
        for (j, candidate) in lines.iter().enumerate().skip(i + 1) {
            if candidate.kind != LineKind::Code {
                continue;
            }
            let stmt = candidate.statement();
            if opens_same(&closer, stmt) {
                depth += 1;
            } else if closes(&closer, stmt) {
                depth -= 1;
                if depth == 0 {
                    end = Some(j);
                    break;
                }
            }
        }
        match end {
            Some(j) => {
                out.push(Item::Opaque(OpaqueBlock {
                    span: Span::new(line.span.start, lines[j].span.end),
                    line: line.line,
                    end_line: lines[j].end_line,
                    indent: line.indent,
                    keyword,
                }));
                i = j + 1;
            }
            None => {
                out.push(Item::Line(lines[i].clone()));
                i += 1;
            }
        }
    }
    out
}

/// Read `text` into items.
pub fn read(text: &str) -> Vec<Item> {
    group_opaque(logical_lines(text))
}

/// Text of an opaque span with the first line's indentation removed from
/// every line (lines indented less are dedented fully).
pub fn dedent(text: &str, span: Span, indent: usize) -> String {
    let slice = text.get(span.start..span.end).unwrap_or("");
    let mut out = String::with_capacity(slice.len());
    for (n, line) in slice.split('\n').enumerate() {
        if n > 0 {
            out.push('\n');
        }
        let line = line.strip_suffix('\r').unwrap_or(line);
        let width = line.len() - line.trim_start_matches([' ', '\t']).len();
        out.push_str(line[width.min(indent)..].trim_end());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_continuations_and_strips_comments() {
        let text = "  x = a + &  ! first\n      ! between\n      & b\ny = 1\n";
        let lines = logical_lines(text);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].code, "  x = a +  b");
        assert_eq!(lines[0].line, 1);
        assert_eq!(lines[0].end_line, 3);
        assert_eq!(lines[0].indent, 2);
        assert_eq!(&text[lines[0].span.start..lines[0].span.end], "  x = a + &  ! first\n      ! between\n      & b");
        assert_eq!(lines[1].line, 4);
    }

    #[test]
    fn continued_string_keeps_its_text() {
        let text = "s = 'abc&\n  &def'\n";
        let lines = logical_lines(text);
        assert_eq!(lines[0].code, "s = 'abcdef'");
    }

    #[test]
    fn bang_inside_string_is_not_a_comment() {
        let lines = logical_lines("print *, 'hi! there' ! note\n");
        assert_eq!(lines[0].code, "print *, 'hi! there'");
    }

    #[test]
    fn trailing_comment_of_the_last_line() {
        assert_eq!(trailing_comment("call foo(a)   ! note"), Some("   ! note"));
        assert_eq!(trailing_comment("print *, 'a ! b'"), None);
        assert_eq!(trailing_comment("x = a + &  ! first\n      & b"), None);
        assert_eq!(trailing_comment("s = 'a&\n  &!b' ! end"), Some(" ! end"));
    }

    #[test]
    fn classifies_line_kinds() {
        let text = "! comment\n!$acc loop\n#ifdef X\n\ncall a\n";
        let kinds: Vec<LineKind> = logical_lines(text).iter().map(|l| l.kind).collect();
        assert_eq!(
            kinds,
            vec![
                LineKind::Comment,
                LineKind::Directive,
                LineKind::Preprocessor,
                LineKind::Code
            ]
        );
    }

    #[test]
    fn labels_and_compound_statements() {
        let lines = logical_lines("10 continue\na = 1; b = 2\n");
        assert_eq!(lines[0].label, Some(10));
        assert_eq!(lines[0].statement(), "continue");
        assert!(lines[1].compound);
    }

    #[test]
    fn crlf_is_not_part_of_spans() {
        let text = "a = 1\r\nb = 2\r\n";
        let lines = logical_lines(text);
        assert_eq!(&text[lines[0].span.start..lines[0].span.end], "a = 1");
        assert_eq!(lines[1].code, "b = 2");
    }

    #[test]
    fn groups_type_definitions_but_not_declarations() {
        let text = "type :: point\n  real :: x\nend type point\ntype(point) :: p\n";
        let items = read(text);
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Item::Opaque(b) if b.keyword == "type" && b.end_line == 3));
        assert!(matches!(&items[1], Item::Line(_)));
    }

    #[test]
    fn nested_select_blocks_group_as_one() {
        let text = "select case (k)\ncase (1)\n  select case (j)\n  end select\nend select\nx = 1\n";
        let items = read(text);
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Item::Opaque(b) if b.end_line == 5));
    }

    #[test]
    fn named_constructs_are_opaque() {
        let text = "outer: do i = 1, n\n  exit outer\nend do outer\n";
        let items = read(text);
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Item::Opaque(b) if b.keyword == "do"));
    }

    #[test]
    fn single_line_where_is_a_statement() {
        let items = read("where (a > 0) b = 1\n");
        assert!(matches!(&items[0], Item::Line(_)));
    }

    #[test]
    fn dedent_keeps_relative_indentation() {
        let text = "  type :: t\n    integer :: i\n  end type t";
        let span = Span::new(0, text.len());
        assert_eq!(dedent(text, span, 2), "type :: t\n  integer :: i\nend type t");
    }
}
