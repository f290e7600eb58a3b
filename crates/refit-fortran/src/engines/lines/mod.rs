//! Line-oriented engine.
//!
//! Produces a flat stream of classified statements. Comment, directive and
//! preprocessor lines are not statements of their own: they ride along as
//! trivia on the statement that follows them (or on the stream's tail).

pub mod expr;
pub mod lexer;
pub mod stmt;

use refit_core::types::Span;

use crate::reader::{self, Item, LineKind, LogicalLine};

pub use expr::Expr;
pub use stmt::{Entity, Stmt};

/// Non-statement line carried as metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trivia {
    Comment { text: String, span: Span },
    Directive { text: String, span: Span },
    Preprocessor { text: String, span: Span, indent: usize },
}

/// What a record holds besides trivia.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Statement(Stmt),
    /// Opaque multi-line construct.
    Opaque,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub payload: Payload,
    pub span: Span,
    pub line: u32,
    pub indent: usize,
    /// Leading keyword, lowercase (decides where opaque text belongs).
    pub keyword: String,
    pub leading: Vec<Trivia>,
}

/// Output of the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statements {
    pub records: Vec<Record>,
    /// Trivia after the last statement.
    pub trailing: Vec<Trivia>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinesError {
    pub line: u32,
    pub column: u32,
    pub message: String,
}

fn trivia(line: &LogicalLine) -> Option<Trivia> {
    match line.kind {
        LineKind::Code => None,
        LineKind::Comment => Some(Trivia::Comment {
            text: line.code.clone(),
            span: line.span,
        }),
        LineKind::Directive => Some(Trivia::Directive {
            text: line.code.clone(),
            span: line.span,
        }),
        LineKind::Preprocessor => Some(Trivia::Preprocessor {
            text: line.code.clone(),
            span: line.span,
            indent: line.indent,
        }),
    }
}

fn statement(line: &LogicalLine) -> Result<Stmt, LinesError> {
    // Labels and `;` chains have no IR form.
    if line.label.is_some() || line.compound {
        return Ok(Stmt::Verbatim);
    }
    let code = line.statement();
    stmt::classify(code).map_err(|err| {
        // Column relative to the first physical line's code.
        let lead = line.code.len() - line.code.trim_start().len();
        LinesError {
            line: line.line,
            column: (lead + err.offset) as u32 + 1,
            message: err.message,
        }
    })
}

/// Parse `text` into classified statements.
pub fn parse(text: &str) -> Result<Statements, LinesError> {
    let mut out = Statements::default();
    let mut pending = Vec::new();
    for item in reader::read(text) {
        let record = match item {
            Item::Line(line) => {
                if let Some(t) = trivia(&line) {
                    pending.push(t);
                    continue;
                }
                Record {
                    payload: Payload::Statement(statement(&line)?),
                    span: line.span,
                    line: line.line,
                    indent: line.indent,
                    keyword: line.keyword(),
                    leading: std::mem::take(&mut pending),
                }
            }
            Item::Opaque(block) => Record {
                payload: Payload::Opaque,
                span: block.span,
                line: block.line,
                indent: block.indent,
                keyword: block.keyword,
                leading: std::mem::take(&mut pending),
            },
        };
        out.records.push(record);
    }
    out.trailing = pending;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_attach_to_the_next_statement() {
        let text = "subroutine s\n  ! note\n!$acc kernels\n  call a\nend subroutine s\n! tail\n";
        let stmts = parse(text).unwrap();
        assert_eq!(stmts.records.len(), 3);
        assert_eq!(stmts.records[1].leading.len(), 2);
        assert!(matches!(
            &stmts.records[1].leading[1],
            Trivia::Directive { text, .. } if text == "!$acc kernels"
        ));
        assert_eq!(stmts.trailing.len(), 1);
    }

    #[test]
    fn labelled_statements_stay_verbatim() {
        let stmts = parse("10 continue\n").unwrap();
        assert_eq!(
            stmts.records[0].payload,
            Payload::Statement(Stmt::Verbatim)
        );
    }

    #[test]
    fn structural_errors_carry_a_position() {
        let err = parse("subroutine s\n  do i =\nend\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.column > 1);
    }
}
