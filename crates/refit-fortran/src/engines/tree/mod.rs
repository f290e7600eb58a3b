//! Tree engine.
//!
//! Parses each logical line with the statement grammar, then assembles the
//! statements into nested constructs with a recursive builder.

pub mod cst;
pub mod grammar;

use refit_core::types::Span;

use crate::engines::{keyword_role, looks_structural, split_point, Role};
use crate::reader::{self, Item, LineKind, LogicalLine};

use cst::{
    BlockConstruct, Construct, DoConstruct, ElsePart, ExecutionPart, IfConstruct,
    InternalSubprogramPart, ProgramUnit, SpecificationPart, Statement, TreeNode, UnitHeader,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeError {
    pub line: u32,
    pub column: Option<u32>,
    pub message: String,
}

impl TreeError {
    fn at(line: u32, message: impl Into<String>) -> Self {
        TreeError {
            line,
            column: None,
            message: message.into(),
        }
    }
}

/// A reader item after statement parsing.
#[derive(Debug)]
enum Piece {
    /// Already a leaf node (comment, directive, opaque block, ...).
    Leaf(TreeNode),
    Statement {
        statement: Statement,
        span: Span,
        line: u32,
    },
}

fn leaf(line: &LogicalLine, construct: Construct) -> Piece {
    Piece::Leaf(TreeNode {
        construct,
        span: line.span,
        line: line.line,
    })
}

fn piece(item: Item) -> Result<Piece, TreeError> {
    let line = match item {
        Item::Opaque(block) => {
            return Ok(Piece::Leaf(TreeNode {
                construct: Construct::Opaque {
                    keyword: block.keyword,
                },
                span: block.span,
                line: block.line,
            }))
        }
        Item::Line(line) => line,
    };
    let text = line.code.clone();
    match line.kind {
        LineKind::Comment => return Ok(leaf(&line, Construct::Comment { text })),
        LineKind::Directive => return Ok(leaf(&line, Construct::Directive { text })),
        LineKind::Preprocessor => return Ok(leaf(&line, Construct::Preprocessor { text })),
        LineKind::Code => {}
    }
    let unparsed = Construct::Unparsed {
        keyword: line.keyword(),
    };
    if line.label.is_some() || line.compound {
        return Ok(leaf(&line, unparsed));
    }
    let code = line.statement();
    match grammar::fortran::statement(code) {
        Ok(Statement::IfStmt { condition, action }) => {
            let parsed = grammar::fortran::action_stmt(&action).ok();
            Ok(leaf(
                &line,
                Construct::IfStmt {
                    condition,
                    action: parsed,
                    text: action,
                },
            ))
        }
        Ok(statement) => Ok(Piece::Statement {
            statement,
            span: line.span,
            line: line.line,
        }),
        Err(err) if looks_structural(code) => {
            let lead = line.code.len() - line.code.trim_start().len();
            Err(TreeError {
                line: line.line,
                column: Some((lead + err.location.offset) as u32 + 1),
                message: format!("expected {}", err.expected),
            })
        }
        Err(_) => Ok(leaf(&line, unparsed)),
    }
}

/// Role of a finished node inside a unit or block body.
fn role(node: &TreeNode) -> Role {
    match &node.construct {
        Construct::Comment { .. } | Construct::Directive { .. } | Construct::Preprocessor { .. } => {
            Role::Neutral
        }
        Construct::Opaque { keyword } | Construct::Unparsed { keyword } => keyword_role(keyword),
        Construct::Statement(s) if s.is_specification() => Role::Spec,
        _ => Role::Exec,
    }
}

fn split_parts(nodes: Vec<TreeNode>) -> (SpecificationPart, ExecutionPart) {
    let roles: Vec<Role> = nodes.iter().map(role).collect();
    let mut spec = nodes;
    let exec = spec.split_off(split_point(&roles));
    (SpecificationPart(spec), ExecutionPart(exec))
}

/// Statement that ended a body.
struct Terminator {
    statement: Statement,
    span: Span,
    line: u32,
}

struct Builder {
    pieces: std::vec::IntoIter<Piece>,
}

impl Builder {
    /// Read nodes until a statement accepted by `stop`.
    fn body(
        &mut self,
        opened_at: u32,
        what: &str,
        stop: fn(&Statement) -> bool,
    ) -> Result<(Vec<TreeNode>, Terminator), TreeError> {
        let mut nodes = Vec::new();
        while let Some(piece) = self.pieces.next() {
            match piece {
                Piece::Leaf(node) => nodes.push(node),
                Piece::Statement {
                    statement,
                    span,
                    line,
                } => {
                    if stop(&statement) {
                        return Ok((
                            nodes,
                            Terminator {
                                statement,
                                span,
                                line,
                            },
                        ));
                    }
                    nodes.push(self.node(statement, span, line)?);
                }
            }
        }
        Err(TreeError::at(opened_at, format!("missing end of {}", what)))
    }

    fn node(&mut self, statement: Statement, span: Span, line: u32) -> Result<TreeNode, TreeError> {
        let construct = match statement {
            Statement::ModuleStmt { name } => self.unit(UnitHeader::Module { name }, span, line)?,
            Statement::ProgramStmt { name } => {
                self.unit(UnitHeader::Program { name }, span, line)?
            }
            Statement::SubroutineStmt {
                prefixes,
                name,
                dummies,
            } => self.unit(
                UnitHeader::Subroutine {
                    prefixes,
                    name,
                    dummies,
                },
                span,
                line,
            )?,
            Statement::FunctionStmt {
                prefixes,
                type_spec,
                name,
                dummies,
                result,
            } => self.unit(
                UnitHeader::Function {
                    prefixes,
                    type_spec,
                    name,
                    dummies,
                    result,
                },
                span,
                line,
            )?,
            Statement::DoStmt { control } => {
                let (nodes, end) = self.body(line, "do loop", |s| matches!(s, Statement::EndStmt { .. }))?;
                expect_end(&end, &["do"])?;
                Construct::Do(DoConstruct {
                    control,
                    head: span,
                    block: ExecutionPart(nodes),
                    end: end.span,
                })
            }
            Statement::IfThenStmt { condition } => self.if_construct(condition, span, line)?,
            Statement::BlockStmt => {
                let (nodes, end) =
                    self.body(line, "block", |s| matches!(s, Statement::EndStmt { .. }))?;
                expect_end(&end, &["block"])?;
                let (specification, execution) = split_parts(nodes);
                Construct::Block(BlockConstruct {
                    head: span,
                    specification,
                    execution,
                    end: end.span,
                })
            }
            Statement::EndStmt { keyword } => {
                return Err(TreeError::at(line, format!("unexpected {}", end_text(&keyword))));
            }
            Statement::ContainsStmt => return Err(TreeError::at(line, "unexpected 'contains'")),
            Statement::ElseIfStmt { .. } | Statement::ElseStmt => {
                return Err(TreeError::at(line, "'else' outside of an if construct"))
            }
            other => Construct::Statement(other),
        };
        let end = match &construct {
            Construct::ProgramUnit(u) => u.end,
            Construct::Do(d) => d.end,
            Construct::If(i) => i.end,
            Construct::Block(b) => b.end,
            _ => span,
        };
        Ok(TreeNode {
            construct,
            span: span.cover(&end),
            line,
        })
    }

    fn unit(&mut self, header: UnitHeader, head: Span, line: u32) -> Result<Construct, TreeError> {
        let what = header.end_keyword();
        let stop = |s: &Statement| matches!(s, Statement::EndStmt { .. } | Statement::ContainsStmt);
        let (nodes, mut end) = self.body(line, what, stop)?;
        let internal = if matches!(end.statement, Statement::ContainsStmt) {
            let contains = end.span;
            let (subprograms, unit_end) =
                self.body(line, what, |s| matches!(s, Statement::EndStmt { .. }))?;
            end = unit_end;
            Some(InternalSubprogramPart {
                contains,
                subprograms,
            })
        } else {
            None
        };
        expect_end(&end, &["", what])?;
        let (specification, execution) = match header {
            // Everything before `contains` in a module is specification.
            UnitHeader::Module { .. } => (SpecificationPart(nodes), ExecutionPart::default()),
            _ => split_parts(nodes),
        };
        Ok(Construct::ProgramUnit(ProgramUnit {
            header,
            head,
            specification,
            execution,
            internal,
            end: end.span,
        }))
    }

    fn if_construct(&mut self, condition: cst::Expr, head: Span, line: u32) -> Result<Construct, TreeError> {
        let stop = |s: &Statement| {
            matches!(
                s,
                Statement::EndStmt { .. } | Statement::ElseIfStmt { .. } | Statement::ElseStmt
            )
        };
        let (nodes, end) = self.body(line, "if construct", stop)?;
        let (else_part, end) = self.else_part(end, line)?;
        Ok(Construct::If(IfConstruct {
            condition,
            head,
            block: ExecutionPart(nodes),
            else_part,
            end,
        }))
    }

    /// Chain of `else if` / `else` parts after a block, ending at `end if`.
    fn else_part(
        &mut self,
        terminator: Terminator,
        line: u32,
    ) -> Result<(Option<Box<ElsePart>>, Span), TreeError> {
        match terminator.statement {
            Statement::ElseIfStmt { condition } => {
                let stop = |s: &Statement| {
                    matches!(
                        s,
                        Statement::EndStmt { .. } | Statement::ElseIfStmt { .. } | Statement::ElseStmt
                    )
                };
                let (nodes, next) = self.body(line, "if construct", stop)?;
                let (next, end) = self.else_part(next, line)?;
                Ok((
                    Some(Box::new(ElsePart::ElseIf {
                        condition,
                        block: ExecutionPart(nodes),
                        next,
                    })),
                    end,
                ))
            }
            Statement::ElseStmt => {
                let (nodes, end) =
                    self.body(line, "if construct", |s| matches!(s, Statement::EndStmt { .. }))?;
                expect_end(&end, &["if"])?;
                Ok((
                    Some(Box::new(ElsePart::Else {
                        block: ExecutionPart(nodes),
                    })),
                    end.span,
                ))
            }
            _ => {
                expect_end(&terminator, &["if"])?;
                Ok((None, terminator.span))
            }
        }
    }
}

fn end_text(keyword: &str) -> String {
    if keyword.is_empty() {
        "'end'".to_string()
    } else {
        format!("'end {}'", keyword)
    }
}

fn expect_end(end: &Terminator, accepted: &[&str]) -> Result<(), TreeError> {
    match &end.statement {
        Statement::EndStmt { keyword } if accepted.contains(&keyword.as_str()) => Ok(()),
        Statement::EndStmt { keyword } => Err(TreeError::at(
            end.line,
            format!(
                "unexpected {}, expected {}",
                end_text(keyword),
                end_text(accepted.last().copied().unwrap_or(""))
            ),
        )),
        _ => Err(TreeError::at(end.line, "unexpected statement")),
    }
}

/// Parse `text` into the top-level nodes of a file.
pub fn parse(text: &str) -> Result<Vec<TreeNode>, TreeError> {
    let pieces = reader::read(text)
        .into_iter()
        .map(piece)
        .collect::<Result<Vec<_>, _>>()?;
    let mut builder = Builder {
        pieces: pieces.into_iter(),
    };
    let mut nodes = Vec::new();
    while let Some(piece) = builder.pieces.next() {
        match piece {
            Piece::Leaf(node) => nodes.push(node),
            Piece::Statement {
                statement,
                span,
                line,
            } => nodes.push(builder.node(statement, span, line)?),
        }
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(nodes: &[TreeNode]) -> &ProgramUnit {
        nodes
            .iter()
            .find_map(|n| match &n.construct {
                Construct::ProgramUnit(u) => Some(u),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn builds_specification_and_execution_parts() {
        let text = "subroutine s(a)\n  integer :: a\n  ! before body\n  a = 1\nend subroutine s\n";
        let nodes = parse(text).unwrap();
        let u = unit(&nodes);
        assert_eq!(u.specification.0.len(), 1);
        assert_eq!(u.execution.0.len(), 2);
        assert_eq!(nodes[0].span, Span::new(0, text.len() - 1));
    }

    #[test]
    fn else_if_chain_nests() {
        let text = "if (a) then\n x = 1\nelse if (b) then\n x = 2\nelse\n x = 3\nend if\n";
        let nodes = parse(text).unwrap();
        match &nodes[0].construct {
            Construct::If(c) => match c.else_part.as_deref() {
                Some(ElsePart::ElseIf { next, .. }) => {
                    assert!(matches!(next.as_deref(), Some(ElsePart::Else { .. })))
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn contained_procedures() {
        let text = "module m\n  integer :: n\ncontains\n  subroutine a\n  end subroutine a\nend module m\n";
        let nodes = parse(text).unwrap();
        let u = unit(&nodes);
        assert_eq!(u.specification.0.len(), 1);
        assert_eq!(u.internal.as_ref().map(|i| i.subprograms.len()), Some(1));
    }

    #[test]
    fn mismatched_end_is_an_error() {
        let err = parse("subroutine s\n  do i = 1, 2\n  end if\nend\n").unwrap_err();
        assert_eq!(err.line, 3);
        let err = parse("subroutine s\n  x = 1\n").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("missing end"));
    }
}
