//! Lines engine to IR.
//!
//! The engine's output is flat, so nesting is rebuilt here with a stack of
//! open frames. Trivia attached to a record is emitted into whatever list is
//! active when the record arrives.

use refit_core::ir::{Branch, DeclEntity, NodeId, NodeKind, RoutineKind};
use refit_core::types::Span;

use super::{FrontendKind, LowerError, Lowering, Part};
use crate::engines::lines::{self, Entity, Expr, LinesError, Payload, Record, Stmt, Trivia};
use crate::engines::{keyword_role, Role};

impl From<LinesError> for LowerError {
    fn from(err: LinesError) -> Self {
        LowerError::new(FrontendKind::Lines, err.message).at(err.line, Some(err.column))
    }
}

fn error(line: u32, message: impl Into<String>) -> LowerError {
    LowerError::new(FrontendKind::Lines, message).at(line, None)
}

fn end_text(keyword: &str) -> String {
    if keyword.is_empty() {
        "'end'".to_string()
    } else {
        format!("'end {}'", keyword)
    }
}

// ============================================================================
// Frames
// ============================================================================

enum Header {
    Module {
        name: String,
    },
    Routine {
        name: String,
        kind: RoutineKind,
        prefixes: Vec<String>,
        params: Vec<String>,
    },
}

impl Header {
    fn end_keyword(&self) -> &'static str {
        match self {
            Header::Module { .. } => "module",
            Header::Routine { kind, .. } => kind.keyword(),
        }
    }
}

enum FrameKind {
    Unit {
        header: Header,
        part: Part,
        /// Items after `contains`, once seen.
        contained: Option<Vec<NodeId>>,
    },
    Loop {
        variable: String,
        start: NodeId,
        end: NodeId,
        step: Option<NodeId>,
        body: Vec<NodeId>,
    },
    While {
        condition: Option<NodeId>,
        body: Vec<NodeId>,
    },
    If {
        branches: Vec<Branch>,
        /// Condition of the open branch; `None` inside `else`.
        condition: Option<NodeId>,
        body: Vec<NodeId>,
    },
    Block {
        part: Part,
    },
}

impl FrameKind {
    fn what(&self) -> &'static str {
        match self {
            FrameKind::Unit { header, .. } => header.end_keyword(),
            FrameKind::Loop { .. } | FrameKind::While { .. } => "do loop",
            FrameKind::If { .. } => "if construct",
            FrameKind::Block { .. } => "block",
        }
    }

    /// Keywords accepted after `end`.
    fn accepts(&self, keyword: &str) -> bool {
        match self {
            FrameKind::Unit { header, .. } => keyword.is_empty() || keyword == header.end_keyword(),
            FrameKind::Loop { .. } | FrameKind::While { .. } => keyword == "do",
            FrameKind::If { .. } => keyword == "if",
            FrameKind::Block { .. } => keyword == "block",
        }
    }

    fn expected(&self) -> &'static str {
        match self {
            FrameKind::Unit { header, .. } => header.end_keyword(),
            FrameKind::Loop { .. } | FrameKind::While { .. } => "do",
            FrameKind::If { .. } => "if",
            FrameKind::Block { .. } => "block",
        }
    }
}

struct Frame {
    kind: FrameKind,
    head: Span,
    line: u32,
}

// ============================================================================
// Builder
// ============================================================================

struct Builder<'t> {
    low: Lowering<'t>,
    file: Vec<NodeId>,
    stack: Vec<Frame>,
}

impl<'t> Builder<'t> {
    fn push(&mut self, id: NodeId, role: Role) {
        let Some(frame) = self.stack.last_mut() else {
            self.file.push(id);
            return;
        };
        match &mut frame.kind {
            FrameKind::Unit {
                contained: Some(items),
                ..
            } => items.push(id),
            FrameKind::Unit { part, .. } | FrameKind::Block { part } => part.push(id, role),
            FrameKind::Loop { body, .. }
            | FrameKind::While { body, .. }
            | FrameKind::If { body, .. } => body.push(id),
        }
    }

    fn open(&mut self, kind: FrameKind, head: Span, line: u32) {
        self.stack.push(Frame { kind, head, line });
    }

    fn trivia(&mut self, trivia: Trivia) {
        let id = match trivia {
            Trivia::Comment { text, span } => self.low.comment(&text, span),
            Trivia::Directive { text, span } => self.low.directive(&text, span),
            Trivia::Preprocessor { text, span, .. } => self.low.preprocessor(&text, span),
        };
        self.push(id, Role::Neutral);
    }

    fn record(&mut self, record: Record) -> Result<(), LowerError> {
        for trivia in record.leading {
            self.trivia(trivia);
        }
        let (span, line) = (record.span, record.line);
        let stmt = match record.payload {
            Payload::Opaque => {
                let id = self.low.verbatim(span);
                self.push(id, keyword_role(&record.keyword));
                return Ok(());
            }
            Payload::Statement(stmt) => stmt,
        };
        match stmt {
            Stmt::Module { name } => self.open(
                FrameKind::Unit {
                    header: Header::Module { name },
                    part: Part::default(),
                    contained: None,
                },
                span,
                line,
            ),
            Stmt::Program { name } => {
                self.open_routine(name, RoutineKind::Program, vec![], vec![], span, line)
            }
            Stmt::Subroutine {
                name,
                prefixes,
                params,
            } => {
                let kind = RoutineKind::Subroutine;
                self.open_routine(name, kind, prefixes, params, span, line)
            }
            Stmt::Function {
                name,
                prefixes,
                params,
                result,
                return_type,
            } => self.open_routine(
                name,
                RoutineKind::Function {
                    result,
                    return_type,
                },
                prefixes,
                params,
                span,
                line,
            ),
            Stmt::Contains => match self.stack.last_mut() {
                Some(Frame {
                    kind: FrameKind::Unit { contained, .. },
                    ..
                }) if contained.is_none() => *contained = Some(Vec::new()),
                _ => return Err(error(line, "unexpected 'contains'")),
            },
            Stmt::End { keyword } => self.close(&keyword, span, line)?,
            Stmt::Do {
                variable,
                start,
                end,
                step,
            } => {
                let start = self.expr(start);
                let end = self.expr(end);
                let step = step.map(|s| self.expr(s));
                self.open(
                    FrameKind::Loop {
                        variable,
                        start,
                        end,
                        step,
                        body: Vec::new(),
                    },
                    span,
                    line,
                );
            }
            Stmt::DoWhile { condition } => {
                let condition = condition.map(|c| self.expr(c));
                self.open(
                    FrameKind::While {
                        condition,
                        body: Vec::new(),
                    },
                    span,
                    line,
                );
            }
            Stmt::IfThen { condition } => {
                let condition = self.expr(condition);
                self.open(
                    FrameKind::If {
                        branches: Vec::new(),
                        condition: Some(condition),
                        body: Vec::new(),
                    },
                    span,
                    line,
                );
            }
            Stmt::ElseIf { condition } => {
                let next = self.expr(condition);
                self.next_branch(Some(next), line)?;
            }
            Stmt::Else => self.next_branch(None, line)?,
            Stmt::Block => self.open(
                FrameKind::Block {
                    part: Part::default(),
                },
                span,
                line,
            ),
            Stmt::Verbatim => {
                let id = self.low.verbatim(span);
                self.push(id, keyword_role(&record.keyword));
            }
            leaf => {
                let role = match leaf {
                    Stmt::Use { .. }
                    | Stmt::Implicit { .. }
                    | Stmt::Include { .. }
                    | Stmt::Declaration { .. } => Role::Spec,
                    _ => Role::Exec,
                };
                let id = self.leaf(leaf, span);
                self.push(id, role);
            }
        }
        Ok(())
    }

    fn open_routine(
        &mut self,
        name: String,
        kind: RoutineKind,
        prefixes: Vec<String>,
        params: Vec<String>,
        head: Span,
        line: u32,
    ) {
        self.open(
            FrameKind::Unit {
                header: Header::Routine {
                    name,
                    kind,
                    prefixes,
                    params,
                },
                part: Part::default(),
                contained: None,
            },
            head,
            line,
        );
    }

    /// `else if` / `else`: close the open branch of the innermost if.
    fn next_branch(&mut self, next: Option<NodeId>, line: u32) -> Result<(), LowerError> {
        match self.stack.last_mut() {
            Some(Frame {
                kind:
                    FrameKind::If {
                        branches,
                        condition,
                        body,
                    },
                ..
            }) if condition.is_some() => {
                if let Some(done) = condition.take() {
                    branches.push(Branch {
                        condition: done,
                        body: std::mem::take(body),
                    });
                }
                // `None` marks the else branch.
                *condition = next;
                Ok(())
            }
            _ => Err(error(line, "'else' outside of an if construct")),
        }
    }

    fn close(&mut self, keyword: &str, tail: Span, line: u32) -> Result<(), LowerError> {
        let Some(frame) = self.stack.pop() else {
            return Err(error(line, format!("unexpected {}", end_text(keyword))));
        };
        if !frame.kind.accepts(keyword) {
            return Err(error(
                line,
                format!(
                    "unexpected {}, expected {}",
                    end_text(keyword),
                    end_text(frame.kind.expected())
                ),
            ));
        }
        let kind = match frame.kind {
            FrameKind::Unit {
                header,
                part,
                contained,
            } => {
                let routines = contained.unwrap_or_default();
                match header {
                    // Everything before `contains` in a module is specification.
                    Header::Module { name } => NodeKind::Module {
                        name,
                        spec: part.into_ids(),
                        routines,
                    },
                    Header::Routine {
                        name,
                        kind,
                        prefixes,
                        params,
                    } => {
                        let (spec, body) = part.split();
                        NodeKind::Routine {
                            name,
                            kind,
                            prefixes,
                            params,
                            spec,
                            body,
                            routines,
                        }
                    }
                }
            }
            FrameKind::Loop {
                variable,
                start,
                end,
                step,
                body,
            } => NodeKind::Loop {
                variable,
                start,
                end,
                step,
                body,
            },
            FrameKind::While { condition, body } => NodeKind::WhileLoop { condition, body },
            FrameKind::If {
                mut branches,
                condition,
                body,
            } => {
                let else_body = match condition {
                    Some(condition) => {
                        branches.push(Branch { condition, body });
                        None
                    }
                    None => Some(body),
                };
                NodeKind::Conditional {
                    branches,
                    else_body,
                    inline: false,
                }
            }
            FrameKind::Block { part } => {
                let (spec, body) = part.split();
                NodeKind::Block { spec, body }
            }
        };
        let id = self.low.container(kind, frame.head, tail);
        self.push(id, Role::Exec);
        Ok(())
    }

    fn leaf(&mut self, stmt: Stmt, span: Span) -> NodeId {
        match stmt {
            Stmt::InlineIf {
                condition,
                then,
                text,
            } => {
                let condition = self.expr(condition);
                let inner = match *then {
                    Stmt::Verbatim => self.low.node(NodeKind::Verbatim { text }),
                    other => {
                        let kind = self.simple(other);
                        self.low.node(kind)
                    }
                };
                self.low.statement(
                    NodeKind::Conditional {
                        branches: vec![Branch {
                            condition,
                            body: vec![inner],
                        }],
                        else_body: None,
                        inline: true,
                    },
                    span,
                )
            }
            other => {
                let kind = self.simple(other);
                self.low.statement(kind, span)
            }
        }
    }

    /// Node content of a single-line statement.
    fn simple(&mut self, stmt: Stmt) -> NodeKind {
        match stmt {
            Stmt::Use {
                module,
                intrinsic,
                only,
            } => NodeKind::Use {
                module,
                intrinsic,
                only,
            },
            Stmt::Implicit { spec } => NodeKind::Implicit { spec },
            Stmt::Include { path } => NodeKind::Include { path },
            Stmt::Declaration {
                type_spec,
                attrs,
                dimension,
                entities,
            } => {
                let entities = entities
                    .into_iter()
                    .map(|e| self.entity(e, dimension.as_deref()))
                    .collect();
                NodeKind::Declaration {
                    type_spec,
                    attrs,
                    entities,
                }
            }
            Stmt::Assignment {
                target,
                value,
                pointer,
            } => {
                let target = self.expr(target);
                let value = self.expr(value);
                NodeKind::Assignment {
                    target,
                    value,
                    pointer,
                }
            }
            Stmt::Call { name, args } => {
                let args = args.into_iter().map(|a| self.expr(a)).collect();
                NodeKind::Call { name, args }
            }
            Stmt::Jump(kind) => NodeKind::Jump { kind },
            // Structural statements never reach here; keep them as text.
            _ => NodeKind::Verbatim {
                text: String::new(),
            },
        }
    }

    fn entity(&mut self, entity: Entity, dimension: Option<&[Expr]>) -> DeclEntity {
        let extents = if entity.shape.is_empty() {
            dimension.map(<[Expr]>::to_vec).unwrap_or_default()
        } else {
            entity.shape
        };
        let shape = extents.into_iter().map(|e| self.expr(e)).collect();
        let init = entity.init.map(|e| self.expr(e));
        DeclEntity {
            name: entity.name,
            shape,
            init,
            pointer_init: entity.pointer_init,
        }
    }

    fn expr(&mut self, expr: Expr) -> NodeId {
        let kind = match expr {
            Expr::Literal { kind, text } => NodeKind::Literal { kind, text },
            Expr::Name(name) => NodeKind::Variable { name },
            Expr::Apply { name, args } => {
                let indices = args.into_iter().map(|a| self.expr(a)).collect();
                NodeKind::Subscript { name, indices }
            }
            Expr::Range {
                lower,
                upper,
                stride,
            } => NodeKind::Range {
                lower: lower.map(|e| self.expr(*e)),
                upper: upper.map(|e| self.expr(*e)),
                stride: stride.map(|e| self.expr(*e)),
            },
            Expr::Keyword { name, value } => NodeKind::KeywordArg {
                name,
                value: self.expr(*value),
            },
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.expr(*lhs);
                let rhs = self.expr(*rhs);
                NodeKind::Binary { op, lhs, rhs }
            }
            Expr::Unary { op, operand } => NodeKind::Unary {
                op,
                operand: self.expr(*operand),
            },
            Expr::Paren(inner) => NodeKind::Paren {
                inner: self.expr(*inner),
            },
        };
        self.low.node(kind)
    }
}

/// Parse `text` with the lines engine and lower it to IR.
pub(crate) fn lower(text: &str) -> Result<(refit_core::ir::Arena, NodeId), LowerError> {
    let statements = lines::parse(text)?;
    let mut builder = Builder {
        low: Lowering::new(text),
        file: Vec::new(),
        stack: Vec::new(),
    };
    for record in statements.records {
        builder.record(record)?;
    }
    if let Some(frame) = builder.stack.last() {
        return Err(error(frame.line, format!("missing end of {}", frame.kind.what())));
    }
    for trivia in statements.trailing {
        builder.trivia(trivia);
    }
    Ok(builder.low.finish(builder.file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lowered(text: &str) -> (refit_core::ir::Arena, NodeId) {
        lower(text).unwrap()
    }

    fn only_unit(arena: &refit_core::ir::Arena, root: NodeId) -> NodeId {
        match arena.kind(root) {
            NodeKind::File { items } => *items
                .iter()
                .find(|&&i| arena.node_type(i).is_program_unit())
                .unwrap(),
            other => panic!("unexpected root {:?}", other),
        }
    }

    #[test]
    fn routine_parts_and_spans() {
        let text = "subroutine s(a)\n  integer, intent(in) :: a\n  ! note\n  call b(a)\nend subroutine s\n";
        let (arena, root) = lowered(text);
        let unit = only_unit(&arena, root);
        match arena.kind(unit) {
            NodeKind::Routine { spec, body, params, .. } => {
                assert_eq!(params, &vec!["a".to_string()]);
                assert_eq!(spec.len(), 1);
                assert_eq!(body.len(), 2);
                assert!(matches!(arena.kind(body[0]), NodeKind::Comment { text } if text == "! note"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(arena.head(unit), Some(Span::new(0, 15)));
        assert_eq!(arena.span(unit), Some(Span::new(0, text.len() - 1)));
    }

    #[test]
    fn dimension_attribute_goes_into_shapes() {
        let (arena, root) = lowered("subroutine s\n  real, dimension(n) :: a, b(2)\nend\n");
        let unit = only_unit(&arena, root);
        let NodeKind::Routine { spec, .. } = arena.kind(unit) else {
            panic!("not a routine");
        };
        let NodeKind::Declaration { entities, attrs, .. } = arena.kind(spec[0]) else {
            panic!("not a declaration");
        };
        assert!(attrs.is_empty());
        assert_eq!(entities[0].shape.len(), 1);
        assert!(matches!(arena.kind(entities[1].shape[0]), NodeKind::Literal { text, .. } if text == "2"));
    }

    #[test]
    fn else_if_chain_flattens() {
        let text = "subroutine s\n  if (a) then\n    x = 1\n  else if (b) then\n    x = 2\n  else\n    x = 3\n  end if\nend\n";
        let (arena, root) = lowered(text);
        let unit = only_unit(&arena, root);
        let NodeKind::Routine { body, .. } = arena.kind(unit) else {
            panic!("not a routine");
        };
        match arena.kind(body[0]) {
            NodeKind::Conditional {
                branches,
                else_body,
                inline,
            } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(else_body.as_ref().map(Vec::len), Some(1));
                assert!(!inline);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn contained_routines_of_a_module() {
        let text = "module m\n  integer :: n\ncontains\n  subroutine a\n  end subroutine a\nend module m\n";
        let (arena, root) = lowered(text);
        let unit = only_unit(&arena, root);
        match arena.kind(unit) {
            NodeKind::Module { spec, routines, .. } => {
                assert_eq!(spec.len(), 1);
                assert_eq!(routines.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn end_mismatch_and_missing_end() {
        let err = lower("subroutine s\n  do i = 1, 2\n  end if\nend\n").unwrap_err();
        assert_eq!(err.line, Some(3));
        assert!(err.message.contains("expected 'end do'"));
        let err = lower("subroutine s\n  x = 1\n").unwrap_err();
        assert_eq!(err.line, Some(1));
        assert!(err.message.contains("missing end"));
        let err = lower("  else\n").unwrap_err();
        assert!(err.message.contains("outside of an if"));
    }

    #[test]
    fn inline_if_keeps_inner_statement_without_span() {
        let (arena, root) = lowered("subroutine s\n  if (x > 0) call go(x)\nend\n");
        let unit = only_unit(&arena, root);
        let NodeKind::Routine { body, .. } = arena.kind(unit) else {
            panic!("not a routine");
        };
        let NodeKind::Conditional { branches, inline, .. } = arena.kind(body[0]) else {
            panic!("not a conditional");
        };
        assert!(inline);
        let inner = branches[0].body[0];
        assert!(matches!(arena.kind(inner), NodeKind::Call { name, .. } if name == "go"));
        assert_eq!(arena.span(inner), None);
    }
}
