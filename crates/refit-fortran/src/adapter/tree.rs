//! Tree engine to IR.
//!
//! Flattens the wrapper nodes (specification and execution parts, internal
//! subprogram parts, loop controls, chained else parts).

use refit_core::ir::{
    Arena, Attr, Branch, DeclEntity, JumpKind, LiteralKind, NodeId, NodeKind, RoutineKind,
};

use super::{FrontendKind, LowerError, Lowering};
use crate::engines::tree::cst::{
    Construct, DeclAttr, ElsePart, EntityDecl, Expr, IfConstruct, Initialization, LoopControl,
    ProgramUnit, Statement, TreeNode, UnitHeader,
};
use crate::engines::tree::{self, TreeError};

impl From<TreeError> for LowerError {
    fn from(err: TreeError) -> Self {
        LowerError::new(FrontendKind::Tree, err.message).at(err.line, err.column)
    }
}

struct Lower<'t> {
    low: Lowering<'t>,
}

impl Lower<'_> {
    fn nodes(&mut self, nodes: Vec<TreeNode>) -> Vec<NodeId> {
        nodes.into_iter().map(|n| self.node(n)).collect()
    }

    fn node(&mut self, node: TreeNode) -> NodeId {
        let span = node.span;
        match node.construct {
            Construct::Comment { text } => self.low.comment(&text, span),
            Construct::Directive { text } => self.low.directive(&text, span),
            Construct::Preprocessor { text } => self.low.preprocessor(&text, span),
            Construct::Opaque { .. } | Construct::Unparsed { .. } => self.low.verbatim(span),
            Construct::Statement(statement) => match self.statement(statement) {
                Some(kind) => self.low.statement(kind, span),
                None => self.low.verbatim(span),
            },
            Construct::IfStmt {
                condition,
                action,
                text,
            } => {
                let condition = self.expr(condition);
                let inner = match action.and_then(|a| self.statement(a)) {
                    Some(kind) => kind,
                    None => NodeKind::Verbatim { text },
                };
                let inner = self.low.node(inner);
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
            Construct::ProgramUnit(unit) => self.unit(unit),
            Construct::Do(construct) => {
                let body = self.nodes(construct.block.0);
                let kind = match construct.control {
                    Some(LoopControl::Counted {
                        variable,
                        start,
                        end,
                        step,
                    }) => NodeKind::Loop {
                        variable,
                        start: self.expr(start),
                        end: self.expr(end),
                        step: step.map(|s| self.expr(s)),
                        body,
                    },
                    Some(LoopControl::While(condition)) => NodeKind::WhileLoop {
                        condition: Some(self.expr(condition)),
                        body,
                    },
                    None => NodeKind::WhileLoop {
                        condition: None,
                        body,
                    },
                };
                self.low.container(kind, construct.head, construct.end)
            }
            Construct::If(construct) => self.conditional(construct),
            Construct::Block(construct) => {
                let spec = self.nodes(construct.specification.0);
                let body = self.nodes(construct.execution.0);
                self.low
                    .container(NodeKind::Block { spec, body }, construct.head, construct.end)
            }
        }
    }

    fn unit(&mut self, unit: ProgramUnit) -> NodeId {
        let spec = self.nodes(unit.specification.0);
        let body = self.nodes(unit.execution.0);
        let routines = unit
            .internal
            .map(|part| self.nodes(part.subprograms))
            .unwrap_or_default();
        let kind = match unit.header {
            UnitHeader::Module { name } => NodeKind::Module {
                name,
                spec,
                routines,
            },
            UnitHeader::Program { name } => NodeKind::Routine {
                name,
                kind: RoutineKind::Program,
                prefixes: Vec::new(),
                params: Vec::new(),
                spec,
                body,
                routines,
            },
            UnitHeader::Subroutine {
                prefixes,
                name,
                dummies,
            } => NodeKind::Routine {
                name,
                kind: RoutineKind::Subroutine,
                prefixes,
                params: dummies,
                spec,
                body,
                routines,
            },
            UnitHeader::Function {
                prefixes,
                type_spec,
                name,
                dummies,
                result,
            } => NodeKind::Routine {
                name,
                kind: RoutineKind::Function {
                    result,
                    return_type: type_spec,
                },
                prefixes,
                params: dummies,
                spec,
                body,
                routines,
            },
        };
        self.low.container(kind, unit.head, unit.end)
    }

    fn conditional(&mut self, construct: IfConstruct) -> NodeId {
        let mut branches = vec![Branch {
            condition: self.expr(construct.condition),
            body: self.nodes(construct.block.0),
        }];
        let mut else_body = None;
        let mut part = construct.else_part;
        while let Some(next) = part {
            match *next {
                ElsePart::ElseIf {
                    condition,
                    block,
                    next,
                } => {
                    branches.push(Branch {
                        condition: self.expr(condition),
                        body: self.nodes(block.0),
                    });
                    part = next;
                }
                ElsePart::Else { block } => {
                    else_body = Some(self.nodes(block.0));
                    part = None;
                }
            }
        }
        self.low.container(
            NodeKind::Conditional {
                branches,
                else_body,
                inline: false,
            },
            construct.head,
            construct.end,
        )
    }

    /// Node content of a single statement; `None` for statements with no
    /// IR form.
    fn statement(&mut self, statement: Statement) -> Option<NodeKind> {
        Some(match statement {
            Statement::UseStmt {
                intrinsic,
                module,
                only,
            } => NodeKind::Use {
                module,
                intrinsic,
                only,
            },
            Statement::ImplicitStmt { spec } => NodeKind::Implicit { spec },
            Statement::IncludeLine { path } => NodeKind::Include { path },
            Statement::TypeDeclarationStmt {
                type_spec,
                attrs,
                entities,
            } => {
                let mut dimension = None;
                let mut kept = Vec::new();
                for attr in attrs {
                    match attr {
                        DeclAttr::Intent(intent) => kept.push(Attr::Intent(intent)),
                        DeclAttr::Dimension(extents) => dimension = Some(extents),
                        DeclAttr::Spec(text) => kept.push(Attr::from_keyword(&text)),
                    }
                }
                let entities = entities
                    .into_iter()
                    .map(|e| self.entity(e, dimension.as_deref()))
                    .collect();
                NodeKind::Declaration {
                    type_spec,
                    attrs: kept,
                    entities,
                }
            }
            Statement::AssignmentStmt { target, value } => NodeKind::Assignment {
                target: self.expr(target),
                value: self.expr(value),
                pointer: false,
            },
            Statement::PointerAssignmentStmt { target, value } => NodeKind::Assignment {
                target: self.expr(target),
                value: self.expr(value),
                pointer: true,
            },
            Statement::CallStmt { name, args } => NodeKind::Call {
                name,
                args: args.into_iter().map(|a| self.expr(a)).collect(),
            },
            Statement::ReturnStmt => NodeKind::Jump {
                kind: JumpKind::Return,
            },
            Statement::ExitStmt => NodeKind::Jump {
                kind: JumpKind::Exit,
            },
            Statement::CycleStmt => NodeKind::Jump {
                kind: JumpKind::Cycle,
            },
            _ => return None,
        })
    }

    fn entity(&mut self, entity: EntityDecl, dimension: Option<&[Expr]>) -> DeclEntity {
        let extents = entity
            .array_spec
            .or_else(|| dimension.map(<[Expr]>::to_vec))
            .unwrap_or_default();
        let shape = extents.into_iter().map(|e| self.expr(e)).collect();
        let (init, pointer_init) = match entity.init {
            Some(Initialization::Value(e)) => (Some(self.expr(e)), false),
            Some(Initialization::Target(e)) => (Some(self.expr(e)), true),
            None => (None, false),
        };
        DeclEntity {
            name: entity.name,
            shape,
            init,
            pointer_init,
        }
    }

    fn expr(&mut self, expr: Expr) -> NodeId {
        let literal = |kind, text| NodeKind::Literal { kind, text };
        let kind = match expr {
            Expr::IntLiteral(text) => literal(LiteralKind::Integer, text),
            Expr::RealLiteral(text) => literal(LiteralKind::Real, text),
            Expr::CharLiteral(text) => literal(LiteralKind::String, text),
            Expr::LogicalLiteral(text) => literal(LiteralKind::Logical, text),
            Expr::Star => literal(LiteralKind::Integer, "*".to_string()),
            Expr::Name(name) => NodeKind::Variable { name },
            Expr::Reference { name, args } => NodeKind::Subscript {
                name,
                indices: args.into_iter().map(|a| self.expr(a)).collect(),
            },
            Expr::Triplet {
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
            Expr::Binary(op, lhs, rhs) => NodeKind::Binary {
                op,
                lhs: self.expr(*lhs),
                rhs: self.expr(*rhs),
            },
            Expr::Unary(op, operand) => NodeKind::Unary {
                op,
                operand: self.expr(*operand),
            },
            Expr::Parens(inner) => NodeKind::Paren {
                inner: self.expr(*inner),
            },
        };
        self.low.node(kind)
    }
}

/// Parse `text` with the tree engine and lower it to IR.
pub(crate) fn lower(text: &str) -> Result<(Arena, NodeId), LowerError> {
    let nodes = tree::parse(text)?;
    let mut lower = Lower {
        low: Lowering::new(text),
    };
    let items = lower.nodes(nodes);
    Ok(lower.low.finish(items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use refit_core::types::Span;

    #[test]
    fn loop_controls_unify() {
        let text = "subroutine s\n  do i = 1, n, 2\n  end do\n  do while (x)\n  end do\n  do\n  end do\nend\n";
        let (arena, root) = lower(text).unwrap();
        let NodeKind::File { items } = arena.kind(root) else {
            panic!("not a file");
        };
        let NodeKind::Routine { body, .. } = arena.kind(items[0]) else {
            panic!("not a routine");
        };
        assert!(matches!(arena.kind(body[0]), NodeKind::Loop { step: Some(_), .. }));
        assert!(matches!(arena.kind(body[1]), NodeKind::WhileLoop { condition: Some(_), .. }));
        assert!(matches!(arena.kind(body[2]), NodeKind::WhileLoop { condition: None, .. }));
        assert_eq!(arena.head(body[0]), Some(Span::new(13, 29)));
    }

    #[test]
    fn pointer_initialization_and_intent() {
        let text = "subroutine s(p)\n  real, pointer, intent(inout) :: p(:) => null()\nend\n";
        let (arena, root) = lower(text).unwrap();
        let decl = arena
            .descendants(root)
            .into_iter()
            .find(|&id| matches!(arena.kind(id), NodeKind::Declaration { .. }))
            .unwrap();
        let NodeKind::Declaration { attrs, entities, .. } = arena.kind(decl) else {
            unreachable!();
        };
        assert_eq!(
            attrs,
            &vec![Attr::Pointer, Attr::Intent(refit_core::ir::Intent::InOut)]
        );
        assert!(entities[0].pointer_init);
        assert_eq!(entities[0].shape.len(), 1);
    }

    #[test]
    fn unparsed_statements_keep_their_lines() {
        let text = "subroutine s\n  print *, 'a', &\n    'b'\nend\n";
        let (arena, root) = lower(text).unwrap();
        let verbatim = arena
            .descendants(root)
            .into_iter()
            .find(|&id| matches!(arena.kind(id), NodeKind::Verbatim { .. }))
            .unwrap();
        assert_eq!(
            arena.kind(verbatim),
            &NodeKind::Verbatim {
                text: "print *, 'a', &\n  'b'".into()
            }
        );
    }

    #[test]
    fn tree_errors_carry_positions() {
        let err = lower("subroutine s\n  do i =\nend\n").unwrap_err();
        assert_eq!(err.line, Some(2));
        assert!(err.column.is_some());
    }
}
