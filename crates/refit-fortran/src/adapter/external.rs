//! External engine to IR.
//!
//! The external tree has line numbers but no byte offsets; spans are
//! recovered from the reader's logical lines. Comments are not in the tree,
//! so the unit is marked as carrying no comment nodes.

use std::path::Path;

use refit_core::ir::{
    Arena, Attr, BinaryOp, Branch, DeclEntity, Intent, JumpKind, LiteralKind, NodeId, NodeKind,
    RoutineKind, TypeSpec, UnaryOp, UseItem,
};
use refit_core::text::line_starts;
use refit_core::types::Span;

use super::{FrontendKind, FrontendOptions, LowerError, Lowering, Part};
use crate::engines::external::{
    self, ExternalError, Invocation, XEntity, XExpr, XKind, XLiteral, XNode, XType,
};
use crate::engines::{keyword_role, Role};
use crate::reader::{leading_word, logical_lines, LogicalLine};

impl From<ExternalError> for LowerError {
    fn from(err: ExternalError) -> Self {
        match err {
            ExternalError::Reported {
                message,
                line: Some(line),
                column,
            } => LowerError::new(FrontendKind::External, message).at(line, column),
            other => LowerError::new(FrontendKind::External, other.to_string()),
        }
    }
}

/// Line numbers of a node.
#[derive(Debug, Clone, Copy)]
struct Pos {
    lineno: Option<u32>,
    end_lineno: Option<u32>,
}

impl Pos {
    fn of(node: &XNode) -> Self {
        Pos {
            lineno: node.lineno,
            end_lineno: node.end_lineno,
        }
    }
}

fn invalid(pos: Pos, message: impl Into<String>) -> LowerError {
    let err = LowerError::new(FrontendKind::External, message);
    match pos.lineno {
        Some(line) => err.at(line, None),
        None => err,
    }
}

/// Physical line numbers to spans.
struct LineMap {
    logical: Vec<LogicalLine>,
    starts: Vec<usize>,
    len: usize,
}

impl LineMap {
    fn new(text: &str) -> Self {
        LineMap {
            logical: logical_lines(text),
            starts: line_starts(text),
            len: text.len(),
        }
    }

    /// Span of the logical line covering physical line `line`.
    fn line(&self, line: u32) -> Option<Span> {
        if let Some(l) = self
            .logical
            .iter()
            .find(|l| l.line <= line && line <= l.end_line)
        {
            return Some(l.span);
        }
        let start = *self.starts.get(line.checked_sub(1)? as usize)?;
        let end = self
            .starts
            .get(line as usize)
            .map_or(self.len, |next| next.saturating_sub(1));
        (start <= end).then(|| Span::new(start, end))
    }

    fn statement(&self, pos: Pos) -> Option<Span> {
        let lineno = pos.lineno?;
        let first = self.line(lineno)?;
        let last = self.line(pos.end_lineno.unwrap_or(lineno))?;
        Some(first.cover(&last))
    }

    fn container(&self, pos: Pos) -> Option<(Span, Span)> {
        Some((self.line(pos.lineno?)?, self.line(pos.end_lineno?)?))
    }
}

struct Lower<'t> {
    low: Lowering<'t>,
    lines: LineMap,
    text: &'t str,
}

impl Lower<'_> {
    fn statement(&mut self, kind: NodeKind, pos: Pos) -> NodeId {
        let span = self.lines.statement(pos);
        self.low.arena.alloc_spanned(kind, span)
    }

    fn container(&mut self, kind: NodeKind, pos: Pos) -> NodeId {
        match self.lines.container(pos) {
            Some((head, tail)) => self.low.container(kind, head, tail),
            None => self.low.node(kind),
        }
    }

    fn role(&self, node: &XNode) -> Role {
        match &node.kind {
            XKind::Use { .. }
            | XKind::Implicit { .. }
            | XKind::Declaration { .. }
            | XKind::Include { .. } => Role::Spec,
            XKind::Pragma { .. } => Role::Neutral,
            XKind::Verbatim => {
                let first = self
                    .lines
                    .statement(Pos::of(node))
                    .and_then(|s| self.text.get(s.start..s.end))
                    .unwrap_or("");
                keyword_role(&leading_word(&first.trim_start().to_ascii_lowercase()))
            }
            _ => Role::Exec,
        }
    }

    fn nodes(&mut self, nodes: Vec<XNode>) -> Result<Vec<NodeId>, LowerError> {
        nodes.into_iter().map(|n| self.node(n)).collect()
    }

    /// Body of a routine or block, split into specification and execution.
    fn part(&mut self, nodes: Vec<XNode>) -> Result<(Vec<NodeId>, Vec<NodeId>), LowerError> {
        let mut part = Part::default();
        for node in nodes {
            let role = self.role(&node);
            part.push(self.node(node)?, role);
        }
        Ok(part.split())
    }

    fn node(&mut self, node: XNode) -> Result<NodeId, LowerError> {
        let pos = Pos::of(&node);
        let kind = match node.kind {
            XKind::File { .. } | XKind::Error { .. } => {
                return Err(invalid(pos, "unexpected nested file or error node"))
            }
            XKind::Module {
                name,
                children,
                contains,
            } => {
                let spec = self.nodes(children)?;
                let routines = self.nodes(contains)?;
                let kind = NodeKind::Module {
                    name,
                    spec,
                    routines,
                };
                return Ok(self.container(kind, pos));
            }
            XKind::Program {
                name,
                children,
                contains,
            } => {
                let kind = RoutineKind::Program;
                return self.routine(pos, name, kind, vec![], vec![], children, contains);
            }
            XKind::Subroutine {
                name,
                prefixes,
                params,
                children,
                contains,
            } => {
                let kind = RoutineKind::Subroutine;
                return self.routine(pos, name, kind, prefixes, params, children, contains);
            }
            XKind::Function {
                name,
                prefixes,
                params,
                result,
                return_type,
                children,
                contains,
            } => {
                let kind = RoutineKind::Function {
                    result,
                    return_type: return_type.map(type_spec),
                };
                return self.routine(pos, name, kind, prefixes, params, children, contains);
            }
            XKind::Use {
                module,
                intrinsic,
                only,
            } => NodeKind::Use {
                module,
                intrinsic,
                only: only.map(|items| {
                    items
                        .into_iter()
                        .map(|i| UseItem {
                            name: i.name,
                            rename: i.rename,
                        })
                        .collect()
                }),
            },
            XKind::Implicit { spec } => NodeKind::Implicit {
                spec: spec.trim().to_string(),
            },
            XKind::Declaration {
                type_spec: ty,
                attrs,
                entities,
            } => NodeKind::Declaration {
                type_spec: type_spec(ty),
                attrs: attrs.iter().map(String::as_str).map(attribute).collect(),
                entities: entities
                    .into_iter()
                    .map(|e| self.entity(e, pos))
                    .collect::<Result<_, _>>()?,
            },
            XKind::Include { path } => NodeKind::Include { path },
            XKind::Assignment {
                target,
                value,
                pointer,
            } => NodeKind::Assignment {
                target: self.expr(target, pos)?,
                value: self.expr(value, pos)?,
                pointer,
            },
            XKind::Call { name, args } => NodeKind::Call {
                name,
                args: self.exprs(args, pos)?,
            },
            XKind::Do {
                variable,
                start,
                end,
                step,
                children,
            } => {
                let kind = NodeKind::Loop {
                    variable,
                    start: self.expr(start, pos)?,
                    end: self.expr(end, pos)?,
                    step: step.map(|s| self.expr(s, pos)).transpose()?,
                    body: self.nodes(children)?,
                };
                return Ok(self.container(kind, pos));
            }
            XKind::DoWhile {
                condition,
                children,
            } => {
                let kind = NodeKind::WhileLoop {
                    condition: condition.map(|c| self.expr(c, pos)).transpose()?,
                    body: self.nodes(children)?,
                };
                return Ok(self.container(kind, pos));
            }
            XKind::If {
                branches,
                else_children,
                inline,
            } => {
                let mut lowered = Vec::with_capacity(branches.len());
                for branch in branches {
                    lowered.push(Branch {
                        condition: self.expr(branch.condition, pos)?,
                        body: if inline {
                            self.inline_body(branch.children)?
                        } else {
                            self.nodes(branch.children)?
                        },
                    });
                }
                let else_body = else_children.map(|c| self.nodes(c)).transpose()?;
                let kind = NodeKind::Conditional {
                    branches: lowered,
                    else_body,
                    inline,
                };
                if inline {
                    return Ok(self.statement(kind, pos));
                }
                return Ok(self.container(kind, pos));
            }
            XKind::Block { children } => {
                let (spec, body) = self.part(children)?;
                return Ok(self.container(NodeKind::Block { spec, body }, pos));
            }
            XKind::Return => NodeKind::Jump {
                kind: JumpKind::Return,
            },
            XKind::Exit => NodeKind::Jump {
                kind: JumpKind::Exit,
            },
            XKind::Cycle => NodeKind::Jump {
                kind: JumpKind::Cycle,
            },
            XKind::Pragma { text } => {
                return match self.lines.statement(pos) {
                    Some(span) => Ok(self.low.directive(&text, span)),
                    None => Err(invalid(pos, "pragma without a line number")),
                };
            }
            XKind::Verbatim => {
                return match self.lines.statement(pos) {
                    Some(span) => Ok(self.low.verbatim(span)),
                    None => Err(invalid(pos, "verbatim node without line numbers")),
                };
            }
        };
        Ok(self.statement(kind, pos))
    }

    /// Inner statement of a one-line `if`: no span of its own.
    fn inline_body(&mut self, children: Vec<XNode>) -> Result<Vec<NodeId>, LowerError> {
        let mut body = Vec::with_capacity(children.len());
        for child in children {
            let id = self.node(child)?;
            self.low.arena.set_span(id, None);
            body.push(id);
        }
        Ok(body)
    }

    #[allow(clippy::too_many_arguments)]
    fn routine(
        &mut self,
        pos: Pos,
        name: String,
        kind: RoutineKind,
        prefixes: Vec<String>,
        params: Vec<String>,
        children: Vec<XNode>,
        contains: Vec<XNode>,
    ) -> Result<NodeId, LowerError> {
        let (spec, body) = self.part(children)?;
        let routines = self.nodes(contains)?;
        let kind = NodeKind::Routine {
            name,
            kind,
            prefixes: prefixes.iter().map(|p| p.to_ascii_lowercase()).collect(),
            params,
            spec,
            body,
            routines,
        };
        Ok(self.container(kind, pos))
    }

    fn entity(&mut self, entity: XEntity, pos: Pos) -> Result<DeclEntity, LowerError> {
        Ok(DeclEntity {
            name: entity.name,
            shape: self.exprs(entity.shape, pos)?,
            init: entity.init.map(|e| self.expr(e, pos)).transpose()?,
            pointer_init: entity.pointer_init,
        })
    }

    fn exprs(&mut self, exprs: Vec<XExpr>, pos: Pos) -> Result<Vec<NodeId>, LowerError> {
        exprs.into_iter().map(|e| self.expr(e, pos)).collect()
    }

    fn expr(&mut self, expr: XExpr, pos: Pos) -> Result<NodeId, LowerError> {
        let kind = match expr {
            XExpr::Literal { kind, text } => NodeKind::Literal {
                kind: match kind {
                    XLiteral::Integer => LiteralKind::Integer,
                    XLiteral::Real => LiteralKind::Real,
                    XLiteral::Logical => LiteralKind::Logical,
                    XLiteral::String => LiteralKind::String,
                },
                text,
            },
            XExpr::Var { name } => NodeKind::Variable { name },
            XExpr::Subscript { name, args } => NodeKind::Subscript {
                name,
                indices: self.exprs(args, pos)?,
            },
            XExpr::Range {
                lower,
                upper,
                stride,
            } => NodeKind::Range {
                lower: lower.map(|e| self.expr(*e, pos)).transpose()?,
                upper: upper.map(|e| self.expr(*e, pos)).transpose()?,
                stride: stride.map(|e| self.expr(*e, pos)).transpose()?,
            },
            XExpr::Keyword { name, value } => NodeKind::KeywordArg {
                name,
                value: self.expr(*value, pos)?,
            },
            XExpr::Binary { op, lhs, rhs } => {
                let Some(op) = BinaryOp::from_symbol(&op) else {
                    return Err(invalid(pos, format!("unknown binary operator '{}'", op)));
                };
                NodeKind::Binary {
                    op,
                    lhs: self.expr(*lhs, pos)?,
                    rhs: self.expr(*rhs, pos)?,
                }
            }
            XExpr::Unary { op, operand } => {
                let op = match op.to_ascii_lowercase().as_str() {
                    "-" => UnaryOp::Neg,
                    "+" => UnaryOp::Plus,
                    ".not." => UnaryOp::Not,
                    other => {
                        return Err(invalid(pos, format!("unknown unary operator '{}'", other)))
                    }
                };
                NodeKind::Unary {
                    op,
                    operand: self.expr(*operand, pos)?,
                }
            }
            XExpr::Paren { inner } => NodeKind::Paren {
                inner: self.expr(*inner, pos)?,
            },
        };
        Ok(self.low.node(kind))
    }
}

fn type_spec(ty: XType) -> TypeSpec {
    TypeSpec::new(&ty.base, ty.selector.as_deref())
}

/// Attribute spec as written: `intent(in)` or a keyword.
fn attribute(text: &str) -> Attr {
    let lower = text.trim().to_ascii_lowercase();
    lower
        .strip_prefix("intent")
        .map(str::trim)
        .and_then(|rest| rest.strip_prefix('(')?.strip_suffix(')'))
        .and_then(Intent::parse)
        .map_or_else(|| Attr::from_keyword(&lower), Attr::Intent)
}

/// Run the external program on `text` and lower its tree.
pub(crate) fn lower(
    options: &FrontendOptions,
    path: &Path,
    text: &str,
) -> Result<(Arena, NodeId), LowerError> {
    let command = options
        .command
        .as_deref()
        .ok_or(ExternalError::NoCommand)?;
    let invocation = Invocation {
        command,
        include_dirs: &options.include_dirs,
        path,
        text,
        timeout: options.timeout,
    };
    let root = external::run(&invocation, options.limiter.as_ref())?;
    lower_tree(root, text)
}

/// Lower an already decoded tree.
pub(crate) fn lower_tree(root: XNode, text: &str) -> Result<(Arena, NodeId), LowerError> {
    let XKind::File { children } = root.kind else {
        return Err(LowerError::new(
            FrontendKind::External,
            "tree root is not a file node",
        ));
    };
    let mut lower = Lower {
        low: Lowering::new(text),
        lines: LineMap::new(text),
        text,
    };
    let items = lower.nodes(children)?;
    Ok(lower.low.finish(items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::external::parse_tree;

    const SOURCE: &str = "subroutine s(a)\n  ! dropped\n  real, intent(in) :: a(n)\n  !$acc kernels\n  call b(a + 1)\nend subroutine s\n";

    fn tree() -> XNode {
        parse_tree(
            r#"{"tag": "file", "children": [{
                "tag": "subroutine", "name": "s", "params": ["a"],
                "lineno": 1, "end_lineno": 6,
                "children": [
                    {"tag": "declaration", "lineno": 3,
                     "type": {"base": "real"}, "attrs": ["intent(in)"],
                     "entities": [{"name": "a", "shape": [{"tag": "var", "name": "n"}]}]},
                    {"tag": "pragma", "text": "!$acc kernels", "lineno": 4},
                    {"tag": "call", "name": "b", "lineno": 5,
                     "args": [{"tag": "binary", "op": "+",
                               "lhs": {"tag": "var", "name": "a"},
                               "rhs": {"tag": "literal", "kind": "integer", "text": "1"}}]}
                ]}]}"#,
        )
        .unwrap()
    }

    #[test]
    fn spans_come_from_line_numbers() {
        let (arena, root) = lower_tree(tree(), SOURCE).unwrap();
        let NodeKind::File { items } = arena.kind(root) else {
            panic!("not a file");
        };
        let routine = items[0];
        assert_eq!(arena.head(routine), Some(Span::new(0, 15)));
        let NodeKind::Routine { spec, body, .. } = arena.kind(routine) else {
            panic!("not a routine");
        };
        assert_eq!(spec.len(), 1);
        assert_eq!(body.len(), 2);
        let decl = arena.span(spec[0]).unwrap();
        assert_eq!(&SOURCE[decl.start..decl.end], "  real, intent(in) :: a(n)");
        assert!(matches!(arena.kind(body[0]), NodeKind::Pragma { keyword, .. } if keyword == "acc"));
    }

    #[test]
    fn attributes_parse_intent() {
        assert_eq!(attribute("INTENT (inout)"), Attr::Intent(Intent::InOut));
        assert_eq!(attribute("save"), Attr::Save);
    }

    #[test]
    fn unknown_operators_are_rejected() {
        let root = parse_tree(
            r#"{"tag": "file", "children": [{"tag": "assignment", "lineno": 1,
                "target": {"tag": "var", "name": "x"},
                "value": {"tag": "binary", "op": "<>",
                          "lhs": {"tag": "var", "name": "a"},
                          "rhs": {"tag": "var", "name": "b"}}}]}"#,
        )
        .unwrap();
        let err = lower_tree(root, "x = a <> b\n").unwrap_err();
        assert_eq!(err.line, Some(1));
    }
}
