//! Child enumeration and copy-on-write child mapping.

use crate::error::TransformError;

use super::node::{Branch, DeclEntity, NodeKind};
use super::NodeId;

/// How a child slot accepts replacement nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Statement or program-unit list: any number of nodes.
    Statements,
    /// Expression list: every element must map to exactly one node.
    Expressions,
    /// Required single child.
    Single,
    /// Optional single child: zero or one node.
    Optional,
}

impl NodeKind {
    /// Direct children in source order.
    pub fn children(&self) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = Vec::new();
        match self {
            NodeKind::File { items } => out.extend(items),
            NodeKind::Module { spec, routines, .. } => {
                out.extend(spec);
                out.extend(routines);
            }
            NodeKind::Routine {
                spec,
                body,
                routines,
                ..
            } => {
                out.extend(spec);
                out.extend(body);
                out.extend(routines);
            }
            NodeKind::Declaration { entities, .. } => {
                for entity in entities {
                    out.extend(&entity.shape);
                    out.extend(entity.init);
                }
            }
            NodeKind::Assignment { target, value, .. } => {
                out.push(*target);
                out.push(*value);
            }
            NodeKind::Loop {
                start,
                end,
                step,
                body,
                ..
            } => {
                out.push(*start);
                out.push(*end);
                out.extend(*step);
                out.extend(body);
            }
            NodeKind::WhileLoop { condition, body } => {
                out.extend(*condition);
                out.extend(body);
            }
            NodeKind::Conditional {
                branches,
                else_body,
                ..
            } => {
                for branch in branches {
                    out.push(branch.condition);
                    out.extend(&branch.body);
                }
                if let Some(body) = else_body {
                    out.extend(body);
                }
            }
            NodeKind::Call { args, .. } => out.extend(args),
            NodeKind::Block { spec, body } => {
                out.extend(spec);
                out.extend(body);
            }
            NodeKind::Subscript { indices, .. } => out.extend(indices),
            NodeKind::Range {
                lower,
                upper,
                stride,
            } => {
                out.extend(*lower);
                out.extend(*upper);
                out.extend(*stride);
            }
            NodeKind::KeywordArg { value, .. } => out.push(*value),
            NodeKind::Binary { lhs, rhs, .. } => {
                out.push(*lhs);
                out.push(*rhs);
            }
            NodeKind::Unary { operand, .. } => out.push(*operand),
            NodeKind::Paren { inner } => out.push(*inner),
            NodeKind::Use { .. }
            | NodeKind::Implicit { .. }
            | NodeKind::Include { .. }
            | NodeKind::Jump { .. }
            | NodeKind::Comment { .. }
            | NodeKind::Pragma { .. }
            | NodeKind::Verbatim { .. }
            | NodeKind::Literal { .. }
            | NodeKind::Variable { .. } => {}
        }
        out
    }

    /// Statement lists (and program-unit lists) owned by this node.
    pub fn statement_lists(&self) -> Vec<&[NodeId]> {
        match self {
            NodeKind::File { items } => vec![items.as_slice()],
            NodeKind::Module { spec, routines, .. } => vec![spec.as_slice(), routines.as_slice()],
            NodeKind::Routine {
                spec,
                body,
                routines,
                ..
            } => vec![spec.as_slice(), body.as_slice(), routines.as_slice()],
            NodeKind::Loop { body, .. } | NodeKind::WhileLoop { body, .. } => {
                vec![body.as_slice()]
            }
            NodeKind::Conditional {
                branches,
                else_body,
                ..
            } => {
                let mut lists: Vec<&[NodeId]> =
                    branches.iter().map(|b| b.body.as_slice()).collect();
                if let Some(body) = else_body {
                    lists.push(body.as_slice());
                }
                lists
            }
            NodeKind::Block { spec, body } => vec![spec.as_slice(), body.as_slice()],
            _ => Vec::new(),
        }
    }

    /// Children whose text appears on the container's opening line.
    ///
    /// When any of them changes, the recorded head span is stale.
    pub fn header_children(&self) -> Vec<NodeId> {
        match self {
            NodeKind::Loop {
                start, end, step, ..
            } => {
                let mut out = vec![*start, *end];
                out.extend(*step);
                out
            }
            NodeKind::WhileLoop { condition, .. } => condition.iter().copied().collect(),
            NodeKind::Conditional { branches, .. } => {
                branches.iter().take(1).map(|b| b.condition).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Rebuild this node with every child mapped through `f`.
    ///
    /// `f` returns the replacement list for one child. Statement lists accept
    /// any number of nodes; single slots and expression lists require exactly
    /// one, optional slots accept zero or one.
    pub fn try_map_children<F>(&self, mut f: F) -> Result<NodeKind, TransformError>
    where
        F: FnMut(NodeId, SlotKind) -> Result<Vec<NodeId>, TransformError>,
    {
        let owner = self.node_type().name();
        let kind = match self {
            NodeKind::File { items } => NodeKind::File {
                items: map_list(items, &mut f)?,
            },
            NodeKind::Module {
                name,
                spec,
                routines,
            } => NodeKind::Module {
                name: name.clone(),
                spec: map_list(spec, &mut f)?,
                routines: map_list(routines, &mut f)?,
            },
            NodeKind::Routine {
                name,
                kind,
                prefixes,
                params,
                spec,
                body,
                routines,
            } => NodeKind::Routine {
                name: name.clone(),
                kind: kind.clone(),
                prefixes: prefixes.clone(),
                params: params.clone(),
                spec: map_list(spec, &mut f)?,
                body: map_list(body, &mut f)?,
                routines: map_list(routines, &mut f)?,
            },
            NodeKind::Declaration {
                type_spec,
                attrs,
                entities,
            } => {
                let mut mapped = Vec::with_capacity(entities.len());
                for entity in entities {
                    mapped.push(DeclEntity {
                        name: entity.name.clone(),
                        shape: map_exprs(owner, "shape", &entity.shape, &mut f)?,
                        init: map_opt(owner, "init", entity.init, &mut f)?,
                        pointer_init: entity.pointer_init,
                    });
                }
                NodeKind::Declaration {
                    type_spec: type_spec.clone(),
                    attrs: attrs.clone(),
                    entities: mapped,
                }
            }
            NodeKind::Assignment {
                target,
                value,
                pointer,
            } => NodeKind::Assignment {
                target: map_one(owner, "target", *target, &mut f)?,
                value: map_one(owner, "value", *value, &mut f)?,
                pointer: *pointer,
            },
            NodeKind::Loop {
                variable,
                start,
                end,
                step,
                body,
            } => NodeKind::Loop {
                variable: variable.clone(),
                start: map_one(owner, "start", *start, &mut f)?,
                end: map_one(owner, "end", *end, &mut f)?,
                step: map_opt(owner, "step", *step, &mut f)?,
                body: map_list(body, &mut f)?,
            },
            NodeKind::WhileLoop { condition, body } => NodeKind::WhileLoop {
                condition: match condition {
                    Some(c) => Some(map_one(owner, "condition", *c, &mut f)?),
                    None => None,
                },
                body: map_list(body, &mut f)?,
            },
            NodeKind::Conditional {
                branches,
                else_body,
                inline,
            } => {
                let mut mapped = Vec::with_capacity(branches.len());
                for branch in branches {
                    mapped.push(Branch {
                        condition: map_one(owner, "condition", branch.condition, &mut f)?,
                        body: map_list(&branch.body, &mut f)?,
                    });
                }
                NodeKind::Conditional {
                    branches: mapped,
                    else_body: match else_body {
                        Some(body) => Some(map_list(body, &mut f)?),
                        None => None,
                    },
                    inline: *inline,
                }
            }
            NodeKind::Call { name, args } => NodeKind::Call {
                name: name.clone(),
                args: map_exprs(owner, "args", args, &mut f)?,
            },
            NodeKind::Block { spec, body } => NodeKind::Block {
                spec: map_list(spec, &mut f)?,
                body: map_list(body, &mut f)?,
            },
            NodeKind::Subscript { name, indices } => NodeKind::Subscript {
                name: name.clone(),
                indices: map_exprs(owner, "indices", indices, &mut f)?,
            },
            NodeKind::Range {
                lower,
                upper,
                stride,
            } => NodeKind::Range {
                lower: map_opt(owner, "lower", *lower, &mut f)?,
                upper: map_opt(owner, "upper", *upper, &mut f)?,
                stride: map_opt(owner, "stride", *stride, &mut f)?,
            },
            NodeKind::KeywordArg { name, value } => NodeKind::KeywordArg {
                name: name.clone(),
                value: map_one(owner, "value", *value, &mut f)?,
            },
            NodeKind::Binary { op, lhs, rhs } => NodeKind::Binary {
                op: *op,
                lhs: map_one(owner, "lhs", *lhs, &mut f)?,
                rhs: map_one(owner, "rhs", *rhs, &mut f)?,
            },
            NodeKind::Unary { op, operand } => NodeKind::Unary {
                op: *op,
                operand: map_one(owner, "operand", *operand, &mut f)?,
            },
            NodeKind::Paren { inner } => NodeKind::Paren {
                inner: map_one(owner, "inner", *inner, &mut f)?,
            },
            leaf => leaf.clone(),
        };
        Ok(kind)
    }
}

fn map_list<F>(ids: &[NodeId], f: &mut F) -> Result<Vec<NodeId>, TransformError>
where
    F: FnMut(NodeId, SlotKind) -> Result<Vec<NodeId>, TransformError>,
{
    let mut out = Vec::with_capacity(ids.len());
    for &id in ids {
        out.extend(f(id, SlotKind::Statements)?);
    }
    Ok(out)
}

fn map_one<F>(owner: &str, slot: &str, id: NodeId, f: &mut F) -> Result<NodeId, TransformError>
where
    F: FnMut(NodeId, SlotKind) -> Result<Vec<NodeId>, TransformError>,
{
    let mapped = f(id, SlotKind::Single)?;
    match mapped.as_slice() {
        [one] => Ok(*one),
        _ => Err(TransformError::InvalidReplacement {
            node: owner.to_string(),
            slot: slot.to_string(),
            count: mapped.len(),
        }),
    }
}

fn map_opt<F>(
    owner: &str,
    slot: &str,
    id: Option<NodeId>,
    f: &mut F,
) -> Result<Option<NodeId>, TransformError>
where
    F: FnMut(NodeId, SlotKind) -> Result<Vec<NodeId>, TransformError>,
{
    let Some(id) = id else {
        return Ok(None);
    };
    let mapped = f(id, SlotKind::Optional)?;
    match mapped.as_slice() {
        [] => Ok(None),
        [one] => Ok(Some(*one)),
        _ => Err(TransformError::InvalidReplacement {
            node: owner.to_string(),
            slot: slot.to_string(),
            count: mapped.len(),
        }),
    }
}

fn map_exprs<F>(
    owner: &str,
    slot: &str,
    ids: &[NodeId],
    f: &mut F,
) -> Result<Vec<NodeId>, TransformError>
where
    F: FnMut(NodeId, SlotKind) -> Result<Vec<NodeId>, TransformError>,
{
    let mut out = Vec::with_capacity(ids.len());
    for &id in ids {
        let mapped = f(id, SlotKind::Expressions)?;
        match mapped.as_slice() {
            [one] => out.push(*one),
            _ => {
                return Err(TransformError::InvalidReplacement {
                    node: owner.to_string(),
                    slot: slot.to_string(),
                    count: mapped.len(),
                })
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Arena, BinaryOp};

    #[test]
    fn children_follow_source_order() {
        let mut arena = Arena::new();
        let a = arena.alloc(NodeKind::var("a"));
        let b = arena.alloc(NodeKind::var("b"));
        let s1 = arena.alloc(NodeKind::Comment { text: "! x".into() });
        let cond = arena.alloc(NodeKind::Conditional {
            branches: vec![Branch {
                condition: a,
                body: vec![s1],
            }],
            else_body: None,
            inline: false,
        });
        assert_eq!(arena.children(cond), vec![a, s1]);
        assert_eq!(arena.kind(cond).header_children(), vec![a]);
        let bin = arena.alloc(NodeKind::Binary {
            op: BinaryOp::Add,
            lhs: a,
            rhs: b,
        });
        assert_eq!(arena.children(bin), vec![a, b]);
    }

    #[test]
    fn single_slot_rejects_flatten() {
        let mut arena = Arena::new();
        let a = arena.alloc(NodeKind::var("a"));
        let b = arena.alloc(NodeKind::var("b"));
        let bin = NodeKind::Binary {
            op: BinaryOp::Add,
            lhs: a,
            rhs: b,
        };
        let err = bin.try_map_children(|id, _| Ok(vec![id, id])).unwrap_err();
        assert_eq!(
            err,
            TransformError::InvalidReplacement {
                node: "binary".into(),
                slot: "lhs".into(),
                count: 2
            }
        );
        let err = bin.try_map_children(|_, _| Ok(vec![])).unwrap_err();
        assert!(matches!(err, TransformError::InvalidReplacement { count: 0, .. }));
    }

    #[test]
    fn statement_list_accepts_flatten_and_remove() {
        let mut arena = Arena::new();
        let c1 = arena.alloc(NodeKind::Comment { text: "! 1".into() });
        let c2 = arena.alloc(NodeKind::Comment { text: "! 2".into() });
        let block = NodeKind::Block {
            spec: vec![],
            body: vec![c1, c2],
        };
        let mapped = block
            .try_map_children(|id, slot| {
                assert_eq!(slot, SlotKind::Statements);
                Ok(if id == c1 { vec![] } else { vec![id, id] })
            })
            .unwrap();
        assert_eq!(
            mapped,
            NodeKind::Block {
                spec: vec![],
                body: vec![c2, c2]
            }
        );
    }

    #[test]
    fn optional_slot_accepts_removal() {
        let mut arena = Arena::new();
        let lo = arena.alloc(NodeKind::int(1));
        let range = NodeKind::Range {
            lower: Some(lo),
            upper: None,
            stride: None,
        };
        let mapped = range.try_map_children(|_, _| Ok(vec![])).unwrap();
        assert_eq!(
            mapped,
            NodeKind::Range {
                lower: None,
                upper: None,
                stride: None
            }
        );
    }
}
