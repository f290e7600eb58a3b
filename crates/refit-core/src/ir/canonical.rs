//! Canonical text form of IR subtrees.
//!
//! The canonical form is an S-expression that ignores node ids and spans and
//! normalizes case-insensitive parts (names, keywords, numeric literals). It
//! backs three operations: structural equivalence (used by the round-trip
//! check and frontend comparison), fingerprints (used as cache keys) and
//! readable dumps for test failures.

use std::fmt::Write as _;

use crate::hash::ContentHash;

use super::node::{Attr, LiteralKind, NodeKind, RoutineKind};
use super::{Arena, NodeId};

/// What [`equivalent`] disregards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EquivalenceOptions {
    /// Skip comment nodes in statement lists.
    pub ignore_comments: bool,
    /// Compare the contents of parenthesised expressions only.
    pub ignore_parens: bool,
}

impl EquivalenceOptions {
    /// Everything counts.
    pub fn strict() -> Self {
        EquivalenceOptions {
            ignore_comments: false,
            ignore_parens: false,
        }
    }
}

impl Default for EquivalenceOptions {
    fn default() -> Self {
        EquivalenceOptions {
            ignore_comments: true,
            ignore_parens: true,
        }
    }
}

/// Canonical form of the subtree rooted at `id`.
pub fn canonical_form(arena: &Arena, id: NodeId, opts: EquivalenceOptions) -> String {
    let mut out = String::new();
    write_node(arena, id, opts, &mut out);
    out
}

/// True when both subtrees have the same canonical form.
pub fn equivalent(
    a_arena: &Arena,
    a: NodeId,
    b_arena: &Arena,
    b: NodeId,
    opts: EquivalenceOptions,
) -> bool {
    canonical_form(a_arena, a, opts) == canonical_form(b_arena, b, opts)
}

/// Describe where two subtrees first differ, or `None` if they are equivalent.
pub fn first_difference(
    a_arena: &Arena,
    a: NodeId,
    b_arena: &Arena,
    b: NodeId,
    opts: EquivalenceOptions,
) -> Option<String> {
    let left = canonical_form(a_arena, a, opts);
    let right = canonical_form(b_arena, b, opts);
    if left == right {
        return None;
    }
    let at = left
        .bytes()
        .zip(right.bytes())
        .position(|(x, y)| x != y)
        .unwrap_or(left.len().min(right.len()));
    Some(format!(
        "expected `{}` but found `{}`",
        excerpt(&left, at),
        excerpt(&right, at)
    ))
}

fn excerpt(text: &str, at: usize) -> &str {
    let mut start = at.saturating_sub(24);
    while !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (at + 40).min(text.len());
    while !text.is_char_boundary(end) {
        end += 1;
    }
    &text[start..end]
}

/// Content fingerprint of a subtree: changes whenever any node changes.
pub fn fingerprint(arena: &Arena, id: NodeId) -> ContentHash {
    ContentHash::compute(canonical_form(arena, id, EquivalenceOptions::strict()).as_bytes())
}

// ============================================================================
// Encoding
// ============================================================================

fn lower(name: &str) -> String {
    name.to_ascii_lowercase()
}

fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn write_list(arena: &Arena, label: &str, ids: &[NodeId], opts: EquivalenceOptions, out: &mut String) {
    let _ = write!(out, " {}=[", label);
    let mut first = true;
    for &id in ids {
        if opts.ignore_comments && matches!(arena.kind(id), NodeKind::Comment { .. }) {
            continue;
        }
        if !first {
            out.push(' ');
        }
        first = false;
        write_node(arena, id, opts, out);
    }
    out.push(']');
}

fn write_opt(arena: &Arena, label: &str, id: Option<NodeId>, opts: EquivalenceOptions, out: &mut String) {
    let _ = write!(out, " {}=", label);
    match id {
        Some(id) => write_node(arena, id, opts, out),
        None => out.push('_'),
    }
}

fn write_node(arena: &Arena, id: NodeId, opts: EquivalenceOptions, out: &mut String) {
    let kind = arena.kind(id);
    if let (NodeKind::Paren { inner }, true) = (kind, opts.ignore_parens) {
        write_node(arena, *inner, opts, out);
        return;
    }
    let _ = write!(out, "({}", kind.node_type().name());
    match kind {
        NodeKind::File { items } => write_list(arena, "items", items, opts, out),
        NodeKind::Module {
            name,
            spec,
            routines,
        } => {
            let _ = write!(out, " {}", lower(name));
            write_list(arena, "spec", spec, opts, out);
            write_list(arena, "routines", routines, opts, out);
        }
        NodeKind::Routine {
            name,
            kind,
            prefixes,
            params,
            spec,
            body,
            routines,
        } => {
            let _ = write!(out, " {} {}", kind.keyword(), lower(name));
            if let RoutineKind::Function {
                result,
                return_type,
            } = kind
            {
                if let Some(result) = result {
                    let _ = write!(out, " result={}", lower(result));
                }
                if let Some(ty) = return_type {
                    let _ = write!(out, " returns={}", ty);
                }
            }
            let prefixes: Vec<String> = prefixes.iter().map(|p| lower(p)).collect();
            let params: Vec<String> = params.iter().map(|p| lower(p)).collect();
            let _ = write!(out, " prefixes={:?} params={:?}", prefixes, params);
            write_list(arena, "spec", spec, opts, out);
            write_list(arena, "body", body, opts, out);
            write_list(arena, "routines", routines, opts, out);
        }
        NodeKind::Use {
            module,
            intrinsic,
            only,
        } => {
            let _ = write!(out, " {} intrinsic={}", lower(module), intrinsic);
            if let Some(items) = only {
                let items: Vec<String> = items
                    .iter()
                    .map(|item| match &item.rename {
                        Some(local) => format!("{}=>{}", lower(local), lower(&item.name)),
                        None => lower(&item.name),
                    })
                    .collect();
                let _ = write!(out, " only={:?}", items);
            }
        }
        NodeKind::Implicit { spec } => {
            let _ = write!(out, " {}", lower(&collapse_ws(spec)));
        }
        NodeKind::Declaration {
            type_spec,
            attrs,
            entities,
        } => {
            let attrs: Vec<String> = attrs.iter().map(Attr::to_string).collect();
            let _ = write!(out, " {} attrs={:?}", type_spec, attrs);
            for entity in entities {
                let _ = write!(out, " (entity {}", lower(&entity.name));
                write_list(arena, "shape", &entity.shape, opts, out);
                write_opt(arena, "init", entity.init, opts, out);
                if entity.pointer_init {
                    out.push_str(" pointer");
                }
                out.push(')');
            }
        }
        NodeKind::Include { path } => {
            let _ = write!(out, " {:?}", path);
        }
        NodeKind::Assignment {
            target,
            value,
            pointer,
        } => {
            if *pointer {
                out.push_str(" pointer");
            }
            out.push(' ');
            write_node(arena, *target, opts, out);
            out.push(' ');
            write_node(arena, *value, opts, out);
        }
        NodeKind::Loop {
            variable,
            start,
            end,
            step,
            body,
        } => {
            let _ = write!(out, " {}", lower(variable));
            write_opt(arena, "start", Some(*start), opts, out);
            write_opt(arena, "end", Some(*end), opts, out);
            write_opt(arena, "step", *step, opts, out);
            write_list(arena, "body", body, opts, out);
        }
        NodeKind::WhileLoop { condition, body } => {
            write_opt(arena, "condition", *condition, opts, out);
            write_list(arena, "body", body, opts, out);
        }
        NodeKind::Conditional {
            branches,
            else_body,
            inline,
        } => {
            if *inline {
                out.push_str(" inline");
            }
            for branch in branches {
                out.push_str(" (branch");
                write_opt(arena, "if", Some(branch.condition), opts, out);
                write_list(arena, "then", &branch.body, opts, out);
                out.push(')');
            }
            if let Some(body) = else_body {
                write_list(arena, "else", body, opts, out);
            }
        }
        NodeKind::Call { name, args } => {
            let _ = write!(out, " {}", lower(name));
            write_list(arena, "args", args, opts, out);
        }
        NodeKind::Block { spec, body } => {
            write_list(arena, "spec", spec, opts, out);
            write_list(arena, "body", body, opts, out);
        }
        NodeKind::Jump { kind } => {
            let _ = write!(out, " {}", kind.keyword());
        }
        NodeKind::Comment { text } => {
            let _ = write!(out, " {:?}", text.trim());
        }
        NodeKind::Pragma { keyword, content } => {
            let _ = write!(out, " {} {:?}", lower(keyword), collapse_ws(content));
        }
        NodeKind::Verbatim { text } => {
            let _ = write!(out, " {:?}", collapse_ws(text));
        }
        NodeKind::Literal { kind, text } => {
            let text = match kind {
                LiteralKind::String => text.clone(),
                _ => lower(text),
            };
            let _ = write!(out, " {:?} {}", kind, text);
        }
        NodeKind::Variable { name } => {
            let _ = write!(out, " {}", lower(name));
        }
        NodeKind::Subscript { name, indices } => {
            let _ = write!(out, " {}", lower(name));
            write_list(arena, "indices", indices, opts, out);
        }
        NodeKind::Range {
            lower: lo,
            upper,
            stride,
        } => {
            write_opt(arena, "lower", *lo, opts, out);
            write_opt(arena, "upper", *upper, opts, out);
            write_opt(arena, "stride", *stride, opts, out);
        }
        NodeKind::KeywordArg { name, value } => {
            let _ = write!(out, " {}", lower(name));
            write_opt(arena, "value", Some(*value), opts, out);
        }
        NodeKind::Binary { op, lhs, rhs } => {
            let _ = write!(out, " {}", op.symbol());
            out.push(' ');
            write_node(arena, *lhs, opts, out);
            out.push(' ');
            write_node(arena, *rhs, opts, out);
        }
        NodeKind::Unary { op, operand } => {
            let _ = write!(out, " {} ", op.symbol());
            write_node(arena, *operand, opts, out);
        }
        NodeKind::Paren { inner } => {
            out.push(' ');
            write_node(arena, *inner, opts, out);
        }
    }
    out.push(')');
}
