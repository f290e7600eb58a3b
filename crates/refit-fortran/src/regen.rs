//! Source regeneration.
//!
//! Turns a (possibly rewritten) IR back into Fortran text:
//!
//! - a node with a span has an intact subtree and is emitted as the original
//!   slice
//! - a rebuilt container keeps its recorded opening and closing lines and
//!   regenerates its children
//! - anything else is synthesized from its semantic fields, indented to the
//!   surrounding context
//!
//! Layout between original siblings (blank lines, and comment lines when the
//! frontend does not keep comments in the IR) is copied from the source.

use tracing::{debug, warn};

use refit_core::error::RegenerationFailure;
use refit_core::ir::{
    first_difference, Arena, EquivalenceOptions, NodeId, NodeKind, RoutineKind, ATOM_PRECEDENCE,
};
use refit_core::text::{indent_width, reindent};
use refit_core::types::Span;
use refit_core::{ParseError, RegenerationError, SourceUnit};

use crate::adapter::{parse_source, FrontendKind, FrontendOptions};
use crate::reader::trailing_comment;

/// Longest line the regenerator writes before continuing with `&`.
pub const MAX_LINE: usize = 132;

/// Indentation step for synthesized nesting.
const INDENT: usize = 2;

/// Extra indentation of continuation lines.
const CONTINUATION_INDENT: usize = 4;

/// Precedence of relational operators; they do not chain.
const RELATIONAL_PRECEDENCE: u8 = 5;

// ============================================================================
// Entry Points
// ============================================================================

/// Regenerate the source text of `unit` from its current IR.
///
/// An untouched unit yields its original text unchanged.
pub fn regenerate(unit: &SourceUnit) -> String {
    if unit.arena.span(unit.root).is_some() {
        return unit.text.clone();
    }
    let mut state = EmitState::new(unit);
    state.file(unit.root);
    state.out
}

/// Regenerate `unit` and verify the result.
///
/// The output is re-parsed with the frontend that produced the unit and
/// compared with the in-memory IR, ignoring comments and parentheses. On
/// failure the caller keeps the original text.
pub fn regenerate_checked(
    unit: &SourceUnit,
    options: &FrontendOptions,
) -> Result<String, RegenerationError> {
    let text = regenerate(unit);
    if unit.arena.span(unit.root).is_some() {
        return Ok(text);
    }

    let file = unit.file_name();
    let fail = |failure| RegenerationError {
        file: file.clone(),
        failure,
    };
    let frontend: FrontendKind = unit.frontend.parse().map_err(|err| {
        fail(RegenerationFailure::Reparse(ParseError::new(
            &file,
            &unit.frontend,
            format!("{}", err),
        )))
    })?;
    let reparsed = parse_source(frontend, options, unit.path(), &text)
        .map_err(|err| fail(RegenerationFailure::Reparse(err)))?;

    if let Some(detail) = first_difference(
        &unit.arena,
        unit.root,
        &reparsed.arena,
        reparsed.root,
        EquivalenceOptions::default(),
    ) {
        warn!(file = %file, %detail, "regenerated text does not round-trip");
        return Err(fail(RegenerationFailure::Mismatch { detail }));
    }
    debug!(file = %file, bytes = text.len(), "regenerated source verified");
    Ok(text)
}

// ============================================================================
// Emit State
// ============================================================================

/// Output under construction.
struct EmitState<'u> {
    unit: &'u SourceUnit,
    out: String,
    /// Source offset just past the last original text emitted in place.
    last_end: Option<usize>,
    /// Whether synthesized text followed the last original text.
    fresh: bool,
}

impl<'u> EmitState<'u> {
    fn new(unit: &'u SourceUnit) -> Self {
        EmitState {
            unit,
            out: String::with_capacity(unit.text.len()),
            last_end: Some(0),
            fresh: false,
        }
    }

    fn file(&mut self, root: NodeId) {
        let unit = self.unit;
        let NodeKind::File { items } = unit.arena.kind(root) else {
            self.emit(root, 0, false);
            self.out.push('\n');
            return;
        };
        for (i, &item) in items.iter().enumerate() {
            if i == 0 {
                if let Some(extent) = self.extent(item) {
                    let leading = &unit.text[..extent.start];
                    if self.is_layout(leading) {
                        self.out.push_str(leading);
                    }
                }
            } else {
                self.separate(self.extent(item), true);
            }
            self.emit(item, 0, true);
        }
        let trailing = match self.last_end {
            Some(end) if !self.fresh => unit.text.get(end..).filter(|t| self.is_layout(t)),
            Some(end) => unit
                .text
                .get(end..)
                .filter(|t| self.is_layout(t) && t.contains('\n')),
            None => None,
        };
        match trailing {
            Some(text) => self.out.push_str(text),
            None if !items.is_empty() => self.out.push('\n'),
            None => {}
        }
    }

    /// Emit one node. `original` is set when the surrounding lines are laid
    /// out as in the source.
    fn emit(&mut self, id: NodeId, indent: usize, original: bool) {
        let unit = self.unit;
        let data = unit.arena.node(id);
        if let Some(span) = data.span {
            self.original_text(span, indent, original);
            return;
        }
        if is_container(&data.kind) {
            self.container(id, data.head, data.tail, indent, original);
            return;
        }
        match &data.kind {
            NodeKind::Verbatim { text } => self.out.push_str(&shift(text, indent)),
            NodeKind::Comment { .. } | NodeKind::Pragma { .. } => {
                self.out.push_str(&" ".repeat(indent));
                self.out.push_str(&statement_line(&unit.arena, id));
            }
            NodeKind::File { items } => {
                for (i, &item) in items.iter().enumerate() {
                    if i > 0 {
                        self.out.push('\n');
                    }
                    self.emit(item, indent, false);
                }
            }
            _ => {
                self.out
                    .push_str(&wrap(&statement_line(&unit.arena, id), indent));
                self.carry_comment(id, false);
            }
        }
        self.fresh = true;
    }

    /// Append the trailing comment of the source statement (or opening line,
    /// with `head`) that a synthesized node stands in for.
    fn carry_comment(&mut self, id: NodeId, head: bool) {
        let unit = self.unit;
        let Some(origin) = unit.arena.origin(id) else {
            return;
        };
        let data = unit.arena.node(origin);
        let span = if head { data.head } else { data.span };
        if let Some(comment) = span.and_then(|s| trailing_comment(unit.slice(s))) {
            self.out.push_str(comment);
        }
    }

    fn original_text(&mut self, span: Span, indent: usize, original: bool) {
        let unit = self.unit;
        let text = unit.slice(span);
        if original {
            self.out.push_str(text);
            self.last_end = Some(span.end);
            self.fresh = false;
        } else {
            self.out.push_str(&shift(text, indent));
            self.fresh = true;
        }
    }

    fn container(
        &mut self,
        id: NodeId,
        head: Option<Span>,
        tail: Option<Span>,
        indent: usize,
        original: bool,
    ) {
        let unit = self.unit;
        let kind = unit.arena.kind(id);
        let head_indent = match head {
            Some(span) if original => indent_width(unit.slice(span)),
            _ => indent,
        };
        match head {
            Some(span) => self.original_text(span, indent, original),
            None => {
                self.out.push_str(&wrap(&head_line(&unit.arena, kind), indent));
                self.carry_comment(id, true);
                self.fresh = true;
            }
        }

        // Children keep their layout only under an original opening line.
        let keep = original && head.is_some();
        let child_indent = if keep {
            self.child_indent(kind).unwrap_or(head_indent + INDENT)
        } else {
            head_indent + INDENT
        };
        self.children(kind, child_indent, keep, head_indent);

        match tail {
            Some(span) => {
                self.separate(Some(span), keep);
                self.original_text(span, head_indent, original);
            }
            None => self.pseudo_line(head_indent, &tail_line(kind)),
        }
    }

    fn children(&mut self, kind: &'u NodeKind, indent: usize, original: bool, head_indent: usize) {
        let unit = self.unit;
        let arena = &unit.arena;
        match kind {
            NodeKind::Module { spec, routines, .. } => {
                self.list(spec, indent, original);
                self.contained(routines, indent, original, head_indent);
            }
            NodeKind::Routine {
                spec,
                body,
                routines,
                ..
            } => {
                self.list(spec, indent, original);
                self.list(body, indent, original);
                self.contained(routines, indent, original, head_indent);
            }
            NodeKind::Loop { body, .. } | NodeKind::WhileLoop { body, .. } => {
                self.list(body, indent, original);
            }
            NodeKind::Block { spec, body } => {
                self.list(spec, indent, original);
                self.list(body, indent, original);
            }
            NodeKind::Conditional {
                branches,
                else_body,
                ..
            } => {
                for (i, branch) in branches.iter().enumerate() {
                    if i > 0 {
                        let line = format!("else if ({}) then", format_expr(arena, branch.condition));
                        self.pseudo_line(head_indent, &line);
                    }
                    self.list(&branch.body, indent, original);
                }
                if let Some(body) = else_body {
                    self.keyword_line("else", body.first().copied(), head_indent, original);
                    self.list(body, indent, original);
                }
            }
            _ => {}
        }
    }

    fn contained(&mut self, routines: &[NodeId], indent: usize, original: bool, head_indent: usize) {
        if routines.is_empty() {
            return;
        }
        self.keyword_line("contains", routines.first().copied(), head_indent, original);
        self.list(routines, indent, original);
    }

    fn list(&mut self, items: &[NodeId], indent: usize, original: bool) {
        for &item in items {
            self.separate(self.extent(item), original);
            self.emit(item, indent, original);
        }
    }

    /// Write what goes between the previous output and a node starting at
    /// `next`: the source layout when it can be reused, a newline otherwise.
    fn separate(&mut self, next: Option<Span>, original: bool) {
        let unit = self.unit;
        let (true, Some(end)) = (original, self.last_end) else {
            self.out.push('\n');
            return;
        };
        let Some(next) = next else {
            // A synthesized node takes the blank lines that followed the
            // previous original text.
            let lead = if self.fresh {
                ""
            } else {
                self.layout_prefix(&unit.text[end..])
            };
            if lead.contains('\n') {
                self.out.push_str(lead);
            } else {
                self.out.push('\n');
            }
            return;
        };
        if end > next.start {
            self.out.push('\n');
            return;
        }
        let gap = &unit.text[end..next.start];
        if gap.is_empty() && !self.fresh {
            return;
        }
        if !self.fresh && gap.contains('\n') && self.is_layout(gap) {
            self.out.push_str(gap);
            return;
        }
        // Something was dropped or replaced in between: keep the blank lines
        // that followed it.
        let suffix = self.layout_suffix(gap);
        if suffix.contains('\n') {
            self.out.push_str(suffix);
        } else {
            self.out.push('\n');
        }
    }

    /// A keyword line (`contains`, `else`) that has no node of its own.
    ///
    /// Reuses the source line when the gap before `first` holds exactly that
    /// keyword; otherwise writes a fresh one.
    fn keyword_line(&mut self, keyword: &str, first: Option<NodeId>, indent: usize, original: bool) {
        let unit = self.unit;
        let next = first.and_then(|id| self.extent(id));
        if let (true, false, Some(end), Some(next)) = (original, self.fresh, self.last_end, next) {
            if let Some(gap) = unit.text.get(end..next.start) {
                let mut keywords = 0;
                let mut other = false;
                for line in gap.lines() {
                    let code = line.split('!').next().unwrap_or("").trim();
                    if code.eq_ignore_ascii_case(keyword) {
                        keywords += 1;
                    } else if !self.is_layout(line) {
                        other = true;
                    }
                }
                if keywords == 1 && !other {
                    self.out.push_str(gap);
                    self.last_end = Some(next.start);
                    return;
                }
            }
        }
        self.pseudo_line(indent, keyword);
    }

    fn pseudo_line(&mut self, indent: usize, text: &str) {
        self.out.push('\n');
        self.out.push_str(&wrap(text, indent));
        self.fresh = true;
    }

    /// Source extent of a node: its span, or its opening through closing line.
    fn extent(&self, id: NodeId) -> Option<Span> {
        let data = self.unit.arena.node(id);
        data.span.or(match (data.head, data.tail) {
            (Some(head), Some(tail)) => Some(head.cover(&tail)),
            _ => None,
        })
    }

    /// Indentation of the first original statement among the children.
    fn child_indent(&self, kind: &NodeKind) -> Option<usize> {
        let arena = &self.unit.arena;
        kind.statement_lists()
            .into_iter()
            .flatten()
            .filter(|&&id| !matches!(arena.kind(id), NodeKind::Comment { .. }))
            .find_map(|&id| arena.span(id).or(arena.head(id)))
            .map(|span| self.unit.slice(span))
            .filter(|text| !text.trim_start().starts_with('#'))
            .map(indent_width)
    }

    /// Text with no statements: blank lines, plus comment lines when the IR
    /// does not carry comments.
    fn is_layout(&self, text: &str) -> bool {
        text.lines().all(|line| self.is_layout_line(line))
    }

    fn is_layout_line(&self, line: &str) -> bool {
        let trimmed = line.trim();
        trimmed.is_empty()
            || (!self.unit.comments_in_ir && trimmed.starts_with('!') && !trimmed.starts_with("!$"))
    }

    /// The part of `gap` after its last non-layout line.
    fn layout_suffix<'g>(&self, gap: &'g str) -> &'g str {
        let mut start = 0;
        let mut suffix = 0;
        for line in gap.split_inclusive('\n') {
            if !self.is_layout_line(line) {
                suffix = start + line.trim_end_matches('\n').len();
            }
            start += line.len();
        }
        &gap[suffix..]
    }

    /// The complete layout lines at the start of `rest`, which begins at the
    /// end of an original statement.
    fn layout_prefix<'g>(&self, rest: &'g str) -> &'g str {
        let mut len = 0;
        for (i, line) in rest.split_inclusive('\n').enumerate() {
            if !line.ends_with('\n') || (i > 0 && !self.is_layout_line(line)) {
                break;
            }
            len += line.len();
        }
        &rest[..len]
    }
}

fn is_container(kind: &NodeKind) -> bool {
    match kind {
        NodeKind::Module { .. }
        | NodeKind::Routine { .. }
        | NodeKind::Loop { .. }
        | NodeKind::WhileLoop { .. }
        | NodeKind::Block { .. } => true,
        NodeKind::Conditional { inline, .. } => !inline,
        _ => false,
    }
}

/// Re-indent original lines; preprocessor lines stay in column one.
fn shift(text: &str, indent: usize) -> String {
    reindent(text, indent)
        .split('\n')
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with('#') {
                trimmed
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ============================================================================
// Statement Synthesis
// ============================================================================

fn head_line(arena: &Arena, kind: &NodeKind) -> String {
    match kind {
        NodeKind::Module { name, .. } => format!("module {}", name),
        NodeKind::Routine {
            name,
            kind,
            prefixes,
            params,
            ..
        } => {
            let mut line = String::new();
            for prefix in prefixes {
                line.push_str(prefix);
                line.push(' ');
            }
            if let RoutineKind::Function {
                return_type: Some(ty),
                ..
            } = kind
            {
                line.push_str(&ty.to_string());
                line.push(' ');
            }
            line.push_str(kind.keyword());
            line.push(' ');
            line.push_str(name);
            match kind {
                RoutineKind::Program => {}
                RoutineKind::Subroutine if params.is_empty() => {}
                _ => {
                    line.push('(');
                    line.push_str(&params.join(", "));
                    line.push(')');
                }
            }
            if let RoutineKind::Function {
                result: Some(result),
                ..
            } = kind
            {
                line.push_str(&format!(" result({})", result));
            }
            line
        }
        NodeKind::Loop {
            variable,
            start,
            end,
            step,
            ..
        } => {
            let mut line = format!(
                "do {} = {}, {}",
                variable,
                format_expr(arena, *start),
                format_expr(arena, *end)
            );
            if let Some(step) = step {
                line.push_str(", ");
                line.push_str(&format_expr(arena, *step));
            }
            line
        }
        NodeKind::WhileLoop {
            condition: Some(condition),
            ..
        } => format!("do while ({})", format_expr(arena, *condition)),
        NodeKind::WhileLoop { condition: None, .. } => "do".to_string(),
        NodeKind::Conditional { branches, .. } => {
            let condition = branches
                .first()
                .map(|b| format_expr(arena, b.condition))
                .unwrap_or_else(|| ".true.".to_string());
            format!("if ({}) then", condition)
        }
        NodeKind::Block { .. } => "block".to_string(),
        _ => String::new(),
    }
}

fn tail_line(kind: &NodeKind) -> String {
    match kind {
        NodeKind::Module { name, .. } => format!("end module {}", name),
        NodeKind::Routine { name, kind, .. } => format!("end {} {}", kind.keyword(), name),
        NodeKind::Loop { .. } | NodeKind::WhileLoop { .. } => "end do".to_string(),
        NodeKind::Conditional { .. } => "end if".to_string(),
        NodeKind::Block { .. } => "end block".to_string(),
        _ => String::new(),
    }
}

/// Single-line text of a statement node, without indentation.
pub fn statement_line(arena: &Arena, id: NodeId) -> String {
    let kind = arena.kind(id);
    match kind {
        NodeKind::Use {
            module,
            intrinsic,
            only,
        } => {
            let mut line = if *intrinsic {
                format!("use, intrinsic :: {}", module)
            } else {
                format!("use {}", module)
            };
            if let Some(items) = only {
                let items: Vec<String> = items
                    .iter()
                    .map(|item| match &item.rename {
                        Some(local) => format!("{} => {}", local, item.name),
                        None => item.name.clone(),
                    })
                    .collect();
                line.push_str(", only: ");
                line.push_str(&items.join(", "));
            }
            line
        }
        NodeKind::Implicit { spec } => format!("implicit {}", spec),
        NodeKind::Declaration {
            type_spec,
            attrs,
            entities,
        } => {
            let mut line = type_spec.to_string();
            for attr in attrs {
                line.push_str(", ");
                line.push_str(&attr.to_string());
            }
            line.push_str(" :: ");
            let entities: Vec<String> = entities
                .iter()
                .map(|entity| {
                    let mut text = entity.name.clone();
                    if !entity.shape.is_empty() {
                        text.push('(');
                        text.push_str(&format_list(arena, &entity.shape));
                        text.push(')');
                    }
                    if let Some(init) = entity.init {
                        text.push_str(if entity.pointer_init { " => " } else { " = " });
                        text.push_str(&format_expr(arena, init));
                    }
                    text
                })
                .collect();
            line.push_str(&entities.join(", "));
            line
        }
        NodeKind::Include { path } => format!("include '{}'", path.replace('\'', "''")),
        NodeKind::Assignment {
            target,
            value,
            pointer,
        } => format!(
            "{} {} {}",
            format_expr(arena, *target),
            if *pointer { "=>" } else { "=" },
            format_expr(arena, *value)
        ),
        NodeKind::Call { name, args } if args.is_empty() => format!("call {}", name),
        NodeKind::Call { name, args } => format!("call {}({})", name, format_list(arena, args)),
        NodeKind::Jump { kind } => kind.keyword().to_string(),
        NodeKind::Comment { text } if text.starts_with('!') => text.clone(),
        NodeKind::Comment { text } => format!("! {}", text),
        NodeKind::Pragma { keyword, content } if content.is_empty() => format!("!${}", keyword),
        NodeKind::Pragma { keyword, content } => format!("!${} {}", keyword, content),
        NodeKind::Verbatim { text } => text.clone(),
        NodeKind::Conditional {
            branches,
            inline: true,
            ..
        } => match branches.first() {
            Some(branch) => {
                let action = branch
                    .body
                    .first()
                    .map(|&inner| statement_line(arena, inner))
                    .unwrap_or_default();
                format!("if ({}) {}", format_expr(arena, branch.condition), action)
            }
            None => String::new(),
        },
        kind if is_container(kind) => head_line(arena, kind),
        _ => format_expr(arena, id),
    }
}

// ============================================================================
// Expressions
// ============================================================================

/// Text of an expression with the parentheses its structure requires.
///
/// Explicit [`NodeKind::Paren`] nodes are kept; others are added only where
/// operator precedence or associativity would otherwise change the tree.
pub fn format_expr(arena: &Arena, id: NodeId) -> String {
    let mut out = String::new();
    write_expr(arena, id, &mut out);
    out
}

fn format_list(arena: &Arena, ids: &[NodeId]) -> String {
    ids.iter()
        .map(|&id| format_expr(arena, id))
        .collect::<Vec<_>>()
        .join(", ")
}

fn binding(arena: &Arena, id: NodeId) -> u8 {
    match arena.kind(id) {
        NodeKind::Binary { op, .. } => op.precedence(),
        NodeKind::Unary { op, .. } => op.precedence(),
        _ => ATOM_PRECEDENCE,
    }
}

fn write_operand(arena: &Arena, id: NodeId, parens: bool, out: &mut String) {
    if parens {
        out.push('(');
        write_expr(arena, id, out);
        out.push(')');
    } else {
        write_expr(arena, id, out);
    }
}

fn write_expr(arena: &Arena, id: NodeId, out: &mut String) {
    match arena.kind(id) {
        NodeKind::Literal { text, .. } => out.push_str(text),
        NodeKind::Variable { name } => out.push_str(name),
        NodeKind::Subscript { name, indices } => {
            out.push_str(name);
            out.push('(');
            out.push_str(&format_list(arena, indices));
            out.push(')');
        }
        NodeKind::Range {
            lower,
            upper,
            stride,
        } => {
            if let Some(lower) = lower {
                write_expr(arena, *lower, out);
            }
            out.push(':');
            if let Some(upper) = upper {
                write_expr(arena, *upper, out);
            }
            if let Some(stride) = stride {
                out.push(':');
                write_expr(arena, *stride, out);
            }
        }
        NodeKind::KeywordArg { name, value } => {
            out.push_str(name);
            out.push('=');
            write_expr(arena, *value, out);
        }
        NodeKind::Paren { inner } => write_operand(arena, *inner, true, out),
        NodeKind::Binary { op, lhs, rhs } => {
            let prec = op.precedence();
            let chained = prec == RELATIONAL_PRECEDENCE;
            let (left, right) = (binding(arena, *lhs), binding(arena, *rhs));
            let left_parens = left < prec || (left == prec && (op.is_right_assoc() || chained));
            let right_parens = right < prec || (right == prec && (!op.is_right_assoc() || chained));
            write_operand(arena, *lhs, left_parens, out);
            if op.is_right_assoc() {
                out.push_str(op.symbol());
            } else {
                out.push(' ');
                out.push_str(op.symbol());
                out.push(' ');
            }
            write_operand(arena, *rhs, right_parens, out);
        }
        NodeKind::Unary { op, operand } => {
            out.push_str(op.symbol());
            if op.symbol().ends_with('.') {
                out.push(' ');
            }
            write_operand(arena, *operand, binding(arena, *operand) <= op.precedence(), out);
        }
        NodeKind::Verbatim { text } => out.push_str(text),
        _ => {}
    }
}

// ============================================================================
// Line Wrapping
// ============================================================================

/// Indent `text` and continue it with `&` where it would exceed
/// [`MAX_LINE`]. Breaks fall on blanks outside character literals.
fn wrap(text: &str, indent: usize) -> String {
    let mut out = String::new();
    let mut rest = text;
    let mut lead = indent;
    loop {
        out.push_str(&" ".repeat(lead));
        if lead + rest.len() <= MAX_LINE {
            out.push_str(rest);
            return out;
        }
        let Some(at) = break_point(rest, MAX_LINE.saturating_sub(lead + 2)) else {
            out.push_str(rest);
            return out;
        };
        out.push_str(rest[..at].trim_end());
        out.push_str(" &\n");
        rest = rest[at..].trim_start();
        lead = indent + CONTINUATION_INDENT;
    }
}

fn break_point(text: &str, limit: usize) -> Option<usize> {
    let mut quote = None;
    let mut best = None;
    for (i, c) in text.char_indices() {
        if i > limit {
            break;
        }
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == ' ' && i > 0 => best = Some(i),
            None => {}
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use refit_core::ir::{replace_at_path, BinaryOp, ItemPath, NodeType, UnaryOp};
    use refit_core::visit::{rewrite, NodeFilter, Transform, Transformer};
    use refit_core::TransformError;
    use std::path::Path;

    fn parse(text: &str) -> SourceUnit {
        parse_source(
            FrontendKind::Lines,
            &FrontendOptions::default(),
            Path::new("t.f90"),
            text,
        )
        .unwrap()
    }

    /// Replaces `call foo(x)` with `call bar(x, 2)`.
    struct Retarget;

    impl Transformer for Retarget {
        fn filter(&self) -> NodeFilter {
            NodeFilter::only(&[NodeType::Call])
        }

        fn transform(
            &mut self,
            arena: &mut Arena,
            node: NodeId,
            _original: NodeId,
        ) -> Result<Transform, TransformError> {
            let NodeKind::Call { name, args } = arena.kind(node).clone() else {
                return Ok(Transform::Keep);
            };
            if name != "foo" {
                return Ok(Transform::Keep);
            }
            let two = arena.alloc(NodeKind::int(2));
            let mut args = args;
            args.push(two);
            Ok(Transform::Replace(arena.alloc(NodeKind::Call {
                name: "bar".into(),
                args,
            })))
        }
    }

    fn retarget(unit: &mut SourceUnit) {
        let outcome = rewrite(&mut unit.arena, unit.root, &mut Retarget).unwrap();
        unit.root = outcome.root;
    }

    #[test]
    fn untouched_unit_is_byte_identical() {
        let text = "! header\n\nsubroutine s(a)\n  real :: a   ! trailing\n\n  a = 1\nend subroutine s\n";
        assert_eq!(regenerate(&parse(text)), text);
    }

    #[test]
    fn synthesized_statement_keeps_surrounding_layout() {
        let text = "subroutine s(a)\n  real :: a\n\n  ! set\n  a = 1\n  call foo(a)\n\n  a = 2\nend subroutine s\n";
        let mut unit = parse(text);
        retarget(&mut unit);
        assert_eq!(
            regenerate(&unit),
            "subroutine s(a)\n  real :: a\n\n  ! set\n  a = 1\n  call bar(a, 2)\n\n  a = 2\nend subroutine s\n"
        );
    }

    #[test]
    fn synthesized_statement_keeps_its_trailing_comment() {
        let text = "subroutine s(a)\n  real :: a\n  call foo(a)   ! keep me\n  if (a > 0) call foo(a) ! and me\n  a = 2 ! untouched\nend subroutine s\n";
        let mut unit = parse(text);
        retarget(&mut unit);
        assert_eq!(
            regenerate(&unit),
            "subroutine s(a)\n  real :: a\n  call bar(a, 2)   ! keep me\n  if (a > 0) call bar(a, 2) ! and me\n  a = 2 ! untouched\nend subroutine s\n"
        );
    }

    #[test]
    fn contains_and_else_lines_survive_rewrites() {
        let text = "module m\ncontains\n  subroutine s(x)\n    if (x > 0) then\n      call foo(x)\n    else\n      x = 0\n    end if\n  end subroutine s\nend module m\n";
        let mut unit = parse(text);
        retarget(&mut unit);
        assert_eq!(regenerate(&unit), text.replace("call foo(x)", "call bar(x, 2)"));
    }

    #[test]
    fn children_of_new_containers_are_reindented() {
        let text = "subroutine s\n    x = 1\nend subroutine s\n";
        let mut unit = parse(text);
        let NodeKind::Routine { body, .. } = unit.arena.kind(unit.arena.kind(unit.root).children()[0]).clone() else {
            panic!("not a routine");
        };
        let fresh = unit.arena.alloc(NodeKind::Routine {
            name: "t".into(),
            kind: RoutineKind::Subroutine,
            prefixes: vec![],
            params: vec![],
            spec: vec![],
            body,
            routines: vec![],
        });
        let replaced = replace_at_path(&mut unit.arena, unit.root, &ItemPath(vec![0]), fresh).unwrap();
        unit.root = replaced.root;
        assert_eq!(regenerate(&unit), "subroutine t\n  x = 1\nend subroutine t\n");
    }

    #[test]
    fn minimal_parentheses() {
        let mut arena = Arena::new();
        let a = arena.alloc(NodeKind::var("a"));
        let b = arena.alloc(NodeKind::var("b"));
        let c = arena.alloc(NodeKind::var("c"));
        let bin = |arena: &mut Arena, op, lhs, rhs| arena.alloc(NodeKind::Binary { op, lhs, rhs });

        let sum = bin(&mut arena, BinaryOp::Add, a, b);
        let product = bin(&mut arena, BinaryOp::Mul, sum, c);
        assert_eq!(format_expr(&arena, product), "(a + b) * c");

        let product = bin(&mut arena, BinaryOp::Mul, a, b);
        let sum = bin(&mut arena, BinaryOp::Add, product, c);
        assert_eq!(format_expr(&arena, sum), "a * b + c");

        let inner = bin(&mut arena, BinaryOp::Pow, b, c);
        let right = bin(&mut arena, BinaryOp::Pow, a, inner);
        assert_eq!(format_expr(&arena, right), "a**b**c");
        let inner = bin(&mut arena, BinaryOp::Pow, a, b);
        let left = bin(&mut arena, BinaryOp::Pow, inner, c);
        assert_eq!(format_expr(&arena, left), "(a**b)**c");

        let diff = bin(&mut arena, BinaryOp::Sub, b, c);
        let outer = bin(&mut arena, BinaryOp::Sub, a, diff);
        assert_eq!(format_expr(&arena, outer), "a - (b - c)");

        let neg = arena.alloc(NodeKind::Unary {
            op: UnaryOp::Neg,
            operand: b,
        });
        let minus = bin(&mut arena, BinaryOp::Mul, a, neg);
        assert_eq!(format_expr(&arena, minus), "a * (-b)");
        let sum = bin(&mut arena, BinaryOp::Add, a, b);
        let negated = arena.alloc(NodeKind::Unary {
            op: UnaryOp::Neg,
            operand: sum,
        });
        assert_eq!(format_expr(&arena, negated), "-(a + b)");

        let and = bin(&mut arena, BinaryOp::And, a, b);
        let not = arena.alloc(NodeKind::Unary {
            op: UnaryOp::Not,
            operand: and,
        });
        assert_eq!(format_expr(&arena, not), ".not. (a .and. b)");
    }

    #[test]
    fn long_lines_are_continued() {
        let args: Vec<String> = (0..40).map(|i| format!("argument_{}", i)).collect();
        let line = format!("call f({})", args.join(", "));
        let wrapped = wrap(&line, 2);
        assert!(wrapped.lines().count() > 1);
        assert!(wrapped.lines().all(|l| l.len() <= MAX_LINE));
        assert!(wrapped.lines().rev().skip(1).all(|l| l.ends_with(" &")));
        assert_eq!(break_point("x = 'a b c'", 8), Some(3));
    }

    #[test]
    fn checked_regeneration_accepts_valid_rewrites() {
        let text = "subroutine s(a)\n  real :: a\n  call foo(a)\nend subroutine s\n";
        let mut unit = parse(text);
        retarget(&mut unit);
        let out = regenerate_checked(&unit, &FrontendOptions::default()).unwrap();
        assert!(out.contains("call bar(a, 2)"));
    }

    #[test]
    fn checked_regeneration_rejects_text_that_reparses_differently() {
        let text = "subroutine s\n  call foo(a)\nend subroutine s\n";
        let mut unit = parse(text);

        struct ToVerbatim;
        impl Transformer for ToVerbatim {
            fn filter(&self) -> NodeFilter {
                NodeFilter::only(&[NodeType::Call])
            }
            fn transform(
                &mut self,
                arena: &mut Arena,
                _node: NodeId,
                _original: NodeId,
            ) -> Result<Transform, TransformError> {
                Ok(Transform::Replace(arena.alloc(NodeKind::Verbatim {
                    text: "x = 1".into(),
                })))
            }
        }

        let outcome = rewrite(&mut unit.arena, unit.root, &mut ToVerbatim).unwrap();
        unit.root = outcome.root;
        let err = regenerate_checked(&unit, &FrontendOptions::default()).unwrap_err();
        assert!(matches!(err.failure, RegenerationFailure::Mismatch { .. }));
        assert_eq!(err.file, "t.f90");
    }

    #[test]
    fn checked_regeneration_reports_reparse_failures() {
        let text = "subroutine s\n  call foo(a)\nend subroutine s\n";
        let mut unit = parse(text);

        struct Unbalanced;
        impl Transformer for Unbalanced {
            fn filter(&self) -> NodeFilter {
                NodeFilter::only(&[NodeType::Call])
            }
            fn transform(
                &mut self,
                arena: &mut Arena,
                _node: NodeId,
                _original: NodeId,
            ) -> Result<Transform, TransformError> {
                Ok(Transform::Replace(arena.alloc(NodeKind::Verbatim {
                    text: "end do".into(),
                })))
            }
        }

        let outcome = rewrite(&mut unit.arena, unit.root, &mut Unbalanced).unwrap();
        unit.root = outcome.root;
        let err = regenerate_checked(&unit, &FrontendOptions::default()).unwrap_err();
        assert!(matches!(err.failure, RegenerationFailure::Reparse(_)));
    }
}
