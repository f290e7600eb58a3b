//! Built-in rules.

use crate::ir::{Attr, NodeId, NodeKind, NodeType};

use super::{Diagnostic, Rule, RuleContext, Severity};

// ============================================================================
// array-intent
// ============================================================================

/// Array dummy arguments must declare an intent.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArrayIntent;

impl Rule for ArrayIntent {
    fn id(&self) -> &'static str {
        "array-intent"
    }

    fn description(&self) -> &'static str {
        "array dummy arguments must declare intent(in), intent(out) or intent(inout)"
    }

    fn subscriptions(&self) -> &'static [NodeType] {
        &[NodeType::Declaration]
    }

    fn check(&self, cx: &RuleContext<'_>, node: NodeId) -> Vec<Diagnostic> {
        let arena = &cx.unit.arena;
        let NodeKind::Declaration {
            attrs, entities, ..
        } = arena.kind(node)
        else {
            return Vec::new();
        };
        if attrs.iter().any(|a| matches!(a, Attr::Intent(_))) {
            return Vec::new();
        }
        let Some(NodeKind::Routine { params, spec, .. }) = arena.parent(node).map(|p| arena.kind(p)) else {
            return Vec::new();
        };
        if !spec.contains(&node) {
            return Vec::new();
        }
        entities
            .iter()
            .filter(|e| !e.shape.is_empty())
            .filter(|e| params.iter().any(|p| p.eq_ignore_ascii_case(&e.name)))
            .map(|e| cx.report(node, format!("array dummy argument '{}' has no intent", e.name)))
            .collect()
    }
}

// ============================================================================
// implicit-none
// ============================================================================

/// Modules and routines must be covered by `implicit none`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImplicitNone;

fn has_implicit_none(cx: &RuleContext<'_>, unit: NodeId) -> bool {
    let arena = &cx.unit.arena;
    let spec = match arena.kind(unit) {
        NodeKind::Module { spec, .. } | NodeKind::Routine { spec, .. } => spec,
        _ => return false,
    };
    spec.iter().any(|&s| {
        matches!(arena.kind(s), NodeKind::Implicit { spec } if spec.eq_ignore_ascii_case("none"))
    })
}

impl Rule for ImplicitNone {
    fn id(&self) -> &'static str {
        "implicit-none"
    }

    fn description(&self) -> &'static str {
        "every module and routine must be covered by 'implicit none'"
    }

    fn subscriptions(&self) -> &'static [NodeType] {
        &[NodeType::Module, NodeType::Routine]
    }

    fn check(&self, cx: &RuleContext<'_>, node: NodeId) -> Vec<Diagnostic> {
        let arena = &cx.unit.arena;
        let covered = std::iter::once(node)
            .chain(arena.ancestors(node))
            .any(|n| has_implicit_none(cx, n));
        if covered {
            return Vec::new();
        }
        let (what, name) = match arena.kind(node) {
            NodeKind::Module { name, .. } => ("module", name),
            NodeKind::Routine { name, kind, .. } => (kind.keyword(), name),
            _ => return Vec::new(),
        };
        vec![cx.report(node, format!("{} '{}' does not declare 'implicit none'", what, name))]
    }
}

// ============================================================================
// max-dummy-args
// ============================================================================

/// Routines may declare at most `max` dummy arguments (default 50).
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxDummyArgs;

const DEFAULT_MAX_DUMMY_ARGS: usize = 50;

impl Rule for MaxDummyArgs {
    fn id(&self) -> &'static str {
        "max-dummy-args"
    }

    fn description(&self) -> &'static str {
        "routines may not declare more than 'max' dummy arguments"
    }

    fn default_severity(&self) -> Severity {
        Severity::Info
    }

    fn subscriptions(&self) -> &'static [NodeType] {
        &[NodeType::Routine]
    }

    fn check(&self, cx: &RuleContext<'_>, node: NodeId) -> Vec<Diagnostic> {
        let NodeKind::Routine { name, params, .. } = cx.unit.arena.kind(node) else {
            return Vec::new();
        };
        let max = cx.option_usize("max").unwrap_or(DEFAULT_MAX_DUMMY_ARGS);
        if params.len() <= max {
            return Vec::new();
        }
        vec![cx.report(
            node,
            format!("'{}' has {} dummy arguments (max {})", name, params.len(), max),
        )]
    }
}

// ============================================================================
// banned-statements
// ============================================================================

/// Statements that must not appear (default: `stop`, `print`, `pause`, `goto`).
#[derive(Debug, Clone, Copy, Default)]
pub struct BannedStatements;

const DEFAULT_BANNED: &[&str] = &["stop", "print", "pause", "goto"];

/// Leading keyword of an opaque statement, lowercase, labels stripped,
/// `go to` folded into `goto`.
fn leading_keyword(text: &str) -> Option<String> {
    let mut words = text
        .split(|c: char| c.is_whitespace() || c == '(' || c == ',' || c == '*')
        .filter(|w| !w.is_empty())
        .skip_while(|w| w.chars().all(|c| c.is_ascii_digit()));
    let first = words.next()?.to_ascii_lowercase();
    if first == "go" && words.next().is_some_and(|w| w.eq_ignore_ascii_case("to")) {
        return Some("goto".to_string());
    }
    Some(first)
}

impl Rule for BannedStatements {
    fn id(&self) -> &'static str {
        "banned-statements"
    }

    fn description(&self) -> &'static str {
        "statements listed in 'statements' must not be used"
    }

    fn subscriptions(&self) -> &'static [NodeType] {
        &[NodeType::Verbatim]
    }

    fn check(&self, cx: &RuleContext<'_>, node: NodeId) -> Vec<Diagnostic> {
        let NodeKind::Verbatim { text } = cx.unit.arena.kind(node) else {
            return Vec::new();
        };
        let Some(keyword) = leading_keyword(text) else {
            return Vec::new();
        };
        let banned = cx
            .option_strings("statements")
            .unwrap_or_else(|| DEFAULT_BANNED.iter().map(|s| s.to_string()).collect());
        if banned.iter().any(|b| b.eq_ignore_ascii_case(&keyword)) {
            vec![cx.report(node, format!("banned statement '{}'", keyword))]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_keyword_handles_labels_and_goto() {
        assert_eq!(leading_keyword("  STOP 'done'").as_deref(), Some("stop"));
        assert_eq!(leading_keyword("100 print *, x").as_deref(), Some("print"));
        assert_eq!(leading_keyword("go to 10").as_deref(), Some("goto"));
        assert_eq!(leading_keyword("write(*,*) x").as_deref(), Some("write"));
        assert_eq!(leading_keyword("   "), None);
    }
}
