//! Rule engine.
//!
//! Rules subscribe to node types. [`LintEngine::check_unit`] walks a source
//! unit once and hands every subscribed node to the rules that asked for it,
//! then drops the diagnostics silenced by suppression markers in the source.

mod render;
mod rules;
mod suppress;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::ir::{NodeId, NodeType};
use crate::source::SourceUnit;
use crate::types::Span;
use crate::visit::{NodeFilter, VisitResult, Visitor, Walker};

pub use render::{render_diagnostic, render_diagnostics};
pub use rules::{ArrayIntent, BannedStatements, ImplicitNone, MaxDummyArgs};
pub use suppress::{Suppression, Suppressions};

// ============================================================================
// Diagnostics
// ============================================================================

/// How serious a finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

impl Severity {
    pub fn name(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }

    pub fn parse(text: &str) -> Option<Severity> {
        match text.to_ascii_lowercase().as_str() {
            "info" => Some(Severity::Info),
            "warning" | "warn" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            "fatal" => Some(Severity::Fatal),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One finding of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub rule_id: String,
    pub severity: Severity,
    pub file: String,
    /// Byte span in the original text, if the offending node has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
    /// 1-indexed line of the span start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}: ", self.file, line)?,
            None => write!(f, "{}: ", self.file)?,
        }
        write!(f, "{}[{}]: {}", self.severity, self.rule_id, self.message)
    }
}

// ============================================================================
// Rules
// ============================================================================

/// A lint rule.
pub trait Rule: Send + Sync {
    /// Stable kebab-case identifier, used in configuration and markers.
    fn id(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn default_severity(&self) -> Severity {
        Severity::Warning
    }

    /// Node types passed to [`Rule::check`].
    fn subscriptions(&self) -> &'static [NodeType];

    fn check(&self, cx: &RuleContext<'_>, node: NodeId) -> Vec<Diagnostic>;
}

/// What a rule sees while checking one node.
pub struct RuleContext<'a> {
    pub unit: &'a SourceUnit,
    pub rule_id: &'static str,
    pub severity: Severity,
    pub options: &'a serde_json::Value,
}

impl RuleContext<'_> {
    /// Diagnostic located at `node`. Containers are reported at their
    /// opening line.
    pub fn report(&self, node: NodeId, message: impl Into<String>) -> Diagnostic {
        let arena = &self.unit.arena;
        let span = arena.head(node).or_else(|| arena.location_span(node));
        Diagnostic {
            rule_id: self.rule_id.to_string(),
            severity: self.severity,
            file: self.unit.file_name(),
            span,
            line: span.map(|s| self.unit.line_of(s.start)),
            message: message.into(),
        }
    }

    pub fn option_usize(&self, key: &str) -> Option<usize> {
        self.options
            .get(key)
            .and_then(serde_json::Value::as_u64)
            .map(|v| v as usize)
    }

    pub fn option_strings(&self, key: &str) -> Option<Vec<String>> {
        self.options.get(key)?.as_array().map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
    }
}

/// Per-rule configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSettings {
    pub enabled: bool,
    /// Overrides the rule's default severity.
    pub severity: Option<Severity>,
    pub options: serde_json::Value,
}

impl Default for RuleSettings {
    fn default() -> Self {
        RuleSettings {
            enabled: true,
            severity: None,
            options: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

/// Errors raised while configuring the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LintConfigError {
    #[error("unknown rule '{id}'")]
    UnknownRule { id: String },
}

/// Available rules by id.
#[derive(Clone, Default)]
pub struct RuleRegistry {
    rules: BTreeMap<&'static str, Arc<dyn Rule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in rule.
    pub fn builtin() -> Self {
        let mut registry = RuleRegistry::new();
        registry.register(Arc::new(ArrayIntent));
        registry.register(Arc::new(ImplicitNone));
        registry.register(Arc::new(MaxDummyArgs));
        registry.register(Arc::new(BannedStatements));
        registry
    }

    pub fn register(&mut self, rule: Arc<dyn Rule>) {
        self.rules.insert(rule.id(), rule);
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Rule>> {
        self.rules.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rules.keys().copied()
    }
}

impl fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.rules.keys()).finish()
    }
}

// ============================================================================
// Engine
// ============================================================================

struct ActiveRule {
    rule: Arc<dyn Rule>,
    severity: Severity,
    options: serde_json::Value,
}

/// Runs a configured set of rules in one traversal per unit.
pub struct LintEngine {
    rules: Vec<ActiveRule>,
    /// Rule indices per node type.
    dispatch: Vec<Vec<usize>>,
    filter: NodeFilter,
}

/// Result of checking one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintReport {
    pub diagnostics: Vec<Diagnostic>,
    /// Diagnostics dropped by suppression markers.
    pub suppressed: usize,
}

impl LintEngine {
    /// Engine with every registered rule enabled at its default severity,
    /// adjusted by `settings`.
    pub fn new(
        registry: &RuleRegistry,
        settings: &BTreeMap<String, RuleSettings>,
    ) -> Result<Self, LintConfigError> {
        if let Some(unknown) = settings.keys().find(|id| registry.get(id).is_none()) {
            return Err(LintConfigError::UnknownRule {
                id: unknown.clone(),
            });
        }
        let mut rules = Vec::new();
        for id in registry.ids() {
            let Some(rule) = registry.get(id) else {
                continue;
            };
            let configured = settings.get(id).cloned().unwrap_or_default();
            if !configured.enabled {
                continue;
            }
            rules.push(ActiveRule {
                rule: Arc::clone(rule),
                severity: configured.severity.unwrap_or_else(|| rule.default_severity()),
                options: configured.options,
            });
        }
        let mut dispatch = vec![Vec::new(); NodeType::ALL.len()];
        let mut filter = NodeFilter::none();
        for (idx, active) in rules.iter().enumerate() {
            for &ty in active.rule.subscriptions() {
                dispatch[ty as usize].push(idx);
                filter = filter.with(ty);
            }
        }
        Ok(LintEngine {
            rules,
            dispatch,
            filter,
        })
    }

    pub fn rule_ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.rule.id()).collect()
    }

    /// Check one unit: a single traversal, then suppression.
    pub fn check_unit(&self, unit: &SourceUnit) -> LintReport {
        let mut visitor = LintVisitor {
            engine: self,
            unit,
            found: Vec::new(),
        };
        if !self.filter.is_empty() {
            Walker::pre_order()
                .with_filter(self.filter)
                .walk(&unit.arena, unit.root, &mut visitor);
        }
        let found = visitor.found;
        let total = found.len();

        let suppressions = Suppressions::scan(&unit.text);
        let mut diagnostics: Vec<Diagnostic> = found
            .into_iter()
            .filter(|d| !suppressions.suppresses(&unit.text, d))
            .collect();
        diagnostics.sort_by(|a, b| {
            (a.line, a.span.map(|s| s.start), &a.rule_id).cmp(&(b.line, b.span.map(|s| s.start), &b.rule_id))
        });
        let suppressed = total - diagnostics.len();
        debug!(
            file = %unit.path.display(),
            diagnostics = diagnostics.len(),
            suppressed,
            "linted source unit"
        );
        LintReport {
            diagnostics,
            suppressed,
        }
    }
}

struct LintVisitor<'e> {
    engine: &'e LintEngine,
    unit: &'e SourceUnit,
    found: Vec<Diagnostic>,
}

impl Visitor for LintVisitor<'_> {
    fn enter(&mut self, arena: &crate::ir::Arena, id: NodeId) -> VisitResult {
        let ty = arena.node_type(id);
        for &idx in &self.engine.dispatch[ty as usize] {
            let active = &self.engine.rules[idx];
            let cx = RuleContext {
                unit: self.unit,
                rule_id: active.rule.id(),
                severity: active.severity,
                options: &active.options,
            };
            self.found.extend(active.rule.check(&cx, id));
        }
        VisitResult::Continue
    }

    fn leave(&mut self, _arena: &crate::ir::Arena, _id: NodeId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_parse_and_order() {
        assert_eq!(Severity::parse("WARN"), Some(Severity::Warning));
        assert_eq!(Severity::parse("nope"), None);
        assert!(Severity::Info < Severity::Fatal);
    }

    #[test]
    fn diagnostic_display() {
        let d = Diagnostic {
            rule_id: "array-intent".into(),
            severity: Severity::Warning,
            file: "k.f90".into(),
            span: Some(Span::new(10, 20)),
            line: Some(3),
            message: "array dummy argument 'b' has no intent".into(),
        };
        assert_eq!(
            d.to_string(),
            "k.f90:3: warning[array-intent]: array dummy argument 'b' has no intent"
        );
    }

    #[test]
    fn unknown_rule_in_settings() {
        let mut settings = BTreeMap::new();
        settings.insert("no-such-rule".to_string(), RuleSettings::default());
        let err = LintEngine::new(&RuleRegistry::builtin(), &settings).err();
        assert_eq!(
            err,
            Some(LintConfigError::UnknownRule {
                id: "no-such-rule".into()
            })
        );
    }

    #[test]
    fn disabled_rules_are_dropped() {
        let mut settings = BTreeMap::new();
        settings.insert(
            "implicit-none".to_string(),
            RuleSettings {
                enabled: false,
                ..Default::default()
            },
        );
        let engine = LintEngine::new(&RuleRegistry::builtin(), &settings).unwrap();
        assert!(!engine.rule_ids().contains(&"implicit-none"));
        assert!(engine.rule_ids().contains(&"array-intent"));
    }
}
