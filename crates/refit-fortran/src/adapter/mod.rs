//! Frontend adapters.
//!
//! Each adapter maps its engine's tree onto the IR. Adapters share the
//! conventions in [`Lowering`] so that the in-process engines agree node for
//! node:
//!
//! - statement nodes span whole logical lines; containers also record the
//!   opening and closing lines as `head` and `tail`
//! - expression nodes carry no span
//! - comment text is trimmed; directives become one [`NodeKind::Pragma`] per
//!   physical line; preprocessor lines and opaque constructs become
//!   [`NodeKind::Verbatim`] text

mod external;
mod lines;
mod tree;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use refit_core::ir::{Arena, NodeId, NodeKind};
use refit_core::scheduler::ProcessLimiter;
use refit_core::text::{indent_width, split_directive};
use refit_core::types::{SourceId, Span};
use refit_core::{ParseError, SourceUnit};

use crate::engines::Role;
use crate::reader::dedent;

// ============================================================================
// Frontend Selection
// ============================================================================

/// The closed set of frontend backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrontendKind {
    /// Flat statement stream; comments ride along as metadata.
    Lines,
    /// Nested concrete tree with wrapper nodes.
    Tree,
    /// External program printing a JSON tree.
    External,
}

impl FrontendKind {
    pub const ALL: [FrontendKind; 3] = [
        FrontendKind::Lines,
        FrontendKind::Tree,
        FrontendKind::External,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FrontendKind::Lines => "lines",
            FrontendKind::Tree => "tree",
            FrontendKind::External => "external",
        }
    }

    /// Does the backend run in this process?
    pub fn is_in_process(self) -> bool {
        !matches!(self, FrontendKind::External)
    }
}

impl fmt::Display for FrontendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error for an unknown frontend name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown frontend '{0}' (expected lines, tree or external)")]
pub struct UnknownFrontend(pub String);

impl FromStr for FrontendKind {
    type Err = UnknownFrontend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FrontendKind::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownFrontend(s.to_string()))
    }
}

/// Options passed through to a frontend.
#[derive(Debug, Clone, Default)]
pub struct FrontendOptions {
    /// Program run by the external backend.
    pub command: Option<String>,
    /// Include directories, passed to the external backend as `-I`.
    pub include_dirs: Vec<PathBuf>,
    /// Deadline for one external invocation.
    pub timeout: Option<Duration>,
    /// Bound on concurrently running external processes.
    pub limiter: Option<ProcessLimiter>,
}

impl FrontendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_include_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.include_dirs.push(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_limiter(mut self, limiter: ProcessLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }
}

/// Parse `text` (read from `path`) with the given frontend.
///
/// The returned unit has `SourceId(0)`; the session assigns real ids.
pub fn parse_source(
    frontend: FrontendKind,
    options: &FrontendOptions,
    path: &Path,
    text: &str,
) -> Result<SourceUnit, ParseError> {
    let started = Instant::now();
    let file = path.display().to_string();
    let (arena, root, comments_in_ir) = match frontend {
        FrontendKind::Lines => {
            let (arena, root) = lines::lower(text).map_err(|e| e.into_parse_error(&file))?;
            (arena, root, true)
        }
        FrontendKind::Tree => {
            let (arena, root) = tree::lower(text).map_err(|e| e.into_parse_error(&file))?;
            (arena, root, true)
        }
        FrontendKind::External => {
            let (arena, root) =
                external::lower(options, path, text).map_err(|e| e.into_parse_error(&file))?;
            (arena, root, false)
        }
    };
    debug!(
        file = %file,
        frontend = frontend.name(),
        nodes = arena.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "parsed source"
    );
    let mut unit = SourceUnit::new(SourceId(0), path, text, frontend.name(), arena, root);
    unit.comments_in_ir = comments_in_ir;
    Ok(unit)
}

// ============================================================================
// Adapter Errors
// ============================================================================

/// Failure of an adapter, before the file name is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LowerError {
    pub frontend: FrontendKind,
    pub message: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl LowerError {
    pub(crate) fn new(frontend: FrontendKind, message: impl Into<String>) -> Self {
        LowerError {
            frontend,
            message: message.into(),
            line: None,
            column: None,
        }
    }

    pub(crate) fn at(mut self, line: u32, column: Option<u32>) -> Self {
        self.line = Some(line);
        self.column = column;
        self
    }

    fn into_parse_error(self, file: &str) -> ParseError {
        let err = ParseError::new(file, self.frontend.name(), self.message);
        match self.line {
            Some(line) => err.at(line, self.column),
            None => err,
        }
    }
}

// ============================================================================
// Shared Lowering
// ============================================================================

/// Arena under construction plus the source text spans refer to.
pub(crate) struct Lowering<'t> {
    pub arena: Arena,
    text: &'t str,
}

impl<'t> Lowering<'t> {
    pub(crate) fn new(text: &'t str) -> Self {
        Lowering {
            arena: Arena::new(),
            text,
        }
    }

    /// Expression or other span-less node.
    pub(crate) fn node(&mut self, kind: NodeKind) -> NodeId {
        self.arena.alloc(kind)
    }

    /// Statement spanning whole lines.
    pub(crate) fn statement(&mut self, kind: NodeKind, span: Span) -> NodeId {
        self.arena.alloc_spanned(kind, Some(span))
    }

    pub(crate) fn container(&mut self, kind: NodeKind, head: Span, tail: Span) -> NodeId {
        self.arena
            .alloc_container(kind, Some(head.cover(&tail)), Some(head), Some(tail))
    }

    pub(crate) fn comment(&mut self, text: &str, span: Span) -> NodeId {
        self.statement(
            NodeKind::Comment {
                text: text.trim().to_string(),
            },
            span,
        )
    }

    pub(crate) fn directive(&mut self, text: &str, span: Span) -> NodeId {
        match split_directive(text) {
            Some((keyword, content)) => self.statement(NodeKind::Pragma { keyword, content }, span),
            None => self.comment(text, span),
        }
    }

    pub(crate) fn preprocessor(&mut self, text: &str, span: Span) -> NodeId {
        self.statement(
            NodeKind::Verbatim {
                text: text.trim().to_string(),
            },
            span,
        )
    }

    /// Source lines kept as text, dedented by the first line's indentation.
    pub(crate) fn verbatim(&mut self, span: Span) -> NodeId {
        let first = self
            .text
            .get(span.start..span.end)
            .and_then(|s| s.lines().next())
            .unwrap_or("");
        let text = dedent(self.text, span, indent_width(first));
        self.statement(NodeKind::Verbatim { text }, span)
    }

    /// Close the file: every item under a spanning `File` root.
    pub(crate) fn finish(mut self, items: Vec<NodeId>) -> (Arena, NodeId) {
        let span = Span::new(0, self.text.len());
        let root = self
            .arena
            .alloc_spanned(NodeKind::File { items }, Some(span));
        (self.arena, root)
    }
}

/// Items of a unit or block body, with their roles.
#[derive(Debug, Default)]
pub(crate) struct Part {
    items: Vec<(NodeId, Role)>,
}

impl Part {
    pub(crate) fn push(&mut self, id: NodeId, role: Role) {
        self.items.push((id, role));
    }

    /// Split at the end of the specification part.
    pub(crate) fn split(self) -> (Vec<NodeId>, Vec<NodeId>) {
        let roles: Vec<Role> = self.items.iter().map(|(_, r)| *r).collect();
        let at = crate::engines::split_point(&roles);
        let mut spec: Vec<NodeId> = self.items.into_iter().map(|(id, _)| id).collect();
        let exec = spec.split_off(at);
        (spec, exec)
    }

    pub(crate) fn into_ids(self) -> Vec<NodeId> {
        self.items.into_iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontend_names_round_trip() {
        for kind in FrontendKind::ALL {
            assert_eq!(kind.name().parse::<FrontendKind>().unwrap(), kind);
        }
        assert_eq!("TREE".parse::<FrontendKind>().unwrap(), FrontendKind::Tree);
        assert!("fparser".parse::<FrontendKind>().is_err());
        assert!(!FrontendKind::External.is_in_process());
    }

    #[test]
    fn frontend_kind_serializes_lowercase() {
        let json = serde_json::to_string(&FrontendKind::Lines).unwrap();
        assert_eq!(json, "\"lines\"");
    }

    #[test]
    fn verbatim_text_is_dedented() {
        let text = "  type t\n    integer :: a\n  end type t\n";
        let mut lowering = Lowering::new(text);
        let id = lowering.verbatim(Span::new(0, text.len() - 1));
        assert_eq!(
            lowering.arena.kind(id),
            &NodeKind::Verbatim {
                text: "type t\n  integer :: a\nend type t".into()
            }
        );
    }

    #[test]
    fn directives_become_pragmas() {
        let mut lowering = Lowering::new("");
        let id = lowering.directive("  !$acc parallel loop", Span::new(0, 0));
        assert_eq!(
            lowering.arena.kind(id),
            &NodeKind::Pragma {
                keyword: "acc".into(),
                content: "parallel loop".into()
            }
        );
    }

    #[test]
    fn parts_split_after_last_spec_item() {
        let mut part = Part::default();
        part.push(NodeId(0), Role::Spec);
        part.push(NodeId(1), Role::Neutral);
        part.push(NodeId(2), Role::Exec);
        let (spec, exec) = part.split();
        assert_eq!(spec, vec![NodeId(0)]);
        assert_eq!(exec, vec![NodeId(1), NodeId(2)]);
    }
}
