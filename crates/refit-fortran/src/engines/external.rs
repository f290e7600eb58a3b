//! External engine.
//!
//! Runs a separate parser program and reads the JSON tree it prints. The
//! program is invoked as
//!
//! ```text
//! <command> [-I <dir>]... <path>
//! ```
//!
//! with the source text on stdin, and prints one [`XNode`] of tag `file` on
//! stdout (or a node of tag `error`). Comments are not part of the tree;
//! directives appear as `pragma` nodes. Line numbers are 1-indexed physical
//! lines of the input.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use refit_core::scheduler::ProcessLimiter;

// ============================================================================
// Tree Model
// ============================================================================

/// One node of the external tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_lineno: Option<u32>,
    #[serde(flatten)]
    pub kind: XKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XType {
    pub base: String,
    #[serde(default)]
    pub selector: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XUseItem {
    pub name: String,
    #[serde(default)]
    pub rename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XEntity {
    pub name: String,
    #[serde(default)]
    pub shape: Vec<XExpr>,
    #[serde(default)]
    pub init: Option<XExpr>,
    #[serde(default)]
    pub pointer_init: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XBranch {
    pub condition: XExpr,
    #[serde(default)]
    pub children: Vec<XNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum XKind {
    File {
        #[serde(default)]
        children: Vec<XNode>,
    },
    /// The program rejected its input.
    Error {
        message: String,
        #[serde(default)]
        column: Option<u32>,
    },
    Module {
        name: String,
        #[serde(default)]
        children: Vec<XNode>,
        #[serde(default)]
        contains: Vec<XNode>,
    },
    Program {
        name: String,
        #[serde(default)]
        children: Vec<XNode>,
        #[serde(default)]
        contains: Vec<XNode>,
    },
    Subroutine {
        name: String,
        #[serde(default)]
        prefixes: Vec<String>,
        #[serde(default)]
        params: Vec<String>,
        #[serde(default)]
        children: Vec<XNode>,
        #[serde(default)]
        contains: Vec<XNode>,
    },
    Function {
        name: String,
        #[serde(default)]
        prefixes: Vec<String>,
        #[serde(default)]
        params: Vec<String>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        return_type: Option<XType>,
        #[serde(default)]
        children: Vec<XNode>,
        #[serde(default)]
        contains: Vec<XNode>,
    },
    Use {
        module: String,
        #[serde(default)]
        intrinsic: bool,
        #[serde(default)]
        only: Option<Vec<XUseItem>>,
    },
    Implicit {
        spec: String,
    },
    Declaration {
        #[serde(rename = "type")]
        type_spec: XType,
        /// Attribute specs as written (`intent(in)`, `save`, ...).
        #[serde(default)]
        attrs: Vec<String>,
        entities: Vec<XEntity>,
    },
    Include {
        path: String,
    },
    Assignment {
        target: XExpr,
        value: XExpr,
        #[serde(default)]
        pointer: bool,
    },
    Call {
        name: String,
        #[serde(default)]
        args: Vec<XExpr>,
    },
    Do {
        variable: String,
        start: XExpr,
        end: XExpr,
        #[serde(default)]
        step: Option<XExpr>,
        #[serde(default)]
        children: Vec<XNode>,
    },
    DoWhile {
        #[serde(default)]
        condition: Option<XExpr>,
        #[serde(default)]
        children: Vec<XNode>,
    },
    If {
        branches: Vec<XBranch>,
        #[serde(default)]
        else_children: Option<Vec<XNode>>,
        #[serde(default)]
        inline: bool,
    },
    Block {
        #[serde(default)]
        children: Vec<XNode>,
    },
    Return,
    Exit,
    Cycle,
    /// Directive line, full text (`!$acc loop`).
    Pragma {
        text: String,
    },
    /// Anything else; the text is taken from the source lines.
    Verbatim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XLiteral {
    Integer,
    Real,
    Logical,
    String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum XExpr {
    Literal {
        kind: XLiteral,
        text: String,
    },
    Var {
        name: String,
    },
    Subscript {
        name: String,
        #[serde(default)]
        args: Vec<XExpr>,
    },
    Range {
        #[serde(default)]
        lower: Option<Box<XExpr>>,
        #[serde(default)]
        upper: Option<Box<XExpr>>,
        #[serde(default)]
        stride: Option<Box<XExpr>>,
    },
    Keyword {
        name: String,
        value: Box<XExpr>,
    },
    /// `op` is any accepted spelling (`+`, `.eq.`, `==`, ...).
    Binary {
        op: String,
        lhs: Box<XExpr>,
        rhs: Box<XExpr>,
    },
    Unary {
        op: String,
        operand: Box<XExpr>,
    },
    Paren {
        inner: Box<XExpr>,
    },
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExternalError {
    #[error("no external frontend command configured")]
    NoCommand,

    #[error("external frontend '{command}' not found: {message}")]
    NotFound { command: String, message: String },

    #[error("failed to run '{command}': {message}")]
    Io { command: String, message: String },

    #[error("'{command}' timed out after {}ms", .timeout.as_millis())]
    Timeout { command: String, timeout: Duration },

    #[error("'{command}' exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("invalid tree from '{command}': {message}")]
    Json { command: String, message: String },

    /// The program reported a syntax error.
    #[error("{message}")]
    Reported {
        message: String,
        line: Option<u32>,
        column: Option<u32>,
    },
}

// ============================================================================
// Invocation
// ============================================================================

/// One run of the external program.
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    /// Program plus leading arguments, whitespace separated.
    pub command: &'a str,
    pub include_dirs: &'a [PathBuf],
    pub path: &'a Path,
    pub text: &'a str,
    pub timeout: Option<Duration>,
}

impl Invocation<'_> {
    fn arguments(&self) -> Vec<String> {
        let mut args: Vec<String> = self
            .command
            .split_whitespace()
            .skip(1)
            .map(str::to_string)
            .collect();
        for dir in self.include_dirs {
            args.push("-I".to_string());
            args.push(dir.display().to_string());
        }
        args.push(self.path.display().to_string());
        args
    }
}

fn io_error(command: &str, err: impl std::fmt::Display) -> ExternalError {
    ExternalError::Io {
        command: command.to_string(),
        message: err.to_string(),
    }
}

/// Run the program and return the root of its tree.
///
/// Holds a limiter slot, when given, for the lifetime of the process.
pub fn run(
    invocation: &Invocation<'_>,
    limiter: Option<&ProcessLimiter>,
) -> Result<XNode, ExternalError> {
    let command = invocation.command;
    let program = command
        .split_whitespace()
        .next()
        .ok_or(ExternalError::NoCommand)?;
    let program = which::which(program).map_err(|e| ExternalError::NotFound {
        command: command.to_string(),
        message: e.to_string(),
    })?;

    let _permit = limiter.map(ProcessLimiter::acquire);
    let started = Instant::now();

    let mut child = Command::new(&program)
        .args(invocation.arguments())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| io_error(command, e))?;

    // Feed stdin and drain both pipes on their own threads so a large tree
    // cannot block the child on a full pipe.
    let input = invocation.text.to_string();
    let mut stdin = child.stdin.take();
    let writer = thread::spawn(move || {
        if let Some(stdin) = stdin.as_mut() {
            // A program that ignores stdin may close it early.
            let _ = stdin.write_all(input.as_bytes());
        }
    });
    let stdout = child.stdout.take();
    let stdout_reader = thread::spawn(move || drain(stdout));
    let stderr = child.stderr.take();
    let stderr_reader = thread::spawn(move || drain(stderr));

    let status = match invocation.timeout {
        Some(limit) => child.wait_timeout(limit).map_err(|e| io_error(command, e))?,
        None => Some(child.wait().map_err(|e| io_error(command, e))?),
    };
    let Some(status) = status else {
        let _ = child.kill();
        let _ = child.wait();
        let timeout = invocation.timeout.unwrap_or_default();
        warn!(command, path = %invocation.path.display(), ?timeout, "external frontend timed out");
        return Err(ExternalError::Timeout {
            command: command.to_string(),
            timeout,
        });
    };

    let _ = writer.join();
    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();
    debug!(
        command,
        path = %invocation.path.display(),
        status = %status,
        bytes = stdout.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "external frontend finished"
    );

    if !status.success() {
        return Err(ExternalError::Failed {
            command: command.to_string(),
            status: status.to_string(),
            stderr: stderr.trim().to_string(),
        });
    }
    let node = parse_tree(&stdout).map_err(|message| ExternalError::Json {
        command: command.to_string(),
        message,
    })?;
    match node.kind {
        XKind::Error { message, column } => Err(ExternalError::Reported {
            message,
            line: node.lineno,
            column,
        }),
        _ => Ok(node),
    }
}

fn drain(pipe: Option<impl Read>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buf);
    }
    buf
}

/// Decode the program's output.
pub fn parse_tree(json: &str) -> Result<XNode, String> {
    serde_json::from_str(json).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_nested_nodes() {
        let json = r#"{
            "tag": "file",
            "children": [{
                "tag": "subroutine", "name": "s", "params": ["a"],
                "lineno": 1, "end_lineno": 4,
                "children": [
                    {"tag": "pragma", "text": "!$acc kernels", "lineno": 2},
                    {"tag": "call", "name": "b", "lineno": 3,
                     "args": [{"tag": "binary", "op": "+",
                               "lhs": {"tag": "var", "name": "a"},
                               "rhs": {"tag": "literal", "kind": "integer", "text": "1"}}]}
                ]
            }]
        }"#;
        let node = parse_tree(json).unwrap();
        let XKind::File { children } = node.kind else {
            panic!("not a file");
        };
        assert_eq!(children[0].lineno, Some(1));
        match &children[0].kind {
            XKind::Subroutine { name, children, .. } => {
                assert_eq!(name, "s");
                assert_eq!(children.len(), 2);
                assert!(matches!(children[1].kind, XKind::Call { ref args, .. } if args.len() == 1));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unit_variants_and_errors() {
        let node = parse_tree(r#"{"tag": "return", "lineno": 7}"#).unwrap();
        assert_eq!(node.kind, XKind::Return);
        assert!(parse_tree(r#"{"tag": "nonsense"}"#).is_err());
    }

    #[test]
    fn include_dirs_come_before_the_path() {
        let dirs = vec![PathBuf::from("inc")];
        let inv = Invocation {
            command: "parser --json",
            include_dirs: &dirs,
            path: Path::new("a.f90"),
            text: "",
            timeout: None,
        };
        assert_eq!(inv.arguments(), vec!["--json", "-I", "inc", "a.f90"]);
    }

    #[test]
    fn missing_program_is_reported() {
        let inv = Invocation {
            command: "refit-no-such-frontend-program",
            include_dirs: &[],
            path: Path::new("a.f90"),
            text: "",
            timeout: None,
        };
        assert!(matches!(run(&inv, None), Err(ExternalError::NotFound { .. })));
    }
}
