//! Core infrastructure for refit.
//!
//! This crate is frontend-agnostic and provides:
//! - The unified IR (arena, spans, parent back-references)
//! - Symbol tables, scopes and the cross-file module table
//! - Typed traversal and copy-on-write rewriting
//! - The call graph and the pass scheduler with its result cache
//! - Built-in passes
//! - The lint rule engine with suppression markers
//! - Error types and diagnostic rendering

pub mod cache;
pub mod callgraph;
pub mod error;
pub mod hash;
pub mod ir;
pub mod lint;
pub mod passes;
pub mod scheduler;
pub mod source;
pub mod symbols;
pub mod text;
pub mod types;
pub mod visit;

pub use error::{ParseError, RegenerationError, SchedulingError, TransformError};
pub use source::{SharedUnit, SourceUnit};
pub use types::{SourceId, Span};
