//! Fortran concrete syntax for refit.
//!
//! - [`reader`]: logical lines, continuations, comments and opaque blocks
//! - [`engines`]: the three parsing backends (lines, tree, external)
//! - [`adapter`]: lowering of each backend's tree onto the shared IR
//! - [`regen`]: source regeneration with round-trip verification
//! - [`render`]: parse errors with source excerpts

pub mod adapter;
pub mod engines;
pub mod reader;
pub mod regen;
pub mod render;

pub use adapter::{parse_source, FrontendKind, FrontendOptions, UnknownFrontend};
pub use regen::{regenerate, regenerate_checked};
pub use render::render_parse_error;
