//! Provides [CompileError], the error that [crate::compiler::compile] returns.
use thiserror::Error;

/// Signals that a `compile` invocation saw at least one diagnostic and refused to produce a
/// usable [crate::value::Function].
///
/// The individual diagnostics (lex errors, parse errors, name-resolution errors, and the u8/u16
/// limit errors) are all rendered to the diagnostic stream as they are discovered; this type
/// carries no payload because the return channel only ever needs to signal "at least one of those
/// happened", never which one.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("compilation failed; see reported diagnostics")]
pub struct CompileError;
