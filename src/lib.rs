//! A single-pass bytecode compiler for [Lox][lox].
//!
//! See [part III][bytecode] of [Crafting Interpreters][book] for the broader context this
//! compiler's design is drawn from; unlike that book, this crate stops at the compiler: it
//! produces a [value::Function] full of bytecode and does not execute it.
//!
//! [book]: https://craftinginterpreters.com/
//! [bytecode]: https://craftinginterpreters.com/a-bytecode-virtual-machine.html
//! [lox]: https://craftinginterpreters.com/the-lox-language.html

pub mod chunk;
pub mod compiler;
pub mod debug;
pub mod error;
pub mod gc;
pub mod scanner;
pub mod value;

mod with_try_from_u8;

/// The type returned by various functions that parse and compile Lox code.
/// This is the standard [std::result::Result], but the error is always [error::CompileError].
/// This type alias is generic for the return type, however.
///
/// ```
/// fn compile() -> loxc::Result<()> {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, error::CompileError>;

/// Re-exports common items.
///
/// Since Part III of Crafting Interpreters is written in C, which lacks explicit features for
/// scoping across modules, many items are assumed to be globally-visible. Therefore, we export the
/// most common "global" items here:
pub mod prelude {
    pub use crate::chunk::{Chunk, OpCode};
    pub use crate::compiler::compile;
    pub use crate::error::CompileError;
    pub use crate::gc::ActiveGC;
    pub use crate::scanner::{Lexeme, Scanner, Token};
    pub use crate::value::{Function, Value};
}
