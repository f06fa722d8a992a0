//! Scanner and single-pass bytecode compiler for the Vitte language.
//!
//! The compiler walks the token stream once with a Pratt parser and emits
//! bytecode directly into a [`vitte_core::Chunk`] owned by the function
//! being compiled — there is no intermediate AST. See [`compiler::compile`]
//! for the entry point.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

mod compiler;
mod scanner;

pub use compiler::{compile, CompileError};
pub use scanner::{Scanner, Token, TokenKind};
