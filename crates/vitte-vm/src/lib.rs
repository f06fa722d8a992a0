//! `vitte-vm` — the stack-based bytecode interpreter and GC driver for the
//! Vitte language.
//!
//! A [`Vm`] owns a [`vitte_core::Heap`], compiles source through
//! `vitte-compiler`, and executes the resulting bytecode directly — no
//! intermediate representation, no on-disk bytecode format. `print` output
//! and error reports go through a [`Host`] the embedder supplies.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

mod natives;
mod vm;

pub use vitte_core::Value;
pub use vm::{
    disassemble_program, DefaultHost, Host, InterpretResult, TraceFrame, Vm, VmOptions,
};
