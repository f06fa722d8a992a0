//! Crate-wide error type.
//!
//! Library code never reaches for `anyhow`: every fallible operation here
//! returns a concrete, matchable variant. `vitte-cli` is the only place that
//! folds these into an `anyhow::Error` for top-level reporting.

use thiserror::Error;

/// Errors produced by the core (heap, table, chunk) layer.
#[derive(Debug, Error)]
pub enum Error {
    /// The heap could not satisfy an allocation request.
    #[error("out of memory")]
    OutOfMemory,

    /// An internal invariant was violated (debug builds only surface this;
    /// release builds should never hit it).
    #[error("internal invariant violated: {0}")]
    Invariant(&'static str),

    /// A chunk exceeded one of the one-byte-operand boundaries (256
    /// constants, 256 locals, 256 upvalues, or a 65536-byte jump).
    #[error("chunk limit exceeded: {0}")]
    ChunkLimit(&'static str),
}

/// Convenience alias for core-layer results.
pub type Result<T> = core::result::Result<T, Error>;
