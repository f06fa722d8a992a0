//! Core data model for the bytecode virtual machine: values, heap objects,
//! the GC arena, the hash table, and the bytecode chunk format.
//!
//! `vitte-compiler` emits [`chunk::Chunk`]s against this crate's [`object`]
//! and [`heap`] types; `vitte-vm` executes them. None of these three crates
//! know about each other's wire formats beyond what's exposed here.
//!
//! # Value representation
//!
//! Two interchangeable backends implement `Value`: the default tagged union
//! ([`value_tagged`]) and an optional NaN-boxed 64-bit encoding
//! ([`value_nanbox`], behind the `value-nan-boxed` feature). Both expose an
//! identical API, so enabling the feature changes memory layout and
//! performance only, never semantics.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]
#![cfg_attr(not(debug_assertions), warn(missing_docs))]

pub mod chunk;
pub mod error;
pub mod heap;
pub mod object;
pub mod table;

#[cfg(not(feature = "value-nan-boxed"))]
mod value_tagged;
#[cfg(feature = "value-nan-boxed")]
mod value_nanbox;

/// The active `Value` backend. See the crate docs for why there are two
/// implementations sharing one name.
pub mod value {
    #[cfg(not(feature = "value-nan-boxed"))]
    pub use crate::value_tagged::Value;
    #[cfg(feature = "value-nan-boxed")]
    pub use crate::value_nanbox::Value;
}

pub use chunk::{Chunk, OpCode};
pub use error::{Error, Result};
pub use heap::{GcRoots, Heap, NoRoots};
pub use object::{HeapObject, ObjKind, ObjRef, ObjString};
pub use table::Table;
pub use value::Value;

/// Convenience re-exports for downstream crates (`vitte-compiler`,
/// `vitte-vm`, `vitte-cli`).
pub mod prelude {
    pub use crate::{
        chunk::{Chunk, OpCode},
        error::{Error, Result},
        heap::{GcRoots, Heap, NoRoots},
        object::{HeapObject, ObjKind, ObjRef},
        table::Table,
        value::Value,
    };
}

#[cfg(all(feature = "value-nan-boxed", test))]
mod backend_parity_tests {
    //! Lives at the crate root (rather than inside `value_tagged` or
    //! `value_nanbox`) so it runs against whichever backend a given `cargo
    //! test` invocation selected, catching behavioral drift between them.
    use crate::value::Value;

    #[test]
    fn nan_is_never_equal_to_itself() {
        let nan = Value::from(f64::NAN);
        assert_ne!(nan, nan);
    }

    #[test]
    fn falsey_values_are_nil_and_false_only() {
        assert!(!Value::nil().is_truthy());
        assert!(!Value::from(false).is_truthy());
        assert!(Value::from(true).is_truthy());
        assert!(Value::from(0.0).is_truthy());
    }
}
