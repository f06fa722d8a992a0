//! Built-in native function bindings installed by [`crate::Vm::new`].
//!
//! Grounded on the teacher's `Vm::install_stdlib`'s `"clock_ms"` native
//! (`examples/cartman-fr-vitte/crates/vitte-vm/src/lib.rs`), adapted to
//! return seconds as a `Number` per spec §6 rather than milliseconds elapsed
//! since process start.

use vitte_core::Value;

/// `clock()` — seconds elapsed since the Unix epoch.
pub fn clock(_args: &[Value]) -> Result<Value, String> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| e.to_string())?;
    Ok(Value::from(now.as_secs_f64()))
}
