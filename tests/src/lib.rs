//! Intentionally empty: this crate exists only to host `tests/e2e.rs`, which
//! drives `vitte-compiler` and `vitte-vm` together as an external consumer
//! would, the way the teacher's top-level `tests/` directory does for its
//! own (bytecode-container) integration tests.
