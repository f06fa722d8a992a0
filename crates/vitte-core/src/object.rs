//! Heap object variants.
//!
//! Mirrors the original `Obj`/`ObjType` header-plus-payload layout, but
//! expressed as a single Rust enum stored in [`crate::heap::Heap`]'s arena
//! instead of a C `struct Obj` header embedded in each payload with a raw
//! `next` pointer. The workspace forbids `unsafe_code`, so there is no
//! literal intrusive linked list here: the arena's slot vector plays that
//! role, and [`ObjRef`] plays the role of the tagged pointer.

use crate::table::Table;
use crate::value::Value;

/// A `Copy` handle to a heap object living in a [`crate::heap::Heap`] arena.
///
/// Carries a generation counter alongside the slot index so that a stale
/// reference to a freed-and-reused slot is detected (panics in `Heap::get`)
/// rather than silently aliasing an unrelated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObjRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ObjRef {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Raw slot index. Exposed for debugging/disassembly only.
    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }
}

/// What kind of object a [`HeapObject`] is, without its payload. Used by
/// error messages and `print` on instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    String,
    Function,
    Native,
    Closure,
    Upvalue,
    Class,
    Instance,
    BoundMethod,
}

/// A host-supplied native function: `(argc, args) -> Value`.
///
/// Errors are plain messages; `vitte-vm` wraps them into a `RuntimeError`
/// with a trace at the call site.
pub type NativeFn = fn(args: &[Value]) -> core::result::Result<Value, String>;

/// An immutable, interned, hashed byte string.
#[derive(Debug, Clone)]
pub struct ObjString {
    pub bytes: Box<str>,
    pub hash: u32,
}

impl ObjString {
    #[must_use]
    pub fn new(s: &str) -> Self {
        Self { bytes: s.into(), hash: fnv1a32(s.as_bytes()) }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.bytes
    }
}

/// FNV-1a, 32-bit, per spec §3 ("precomputed 32-bit FNV-1a hash").
#[must_use]
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// A compiled function: its own chunk, arity and upvalue count.
#[derive(Debug, Clone)]
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: crate::chunk::Chunk,
    /// `None` for the implicit top-level script function.
    pub name: Option<ObjRef>,
}

impl ObjFunction {
    #[must_use]
    pub fn new(name: Option<ObjRef>) -> Self {
        Self { arity: 0, upvalue_count: 0, chunk: crate::chunk::Chunk::new(), name }
    }
}

/// A host-supplied callable with signature `(argc, args) -> Value`.
#[derive(Clone, Copy)]
pub struct ObjNative {
    pub name: &'static str,
    pub function: NativeFn,
}

impl core::fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObjNative").field("name", &self.name).finish()
    }
}

/// A function bundled with its captured upvalues.
#[derive(Debug, Clone)]
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// Where an [`ObjUpvalue`] currently reads/writes its captured variable.
#[derive(Debug, Clone)]
pub enum UpvalueState {
    /// Points at `stack[slot]` of the owning frame; still reachable via the
    /// VM's open-upvalues list.
    Open { slot: usize },
    /// Owns a heap copy of the value; no longer in the open list.
    Closed(Value),
}

#[derive(Debug, Clone)]
pub struct ObjUpvalue {
    pub state: UpvalueState,
}

/// {name, methods: table from String to Closure}.
#[derive(Debug, Clone)]
pub struct ObjClass {
    pub name: ObjRef,
    pub methods: Table,
}

impl ObjClass {
    #[must_use]
    pub fn new(name: ObjRef) -> Self {
        Self { name, methods: Table::new() }
    }
}

/// {class, fields: table from String to Value}.
#[derive(Debug, Clone)]
pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

impl ObjInstance {
    #[must_use]
    pub fn new(class: ObjRef) -> Self {
        Self { class, fields: Table::new() }
    }
}

/// {receiver, method}.
#[derive(Debug, Clone)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

/// The payload of a heap-allocated object. The mark bit and liveness are
/// tracked by the arena slot wrapping this, not inline (see `heap.rs`).
#[derive(Debug, Clone)]
pub enum HeapObject {
    String(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

impl HeapObject {
    #[must_use]
    pub fn kind(&self) -> ObjKind {
        match self {
            Self::String(_) => ObjKind::String,
            Self::Function(_) => ObjKind::Function,
            Self::Native(_) => ObjKind::Native,
            Self::Closure(_) => ObjKind::Closure,
            Self::Upvalue(_) => ObjKind::Upvalue,
            Self::Class(_) => ObjKind::Class,
            Self::Instance(_) => ObjKind::Instance,
            Self::BoundMethod(_) => ObjKind::BoundMethod,
        }
    }

    /// Approximate byte size, for `bytes_allocated` accounting.
    #[must_use]
    pub fn approx_size(&self) -> usize {
        use core::mem::size_of_val;
        match self {
            Self::String(s) => size_of_val(s) + s.bytes.len(),
            Self::Function(f) => size_of_val(f) + f.chunk.approx_size(),
            Self::Native(n) => size_of_val(n),
            Self::Closure(c) => size_of_val(c) + c.upvalues.len() * size_of::<ObjRef>(),
            Self::Upvalue(u) => size_of_val(u),
            Self::Class(c) => size_of_val(c) + c.methods.approx_size(),
            Self::Instance(i) => size_of_val(i) + i.fields.approx_size(),
            Self::BoundMethod(b) => size_of_val(b),
        }
    }
}
