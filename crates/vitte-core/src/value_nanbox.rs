//! Alternate 64-bit NaN-boxed `Value` encoding, behind the `value-nan-boxed`
//! feature. Exposes the exact same API as [`crate::value_tagged`] so the rest
//! of the crate is backend-agnostic (see SPEC_FULL.md §9 "Tagged union vs.
//! NaN boxing").
//!
//! Layout, grounded on `examples/original_source/src/common/ysvalue.h`'s
//! `ENABLE_NAN_TAGGING` branch: any `f64` bit pattern that is not a quiet NaN
//! with our reserved payload is a plain IEEE-754 number. Otherwise:
//! - sign bit set ⇒ an object reference, payload = 32-bit arena index in the
//!   low 32 bits and a (possibly truncated) 18-bit generation above it —
//!   narrower than clox's 48-bit native pointer because our "pointer" is only
//!   ever a `u32` arena index. 18 bits, not 19: bit 50 of the packed `u64` is
//!   already forced to 1 by `QNAN`'s reserved pattern, so a 19-bit generation
//!   would have its top bit silently cleared on every decode.
//! - sign bit clear, low 2 payload bits = 01/10/11 ⇒ nil/false/true.

use crate::object::ObjRef;

const QNAN: u64 = 0x7ffc_0000_0000_0000;
const SIGN_BIT: u64 = 0x8000_0000_0000_0000;
const TAG_NIL: u64 = 1;
const TAG_FALSE: u64 = 2;
const TAG_TRUE: u64 = 3;
const GEN_BITS: u32 = 18;
const GEN_MASK: u64 = (1u64 << GEN_BITS) - 1;

#[derive(Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Value(u64);

impl Value {
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0 == (QNAN | TAG_NIL)
    }

    #[must_use]
    pub fn is_bool(&self) -> bool {
        self.0 == (QNAN | TAG_FALSE) || self.0 == (QNAN | TAG_TRUE)
    }

    #[must_use]
    pub fn is_number(&self) -> bool {
        (self.0 & QNAN) != QNAN
    }

    #[must_use]
    pub fn is_obj(&self) -> bool {
        (self.0 & (QNAN | SIGN_BIT)) == (QNAN | SIGN_BIT)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        if self.0 == (QNAN | TAG_TRUE) {
            Some(true)
        } else if self.0 == (QNAN | TAG_FALSE) {
            Some(false)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        self.is_number().then(|| f64::from_bits(self.0))
    }

    #[must_use]
    pub fn as_obj(&self) -> Option<ObjRef> {
        if !self.is_obj() {
            return None;
        }
        let payload = self.0 & !(QNAN | SIGN_BIT);
        let index = (payload & 0xffff_ffff) as u32;
        let generation = ((payload >> 32) & GEN_MASK) as u32;
        Some(ObjRef::new(index, generation))
    }

    #[must_use]
    pub fn is_truthy(&self) -> bool {
        !(self.is_nil() || self.as_bool() == Some(false))
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        if self.is_nil() {
            "nil"
        } else if self.is_bool() {
            "bool"
        } else if self.is_number() {
            "number"
        } else {
            "object"
        }
    }
}

impl core::fmt::Debug for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_nil() {
            write!(f, "Nil")
        } else if let Some(b) = self.as_bool() {
            write!(f, "Bool({b})")
        } else if let Some(n) = self.as_number() {
            write!(f, "Number({n})")
        } else if let Some(r) = self.as_obj() {
            write!(f, "Obj({r:?})")
        } else {
            write!(f, "Value(<invalid>)")
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if self.is_number() && other.is_number() {
            // IEEE equality, not bit equality: NaN != NaN must still hold.
            return self.as_number() == other.as_number();
        }
        self.0 == other.0
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value(QNAN | if b { TAG_TRUE } else { TAG_FALSE })
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value(n.to_bits())
    }
}

impl From<ObjRef> for Value {
    fn from(r: ObjRef) -> Self {
        let generation = u64::from(r.generation) & GEN_MASK;
        let payload = u64::from(r.index) | (generation << 32);
        Value(QNAN | SIGN_BIT | payload)
    }
}

impl Value {
    #[must_use]
    pub const fn nil() -> Self {
        Value(QNAN | TAG_NIL)
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::nil()
    }
}
