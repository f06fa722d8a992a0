//! Bytecode chunk: a linear byte buffer, a parallel line-number table, and a
//! constant pool. Append-only during compilation, read-only during
//! execution.
//!
//! Grounded on `examples/cartman-fr-vitte/crates/vitte-core/src/bytecode/chunk.rs`
//! for overall shape (`Chunk` owning code + constants + a line side table,
//! `disassemble()` producing human-readable text) and on
//! `examples/original_source/src/common/opcode.h` for the exact opcode set,
//! which this module's [`OpCode`] mirrors one-for-one — unlike the teacher's
//! `Op`, which carries operands inline as enum payload (register-VM style),
//! `OpCode` here is a bare one-byte tag per spec §4.4: operands follow as
//! plain bytes in `code`, decoded by the reader (`vitte-vm`'s dispatch loop
//! and this module's `disassemble`).

use crate::value::Value;

/// One-byte instruction tags. Order here has no compatibility meaning (no
/// on-disk format is persisted, per spec §6); it is kept in the same order as
/// `original_source`'s `OpCode` enum purely for ease of cross-reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum OpCode {
    Constant,
    Nil,
    True,
    False,
    Pop,
    GetLocal,
    SetLocal,
    GetGlobal,
    DefineGlobal,
    SetGlobal,
    GetUpvalue,
    SetUpvalue,
    GetProperty,
    SetProperty,
    GetSuper,
    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    Not,
    Negate,
    Print,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    Invoke,
    SuperInvoke,
    Closure,
    CloseUpvalue,
    Return,
    Class,
    Inherit,
    Method,
}

impl OpCode {
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        use OpCode::*;
        match self {
            Constant => "OP_CONSTANT",
            Nil => "OP_NIL",
            True => "OP_TRUE",
            False => "OP_FALSE",
            Pop => "OP_POP",
            GetLocal => "OP_GET_LOCAL",
            SetLocal => "OP_SET_LOCAL",
            GetGlobal => "OP_GET_GLOBAL",
            DefineGlobal => "OP_DEFINE_GLOBAL",
            SetGlobal => "OP_SET_GLOBAL",
            GetUpvalue => "OP_GET_UPVALUE",
            SetUpvalue => "OP_SET_UPVALUE",
            GetProperty => "OP_GET_PROPERTY",
            SetProperty => "OP_SET_PROPERTY",
            GetSuper => "OP_GET_SUPER",
            Equal => "OP_EQUAL",
            Greater => "OP_GREATER",
            Less => "OP_LESS",
            Add => "OP_ADD",
            Subtract => "OP_SUBTRACT",
            Multiply => "OP_MULTIPLY",
            Divide => "OP_DIVIDE",
            Not => "OP_NOT",
            Negate => "OP_NEGATE",
            Print => "OP_PRINT",
            Jump => "OP_JUMP",
            JumpIfFalse => "OP_JUMP_IF_FALSE",
            Loop => "OP_LOOP",
            Call => "OP_CALL",
            Invoke => "OP_INVOKE",
            SuperInvoke => "OP_SUPER_INVOKE",
            Closure => "OP_CLOSURE",
            CloseUpvalue => "OP_CLOSE_UPVALUE",
            Return => "OP_RETURN",
            Class => "OP_CLASS",
            Inherit => "OP_INHERIT",
            Method => "OP_METHOD",
        }
    }

    #[must_use]
    pub fn to_byte(self) -> u8 {
        use OpCode::*;
        match self {
            Constant => 0,
            Nil => 1,
            True => 2,
            False => 3,
            Pop => 4,
            GetLocal => 5,
            SetLocal => 6,
            GetGlobal => 7,
            DefineGlobal => 8,
            SetGlobal => 9,
            GetUpvalue => 10,
            SetUpvalue => 11,
            GetProperty => 12,
            SetProperty => 13,
            GetSuper => 14,
            Equal => 15,
            Greater => 16,
            Less => 17,
            Add => 18,
            Subtract => 19,
            Multiply => 20,
            Divide => 21,
            Not => 22,
            Negate => 23,
            Print => 24,
            Jump => 25,
            JumpIfFalse => 26,
            Loop => 27,
            Call => 28,
            Invoke => 29,
            SuperInvoke => 30,
            Closure => 31,
            CloseUpvalue => 32,
            Return => 33,
            Class => 34,
            Inherit => 35,
            Method => 36,
        }
    }

    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        use OpCode::*;
        Some(match byte {
            0 => Constant,
            1 => Nil,
            2 => True,
            3 => False,
            4 => Pop,
            5 => GetLocal,
            6 => SetLocal,
            7 => GetGlobal,
            8 => DefineGlobal,
            9 => SetGlobal,
            10 => GetUpvalue,
            11 => SetUpvalue,
            12 => GetProperty,
            13 => SetProperty,
            14 => GetSuper,
            15 => Equal,
            16 => Greater,
            17 => Less,
            18 => Add,
            19 => Subtract,
            20 => Multiply,
            21 => Divide,
            22 => Not,
            23 => Negate,
            24 => Print,
            25 => Jump,
            26 => JumpIfFalse,
            27 => Loop,
            28 => Call,
            29 => Invoke,
            30 => SuperInvoke,
            31 => Closure,
            32 => CloseUpvalue,
            33 => Return,
            34 => Class,
            35 => Inherit,
            36 => Method,
            _ => return None,
        })
    }
}

/// Maximum index representable by a one-byte constant/local/upvalue operand.
/// Programs that would exceed this are rejected at compile time (spec §9
/// "open questions": reject at the boundary rather than adding `_LONG`
/// variants).
pub const MAX_ONE_BYTE_INDEX: usize = u8::MAX as usize + 1;
/// Maximum forward/backward distance a two-byte jump/loop offset can encode.
pub const MAX_JUMP: usize = u16::MAX as usize;

/// A compiled unit of bytecode: instructions, a constant pool, and a line
/// table parallel to `code` (one entry per byte, per spec §3).
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Chunk {
    pub code: Vec<u8>,
    pub lines: Vec<u32>,
    pub constants: Vec<Value>,
}

impl Chunk {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Appends a raw byte with its source line.
    pub fn write_byte(&mut self, byte: u8, line: u32) -> usize {
        self.code.push(byte);
        self.lines.push(line);
        self.code.len() - 1
    }

    /// Appends an opcode with its source line.
    pub fn write_op(&mut self, op: OpCode, line: u32) -> usize {
        self.write_byte(op.to_byte(), line)
    }

    /// Appends `value` to the constant pool, returning its index.
    ///
    /// Callers passing a heap-allocated `Value` MUST have already rooted it
    /// (pushed on the VM stack or freshly interned) before calling this, per
    /// spec §4.1 — the growth of `constants` itself cannot trigger a
    /// collection in this implementation (only `Heap::alloc_*` can), but a
    /// future caller that forgets to root a value before any intervening
    /// allocation would silently collect it.
    pub fn add_constant(&mut self, value: Value) -> crate::error::Result<u8> {
        if self.constants.len() >= MAX_ONE_BYTE_INDEX {
            return Err(crate::error::Error::ChunkLimit("too many constants in one chunk"));
        }
        self.constants.push(value);
        Ok((self.constants.len() - 1) as u8)
    }

    #[must_use]
    pub fn constant(&self, index: u8) -> Value {
        self.constants[index as usize]
    }

    #[must_use]
    pub fn line_at(&self, offset: usize) -> u32 {
        self.lines.get(offset).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn approx_size(&self) -> usize {
        self.code.len()
            + self.lines.len() * core::mem::size_of::<u32>()
            + self.constants.len() * core::mem::size_of::<Value>()
    }

    /// Human-readable disassembly. Operand formatting for the "points at an
    /// object" cases (`Constant`, `Closure`, `Class`, `Method`, property
    /// opcodes) prints only the raw index — resolving it to a printable name
    /// needs heap access and is done one layer up (`vitte-vm`/`vitte-cli`).
    #[must_use]
    pub fn disassemble(&self, name: &str) -> String {
        let mut out = format!("== {name} ==\n");
        let mut offset = 0;
        while offset < self.code.len() {
            offset = self.disassemble_instruction(&mut out, offset);
        }
        out
    }

    fn disassemble_instruction(&self, out: &mut String, offset: usize) -> usize {
        use core::fmt::Write as _;
        let _ = write!(out, "{offset:04} ");
        if offset > 0 && self.lines[offset] == self.lines[offset - 1] {
            out.push_str("   | ");
        } else {
            let _ = write!(out, "{:4} ", self.lines[offset]);
        }

        let Some(op) = OpCode::from_byte(self.code[offset]) else {
            let _ = writeln!(out, "unknown opcode {}", self.code[offset]);
            return offset + 1;
        };

        match op {
            OpCode::Constant
            | OpCode::GetGlobal
            | OpCode::DefineGlobal
            | OpCode::SetGlobal
            | OpCode::GetProperty
            | OpCode::SetProperty
            | OpCode::GetSuper
            | OpCode::Class
            | OpCode::Method => {
                let k = self.code[offset + 1];
                let _ = writeln!(out, "{:<18} {k:4}", op.mnemonic());
                offset + 2
            }
            OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue | OpCode::SetUpvalue => {
                let slot = self.code[offset + 1];
                let _ = writeln!(out, "{:<18} {slot:4}", op.mnemonic());
                offset + 2
            }
            OpCode::Call => {
                let argc = self.code[offset + 1];
                let _ = writeln!(out, "{:<18} {argc:4}", op.mnemonic());
                offset + 2
            }
            OpCode::Invoke | OpCode::SuperInvoke => {
                let k = self.code[offset + 1];
                let argc = self.code[offset + 2];
                let _ = writeln!(out, "{:<18} ({argc} args) {k:4}", op.mnemonic());
                offset + 3
            }
            OpCode::Jump | OpCode::JumpIfFalse => {
                let hi = self.code[offset + 1] as u16;
                let lo = self.code[offset + 2] as u16;
                let jump = (hi << 8) | lo;
                let _ = writeln!(out, "{:<18} {offset:4} -> {}", op.mnemonic(), offset + 3 + jump as usize);
                offset + 3
            }
            OpCode::Loop => {
                let hi = self.code[offset + 1] as u16;
                let lo = self.code[offset + 2] as u16;
                let jump = (hi << 8) | lo;
                let _ = writeln!(out, "{:<18} {offset:4} -> {}", op.mnemonic(), (offset + 3).saturating_sub(jump as usize));
                offset + 3
            }
            OpCode::Closure => {
                // Upvalue records (2 bytes each) follow the constant index,
                // but how many is only knowable from the function's
                // upvalue_count, which lives on the heap object; the caller
                // (vitte-vm, which has heap access) prints those when tracing
                // live rather than this heap-free disassembler.
                let k = self.code[offset + 1];
                let _ = writeln!(out, "{:<18} {k:4}", op.mnemonic());
                offset + 2
            }
            _ => {
                let _ = writeln!(out, "{}", op.mnemonic());
                offset + 1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_back() {
        let mut c = Chunk::new();
        let k = c.add_constant(Value::from(1.5)).unwrap();
        c.write_op(OpCode::Constant, 1);
        c.write_byte(k, 1);
        c.write_op(OpCode::Return, 1);
        assert_eq!(c.len(), 3);
        assert_eq!(OpCode::from_byte(c.code[0]), Some(OpCode::Constant));
        assert_eq!(c.constant(k), Value::from(1.5));
    }

    #[test]
    fn rejects_too_many_constants() {
        let mut c = Chunk::new();
        for i in 0..256 {
            assert!(c.add_constant(Value::from(f64::from(i))).is_ok());
        }
        assert!(c.add_constant(Value::from(1.0)).is_err());
    }

    #[test]
    fn disassemble_is_human_readable() {
        let mut c = Chunk::new();
        let k = c.add_constant(Value::from(7.0)).unwrap();
        c.write_op(OpCode::Constant, 3);
        c.write_byte(k, 3);
        c.write_op(OpCode::Print, 3);
        c.write_op(OpCode::Return, 4);
        let text = c.disassemble("test");
        assert!(text.contains("== test =="));
        assert!(text.contains("OP_CONSTANT"));
        assert!(text.contains("OP_RETURN"));
    }
}
