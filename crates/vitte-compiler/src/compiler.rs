//! Single-pass Pratt-parser compiler: tokens go straight to bytecode, with
//! no intermediate AST.
//!
//! Grounded on `examples/cartman-fr-vitte/crates/vitte-compiler/src/lib.rs`'s
//! `Parser`/`Codegen` for the overall shape (tokens consumed by a recursive
//! descent over expressions, emitting directly into a `Chunk`), vastly
//! expanded: the teacher's compiler has no locals, scopes, upvalues,
//! closures, or classes (`parse_add`/`parse_mul` are its entire expression
//! grammar). Locals/upvalues/classes here follow the structure of clox's
//! `compiler.c`, adapted to own the enclosing function chain as a flat
//! `Vec<Frame>` stack rather than a linked list of `Compiler*`, since nothing
//! here needs `unsafe_code`-requiring self-referential pointers to express
//! that chain.

use thiserror::Error;

use vitte_core::chunk::{Chunk, OpCode, MAX_JUMP};
use vitte_core::heap::GcRoots;
use vitte_core::object::ObjFunction;
use vitte_core::{Heap, HeapObject, ObjRef, Value};

use crate::scanner::{Scanner, Token, TokenKind};

/// One accumulated diagnostic. Compilation keeps going after an error
/// (panic-mode resync) so a single pass can report more than one mistake.
#[derive(Debug, Clone, Error)]
#[error("[line {line}] Error{}: {message}", at_suffix(.at))]
pub struct CompileError {
    pub line: u32,
    pub at: String,
    pub message: String,
}

fn at_suffix(at: &str) -> String {
    if at.is_empty() {
        String::new()
    } else {
        format!(" at '{at}'")
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call | Self::Primary => Self::Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

fn rule<'src, 'h>(kind: TokenKind) -> ParseRule<'src, 'h> {
    use Precedence as P;
    use TokenKind as K;
    let (prefix, infix, precedence): (
        Option<ParseFn<'src, 'h>>,
        Option<ParseFn<'src, 'h>>,
        P,
    ) = match kind
    {
        K::LeftParen => (Some(Compiler::grouping), Some(Compiler::call), P::Call),
        K::Dot => (None, Some(Compiler::dot), P::Call),
        K::Minus => (Some(Compiler::unary), Some(Compiler::binary), P::Term),
        K::Plus => (None, Some(Compiler::binary), P::Term),
        K::Slash => (None, Some(Compiler::binary), P::Factor),
        K::Star => (None, Some(Compiler::binary), P::Factor),
        K::Bang => (Some(Compiler::unary), None, P::None),
        K::BangEqual => (None, Some(Compiler::binary), P::Equality),
        K::EqualEqual => (None, Some(Compiler::binary), P::Equality),
        K::Greater => (None, Some(Compiler::binary), P::Comparison),
        K::GreaterEqual => (None, Some(Compiler::binary), P::Comparison),
        K::Less => (None, Some(Compiler::binary), P::Comparison),
        K::LessEqual => (None, Some(Compiler::binary), P::Comparison),
        K::Identifier => (Some(Compiler::variable), None, P::None),
        K::String => (Some(Compiler::string), None, P::None),
        K::Number => (Some(Compiler::number), None, P::None),
        K::And => (None, Some(Compiler::and_), P::And),
        K::Or => (None, Some(Compiler::or_), P::Or),
        K::False | K::True | K::Nil => (Some(Compiler::literal), None, P::None),
        K::Super => (Some(Compiler::super_), None, P::None),
        K::This => (Some(Compiler::this_), None, P::None),
        _ => (None, None, P::None),
    };
    ParseRule { prefix, infix, precedence }
}

struct Local<'src> {
    name: Token<'src>,
    /// -1 while the initializer is still being compiled (spec: "reading a
    /// local in its own initializer is an error").
    depth: i32,
    is_captured: bool,
}

struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct Frame<'src> {
    function: ObjFunction,
    fn_type: FunctionType,
    locals: Vec<Local<'src>>,
    scope_depth: i32,
    upvalues: Vec<UpvalueDesc>,
}

impl<'src> Frame<'src> {
    fn new(fn_type: FunctionType, name: Option<ObjRef>) -> Self {
        let reserved = if fn_type == FunctionType::Method || fn_type == FunctionType::Initializer {
            "this"
        } else {
            ""
        };
        let locals =
            vec![Local { name: Token { kind: TokenKind::Identifier, lexeme: reserved, line: 0 }, depth: 0, is_captured: false }];
        Self { function: ObjFunction::new(name), fn_type, locals, scope_depth: 0, upvalues: Vec::new() }
    }
}

struct ClassState {
    has_superclass: bool,
}

/// Contributes the constant pools (and function names) of every
/// in-progress `Frame` as GC roots, so a collection triggered by interning a
/// string mid-compile can't reclaim data an enclosing, not-yet-finished
/// function still needs.
struct FrameRoots<'a, 'src>(&'a [Frame<'src>]);

impl<'a, 'src> GcRoots for FrameRoots<'a, 'src> {
    fn mark_roots(&self, heap: &mut Heap) {
        for frame in self.0 {
            if let Some(name) = frame.function.name {
                heap.mark_object(name);
            }
            for v in &frame.function.chunk.constants {
                heap.mark_value(*v);
            }
        }
    }
}

pub struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    heap: &'h mut Heap,
    frames: Vec<Frame<'src>>,
    classes: Vec<ClassState>,
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Self {
        let mut scanner = Scanner::new(source);
        let first = scanner.scan_token();
        Self {
            scanner,
            previous: first,
            current: first,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            heap,
            frames: vec![Frame::new(FunctionType::Script, None)],
            classes: Vec::new(),
        }
    }

    fn frame(&self) -> &Frame<'src> {
        self.frames.last().expect("compiler always has an active frame")
    }

    fn frame_mut(&mut self) -> &mut Frame<'src> {
        self.frames.last_mut().expect("compiler always has an active frame")
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.frame_mut().function.chunk
    }

    // ---- token stream ----

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.current.lexeme.to_string();
            self.error_at_current(&msg);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, msg: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(msg);
        }
    }

    fn error_at_current(&mut self, msg: &str) {
        let tok = self.current;
        self.error_at(tok, msg);
    }

    fn error(&mut self, msg: &str) {
        let tok = self.previous;
        self.error_at(tok, msg);
    }

    fn error_at(&mut self, tok: Token<'src>, msg: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let at = if tok.kind == TokenKind::Eof { String::new() } else { tok.lexeme.to_string() };
        self.errors.push(CompileError { line: tok.line, at, message: msg.to_string() });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ---- heap helpers (threaded through FrameRoots, see above) ----

    fn intern(&mut self, s: &str) -> ObjRef {
        let roots = FrameRoots(&self.frames);
        self.heap.intern(s, &roots)
    }

    /// Allocates a just-finished function. Its own frame has already been
    /// popped by `end_function`, so `FrameRoots(&self.frames)` alone would
    /// miss the constants/name living inside `f` itself — a collection
    /// triggered by this very allocation (stress-GC, or crossing the
    /// threshold) could otherwise reclaim a string or nested function this
    /// function's own chunk still references. Clone those refs out as
    /// extra roots rather than borrowing `f` (which the `alloc` call below
    /// needs to move).
    fn alloc_function(&mut self, f: ObjFunction) -> ObjRef {
        struct ExtraFunctionRoots<'a, 'src> {
            frames: &'a [Frame<'src>],
            name: Option<ObjRef>,
            constants: Vec<Value>,
        }

        impl<'a, 'src> GcRoots for ExtraFunctionRoots<'a, 'src> {
            fn mark_roots(&self, heap: &mut Heap) {
                FrameRoots(self.frames).mark_roots(heap);
                if let Some(n) = self.name {
                    heap.mark_object(n);
                }
                for v in &self.constants {
                    heap.mark_value(*v);
                }
            }
        }

        let roots = ExtraFunctionRoots {
            frames: &self.frames,
            name: f.name,
            constants: f.chunk.constants.clone(),
        };
        self.heap.alloc(HeapObject::Function(f), &roots)
    }

    // ---- bytecode emission ----

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.to_byte());
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_mut().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk_mut().len() - offset - 2;
        if jump > MAX_JUMP {
            self.error("too much code to jump over");
        }
        let chunk = self.chunk_mut();
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk_mut().len() - loop_start + 2;
        if offset > MAX_JUMP {
            self.error("loop body too large");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn emit_return(&mut self) {
        if self.frame().fn_type == FunctionType::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.chunk_mut().add_constant(value) {
            Ok(index) => index,
            Err(_) => {
                self.error("too many constants in one chunk");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let c = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, c);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let r = self.intern(name);
        self.make_constant(Value::from(r))
    }

    // ---- scopes / locals / upvalues ----

    fn begin_scope(&mut self) {
        self.frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.frame_mut().scope_depth -= 1;
        let depth = self.frame().scope_depth;
        while let Some(local) = self.frame().locals.last() {
            if local.depth <= depth {
                break;
            }
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.frame_mut().locals.pop();
        }
    }

    fn add_local(&mut self, name: Token<'src>) {
        if self.frame().locals.len() >= 256 {
            self.error("too many local variables in function");
            return;
        }
        self.frame_mut().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let name = self.previous;
        let depth = self.frame().scope_depth;
        for local in self.frame().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name.lexeme == name.lexeme {
                self.error("already a variable with this name in this scope");
            }
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let depth = self.frame().scope_depth;
        if let Some(local) = self.frame_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn parse_variable(&mut self, msg: &str) -> u8 {
        self.consume(TokenKind::Identifier, msg);
        self.declare_variable();
        if self.frame().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.to_string();
        self.identifier_constant(&name)
    }

    fn define_variable(&mut self, global: u8) {
        if self.frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    fn resolve_local_at(&self, level: usize, name: &str) -> Option<u8> {
        self.frames[level].locals.iter().enumerate().rev().find_map(|(i, local)| {
            (local.name.lexeme == name).then_some(i as u8)
        })
    }

    fn resolve_local(&mut self, level: usize, name: &str) -> Option<u8> {
        let idx = self.resolve_local_at(level, name)?;
        if self.frames[level].locals[idx as usize].depth == -1 {
            self.error("can't read local variable in its own initializer");
        }
        Some(idx)
    }

    fn add_upvalue(&mut self, level: usize, index: u8, is_local: bool) -> u8 {
        let existing = self.frames[level]
            .upvalues
            .iter()
            .position(|u| u.index == index && u.is_local == is_local);
        if let Some(i) = existing {
            return i as u8;
        }
        if self.frames[level].upvalues.len() >= 256 {
            self.error("too many closure variables in function");
            return 0;
        }
        self.frames[level].upvalues.push(UpvalueDesc { index, is_local });
        self.frames[level].function.upvalue_count = self.frames[level].upvalues.len() as u8;
        (self.frames[level].upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return None;
        }
        let enclosing = level - 1;
        if let Some(local_idx) = self.resolve_local_at(enclosing, name) {
            if self.frames[enclosing].locals[local_idx as usize].depth == -1 {
                self.error("can't read local variable in its own initializer");
            }
            self.frames[enclosing].locals[local_idx as usize].is_captured = true;
            return Some(self.add_upvalue(level, local_idx, true));
        }
        if let Some(up_idx) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(level, up_idx, false));
        }
        None
    }

    // ---- expressions ----

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.previous.kind).prefix else {
            self.error("expect expression");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            let infix = rule(self.previous.kind).infix.expect("precedence table is consistent");
            infix(self, can_assign);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "expect ')' after expression");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(f64::NAN);
        self.emit_constant(Value::from(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let raw = self.previous.lexeme;
        let content = &raw[1..raw.len() - 1];
        let r = self.intern(content);
        self.emit_constant(Value::from(r));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!("parse rule only dispatches literal tokens here"),
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("parse rule only dispatches unary tokens here"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let kind = self.previous.kind;
        let next_precedence = rule(kind).precedence.next();
        self.parse_precedence(next_precedence);
        match kind {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("parse rule only dispatches binary tokens here"),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let level = self.frames.len() - 1;
        let (get_op, set_op, arg) = if let Some(idx) = self.resolve_local(level, name.lexeme) {
            (OpCode::GetLocal, OpCode::SetLocal, idx)
        } else if let Some(idx) = self.resolve_upvalue(level, name.lexeme) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, idx)
        } else {
            let idx = self.identifier_constant(name.lexeme);
            (OpCode::GetGlobal, OpCode::SetGlobal, idx)
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("can't use 'this' outside of a class");
            return;
        }
        let tok = Token { kind: TokenKind::This, lexeme: "this", line: self.previous.line };
        self.named_variable(tok, false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("can't use 'super' outside of a class");
        } else if !self.classes.last().is_some_and(|c| c.has_superclass) {
            self.error("can't use 'super' in a class with no superclass");
        }
        self.consume(TokenKind::Dot, "expect '.' after 'super'");
        self.consume(TokenKind::Identifier, "expect superclass method name");
        let name = self.identifier_constant(self.previous.lexeme);

        let this_tok = Token { kind: TokenKind::This, lexeme: "this", line: self.previous.line };
        let super_tok = Token { kind: TokenKind::Super, lexeme: "super", line: self.previous.line };
        self.named_variable(this_tok, false);
        if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable(super_tok, false);
            self.emit_op_byte(OpCode::SuperInvoke, name);
            self.emit_byte(argc);
        } else {
            self.named_variable(super_tok, false);
            self.emit_op_byte(OpCode::GetSuper, name);
        }
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "expect property name after '.'");
        let name = self.identifier_constant(self.previous.lexeme);
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, name);
        } else if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_op_byte(OpCode::Invoke, name);
            self.emit_byte(argc);
        } else {
            self.emit_op_byte(OpCode::GetProperty, name);
        }
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op_byte(OpCode::Call, argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("can't have more than 255 arguments");
                }
                argc += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expect ')' after arguments");
        argc as u8
    }

    // ---- statements ----

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "expect '}' after block");
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("expect variable name");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "expect ';' after variable declaration");
        self.define_variable(global);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expect ';' after expression");
        self.emit_op(OpCode::Pop);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expect ';' after value");
        self.emit_op(OpCode::Print);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "expect '(' after 'if'");
        self.expression();
        self.consume(TokenKind::RightParen, "expect ')' after condition");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_mut().len();
        self.consume(TokenKind::LeftParen, "expect '(' after 'while'");
        self.expression();
        self.consume(TokenKind::RightParen, "expect ')' after condition");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "expect '(' after 'for'");
        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_mut().len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "expect ';' after loop condition");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_mut().len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "expect ')' after for clauses");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.frame().fn_type == FunctionType::Script {
            self.error("can't return from top-level code");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.frame().fn_type == FunctionType::Initializer {
                self.error("can't return a value from an initializer");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "expect ';' after return value");
            self.emit_op(OpCode::Return);
        }
    }

    // ---- functions / classes ----

    fn end_function(&mut self) -> (ObjFunction, Vec<UpvalueDesc>) {
        self.emit_return();
        let frame = self.frames.pop().expect("end_function always matches a pushed frame");
        (frame.function, frame.upvalues)
    }

    fn function(&mut self, fn_type: FunctionType) {
        let name = self.intern(self.previous.lexeme);
        self.frames.push(Frame::new(fn_type, Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expect '(' after function name");
        if !self.check(TokenKind::RightParen) {
            let mut arity: u16 = 0;
            loop {
                arity += 1;
                if arity > 255 {
                    self.error_at_current("can't have more than 255 parameters");
                } else {
                    self.frame_mut().function.arity = arity as u8;
                }
                let constant = self.parse_variable("expect parameter name");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expect ')' after parameters");
        self.consume(TokenKind::LeftBrace, "expect '{' before function body");
        self.block();

        let (function, upvalues) = self.end_function();
        let func_ref = self.alloc_function(function);
        let const_idx = self.make_constant(Value::from(func_ref));
        self.emit_op_byte(OpCode::Closure, const_idx);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("expect function name");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "expect method name");
        let name_lexeme = self.previous.lexeme;
        let constant = self.identifier_constant(name_lexeme);
        let fn_type = if name_lexeme == "init" { FunctionType::Initializer } else { FunctionType::Method };
        self.function(fn_type);
        self.emit_op_byte(OpCode::Method, constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expect class name");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();

        self.emit_op_byte(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState { has_superclass: false });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "expect superclass name");
            self.variable(false);
            if self.previous.lexeme == class_name.lexeme {
                self.error("a class can't inherit from itself");
            }

            self.begin_scope();
            let super_tok = Token { kind: TokenKind::Super, lexeme: "super", line: class_name.line };
            self.add_local(super_tok);
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().expect("just pushed").has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "expect '{' before class body");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "expect '}' after class body");
        self.emit_op(OpCode::Pop);

        let had_superclass = self.classes.last().expect("pushed above").has_superclass;
        if had_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }
}

/// Compiles `source` into a top-level script function living in `heap`.
/// Returns every accumulated diagnostic on failure (panic-mode recovery
/// keeps going after the first error, per spec §4.3).
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<CompileError>> {
    let mut compiler = Compiler::new(source, heap);
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }
    let (function, _upvalues) = compiler.end_function();

    if compiler.had_error {
        return Err(compiler.errors);
    }
    let roots = FrameRoots(&compiler.frames);
    Ok(compiler.heap.alloc(HeapObject::Function(function), &roots))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(src: &str) -> (ObjRef, Heap) {
        let mut heap = Heap::new();
        let r = compile(src, &mut heap).expect("should compile");
        (r, heap)
    }

    fn compile_err(src: &str) -> Vec<CompileError> {
        let mut heap = Heap::new();
        compile(src, &mut heap).expect_err("should fail to compile")
    }

    #[test]
    fn compiles_trivial_expression_statement() {
        let (r, heap) = compile_ok("1 + 2;");
        match heap.get(r) {
            HeapObject::Function(f) => assert!(!f.chunk.code.is_empty()),
            _ => panic!("expected a function"),
        }
    }

    #[test]
    fn compiles_var_and_print() {
        let (r, heap) = compile_ok("var x = 1; print x;");
        let HeapObject::Function(f) = heap.get(r) else { panic!("expected function") };
        assert!(f.chunk.code.contains(&OpCode::Print.to_byte()));
    }

    #[test]
    fn reports_unterminated_block() {
        let errs = compile_err("fun f() { print 1;");
        assert!(!errs.is_empty());
    }

    #[test]
    fn reports_return_at_top_level() {
        let errs = compile_err("return 1;");
        assert!(errs.iter().any(|e| e.message.contains("top-level")));
    }

    #[test]
    fn reports_self_inheriting_class() {
        let errs = compile_err("class Oops < Oops {}");
        assert!(errs.iter().any(|e| e.message.contains("inherit from itself")));
    }

    #[test]
    fn compiles_closures_with_upvalues() {
        let (r, heap) = compile_ok(
            "fun outer() { var x = 1; fun inner() { return x; } return inner; } outer();",
        );
        let HeapObject::Function(f) = heap.get(r) else { panic!("expected function") };
        assert!(f.chunk.code.contains(&OpCode::Closure.to_byte()));
    }

    #[test]
    fn compiles_classes_with_methods_and_inheritance() {
        let (r, heap) = compile_ok(
            "class A { greet() { print \"hi\"; } } class B < A { } var b = B(); b.greet();",
        );
        let HeapObject::Function(f) = heap.get(r) else { panic!("expected function") };
        assert!(f.chunk.code.contains(&OpCode::Inherit.to_byte()));
        assert!(f.chunk.code.contains(&OpCode::Method.to_byte()));
    }
}
