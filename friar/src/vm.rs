// Copyright 2026 the Friar Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The bytecode interpreter.
//!
//! A switch-dispatched stack machine over [`Module::bytecode`]. It requires a [`ModuleInfo`]
//! from the verifier: the dispatch loop performs only the checks static verification cannot
//! discharge (value types, aggregate bounds, division by zero, closure arity, the absolute
//! stack limit).
//!
//! All values live on the *virtual stack*, a contiguous word buffer whose live bounds are
//! published to the collector (see [`crate::heap`]) and republished on every growth or shrink.
//! The layout within a frame, bottom to top:
//!
//! ```text
//! [ globals | .. | closure (CBEGIN only) | arg0 .. argN-1 | local0 .. localL-1 | operands ]
//!                                                          ^ base
//! ```
//!
//! One execution may be active per process at a time; a second activation is rejected by a
//! process-wide guard.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Write as _;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::heap::{self, Heap, ObjTag};
use crate::module::Module;
use crate::opcode::Opcode;
use crate::trace::{TraceEvent, TraceMask, TraceSink};
use crate::value::Value;
use crate::verifier::{MAX_MEMBER_COUNT, ModuleInfo};

/// The absolute maximum live size of the virtual stack, in words.
pub const MAX_STACK_SIZE: usize = 0x7fff_ffff;

const SENTINEL_PC: u32 = u32::MAX;

/// A console I/O failure reported by a [`Console`] implementation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConsoleError {
    /// The input stream ended.
    Eof,
    /// The input was not an integer.
    Malformed,
    /// The underlying stream failed.
    Io,
}

impl fmt::Display for ConsoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof => write!(f, "the input stream ended"),
            Self::Malformed => write!(f, "the input is not an integer"),
            Self::Io => write!(f, "the stream failed"),
        }
    }
}

impl core::error::Error for ConsoleError {}

/// The interpreter's console: the home of `CALL Lread` and `CALL Lwrite`.
///
/// Reads and writes are synchronous and blocking; there is no cancellation.
pub trait Console {
    /// Prompts for and reads one integer from the input stream.
    fn read_int(&mut self) -> Result<isize, ConsoleError>;

    /// Writes one integer followed by a newline to the output stream.
    fn write_int(&mut self, value: isize) -> Result<(), ConsoleError>;
}

/// One entry of a runtime-error backtrace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserFrame {
    /// The module name.
    pub file: String,
    /// The procedure's public name, when the symbol table has one.
    pub proc_name: Option<String>,
    /// The procedure's `BEGIN`/`CBEGIN` address.
    pub proc_addr: u32,
    /// The most recent `LINE` number seen in the frame.
    pub line: u32,
    /// The program counter within the frame.
    pub pc: u32,
}

/// A backtrace, newest frame first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Backtrace {
    /// The frames, newest first.
    pub entries: Vec<UserFrame>,
}

/// A runtime error carrying the backtrace at the point of failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunError {
    /// The frame stack at the point of failure, newest first.
    pub backtrace: Backtrace,
    /// The specific reason for the error.
    pub kind: RunErrorKind,
}

/// The reason for a [`RunError`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunErrorKind {
    /// A second interpreter activation was rejected.
    Reentered,
    /// The program counter left the bytecode section (verifier bypassed).
    IllegalPc {
        /// The offending program counter.
        pc: u32,
    },
    /// An opcode the interpreter does not execute.
    IllegalOp {
        /// The instruction address.
        addr: u32,
        /// The raw opcode byte.
        byte: u8,
    },
    /// An unknown variable kind inside a `CLOSURE` (verifier bypassed).
    IllegalVarKind {
        /// The raw kind byte.
        byte: u8,
    },
    /// The operand stack underflowed (verifier bypassed).
    StackUnderflow,
    /// The live stack exceeded [`MAX_STACK_SIZE`].
    StackOverflow,
    /// A captured variable was accessed in a frame without a closure (verifier bypassed).
    NoClosureInFrame,
    /// A binary operator was applied to non-integer operands.
    BinopType {
        /// The operator's source syntax.
        op: &'static str,
        /// The left operand's type.
        lhs: &'static str,
        /// The right operand's type.
        rhs: &'static str,
    },
    /// Integer division or remainder by zero.
    DivisionByZero,
    /// An indexing operation on a non-aggregate.
    NotIndexable {
        /// The scrutinee's type.
        got: &'static str,
    },
    /// An index operand that is not an integer.
    IndexType {
        /// The index's type.
        got: &'static str,
    },
    /// An index outside the aggregate's bounds.
    IndexOutOfRange {
        /// The index.
        index: isize,
        /// The aggregate's length.
        len: usize,
    },
    /// A non-integer stored into a string.
    StringStoreType {
        /// The stored value's type.
        got: &'static str,
    },
    /// An integer outside `[0, 255]` stored into a string.
    StringStoreRange {
        /// The stored value.
        value: isize,
    },
    /// A branch condition that is not an integer.
    BranchType {
        /// The condition's type.
        got: &'static str,
    },
    /// A `CALLC` scrutinee that is not a closure.
    NotCallable {
        /// The scrutinee's type.
        got: &'static str,
    },
    /// A closure call with the wrong argument count.
    ArityMismatch {
        /// The procedure's parameter count.
        expected: u32,
        /// The call's argument count.
        got: u32,
    },
    /// A closure entry address with no verified procedure (verifier bypassed).
    BadCallTarget {
        /// The entry address.
        target: u32,
    },
    /// A string-table offset with no valid entry (verifier bypassed).
    BadStrtab {
        /// The offset.
        offset: u32,
    },
    /// An aggregate allocation larger than [`MAX_MEMBER_COUNT`].
    TooManyMembers {
        /// The requested member count.
        count: u32,
    },
    /// A `FAIL` instruction fired.
    MatchFailure {
        /// The rendered scrutinee.
        scrutinee: String,
        /// The source line.
        line: u32,
        /// The source column.
        col: u32,
    },
    /// A `CALL Lwrite` of a non-integer.
    WriteType {
        /// The value's type.
        got: &'static str,
    },
    /// A `CALL Llength` of a non-aggregate.
    LengthType {
        /// The value's type.
        got: &'static str,
    },
    /// Console I/O failed.
    Console(ConsoleError),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use RunErrorKind as K;
        match &self.kind {
            K::Reentered => write!(f, "detected multiple concurrent interpreter instances"),
            K::IllegalPc { pc } => {
                write!(f, "the PC ({pc:#x}) is outside the bytecode section")
            }
            K::IllegalOp { addr, byte } => {
                write!(f, "illegal operation at {addr:#x}: {byte:#04x}")
            }
            K::IllegalVarKind { byte } => {
                write!(f, "unknown variable kind encoding: {byte:#04x}")
            }
            K::StackUnderflow => write!(f, "the operand stack underflowed"),
            K::StackOverflow => write!(f, "stack overflow"),
            K::NoClosureInFrame => write!(
                f,
                "trying to access a captured variable when there is no closure associated with the frame"
            ),
            K::BinopType { op, lhs, rhs } => {
                write!(f, "cannot apply binary `{op}` to {lhs} and {rhs}")
            }
            K::DivisionByZero => write!(f, "division by zero"),
            K::NotIndexable { got } => write!(f, "cannot index {got}"),
            K::IndexType { got } => write!(f, "index must be an integer, got {got}"),
            K::IndexOutOfRange { index, len } => write!(
                f,
                "index {index} out of range for an aggregate of length {len}"
            ),
            K::StringStoreType { got } => {
                write!(f, "cannot assign {got} into a string (expected integer)")
            }
            K::StringStoreRange { value } => write!(
                f,
                "cannot assign {value} into a string: does not fit into a byte"
            ),
            K::BranchType { got } => write!(
                f,
                "wrong branch condition type: expected integer, got {got}"
            ),
            K::NotCallable { got } => write!(f, "cannot call {got}"),
            K::ArityMismatch { expected, got } => {
                write!(f, "the function expected {expected} arguments, got {got}")
            }
            K::BadCallTarget { target } => {
                write!(f, "the call target {target:#x} is not a verified procedure")
            }
            K::BadStrtab { offset } => {
                write!(f, "string table offset {offset:#x} is not a valid entry")
            }
            K::TooManyMembers { count } => write!(
                f,
                "too many aggregate members: expected at most {MAX_MEMBER_COUNT}, got {count}"
            ),
            K::MatchFailure {
                scrutinee,
                line,
                col,
            } => write!(f, "match failure for {scrutinee} at L{line}:{col}"),
            K::WriteType { got } => write!(f, "cannot write {got} (expected integer)"),
            K::LengthType { got } => write!(f, "cannot get the length of {got}"),
            K::Console(e) => write!(f, "console failure: {e}"),
        }
    }
}

impl core::error::Error for RunError {}

static RUNNING: AtomicBool = AtomicBool::new(false);

struct RunnerGuard;

impl RunnerGuard {
    fn acquire() -> Option<Self> {
        if RUNNING.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Self)
        }
    }
}

impl Drop for RunnerGuard {
    fn drop(&mut self) {
        RUNNING.store(false, Ordering::SeqCst);
    }
}

#[derive(Copy, Clone, Debug)]
struct Frame {
    proc_addr: u32,
    saved_pc: u32,
    saved_base: usize,
    saved_args: u32,
    line: u32,
    is_closure: bool,
}

/// The interpreter for one verified module.
pub struct Interp<'a, C: Console> {
    module: &'a Module,
    info: &'a ModuleInfo,
    console: &'a mut C,
}

impl<'a, C: Console> Interp<'a, C> {
    /// Creates an interpreter over `module`, which must have passed [`crate::verifier::verify`]
    /// producing `info`.
    pub fn new(module: &'a Module, info: &'a ModuleInfo, console: &'a mut C) -> Self {
        Self {
            module,
            info,
            console,
        }
    }

    /// Executes the module from its main procedure.
    pub fn run(&mut self) -> Result<(), RunError> {
        self.run_traced(None)
    }

    /// Executes the module, reporting the events `trace` requests.
    pub fn run_traced(&mut self, mut trace: Option<&mut dyn TraceSink>) -> Result<(), RunError> {
        let Some(_guard) = RunnerGuard::acquire() else {
            return Err(RunError {
                backtrace: Backtrace::default(),
                kind: RunErrorKind::Reentered,
            });
        };

        // Globals plus two dummy arguments for main.
        let global_count = self.module.global_count as usize;
        let stack = vec![Value::default().to_repr(); global_count + 2];
        let sp = stack.len();
        let mut machine = Machine {
            module: self.module,
            info: self.info,
            console: &mut *self.console,
            stack,
            sp,
            pc: SENTINEL_PC,
            base: sp,
            args: 2,
            frames: Vec::new(),
            heap: Heap::new(),
        };

        machine.publish();
        heap::init();
        let result = machine.run(&mut trace);
        heap::shutdown();
        result
    }
}

struct Machine<'m, 'c> {
    module: &'m Module,
    info: &'m ModuleInfo,
    console: &'c mut dyn Console,
    stack: Vec<usize>,
    sp: usize,
    pc: u32,
    base: usize,
    args: u32,
    frames: Vec<Frame>,
    heap: Heap,
}

impl Machine<'_, '_> {
    fn publish(&self) {
        let top = self.stack.as_ptr() as usize;
        heap::publish_stack_bounds(top, top + self.sp * core::mem::size_of::<usize>());
    }

    fn backtrace(&self) -> Backtrace {
        let mut entries = Vec::with_capacity(self.frames.len());
        let mut pc = self.pc;
        for f in self.frames.iter().rev() {
            entries.push(UserFrame {
                file: self.module.name.clone(),
                proc_name: self
                    .info
                    .proc_name(self.module, f.proc_addr)
                    .map(|name| String::from_utf8_lossy(name).into_owned()),
                proc_addr: f.proc_addr,
                line: f.line,
                pc,
            });
            pc = f.saved_pc;
        }
        Backtrace { entries }
    }

    fn fail(&self, kind: RunErrorKind) -> RunError {
        RunError {
            backtrace: self.backtrace(),
            kind,
        }
    }

    fn fetch_u8(&mut self) -> Result<u8, RunError> {
        let Some(&b) = self.module.bytecode.get(self.pc as usize) else {
            return Err(self.fail(RunErrorKind::IllegalPc { pc: self.pc }));
        };
        self.pc += 1;
        Ok(b)
    }

    fn fetch_u32(&mut self) -> Result<u32, RunError> {
        let i = self.pc as usize;
        let Some(b) = self.module.bytecode.get(i..i + 4) else {
            return Err(self.fail(RunErrorKind::IllegalPc { pc: self.pc }));
        };
        self.pc += 4;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn push(&mut self, v: Value) -> Result<(), RunError> {
        if self.sp == self.stack.len() {
            if self.stack.len() >= MAX_STACK_SIZE {
                return Err(self.fail(RunErrorKind::StackOverflow));
            }
            self.stack.push(v.to_repr());
        } else {
            self.stack[self.sp] = v.to_repr();
        }
        self.sp += 1;
        self.publish();
        Ok(())
    }

    fn pop_n(&mut self, n: usize) -> Result<(), RunError> {
        if n > self.sp {
            return Err(self.fail(RunErrorKind::StackUnderflow));
        }
        self.sp -= n;
        self.publish();
        Ok(())
    }

    fn top(&self, n: usize) -> Result<Value, RunError> {
        if n >= self.sp {
            return Err(self.fail(RunErrorKind::StackUnderflow));
        }
        Ok(Value::from_repr(self.stack[self.sp - 1 - n]))
    }

    fn global(&self, m: u32) -> usize {
        m as usize
    }

    fn local(&self, m: u32) -> usize {
        self.base + m as usize
    }

    fn arg(&self, m: u32) -> usize {
        self.base - self.args as usize + m as usize
    }

    fn closure_value(&self) -> Result<Value, RunError> {
        match self.frames.last() {
            Some(f) if f.is_closure => {}
            _ => return Err(self.fail(RunErrorKind::NoClosureInFrame)),
        }
        Ok(Value::from_repr(
            self.stack[self.base - self.args as usize - 1],
        ))
    }

    fn capture_get(&self, m: u32) -> Result<Value, RunError> {
        let c = self.closure_value()?;
        Ok(self.heap.field(c.as_handle(), m as usize + 1))
    }

    fn capture_set(&mut self, m: u32, v: Value) -> Result<(), RunError> {
        let c = self.closure_value()?;
        self.heap.set_field(c.as_handle(), m as usize + 1, v);
        Ok(())
    }

    fn type_name(&self, v: Value) -> &'static str {
        if v.is_int() {
            "integer"
        } else {
            match self.heap.tag(v.as_handle()) {
                ObjTag::Array => "array",
                ObjTag::String => "string",
                ObjTag::Sexp => "sexp",
                ObjTag::Closure => "function",
            }
        }
    }

    fn is_aggregate(&self, v: Value) -> bool {
        v.is_ref() && self.heap.tag(v.as_handle()) != ObjTag::Closure
    }

    fn pop_int_pair(&mut self, op: &'static str) -> Result<(Value, Value), RunError> {
        let lhs = self.top(1)?;
        let rhs = self.top(0)?;
        if !(lhs.is_int() && rhs.is_int()) {
            return Err(self.fail(RunErrorKind::BinopType {
                op,
                lhs: self.type_name(lhs),
                rhs: self.type_name(rhs),
            }));
        }
        self.pop_n(2)?;
        Ok((lhs, rhs))
    }

    /// Validates the aggregate and integer index for `STA`/`ELEM`, returning the index.
    fn check_indexing(&self, agg: Value, idx_v: Value) -> Result<usize, RunError> {
        if !self.is_aggregate(agg) {
            return Err(self.fail(RunErrorKind::NotIndexable {
                got: self.type_name(agg),
            }));
        }
        if !idx_v.is_int() {
            return Err(self.fail(RunErrorKind::IndexType {
                got: self.type_name(idx_v),
            }));
        }
        let idx = idx_v.as_int();
        let len = self.heap.len(agg.as_handle());
        if idx < 0 || idx.cast_unsigned() >= len {
            return Err(self.fail(RunErrorKind::IndexOutOfRange { index: idx, len }));
        }
        Ok(idx.cast_unsigned())
    }

    fn stringify(&self, v: Value) -> String {
        let mut out = String::new();
        self.stringify_to(&mut out, v);
        out
    }

    fn stringify_to(&self, out: &mut String, v: Value) {
        if v.is_int() {
            let _ = write!(out, "{}", v.as_int());
            return;
        }
        let h = v.as_handle();
        match self.heap.tag(h) {
            ObjTag::Array => {
                out.push('[');
                for i in 0..self.heap.len(h) {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.stringify_to(out, self.heap.field(h, i));
                }
                out.push(']');
            }
            ObjTag::Closure => out.push_str("<function>"),
            ObjTag::String => {
                out.push('"');
                out.push_str(&String::from_utf8_lossy(self.heap.bytes(h)));
                out.push('"');
            }
            ObjTag::Sexp => {
                let tag = self.module.strtab_entry(self.heap.sexp_tag(h)).unwrap_or(b"");
                out.push_str(&String::from_utf8_lossy(tag));
                let n = self.heap.len(h);
                if n > 0 {
                    out.push_str(" (");
                    for i in 0..n {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        self.stringify_to(out, self.heap.field(h, i));
                    }
                    out.push(')');
                }
            }
        }
    }

    fn enter_frame(&mut self, target: u32, is_closure: bool) {
        self.frames.push(Frame {
            proc_addr: target,
            saved_pc: self.pc,
            saved_base: self.base,
            saved_args: self.args,
            line: 0,
            is_closure,
        });
        self.pc = target;
    }

    #[expect(clippy::too_many_lines, reason = "one arm per opcode")]
    fn run(&mut self, trace: &mut Option<&mut dyn TraceSink>) -> Result<(), RunError> {
        let mask = trace.as_ref().map_or(TraceMask::NONE, |t| t.mask());

        self.enter_frame(0, false);

        loop {
            let op_addr = self.pc;
            let byte = self.fetch_u8()?;

            if mask.contains(TraceMask::INSTR)
                && let Some(t) = trace
            {
                t.event(&TraceEvent::Instr {
                    pc: op_addr,
                    opcode: byte,
                    stack_size: self.sp,
                });
            }

            let Some(op) = Opcode::from_byte(byte) else {
                return Err(self.fail(RunErrorKind::IllegalOp {
                    addr: op_addr,
                    byte,
                }));
            };

            match op {
                Opcode::Add => {
                    let (a, b) = self.pop_int_pair("+")?;
                    self.push(Value::from_uint(a.as_uint().wrapping_add(b.as_uint())))?;
                }
                Opcode::Sub => {
                    let (a, b) = self.pop_int_pair("-")?;
                    self.push(Value::from_uint(a.as_uint().wrapping_sub(b.as_uint())))?;
                }
                Opcode::Mul => {
                    let (a, b) = self.pop_int_pair("*")?;
                    self.push(Value::from_uint(a.as_uint().wrapping_mul(b.as_uint())))?;
                }
                Opcode::Div => {
                    let (a, b) = self.pop_int_pair("/")?;
                    if b.as_int() == 0 {
                        return Err(self.fail(RunErrorKind::DivisionByZero));
                    }
                    self.push(Value::from_int(a.as_int().wrapping_div(b.as_int())))?;
                }
                Opcode::Mod => {
                    let (a, b) = self.pop_int_pair("%")?;
                    if b.as_int() == 0 {
                        return Err(self.fail(RunErrorKind::DivisionByZero));
                    }
                    self.push(Value::from_int(a.as_int().wrapping_rem(b.as_int())))?;
                }
                Opcode::Lt => {
                    let (a, b) = self.pop_int_pair("<")?;
                    self.push(Value::from_bool(a.as_int() < b.as_int()))?;
                }
                Opcode::Le => {
                    let (a, b) = self.pop_int_pair("<=")?;
                    self.push(Value::from_bool(a.as_int() <= b.as_int()))?;
                }
                Opcode::Gt => {
                    let (a, b) = self.pop_int_pair(">")?;
                    self.push(Value::from_bool(a.as_int() > b.as_int()))?;
                }
                Opcode::Ge => {
                    let (a, b) = self.pop_int_pair(">=")?;
                    self.push(Value::from_bool(a.as_int() >= b.as_int()))?;
                }
                Opcode::Eq => {
                    let lhs = self.top(1)?;
                    let rhs = self.top(0)?;
                    let eq = if lhs.is_int() && rhs.is_int() {
                        lhs.as_int() == rhs.as_int()
                    } else if lhs.is_int() != rhs.is_int() {
                        false
                    } else {
                        lhs.as_handle() == rhs.as_handle()
                    };
                    self.pop_n(2)?;
                    self.push(Value::from_bool(eq))?;
                }
                Opcode::Ne => {
                    let (a, b) = self.pop_int_pair("!=")?;
                    self.push(Value::from_bool(a.as_int() != b.as_int()))?;
                }
                Opcode::And => {
                    let (a, b) = self.pop_int_pair("&&")?;
                    self.push(Value::from_bool(a.as_uint() != 0 && b.as_uint() != 0))?;
                }
                Opcode::Or => {
                    let (a, b) = self.pop_int_pair("!!")?;
                    self.push(Value::from_bool(a.as_uint() != 0 || b.as_uint() != 0))?;
                }

                Opcode::Const => {
                    let k = self.fetch_u32()?;
                    self.push(Value::from_int(k.cast_signed() as isize))?;
                }

                Opcode::String => {
                    let s = self.fetch_u32()?;
                    let Some(bytes) = self.module.strtab_entry(s) else {
                        return Err(self.fail(RunErrorKind::BadStrtab { offset: s }));
                    };
                    let h = self.heap.alloc_string_from(bytes);
                    self.push(Value::from_handle(h))?;
                }

                Opcode::Sexp => {
                    let s = self.fetch_u32()?;
                    let n = self.fetch_u32()?;
                    if n > MAX_MEMBER_COUNT {
                        return Err(self.fail(RunErrorKind::TooManyMembers { count: n }));
                    }
                    if self.module.strtab_entry(s).is_none() {
                        return Err(self.fail(RunErrorKind::BadStrtab { offset: s }));
                    }
                    let n = n as usize;
                    let h = self.heap.alloc_sexp(s, n);
                    for i in 0..n {
                        let v = self.top(n - 1 - i)?;
                        self.heap.set_field(h, i, v);
                    }
                    self.pop_n(n)?;
                    self.push(Value::from_handle(h))?;
                }

                // Never emitted by the Lama compiler.
                Opcode::Sti | Opcode::LdaG | Opcode::LdaL | Opcode::LdaA | Opcode::LdaC => {
                    return Err(self.fail(RunErrorKind::IllegalOp {
                        addr: op_addr,
                        byte,
                    }));
                }

                Opcode::Sta => {
                    let agg = self.top(2)?;
                    let idx_v = self.top(1)?;
                    let v = self.top(0)?;
                    let idx = self.check_indexing(agg, idx_v)?;
                    let h = agg.as_handle();
                    match self.heap.tag(h) {
                        ObjTag::Array | ObjTag::Sexp => self.heap.set_field(h, idx, v),
                        ObjTag::String => {
                            if !v.is_int() {
                                return Err(self.fail(RunErrorKind::StringStoreType {
                                    got: self.type_name(v),
                                }));
                            }
                            let c = v.as_int();
                            if !(0..=0xff).contains(&c) {
                                return Err(
                                    self.fail(RunErrorKind::StringStoreRange { value: c })
                                );
                            }
                            self.heap.bytes_mut(h)[idx] = c as u8;
                        }
                        ObjTag::Closure => {}
                    }
                    self.pop_n(3)?;
                    self.push(v)?;
                }

                Opcode::Jmp => {
                    let l = self.fetch_u32()?;
                    self.pc = l;
                }

                Opcode::End | Opcode::Ret => {
                    let v = self.top(0)?;
                    let f = self.frames[self.frames.len() - 1];
                    if mask.contains(TraceMask::CALL)
                        && let Some(t) = trace
                    {
                        t.event(&TraceEvent::FrameExit {
                            proc_addr: f.proc_addr,
                            depth: self.frames.len(),
                        });
                    }
                    self.sp = self.base - self.args as usize - usize::from(f.is_closure);
                    self.publish();
                    if f.saved_pc == SENTINEL_PC {
                        return Ok(());
                    }
                    self.push(v)?;
                    self.pc = f.saved_pc;
                    self.base = f.saved_base;
                    self.args = f.saved_args;
                    self.frames.pop();
                }

                Opcode::Drop => self.pop_n(1)?,
                Opcode::Dup => {
                    let v = self.top(0)?;
                    self.push(v)?;
                }
                Opcode::Swap => {
                    let lhs = self.top(1)?;
                    let rhs = self.top(0)?;
                    self.pop_n(2)?;
                    self.push(rhs)?;
                    self.push(lhs)?;
                }

                Opcode::Elem => {
                    let agg = self.top(1)?;
                    let idx_v = self.top(0)?;
                    let idx = self.check_indexing(agg, idx_v)?;
                    let h = agg.as_handle();
                    let elem = match self.heap.tag(h) {
                        ObjTag::Array | ObjTag::Sexp => self.heap.field(h, idx),
                        ObjTag::String => Value::from_int(isize::from(self.heap.bytes(h)[idx])),
                        ObjTag::Closure => Value::default(),
                    };
                    self.pop_n(2)?;
                    self.push(elem)?;
                }

                Opcode::LdG => {
                    let m = self.fetch_u32()?;
                    let v = Value::from_repr(self.stack[self.global(m)]);
                    self.push(v)?;
                }
                Opcode::LdL => {
                    let m = self.fetch_u32()?;
                    let v = Value::from_repr(self.stack[self.local(m)]);
                    self.push(v)?;
                }
                Opcode::LdA => {
                    let m = self.fetch_u32()?;
                    let v = Value::from_repr(self.stack[self.arg(m)]);
                    self.push(v)?;
                }
                Opcode::LdC => {
                    let m = self.fetch_u32()?;
                    let v = self.capture_get(m)?;
                    self.push(v)?;
                }

                Opcode::StG => {
                    let m = self.fetch_u32()?;
                    let v = self.top(0)?;
                    let i = self.global(m);
                    self.stack[i] = v.to_repr();
                }
                Opcode::StL => {
                    let m = self.fetch_u32()?;
                    let v = self.top(0)?;
                    let i = self.local(m);
                    self.stack[i] = v.to_repr();
                }
                Opcode::StA => {
                    let m = self.fetch_u32()?;
                    let v = self.top(0)?;
                    let i = self.arg(m);
                    self.stack[i] = v.to_repr();
                }
                Opcode::StC => {
                    let m = self.fetch_u32()?;
                    let v = self.top(0)?;
                    self.capture_set(m, v)?;
                }

                Opcode::CjmpZ => {
                    let l = self.fetch_u32()?;
                    let cond = self.top(0)?;
                    if !cond.is_int() {
                        return Err(self.fail(RunErrorKind::BranchType {
                            got: self.type_name(cond),
                        }));
                    }
                    self.pop_n(1)?;
                    if cond.as_uint() == 0 {
                        self.pc = l;
                    }
                }
                Opcode::CjmpNz => {
                    let l = self.fetch_u32()?;
                    let cond = self.top(0)?;
                    if !cond.is_int() {
                        return Err(self.fail(RunErrorKind::BranchType {
                            got: self.type_name(cond),
                        }));
                    }
                    self.pop_n(1)?;
                    if cond.as_uint() != 0 {
                        self.pc = l;
                    }
                }

                Opcode::Begin | Opcode::Cbegin => {
                    let params_imm = self.fetch_u32()?;
                    let locals = self.fetch_u32()? as usize;
                    let params = params_imm & 0xffff;
                    let reserve = self
                        .info
                        .procs
                        .get(&op_addr)
                        .map_or(0, |p| p.stack_size as usize);

                    self.base = self.sp;
                    let new_size = self.base + locals + reserve;
                    if new_size > MAX_STACK_SIZE {
                        return Err(self.fail(RunErrorKind::StackOverflow));
                    }
                    if self.stack.len() < new_size {
                        self.stack.resize(new_size, Value::default().to_repr());
                    }
                    // The buffer is reused across frames, so locals must be re-zeroed.
                    for slot in &mut self.stack[self.base..self.base + locals] {
                        *slot = Value::default().to_repr();
                    }
                    self.args = params;
                    self.sp = self.base + locals;
                    self.publish();

                    if mask.contains(TraceMask::CALL)
                        && let Some(t) = trace
                    {
                        let is_closure = self.frames.last().is_some_and(|f| f.is_closure);
                        t.event(&TraceEvent::FrameEnter {
                            proc_addr: op_addr,
                            depth: self.frames.len(),
                            args: params,
                            locals: locals as u32,
                            is_closure,
                        });
                    }
                }

                Opcode::Closure => {
                    let l = self.fetch_u32()?;
                    let n = self.fetch_u32()?;
                    if n > MAX_MEMBER_COUNT {
                        return Err(self.fail(RunErrorKind::TooManyMembers { count: n }));
                    }
                    let h = self.heap.alloc_closure(n as usize + 1);
                    self.push(Value::from_handle(h))?;
                    self.heap.set_field(h, 0, Value::from_uint(l as usize));
                    for i in 0..n as usize {
                        let kind = self.fetch_u8()?;
                        let m = self.fetch_u32()?;
                        let v = match kind {
                            0 => Value::from_repr(self.stack[self.global(m)]),
                            1 => Value::from_repr(self.stack[self.local(m)]),
                            2 => Value::from_repr(self.stack[self.arg(m)]),
                            3 => self.capture_get(m)?,
                            _ => {
                                return Err(
                                    self.fail(RunErrorKind::IllegalVarKind { byte: kind })
                                );
                            }
                        };
                        self.heap.set_field(h, i + 1, v);
                    }
                }

                Opcode::CallC => {
                    let n = self.fetch_u32()?;
                    let clo = self.top(n as usize)?;
                    if !(clo.is_ref() && self.heap.tag(clo.as_handle()) == ObjTag::Closure) {
                        return Err(self.fail(RunErrorKind::NotCallable {
                            got: self.type_name(clo),
                        }));
                    }
                    let l = self.heap.field(clo.as_handle(), 0).as_uint() as u32;
                    let Some(p) = self.info.procs.get(&l) else {
                        return Err(self.fail(RunErrorKind::BadCallTarget { target: l }));
                    };
                    if p.params != n {
                        return Err(self.fail(RunErrorKind::ArityMismatch {
                            expected: p.params,
                            got: n,
                        }));
                    }
                    self.enter_frame(l, true);
                }

                Opcode::Call => {
                    let l = self.fetch_u32()?;
                    let _n = self.fetch_u32()?;
                    self.enter_frame(l, false);
                }

                Opcode::Tag => {
                    let s = self.fetch_u32()?;
                    let n = self.fetch_u32()?;
                    let v = self.top(0)?;
                    self.pop_n(1)?;
                    let matched = v.is_ref()
                        && self.heap.tag(v.as_handle()) == ObjTag::Sexp
                        && self.heap.len(v.as_handle()) == n as usize
                        && self.module.strtab_entry(s)
                            == self.module.strtab_entry(self.heap.sexp_tag(v.as_handle()));
                    self.push(Value::from_bool(matched))?;
                }

                Opcode::Array => {
                    let n = self.fetch_u32()?;
                    let v = self.top(0)?;
                    self.pop_n(1)?;
                    let matched = v.is_ref()
                        && self.heap.tag(v.as_handle()) == ObjTag::Array
                        && self.heap.len(v.as_handle()) == n as usize;
                    self.push(Value::from_bool(matched))?;
                }

                Opcode::Fail => {
                    let line = self.fetch_u32()?;
                    let col = self.fetch_u32()?;
                    let v = self.top(0)?;
                    let scrutinee = self.stringify(v);
                    self.pop_n(1)?;
                    return Err(self.fail(RunErrorKind::MatchFailure {
                        scrutinee,
                        line,
                        col,
                    }));
                }

                Opcode::Line => {
                    let line = self.fetch_u32()?;
                    if let Some(f) = self.frames.last_mut() {
                        f.line = line;
                    }
                }

                Opcode::PattEqStr => {
                    let lhs = self.top(1)?;
                    let rhs = self.top(0)?;
                    self.pop_n(2)?;
                    let eq = lhs.is_ref()
                        && rhs.is_ref()
                        && self.heap.tag(lhs.as_handle()) == ObjTag::String
                        && self.heap.tag(rhs.as_handle()) == ObjTag::String
                        && self.heap.bytes(lhs.as_handle()) == self.heap.bytes(rhs.as_handle());
                    self.push(Value::from_bool(eq))?;
                }
                Opcode::PattString => {
                    let v = self.top(0)?;
                    self.pop_n(1)?;
                    let matched = v.is_ref() && self.heap.tag(v.as_handle()) == ObjTag::String;
                    self.push(Value::from_bool(matched))?;
                }
                Opcode::PattArray => {
                    let v = self.top(0)?;
                    self.pop_n(1)?;
                    let matched = v.is_ref() && self.heap.tag(v.as_handle()) == ObjTag::Array;
                    self.push(Value::from_bool(matched))?;
                }
                Opcode::PattSexp => {
                    let v = self.top(0)?;
                    self.pop_n(1)?;
                    let matched = v.is_ref() && self.heap.tag(v.as_handle()) == ObjTag::Sexp;
                    self.push(Value::from_bool(matched))?;
                }
                Opcode::PattRef => {
                    let v = self.top(0)?;
                    self.pop_n(1)?;
                    self.push(Value::from_bool(v.is_ref()))?;
                }
                Opcode::PattVal => {
                    let v = self.top(0)?;
                    self.pop_n(1)?;
                    self.push(Value::from_bool(v.is_int()))?;
                }
                Opcode::PattFun => {
                    let v = self.top(0)?;
                    self.pop_n(1)?;
                    let matched = v.is_ref() && self.heap.tag(v.as_handle()) == ObjTag::Closure;
                    self.push(Value::from_bool(matched))?;
                }

                Opcode::CallLread => {
                    let v = self
                        .console
                        .read_int()
                        .map_err(|e| self.fail(RunErrorKind::Console(e)))?;
                    self.push(Value::from_int(v))?;
                }

                Opcode::CallLwrite => {
                    let v = self.top(0)?;
                    if !v.is_int() {
                        return Err(self.fail(RunErrorKind::WriteType {
                            got: self.type_name(v),
                        }));
                    }
                    self.pop_n(1)?;
                    self.console
                        .write_int(v.as_int())
                        .map_err(|e| self.fail(RunErrorKind::Console(e)))?;
                    self.push(Value::default())?;
                }

                Opcode::CallLlength => {
                    let v = self.top(0)?;
                    if !self.is_aggregate(v) {
                        return Err(self.fail(RunErrorKind::LengthType {
                            got: self.type_name(v),
                        }));
                    }
                    let len = self.heap.len(v.as_handle());
                    self.pop_n(1)?;
                    self.push(Value::from_int(len.cast_signed()))?;
                }

                Opcode::CallLstring => {
                    let v = self.top(0)?;
                    let rendered = self.stringify(v);
                    let h = self.heap.alloc_string_from(rendered.as_bytes());
                    self.pop_n(1)?;
                    self.push(Value::from_handle(h))?;
                }

                Opcode::CallBarray => {
                    let n = self.fetch_u32()?;
                    if n > MAX_MEMBER_COUNT {
                        return Err(self.fail(RunErrorKind::TooManyMembers { count: n }));
                    }
                    let n = n as usize;
                    let h = self.heap.alloc_array(n);
                    for i in 0..n {
                        let v = self.top(n - 1 - i)?;
                        self.heap.set_field(h, i, v);
                    }
                    self.pop_n(n)?;
                    self.push(Value::from_handle(h))?;
                }

                Opcode::Eof => {
                    return Err(self.fail(RunErrorKind::IllegalOp {
                        addr: op_addr,
                        byte,
                    }));
                }
            }
        }
    }
}
