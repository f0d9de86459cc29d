// Copyright 2026 the Friar Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Whole-program bytecode verification.
//!
//! The verifier is a worklist-driven abstract interpreter over the instruction stream. It
//! reconstructs procedure boundaries, validates control flow and every immediate, and enforces
//! the stack discipline: at every reachable address the static operand-stack height must be the
//! same along all paths that reach it. On success it produces a [`ModuleInfo`] with one
//! [`Proc`] record per procedure; the interpreter and the idiom miner both require it.
//!
//! Two worklists drive the traversal:
//! - *top-level* items `(addr, is_main)`: each must start a procedure (`BEGIN`/`CBEGIN`) or be
//!   the end-of-file marker;
//! - *body* items `(addr, proc_addr, height)`: each instruction is verified once per slot, and
//!   a revisit must agree on both the owning procedure and the stack height.
//!
//! Call and closure targets may be forward references, so their validation is deferred to a
//! post-pass that runs once every procedure is known.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::{HashMap, HashSet};

use crate::decode::{Capture, DecodeError, Decoder, Imm32, ImmVarspec, VarKind};
use crate::module::Module;
use crate::opcode::Opcode;

/// The maximum static operand-stack height the verifier accepts.
pub const MAX_STACK_HEIGHT: u32 = 0x7fff_ffff;

/// The maximum captured-variable index the verifier accepts.
pub const MAX_CAPTURES: u32 = 0x7fff_ffff;

/// The maximum member count the runtime accepts for one aggregate allocation.
pub const MAX_MEMBER_COUNT: u32 = 0x00ff_ffff;

/// Per-procedure attributes reconstructed by the verifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Proc {
    /// The declared parameter count: the low 16 bits of the first `BEGIN`/`CBEGIN` immediate.
    pub params: u32,
    /// The declared local count: the second `BEGIN`/`CBEGIN` immediate.
    pub locals: u32,
    /// One past the highest capture index observed in the body; `0` if none.
    pub captures: u32,
    /// The maximum static operand-stack height observed in the body.
    pub stack_size: u32,
    /// `true` iff the procedure was declared with `CBEGIN`.
    pub is_closure: bool,
}

/// The verifier's summary of a module: procedure attributes plus the validated symbol table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Procedure attributes, keyed by the `BEGIN`/`CBEGIN` address.
    pub procs: HashMap<u32, Proc>,
    /// Validated public symbols: bytecode address to string-table name offset.
    pub symbols: HashMap<u32, u32>,
}

impl ModuleInfo {
    /// Returns the public name of the procedure at `addr`, if it has one.
    #[must_use]
    pub fn proc_name<'m>(&self, module: &'m Module, addr: u32) -> Option<&'m [u8]> {
        module.strtab_entry(*self.symbols.get(&addr)?)
    }
}

/// A verification error, positioned at a bytecode address (or file offset for symbol errors).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyError {
    /// Where the error occurred.
    pub addr: u32,
    /// The specific reason for the error.
    pub kind: VerifyErrorKind,
}

/// The reason for a [`VerifyError`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyErrorKind {
    /// An instruction failed to decode.
    Decode(DecodeError),
    /// A symbol's address lies beyond the bytecode section.
    SymbolOutOfBounds {
        /// The symbol's address.
        address: u32,
        /// The bytecode size.
        size: u32,
    },
    /// Two symbols share one name.
    DuplicateSymbol {
        /// The shared name, rendered for display.
        name: String,
    },
    /// A string-table offset is out of bounds.
    StrtabOutOfBounds {
        /// The offending offset.
        offset: u32,
        /// The string-table size.
        size: u32,
    },
    /// A string-table entry is not NUL-terminated.
    StrtabUnterminated {
        /// The offending offset.
        offset: u32,
    },
    /// Control fell past the end of the buffer without an end-of-file marker.
    NoEofMarker,
    /// The module has no main procedure at offset 0.
    NoMain,
    /// The main procedure is declared with `CBEGIN`.
    MainIsClosure,
    /// The main procedure does not declare exactly two parameters.
    MainParamCount {
        /// The declared parameter count.
        params: u32,
    },
    /// A top-level byte is neither `BEGIN`, `CBEGIN`, nor the end-of-file marker.
    IllegalTopLevel {
        /// The raw byte.
        byte: u8,
    },
    /// A body instruction address lies past the end of the buffer.
    UnexpectedEnd,
    /// The end-of-file marker appeared inside a procedure body.
    UnexpectedEofMarker {
        /// The owning procedure.
        proc_addr: u32,
    },
    /// An instruction is reachable from two different procedures.
    CrossProcedure {
        /// The procedure that reached the instruction first.
        first: u32,
        /// The procedure that reached it second.
        second: u32,
    },
    /// An instruction is reachable with two different static stack heights.
    UnbalancedStack {
        /// The height recorded first.
        first: u32,
        /// The conflicting height.
        second: u32,
    },
    /// An instruction pops more operands than the stack holds.
    StackUnderflow {
        /// How many operands the instruction pops.
        needed: u32,
        /// The static height at the instruction.
        have: u32,
    },
    /// The static stack height exceeded [`MAX_STACK_HEIGHT`].
    StackOverflow,
    /// A non-negative-required immediate has its sign bit set.
    NegativeImmediate {
        /// The field being read.
        field: &'static str,
        /// The raw immediate.
        value: u32,
    },
    /// A `BEGIN`/`CBEGIN` appeared inside a procedure body.
    NestedBegin {
        /// The enclosing procedure.
        proc_addr: u32,
        /// `true` if the nested declaration was `CBEGIN`.
        closure: bool,
    },
    /// A global index is out of bounds.
    GlobalOutOfBounds {
        /// The index.
        index: u32,
        /// The module's global count.
        count: u32,
    },
    /// A local index is out of bounds.
    LocalOutOfBounds {
        /// The index.
        index: u32,
        /// The procedure's local count.
        count: u32,
    },
    /// A parameter index is out of bounds.
    ParamOutOfBounds {
        /// The index.
        index: u32,
        /// The procedure's parameter count.
        count: u32,
    },
    /// A capture index exceeds [`MAX_CAPTURES`].
    CaptureTooLarge {
        /// The index.
        index: u32,
    },
    /// A jump target lies outside the bytecode section.
    JumpOutOfBounds {
        /// The target address.
        target: u32,
        /// The bytecode size.
        size: u32,
    },
    /// A jump target lands on a `BEGIN`/`CBEGIN`.
    JumpToProcStart {
        /// The target address.
        target: u32,
    },
    /// A jump target lands on the end-of-file marker.
    JumpToEofMarker {
        /// The target address.
        target: u32,
    },
    /// A call target lies outside the bytecode section.
    CallOutOfBounds {
        /// The target address.
        target: u32,
        /// The bytecode size.
        size: u32,
    },
    /// A call target is not a procedure declaration.
    CallNotProc {
        /// The target address.
        target: u32,
    },
    /// A `CALL` targets a `CBEGIN`-declared procedure.
    CallToClosure {
        /// The target address.
        target: u32,
    },
    /// A call's argument count does not match the procedure's parameter count.
    CallArityMismatch {
        /// The declared parameter count.
        expected: u32,
        /// The call's argument count.
        got: u32,
    },
    /// A closure-instantiation target lies outside the bytecode section.
    ClosureOutOfBounds {
        /// The target address.
        target: u32,
        /// The bytecode size.
        size: u32,
    },
    /// A closure-instantiation target is not a procedure declaration.
    ClosureNotProc {
        /// The target address.
        target: u32,
    },
    /// A closure captures fewer variables than the procedure body reads.
    CaptureShortfall {
        /// How many variables the instantiation captures.
        provided: u32,
        /// One past the highest capture index the body reads.
        needed: u32,
    },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use VerifyErrorKind as K;
        match &self.kind {
            K::Decode(e) => write!(f, "{e}"),
            K::SymbolOutOfBounds { address, size } => write!(
                f,
                "the symbol points to address {address:#x} which is beyond the size of the bytecode ({size:#x})"
            ),
            K::DuplicateSymbol { name } => {
                write!(f, "the symbol named `{name}` is defined multiple times")
            }
            K::StrtabOutOfBounds { offset, size } => write!(
                f,
                "the string table offset {offset:#x} is out of bounds for the string table of size {size:#x}"
            ),
            K::StrtabUnterminated { offset } => write!(
                f,
                "the string at offset {offset:#x} in the string table is not NUL-terminated"
            ),
            K::NoEofMarker => write!(f, "no end-of-file marker found in the bytecode section"),
            K::NoMain => write!(f, "no main procedure definition found"),
            K::MainIsClosure => write!(
                f,
                "the first procedure must not close over variables, but it is declared with CBEGIN"
            ),
            K::MainParamCount { params } => {
                write!(f, "the main procedure must have 2 parameters, got {params}")
            }
            K::IllegalTopLevel { byte } => {
                write!(f, "encountered an illegal top-level bytecode byte {byte:#04x}")
            }
            K::UnexpectedEnd => write!(
                f,
                "encountered the end of the file unexpectedly while verifying the bytecode"
            ),
            K::UnexpectedEofMarker { proc_addr } => write!(
                f,
                "encountered an unexpected end-of-file marker inside the procedure declared at {proc_addr:#x}"
            ),
            K::CrossProcedure { first, second } => write!(
                f,
                "an instruction is part of multiple procedure definitions (at {first:#x} and {second:#x})"
            ),
            K::UnbalancedStack { first, second } => write!(
                f,
                "detected unbalanced static stack heights: {first} and {second}"
            ),
            K::StackUnderflow { needed, have } => write!(
                f,
                "not enough operands on the stack: expected at least {needed}, have {have}"
            ),
            K::StackOverflow => write!(
                f,
                "exceeded the maximum static stack height of {MAX_STACK_HEIGHT}"
            ),
            K::NegativeImmediate { field, value } => {
                write!(f, "the value {value:#x} is too large for {field}")
            }
            K::NestedBegin { proc_addr, closure } => write!(
                f,
                "encountered a {} instruction nested inside the procedure declared at {proc_addr:#x}",
                if *closure { "CBEGIN" } else { "BEGIN" }
            ),
            K::GlobalOutOfBounds { index, count } => write!(
                f,
                "the global index {index} is out of bounds: the module only has {count}"
            ),
            K::LocalOutOfBounds { index, count } => write!(
                f,
                "the local index {index} is out of bounds: the procedure only has {count}"
            ),
            K::ParamOutOfBounds { index, count } => write!(
                f,
                "the parameter index {index} is out of bounds: the procedure only has {count}"
            ),
            K::CaptureTooLarge { index } => write!(
                f,
                "the captured variable index {index} is too large: the maximum is {MAX_CAPTURES}"
            ),
            K::JumpOutOfBounds { target, size } => write!(
                f,
                "the jump target {target:#x} is out of bounds for the bytecode section of size {size:#x}"
            ),
            K::JumpToProcStart { target } => write!(
                f,
                "the jump target {target:#x} refers to the beginning of a procedure declaration"
            ),
            K::JumpToEofMarker { target } => {
                write!(f, "the jump target {target:#x} refers to the end-of-file marker")
            }
            K::CallOutOfBounds { target, size } => write!(
                f,
                "the call refers to address {target:#x}, which is out of bounds for the bytecode section of size {size:#x}"
            ),
            K::CallNotProc { target } => write!(
                f,
                "the call refers to address {target:#x}, which is not a procedure definition"
            ),
            K::CallToClosure { .. } => write!(
                f,
                "a closure cannot be called directly, as the call does not capture variables"
            ),
            K::CallArityMismatch { expected, got } => write!(
                f,
                "the call has a wrong number of arguments: the procedure expects {expected}, got {got}"
            ),
            K::ClosureOutOfBounds { target, size } => write!(
                f,
                "the closure instantiation refers to address {target:#x}, which is out of bounds for the bytecode section of size {size:#x}"
            ),
            K::ClosureNotProc { target } => write!(
                f,
                "the closure instantiation refers to address {target:#x}, which is not a procedure definition"
            ),
            K::CaptureShortfall { provided, needed } => write!(
                f,
                "the closure instantiation captures {provided} variables while the procedure needs at least {needed}"
            ),
        }
    }
}

impl core::error::Error for VerifyError {}

fn err(addr: u32, kind: VerifyErrorKind) -> VerifyError {
    VerifyError { addr, kind }
}

#[derive(Copy, Clone, Debug)]
enum Req {
    TopLevel { addr: u32, main: bool },
    Body { addr: u32, proc_addr: u32, height: u32 },
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum SlotKind {
    #[default]
    Unknown,
    Proc,
    Body,
    Eof,
}

#[derive(Copy, Clone, Debug, Default)]
struct Slot {
    kind: SlotKind,
    proc_addr: u32,
    height: u32,
}

#[derive(Copy, Clone, Debug)]
enum PostReq {
    Call { addr: u32, target: u32, args: u32 },
    Closure { addr: u32, target: u32, captures: u32 },
}

struct Verifier<'m> {
    module: &'m Module,
    bc: &'m [u8],
    last_nul: Option<usize>,
    worklist: Vec<Req>,
    slots: Vec<Slot>,
    procs: HashMap<u32, Proc>,
    symbols: HashMap<u32, u32>,
    post: Vec<PostReq>,
}

/// Statically verifies `module`, producing its [`ModuleInfo`].
///
/// Verification is deterministic and has no side effects, so verifying the same module twice
/// yields the same result.
pub fn verify(module: &Module) -> Result<ModuleInfo, VerifyError> {
    let mut v = Verifier {
        module,
        bc: &module.bytecode,
        last_nul: module.strtab.iter().rposition(|&b| b == 0),
        worklist: vec![Req::TopLevel {
            addr: 0,
            main: true,
        }],
        slots: vec![Slot::default(); module.bytecode.len()],
        procs: HashMap::new(),
        symbols: HashMap::new(),
        post: Vec::new(),
    };

    v.verify_symtab()?;
    v.verify_bytecode()?;
    v.post_validate()?;

    Ok(ModuleInfo {
        procs: v.procs,
        symbols: v.symbols,
    })
}

impl Verifier<'_> {
    fn bc_size(&self) -> u32 {
        u32::try_from(self.bc.len()).unwrap_or(u32::MAX)
    }

    fn verify_strtab_entry(&self, offset: u32, at: u32) -> Result<(), VerifyError> {
        if offset as usize >= self.module.strtab.len() {
            return Err(err(
                at,
                VerifyErrorKind::StrtabOutOfBounds {
                    offset,
                    size: u32::try_from(self.module.strtab.len()).unwrap_or(u32::MAX),
                },
            ));
        }
        match self.last_nul {
            Some(last) if offset as usize <= last => Ok(()),
            _ => Err(err(at, VerifyErrorKind::StrtabUnterminated { offset })),
        }
    }

    fn verify_symtab(&mut self) -> Result<(), VerifyError> {
        let mut names: HashSet<&[u8]> = HashSet::with_capacity(self.module.symtab.len());
        for sym in &self.module.symtab {
            let at = u32::try_from(sym.offset).unwrap_or(u32::MAX);
            if sym.address > self.bc_size() {
                return Err(err(
                    at,
                    VerifyErrorKind::SymbolOutOfBounds {
                        address: sym.address,
                        size: self.bc_size(),
                    },
                ));
            }
            self.verify_strtab_entry(sym.name_offset, at)?;

            // The entry is known NUL-terminated at this point.
            let name = self.module.strtab_entry(sym.name_offset).unwrap_or(&[]);
            if !names.insert(name) {
                return Err(err(
                    sym.address,
                    VerifyErrorKind::DuplicateSymbol {
                        name: String::from_utf8_lossy(name).into_owned(),
                    },
                ));
            }
            self.symbols.insert(sym.address, sym.name_offset);
        }
        Ok(())
    }

    fn verify_bytecode(&mut self) -> Result<(), VerifyError> {
        let mut decoder = Decoder::new(self.bc);
        while let Some(req) = self.worklist.pop() {
            match req {
                Req::TopLevel { addr, main } => self.verify_top_level(&mut decoder, addr, main)?,
                Req::Body {
                    addr,
                    proc_addr,
                    height,
                } => self.verify_body(&mut decoder, addr, proc_addr, height)?,
            }
        }
        Ok(())
    }

    fn verify_top_level(
        &mut self,
        decoder: &mut Decoder<'_>,
        addr: u32,
        main: bool,
    ) -> Result<(), VerifyError> {
        if addr as usize >= self.bc.len() {
            return Err(err(addr, VerifyErrorKind::NoEofMarker));
        }
        match self.slots[addr as usize].kind {
            SlotKind::Proc | SlotKind::Eof => return Ok(()),
            SlotKind::Body | SlotKind::Unknown => {}
        }

        let byte = self.bc[addr as usize];
        match Opcode::from_byte(byte) {
            Some(op @ (Opcode::Begin | Opcode::Cbegin)) => {
                let is_closure = op == Opcode::Cbegin;
                if is_closure && main {
                    return Err(err(addr, VerifyErrorKind::MainIsClosure));
                }

                let cap = Capture::decode_at(decoder, addr);
                if let Some(e) = cap.error {
                    return Err(err(e.addr, VerifyErrorKind::Decode(e)));
                }
                let params_imm = require_non_negative(cap.imm(0), "the parameter count")?;
                let locals = require_non_negative(cap.imm(1), "the local count")?;
                let params = params_imm & 0xffff;
                if main && params != 2 {
                    return Err(err(addr, VerifyErrorKind::MainParamCount { params }));
                }

                self.procs.insert(
                    addr,
                    Proc {
                        params,
                        locals,
                        captures: 0,
                        stack_size: 0,
                        is_closure,
                    },
                );
                self.slots[addr as usize] = Slot {
                    kind: SlotKind::Proc,
                    proc_addr: addr,
                    height: 0,
                };
                self.worklist.push(Req::Body {
                    addr: cap.end,
                    proc_addr: addr,
                    height: 0,
                });
                Ok(())
            }

            Some(Opcode::Eof) => {
                if main {
                    return Err(err(addr, VerifyErrorKind::NoMain));
                }
                self.slots[addr as usize] = Slot {
                    kind: SlotKind::Eof,
                    proc_addr: 0,
                    height: 0,
                };
                Ok(())
            }

            _ => Err(err(addr, VerifyErrorKind::IllegalTopLevel { byte })),
        }
    }

    #[expect(clippy::too_many_lines, reason = "one arm per opcode")]
    fn verify_body(
        &mut self,
        decoder: &mut Decoder<'_>,
        addr: u32,
        proc_addr: u32,
        height_in: u32,
    ) -> Result<(), VerifyError> {
        if addr as usize >= self.bc.len() {
            return Err(err(addr, VerifyErrorKind::UnexpectedEnd));
        }

        let slot = self.slots[addr as usize];
        match slot.kind {
            SlotKind::Body => {
                if slot.proc_addr != proc_addr {
                    return Err(err(
                        addr,
                        VerifyErrorKind::CrossProcedure {
                            first: slot.proc_addr,
                            second: proc_addr,
                        },
                    ));
                }
                if slot.height != height_in {
                    return Err(err(
                        addr,
                        VerifyErrorKind::UnbalancedStack {
                            first: slot.height,
                            second: height_in,
                        },
                    ));
                }
                return Ok(());
            }
            SlotKind::Proc | SlotKind::Eof | SlotKind::Unknown => {}
        }
        self.slots[addr as usize] = Slot {
            kind: SlotKind::Body,
            proc_addr,
            height: height_in,
        };
        self.bump_stack_size(proc_addr, height_in);

        let cap = Capture::decode_at(decoder, addr);
        if let Some(e) = cap.error {
            return Err(err(e.addr, VerifyErrorKind::Decode(e)));
        }
        let Some(op) = Opcode::from_byte(cap.opcode) else {
            // Unreachable after the error check; an unknown opcode byte decodes as an error.
            return Err(err(
                addr,
                VerifyErrorKind::Decode(DecodeError {
                    addr,
                    kind: crate::decode::DecodeErrorKind::IllegalOp { byte: cap.opcode },
                }),
            ));
        };

        let mut height = height_in;

        use Opcode as Op;
        match op {
            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Mod
            | Op::Lt
            | Op::Le
            | Op::Gt
            | Op::Ge
            | Op::Eq
            | Op::Ne
            | Op::And
            | Op::Or => check_stack(addr, &mut height, 2, 1)?,

            Op::Const => {
                // The constant immediate is the one signed-allowed immediate.
                check_stack(addr, &mut height, 0, 1)?;
            }

            Op::String => {
                let s = require_non_negative(cap.imm(0), "the string table offset")?;
                self.verify_strtab_entry(s, cap.imm(0).addr)?;
                check_stack(addr, &mut height, 0, 1)?;
            }

            Op::Sexp => {
                let s = require_non_negative(cap.imm(0), "the string table offset")?;
                let n = require_non_negative(cap.imm(1), "the member count")?;
                self.verify_strtab_entry(s, cap.imm(0).addr)?;
                check_stack(addr, &mut height, n, 1)?;
            }

            Op::Sti => check_stack(addr, &mut height, 2, 1)?,
            Op::Sta => check_stack(addr, &mut height, 3, 1)?,

            Op::Jmp => {
                let l = require_non_negative(cap.imm(0), "the jump target")?;
                self.check_jmp_target(l, cap.imm(0).addr)?;
                self.worklist.push(Req::Body {
                    addr: l,
                    proc_addr,
                    height,
                });
            }

            Op::End | Op::Ret => check_stack(addr, &mut height, 1, 1)?,

            Op::Drop => check_stack(addr, &mut height, 1, 0)?,
            Op::Dup => check_stack(addr, &mut height, 1, 2)?,
            Op::Swap => check_stack(addr, &mut height, 2, 2)?,
            Op::Elem => check_stack(addr, &mut height, 2, 1)?,

            Op::LdG
            | Op::LdL
            | Op::LdA
            | Op::LdC
            | Op::LdaG
            | Op::LdaL
            | Op::LdaA
            | Op::LdaC => {
                self.check_varspec(proc_addr, cap.varspecs[0])?;
                check_stack(addr, &mut height, 0, 1)?;
            }

            Op::StG | Op::StL | Op::StA | Op::StC => {
                self.check_varspec(proc_addr, cap.varspecs[0])?;
                check_stack(addr, &mut height, 1, 1)?;
            }

            Op::CjmpZ | Op::CjmpNz => {
                let l = require_non_negative(cap.imm(0), "the jump target")?;
                self.check_jmp_target(l, cap.imm(0).addr)?;
                check_stack(addr, &mut height, 1, 0)?;
                // The branch consumes its condition, so the target joins at the popped height.
                self.worklist.push(Req::Body {
                    addr: l,
                    proc_addr,
                    height,
                });
            }

            Op::Begin | Op::Cbegin => {
                return Err(err(
                    addr,
                    VerifyErrorKind::NestedBegin {
                        proc_addr,
                        closure: op == Op::Cbegin,
                    },
                ));
            }

            Op::Closure => {
                let l = require_non_negative(cap.imm(0), "the call target")?;
                let n = require_non_negative(cap.imm(1), "the captured variable count")?;
                for vs in &cap.varspecs {
                    self.check_varspec(proc_addr, *vs)?;
                }
                check_stack(addr, &mut height, 0, 1)?;
                self.post.push(PostReq::Closure {
                    addr,
                    target: l,
                    captures: n,
                });
            }

            Op::CallC => {
                let n = require_non_negative(cap.imm(0), "the argument count")?;
                check_stack(addr, &mut height, n + 1, 1)?;
            }

            Op::Call => {
                let l = require_non_negative(cap.imm(0), "the call target")?;
                let n = require_non_negative(cap.imm(1), "the argument count")?;
                check_stack(addr, &mut height, n, 1)?;
                self.post.push(PostReq::Call {
                    addr,
                    target: l,
                    args: n,
                });
            }

            Op::Tag => {
                let s = require_non_negative(cap.imm(0), "the string table offset")?;
                require_non_negative(cap.imm(1), "the member count")?;
                self.verify_strtab_entry(s, cap.imm(0).addr)?;
                check_stack(addr, &mut height, 1, 1)?;
            }

            Op::Array => {
                require_non_negative(cap.imm(0), "the element count")?;
                check_stack(addr, &mut height, 1, 1)?;
            }

            Op::Fail => {
                require_non_negative(cap.imm(0), "the line number")?;
                require_non_negative(cap.imm(1), "the column number")?;
                check_stack(addr, &mut height, 1, 0)?;
            }

            Op::Line => {
                require_non_negative(cap.imm(0), "the line number")?;
            }

            Op::PattEqStr => check_stack(addr, &mut height, 2, 1)?,

            Op::PattString
            | Op::PattArray
            | Op::PattSexp
            | Op::PattRef
            | Op::PattVal
            | Op::PattFun => check_stack(addr, &mut height, 1, 1)?,

            Op::CallLread => check_stack(addr, &mut height, 0, 1)?,
            Op::CallLwrite | Op::CallLlength | Op::CallLstring => {
                check_stack(addr, &mut height, 1, 1)?;
            }

            Op::CallBarray => {
                let n = require_non_negative(cap.imm(0), "the element count")?;
                check_stack(addr, &mut height, n, 1)?;
            }

            Op::Eof => {
                return Err(err(addr, VerifyErrorKind::UnexpectedEofMarker { proc_addr }));
            }
        }

        self.bump_stack_size(proc_addr, height);

        if op == Op::End {
            // A new procedure (or the end-of-file marker) may follow.
            self.worklist.push(Req::TopLevel {
                addr: cap.end,
                main: false,
            });
        } else if !op.is_terminator() {
            self.worklist.push(Req::Body {
                addr: cap.end,
                proc_addr,
                height,
            });
        }

        Ok(())
    }

    fn bump_stack_size(&mut self, proc_addr: u32, height: u32) {
        if let Some(p) = self.procs.get_mut(&proc_addr) {
            p.stack_size = p.stack_size.max(height);
        }
    }

    fn check_jmp_target(&self, target: u32, at: u32) -> Result<(), VerifyError> {
        if target as usize >= self.bc.len() {
            return Err(err(
                at,
                VerifyErrorKind::JumpOutOfBounds {
                    target,
                    size: self.bc_size(),
                },
            ));
        }
        match Opcode::from_byte(self.bc[target as usize]) {
            Some(Opcode::Begin | Opcode::Cbegin) => {
                Err(err(at, VerifyErrorKind::JumpToProcStart { target }))
            }
            Some(Opcode::Eof) => Err(err(at, VerifyErrorKind::JumpToEofMarker { target })),
            _ => Ok(()),
        }
    }

    fn check_varspec(&mut self, proc_addr: u32, vs: ImmVarspec) -> Result<(), VerifyError> {
        let proc = self.procs.get(&proc_addr).copied().unwrap_or(Proc {
            params: 0,
            locals: 0,
            captures: 0,
            stack_size: 0,
            is_closure: false,
        });
        match vs.kind {
            VarKind::Global => {
                if vs.idx >= self.module.global_count {
                    return Err(err(
                        vs.addr,
                        VerifyErrorKind::GlobalOutOfBounds {
                            index: vs.idx,
                            count: self.module.global_count,
                        },
                    ));
                }
            }
            VarKind::Local => {
                if vs.idx >= proc.locals {
                    return Err(err(
                        vs.addr,
                        VerifyErrorKind::LocalOutOfBounds {
                            index: vs.idx,
                            count: proc.locals,
                        },
                    ));
                }
            }
            VarKind::Param => {
                if vs.idx >= proc.params {
                    return Err(err(
                        vs.addr,
                        VerifyErrorKind::ParamOutOfBounds {
                            index: vs.idx,
                            count: proc.params,
                        },
                    ));
                }
            }
            VarKind::Capture => {
                if vs.idx >= MAX_CAPTURES {
                    return Err(err(vs.addr, VerifyErrorKind::CaptureTooLarge { index: vs.idx }));
                }
                if let Some(p) = self.procs.get_mut(&proc_addr) {
                    p.captures = p.captures.max(vs.idx + 1);
                }
            }
        }
        Ok(())
    }

    fn post_validate(&self) -> Result<(), VerifyError> {
        for req in &self.post {
            match *req {
                PostReq::Call { addr, target, args } => {
                    if target as usize >= self.bc.len() {
                        return Err(err(
                            addr,
                            VerifyErrorKind::CallOutOfBounds {
                                target,
                                size: self.bc_size(),
                            },
                        ));
                    }
                    let Some(p) = self.procs.get(&target) else {
                        return Err(err(addr, VerifyErrorKind::CallNotProc { target }));
                    };
                    if p.is_closure {
                        return Err(err(addr, VerifyErrorKind::CallToClosure { target }));
                    }
                    if args != p.params {
                        return Err(err(
                            addr,
                            VerifyErrorKind::CallArityMismatch {
                                expected: p.params,
                                got: args,
                            },
                        ));
                    }
                }
                PostReq::Closure {
                    addr,
                    target,
                    captures,
                } => {
                    if target as usize >= self.bc.len() {
                        return Err(err(
                            addr,
                            VerifyErrorKind::ClosureOutOfBounds {
                                target,
                                size: self.bc_size(),
                            },
                        ));
                    }
                    let Some(p) = self.procs.get(&target) else {
                        return Err(err(addr, VerifyErrorKind::ClosureNotProc { target }));
                    };
                    if captures < p.captures {
                        return Err(err(
                            addr,
                            VerifyErrorKind::CaptureShortfall {
                                provided: captures,
                                needed: p.captures,
                            },
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

fn require_non_negative(imm: Imm32, field: &'static str) -> Result<u32, VerifyError> {
    if imm.value >> 31 != 0 {
        return Err(err(
            imm.addr,
            VerifyErrorKind::NegativeImmediate {
                field,
                value: imm.value,
            },
        ));
    }
    Ok(imm.value)
}

fn check_stack(at: u32, height: &mut u32, pops: u32, pushes: u32) -> Result<(), VerifyError> {
    if *height < pops {
        return Err(err(
            at,
            VerifyErrorKind::StackUnderflow {
                needed: pops,
                have: *height,
            },
        ));
    }
    let after_pops = *height - pops;
    if MAX_STACK_HEIGHT - after_pops < pushes {
        return Err(err(at, VerifyErrorKind::StackOverflow));
    }
    *height = after_pops + pushes;
    Ok(())
}
