// Copyright 2026 the Friar Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The event-stream bytecode decoder.
//!
//! [`Decoder::next`] decodes one instruction and reports it as a sequence of events to a
//! caller-supplied [`Sink`]: exactly one [`Sink::instr_start`], then zero or more immediates,
//! then at most one [`Sink::error`], and finally exactly one [`Sink::instr_end`]. The cursor
//! is left on the byte following the instruction regardless of errors, so every consumer
//! (verifier, disassembler, idiom miner) observes the same instruction boundaries.

use alloc::vec::Vec;
use core::fmt;

use crate::opcode::Opcode;

/// The kind of a variable referenced by a load, store, or closure-capture immediate.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum VarKind {
    /// A module-wide global slot.
    Global,
    /// A procedure-local slot.
    Local,
    /// A procedure parameter.
    Param,
    /// A variable captured by the enclosing closure.
    Capture,
}

impl VarKind {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Global,
            1 => Self::Local,
            2 => Self::Param,
            3 => Self::Capture,
            _ => return None,
        })
    }

    /// Returns the single-letter mnemonic used in disassembly (`G`, `L`, `A`, `C`).
    #[must_use]
    pub const fn letter(self) -> char {
        match self {
            Self::Global => 'G',
            Self::Local => 'L',
            Self::Param => 'A',
            Self::Capture => 'C',
        }
    }
}

/// A 32-bit little-endian immediate.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Imm32 {
    /// The address of the first byte of the immediate.
    pub addr: u32,
    /// The raw immediate value.
    pub value: u32,
}

/// A variable-descriptor immediate: a kind byte followed by a 32-bit index.
///
/// In the load/store families the kind byte doubles as the opcode byte and only its low nibble
/// is significant; inside `CLOSURE` the full byte is.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImmVarspec {
    /// The address of the first byte of the immediate.
    pub addr: u32,
    /// The variable kind.
    pub kind: VarKind,
    /// The variable index.
    pub idx: u32,
}

/// A bytecode decoding error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeError {
    /// The address where the error occurred.
    pub addr: u32,
    /// The specific reason for the error.
    pub kind: DecodeErrorKind,
}

/// The reason for a [`DecodeError`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// The bytecode ended in the middle of an instruction.
    Eof {
        /// What was being read when the bytecode ran out.
        reading: &'static str,
    },
    /// A varspec immediate has an unrecognized variable kind.
    IllegalVarKind {
        /// The raw kind byte.
        byte: u8,
    },
    /// The opcode byte is not part of the instruction set.
    IllegalOp {
        /// The raw opcode byte.
        byte: u8,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DecodeErrorKind::Eof { reading } => write!(
                f,
                "encountered the end of the bytecode at {:#x} while reading {reading}",
                self.addr
            ),
            DecodeErrorKind::IllegalVarKind { byte } => write!(
                f,
                "unrecognized variable kind encoding {byte:#04x} at {:#x}",
                self.addr
            ),
            DecodeErrorKind::IllegalOp { byte } => {
                write!(f, "illegal opcode {byte:#04x} at {:#x}", self.addr)
            }
        }
    }
}

impl core::error::Error for DecodeError {}

/// A consumer of decoder events.
///
/// All methods have no-op defaults so consumers only implement the events they care about.
pub trait Sink {
    /// The first byte of an instruction was read.
    ///
    /// `opcode` is the raw byte; it may not name a valid [`Opcode`], in which case an
    /// [`Sink::error`] event follows.
    fn instr_start(&mut self, addr: u32, opcode: u8) {
        let _ = (addr, opcode);
    }

    /// A 32-bit immediate was read.
    fn imm32(&mut self, imm: Imm32) {
        let _ = imm;
    }

    /// A variable-descriptor immediate was read.
    fn imm_varspec(&mut self, imm: ImmVarspec) {
        let _ = imm;
    }

    /// Decoding the current instruction failed. At most one per instruction.
    fn error(&mut self, error: DecodeError) {
        let _ = error;
    }

    /// The instruction ended: it spans `[start, end)`.
    fn instr_end(&mut self, start: u32, end: u32) {
        let _ = (start, end);
    }
}

/// A cursor over an instruction byte buffer.
#[derive(Clone, Debug)]
pub struct Decoder<'a> {
    bc: &'a [u8],
    pos: u32,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder positioned at the start of `bc`.
    #[must_use]
    pub fn new(bc: &'a [u8]) -> Self {
        Self { bc, pos: 0 }
    }

    /// Moves the cursor to `addr`.
    pub fn move_to(&mut self, addr: u32) {
        self.pos = addr;
    }

    /// Returns the current cursor position.
    #[must_use]
    pub fn pos(&self) -> u32 {
        self.pos
    }

    /// Decodes the instruction at the cursor, reporting events to `sink`.
    ///
    /// If the cursor is already past the end of the buffer, a single
    /// [`DecodeErrorKind::Eof`] event is reported and nothing else.
    pub fn next(&mut self, sink: &mut dyn Sink) {
        if self.pos as usize >= self.bc.len() {
            sink.error(DecodeError {
                addr: self.pos,
                kind: DecodeErrorKind::Eof {
                    reading: "an opcode",
                },
            });
            return;
        }

        let start = self.pos;
        let byte = self.bc[start as usize];
        self.pos += 1;
        sink.instr_start(start, byte);

        let r = match Opcode::from_byte(byte) {
            Some(op) => self.emit_operands(op, start, sink),
            None => Err(DecodeError {
                addr: start,
                kind: DecodeErrorKind::IllegalOp { byte },
            }),
        };
        if let Err(e) = r {
            sink.error(e);
        }

        sink.instr_end(start, self.pos);
    }

    fn emit_operands(
        &mut self,
        op: Opcode,
        start: u32,
        sink: &mut dyn Sink,
    ) -> Result<(), DecodeError> {
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
            | Op::Or
            | Op::Sti
            | Op::Sta
            | Op::End
            | Op::Ret
            | Op::Drop
            | Op::Dup
            | Op::Swap
            | Op::Elem
            | Op::PattEqStr
            | Op::PattString
            | Op::PattArray
            | Op::PattSexp
            | Op::PattRef
            | Op::PattVal
            | Op::PattFun
            | Op::CallLread
            | Op::CallLwrite
            | Op::CallLlength
            | Op::CallLstring
            | Op::Eof => Ok(()),

            Op::Const => self.emit_imm32("an integer constant", sink),
            Op::String => self.emit_imm32("a string table offset", sink),

            Op::Sexp => {
                self.emit_imm32("a string table offset", sink)?;
                self.emit_imm32("a member count", sink)
            }

            Op::Jmp | Op::CjmpZ | Op::CjmpNz => self.emit_imm32("a jump target", sink),

            Op::LdG
            | Op::LdL
            | Op::LdA
            | Op::LdC
            | Op::LdaG
            | Op::LdaL
            | Op::LdaA
            | Op::LdaC
            | Op::StG
            | Op::StL
            | Op::StA
            | Op::StC => {
                // The opcode byte doubles as the varspec kind byte.
                self.pos = start;
                let imm = self.read_varspec(true)?;
                sink.imm_varspec(imm);
                Ok(())
            }

            Op::Begin | Op::Cbegin => {
                self.emit_imm32("a parameter count", sink)?;
                self.emit_imm32("a local count", sink)
            }

            Op::Closure => {
                self.emit_imm32("a call target", sink)?;
                let n = self.read_imm32("a captured variable count")?;
                sink.imm32(n);
                for _ in 0..n.value {
                    let imm = self.read_varspec(false)?;
                    sink.imm_varspec(imm);
                }
                Ok(())
            }

            Op::CallC => self.emit_imm32("an argument count", sink),

            Op::Call => {
                self.emit_imm32("a call target", sink)?;
                self.emit_imm32("an argument count", sink)
            }

            Op::Tag => {
                self.emit_imm32("a tag", sink)?;
                self.emit_imm32("a member count", sink)
            }

            Op::Array | Op::CallBarray => self.emit_imm32("an element count", sink),

            Op::Fail => {
                self.emit_imm32("a line number", sink)?;
                self.emit_imm32("a column number", sink)
            }

            Op::Line => self.emit_imm32("a line number", sink),
        }
    }

    fn emit_imm32(&mut self, reading: &'static str, sink: &mut dyn Sink) -> Result<(), DecodeError> {
        let imm = self.read_imm32(reading)?;
        sink.imm32(imm);
        Ok(())
    }

    fn read_imm32(&mut self, reading: &'static str) -> Result<Imm32, DecodeError> {
        let addr = self.pos;
        let Some(bytes) = self
            .bc
            .get(addr as usize..)
            .and_then(|tail| tail.get(..4))
        else {
            self.pos = self.bc.len() as u32;
            return Err(DecodeError {
                addr: self.pos,
                kind: DecodeErrorKind::Eof { reading },
            });
        };
        self.pos = addr + 4;
        Ok(Imm32 {
            addr,
            value: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        })
    }

    fn read_varspec(&mut self, ignore_hi: bool) -> Result<ImmVarspec, DecodeError> {
        let addr = self.pos;
        if (addr as usize) + 5 > self.bc.len() {
            self.pos = self.bc.len() as u32;
            return Err(DecodeError {
                addr: self.pos,
                kind: DecodeErrorKind::Eof {
                    reading: "a variable descriptor",
                },
            });
        }

        let mut kind_byte = self.bc[addr as usize];
        self.pos += 1;
        if ignore_hi {
            kind_byte &= 0x0f;
        }
        let kind = VarKind::from_byte(kind_byte).ok_or(DecodeError {
            addr,
            kind: DecodeErrorKind::IllegalVarKind { byte: kind_byte },
        })?;

        let i = self.pos as usize;
        let idx = u32::from_le_bytes([self.bc[i], self.bc[i + 1], self.bc[i + 2], self.bc[i + 3]]);
        self.pos += 4;

        Ok(ImmVarspec { addr, kind, idx })
    }
}

/// A sink that captures a single instruction's events for offline inspection.
///
/// This is the decode front end shared by the verifier and the idiom miner: both work one
/// instruction at a time from a worklist rather than streaming through the buffer.
#[derive(Clone, Debug, Default)]
pub struct Capture {
    /// The address of the first byte of the instruction.
    pub start: u32,
    /// The address of the byte following the instruction.
    pub end: u32,
    /// The raw opcode byte.
    pub opcode: u8,
    /// The 32-bit immediates, in encoding order.
    pub imms: Vec<Imm32>,
    /// The variable-descriptor immediates, in encoding order.
    pub varspecs: Vec<ImmVarspec>,
    /// The decode error, if any.
    pub error: Option<DecodeError>,
}

impl Capture {
    /// Decodes the instruction at `addr` into a fresh capture.
    #[must_use]
    pub fn decode_at(decoder: &mut Decoder<'_>, addr: u32) -> Self {
        decoder.move_to(addr);
        let mut capture = Self::default();
        decoder.next(&mut capture);
        capture
    }

    /// Returns the `i`-th 32-bit immediate.
    ///
    /// Callers must have checked [`Capture::error`] first; a clean decode of an opcode with at
    /// least `i + 1` immediates always has it.
    #[must_use]
    pub fn imm(&self, i: usize) -> Imm32 {
        self.imms.get(i).copied().unwrap_or_default()
    }
}

impl Sink for Capture {
    fn instr_start(&mut self, addr: u32, opcode: u8) {
        self.start = addr;
        self.end = addr;
        self.opcode = opcode;
    }

    fn imm32(&mut self, imm: Imm32) {
        self.imms.push(imm);
    }

    fn imm_varspec(&mut self, imm: ImmVarspec) {
        self.varspecs.push(imm);
    }

    fn error(&mut self, error: DecodeError) {
        self.error = Some(error);
    }

    fn instr_end(&mut self, start: u32, end: u32) {
        self.start = start;
        self.end = end;
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::opcode::Opcode;

    #[test]
    fn decodes_a_const_instruction() {
        let bc = [Opcode::Const as u8, 0x2a, 0x00, 0x00, 0x00, 0xff];
        let mut decoder = Decoder::new(&bc);
        let c = Capture::decode_at(&mut decoder, 0);

        assert_eq!(c.opcode, Opcode::Const as u8);
        assert_eq!(c.imms, vec![Imm32 { addr: 1, value: 42 }]);
        assert_eq!(c.error, None);
        assert_eq!((c.start, c.end), (0, 5));
        assert_eq!(decoder.pos(), 5);
    }

    #[test]
    fn decodes_load_family_varspec_from_the_opcode_byte() {
        let bc = [Opcode::StL as u8, 0x03, 0x00, 0x00, 0x00, 0xff];
        let mut decoder = Decoder::new(&bc);
        let c = Capture::decode_at(&mut decoder, 0);

        assert_eq!(
            c.varspecs,
            vec![ImmVarspec {
                addr: 0,
                kind: VarKind::Local,
                idx: 3
            }]
        );
        assert_eq!(c.end, 5);
    }

    #[test]
    fn decodes_closure_captures_with_full_kind_bytes() {
        #[rustfmt::skip]
        let bc = [
            Opcode::Closure as u8,
            0x08, 0x00, 0x00, 0x00, // target
            0x02, 0x00, 0x00, 0x00, // capture count
            0x01, 0x05, 0x00, 0x00, 0x00, // L(5)
            0x03, 0x00, 0x00, 0x00, 0x00, // C(0)
            0xff,
        ];
        let mut decoder = Decoder::new(&bc);
        let c = Capture::decode_at(&mut decoder, 0);

        assert_eq!(c.error, None);
        assert_eq!(c.imms.len(), 2);
        assert_eq!(c.varspecs.len(), 2);
        assert_eq!(c.varspecs[0].kind, VarKind::Local);
        assert_eq!(c.varspecs[1].kind, VarKind::Capture);
        assert_eq!(c.end, 19);
    }

    #[test]
    fn reports_truncated_immediates() {
        let bc = [Opcode::Jmp as u8, 0x01, 0x02];
        let mut decoder = Decoder::new(&bc);
        let c = Capture::decode_at(&mut decoder, 0);

        assert!(matches!(
            c.error,
            Some(DecodeError {
                kind: DecodeErrorKind::Eof { .. },
                ..
            })
        ));
        // The cursor still lands past the consumed bytes so scanning can continue.
        assert_eq!(c.end, 3);
    }

    #[test]
    fn reports_illegal_opcodes_and_var_kinds() {
        let bc = [0x0e];
        let mut decoder = Decoder::new(&bc);
        let c = Capture::decode_at(&mut decoder, 0);
        assert!(matches!(
            c.error,
            Some(DecodeError {
                addr: 0,
                kind: DecodeErrorKind::IllegalOp { byte: 0x0e },
            })
        ));

        #[rustfmt::skip]
        let bc = [
            Opcode::Closure as u8,
            0x00, 0x00, 0x00, 0x00,
            0x01, 0x00, 0x00, 0x00,
            0x07, 0x00, 0x00, 0x00, 0x00, // kind 7 is not a variable kind
        ];
        let mut decoder = Decoder::new(&bc);
        let c = Capture::decode_at(&mut decoder, 0);
        assert!(matches!(
            c.error,
            Some(DecodeError {
                kind: DecodeErrorKind::IllegalVarKind { byte: 0x07 },
                ..
            })
        ));
    }

    #[test]
    fn next_past_the_end_reports_eof_only() {
        struct Counting {
            starts: u32,
            errors: u32,
            ends: u32,
        }
        impl Sink for Counting {
            fn instr_start(&mut self, _addr: u32, _opcode: u8) {
                self.starts += 1;
            }
            fn error(&mut self, _error: DecodeError) {
                self.errors += 1;
            }
            fn instr_end(&mut self, _start: u32, _end: u32) {
                self.ends += 1;
            }
        }

        let bc = [0xffu8];
        let mut decoder = Decoder::new(&bc);
        decoder.move_to(1);
        let mut sink = Counting {
            starts: 0,
            errors: 0,
            ends: 0,
        };
        decoder.next(&mut sink);
        assert_eq!((sink.starts, sink.errors, sink.ends), (0, 1, 0));
    }
}
