// Copyright 2026 the Friar Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Text disassembly.
//!
//! The disassembler is a thin dispatch over the decoder's event stream: every instruction is
//! rendered independently from its captured events, so the disassembly of a byte range equals
//! the concatenation of its single-instruction disassemblies.

use alloc::string::String;
use core::fmt;

use crate::decode::{Capture, Decoder};
use crate::opcode::Opcode;

/// Disassembly formatting options.
#[derive(Copy, Clone, Debug)]
pub struct DisasmOpts {
    /// Prefix every instruction with its address.
    pub print_addr: bool,
    /// The separator written between instructions.
    pub instr_sep: &'static str,
}

impl Default for DisasmOpts {
    fn default() -> Self {
        Self {
            print_addr: false,
            instr_sep: "\n",
        }
    }
}

/// Disassembles `bc` into a string.
#[must_use]
pub fn disassemble(bc: &[u8], opts: &DisasmOpts) -> String {
    let mut out = String::new();
    // Writing into a string cannot fail.
    let _ = write_disassembly(&mut out, bc, opts);
    out
}

/// Disassembles `bc` into `w`.
pub fn write_disassembly(
    w: &mut dyn fmt::Write,
    bc: &[u8],
    opts: &DisasmOpts,
) -> fmt::Result {
    let width = hex_width(bc.len());
    let mut decoder = Decoder::new(bc);
    let mut first = true;

    while decoder.pos() < bc.len() as u32 {
        let pos = decoder.pos();
        let cap = Capture::decode_at(&mut decoder, pos);
        if !first {
            w.write_str(opts.instr_sep)?;
        }
        first = false;
        write_instr(w, &cap, width, opts)?;
    }
    Ok(())
}

fn write_instr(
    w: &mut dyn fmt::Write,
    cap: &Capture,
    width: usize,
    opts: &DisasmOpts,
) -> fmt::Result {
    if opts.print_addr {
        write!(w, "{:>width$x}:  ", cap.start)?;
    }

    match Opcode::from_byte(cap.opcode) {
        Some(op) => w.write_str(mnemonic(op))?,
        None => write!(w, "[illop {:#04x}]", cap.opcode)?,
    }

    for imm in &cap.imms {
        write!(w, " {}", imm.value)?;
    }
    for vs in &cap.varspecs {
        write!(w, " {}({})", vs.kind.letter(), vs.idx)?;
    }
    if let Some(e) = &cap.error {
        write!(w, " [error: {e}]")?;
    }
    Ok(())
}

fn mnemonic(op: Opcode) -> &'static str {
    use Opcode as Op;
    match op {
        Op::Add => "binop +",
        Op::Sub => "binop -",
        Op::Mul => "binop *",
        Op::Div => "binop /",
        Op::Mod => "binop %",
        Op::Lt => "binop <",
        Op::Le => "binop <=",
        Op::Gt => "binop >",
        Op::Ge => "binop >=",
        Op::Eq => "binop ==",
        Op::Ne => "binop !=",
        Op::And => "binop &&",
        Op::Or => "binop !!",
        Op::Const => "const",
        Op::String => "string",
        Op::Sexp => "sexp",
        Op::Sti => "sti",
        Op::Sta => "sta",
        Op::Jmp => "jmp",
        Op::End => "end",
        Op::Ret => "ret",
        Op::Drop => "drop",
        Op::Dup => "dup",
        Op::Swap => "swap",
        Op::Elem => "elem",
        Op::LdG | Op::LdL | Op::LdA | Op::LdC => "ld",
        Op::LdaG | Op::LdaL | Op::LdaA | Op::LdaC => "lda",
        Op::StG | Op::StL | Op::StA | Op::StC => "st",
        Op::CjmpZ => "cjmpz",
        Op::CjmpNz => "cjmpnz",
        Op::Begin => "begin",
        Op::Cbegin => "cbegin",
        Op::Closure => "closure",
        Op::CallC => "callc",
        Op::Call => "call",
        Op::Tag => "tag",
        Op::Array => "array",
        Op::Fail => "fail",
        Op::Line => "line",
        Op::PattEqStr => "patt =str",
        Op::PattString => "patt #str",
        Op::PattArray => "patt #array",
        Op::PattSexp => "patt #sexp",
        Op::PattRef => "patt #ref",
        Op::PattVal => "patt #val",
        Op::PattFun => "patt #fun",
        Op::CallLread => "call Lread",
        Op::CallLwrite => "call Lwrite",
        Op::CallLlength => "call Llength",
        Op::CallLstring => "call Lstring",
        Op::CallBarray => "call Barray",
        Op::Eof => "<eof>",
    }
}

fn hex_width(len: usize) -> usize {
    let bits = usize::BITS - len.leading_zeros();
    (bits as usize).div_ceil(4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Asm;
    use crate::decode::VarKind;

    #[test]
    fn renders_a_simple_program() {
        let mut a = Asm::new();
        a.begin(2, 0);
        a.const_(42);
        a.lwrite();
        a.drop_();
        a.const_(0);
        a.end();
        let m = a.build("t", 0).unwrap();

        let text = disassemble(&m.bytecode, &DisasmOpts::default());
        assert_eq!(
            text,
            "begin 2 0\nconst 42\ncall Lwrite\ndrop\nconst 0\nend\n<eof>"
        );
    }

    #[test]
    fn renders_varspecs_with_kind_letters() {
        let mut a = Asm::new();
        a.begin(2, 1);
        a.const_(1);
        a.st(VarKind::Local, 0);
        a.drop_();
        a.ld(VarKind::Param, 1);
        a.end();
        let m = a.build("t", 0).unwrap();

        let text = disassemble(&m.bytecode, &DisasmOpts::default());
        assert!(text.contains("st L(0)"));
        assert!(text.contains("ld A(1)"));
    }

    #[test]
    fn stream_disassembly_equals_concatenated_instructions() {
        let mut a = Asm::new();
        let l = a.label();
        a.begin(2, 0);
        a.const_(5);
        a.cjmpz(l);
        a.const_(7);
        a.bind(l);
        a.const_(0);
        a.end();
        let m = a.build("t", 0).unwrap();

        let opts = DisasmOpts::default();
        let whole = disassemble(&m.bytecode, &opts);

        let mut concatenated = String::new();
        let mut decoder = Decoder::new(&m.bytecode);
        let mut addr = 0;
        while addr < m.bytecode.len() as u32 {
            let cap = Capture::decode_at(&mut decoder, addr);
            if addr != 0 {
                concatenated.push('\n');
            }
            concatenated.push_str(&disassemble(
                &m.bytecode[cap.start as usize..cap.end as usize],
                &opts,
            ));
            addr = cap.end;
        }

        assert_eq!(whole, concatenated);
    }

    #[test]
    fn renders_illegal_bytes_without_stopping() {
        let bc = [0x0e, Opcode::Drop as u8, 0xff];
        let text = disassemble(&bc, &DisasmOpts::default());
        assert!(text.contains("[illop 0x0e]"));
        assert!(text.contains("drop"));
        assert!(text.contains("<eof>"));
    }

    #[test]
    fn address_prefixes_are_width_aligned() {
        let mut a = Asm::new();
        a.begin(2, 0);
        a.const_(0);
        a.end();
        let m = a.build("t", 0).unwrap();

        let text = disassemble(
            &m.bytecode,
            &DisasmOpts {
                print_addr: true,
                instr_sep: "\n",
            },
        );
        let first = text.lines().next().unwrap();
        assert!(first.ends_with("begin 2 0"));
        assert!(first.trim_start().starts_with("0:"));
    }
}
