// Copyright 2026 the Friar Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A small bytecode assembler.
//!
//! [`Asm`] builds a [`Module`] directly, without a Lama compiler in the loop: tests, benches,
//! and embedders emit instructions through one method per opcode, reference code positions
//! through [`Label`]s (bound before or after use, patched at build time), and intern strings
//! into the module string table as they go.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;

use crate::decode::VarKind;
use crate::module::{Module, Sym};
use crate::opcode::Opcode;

/// A position in the instruction stream, patched into jump/call immediates at build time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Label(usize);

/// An assembly error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AsmError {
    /// A referenced label was never bound.
    UnboundLabel {
        /// The label's allocation index.
        index: usize,
    },
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnboundLabel { index } => write!(f, "label #{index} was never bound"),
        }
    }
}

impl core::error::Error for AsmError {}

/// A bytecode assembler.
#[derive(Clone, Debug, Default)]
pub struct Asm {
    code: Vec<u8>,
    strtab: Vec<u8>,
    interned: HashMap<String, u32>,
    labels: Vec<Option<u32>>,
    patches: Vec<(usize, usize)>,
    exports: Vec<(u32, usize)>,
}

impl Asm {
    /// Creates an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh, unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the current code position.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.here());
    }

    /// Returns the current code position.
    #[must_use]
    pub fn here(&self) -> u32 {
        u32::try_from(self.code.len()).unwrap_or(u32::MAX)
    }

    /// Exports the procedure at `label` under `name` in the symbol table.
    pub fn export(&mut self, name: &str, label: Label) {
        let name_offset = self.intern(name);
        self.exports.push((name_offset, label.0));
    }

    /// Interns `s` into the module string table and returns its offset.
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&offset) = self.interned.get(s) {
            return offset;
        }
        let offset = u32::try_from(self.strtab.len()).unwrap_or(u32::MAX);
        self.strtab.extend_from_slice(s.as_bytes());
        self.strtab.push(0);
        self.interned.insert(s.to_string(), offset);
        offset
    }

    fn emit_op(&mut self, op: Opcode) {
        self.code.push(op as u8);
    }

    fn emit_u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_label(&mut self, label: Label) {
        self.patches.push((self.code.len(), label.0));
        self.emit_u32(0);
    }

    fn emit_var(&mut self, base: u8, kind: VarKind, idx: u32) {
        self.code.push(base | var_kind_byte(kind));
        self.emit_u32(idx);
    }

    /// `BINOP +`.
    pub fn add(&mut self) {
        self.emit_op(Opcode::Add);
    }

    /// `BINOP -`.
    pub fn sub(&mut self) {
        self.emit_op(Opcode::Sub);
    }

    /// `BINOP *`.
    pub fn mul(&mut self) {
        self.emit_op(Opcode::Mul);
    }

    /// `BINOP /`.
    pub fn div(&mut self) {
        self.emit_op(Opcode::Div);
    }

    /// `BINOP %`.
    pub fn mod_(&mut self) {
        self.emit_op(Opcode::Mod);
    }

    /// `BINOP <`.
    pub fn lt(&mut self) {
        self.emit_op(Opcode::Lt);
    }

    /// `BINOP <=`.
    pub fn le(&mut self) {
        self.emit_op(Opcode::Le);
    }

    /// `BINOP >`.
    pub fn gt(&mut self) {
        self.emit_op(Opcode::Gt);
    }

    /// `BINOP >=`.
    pub fn ge(&mut self) {
        self.emit_op(Opcode::Ge);
    }

    /// `BINOP ==`.
    pub fn eq(&mut self) {
        self.emit_op(Opcode::Eq);
    }

    /// `BINOP !=`.
    pub fn ne(&mut self) {
        self.emit_op(Opcode::Ne);
    }

    /// `BINOP &&`.
    pub fn and_(&mut self) {
        self.emit_op(Opcode::And);
    }

    /// `BINOP !!`.
    pub fn or_(&mut self) {
        self.emit_op(Opcode::Or);
    }

    /// `CONST k`.
    pub fn const_(&mut self, k: i32) {
        self.emit_op(Opcode::Const);
        self.emit_u32(k.cast_unsigned());
    }

    /// `STRING s`, interning `s`.
    pub fn string(&mut self, s: &str) {
        let offset = self.intern(s);
        self.emit_op(Opcode::String);
        self.emit_u32(offset);
    }

    /// `SEXP tag n`, interning `tag`.
    pub fn sexp(&mut self, tag: &str, n: u32) {
        let offset = self.intern(tag);
        self.emit_op(Opcode::Sexp);
        self.emit_u32(offset);
        self.emit_u32(n);
    }

    /// `STI`.
    pub fn sti(&mut self) {
        self.emit_op(Opcode::Sti);
    }

    /// `STA`.
    pub fn sta(&mut self) {
        self.emit_op(Opcode::Sta);
    }

    /// `JMP l`.
    pub fn jmp(&mut self, l: Label) {
        self.emit_op(Opcode::Jmp);
        self.emit_label(l);
    }

    /// `END`.
    pub fn end(&mut self) {
        self.emit_op(Opcode::End);
    }

    /// `RET`.
    pub fn ret(&mut self) {
        self.emit_op(Opcode::Ret);
    }

    /// `DROP`.
    pub fn drop_(&mut self) {
        self.emit_op(Opcode::Drop);
    }

    /// `DUP`.
    pub fn dup(&mut self) {
        self.emit_op(Opcode::Dup);
    }

    /// `SWAP`.
    pub fn swap(&mut self) {
        self.emit_op(Opcode::Swap);
    }

    /// `ELEM`.
    pub fn elem(&mut self) {
        self.emit_op(Opcode::Elem);
    }

    /// `LD kind(idx)`.
    pub fn ld(&mut self, kind: VarKind, idx: u32) {
        self.emit_var(Opcode::LdG as u8, kind, idx);
    }

    /// `LDA kind(idx)`.
    pub fn lda(&mut self, kind: VarKind, idx: u32) {
        self.emit_var(Opcode::LdaG as u8, kind, idx);
    }

    /// `ST kind(idx)`.
    pub fn st(&mut self, kind: VarKind, idx: u32) {
        self.emit_var(Opcode::StG as u8, kind, idx);
    }

    /// `CJMPz l`.
    pub fn cjmpz(&mut self, l: Label) {
        self.emit_op(Opcode::CjmpZ);
        self.emit_label(l);
    }

    /// `CJMPnz l`.
    pub fn cjmpnz(&mut self, l: Label) {
        self.emit_op(Opcode::CjmpNz);
        self.emit_label(l);
    }

    /// `BEGIN params locals`.
    pub fn begin(&mut self, params: u32, locals: u32) {
        self.emit_op(Opcode::Begin);
        self.emit_u32(params);
        self.emit_u32(locals);
    }

    /// `CBEGIN params locals`.
    pub fn cbegin(&mut self, params: u32, locals: u32) {
        self.emit_op(Opcode::Cbegin);
        self.emit_u32(params);
        self.emit_u32(locals);
    }

    /// `CLOSURE l n V(m)...`.
    pub fn closure(&mut self, l: Label, captured: &[(VarKind, u32)]) {
        self.emit_op(Opcode::Closure);
        self.emit_label(l);
        self.emit_u32(u32::try_from(captured.len()).unwrap_or(u32::MAX));
        for &(kind, idx) in captured {
            self.code.push(var_kind_byte(kind));
            self.emit_u32(idx);
        }
    }

    /// `CALLC n`.
    pub fn callc(&mut self, n: u32) {
        self.emit_op(Opcode::CallC);
        self.emit_u32(n);
    }

    /// `CALL l n`.
    pub fn call(&mut self, l: Label, n: u32) {
        self.emit_op(Opcode::Call);
        self.emit_label(l);
        self.emit_u32(n);
    }

    /// `TAG tag n`, interning `tag`.
    pub fn tag(&mut self, tag: &str, n: u32) {
        let offset = self.intern(tag);
        self.emit_op(Opcode::Tag);
        self.emit_u32(offset);
        self.emit_u32(n);
    }

    /// `ARRAY n`.
    pub fn array(&mut self, n: u32) {
        self.emit_op(Opcode::Array);
        self.emit_u32(n);
    }

    /// `FAIL line col`.
    pub fn fail(&mut self, line: u32, col: u32) {
        self.emit_op(Opcode::Fail);
        self.emit_u32(line);
        self.emit_u32(col);
    }

    /// `LINE n`.
    pub fn line(&mut self, n: u32) {
        self.emit_op(Opcode::Line);
        self.emit_u32(n);
    }

    /// `PATT =str`.
    pub fn patt_eq_str(&mut self) {
        self.emit_op(Opcode::PattEqStr);
    }

    /// `PATT #string`.
    pub fn patt_string(&mut self) {
        self.emit_op(Opcode::PattString);
    }

    /// `PATT #array`.
    pub fn patt_array(&mut self) {
        self.emit_op(Opcode::PattArray);
    }

    /// `PATT #sexp`.
    pub fn patt_sexp(&mut self) {
        self.emit_op(Opcode::PattSexp);
    }

    /// `PATT #ref`.
    pub fn patt_ref(&mut self) {
        self.emit_op(Opcode::PattRef);
    }

    /// `PATT #val`.
    pub fn patt_val(&mut self) {
        self.emit_op(Opcode::PattVal);
    }

    /// `PATT #fun`.
    pub fn patt_fun(&mut self) {
        self.emit_op(Opcode::PattFun);
    }

    /// `CALL Lread`.
    pub fn lread(&mut self) {
        self.emit_op(Opcode::CallLread);
    }

    /// `CALL Lwrite`.
    pub fn lwrite(&mut self) {
        self.emit_op(Opcode::CallLwrite);
    }

    /// `CALL Llength`.
    pub fn llength(&mut self) {
        self.emit_op(Opcode::CallLlength);
    }

    /// `CALL Lstring`.
    pub fn lstring(&mut self) {
        self.emit_op(Opcode::CallLstring);
    }

    /// `CALL Barray n`.
    pub fn barray(&mut self, n: u32) {
        self.emit_op(Opcode::CallBarray);
        self.emit_u32(n);
    }

    /// Patches all label references, appends the end-of-file marker, and builds the module.
    pub fn build(mut self, name: &str, global_count: u32) -> Result<Module, AsmError> {
        for &(pos, index) in &self.patches {
            let target = self.labels[index].ok_or(AsmError::UnboundLabel { index })?;
            self.code[pos..pos + 4].copy_from_slice(&target.to_le_bytes());
        }
        self.code.push(Opcode::Eof as u8);

        let mut symtab = Vec::with_capacity(self.exports.len());
        for &(name_offset, index) in &self.exports {
            let address = self.labels[index].ok_or(AsmError::UnboundLabel { index })?;
            symtab.push(Sym {
                offset: 0,
                address,
                name_offset,
            });
        }

        Ok(Module {
            name: name.to_string(),
            global_count,
            symtab,
            strtab: self.strtab,
            bytecode: self.code,
        })
    }
}

fn var_kind_byte(kind: VarKind) -> u8 {
    match kind {
        VarKind::Global => 0,
        VarKind::Local => 1,
        VarKind::Param => 2,
        VarKind::Capture => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;

    #[test]
    fn emits_and_patches_forward_references() {
        let mut a = Asm::new();
        let l = a.label();
        a.begin(2, 0);
        a.const_(1);
        a.cjmpz(l);
        a.const_(0);
        a.bind(l);
        a.const_(0);
        a.end();
        let m = a.build("t", 0).unwrap();

        // begin(9) const(5) cjmpz(5) const(5) -> label binds at 24.
        let cjmpz_at = 9 + 5;
        assert_eq!(m.bytecode[cjmpz_at], Opcode::CjmpZ as u8);
        assert_eq!(
            m.bytecode[cjmpz_at + 1..cjmpz_at + 5],
            24u32.to_le_bytes()
        );
        assert_eq!(*m.bytecode.last().unwrap(), Opcode::Eof as u8);
    }

    #[test]
    fn interns_strings_once() {
        let mut a = Asm::new();
        a.begin(2, 0);
        a.string("hello");
        a.drop_();
        a.string("hello");
        a.drop_();
        a.string("bye");
        a.drop_();
        a.const_(0);
        a.end();
        let m = a.build("t", 0).unwrap();

        assert_eq!(m.strtab, b"hello\0bye\0");
        assert_eq!(m.strtab_entry(0), Some(b"hello".as_slice()));
        assert_eq!(m.strtab_entry(6), Some(b"bye".as_slice()));
    }

    #[test]
    fn build_rejects_unbound_labels() {
        let mut a = Asm::new();
        let l = a.label();
        a.begin(2, 0);
        a.jmp(l);
        assert_eq!(
            a.build("t", 0).unwrap_err(),
            AsmError::UnboundLabel { index: 0 }
        );
    }

    #[test]
    fn exports_resolve_to_bound_addresses() {
        let mut a = Asm::new();
        let main = a.label();
        let helper = a.label();
        a.bind(main);
        a.begin(2, 0);
        a.call(helper, 0);
        a.end();
        a.bind(helper);
        a.begin(0, 0);
        a.const_(0);
        a.end();
        a.export("main", main);
        a.export("helper", helper);
        let m = a.build("t", 0).unwrap();

        assert_eq!(m.symtab.len(), 2);
        assert_eq!(m.symtab[0].address, 0);
        // begin(9) + call(9) + end(1)
        assert_eq!(m.symtab[1].address, 19);
    }
}
