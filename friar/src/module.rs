// Copyright 2026 the Friar Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The loaded-module model.
//!
//! A [`Module`] is immutable once loaded: the verifier, interpreter, disassembler, and idiom
//! miner all borrow it for the duration of their run.

use alloc::string::String;
use alloc::vec::Vec;

/// A public symbol declaration from the module's symbol table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Sym {
    /// The byte offset in the file where this entry was read, for diagnostics.
    pub offset: usize,
    /// An address in the bytecode section.
    pub address: u32,
    /// The name of the symbol, as an offset into the string table.
    pub name_offset: u32,
}

/// A Lama bytecode module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    /// The name of the module, used in diagnostics and backtraces.
    pub name: String,
    /// The number of module-wide mutable global slots.
    pub global_count: u32,
    /// The symbol table.
    pub symtab: Vec<Sym>,
    /// The string table: a concatenation of NUL-terminated strings.
    pub strtab: Vec<u8>,
    /// The program bytecode, including the trailing end-of-file marker.
    pub bytecode: Vec<u8>,
}

impl Module {
    /// Returns the NUL-terminated string starting at `offset` in the string table, without the
    /// terminator.
    ///
    /// Returns `None` if `offset` is out of bounds or the string is not NUL-terminated.
    #[must_use]
    pub fn strtab_entry(&self, offset: u32) -> Option<&[u8]> {
        let tail = self.strtab.get(offset as usize..)?;
        let nul = tail.iter().position(|&b| b == 0)?;
        Some(&tail[..nul])
    }

    /// Returns the string at `offset` rendered for display, replacing invalid UTF-8.
    #[must_use]
    pub fn strtab_display(&self, offset: u32) -> Option<String> {
        self.strtab_entry(offset)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;
    use alloc::vec;

    use super::Module;

    fn module_with_strtab(strtab: &[u8]) -> Module {
        Module {
            name: "test".to_string(),
            global_count: 0,
            symtab: vec![],
            strtab: strtab.to_vec(),
            bytecode: vec![0xff],
        }
    }

    #[test]
    fn strtab_entry_reads_nul_terminated_strings() {
        let m = module_with_strtab(b"foo\0barbaz\0");
        assert_eq!(m.strtab_entry(0), Some(b"foo".as_slice()));
        assert_eq!(m.strtab_entry(4), Some(b"barbaz".as_slice()));
        // Offsets may land mid-string.
        assert_eq!(m.strtab_entry(5), Some(b"arbaz".as_slice()));
    }

    #[test]
    fn strtab_entry_rejects_unterminated_and_out_of_bounds() {
        let m = module_with_strtab(b"foo\0tail");
        assert_eq!(m.strtab_entry(4), None);
        assert_eq!(m.strtab_entry(100), None);
    }
}
