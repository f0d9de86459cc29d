// Copyright 2026 the Friar Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The byte-level module loader.
//!
//! File layout, all 32-bit fields little-endian:
//!
//! ```text
//! u32 strtab_size
//! u32 global_count
//! u32 symtab_entries
//! repeat symtab_entries: { u32 address; u32 name_offset }
//! byte[strtab_size]  strtab
//! byte[..]           bytecode   (the final byte must be the only 0xFF)
//! ```

use alloc::string::ToString;
use alloc::vec::Vec;
use core::fmt;

use crate::module::{Module, Sym};
use crate::opcode::Opcode;

/// A loading error, positioned at a byte offset in the file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadError {
    /// The byte offset in the file where the error occurred.
    pub offset: usize,
    /// The specific reason for the error.
    pub kind: LoadErrorKind,
}

/// The reason for a [`LoadError`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadErrorKind {
    /// The file ended before a field could be read in full.
    UnexpectedEof {
        /// The field being read.
        field: &'static str,
        /// How many more bytes were needed.
        missing: usize,
    },
    /// A size field was negative when read as a signed 32-bit integer.
    NegativeField {
        /// The field being read.
        field: &'static str,
        /// The signed value that was read.
        value: i32,
    },
    /// The bytecode section contains no end-of-file marker.
    NoEofMarker,
    /// An end-of-file marker appears before the final byte of the file.
    EarlyEofMarker,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LoadErrorKind::UnexpectedEof { field, missing } => write!(
                f,
                "encountered an unexpected end of file while parsing {field}: need {missing} more bytes"
            ),
            LoadErrorKind::NegativeField { field, value } => {
                write!(f, "{field} must not be negative (got {value})")
            }
            LoadErrorKind::NoEofMarker => {
                write!(f, "no end-of-file marker found in the bytecode section")
            }
            LoadErrorKind::EarlyEofMarker => write!(
                f,
                "the end-of-file marker in the bytecode section must be the final byte of the file"
            ),
        }
    }
}

impl core::error::Error for LoadError {}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, field: &'static str, len: usize) -> Result<&'a [u8], LoadError> {
        let Some(slice) = self.bytes.get(self.pos..).and_then(|tail| tail.get(..len)) else {
            return Err(LoadError {
                offset: self.bytes.len(),
                kind: LoadErrorKind::UnexpectedEof {
                    field,
                    missing: self.pos + len - self.bytes.len(),
                },
            });
        };
        self.pos += len;
        Ok(slice)
    }

    fn read_u32(&mut self, field: &'static str) -> Result<u32, LoadError> {
        let offset = self.pos;
        let b = self.take(field, 4)?;
        let value = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        if value < 0 {
            return Err(LoadError {
                offset,
                kind: LoadErrorKind::NegativeField { field, value },
            });
        }
        Ok(value.cast_unsigned())
    }
}

/// Loads a module named `name` from the raw file `bytes`.
pub fn load(name: &str, bytes: &[u8]) -> Result<Module, LoadError> {
    let mut r = Reader { bytes, pos: 0 };

    let strtab_size = r.read_u32("the string table size")? as usize;
    let global_count = r.read_u32("the global count")?;
    let symtab_entries = r.read_u32("the symbol table entry count")? as usize;

    let mut symtab = Vec::with_capacity(symtab_entries.min(1024));
    for _ in 0..symtab_entries {
        let offset = r.pos;
        let address = r.read_u32("a symbol table entry's address")?;
        let name_offset = r.read_u32("a symbol table entry's name")?;
        symtab.push(Sym {
            offset,
            address,
            name_offset,
        });
    }

    let strtab = r.take("the string table", strtab_size)?.to_vec();

    let bytecode_offset = r.pos;
    let bytecode = bytes[bytecode_offset..].to_vec();
    let Some(eof) = bytecode
        .iter()
        .position(|&b| b == Opcode::Eof as u8)
    else {
        return Err(LoadError {
            offset: bytes.len(),
            kind: LoadErrorKind::NoEofMarker,
        });
    };
    if eof != bytecode.len() - 1 {
        return Err(LoadError {
            offset: bytecode_offset + eof,
            kind: LoadErrorKind::EarlyEofMarker,
        });
    }

    Ok(Module {
        name: name.to_string(),
        global_count,
        symtab,
        strtab,
        bytecode,
    })
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    fn file(strtab: &[u8], globals: u32, syms: &[(u32, u32)], bytecode: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&u32::try_from(strtab.len()).unwrap().to_le_bytes());
        out.extend_from_slice(&globals.to_le_bytes());
        out.extend_from_slice(&u32::try_from(syms.len()).unwrap().to_le_bytes());
        for &(address, name) in syms {
            out.extend_from_slice(&address.to_le_bytes());
            out.extend_from_slice(&name.to_le_bytes());
        }
        out.extend_from_slice(strtab);
        out.extend_from_slice(bytecode);
        out
    }

    #[test]
    fn loads_a_well_formed_file() {
        let bytes = file(b"main\0", 3, &[(0, 0)], &[0x16, 0xff]);
        let m = load("m", &bytes).unwrap();

        assert_eq!(m.global_count, 3);
        assert_eq!(m.symtab.len(), 1);
        assert_eq!(m.symtab[0].address, 0);
        assert_eq!(m.strtab_entry(0), Some(b"main".as_slice()));
        assert_eq!(m.bytecode, [0x16, 0xff]);
    }

    #[test]
    fn rejects_truncated_headers() {
        let err = load("m", &[0x01, 0x00]).unwrap_err();
        assert!(matches!(
            err.kind,
            LoadErrorKind::UnexpectedEof { missing: 2, .. }
        ));
    }

    #[test]
    fn rejects_negative_size_fields() {
        let bytes = file(b"", 0, &[], &[0xff]);
        let mut bytes = bytes;
        bytes[0..4].copy_from_slice(&(-1i32).to_le_bytes());
        let err = load("m", &bytes).unwrap_err();
        assert_eq!(
            err.kind,
            LoadErrorKind::NegativeField {
                field: "the string table size",
                value: -1
            }
        );
        assert_eq!(err.offset, 0);
    }

    #[test]
    fn rejects_missing_and_early_eof_markers() {
        let bytes = file(b"", 0, &[], &[0x16, 0x16]);
        assert_eq!(
            load("m", &bytes).unwrap_err().kind,
            LoadErrorKind::NoEofMarker
        );

        let bytes = file(b"", 0, &[], &[0xff, 0x16]);
        let err = load("m", &bytes).unwrap_err();
        assert_eq!(err.kind, LoadErrorKind::EarlyEofMarker);
        assert_eq!(err.offset, 12);
    }

    #[test]
    fn a_lone_eof_marker_is_a_valid_bytecode_section() {
        let bytes = file(b"", 0, &[], &[0xff]);
        let m = load("m", &bytes).unwrap();
        assert_eq!(m.bytecode, [0xff]);
    }
}
