// Copyright 2026 the Friar Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `friar`: a loader, static verifier, interpreter, disassembler, and idiom miner for Lama
//! bytecode.
//!
//! The pipeline is loader → decoder → verifier → {interpreter, idiom miner, disassembler}:
//! the event-stream [`decode::Decoder`] underlies every stage, and [`verifier::verify`] is a
//! hard precondition for running ([`vm::Interp`]) or mining ([`idiom::find_idioms`]) a module.
//! The disassembler needs only the decoder.
//!
//! ## Example
//!
//! ```no_run
//! use friar::asm::Asm;
//! use friar::verifier;
//! use friar::vm::{Console, ConsoleError, Interp};
//!
//! struct Stdout;
//!
//! impl Console for Stdout {
//!     fn read_int(&mut self) -> Result<isize, ConsoleError> {
//!         Err(ConsoleError::Eof)
//!     }
//!
//!     fn write_int(&mut self, value: isize) -> Result<(), ConsoleError> {
//!         println!("{value}");
//!         Ok(())
//!     }
//! }
//!
//! let mut a = Asm::new();
//! a.begin(2, 0);
//! a.const_(42);
//! a.lwrite();
//! a.drop_();
//! a.const_(0);
//! a.end();
//! let module = a.build("demo", 0)?;
//!
//! let info = verifier::verify(&module)?;
//! let mut console = Stdout;
//! Interp::new(&module, &info, &mut console).run()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![no_std]

extern crate alloc;

pub mod asm;
pub mod decode;
pub mod disasm;
pub mod heap;
pub mod idiom;
pub mod loader;
pub mod module;
pub mod opcode;
pub mod trace;
pub mod value;
pub mod verifier;
pub mod vm;
