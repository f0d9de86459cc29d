// Copyright 2026 the Friar Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Optional execution tracing for the interpreter.
//!
//! Tracing is opt-in and `no_std` friendly: the interpreter only reports the events a sink's
//! [`TraceMask`] requests, and pays nothing when no sink is attached.

/// A set of trace events requested by a [`TraceSink`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TraceMask(u32);

impl TraceMask {
    /// No tracing.
    pub const NONE: Self = Self(0);
    /// Report every executed instruction.
    pub const INSTR: Self = Self(1 << 0);
    /// Report call-frame entry and exit.
    pub const CALL: Self = Self(1 << 1);

    /// Returns `true` if this mask includes all bits of `other`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for TraceMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// A trace event reported by the interpreter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    /// An instruction is about to execute.
    Instr {
        /// The instruction address.
        pc: u32,
        /// The raw opcode byte.
        opcode: u8,
        /// The live size of the virtual stack, in words.
        stack_size: usize,
    },
    /// A call frame was entered.
    FrameEnter {
        /// The callee's procedure address.
        proc_addr: u32,
        /// The frame depth after entering.
        depth: usize,
        /// The callee's argument count.
        args: u32,
        /// The callee's local count.
        locals: u32,
        /// `true` if the frame carries a closure.
        is_closure: bool,
    },
    /// A call frame is about to exit.
    FrameExit {
        /// The exiting frame's procedure address.
        proc_addr: u32,
        /// The frame depth before exiting.
        depth: usize,
    },
}

/// A consumer of interpreter trace events.
pub trait TraceSink {
    /// Returns the set of events the sink wants.
    fn mask(&self) -> TraceMask {
        TraceMask::NONE
    }

    /// Receives one trace event.
    fn event(&mut self, event: &TraceEvent);
}
