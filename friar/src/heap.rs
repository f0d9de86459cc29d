// Copyright 2026 the Friar Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The garbage-collected heap collaborator.
//!
//! The interpreter core does not implement collection; it targets an externally provided
//! precise collector whose entire contract is:
//!
//! - four allocation primitives ([`Heap::alloc_string`], [`Heap::alloc_array`],
//!   [`Heap::alloc_sexp`], [`Heap::alloc_closure`]),
//! - the object header queries ([`Heap::tag`], [`Heap::len`]),
//! - and the *virtual stack*: a contiguous word array whose live bounds the interpreter
//!   publishes through [`publish_stack_bounds`] so the collector can scan every root.
//!
//! This crate ships an arena-backed runtime with the same surface. Handles are stable for the
//! lifetime of the heap, which satisfies the discipline the real collector demands (values held
//! across an allocation must live on the observable stack) without making it load-bearing here.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::value::Value;

/// The object type tags, in the order the collector ABI fixes them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjTag {
    /// A mutable array of values.
    Array = 0,
    /// A mutable byte string.
    String = 1,
    /// An S-expression: an immutable tag plus mutable value fields.
    Sexp = 2,
    /// A closure: a small-integer entry address plus captured values.
    Closure = 3,
}

/// A stable reference to a heap object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjHandle(pub u32);

#[derive(Clone, Debug)]
enum Obj {
    Array { fields: Vec<usize> },
    String { bytes: Vec<u8> },
    Sexp { tag: u32, fields: Vec<usize> },
    Closure { fields: Vec<usize> },
}

/// The allocation arena.
///
/// Every [`ObjHandle`] passed to the accessors must originate from one of this heap's
/// allocation primitives; the interpreter maintains that invariant because the verifier has
/// already ruled out any other source of reference-tagged words.
#[derive(Clone, Debug, Default)]
pub struct Heap {
    objs: Vec<Obj>,
}

impl Heap {
    /// Creates an empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, obj: Obj) -> ObjHandle {
        let h = ObjHandle(u32::try_from(self.objs.len()).unwrap_or(u32::MAX));
        self.objs.push(obj);
        h
    }

    /// Allocates a string of `len` NUL bytes.
    pub fn alloc_string(&mut self, len: usize) -> ObjHandle {
        self.push(Obj::String {
            bytes: vec![0; len],
        })
    }

    /// Allocates a string initialized from `bytes`.
    pub fn alloc_string_from(&mut self, bytes: &[u8]) -> ObjHandle {
        self.push(Obj::String {
            bytes: bytes.to_vec(),
        })
    }

    /// Allocates an array of `n` zero-valued fields.
    pub fn alloc_array(&mut self, n: usize) -> ObjHandle {
        self.push(Obj::Array {
            fields: vec![Value::default().to_repr(); n],
        })
    }

    /// Allocates an S-expression with `n` zero-valued fields.
    ///
    /// `tag` is a stable reference to the constructor name: the byte offset of its
    /// NUL-terminated entry in the module string table, which outlives the heap.
    pub fn alloc_sexp(&mut self, tag: u32, n: usize) -> ObjHandle {
        self.push(Obj::Sexp {
            tag,
            fields: vec![Value::default().to_repr(); n],
        })
    }

    /// Allocates a closure with `n` zero-valued fields (entry address plus captures).
    pub fn alloc_closure(&mut self, n: usize) -> ObjHandle {
        self.push(Obj::Closure {
            fields: vec![Value::default().to_repr(); n],
        })
    }

    /// Returns the object's type tag.
    #[must_use]
    pub fn tag(&self, h: ObjHandle) -> ObjTag {
        match &self.objs[h.0 as usize] {
            Obj::Array { .. } => ObjTag::Array,
            Obj::String { .. } => ObjTag::String,
            Obj::Sexp { .. } => ObjTag::Sexp,
            Obj::Closure { .. } => ObjTag::Closure,
        }
    }

    /// Returns the object's length: the field count for arrays, sexps, and closures, and the
    /// byte length for strings.
    #[must_use]
    pub fn len(&self, h: ObjHandle) -> usize {
        match &self.objs[h.0 as usize] {
            Obj::Array { fields } | Obj::Sexp { fields, .. } | Obj::Closure { fields } => {
                fields.len()
            }
            Obj::String { bytes } => bytes.len(),
        }
    }

    /// Returns `true` if the heap has no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    /// Reads field `i` of an array, sexp, or closure.
    #[must_use]
    pub fn field(&self, h: ObjHandle, i: usize) -> Value {
        match &self.objs[h.0 as usize] {
            Obj::Array { fields } | Obj::Sexp { fields, .. } | Obj::Closure { fields } => {
                Value::from_repr(fields[i])
            }
            Obj::String { .. } => Value::default(),
        }
    }

    /// Writes field `i` of an array, sexp, or closure.
    pub fn set_field(&mut self, h: ObjHandle, i: usize, v: Value) {
        match &mut self.objs[h.0 as usize] {
            Obj::Array { fields } | Obj::Sexp { fields, .. } | Obj::Closure { fields } => {
                fields[i] = v.to_repr();
            }
            Obj::String { .. } => {}
        }
    }

    /// Returns a string object's bytes.
    #[must_use]
    pub fn bytes(&self, h: ObjHandle) -> &[u8] {
        match &self.objs[h.0 as usize] {
            Obj::String { bytes } => bytes,
            _ => &[],
        }
    }

    /// Returns a string object's bytes mutably.
    pub fn bytes_mut(&mut self, h: ObjHandle) -> &mut [u8] {
        match &mut self.objs[h.0 as usize] {
            Obj::String { bytes } => bytes,
            _ => &mut [],
        }
    }

    /// Returns the stable string-table reference stored as a sexp's tag.
    #[must_use]
    pub fn sexp_tag(&self, h: ObjHandle) -> u32 {
        match &self.objs[h.0 as usize] {
            Obj::Sexp { tag, .. } => *tag,
            _ => 0,
        }
    }
}

static STACK_TOP: AtomicUsize = AtomicUsize::new(0);
static STACK_BOTTOM: AtomicUsize = AtomicUsize::new(0);

/// Publishes the virtual-stack bounds for the collector.
///
/// `top` is the address of the first word of the stack buffer and `bottom` the address one past
/// the last live word; the collector scans `[top, bottom)`. The interpreter republishes after
/// every change to the live region and re-derives both addresses whenever the buffer is
/// resized, so the published pair is never stale across an allocation.
pub fn publish_stack_bounds(top: usize, bottom: usize) {
    STACK_TOP.store(top, Ordering::Relaxed);
    STACK_BOTTOM.store(bottom, Ordering::Relaxed);
}

/// Returns the published virtual-stack bounds `(top, bottom)`.
#[must_use]
pub fn stack_bounds() -> (usize, usize) {
    (
        STACK_TOP.load(Ordering::Relaxed),
        STACK_BOTTOM.load(Ordering::Relaxed),
    )
}

/// Initializes the collector. Called once before the first frame is entered.
pub fn init() {}

/// Tears down the collector. Called once after the outermost frame exits.
pub fn shutdown() {
    publish_stack_bounds(0, 0);
}
