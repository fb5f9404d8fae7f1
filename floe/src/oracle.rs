//! The frame descriptor oracle: per-pc metadata produced by the JIT and
//! interpreter, consumed read-only by frame streams and scanners.

use std::sync::Arc;

use crate::regmap::Register;

/// An opaque code address as frozen into a chunk's return-pc slots.
pub type Pc = u64;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Interpreted,
    Compiled,
    /// Transition stub (safepoint or runtime stub); saves callee registers
    /// whose locations fold into subsequent lookups.
    Stub,
}

/// Descriptor of the code owning one return address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlob {
    pub kind: FrameKind,
    /// Fixed frame size in words, without outgoing stack arguments.
    pub frame_size: usize,
    /// Outgoing stack-argument words declared by the compiled method.
    pub arg_words: usize,
    /// Word offset from unextended sp of the saved original pc, used to
    /// recover a reference map after deoptimization. Compiled only.
    pub orig_pc_offset: usize,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RefKind {
    /// Full-width reference.
    Oop,
    /// 32-bit reference; only valid on narrow-reference heaps.
    NarrowOop,
    /// Interior pointer; `content_reg` names the base.
    Derived,
    /// Saved callee register; `content_reg` names the register, `reg` its
    /// save slot. Skipped by reference scans.
    CalleeSaved,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RefMapEntry {
    pub kind: RefKind,
    pub reg: Register,
    /// Base register for `Derived`, register identity for `CalleeSaved`.
    pub content_reg: Option<Register>,
}

impl RefMapEntry {
    #[must_use]
    pub fn oop(reg: Register) -> Self {
        Self { kind: RefKind::Oop, reg, content_reg: None }
    }

    #[must_use]
    pub fn narrow_oop(reg: Register) -> Self {
        Self { kind: RefKind::NarrowOop, reg, content_reg: None }
    }

    #[must_use]
    pub fn derived(reg: Register, base: Register) -> Self {
        Self { kind: RefKind::Derived, reg, content_reg: Some(base) }
    }

    #[must_use]
    pub fn callee_saved(slot: Register, register: Register) -> Self {
        Self { kind: RefKind::CalleeSaved, reg: slot, content_reg: Some(register) }
    }
}

/// Per-pc table of reference locations: a finite, restartable entry
/// sequence. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RefMap {
    entries: Arc<[RefMapEntry]>,
    num_oops: usize,
}

impl RefMap {
    #[must_use]
    pub fn new(entries: Vec<RefMapEntry>) -> Self {
        let num_oops = entries
            .iter()
            .filter(|e| matches!(e.kind, RefKind::Oop | RefKind::NarrowOop))
            .count();
        Self { entries: entries.into(), num_oops }
    }

    /// Count of `Oop`/`NarrowOop` entries; a full frame scan must visit
    /// exactly this many references.
    #[inline]
    #[must_use]
    pub fn num_oops(&self) -> usize {
        self.num_oops
    }

    /// Restartable walk over the entries.
    pub fn stream(&self) -> impl Iterator<Item = &RefMapEntry> + '_ {
        self.entries.iter()
    }
}

/// Lookup service over the runtime's generated code. Implemented outside
/// this crate; answers are trusted, and an unresolvable non-terminal frame
/// is a fatal code-generation bug.
pub trait CodeOracle {
    /// Frame kind and size for a return address.
    fn lookup(&self, pc: Pc) -> Option<CodeBlob>;

    /// Fast map-slot lookup; `None` when the pc has no directly resolvable
    /// reference map (e.g. marked for deoptimization).
    fn map_slot(&self, pc: Pc) -> Option<usize>;

    /// Reference map for a pc, by fast slot when hinted, else by return
    /// address.
    fn ref_map(&self, pc: Pc, slot_hint: Option<usize>) -> Option<RefMap>;

    fn is_deopt_pc(&self, pc: Pc) -> bool;
}
