//! Register-to-location resolution for frame scanning.

use crate::chunk::{SlotId, StackChunk};
use crate::config::METADATA_WORDS;

/// Machine registers tracked by a full window.
pub const NUM_REGISTERS: usize = 16;

/// Frame-pointer register id.
pub const FP: u8 = 5;

/// A virtual register as named by reference-map entries.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Register {
    /// A machine register, resolved through the active window.
    Reg(u8),
    /// A stack slot at a fixed slot-unit offset from the frame's
    /// unextended sp.
    Slot(u32),
}

/// Where callee-saved registers live for the frame under a cursor.
///
/// A `full` window tracks every register; transition stub frames populate
/// it from their save slots so the stub's caller can be materialized. A
/// `compact` window resolves only the frame pointer, statically, to the
/// saved-fp metadata slot below the frame's sp, and is never updated.
#[derive(Debug, Clone)]
pub struct RegisterWindow {
    saved: [Option<SlotId>; NUM_REGISTERS],
    update: bool,
}

impl RegisterWindow {
    #[must_use]
    pub fn full() -> Self {
        Self { saved: [None; NUM_REGISTERS], update: true }
    }

    #[must_use]
    pub fn compact() -> Self {
        Self { saved: [None; NUM_REGISTERS], update: false }
    }

    /// Whether stub frames fold their callee-save locations into this
    /// window.
    #[inline]
    #[must_use]
    pub fn updates(&self) -> bool {
        self.update
    }

    /// Resolve a machine register for the frame whose sp is `sp`.
    pub fn location(&self, chunk: &StackChunk, reg: u8, sp: usize) -> SlotId {
        assert!((reg as usize) < NUM_REGISTERS, "register r{reg} out of range");
        if let Some(slot) = self.saved[reg as usize] {
            return slot;
        }
        assert!(
            !self.update && reg == FP,
            "register r{reg} has no saved location (frame sp: {sp})"
        );
        chunk.slot_for_stack_word(sp - METADATA_WORDS)
    }

    pub fn record(&mut self, reg: u8, slot: SlotId) {
        assert!((reg as usize) < NUM_REGISTERS, "register r{reg} out of range");
        self.saved[reg as usize] = Some(slot);
    }
}
