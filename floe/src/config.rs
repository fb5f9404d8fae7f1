//! Word geometry and the per-heap configuration switches.

pub const BYTES_PER_WORD: usize = 8;
pub const LOG_BYTES_PER_WORD: usize = 3;
pub const BITS_PER_WORD: usize = 64;
pub const LOG_BITS_PER_WORD: usize = 6;

/// 32-bit VM stack slots per machine word. Reference maps address stack
/// content in slot units.
pub const SLOTS_PER_WORD: usize = 2;

/// Words of frame metadata sitting below each frame's sp: the return pc
/// and the saved frame pointer.
pub const METADATA_WORDS: usize = 2;

/// Heap object alignment granularity in words.
pub const OBJECT_ALIGN_WORDS: usize = 2;

/// Per-heap switches, fixed at heap creation and threaded explicitly into
/// layout computations, chunk construction and scanners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Build per-slot reference bitmaps for stabilized chunks. When false
    /// every scan takes the per-frame map path.
    pub enable_bitmaps: bool,
    /// Narrow (32-bit) reference representation; two references per word.
    pub narrow_refs: bool,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            enable_bitmaps: true,
            narrow_refs: true,
        }
    }
}

impl ChunkConfig {
    /// References per machine word at the configured width.
    #[inline]
    #[must_use]
    pub fn refs_per_word(&self) -> usize {
        if self.narrow_refs { 2 } else { 1 }
    }

    /// Slot-unit stride of one reference.
    #[inline]
    #[must_use]
    pub fn slots_per_ref(&self) -> usize {
        if self.narrow_refs { 1 } else { SLOTS_PER_WORD }
    }
}
