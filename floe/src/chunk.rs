//! The stack chunk heap object: a contiguous snapshot of frozen call
//! frames, plus the reference bitmap and scan-state markers the collector
//! relies on.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::config::{ChunkConfig, METADATA_WORDS, SLOTS_PER_WORD};
use crate::layout::{
    CONT_WORD, HEADER_WORDS, PARENT_WORD, STACK_CHUNK_TYPE, TYPE_WORD, bit_offset, bitmap_size,
    instance_size,
};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ChunkFlags: u8 {
        /// The chunk may contain interpreted frames.
        const HAS_MIXED_FRAMES = 1 << 0;
        /// The reference bitmap is populated and current.
        const HAS_BITMAP = 1 << 1;
        /// The chunk is being manipulated by the collector.
        const GC_MODE = 1 << 2;
        /// The chunk is visible to a concurrent collector and scans must
        /// go through the cycle-stamped boundary.
        const REQUIRES_BARRIERS = 1 << 3;
    }
}

/// Absolute index of a 32-bit slot within a chunk's storage. Wide
/// references occupy two consecutive slots starting at an even index;
/// narrow references occupy one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub usize);

impl SlotId {
    #[inline]
    #[must_use]
    pub fn of_word(word: usize) -> Self {
        Self(word * SLOTS_PER_WORD)
    }

    /// Storage word holding this slot.
    #[inline]
    #[must_use]
    pub fn word(self) -> usize {
        self.0 / SLOTS_PER_WORD
    }

    #[inline]
    #[must_use]
    pub fn is_word_aligned(self) -> bool {
        self.0 % SLOTS_PER_WORD == 0
    }
}

/// Heap object holding the frozen frames of one suspended lightweight
/// thread.
///
/// Storage is a single word array laid out as
/// `[header][stack words][bitmap][pad]`. The words are atomic because a
/// concurrent collector may relocate references in place while the mutator
/// thaws; no locks are taken anywhere, correctness rests on the ordering
/// discipline of the callers (`sp` only ever shrinks the frozen region,
/// store-store fences around reference publication).
pub struct StackChunk {
    config: ChunkConfig,
    capacity: usize,
    /// Word offset of the top frame; frames below are frozen.
    sp: AtomicUsize,
    /// Collector-owned boundary snapshot, valid for `mark_cycle`.
    gc_sp: AtomicUsize,
    mark_cycle: AtomicU64,
    flags: AtomicU8,
    storage: Box<[AtomicU64]>,
}

impl StackChunk {
    /// Allocate an empty chunk: `sp == end`, nothing frozen.
    #[must_use]
    pub fn new(capacity: usize, config: ChunkConfig) -> Self {
        assert!(
            capacity >= METADATA_WORDS,
            "chunk capacity {capacity} below frame metadata minimum"
        );
        let words = instance_size(capacity, &config);
        let storage: Box<[AtomicU64]> = (0..words).map(|_| AtomicU64::new(0)).collect();
        let chunk = Self {
            config,
            capacity,
            sp: AtomicUsize::new(capacity),
            gc_sp: AtomicUsize::new(capacity),
            mark_cycle: AtomicU64::new(0),
            flags: AtomicU8::new(ChunkFlags::empty().bits()),
            storage,
        };
        chunk.storage[TYPE_WORD].store(STACK_CHUNK_TYPE, Ordering::Relaxed);
        chunk
    }

    #[inline]
    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Stack-word capacity; also the `end` bound of the stack region.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// One past the last stack word, in region-relative words.
    #[inline]
    #[must_use]
    pub fn end(&self) -> usize {
        self.capacity
    }

    #[inline]
    #[must_use]
    pub fn is_stack_chunk(&self) -> bool {
        self.storage[TYPE_WORD].load(Ordering::Relaxed) == STACK_CHUNK_TYPE
    }

    #[inline]
    pub fn assert_is_stack_chunk(&self) {
        assert!(
            self.is_stack_chunk(),
            "not a stack chunk: type word {:#x}",
            self.storage[TYPE_WORD].load(Ordering::Relaxed)
        );
    }

    // ---- frozen boundary ----

    #[inline]
    #[must_use]
    pub fn sp(&self) -> usize {
        self.sp.load(Ordering::Acquire)
    }

    /// Move the frozen boundary. Freeze lowers it, thaw raises it toward
    /// `end`; only the mutator calls this.
    pub fn set_sp(&self, sp: usize) {
        assert!(sp <= self.capacity, "sp {sp} outside chunk of {} words", self.capacity);
        self.sp.store(sp, Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sp() == self.end()
    }

    #[inline]
    #[must_use]
    pub fn is_in_chunk(&self, word: usize) -> bool {
        word <= self.capacity
    }

    /// The frozen boundary a marking pass must use.
    ///
    /// A thaw racing a concurrent mark keeps moving the real `sp`; the
    /// collector instead reads the snapshot taken for its cycle. When the
    /// recorded cycle is stale the snapshot is re-derived from `sp` and
    /// stamped. The race is benign and idempotent: only the
    /// freeze-the-boundary transition matters and it is monotonic.
    pub fn gc_safe_sp(&self, current_cycle: u64) -> usize {
        let sp = self.sp();
        if !self.requires_barriers() {
            return sp;
        }
        let gc_sp = self.gc_sp.load(Ordering::Acquire);
        if gc_sp != sp {
            if self.mark_cycle.load(Ordering::Acquire) >> 1 == current_cycle >> 1 {
                debug_assert!(gc_sp <= sp, "gc boundary {gc_sp} above sp {sp}");
                return gc_sp;
            }
            self.gc_sp.store(sp, Ordering::Release);
            self.mark_cycle.store(current_cycle, Ordering::Release);
        }
        sp
    }

    // ---- flags ----

    #[inline]
    #[must_use]
    pub fn flags(&self) -> ChunkFlags {
        ChunkFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn set_flag(&self, flag: ChunkFlags, value: bool) {
        if value {
            self.flags.fetch_or(flag.bits(), Ordering::Release);
        } else {
            self.flags.fetch_and(!flag.bits(), Ordering::Release);
        }
    }

    #[inline]
    #[must_use]
    pub fn has_mixed_frames(&self) -> bool {
        self.flags().contains(ChunkFlags::HAS_MIXED_FRAMES)
    }

    pub fn set_has_mixed_frames(&self, value: bool) {
        self.set_flag(ChunkFlags::HAS_MIXED_FRAMES, value);
    }

    #[inline]
    #[must_use]
    pub fn has_bitmap(&self) -> bool {
        self.flags().contains(ChunkFlags::HAS_BITMAP)
    }

    pub(crate) fn set_has_bitmap(&self, value: bool) {
        debug_assert!(!value || self.config.enable_bitmaps);
        self.set_flag(ChunkFlags::HAS_BITMAP, value);
    }

    #[inline]
    #[must_use]
    pub fn is_gc_mode(&self) -> bool {
        self.flags().contains(ChunkFlags::GC_MODE)
    }

    pub fn set_gc_mode(&self, value: bool) {
        self.set_flag(ChunkFlags::GC_MODE, value);
    }

    #[inline]
    #[must_use]
    pub fn requires_barriers(&self) -> bool {
        self.flags().contains(ChunkFlags::REQUIRES_BARRIERS)
    }

    pub fn set_requires_barriers(&self, value: bool) {
        self.set_flag(ChunkFlags::REQUIRES_BARRIERS, value);
    }

    // ---- stack words ----

    /// Read a stack-region word.
    #[inline]
    #[must_use]
    pub fn read_word(&self, word: usize) -> u64 {
        debug_assert!(word < self.capacity, "word {word} outside stack region");
        self.storage[HEADER_WORDS + word].load(Ordering::Relaxed)
    }

    /// Write a stack-region word.
    #[inline]
    pub fn write_word(&self, word: usize, value: u64) {
        debug_assert!(word < self.capacity, "word {word} outside stack region");
        self.storage[HEADER_WORDS + word].store(value, Ordering::Relaxed);
    }

    pub(crate) fn read_words(&self, from_word: usize, dst: &mut [u64]) {
        assert!(
            from_word + dst.len() <= self.capacity,
            "read of {} words at {} overruns chunk of {} words",
            dst.len(),
            from_word,
            self.capacity
        );
        for (i, out) in dst.iter_mut().enumerate() {
            *out = self.storage[HEADER_WORDS + from_word + i].load(Ordering::Relaxed);
        }
    }

    pub(crate) fn write_words(&self, to_word: usize, src: &[u64]) {
        assert!(
            to_word + src.len() <= self.capacity,
            "write of {} words at {} overruns chunk of {} words",
            src.len(),
            to_word,
            self.capacity
        );
        for (i, value) in src.iter().copied().enumerate() {
            self.storage[HEADER_WORDS + to_word + i].store(value, Ordering::Relaxed);
        }
    }

    // ---- reference slots ----

    /// First slot of a stack-region word. `word == capacity` names the
    /// exclusive end of the region.
    #[inline]
    #[must_use]
    pub fn slot_for_stack_word(&self, word: usize) -> SlotId {
        debug_assert!(word <= self.capacity);
        SlotId::of_word(HEADER_WORDS + word)
    }

    /// Stack-region word of a slot, or None for header/bitmap slots.
    #[inline]
    #[must_use]
    pub fn stack_word_of_slot(&self, slot: SlotId) -> Option<usize> {
        let word = slot.word();
        (word >= HEADER_WORDS && word < HEADER_WORDS + self.capacity).then(|| word - HEADER_WORDS)
    }

    #[inline]
    #[must_use]
    pub fn parent_slot(&self) -> SlotId {
        SlotId::of_word(PARENT_WORD)
    }

    #[inline]
    #[must_use]
    pub fn cont_slot(&self) -> SlotId {
        SlotId::of_word(CONT_WORD)
    }

    /// Read the reference at `slot`. Narrow references are zero-extended.
    #[must_use]
    pub fn read_ref(&self, slot: SlotId, narrow: bool) -> u64 {
        let word = self.storage[slot.word()].load(Ordering::Relaxed);
        if narrow {
            if slot.is_word_aligned() { word & 0xFFFF_FFFF } else { word >> 32 }
        } else {
            debug_assert!(slot.is_word_aligned(), "wide reference at odd slot {}", slot.0);
            word
        }
    }

    /// Overwrite the reference at `slot`, e.g. with a relocated address.
    ///
    /// The narrow half-word update is a plain read-modify-write: the scan
    /// ordering discipline guarantees no second writer touches the word
    /// concurrently.
    pub fn write_ref(&self, slot: SlotId, narrow: bool, value: u64) {
        let cell = &self.storage[slot.word()];
        if narrow {
            assert!(value <= u64::from(u32::MAX), "narrow reference overflow: {value:#x}");
            let word = cell.load(Ordering::Relaxed);
            let word = if slot.is_word_aligned() {
                (word & !0xFFFF_FFFF) | value
            } else {
                (word & 0xFFFF_FFFF) | (value << 32)
            };
            cell.store(word, Ordering::Relaxed);
        } else {
            debug_assert!(slot.is_word_aligned(), "wide reference at odd slot {}", slot.0);
            cell.store(value, Ordering::Relaxed);
        }
    }

    #[inline]
    #[must_use]
    pub fn parent(&self) -> u64 {
        self.read_ref(self.parent_slot(), self.config.narrow_refs)
    }

    pub fn set_parent(&self, value: u64) {
        self.write_ref(self.parent_slot(), self.config.narrow_refs, value);
    }

    #[inline]
    #[must_use]
    pub fn cont(&self) -> u64 {
        self.read_ref(self.cont_slot(), self.config.narrow_refs)
    }

    pub fn set_cont(&self, value: u64) {
        self.write_ref(self.cont_slot(), self.config.narrow_refs, value);
    }

    // ---- bitmap ----

    pub(crate) fn bitmap_words(&self) -> &[AtomicU64] {
        let start = HEADER_WORDS + self.capacity;
        &self.storage[start..start + bitmap_size(self.capacity, &self.config)]
    }

    /// Bitmap bit covering the reference-sized slot at `slot`.
    #[must_use]
    pub fn bit_for_slot(&self, slot: SlotId) -> usize {
        let base = SlotId::of_word(HEADER_WORDS).0;
        debug_assert!(slot.0 >= base, "slot {} below stack region", slot.0);
        let rel = slot.0 - base;
        let stride = self.config.slots_per_ref();
        debug_assert!(rel % stride == 0, "slot {} not reference aligned", slot.0);
        bit_offset(self.capacity, &self.config) + rel / stride
    }

    /// Inverse of [`bit_for_slot`](Self::bit_for_slot).
    #[must_use]
    pub fn slot_for_bit(&self, bit: usize) -> SlotId {
        let rel = bit - bit_offset(self.capacity, &self.config);
        SlotId(SlotId::of_word(HEADER_WORDS).0 + rel * self.config.slots_per_ref())
    }

    pub(crate) fn set_bit_for_slot(&self, slot: SlotId) {
        crate::bitmap::set_bit(self.bitmap_words(), self.bit_for_slot(slot));
    }

    #[must_use]
    pub fn test_bit_for_slot(&self, slot: SlotId) -> bool {
        crate::bitmap::get_bit(self.bitmap_words(), self.bit_for_slot(slot))
    }

    /// Drop the bitmap when the chunk resumes mutation.
    pub fn clear_bitmap(&self) {
        self.set_has_bitmap(false);
        crate::bitmap::clear_all(self.bitmap_words());
    }
}

impl fmt::Debug for StackChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackChunk")
            .field("capacity", &self.capacity)
            .field("sp", &self.sp())
            .field("gc_sp", &self.gc_sp.load(Ordering::Relaxed))
            .field("flags", &self.flags())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wide() -> ChunkConfig {
        ChunkConfig {
            enable_bitmaps: true,
            narrow_refs: false,
        }
    }

    #[test]
    fn new_chunk_is_empty_and_tagged() {
        let chunk = StackChunk::new(32, ChunkConfig::default());
        assert!(chunk.is_stack_chunk());
        assert!(chunk.is_empty());
        assert_eq!(chunk.sp(), chunk.end());
        assert_eq!(chunk.flags(), ChunkFlags::empty());
    }

    #[test]
    #[should_panic(expected = "not a stack chunk")]
    fn corrupted_type_word_is_fatal() {
        let chunk = StackChunk::new(32, ChunkConfig::default());
        chunk.storage[TYPE_WORD].store(0xdead, Ordering::Relaxed);
        chunk.assert_is_stack_chunk();
    }

    #[test]
    #[should_panic(expected = "outside chunk")]
    fn sp_beyond_end_is_fatal() {
        let chunk = StackChunk::new(32, ChunkConfig::default());
        chunk.set_sp(33);
    }

    #[test]
    fn narrow_refs_pack_two_per_word() {
        let chunk = StackChunk::new(32, ChunkConfig::default());
        let lo = chunk.slot_for_stack_word(4);
        let hi = SlotId(lo.0 + 1);
        chunk.write_ref(lo, true, 0x1111_2222);
        chunk.write_ref(hi, true, 0x3333_4444);
        assert_eq!(chunk.read_ref(lo, true), 0x1111_2222);
        assert_eq!(chunk.read_ref(hi, true), 0x3333_4444);
        assert_eq!(chunk.read_word(4), 0x3333_4444_1111_2222);
    }

    #[test]
    fn wide_refs_use_whole_words() {
        let chunk = StackChunk::new(32, wide());
        let slot = chunk.slot_for_stack_word(7);
        chunk.write_ref(slot, false, 0xdead_beef_cafe_f00d);
        assert_eq!(chunk.read_ref(slot, false), 0xdead_beef_cafe_f00d);
        assert_eq!(chunk.read_word(7), 0xdead_beef_cafe_f00d);
    }

    #[test]
    fn header_refs_live_at_fixed_slots() {
        let chunk = StackChunk::new(32, wide());
        chunk.set_parent(0x100);
        chunk.set_cont(0x200);
        assert_eq!(chunk.parent(), 0x100);
        assert_eq!(chunk.cont(), 0x200);
        assert!(chunk.parent_slot() < chunk.cont_slot());
        assert!(chunk.cont_slot() < chunk.slot_for_stack_word(0));
    }

    #[test]
    fn bit_and_slot_mappings_invert() {
        for config in [ChunkConfig::default(), wide()] {
            let chunk = StackChunk::new(48, config);
            let stride = config.slots_per_ref();
            let first = chunk.slot_for_stack_word(0);
            for i in 0..48 * config.refs_per_word() {
                let slot = SlotId(first.0 + i * stride);
                assert_eq!(chunk.slot_for_bit(chunk.bit_for_slot(slot)), slot);
            }
        }
    }

    #[test]
    fn bitmap_bits_stick() {
        let chunk = StackChunk::new(64, ChunkConfig::default());
        let slot = chunk.slot_for_stack_word(10);
        assert!(!chunk.test_bit_for_slot(slot));
        chunk.set_bit_for_slot(slot);
        assert!(chunk.test_bit_for_slot(slot));
        chunk.clear_bitmap();
        assert!(!chunk.test_bit_for_slot(slot));
    }

    #[test]
    fn gc_safe_sp_tracks_cycle_staleness() {
        let chunk = StackChunk::new(64, ChunkConfig::default());
        chunk.set_requires_barriers(true);
        chunk.set_sp(40);
        // first observation stamps the boundary for cycle 4
        assert_eq!(chunk.gc_safe_sp(4), 40);
        // a thaw advances sp; the same cycle still sees the old boundary
        chunk.set_sp(48);
        assert_eq!(chunk.gc_safe_sp(4), 40);
        // a new cycle re-derives and re-stamps
        assert_eq!(chunk.gc_safe_sp(6), 48);
        chunk.set_sp(56);
        assert_eq!(chunk.gc_safe_sp(6), 48);
    }

    #[test]
    fn gc_safe_sp_without_barriers_is_plain_sp() {
        let chunk = StackChunk::new(64, ChunkConfig::default());
        chunk.set_sp(12);
        assert_eq!(chunk.gc_safe_sp(99), 12);
    }
}
