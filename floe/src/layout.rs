//! Pure size and offset computations for the chunk heap object.
//!
//! A chunk is laid out as `[header][stack words][bitmap][alignment pad]`.
//! The bitmap is packed back to front: its *last* used bit lands exactly on
//! a word boundary and `bit_offset` is the unused padding at the front.
//! External bitmap consumers assume this packing; it must be preserved bit
//! for bit.

use crate::config::{BITS_PER_WORD, ChunkConfig, LOG_BITS_PER_WORD, OBJECT_ALIGN_WORDS};

/// Fixed header words preceding the stack region.
pub const HEADER_WORDS: usize = 4;

/// Mark word, opaque to this crate.
pub const MARK_WORD: usize = 0;
/// Type-descriptor word; must hold [`STACK_CHUNK_TYPE`].
pub const TYPE_WORD: usize = 1;
/// Back-reference to the next-older chunk of the same continuation.
pub const PARENT_WORD: usize = 2;
/// Back-reference to the owning continuation; scanned last.
pub const CONT_WORD: usize = 3;

/// Value of the type-descriptor word identifying a stack chunk.
pub const STACK_CHUNK_TYPE: u64 = 0x5354_4b43_484e_4b00;

/// Round a size in words up to the object alignment granularity.
#[inline]
#[must_use]
pub fn align_object_size(words: usize) -> usize {
    (words + OBJECT_ALIGN_WORDS - 1) & !(OBJECT_ALIGN_WORDS - 1)
}

/// Total heap size in words of a chunk with `stack_words` of capacity.
#[inline]
#[must_use]
pub fn instance_size(stack_words: usize, config: &ChunkConfig) -> usize {
    align_object_size(HEADER_WORDS + stack_words + bitmap_size(stack_words, config))
}

/// Bits the bitmap covers: one per reference-sized slot of the stack region.
#[inline]
#[must_use]
pub fn bitmap_bit_count(stack_words: usize, config: &ChunkConfig) -> usize {
    stack_words * config.refs_per_word()
}

/// Bitmap size in words, zero when bitmaps are disabled.
#[must_use]
pub fn bitmap_size(stack_words: usize, config: &ChunkConfig) -> usize {
    if !config.enable_bitmaps {
        return 0;
    }
    let bits = bitmap_bit_count(stack_words, config);
    let mask = BITS_PER_WORD - 1;
    let words = (bits >> LOG_BITS_PER_WORD) + usize::from(bits & mask != 0);
    debug_assert_eq!(
        bits + bit_offset(stack_words, config),
        words << LOG_BITS_PER_WORD,
        "bitmap packing broken: bits: {} bit_offset: {} words: {}",
        bits,
        bit_offset(stack_words, config),
        words,
    );
    words
}

/// Front padding in bits so the last used bitmap bit aligns to a word
/// boundary.
#[inline]
#[must_use]
pub fn bit_offset(stack_words: usize, config: &ChunkConfig) -> usize {
    let mask = BITS_PER_WORD - 1;
    (BITS_PER_WORD - (bitmap_bit_count(stack_words, config) & mask)) & mask
}
