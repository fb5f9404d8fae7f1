//! Heap representation and collector-safe scanning for stack chunks:
//! contiguous heap snapshots of the call frames of a suspended lightweight
//! thread.
//!
//! A chunk's frames were produced by machine code, so the locations of the
//! object references inside them depend on the per-pc reference maps the
//! runtime's code cache hands out (the [`CodeOracle`]). A [`FrameStream`]
//! decodes frames one by one; a [`Scanner`] drives it (or the precomputed
//! per-slot bitmap) to enumerate every reference and interior pointer in
//! an order safe for concurrent relocation. Freeze and thaw themselves
//! live outside this crate and use the raw copy primitives and the
//! chunk's mutators.

mod bitmap;
mod chunk;
mod config;
mod copy;
mod layout;
mod oracle;
mod regmap;
mod scan;
mod stream;

#[cfg(test)]
mod fixtures;

pub use chunk::{ChunkFlags, SlotId, StackChunk};
pub use config::{
    BITS_PER_WORD, BYTES_PER_WORD, ChunkConfig, LOG_BITS_PER_WORD, LOG_BYTES_PER_WORD,
    METADATA_WORDS, OBJECT_ALIGN_WORDS, SLOTS_PER_WORD,
};
pub use copy::{copy_from_chunk_to_stack, copy_from_stack_to_chunk};
pub use layout::{
    CONT_WORD, HEADER_WORDS, MARK_WORD, PARENT_WORD, STACK_CHUNK_TYPE, TYPE_WORD,
    align_object_size, bit_offset, bitmap_bit_count, bitmap_size, instance_size,
};
pub use oracle::{CodeBlob, CodeOracle, FrameKind, Pc, RefKind, RefMap, RefMapEntry};
pub use regmap::{FP, NUM_REGISTERS, Register, RegisterWindow};
pub use scan::{DerivedRefVisitor, RefVisitor, Scanner};
pub use stream::{ChunkFrame, FrameStream};
