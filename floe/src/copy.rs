//! Word-granularity copies between a live stack region and a chunk.
//!
//! Freeze and thaw move frame bytes with these two primitives; both
//! directions share one flat copy. `DWORD_ALIGNED` is reserved for an
//! alignment-specialized fast path: callers that guarantee two-word
//! alignment instantiate it with `true`, but today both instantiations
//! perform the identical generic copy.

use log::trace;

use crate::chunk::StackChunk;

/// Copy `from` into the chunk's stack region at `to_word` (freeze).
pub fn copy_from_stack_to_chunk<const DWORD_ALIGNED: bool>(
    from: &[u64],
    chunk: &StackChunk,
    to_word: usize,
) {
    if DWORD_ALIGNED {
        // one word for the return address, another for the fp spill
        debug_assert!(from.len() >= 2);
        debug_assert!(to_word % 2 == 0, "unaligned chunk offset {to_word}");
    }
    trace!("freeze copy: {} words to chunk word {}", from.len(), to_word);
    chunk.write_words(to_word, from);
}

/// Copy the chunk's stack region at `from_word` into `to` (thaw).
pub fn copy_from_chunk_to_stack<const DWORD_ALIGNED: bool>(
    chunk: &StackChunk,
    from_word: usize,
    to: &mut [u64],
) {
    if DWORD_ALIGNED {
        debug_assert!(to.len() >= 2);
        debug_assert!(from_word % 2 == 0, "unaligned chunk offset {from_word}");
    }
    trace!("thaw copy: {} words from chunk word {}", to.len(), from_word);
    chunk.read_words(from_word, to);
}
