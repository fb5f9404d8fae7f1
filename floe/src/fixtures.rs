//! Shared test fixtures: a table-backed code oracle and a builder that
//! freezes synthetic frames into a chunk the way the runtime would.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use ahash::RandomState;

use crate::chunk::{SlotId, StackChunk};
use crate::config::{ChunkConfig, METADATA_WORDS, SLOTS_PER_WORD};
use crate::oracle::{CodeBlob, CodeOracle, FrameKind, Pc, RefMap, RefMapEntry};
use crate::regmap::Register;
use crate::scan::{DerivedRefVisitor, RefVisitor};
use crate::stream::{
    IFRAME_EXTENSION_WORD, IFRAME_NUM_REFS_WORD, IFRAME_REFS_BASE_WORD, IFRAME_SIZE_WORD,
};

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn narrow_config() -> ChunkConfig {
    ChunkConfig { enable_bitmaps: true, narrow_refs: true }
}

pub fn wide_config() -> ChunkConfig {
    ChunkConfig { enable_bitmaps: true, narrow_refs: false }
}

pub fn no_bitmap_config() -> ChunkConfig {
    ChunkConfig { enable_bitmaps: false, narrow_refs: false }
}

/// Code-cache stand-in: per-pc blobs, maps, fast map slots and the set of
/// deoptimized pcs. `deopt_probes` counts `is_deopt_pc` queries so tests
/// can verify the fixup path stayed cold.
#[derive(Default)]
pub struct TestOracle {
    blobs: HashMap<Pc, CodeBlob, RandomState>,
    maps: HashMap<Pc, RefMap, RandomState>,
    slots: HashMap<Pc, usize, RandomState>,
    deopt: HashSet<Pc, RandomState>,
    pub deopt_probes: AtomicUsize,
}

impl TestOracle {
    pub fn add_blob(&mut self, pc: Pc, blob: CodeBlob) {
        self.blobs.insert(pc, blob);
    }

    pub fn add_map(&mut self, pc: Pc, map: RefMap) {
        let slot = self.slots.len();
        self.slots.insert(pc, slot);
        self.maps.insert(pc, map);
    }

    pub fn mark_deopt(&mut self, pc: Pc) {
        self.deopt.insert(pc);
        self.slots.remove(&pc);
        self.maps.remove(&pc);
    }

    /// Flag the pc as deoptimized without dropping its map, so a scan that
    /// wrongly consults the fixup path would still observe the probe.
    pub fn mark_deopt_looking(&mut self, pc: Pc) {
        self.deopt.insert(pc);
    }

    pub fn probes(&self) -> usize {
        self.deopt_probes.load(Ordering::Relaxed)
    }
}

impl CodeOracle for TestOracle {
    fn lookup(&self, pc: Pc) -> Option<CodeBlob> {
        self.blobs.get(&pc).cloned()
    }

    fn map_slot(&self, pc: Pc) -> Option<usize> {
        self.slots.get(&pc).copied()
    }

    fn ref_map(&self, pc: Pc, _slot_hint: Option<usize>) -> Option<RefMap> {
        self.maps.get(&pc).cloned()
    }

    fn is_deopt_pc(&self, pc: Pc) -> bool {
        self.deopt_probes.fetch_add(1, Ordering::Relaxed);
        self.deopt.contains(&pc)
    }
}

/// Record of every reference callback, in visit order.
#[derive(Default)]
pub struct Collect {
    pub refs: Vec<(SlotId, bool)>,
}

impl RefVisitor for Collect {
    fn visit_ref(&mut self, _chunk: &StackChunk, slot: SlotId, narrow: bool) {
        self.refs.push((slot, narrow));
    }
}

/// Record of every (base, derived) callback, in visit order.
#[derive(Default)]
pub struct CollectDerived {
    pub pairs: Vec<(SlotId, SlotId)>,
}

impl DerivedRefVisitor for CollectDerived {
    fn visit_derived(&mut self, _chunk: &StackChunk, base: SlotId, derived: SlotId) {
        self.pairs.push((base, derived));
    }
}

pub struct Built {
    pub chunk: StackChunk,
    pub oracle: TestOracle,
}

/// Builds a chunk bottom-up: the first frame pushed becomes the oldest
/// (highest addresses), later pushes stack younger frames on top. Each
/// frame's return pc lands one word below its sp, exactly as freeze leaves
/// it.
pub struct ChunkBuilder {
    chunk: StackChunk,
    oracle: TestOracle,
    config: ChunkConfig,
    top: usize,
    mixed: bool,
}

impl ChunkBuilder {
    pub fn new(capacity: usize, config: ChunkConfig) -> Self {
        Self {
            chunk: StackChunk::new(capacity, config),
            oracle: TestOracle::default(),
            config,
            top: capacity,
            mixed: false,
        }
    }

    pub fn finish(self) -> Built {
        self.chunk.set_sp(self.top);
        if self.mixed {
            self.chunk.set_has_mixed_frames(true);
        }
        Built { chunk: self.chunk, oracle: self.oracle }
    }

    fn push_words(&mut self, words: usize) -> usize {
        assert!(
            words + METADATA_WORDS <= self.top,
            "frame of {words} words does not fit above word {}",
            self.top
        );
        self.top -= words;
        self.top
    }

    /// Write deterministic reference values at `sp + rel` for each rel word
    /// and return the matching map entries.
    fn write_refs(&mut self, sp: usize, ref_words: &[usize]) -> Vec<RefMapEntry> {
        ref_words
            .iter()
            .map(|&rel| {
                let reg = Register::Slot((rel * SLOTS_PER_WORD) as u32);
                let slot = self.chunk.slot_for_stack_word(sp + rel);
                let value = (((sp + rel) as u64) << 8) | 0xA5;
                self.chunk.write_ref(slot, self.config.narrow_refs, value);
                if self.config.narrow_refs {
                    RefMapEntry::narrow_oop(reg)
                } else {
                    RefMapEntry::oop(reg)
                }
            })
            .collect()
    }

    pub fn push_compiled(&mut self, pc: Pc, size: usize, ref_words: &[usize]) -> usize {
        self.push_raw_compiled(pc, size, size, ref_words)
    }

    /// Compiled frame whose declared size differs from the words it
    /// occupies, e.g. the bottom frame stopping short of the boundary
    /// sentinel.
    pub fn push_raw_compiled(
        &mut self,
        pc: Pc,
        declared: usize,
        occupied: usize,
        ref_words: &[usize],
    ) -> usize {
        let sp = self.push_words(occupied);
        self.chunk.write_word(sp - 1, pc);
        let entries = self.write_refs(sp, ref_words);
        self.oracle.add_blob(
            pc,
            CodeBlob { kind: FrameKind::Compiled, frame_size: declared, arg_words: 0, orig_pc_offset: 0 },
        );
        self.oracle.add_map(pc, RefMap::new(entries));
        sp
    }

    /// Compiled frame with outgoing stack arguments. The argument words
    /// overlap the caller's frame, so the caller must already be pushed.
    pub fn push_compiled_with_args(
        &mut self,
        pc: Pc,
        size: usize,
        arg_words: usize,
        ref_words: &[usize],
    ) -> usize {
        assert!(
            self.top < self.chunk.capacity(),
            "bottom frame cannot carry outgoing args"
        );
        let sp = self.push_words(size);
        self.chunk.write_word(sp - 1, pc);
        let entries = self.write_refs(sp, ref_words);
        self.oracle.add_blob(
            pc,
            CodeBlob { kind: FrameKind::Compiled, frame_size: size, arg_words, orig_pc_offset: 0 },
        );
        self.oracle.add_map(pc, RefMap::new(entries));
        sp
    }

    /// Compiled frame with a caller-supplied map; reference values are the
    /// caller's responsibility.
    pub fn push_compiled_with_map(&mut self, pc: Pc, size: usize, map: RefMap) -> usize {
        let sp = self.push_words(size);
        self.chunk.write_word(sp - 1, pc);
        self.oracle.add_blob(
            pc,
            CodeBlob { kind: FrameKind::Compiled, frame_size: size, arg_words: 0, orig_pc_offset: 0 },
        );
        self.oracle.add_map(pc, map);
        sp
    }

    /// Interpreted frame in the interpreter's freeze format: size word,
    /// extension word, reference count, then the references.
    pub fn push_interpreted(&mut self, pc: Pc, size: usize, refs: &[u64]) -> usize {
        let ref_words = refs.len().div_ceil(self.config.refs_per_word());
        assert!(
            IFRAME_REFS_BASE_WORD + ref_words + METADATA_WORDS <= size,
            "interpreted frame of {size} words cannot hold {} refs",
            refs.len()
        );
        let sp = self.push_words(size);
        self.chunk.write_word(sp - 1, pc);
        self.chunk.write_word(sp + IFRAME_SIZE_WORD, size as u64);
        self.chunk.write_word(sp + IFRAME_EXTENSION_WORD, 0);
        self.chunk.write_word(sp + IFRAME_NUM_REFS_WORD, refs.len() as u64);
        let first = self.chunk.slot_for_stack_word(sp + IFRAME_REFS_BASE_WORD);
        let stride = self.config.slots_per_ref();
        for (i, &value) in refs.iter().enumerate() {
            self.chunk
                .write_ref(SlotId(first.0 + i * stride), self.config.narrow_refs, value);
        }
        self.oracle.add_blob(
            pc,
            CodeBlob { kind: FrameKind::Interpreted, frame_size: 0, arg_words: 0, orig_pc_offset: 0 },
        );
        self.mixed = true;
        sp
    }

    /// Compiled frame frozen with a pc that was later invalidated by
    /// deoptimization; the original pc sits at `sp + orig_pc_offset` and
    /// only it resolves to a map.
    pub fn push_deoptimized(
        &mut self,
        raw_pc: Pc,
        orig_pc: Pc,
        size: usize,
        orig_pc_offset: usize,
        ref_words: &[usize],
    ) -> usize {
        let sp = self.push_words(size);
        self.chunk.write_word(sp - 1, raw_pc);
        self.chunk.write_word(sp + orig_pc_offset, orig_pc);
        let entries = self.write_refs(sp, ref_words);
        let blob =
            CodeBlob { kind: FrameKind::Compiled, frame_size: size, arg_words: 0, orig_pc_offset };
        self.oracle.add_blob(raw_pc, blob.clone());
        self.oracle.add_blob(orig_pc, blob);
        self.oracle.add_map(orig_pc, RefMap::new(entries));
        self.oracle.mark_deopt(raw_pc);
        sp
    }

    /// Transition stub frame saving the given registers at `sp + rel`.
    pub fn push_stub(&mut self, pc: Pc, size: usize, saves: &[(u8, usize)]) -> usize {
        let sp = self.push_words(size);
        self.chunk.write_word(sp - 1, pc);
        let entries = saves
            .iter()
            .map(|&(reg, rel)| {
                RefMapEntry::callee_saved(
                    Register::Slot((rel * SLOTS_PER_WORD) as u32),
                    Register::Reg(reg),
                )
            })
            .collect();
        self.oracle.add_blob(
            pc,
            CodeBlob { kind: FrameKind::Stub, frame_size: size, arg_words: 0, orig_pc_offset: 0 },
        );
        self.oracle.add_map(pc, RefMap::new(entries));
        sp
    }

    /// Raw slot write, for fixtures the push helpers do not cover.
    pub fn write_ref_at(&mut self, sp: usize, rel_word: usize, value: u64) -> SlotId {
        let slot = self.chunk.slot_for_stack_word(sp + rel_word);
        self.chunk.write_ref(slot, self.config.narrow_refs, value);
        slot
    }
}
