//! Cursor over the frozen frames of one chunk.
//!
//! A stream is constructed against a chunk, advanced frame by frame toward
//! `end`, and discarded; it never outlives one scan. `MIXED` mirrors the
//! chunk's `has_mixed_frames` flag: a compiled-only stream never checks for
//! interpreted frames and never runs the deoptimization fixup.

use std::cell::RefCell;

use log::trace;

use crate::chunk::{SlotId, StackChunk};
use crate::config::METADATA_WORDS;
use crate::oracle::{CodeBlob, CodeOracle, FrameKind, Pc, RefKind, RefMap};
use crate::regmap::{Register, RegisterWindow};
use crate::scan::{DerivedRefVisitor, RefVisitor};

/// Interpreted frame words relative to the frame's sp, as frozen by the
/// interpreter: size, sp extension, reference count, then the references
/// themselves in reference-width slots.
pub(crate) const IFRAME_SIZE_WORD: usize = 0;
pub(crate) const IFRAME_EXTENSION_WORD: usize = 1;
pub(crate) const IFRAME_NUM_REFS_WORD: usize = 2;
pub(crate) const IFRAME_REFS_BASE_WORD: usize = 3;

/// A frame position already known to the caller, e.g. where a partial thaw
/// stopped.
#[derive(Debug, Copy, Clone)]
pub struct ChunkFrame {
    pub sp: usize,
    pub unextended_sp: usize,
}

pub struct FrameStream<'a, O: CodeOracle, const MIXED: bool> {
    chunk: &'a StackChunk,
    oracle: &'a O,
    sp: usize,
    /// Equals `sp` except on interpreted frames extended below their
    /// unextended sp.
    unextended_sp: usize,
    end: usize,
    blob: Option<CodeBlob>,
    /// Lazily resolved so deoptimized pcs can be fixed up first.
    map: RefCell<Option<RefMap>>,
    index: usize,
    has_stub: bool,
}

impl<'a, O: CodeOracle, const MIXED: bool> FrameStream<'a, O, MIXED> {
    /// Stream from the chunk's current sp.
    pub fn new(chunk: &'a StackChunk, oracle: &'a O) -> Self {
        Self::with_start(chunk, oracle, chunk.sp())
    }

    /// Stream from the collector-owned boundary snapshot instead of the
    /// mutator-owned sp; concurrent marking may lag a racing thaw.
    pub fn for_marking(chunk: &'a StackChunk, oracle: &'a O, current_cycle: u64) -> Self {
        Self::with_start(chunk, oracle, chunk.gc_safe_sp(current_cycle))
    }

    /// Stream positioned on an explicitly known live frame.
    pub fn from_frame(chunk: &'a StackChunk, oracle: &'a O, frame: ChunkFrame) -> Self {
        assert!(
            chunk.is_in_chunk(frame.sp),
            "frame sp {} outside chunk of {} words",
            frame.sp,
            chunk.capacity()
        );
        let mut stream = Self::raw(chunk, oracle, frame.sp);
        stream.unextended_sp = frame.unextended_sp;
        stream.init_cursor();
        stream
    }

    fn with_start(chunk: &'a StackChunk, oracle: &'a O, sp: usize) -> Self {
        let mut stream = Self::raw(chunk, oracle, sp);
        stream.init_cursor();
        if MIXED && stream.is_interpreted() {
            stream.unextended_sp = stream.interpreter_frame_unextended_sp();
        }
        stream
    }

    fn raw(chunk: &'a StackChunk, oracle: &'a O, sp: usize) -> Self {
        chunk.assert_is_stack_chunk();
        assert!(
            MIXED || !chunk.has_mixed_frames(),
            "mixed chunk walked by a compiled-only stream"
        );
        assert!(sp <= chunk.end(), "sp {} beyond chunk end {}", sp, chunk.end());
        Self {
            chunk,
            oracle,
            sp,
            unextended_sp: sp,
            end: chunk.end(),
            blob: None,
            map: RefCell::new(None),
            index: 0,
            has_stub: false,
        }
    }

    fn init_cursor(&mut self) {
        self.get_blob();
        if self.is_stub() {
            // stubs have a single map; no post-call lookup site exists
            self.load_map(self.pc(), Some(0));
            self.has_stub = true;
        }
    }

    // ---- cursor state ----

    #[inline]
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.sp >= self.end
    }

    #[inline]
    #[must_use]
    pub fn is_interpreted(&self) -> bool {
        MIXED && matches!(&self.blob, Some(b) if b.kind == FrameKind::Interpreted)
    }

    #[inline]
    #[must_use]
    pub fn is_compiled(&self) -> bool {
        matches!(&self.blob, Some(b) if b.kind == FrameKind::Compiled)
    }

    #[inline]
    #[must_use]
    pub fn is_stub(&self) -> bool {
        matches!(&self.blob, Some(b) if b.kind == FrameKind::Stub)
    }

    /// Return address of the frame under the cursor, stored one word below
    /// its sp.
    #[inline]
    #[must_use]
    pub fn pc(&self) -> Pc {
        debug_assert!(self.sp >= 1 && !self.is_done());
        self.chunk.read_word(self.sp - 1)
    }

    #[inline]
    #[must_use]
    pub fn sp(&self) -> usize {
        self.sp
    }

    #[inline]
    #[must_use]
    pub fn unextended_sp(&self) -> usize {
        self.unextended_sp
    }

    #[inline]
    #[must_use]
    pub fn end(&self) -> usize {
        self.end
    }

    /// Monotonically increasing frame counter, for diagnostics.
    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    #[must_use]
    pub fn chunk(&self) -> &StackChunk {
        self.chunk
    }

    #[must_use]
    pub fn blob(&self) -> Option<&CodeBlob> {
        self.blob.as_ref()
    }

    #[must_use]
    pub fn to_frame(&self) -> ChunkFrame {
        ChunkFrame { sp: self.sp, unextended_sp: self.unextended_sp }
    }

    fn expect_blob(&self) -> &CodeBlob {
        self.blob.as_ref().unwrap_or_else(|| {
            panic!(
                "frame {} at sp {} has no descriptor (end: {} chunk sp: {})",
                self.index,
                self.sp,
                self.end,
                self.chunk.sp()
            )
        })
    }

    // ---- frame geometry ----

    /// Size of the frame under the cursor in words.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        if self.is_interpreted() {
            self.interpreter_frame_size()
        } else {
            self.expect_blob().frame_size + self.stack_argsize()
        }
    }

    /// Outgoing stack-argument words of the frame's method.
    #[must_use]
    pub fn stack_argsize(&self) -> usize {
        if self.is_interpreted() || self.is_stub() {
            return 0;
        }
        self.expect_blob().arg_words
    }

    /// References the frame contributes to a scan.
    #[must_use]
    pub fn num_refs(&self) -> usize {
        if self.is_interpreted() {
            self.interpreter_frame_num_refs()
        } else {
            self.ref_map().num_oops()
        }
    }

    fn interpreter_frame_size(&self) -> usize {
        let size = self.chunk.read_word(self.sp + IFRAME_SIZE_WORD) as usize;
        debug_assert!(size > 0, "empty interpreted frame at sp {}", self.sp);
        size
    }

    fn interpreter_frame_unextended_sp(&self) -> usize {
        self.sp + self.chunk.read_word(self.sp + IFRAME_EXTENSION_WORD) as usize
    }

    fn interpreter_frame_num_refs(&self) -> usize {
        self.chunk.read_word(self.sp + IFRAME_NUM_REFS_WORD) as usize
    }

    /// Whether the word under `sp` begins an interpreted frame; probed
    /// before the descriptor cache is refreshed.
    fn pc_is_interpreted(&self) -> bool {
        MIXED
            && !self.is_done()
            && matches!(
                self.oracle.lookup(self.pc()),
                Some(CodeBlob { kind: FrameKind::Interpreted, .. })
            )
    }

    // ---- descriptor and map resolution ----

    fn get_blob(&mut self) {
        *self.map.borrow_mut() = None;
        if self.is_done() {
            self.blob = None;
            return;
        }
        let pc = self.pc();
        let blob = self.oracle.lookup(pc).unwrap_or_else(|| {
            panic!(
                "no descriptor for pc {:#x}: frame {} sp {} end {} size {} chunk sp {} gc mode {}",
                pc,
                self.index,
                self.sp,
                self.end,
                self.chunk.capacity(),
                self.chunk.sp(),
                self.chunk.is_gc_mode(),
            )
        });
        match blob.kind {
            FrameKind::Interpreted => assert!(
                MIXED,
                "interpreted frame in a compiled-only chunk: pc {pc:#x} frame {}",
                self.index
            ),
            _ => assert!(
                blob.frame_size > 0,
                "empty {:?} frame: pc {:#x} frame {} sp {}",
                blob.kind,
                pc,
                self.index,
                self.sp
            ),
        }
        self.blob = Some(blob);
    }

    fn load_map(&self, pc: Pc, slot_hint: Option<usize>) {
        let map = self.oracle.ref_map(pc, slot_hint).unwrap_or_else(|| {
            panic!(
                "no reference map for pc {:#x}: frame {} sp {} end {} chunk sp {}",
                pc,
                self.index,
                self.sp,
                self.end,
                self.chunk.sp()
            )
        });
        *self.map.borrow_mut() = Some(map);
    }

    /// Reference map of the frame under the cursor.
    #[must_use]
    pub fn ref_map(&self) -> RefMap {
        if let Some(map) = self.map.borrow().as_ref() {
            return map.clone();
        }
        debug_assert!(!self.is_interpreted());
        assert!(
            self.is_compiled(),
            "frame {} at sp {} has no reference map source",
            self.index,
            self.sp
        );
        self.load_map(self.pc(), self.oracle.map_slot(self.pc()));
        self.map.borrow().clone().expect("map just loaded")
    }

    /// The frame's pre-deoptimization return address, required to look up
    /// a valid reference map once the raw pc has been invalidated.
    #[must_use]
    pub fn orig_pc(&self) -> Pc {
        let pc = self.pc();
        if self.is_interpreted() || self.is_stub() || !self.oracle.is_deopt_pc(pc) {
            return pc;
        }
        let blob = self.expect_blob();
        let recovered = self.chunk.read_word(self.unextended_sp + blob.orig_pc_offset);
        assert!(
            recovered != 0 && !self.oracle.is_deopt_pc(recovered),
            "deoptimized pc {:#x} recovered to invalid pc {:#x}: frame {} sp {} end {} chunk sp {}",
            pc,
            recovered,
            self.index,
            self.sp,
            self.end,
            self.chunk.sp()
        );
        recovered
    }

    /// Fix up a missing reference map for a frame whose pc was invalidated
    /// by deoptimization after it was frozen.
    pub fn handle_deopted(&self) {
        assert!(!self.is_done(), "deopt fixup on a finished stream");
        if self.map.borrow().is_some() || self.is_interpreted() {
            return;
        }
        assert!(
            self.is_compiled(),
            "deopt fixup on non-compiled frame {} at sp {}",
            self.index,
            self.sp
        );
        let mut pc = self.pc();
        let mut slot = self.oracle.map_slot(pc);
        if slot.is_none() && self.oracle.is_deopt_pc(pc) {
            // the frame was marked for deoptimization while frozen
            pc = self.orig_pc();
            slot = self.oracle.map_slot(pc);
        }
        self.load_map(pc, slot);
    }

    // ---- advancing ----

    /// Move the cursor to the caller frame.
    pub fn next(&mut self, window: &mut RegisterWindow) {
        self.update_register_window(window);
        let was_stub = self.is_stub();
        if MIXED && self.is_interpreted() {
            self.sp += self.interpreter_frame_size();
        } else {
            self.sp = self.unextended_sp + self.expect_blob().frame_size;
        }
        // a sentinel slot sits at the chunk boundary
        if self.sp + METADATA_WORDS >= self.end {
            self.sp = self.end;
        }
        self.unextended_sp = if self.pc_is_interpreted() {
            self.interpreter_frame_unextended_sp()
        } else {
            self.sp
        };
        debug_assert!(self.unextended_sp >= self.sp);
        self.get_blob();
        if was_stub && !self.is_done() {
            // the stub's caller is reached through callee-saved registers;
            // no fast map slot covers this return address
            self.load_map(self.pc(), None);
        }
        self.index += 1;
        trace!(
            "frame stream advanced: index: {} sp: {} done: {}",
            self.index,
            self.sp,
            self.is_done()
        );
    }

    /// Fold the stub frame's callee-save locations into an updating
    /// window before leaving it.
    fn update_register_window(&self, window: &mut RegisterWindow) {
        if !window.updates() || !self.is_stub() {
            return;
        }
        let map = self.ref_map();
        for entry in map.stream() {
            if entry.kind != RefKind::CalleeSaved {
                continue;
            }
            let Some(Register::Reg(reg)) = entry.content_reg else {
                panic!(
                    "callee-saved entry without register identity in frame {}",
                    self.index
                );
            };
            let slot = self.reg_to_loc(entry.reg, window);
            window.record(reg, slot);
        }
    }

    // ---- locations and reference iteration ----

    /// Resolve a map register to a concrete chunk slot: saved-register
    /// slots go through the window, stack registers are fixed offsets from
    /// the unextended sp.
    #[must_use]
    pub fn reg_to_loc(&self, reg: Register, window: &RegisterWindow) -> SlotId {
        assert!(!self.is_done(), "register resolution on a finished stream");
        match reg {
            Register::Reg(r) => window.location(self.chunk, r, self.sp),
            Register::Slot(s) => {
                SlotId(self.chunk.slot_for_stack_word(self.unextended_sp).0 + s as usize)
            }
        }
    }

    /// Invoke `visitor` for every plain reference of the frame under the
    /// cursor.
    pub fn iterate_refs<V: RefVisitor + ?Sized>(&self, visitor: &mut V, window: &RegisterWindow) {
        let narrow = self.chunk.config().narrow_refs;
        if self.is_interpreted() {
            let count = self.interpreter_frame_num_refs();
            let first = self.chunk.slot_for_stack_word(self.sp + IFRAME_REFS_BASE_WORD);
            let stride = self.chunk.config().slots_per_ref();
            for i in 0..count {
                visitor.visit_ref(self.chunk, SlotId(first.0 + i * stride), narrow);
            }
            return;
        }
        let map = self.ref_map();
        let mut visited = 0usize;
        for entry in map.stream() {
            match entry.kind {
                RefKind::Oop | RefKind::NarrowOop => {}
                _ => continue,
            }
            debug_assert!(
                narrow || entry.kind == RefKind::Oop,
                "narrow map entry on a wide-reference heap: frame {}",
                self.index
            );
            visited += 1;
            let loc = self.reg_to_loc(entry.reg, window);
            debug_assert!(
                (self.has_stub && self.index == 1) || self.is_in_frame(loc),
                "reference slot {} outside frame {} (sp: {})",
                loc.0,
                self.index,
                self.sp
            );
            trace!(
                "visit ref: narrow: {} slot: {} sp offset: {}",
                entry.kind == RefKind::NarrowOop,
                loc.0,
                loc.0 as isize - self.chunk.slot_for_stack_word(self.sp).0 as isize
            );
            visitor.visit_ref(self.chunk, loc, entry.kind == RefKind::NarrowOop);
        }
        debug_assert_eq!(
            visited,
            map.num_oops(),
            "scanned reference count mismatch in frame {} at sp {}",
            self.index,
            self.sp
        );
    }

    /// Invoke `visitor` for every (base, interior-pointer) pair of the
    /// frame under the cursor, then fence so the recorded offsets are
    /// visible before any thread moves a base object.
    pub fn iterate_derived<V: DerivedRefVisitor + ?Sized>(
        &self,
        visitor: &mut V,
        window: &RegisterWindow,
    ) {
        if self.is_interpreted() {
            return;
        }
        let map = self.ref_map();
        for entry in map.stream() {
            if entry.kind != RefKind::Derived {
                continue;
            }
            let derived = self.reg_to_loc(entry.reg, window);
            let base_reg = entry.content_reg.unwrap_or_else(|| {
                panic!("derived entry without base register in frame {}", self.index)
            });
            let base = self.reg_to_loc(base_reg, window);
            assert_ne!(
                base, derived,
                "base and derived pointer share a slot in frame {}",
                self.index
            );
            debug_assert!((self.has_stub && self.index == 1) || self.is_in_frame(base));
            debug_assert!((self.has_stub && self.index == 1) || self.is_in_frame(derived));
            debug_assert!(
                self.is_in_oops(base, window),
                "derived base at slot {} is not a plain reference of frame {}",
                base.0,
                self.index
            );
            debug_assert!(
                !self.is_in_oops(derived, window),
                "derived slot {} doubles as a plain reference in frame {}",
                derived.0,
                self.index
            );
            visitor.visit_derived(self.chunk, base, derived);
        }
        // publish recorded offsets before any base object moves
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
    }

    fn is_in_frame(&self, slot: SlotId) -> bool {
        let Some(word) = self.chunk.stack_word_of_slot(slot) else {
            return false;
        };
        let lo = self.sp.saturating_sub(METADATA_WORDS);
        let hi = (self.unextended_sp + self.frame_size()).min(self.end);
        (lo..hi).contains(&word)
    }

    fn is_in_oops(&self, slot: SlotId, window: &RegisterWindow) -> bool {
        self.ref_map()
            .stream()
            .any(|e| e.kind == RefKind::Oop && self.reg_to_loc(e.reg, window) == slot)
    }
}
