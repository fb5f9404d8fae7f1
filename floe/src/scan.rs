//! Whole-chunk reference and derived-pointer scanning.
//!
//! The collector drives a [`Scanner`] over one chunk. Stack references are
//! visited either through the precomputed bitmap (fast path) or by walking
//! frames and their reference maps (slow path); the header references
//! `parent` and `cont` always come last, `cont` strictly after `parent`,
//! each behind a store-store fence.

use std::ops::Range;
use std::sync::atomic::{Ordering, fence};

use log::{debug, trace};

use crate::bitmap;
use crate::chunk::{SlotId, StackChunk};
use crate::config::METADATA_WORDS;
use crate::oracle::CodeOracle;
use crate::regmap::RegisterWindow;
use crate::stream::FrameStream;

/// Invoked once per live reference location.
pub trait RefVisitor {
    fn visit_ref(&mut self, chunk: &StackChunk, slot: SlotId, narrow: bool);
}

/// Invoked once per (base, interior-pointer) pair; the recorded offset must
/// be applied before the base object moves.
pub trait DerivedRefVisitor {
    fn visit_derived(&mut self, chunk: &StackChunk, base: SlotId, derived: SlotId);
}

struct Bounded<'a, V: RefVisitor + ?Sized> {
    inner: &'a mut V,
    bounds: Range<SlotId>,
}

impl<V: RefVisitor + ?Sized> RefVisitor for Bounded<'_, V> {
    fn visit_ref(&mut self, chunk: &StackChunk, slot: SlotId, narrow: bool) {
        if self.bounds.contains(&slot) {
            self.inner.visit_ref(chunk, slot, narrow);
        }
    }
}

struct BitmapBuilder;

impl RefVisitor for BitmapBuilder {
    fn visit_ref(&mut self, chunk: &StackChunk, slot: SlotId, _narrow: bool) {
        chunk.set_bit_for_slot(slot);
    }
}

/// One scan over one chunk. Concurrent scanners carry the collector's
/// marking cycle so frame walks start from the cycle-stamped boundary
/// instead of the racing mutator's sp.
pub struct Scanner<'a, O: CodeOracle> {
    chunk: &'a StackChunk,
    oracle: &'a O,
    mark_cycle: Option<u64>,
}

impl<'a, O: CodeOracle> Scanner<'a, O> {
    pub fn new(chunk: &'a StackChunk, oracle: &'a O) -> Self {
        chunk.assert_is_stack_chunk();
        Self { chunk, oracle, mark_cycle: None }
    }

    pub fn concurrent(chunk: &'a StackChunk, oracle: &'a O, mark_cycle: u64) -> Self {
        chunk.assert_is_stack_chunk();
        Self { chunk, oracle, mark_cycle: Some(mark_cycle) }
    }

    /// The frozen boundary this scan walks from.
    fn boundary_sp(&self) -> usize {
        match self.mark_cycle {
            Some(cycle) => self.chunk.gc_safe_sp(cycle),
            None => self.chunk.sp(),
        }
    }

    /// Visit every live reference in the chunk exactly once: stack
    /// references, then `parent`, then `cont`.
    pub fn scan<V: RefVisitor>(&self, visitor: &mut V) {
        self.scan_stack(visitor, None, None);
        self.scan_header(visitor, None);
    }

    /// [`scan`](Self::scan) restricted to `bounds`; used for incremental
    /// (card or region granular) scans.
    pub fn scan_bounded<V: RefVisitor>(&self, visitor: &mut V, bounds: Range<SlotId>) {
        self.scan_stack(visitor, None, Some(&bounds));
        self.scan_header(visitor, Some(&bounds));
    }

    /// Scan for a relocating collector: each frame's derived pointers are
    /// recorded before its plain references. Always walks frames; the
    /// bitmap carries no derived-pointer information.
    pub fn scan_with_derived<V, D>(&self, visitor: &mut V, derived: &mut D)
    where
        V: RefVisitor,
        D: DerivedRefVisitor,
    {
        self.scan_stack_slow_dispatch(visitor, Some(derived), None);
        self.scan_header(visitor, None);
    }

    fn scan_header<V: RefVisitor>(&self, visitor: &mut V, bounds: Option<&Range<SlotId>>) {
        let narrow = self.chunk.config().narrow_refs;
        let in_bounds = |slot| bounds.is_none_or(|b| b.contains(&slot));
        let parent = self.chunk.parent_slot();
        if in_bounds(parent) {
            fence(Ordering::Release);
            visitor.visit_ref(self.chunk, parent, narrow);
        }
        let cont = self.chunk.cont_slot();
        if in_bounds(cont) {
            fence(Ordering::Release);
            // must stay the last reference visited
            visitor.visit_ref(self.chunk, cont, narrow);
        }
    }

    fn scan_stack<V: RefVisitor>(
        &self,
        visitor: &mut V,
        derived: Option<&mut dyn DerivedRefVisitor>,
        bounds: Option<&Range<SlotId>>,
    ) {
        if self.chunk.has_bitmap() && derived.is_none() {
            self.scan_stack_bitmap(visitor, bounds);
        } else {
            self.scan_stack_slow_dispatch(visitor, derived, bounds);
        }
    }

    fn scan_stack_bitmap<V: RefVisitor>(&self, visitor: &mut V, bounds: Option<&Range<SlotId>>) {
        trace!("bitmap scan: chunk sp: {} end: {}", self.chunk.sp(), self.chunk.end());
        let narrow = self.chunk.config().narrow_refs;
        // include the metadata slack below sp; those bits are never set
        let from_word = self.boundary_sp().saturating_sub(METADATA_WORDS);
        let mut lo = self.chunk.slot_for_stack_word(from_word);
        let mut hi = self.chunk.slot_for_stack_word(self.chunk.end());
        if let Some(b) = bounds {
            lo = lo.max(b.start);
            hi = hi.min(b.end);
        }
        if lo >= hi {
            return;
        }
        bitmap::for_each_set_bit(
            self.chunk.bitmap_words(),
            self.chunk.bit_for_slot(lo)..self.chunk.bit_for_slot(hi),
            |bit| {
                visitor.visit_ref(self.chunk, self.chunk.slot_for_bit(bit), narrow);
                true
            },
        );
    }

    fn scan_stack_slow_dispatch<V: RefVisitor>(
        &self,
        visitor: &mut V,
        derived: Option<&mut dyn DerivedRefVisitor>,
        bounds: Option<&Range<SlotId>>,
    ) {
        if self.chunk.has_mixed_frames() {
            self.scan_stack_slow::<true, V>(visitor, derived, bounds);
        } else {
            self.scan_stack_slow::<false, V>(visitor, derived, bounds);
        }
    }

    fn scan_stack_slow<const MIXED: bool, V: RefVisitor>(
        &self,
        visitor: &mut V,
        mut derived: Option<&mut dyn DerivedRefVisitor>,
        bounds: Option<&Range<SlotId>>,
    ) {
        trace!("frame scan: chunk sp: {} end: {}", self.chunk.sp(), self.chunk.end());
        self.iterate_frames::<MIXED, _>(|stream, window| {
            if let Some(d) = derived.as_deref_mut() {
                // record offsets before the oop pass can move any base
                stream.iterate_derived(d, window);
            }
            match bounds {
                Some(b) => {
                    let mut bounded = Bounded { inner: &mut *visitor, bounds: b.clone() };
                    stream.iterate_refs(&mut bounded, window);
                }
                None => stream.iterate_refs(&mut *visitor, window),
            }
            true
        });
    }

    /// Generic frame walk; the closure returns false to halt early.
    ///
    /// A transition stub under the initial cursor is special: its caller is
    /// reached through callee-saved registers, so a full window is
    /// synthesized, the stub is stepped over to materialize the caller, and
    /// only then does the walk continue with the compact window.
    pub fn iterate_frames<const MIXED: bool, F>(&self, mut f: F)
    where
        F: FnMut(&FrameStream<'_, O, MIXED>, &RegisterWindow) -> bool,
    {
        let mut window = RegisterWindow::compact();
        let mut stream = match self.mark_cycle {
            Some(cycle) => FrameStream::<O, MIXED>::for_marking(self.chunk, self.oracle, cycle),
            None => FrameStream::<O, MIXED>::new(self.chunk, self.oracle),
        };
        let mut should_continue = true;
        if stream.is_stub() {
            let mut full = RegisterWindow::full();
            stream.next(&mut full);
            assert!(!stream.is_done(), "stub frame with no caller");
            assert!(
                stream.is_compiled(),
                "stub caller is not compiled: frame {}",
                stream.index()
            );
            should_continue = f(&stream, &full);
            stream.next(&mut window);
        }
        debug_assert!(!stream.is_stub(), "consecutive stub frames");
        while should_continue && !stream.is_done() {
            if MIXED {
                // frames can be frozen after being marked for deoptimization
                stream.handle_deopted();
            }
            should_continue = f(&stream, &window);
            stream.next(&mut window);
        }
    }

    /// Populate the chunk's reference bitmap from a frame walk and publish
    /// it for fast-path scanning. Called once the chunk has stabilized.
    pub fn build_bitmap(&self) {
        assert!(
            self.chunk.config().enable_bitmaps,
            "bitmaps disabled by configuration"
        );
        self.chunk.clear_bitmap();
        let mut builder = BitmapBuilder;
        self.scan_stack_slow_dispatch(&mut builder, None, None);
        self.chunk.set_has_bitmap(true);
        debug!(
            "bitmap built: chunk sp: {} end: {} mixed: {}",
            self.chunk.sp(),
            self.chunk.end(),
            self.chunk.has_mixed_frames()
        );
    }
}
