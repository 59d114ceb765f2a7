use crate::control::DESTROY;
use crate::invariants::debug_assert_table_len;
use crate::segment::{LifeCycle, Segment};
use crossbeam_utils::CachePadded;
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};

/// Upper bound on live segments per region. Regions hold a handful of
/// segments in practice; a fixed slot array keeps indices stable without
/// ever relocating entries.
pub(crate) const TABLE_CAPACITY: usize = 512;

/// The segment table: an append-only slot array with tail-only reclamation.
///
/// `len` grows by relaxed fetch-add when a transaction allocates and shrinks
/// only during batch-commit, via CAS, one tail slot at a time. Slot pointers
/// are published with Release stores and read with Acquire loads, so a
/// looked-up segment is always fully initialized. Indices below `len` never
/// shift while any transaction is in flight.
#[derive(Debug)]
pub(crate) struct SegmentTable {
    slots: Box<[AtomicPtr<Segment>]>,
    len: CachePadded<AtomicUsize>,
}

impl SegmentTable {
    /// Build a table holding the region's initial segment in slot 0. That
    /// slot is never reclaimed.
    pub(crate) fn new(initial: Box<Segment>) -> Self {
        let slots: Box<[AtomicPtr<Segment>]> =
            (0..TABLE_CAPACITY).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        slots[0].store(Box::into_raw(initial), Ordering::Release);
        Self {
            slots,
            len: CachePadded::new(AtomicUsize::new(1)),
        }
    }

    /// Current slot count. Clamped: a concurrent over-capacity reservation
    /// may transiently push the raw counter past the slot array.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire).min(TABLE_CAPACITY)
    }

    /// The initial segment.
    #[inline]
    pub(crate) fn first(&self) -> &Segment {
        // SAFETY: slot 0 is populated at construction and never cleared.
        unsafe { &*self.slots[0].load(Ordering::Acquire) }
    }

    /// The segment in slot `i`, or `None` while a publication or a
    /// reclamation is in progress there.
    #[inline]
    pub(crate) fn get(&self, i: usize) -> Option<&Segment> {
        let seg = self.slots[i].load(Ordering::Acquire);
        if seg.is_null() {
            None
        } else {
            // SAFETY: non-null slots point at live boxed segments; segments
            // are only freed at quiescent points, when no caller holds a
            // reference obtained here.
            Some(unsafe { &*seg })
        }
    }

    /// Locate the segment whose readable copy contains `addr`.
    ///
    /// A segment pending destruction poisons the lookup: the caller treats
    /// "not found" as a conflict and rolls back.
    pub(crate) fn lookup(&self, addr: *const u8) -> Option<&Segment> {
        for i in 0..self.len() {
            let Some(seg) = self.get(i) else { continue };
            if seg.owner.load(Ordering::Acquire) == DESTROY {
                return None;
            }
            if seg.contains(addr) {
                return Some(seg);
            }
        }
        None
    }

    /// Append a freshly allocated segment and return its base address, or
    /// hand the segment back when every slot is taken.
    pub(crate) fn push(&self, seg: Box<Segment>) -> Result<*mut u8, Box<Segment>> {
        let index = self.len.fetch_add(1, Ordering::Relaxed);
        if index >= TABLE_CAPACITY {
            self.len.fetch_sub(1, Ordering::Relaxed);
            return Err(seg);
        }
        debug_assert_table_len!(index + 1);
        let addr = seg.readable();
        self.slots[index].store(Box::into_raw(seg), Ordering::Release);
        Ok(addr)
    }

    /// Promote the epoch's staged writes and reclaim deferred frees.
    ///
    /// Runs with no transaction in flight, under the batcher's ticket lock,
    /// exactly once per epoch that had writers. Iterates tail to head so
    /// that removals can shrink the table without disturbing live indices;
    /// a removal that is no longer at the tail is re-marked for a later
    /// epoch instead of leaving a hole.
    pub(crate) fn batch_commit(&self) {
        fence(Ordering::Acquire);
        for i in (0..self.len()).rev() {
            let raw = self.slots[i].load(Ordering::Acquire);
            if raw.is_null() {
                continue;
            }
            // SAFETY: non-null slots point at live boxed segments.
            let seg = unsafe { &*raw };

            let owner = seg.owner.load(Ordering::Relaxed);
            if owner == DESTROY || (owner != 0 && seg.state().is_removal()) {
                if self
                    .len
                    .compare_exchange(i + 1, i, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    self.slots[i].store(ptr::null_mut(), Ordering::Release);
                    // SAFETY: the pointer came from `Box::into_raw` and no
                    // transaction is in flight to reference the segment.
                    drop(unsafe { Box::from_raw(raw) });
                } else {
                    // A newer segment lives past this slot; reclaim it in a
                    // later epoch.
                    seg.owner.store(DESTROY, Ordering::Relaxed);
                    seg.set_state(LifeCycle::Default);
                }
            } else {
                seg.owner.store(0, Ordering::Relaxed);
                seg.set_state(LifeCycle::Default);
                seg.promote();
            }
        }
        fence(Ordering::Release);
    }
}

impl Drop for SegmentTable {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let raw = slot.swap(ptr::null_mut(), Ordering::Relaxed);
            if !raw.is_null() {
                // SAFETY: every non-null slot holds a `Box::into_raw`
                // pointer that nothing else frees.
                drop(unsafe { Box::from_raw(raw) });
            }
        }
    }
}
