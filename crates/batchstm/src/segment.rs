use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Lifecycle of a segment within the current epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub(crate) enum LifeCycle {
    /// Committed before this epoch; kept unless a free commits.
    Default = 0,
    /// Freed this epoch; reclaimed at batch-commit.
    Removed = 1,
    /// Allocated this epoch; durable at batch-commit.
    Added = 2,
    /// Allocated and freed within the same epoch.
    AddedRemoved = 3,
}

impl LifeCycle {
    #[inline]
    pub(crate) fn from_raw(raw: usize) -> Self {
        match raw {
            1 => LifeCycle::Removed,
            2 => LifeCycle::Added,
            3 => LifeCycle::AddedRemoved,
            _ => LifeCycle::Default,
        }
    }

    /// Whether batch-commit should reclaim a segment in this state.
    #[inline]
    pub(crate) fn is_removal(self) -> bool {
        matches!(self, LifeCycle::Removed | LifeCycle::AddedRemoved)
    }
}

/// One shared-memory segment.
///
/// A single aligned allocation laid out as three consecutive areas:
///
/// ```text
/// +-------------------+-------------------+----------------------+
/// |  readable copy    |  writable copy    |  control array       |
/// |  (size bytes)     |  (size bytes)     |  (one atomic / word) |
/// +-------------------+-------------------+----------------------+
/// ```
///
/// The readable copy is the committed snapshot of the epoch and the address
/// range handed to callers. The writable copy stages in-flight writes at the
/// mirrored offset. One control word per `align_alloc`-byte word arbitrates
/// access; the array offset is rounded up to `usize` alignment so the
/// atomics stay aligned whatever alignment the caller declared.
#[derive(Debug)]
pub(crate) struct Segment {
    /// Base of the raw allocation (equals the readable copy).
    buf: NonNull<u8>,
    layout: Layout,
    /// Declared byte size of one copy.
    size: usize,
    /// Number of control words.
    words: usize,
    /// Transaction that allocated or freed this segment this epoch, or 0,
    /// or the destruction sentinel.
    pub(crate) owner: AtomicUsize,
    /// Raw [`LifeCycle`] value.
    state: AtomicUsize,
}

// SAFETY: the data copies are only touched through the control-word
// protocol or at quiescent points (batch-commit, region drop); everything
// else in the segment is atomic. No field is tied to a thread.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Allocate a zeroed segment. `size` must be positive; `align_alloc`
    /// must be a power of two at least as large as a pointer.
    pub(crate) fn new(size: usize, align_alloc: usize) -> Option<Segment> {
        debug_assert!(size > 0);
        debug_assert!(align_alloc >= size_of::<usize>());

        let words = size.div_ceil(align_alloc);
        let total = Self::control_offset(size) + words * size_of::<usize>();
        let layout = Layout::from_size_align(total, align_alloc).ok()?;

        // SAFETY: `total` is nonzero (size > 0).
        let raw = unsafe { alloc_zeroed(layout) };
        let buf = NonNull::new(raw)?;

        Some(Segment {
            buf,
            layout,
            size,
            words,
            owner: AtomicUsize::new(0),
            state: AtomicUsize::new(LifeCycle::Default as usize),
        })
    }

    /// Byte offset of the control array, rounded up so the atomics are
    /// aligned even when the declared alignment is smaller than a pointer.
    #[inline]
    fn control_offset(size: usize) -> usize {
        (2 * size).next_multiple_of(align_of::<AtomicUsize>())
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn words(&self) -> usize {
        self.words
    }

    /// Base of the readable copy; the segment's public address.
    #[inline]
    pub(crate) fn readable(&self) -> *mut u8 {
        self.buf.as_ptr()
    }

    /// Base of the writable (staging) copy.
    #[inline]
    pub(crate) fn writable(&self) -> *mut u8 {
        // SAFETY: the allocation is at least 2 * size bytes.
        unsafe { self.buf.as_ptr().add(self.size) }
    }

    /// The control array, one atomic per word.
    #[inline]
    pub(crate) fn controls(&self) -> &[AtomicUsize] {
        let offset = Self::control_offset(self.size);
        // SAFETY: the allocation extends `words` usizes past `offset`, the
        // offset is usize-aligned, and `AtomicUsize` has usize's layout.
        unsafe {
            std::slice::from_raw_parts(self.buf.as_ptr().add(offset).cast::<AtomicUsize>(), self.words)
        }
    }

    /// Whether `addr` lies inside the readable copy.
    #[inline]
    pub(crate) fn contains(&self, addr: *const u8) -> bool {
        let start = self.buf.as_ptr() as usize;
        let addr = addr as usize;
        addr >= start && addr < start + self.size
    }

    /// Byte offset of `addr` from the readable base. The caller has already
    /// established `contains(addr)`.
    #[inline]
    pub(crate) fn offset_of(&self, addr: *const u8) -> usize {
        addr as usize - self.buf.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn state(&self) -> LifeCycle {
        LifeCycle::from_raw(self.state.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: LifeCycle) {
        self.state.store(state as usize, Ordering::Relaxed);
    }

    /// Claim the owner slot for `tx`: free to take, or already ours.
    pub(crate) fn claim_owner(&self, tx: usize) -> bool {
        match self.owner.compare_exchange(0, tx, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => true,
            Err(current) => current == tx,
        }
    }

    /// Promote the staged writable copy onto the readable copy and clear
    /// every control word. Quiescent-only: called from batch-commit with no
    /// transaction in flight.
    pub(crate) fn promote(&self) {
        // SAFETY: both copies live inside this allocation and never overlap.
        unsafe {
            ptr::copy_nonoverlapping(self.writable() as *const u8, self.readable(), self.size);
        }
        for ctrl in self.controls() {
            ctrl.store(0, Ordering::Relaxed);
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: `buf` came from `alloc_zeroed` with this exact layout.
        unsafe { dealloc(self.buf.as_ptr(), self.layout) }
    }
}
