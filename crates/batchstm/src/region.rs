use crate::batcher::Batcher;
use crate::control::{Tx, DESTROY, MULTI_READER};
use crate::error::{AllocError, RegionError};
use crate::invariants::debug_assert_word_range;
use crate::segment::{LifeCycle, Segment};
use crate::table::SegmentTable;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

// =============================================================================
// WORD PROTOCOL & SNAPSHOT VISIBILITY
// =============================================================================
//
// Each word's control arbitrates all access within one epoch:
//
// **Write path** (`lock_words`): CAS `0 -> tx` claims a free word; an
// existing `tx` is re-entry; CAS `read_mark(tx) -> tx` upgrades this
// transaction's own read mark. Anything else is a conflict: the locked
// prefix is released and the transaction rolls back. Only after the whole
// range is locked do the bytes land, in the writable copy at the mirrored
// offset. The readable copy is never written mid-epoch.
//
// **Read path** (write transactions): `control == tx` serves the word from
// the writable copy (read-my-writes). Otherwise the word is read-marked:
// CAS `0 -> read_mark(tx)`, or accept an existing own mark or MULTI_READER,
// or demote another transaction's mark (any value above MULTI_READER) to
// MULTI_READER. A word locked by another writer aborts the reader.
//
// **Read-only transactions** copy straight from the readable half and leave
// no trace. That is sound because writers stage into the writable half and
// promotion to the readable half happens only in batch-commit, when
// `nb_entered == 0`: nobody ever observes a half-promoted snapshot.
//
// **Cross-epoch ordering**: batch-commit runs bracketed by Acquire/Release
// fences while holding the batcher's ticket lock; the next epoch's
// participants acquire through the lock (or the epoch-wait fence), so every
// read of epoch N+1 sees all promotions of epoch N.
//
// =============================================================================

/// A shared memory region driven by batched transactions.
///
/// The region is the unit of ownership: all mutable state lives behind it,
/// and it is passed (by reference) to every operation. It can be shared
/// across threads freely; the word protocol and the batcher carry all
/// synchronization.
///
/// # Example
///
/// ```
/// use batchstm::Region;
///
/// let region = Region::new(32, 8).unwrap();
///
/// let tx = region.begin(false);
/// let value = 42u64.to_ne_bytes();
/// // SAFETY: `start` is word-aligned and the region is 32 bytes long.
/// unsafe {
///     assert!(region.write(tx, value.as_ptr(), 8, region.start()));
/// }
/// assert!(region.end(tx));
///
/// let ro = region.begin(true);
/// let mut out = [0u8; 8];
/// // SAFETY: same range, private destination buffer.
/// unsafe {
///     assert!(region.read(ro, region.start(), 8, out.as_mut_ptr()));
/// }
/// assert!(region.end(ro));
/// assert_eq!(u64::from_ne_bytes(out), 42);
/// ```
#[derive(Debug)]
pub struct Region {
    /// Alignment declared at creation.
    align: usize,
    /// Effective allocation alignment, at least a pointer wide. This is the
    /// word stride of the control protocol.
    align_alloc: usize,
    batcher: Batcher,
    table: SegmentTable,
}

impl Region {
    /// Create a region with one initial, never-freeable segment of `size`
    /// bytes, zero-initialized.
    ///
    /// `align` must be a power of two and `size` a positive multiple of it.
    pub fn new(size: usize, align: usize) -> Result<Region, RegionError> {
        if align == 0 || !align.is_power_of_two() {
            return Err(RegionError::InvalidAlignment { align });
        }
        if size == 0 || size % align != 0 {
            return Err(RegionError::InvalidSize { size, align });
        }

        let align_alloc = align.max(size_of::<usize>());
        let initial = Segment::new(size, align_alloc).ok_or(RegionError::OutOfMemory)?;

        Ok(Region {
            align,
            align_alloc,
            batcher: Batcher::new(),
            table: SegmentTable::new(Box::new(initial)),
        })
    }

    /// Address of the first word of the initial segment. Word `k` lives at
    /// `start() + k * align()`.
    #[inline]
    pub fn start(&self) -> *mut u8 {
        self.table.first().readable()
    }

    /// Size in bytes of the initial segment.
    #[inline]
    pub fn size(&self) -> usize {
        self.table.first().size()
    }

    /// Alignment declared at creation.
    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    /// Begin a transaction.
    ///
    /// Blocks (spin/yield) while the current epoch's writer quota is
    /// exhausted; read-only admission is immediate.
    #[inline]
    pub fn begin(&self, is_ro: bool) -> Tx {
        self.batcher.enter(is_ro)
    }

    /// End a transaction that has not aborted.
    ///
    /// Returns `true`: the transaction's writes are part of the committed
    /// state once the epoch closes. A writer does not return before the
    /// epoch's batch-commit has run.
    pub fn end(&self, tx: Tx) -> bool {
        self.batcher.leave(tx, || self.table.batch_commit());
        true
    }

    /// Transactional read of `size` bytes from the shared address `src`
    /// into the private buffer `dst`.
    ///
    /// Returns `false` when the transaction aborted; `tx` is then dead.
    ///
    /// # Safety
    ///
    /// `src..src + size` must lie inside addresses obtained from [`start`]
    /// or [`alloc`] and still allocated, `dst` must be valid for `size`
    /// bytes of writes, and `size` must be a positive multiple of the
    /// region's alignment.
    ///
    /// [`start`]: Region::start
    /// [`alloc`]: Region::alloc
    pub unsafe fn read(&self, tx: Tx, src: *const u8, size: usize, dst: *mut u8) -> bool {
        if tx.is_read_only() {
            // The epoch's snapshot, straight from the readable copy.
            // SAFETY: caller guarantees both ranges.
            unsafe { ptr::copy_nonoverlapping(src, dst, size) };
            return true;
        }
        // SAFETY: forwarded caller guarantees.
        unsafe { self.read_write(tx, src, size, dst) }
    }

    /// Word-granular read path for write transactions.
    unsafe fn read_write(&self, tx: Tx, src: *const u8, size: usize, dst: *mut u8) -> bool {
        let Some((seg, offset)) = self.locate(src, size) else {
            self.rollback(tx);
            return false;
        };

        let word = self.align_alloc;
        let first = offset / word;
        let count = size / word;
        debug_assert_word_range!(first, count, seg.words());
        let controls = &seg.controls()[first..first + count];
        let id = tx.raw();
        let mark = tx.read_mark();

        fence(Ordering::Acquire);
        for (i, ctrl) in controls.iter().enumerate() {
            if ctrl.load(Ordering::Acquire) == id {
                // Our own staged write: serve it from the writable copy.
                // SAFETY: the word lies inside the writable copy and the
                // caller guarantees `dst` spans `size` bytes.
                unsafe {
                    ptr::copy_nonoverlapping(
                        seg.writable().add(offset + i * word) as *const u8,
                        dst.add(i * word),
                        word,
                    );
                }
                continue;
            }
            if !Self::mark_read(ctrl, mark) {
                self.rollback(tx);
                return false;
            }
            // SAFETY: the word lies inside the readable copy and the caller
            // guarantees `dst` spans `size` bytes.
            unsafe {
                ptr::copy_nonoverlapping(
                    seg.readable().add(offset + i * word) as *const u8,
                    dst.add(i * word),
                    word,
                );
            }
        }
        true
    }

    /// Register `mark` as a reader of the word, tolerating co-readers.
    /// Returns `false` when the word is write-locked by another
    /// transaction.
    fn mark_read(ctrl: &AtomicUsize, mark: usize) -> bool {
        match ctrl.compare_exchange(0, mark, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => true,
            Err(current) => {
                current == mark
                    || current == MULTI_READER
                    || (current > MULTI_READER
                        && ctrl
                            .compare_exchange(current, MULTI_READER, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok())
            }
        }
    }

    /// Transactional write of `size` bytes from the private buffer `src`
    /// to the shared address `dst`.
    ///
    /// Returns `false` when the transaction aborted; `tx` is then dead.
    ///
    /// # Safety
    ///
    /// `dst..dst + size` must lie inside addresses obtained from [`start`]
    /// or [`alloc`] and still allocated, `src` must be valid for `size`
    /// bytes of reads, and `size` must be a positive multiple of the
    /// region's alignment. `tx` must be a write transaction.
    ///
    /// [`start`]: Region::start
    /// [`alloc`]: Region::alloc
    pub unsafe fn write(&self, tx: Tx, src: *const u8, size: usize, dst: *mut u8) -> bool {
        debug_assert!(!tx.is_read_only(), "write on a read-only transaction");

        let Some((seg, offset)) = self.locate(dst, size) else {
            self.rollback(tx);
            return false;
        };

        let word = self.align_alloc;
        let first = offset / word;
        let count = size / word;
        debug_assert_word_range!(first, count, seg.words());

        if !Self::lock_words(&seg.controls()[first..first + count], tx) {
            self.rollback(tx);
            return false;
        }

        // Every word in the range is ours; stage the bytes in the mirror.
        // SAFETY: `offset + size <= seg.size()` was established by `locate`
        // and the caller guarantees `src` spans `size` bytes.
        unsafe { ptr::copy_nonoverlapping(src, seg.writable().add(offset), size) };
        true
    }

    /// Acquire the write locks for a run of words. On conflict the locked
    /// prefix is released again before reporting failure; the caller then
    /// rolls the transaction back.
    fn lock_words(controls: &[AtomicUsize], tx: Tx) -> bool {
        let id = tx.raw();
        let mark = tx.read_mark();
        for (i, ctrl) in controls.iter().enumerate() {
            let locked = match ctrl.compare_exchange(0, id, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => true,
                Err(current) => {
                    current == id
                        || ctrl
                            .compare_exchange(mark, id, Ordering::Acquire, Ordering::Relaxed)
                            .is_ok()
                }
            };
            if !locked {
                for taken in &controls[..i] {
                    taken.store(0, Ordering::Relaxed);
                }
                fence(Ordering::Release);
                return false;
            }
        }
        true
    }

    /// Allocate a fresh zeroed segment of `size` bytes inside the
    /// transaction and return its base address.
    ///
    /// The segment is usable by `tx` immediately and becomes visible to
    /// later epochs when the transaction commits. [`AllocError::OutOfMemory`]
    /// leaves the transaction alive; [`AllocError::Abort`] means it rolled
    /// back.
    pub fn alloc(&self, tx: Tx, size: usize) -> Result<*mut u8, AllocError> {
        debug_assert!(!tx.is_read_only(), "alloc on a read-only transaction");

        if size == 0 || size % self.align != 0 {
            self.rollback(tx);
            return Err(AllocError::Abort);
        }
        let Some(seg) = Segment::new(size, self.align_alloc) else {
            return Err(AllocError::OutOfMemory);
        };
        seg.owner.store(tx.raw(), Ordering::Relaxed);
        seg.set_state(LifeCycle::Added);

        match self.table.push(Box::new(seg)) {
            Ok(addr) => Ok(addr),
            Err(seg) => {
                drop(seg);
                self.rollback(tx);
                Err(AllocError::Abort)
            }
        }
    }

    /// Mark the segment based at `addr` for deallocation at commit.
    ///
    /// Returns `false` when the transaction aborted (the segment is gone,
    /// claimed by another transaction, or is the initial segment).
    ///
    /// # Safety
    ///
    /// `addr` must be a base address returned by a prior [`alloc`] on this
    /// region. `tx` must be a write transaction.
    ///
    /// [`alloc`]: Region::alloc
    pub unsafe fn free(&self, tx: Tx, addr: *mut u8) -> bool {
        debug_assert!(!tx.is_read_only(), "free on a read-only transaction");

        let Some(seg) = self.table.lookup(addr) else {
            self.rollback(tx);
            return false;
        };
        if ptr::eq(seg, self.table.first()) {
            // The initial segment outlives every transaction.
            self.rollback(tx);
            return false;
        }
        if !seg.claim_owner(tx.raw()) {
            self.rollback(tx);
            return false;
        }
        match seg.state() {
            LifeCycle::Added => seg.set_state(LifeCycle::AddedRemoved),
            _ => seg.set_state(LifeCycle::Removed),
        }
        true
    }

    /// Find the segment containing `addr` and check the whole accessed
    /// range stays inside it.
    fn locate(&self, addr: *const u8, size: usize) -> Option<(&Segment, usize)> {
        let seg = self.table.lookup(addr)?;
        let offset = seg.offset_of(addr);
        if offset + size > seg.size() {
            return None;
        }
        Some((seg, offset))
    }

    /// Undo every trace of an aborted transaction within the current epoch,
    /// then leave it.
    ///
    /// Touches only entries bearing this transaction's identifiers, so it
    /// cannot disturb concurrent rollbacks of other transactions.
    fn rollback(&self, tx: Tx) {
        let id = tx.raw();
        let word = self.align_alloc;

        for i in 0..self.table.len() {
            let Some(seg) = self.table.get(i) else { continue };

            let owner = seg.owner.load(Ordering::Acquire);
            if owner == id && matches!(seg.state(), LifeCycle::Added | LifeCycle::AddedRemoved) {
                // Our own allocation this epoch: hand it to batch-commit.
                seg.owner.store(DESTROY, Ordering::Release);
                continue;
            }
            if owner == DESTROY {
                continue;
            }
            if owner == id {
                // A free we initiated: the segment stays.
                seg.set_state(LifeCycle::Default);
                seg.owner.store(0, Ordering::Release);
            }

            for (j, ctrl) in seg.controls().iter().enumerate() {
                if ctrl.load(Ordering::Acquire) == id {
                    // Discard the staged write: the snapshot wins again.
                    let at = j * word;
                    let len = word.min(seg.size() - at);
                    // SAFETY: `at + len <= seg.size()`, inside both copies.
                    unsafe {
                        ptr::copy_nonoverlapping(
                            seg.readable().add(at) as *const u8,
                            seg.writable().add(at),
                            len,
                        );
                    }
                    ctrl.store(0, Ordering::Release);
                } else {
                    let _ = ctrl.compare_exchange(
                        tx.read_mark(),
                        0,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    );
                }
            }
            fence(Ordering::Release);
        }

        self.batcher.leave(tx, || self.table.batch_commit());
    }
}
