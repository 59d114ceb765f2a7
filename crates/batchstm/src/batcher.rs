use crate::control::{Tx, BATCH_MAX_WRITERS};
use crate::invariants::{debug_assert_entered_nonzero, debug_assert_writer_quota};
use crossbeam_utils::{Backoff, CachePadded};
use std::sync::atomic::{fence, AtomicUsize, Ordering};

// =============================================================================
// EPOCH SCHEDULING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// The batcher serializes transactions into epochs:
//
// - read-only transactions coexist freely with each other and with at most
//   one write epoch,
// - at most BATCH_MAX_WRITERS writers are admitted per epoch; late writers
//   block inside `enter` until the epoch advances,
// - the last participant to leave an epoch that had writers runs the
//   batch-commit exactly once, while still holding the ticket lock.
//
// ## Ticket lock
//
// `take` / `pass` form a ticket lock guarding the admission and exit
// critical sections. Acquisition is fetch-add on `take` (Relaxed), a spin
// until `pass` catches up (Relaxed loads), then an Acquire fence; release is
// a Release fetch-add on `pass`. The fence pairs with the previous holder's
// Release increment, so everything written under the lock is visible to the
// next holder.
//
// ## Epoch waits
//
// Two suspension points exist, both spin-then-yield (`Backoff::snooze`):
//
// 1. `enter`, writer quota exhausted: record `epoch`, drop the lock, wait
//    for `epoch` to move, retry admission.
// 2. `leave`, non-last writer: drop the lock, wait for `epoch` to move.
//    Writers therefore observe the post-commit epoch before `end` returns,
//    which hands callers a total order of commits.
//
// Epoch loads in the wait loops are Relaxed; the Acquire fence after the
// wait (paired with the committer's lock release) orders the next epoch's
// reads after the promoted snapshot.
//
// ## Counters
//
// `counter`, `nb_entered`, `nb_write_tx` are mutated only while holding the
// ticket lock (Relaxed suffices; the lock carries the ordering). The one
// exception is the write-tx id assignment, which happens after the lock is
// dropped: admission already reserved the slot under the lock, and the
// fetch-add on `nb_write_tx` hands out distinct ids on its own.
//
// =============================================================================

/// The epoch scheduler.
///
/// Admission never fails; waiting is bounded spinning with a yield hint, no
/// condition variables. Fairness is FIFO within the ticket lock and
/// FIFO-plus-batch across epochs.
#[derive(Debug)]
pub(crate) struct Batcher {
    /// Remaining writer admission slots in the current epoch.
    counter: AtomicUsize,
    /// Transactions currently in flight.
    nb_entered: AtomicUsize,
    /// Writers admitted to the current epoch.
    nb_write_tx: AtomicUsize,
    /// Ticket the next thread takes.
    take: CachePadded<AtomicUsize>,
    /// Ticket currently allowed through.
    pass: CachePadded<AtomicUsize>,
    /// Generation counter; advances once per epoch that had writers.
    epoch: CachePadded<AtomicUsize>,
}

impl Batcher {
    pub(crate) fn new() -> Self {
        Self {
            counter: AtomicUsize::new(BATCH_MAX_WRITERS),
            nb_entered: AtomicUsize::new(0),
            nb_write_tx: AtomicUsize::new(0),
            take: CachePadded::new(AtomicUsize::new(0)),
            pass: CachePadded::new(AtomicUsize::new(0)),
            epoch: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) {
        let ticket = self.take.fetch_add(1, Ordering::Relaxed);
        let backoff = Backoff::new();
        while self.pass.load(Ordering::Relaxed) != ticket {
            backoff.snooze();
        }
        fence(Ordering::Acquire);
    }

    fn unlock(&self) {
        self.pass.fetch_add(1, Ordering::Release);
    }

    /// Spin until the epoch moves past `seen`.
    fn wait_epoch_change(&self, seen: usize) {
        let backoff = Backoff::new();
        while self.epoch.load(Ordering::Relaxed) == seen {
            backoff.snooze();
        }
        fence(Ordering::Acquire);
    }

    /// Admit a transaction into the current epoch.
    ///
    /// Read-only admission always succeeds immediately. A writer blocks
    /// while the epoch's quota is exhausted and retries on the next epoch.
    pub(crate) fn enter(&self, is_ro: bool) -> Tx {
        if is_ro {
            self.lock();
            self.nb_entered.fetch_add(1, Ordering::Relaxed);
            self.unlock();
            return Tx::READ_ONLY;
        }

        loop {
            self.lock();
            if self.counter.load(Ordering::Relaxed) == 0 {
                let seen = self.epoch.load(Ordering::Relaxed);
                self.unlock();
                self.wait_epoch_change(seen);
            } else {
                self.counter.fetch_sub(1, Ordering::Release);
                break;
            }
        }
        self.nb_entered.fetch_add(1, Ordering::Relaxed);
        self.unlock();

        let id = self.nb_write_tx.fetch_add(1, Ordering::Relaxed) + 1;
        debug_assert_writer_quota!(id);
        fence(Ordering::Release);
        Tx(id)
    }

    /// Record a transaction leaving the epoch.
    ///
    /// The last leaver runs `commit` under the ticket lock if the epoch had
    /// writers, then opens the next epoch. A non-last writer does not return
    /// until the epoch has advanced.
    pub(crate) fn leave<F: FnOnce()>(&self, tx: Tx, commit: F) {
        self.lock();
        let entered = self.nb_entered.fetch_sub(1, Ordering::Relaxed);
        debug_assert_entered_nonzero!(entered);
        if entered == 1 {
            if self.nb_write_tx.load(Ordering::Relaxed) > 0 {
                commit();
                self.nb_write_tx.store(0, Ordering::Relaxed);
                self.counter.store(BATCH_MAX_WRITERS, Ordering::Relaxed);
                self.epoch.fetch_add(1, Ordering::Relaxed);
            }
            self.unlock();
        } else if !tx.is_read_only() {
            let seen = self.epoch.load(Ordering::Relaxed);
            self.unlock();
            self.wait_epoch_change(seen);
        } else {
            self.unlock();
        }
    }

    #[cfg(test)]
    pub(crate) fn epoch_now(&self) -> usize {
        self.epoch.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.nb_entered.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn writer_slots(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }
}
