//! Transaction identifiers and the control-word encoding.
//!
//! Every shared word carries one pointer-sized atomic, its *control word*,
//! that encodes the word's access state for the current epoch. The whole
//! per-word protocol is CAS transitions between these values:
//!
//! | value                  | meaning                                        |
//! |------------------------|------------------------------------------------|
//! | `0`                    | free: no reader, no writer this epoch          |
//! | `1..=BATCH_MAX_WRITERS`| write-locked by that transaction               |
//! | `tx.wrapping_neg()`    | read-marked by exactly one write transaction   |
//! | `MULTI_READER`         | read by two or more write transactions         |
//!
//! Read marks occupy the very top of the `usize` range, all strictly above
//! `MULTI_READER`. That ordering is load-bearing: a single `> MULTI_READER`
//! comparison recognizes "some other transaction's read mark", which the
//! read path then demotes to `MULTI_READER` with one CAS.
//!
//! Read-only transactions never touch a control word.

/// Maximum number of write transactions admitted into one epoch.
pub const BATCH_MAX_WRITERS: usize = 12;

/// Control-word sentinel: two or more write transactions read this word.
pub(crate) const MULTI_READER: usize = usize::MAX - BATCH_MAX_WRITERS;

/// Owner sentinel: the segment is pending destruction and will be reclaimed
/// by a batch-commit. Never handed out as a transaction id.
pub(crate) const DESTROY: usize = usize::MAX - 2;

/// Raw id returned to read-only transactions.
const READ_ONLY: usize = usize::MAX - 1;

/// An opaque transaction identifier.
///
/// Write-transaction ids are 1-based and valid only within the epoch that
/// assigned them; read-only transactions all share one reserved id. A `Tx`
/// is dead as soon as any operation on it returns `false` (the transaction
/// rolled back) or after `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tx(pub(crate) usize);

impl Tx {
    pub(crate) const READ_ONLY: Tx = Tx(READ_ONLY);

    /// Whether this transaction was admitted read-only.
    #[inline]
    pub fn is_read_only(self) -> bool {
        self.0 == READ_ONLY
    }

    /// The raw id as it appears in control words and segment owners.
    #[inline]
    pub(crate) fn raw(self) -> usize {
        self.0
    }

    /// The control-word value marking a word as read by this transaction.
    #[inline]
    pub(crate) fn read_mark(self) -> usize {
        self.0.wrapping_neg()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_marks_sit_above_multi_reader() {
        for id in 1..=BATCH_MAX_WRITERS {
            let mark = Tx(id).read_mark();
            assert!(mark > MULTI_READER, "mark for tx {} fell below the sentinel", id);
            assert_ne!(mark, 0);
        }
    }

    #[test]
    fn read_marks_are_distinct() {
        let marks: Vec<usize> = (1..=BATCH_MAX_WRITERS).map(|id| Tx(id).read_mark()).collect();
        for (i, a) in marks.iter().enumerate() {
            for b in &marks[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn write_ids_never_collide_with_sentinels() {
        for id in 1..=BATCH_MAX_WRITERS {
            assert!(id < MULTI_READER);
            assert_ne!(id, DESTROY);
            assert!(!Tx(id).is_read_only());
        }
        assert!(Tx::READ_ONLY.is_read_only());
    }
}
