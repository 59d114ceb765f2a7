//! Debug assertion macros for the batcher and segment-table invariants.
//!
//! Active only in debug builds; release builds compile them away entirely.

/// Assert that a write-transaction id stays within the per-epoch quota.
///
/// Holds because `enter` decrements the admission counter before the id is
/// assigned, so at most `BATCH_MAX_WRITERS` ids exist per epoch.
///
/// Used in: `Batcher::enter()` after id assignment.
macro_rules! debug_assert_writer_quota {
    ($id:expr) => {
        debug_assert!(
            (1..=crate::control::BATCH_MAX_WRITERS).contains(&$id),
            "write-tx id {} outside the epoch quota of {}",
            $id,
            crate::control::BATCH_MAX_WRITERS
        )
    };
}

/// Assert that a `leave` had a matching `enter`.
///
/// Used in: `Batcher::leave()` on the pre-decrement in-flight count.
macro_rules! debug_assert_entered_nonzero {
    ($entered:expr) => {
        debug_assert!($entered > 0, "leave without a matching enter")
    };
}

/// Assert that the segment-table length never exceeds its capacity.
///
/// Used in: `SegmentTable::push()` after slot reservation.
macro_rules! debug_assert_table_len {
    ($len:expr) => {
        debug_assert!(
            $len <= crate::table::TABLE_CAPACITY,
            "segment table grew to {} slots (capacity {})",
            $len,
            crate::table::TABLE_CAPACITY
        )
    };
}

/// Assert that a word range addressed by the engine stays inside the
/// segment's control array. The engine rejects out-of-range accesses before
/// indexing; this catches arithmetic drift between the two checks.
///
/// Used in: `Region::read()`/`Region::write()` before slicing controls.
macro_rules! debug_assert_word_range {
    ($first:expr, $count:expr, $words:expr) => {
        debug_assert!(
            $first + $count <= $words,
            "word range [{}, {}) escapes a segment of {} words",
            $first,
            $first + $count,
            $words
        )
    };
}

pub(crate) use debug_assert_entered_nonzero;
pub(crate) use debug_assert_table_len;
pub(crate) use debug_assert_word_range;
pub(crate) use debug_assert_writer_quota;
