//! batchstm - Batched Software Transactional Memory
//!
//! A word-granular STM built from two cooperating mechanisms:
//!
//! - **Dual-slot words**: every segment keeps two mirrored copies of its
//!   data. The readable copy is the committed snapshot of the current
//!   epoch; writes stage into the writable copy. One pointer-sized atomic
//!   per word (the control word) arbitrates access: free, read-marked,
//!   write-locked, or multi-reader.
//! - **The batcher**: an epoch scheduler that admits at most
//!   [`BATCH_MAX_WRITERS`] write transactions per epoch, lets read-only
//!   transactions flow freely, and has the last leaver of each epoch
//!   promote every staged write onto the snapshot in one batch-commit.
//!
//! Together they give each epoch a sequentially consistent snapshot:
//! read-only transactions never block and never abort, writers conflict
//! only on overlapping words, and a transaction's writes become visible to
//! others all at once or not at all.
//!
//! Regions support dynamic segment allocation inside transactions; freed
//! segments are reclaimed at epoch boundaries, so no address ever dies
//! while a transaction might still touch it.
//!
//! # Example
//!
//! ```
//! use batchstm::Region;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let region = Arc::new(Region::new(64, 8).unwrap());
//!
//! let handles: Vec<_> = (0..4)
//!     .map(|i| {
//!         let region = Arc::clone(&region);
//!         thread::spawn(move || {
//!             let tx = region.begin(false);
//!             let value = (i as u64 + 1).to_ne_bytes();
//!             // SAFETY: each thread writes its own word of the region.
//!             let ok = unsafe {
//!                 region.write(tx, value.as_ptr(), 8, region.start().add(i * 8))
//!             };
//!             if ok {
//!                 region.end(tx);
//!             }
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//!
//! // Disjoint words: every write committed.
//! let ro = region.begin(true);
//! let mut out = [0u8; 8];
//! for i in 0..4 {
//!     // SAFETY: in-range word reads into a private buffer.
//!     unsafe {
//!         assert!(region.read(ro, region.start().add(i * 8), 8, out.as_mut_ptr()));
//!     }
//!     assert_eq!(u64::from_ne_bytes(out), i as u64 + 1);
//! }
//! region.end(ro);
//! ```

mod batcher;
mod control;
mod error;
mod invariants;
mod region;
mod segment;
mod table;

pub use control::{Tx, BATCH_MAX_WRITERS};
pub use error::{AllocError, RegionError};
pub use region::Region;
