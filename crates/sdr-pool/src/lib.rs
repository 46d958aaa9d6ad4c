//! Recyclable, reference-counted sample buffers.
//!
//! A wideband producer emits thousands of sample blocks per second. Allocating
//! a fresh `Vec` for each one and freeing it after the last consumer is done
//! puts the allocator on the producer's hot path. This crate keeps a pool of
//! sample storage slots instead:
//!
//! - [`ReusableBufferPool<T>`]: lock-free free list of storage slots, grown on
//!   demand so the producer never waits
//! - [`ReusableBuffer<T>`]: one holder's handle on a slot, carrying an explicit
//!   user count
//!
//! # Ownership Protocol
//!
//! Every holder owns exactly one handle. Handing a block to another holder
//! means calling [`ReusableBuffer::retain`] first, which bumps the user count
//! and returns the handle for the new holder. A holder that is finished calls
//! [`ReusableBuffer::release`]; the holder that brings the count to zero
//! returns the storage to the pool.
//!
//! Handles are deliberately not `Clone`, and `release` consumes the handle, so
//! releasing twice or reading after release is rejected by the compiler:
//!
//! ```compile_fail
//! use sdr_pool::ReusableBufferPool;
//!
//! let pool = ReusableBufferPool::<f32>::new("doc");
//! let buffer = pool.acquire(&[1.0, 2.0]);
//! buffer.release().unwrap();
//! buffer.release().unwrap(); // use of moved value
//! ```
//!
//! ```compile_fail
//! use sdr_pool::ReusableBufferPool;
//!
//! let pool = ReusableBufferPool::<f32>::new("doc");
//! let buffer = pool.acquire(&[1.0, 2.0]);
//! buffer.release().unwrap();
//! let _ = buffer.samples(); // borrow of moved value
//! ```
//!
//! A handle dropped without `release` is still returned to the pool, but it is
//! counted in [`PoolStats::implicit_releases`] so tests can assert that every
//! path followed the explicit protocol.
//!
//! # Example
//!
//! ```
//! use sdr_pool::ReusableBufferPool;
//!
//! let pool = ReusableBufferPool::<f32>::with_preallocated("iq", 4, 1024);
//!
//! let block = pool.acquire(&[0.5, -0.5, 0.25, -0.25]);
//! let second_holder = block.retain();
//! assert_eq!(block.user_count(), 2);
//!
//! block.release().unwrap();
//! assert_eq!(second_holder.samples()[0], 0.5);
//! second_holder.release().unwrap();
//!
//! let stats = pool.stats();
//! assert_eq!(stats.outstanding, 0);
//! assert_eq!(stats.releases, stats.acquires + stats.retains);
//! ```

pub mod buffer;

pub use buffer::{PoolStats, ReusableBuffer, ReusableBufferPool};

use thiserror::Error;

/// Errors reported by the buffer pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The user count of a slot would have dropped below zero.
    ///
    /// This is a programming defect: some holder released storage it did not
    /// own, so another holder may already be reading recycled samples.
    #[error("buffer slot {slot} of pool '{pool}' released more times than it was retained")]
    OverRelease {
        /// Name of the pool owning the slot
        pool: String,
        /// Slot identifier (stable for the life of the pool)
        slot: usize,
    },
}
