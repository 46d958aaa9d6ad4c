//! Pool of recyclable sample storage and the per-holder buffer handle.
//!
//! ## Memory Flow
//!
//! ```text
//! 1. Pool optionally pre-allocates slots at startup
//! 2. acquire() pops a free slot (or allocates one) and copies the block in
//! 3. Producer hands the handle to the first holder (user count 1)
//! 4. Fan-out paths call retain() once per additional holder
//! 5. Each holder calls release() when finished reading
//! 6. The release that reaches zero clears the slot and pushes it back
//! ```

use crate::PoolError;
use crossbeam_queue::SegQueue;
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace};

/// Storage slot shared by every handle of one published block.
struct Slot<T> {
    id: usize,
    samples: RwLock<Vec<T>>,
    user_count: AtomicUsize,
}

struct PoolInner<T> {
    name: String,
    /// Lock-free queue of recycled slots
    free_slots: SegQueue<Arc<Slot<T>>>,
    /// Panic on ownership misuse instead of only reporting it
    strict: AtomicBool,
    /// Total slots ever created (also the next slot id)
    allocated: AtomicUsize,
    /// Slots currently sitting in the free list
    available: AtomicUsize,
    acquires: AtomicU64,
    retains: AtomicU64,
    releases: AtomicU64,
    implicit_releases: AtomicU64,
    recycled: AtomicU64,
}

impl<T> PoolInner<T> {
    fn new_slot(&self, block_len: usize) -> Arc<Slot<T>> {
        let id = self.allocated.fetch_add(1, Ordering::Relaxed);
        Arc::new(Slot {
            id,
            samples: RwLock::new(Vec::with_capacity(block_len)),
            user_count: AtomicUsize::new(0),
        })
    }

    fn checkout(&self) -> Arc<Slot<T>> {
        if let Some(slot) = self.free_slots.pop() {
            self.available.fetch_sub(1, Ordering::Relaxed);
            self.recycled.fetch_add(1, Ordering::Relaxed);
            return slot;
        }

        let slot = self.new_slot(0);
        debug!(
            pool = %self.name,
            allocated = self.allocated.load(Ordering::Relaxed),
            "Free list empty, allocated new buffer slot"
        );
        slot
    }

    /// Decrements the slot's user count, recycling it at zero.
    #[allow(clippy::panic)]
    fn release_slot(&self, slot: Arc<Slot<T>>) -> Result<(), PoolError> {
        match slot
            .user_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            }) {
            Ok(1) => {
                slot.samples.write().clear();
                self.free_slots.push(slot);
                self.available.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(_) => {
                let err = PoolError::OverRelease {
                    pool: self.name.clone(),
                    slot: slot.id,
                };
                error!(pool = %self.name, slot = slot.id, "{err}");
                if self.strict.load(Ordering::Relaxed) {
                    panic!("{err}");
                }
                Err(err)
            }
        }
    }
}

/// Snapshot of pool accounting.
///
/// `releases + implicit_releases` never exceeds `acquires + retains`; the two
/// sides are equal once every handle has been released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Slots ever created by this pool
    pub allocated: usize,
    /// Slots in the free list
    pub available: usize,
    /// Slots currently held by at least one user
    pub outstanding: usize,
    /// Successful `acquire`/`acquire_with` calls
    pub acquires: u64,
    /// `retain` calls
    pub retains: u64,
    /// Explicit `release` calls
    pub releases: u64,
    /// Handles dropped without calling `release`
    pub implicit_releases: u64,
    /// Acquisitions served from the free list instead of a new allocation
    pub recycled: u64,
}

/// Shared pool of recyclable sample storage.
///
/// Cheap to clone; all clones share the same free list and counters. Buffers
/// keep the pool state alive, so the pool may be dropped before its buffers.
pub struct ReusableBufferPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ReusableBufferPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ReusableBufferPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReusableBufferPool")
            .field("name", &self.inner.name)
            .field("allocated", &self.inner.allocated.load(Ordering::Relaxed))
            .field("available", &self.inner.available.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> ReusableBufferPool<T>
where
    T: Copy + Default + Send + Sync + 'static,
{
    /// Create an empty pool; slots are allocated as demand requires.
    ///
    /// The pool is strict (panics on ownership misuse) in debug builds.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                free_slots: SegQueue::new(),
                strict: AtomicBool::new(cfg!(debug_assertions)),
                allocated: AtomicUsize::new(0),
                available: AtomicUsize::new(0),
                acquires: AtomicU64::new(0),
                retains: AtomicU64::new(0),
                releases: AtomicU64::new(0),
                implicit_releases: AtomicU64::new(0),
                recycled: AtomicU64::new(0),
            }),
        }
    }

    /// Create a pool with `count` slots, each reserving room for `block_len` samples.
    #[must_use]
    pub fn with_preallocated(name: impl Into<String>, count: usize, block_len: usize) -> Self {
        let pool = Self::new(name);
        for _ in 0..count {
            let slot = pool.inner.new_slot(block_len);
            pool.inner.free_slots.push(slot);
        }
        pool.inner.available.store(count, Ordering::Relaxed);

        info!(
            pool = %pool.inner.name,
            slots = count,
            block_len,
            "ReusableBufferPool created"
        );
        pool
    }

    /// Choose whether ownership misuse panics (`true`) or is only logged and
    /// returned as an error (`false`).
    #[must_use]
    pub fn strict(self, strict: bool) -> Self {
        self.inner.strict.store(strict, Ordering::Relaxed);
        self
    }

    /// Pool name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Publish a copy of `samples` in pooled storage with a user count of 1.
    #[must_use]
    pub fn acquire(&self, samples: &[T]) -> ReusableBuffer<T> {
        let slot = self.inner.checkout();
        {
            let mut storage = slot.samples.write();
            storage.clear();
            storage.extend_from_slice(samples);
        }
        self.hand_out(slot)
    }

    /// Publish a block of `len` samples written in place by `fill`.
    ///
    /// The slice passed to `fill` starts zeroed (`T::default()`).
    #[must_use]
    pub fn acquire_with<F>(&self, len: usize, fill: F) -> ReusableBuffer<T>
    where
        F: FnOnce(&mut [T]),
    {
        let slot = self.inner.checkout();
        {
            let mut storage = slot.samples.write();
            storage.clear();
            storage.resize(len, T::default());
            fill(&mut storage);
        }
        self.hand_out(slot)
    }

    fn hand_out(&self, slot: Arc<Slot<T>>) -> ReusableBuffer<T> {
        slot.user_count.store(1, Ordering::Release);
        self.inner.acquires.fetch_add(1, Ordering::Relaxed);
        ReusableBuffer {
            slot: Some(slot),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Current accounting snapshot.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let allocated = self.inner.allocated.load(Ordering::Relaxed);
        let available = self.inner.available.load(Ordering::Relaxed);
        PoolStats {
            allocated,
            available,
            outstanding: allocated.saturating_sub(available),
            acquires: self.inner.acquires.load(Ordering::Relaxed),
            retains: self.inner.retains.load(Ordering::Relaxed),
            releases: self.inner.releases.load(Ordering::Relaxed),
            implicit_releases: self.inner.implicit_releases.load(Ordering::Relaxed),
            recycled: self.inner.recycled.load(Ordering::Relaxed),
        }
    }
}

/// One holder's handle on a pooled sample block.
///
/// The samples are immutable once published. The only shared mutable state is
/// the slot's user count, which is updated atomically.
pub struct ReusableBuffer<T> {
    /// `None` only after `release` has consumed the handle.
    slot: Option<Arc<Slot<T>>>,
    pool: Arc<PoolInner<T>>,
}

impl<T> ReusableBuffer<T> {
    fn slot(&self) -> &Slot<T> {
        match self.slot.as_deref() {
            Some(slot) => slot,
            None => unreachable!("live buffer handle without a slot"),
        }
    }

    /// Read access to the samples.
    #[must_use]
    pub fn samples(&self) -> MappedRwLockReadGuard<'_, [T]> {
        RwLockReadGuard::map(self.slot().samples.read(), Vec::as_slice)
    }

    /// Number of samples in the block.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slot().samples.read().len()
    }

    /// Whether the block holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of holders currently sharing this block.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.slot().user_count.load(Ordering::Acquire)
    }

    /// Identifier of the underlying storage slot (for diagnostics).
    #[must_use]
    pub fn slot_id(&self) -> usize {
        self.slot().id
    }

    /// Register one more holder and return its handle.
    #[must_use]
    pub fn retain(&self) -> Self {
        let slot = match &self.slot {
            Some(slot) => Arc::clone(slot),
            None => unreachable!("live buffer handle without a slot"),
        };
        slot.user_count.fetch_add(1, Ordering::AcqRel);
        self.pool.retains.fetch_add(1, Ordering::Relaxed);
        Self {
            slot: Some(slot),
            pool: Arc::clone(&self.pool),
        }
    }

    /// Give up this holder's claim on the block.
    ///
    /// The last release returns the storage to the pool. An error means the
    /// slot's count was already zero, i.e. the ownership protocol was broken
    /// somewhere else.
    pub fn release(mut self) -> Result<(), PoolError> {
        match self.slot.take() {
            Some(slot) => {
                self.pool.releases.fetch_add(1, Ordering::Relaxed);
                self.pool.release_slot(slot)
            }
            None => Ok(()),
        }
    }
}

impl<T: Copy> ReusableBuffer<T> {
    /// Copy the samples out into a new vector.
    #[must_use]
    pub fn copy_of_samples(&self) -> Vec<T> {
        self.slot().samples.read().clone()
    }

    /// Copy the samples into `out`, replacing its contents.
    pub fn copy_samples_into(&self, out: &mut Vec<T>) {
        out.clear();
        out.extend_from_slice(&self.slot().samples.read());
    }
}

impl<T> Drop for ReusableBuffer<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.implicit_releases.fetch_add(1, Ordering::Relaxed);
            trace!(
                pool = %self.pool.name,
                slot = slot.id,
                "Buffer handle dropped without release"
            );
            let _ = self.pool.release_slot(slot);
        }
    }
}

impl<T> fmt::Debug for ReusableBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("ReusableBuffer");
        dbg.field("pool", &self.pool.name);
        if let Some(slot) = &self.slot {
            dbg.field("slot", &slot.id)
                .field("len", &slot.samples.read().len())
                .field("user_count", &slot.user_count.load(Ordering::Relaxed));
        }
        dbg.finish()
    }
}
