//! Bounded, growable object pools with blocking acquire.
//!
//! The reduction engine recycles two kinds of objects through these pools:
//! receive-staging byte buffers and per-transfer context records. Both
//! follow the same discipline: a pool pre-allocates a minimum number of
//! items, grows by a configured increment up to a configured maximum, and
//! blocks callers once the maximum is reached until an item is released.
//!
//! `acquire()` hands out an RAII [`Lease`]; dropping the lease returns the
//! item to the pool. Items carry no call-specific identity and are safe to
//! reuse across segments and across calls.

use crossbeam_queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};

/// A bounded, growable pool of reusable items.
///
/// Cloning the pool is cheap and shares the underlying storage; leases are
/// `Send` and may be dropped from any thread (typically a completion
/// callback).
pub struct FreeList<T> {
    inner: Arc<FreeListInner<T>>,
}

impl<T> Clone for FreeList<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct FreeListInner<T> {
    /// Lock-free fast path: released items waiting for reuse.
    free: ArrayQueue<T>,
    growth: Mutex<Growth>,
    available: Condvar,
    max: usize,
    inc: usize,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

struct Growth {
    allocated: usize,
}

impl<T: Send> FreeList<T> {
    /// Create a pool that pre-allocates `min` items, grows by `inc` up to
    /// `max`, and constructs items with `factory`.
    pub fn new(
        min: usize,
        max: usize,
        inc: usize,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> Self {
        let max = max.max(1).max(min);
        let min = min.min(max);
        let free = ArrayQueue::new(max);
        for _ in 0..min {
            let _ = free.push(factory());
        }
        Self {
            inner: Arc::new(FreeListInner {
                free,
                growth: Mutex::new(Growth { allocated: min }),
                available: Condvar::new(),
                max,
                inc: inc.max(1),
                factory: Box::new(factory),
            }),
        }
    }

    /// Take an item from the pool.
    ///
    /// Pops a free item if one exists; otherwise grows the pool by its
    /// increment (up to the maximum); otherwise blocks until a lease is
    /// dropped. The wait is expected to be short: pools are sized for the
    /// worst-case pipeline depth, so exhaustion means a completion is
    /// about to return an item.
    pub fn acquire(&self) -> Lease<T> {
        if let Some(item) = self.inner.free.pop() {
            return self.lease(item);
        }

        let mut growth = self
            .inner
            .growth
            .lock()
            .expect("pool growth lock poisoned");
        loop {
            // A release may have slipped in before we took the lock.
            if let Some(item) = self.inner.free.pop() {
                return self.lease(item);
            }
            if growth.allocated < self.inner.max {
                let add = self.inner.inc.min(self.inner.max - growth.allocated);
                growth.allocated += add;
                tracing::debug!(
                    allocated = growth.allocated,
                    max = self.inner.max,
                    "pool grew by {add}"
                );
                let item = (self.inner.factory)();
                for _ in 1..add {
                    let _ = self.inner.free.push((self.inner.factory)());
                }
                if add > 1 {
                    self.inner.available.notify_all();
                }
                return self.lease(item);
            }
            growth = self
                .inner
                .available
                .wait(growth)
                .expect("pool growth lock poisoned");
        }
    }

    /// Number of items currently allocated (free or leased).
    pub fn allocated(&self) -> usize {
        self.inner
            .growth
            .lock()
            .expect("pool growth lock poisoned")
            .allocated
    }

    /// Number of items currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.inner.free.len()
    }

    fn lease(&self, item: T) -> Lease<T> {
        Lease {
            item: Some(item),
            inner: Arc::clone(&self.inner),
        }
    }
}

/// An item checked out from a [`FreeList`]. Derefs to the item.
///
/// On drop, the item is returned to the pool and one blocked `acquire()`
/// (if any) is woken.
pub struct Lease<T> {
    item: Option<T>,
    inner: Arc<FreeListInner<T>>,
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Invariant: `item` is `Some` from construction until `Drop`.
        self.item.as_ref().expect("Lease used after drop")
    }
}

impl<T> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("Lease used after drop")
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            let _ = self.inner.free.push(item);
            // Taking the lock orders the push before the wakeup so a
            // waiter cannot miss it.
            drop(self.inner.growth.lock());
            self.inner.available.notify_one();
        }
    }
}
