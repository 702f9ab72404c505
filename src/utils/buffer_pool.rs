//! # Buffer Pool
//!
//! Leased buffer pool backing every [`Packet`](crate::core::packet::Packet).
//!
//! Each checkout is a lease with a unique id. The pool keeps the set of
//! outstanding leases, so returning a lease that is not outstanding is caught
//! and reported as [`ProtocolError::DoubleFree`] instead of silently handing
//! the same slot to two holders.
//!
//! ## Usage
//! ```rust
//! use gamenet::utils::buffer_pool::BufferPool;
//!
//! let pool = BufferPool::new(16);
//! let mut buffer = pool.acquire(64);
//! buffer.extend_from_slice(b"frame");
//! buffer.release().unwrap(); // explicit return
//! assert_eq!(pool.outstanding(), 0);
//! ```
//!
//! A buffer that is dropped without [`PooledBuffer::release`] is returned by
//! its `Drop` impl.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{ProtocolError, Result};

/// Largest buffer kept for reuse: one maximal frame.
const MAX_POOLED_BUFFER_SIZE: usize = 4 + u16::MAX as usize;

/// Default buffer capacity
const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Upper bound on idle buffers retained by the pool
const MAX_IDLE_BUFFERS: usize = 4096;

struct PoolState {
    free: Vec<Vec<u8>>,
    outstanding: HashSet<u64>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    next_lease: AtomicU64,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // A panic while holding the lock leaves the state consistent; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn checkin(&self, lease: u64, mut buffer: Vec<u8>) -> Result<()> {
        let mut state = self.lock();
        if !state.outstanding.remove(&lease) {
            return Err(ProtocolError::DoubleFree(lease));
        }
        if buffer.capacity() <= MAX_POOLED_BUFFER_SIZE && state.free.len() < MAX_IDLE_BUFFERS {
            buffer.clear();
            state.free.push(buffer);
        }
        Ok(())
    }
}

/// A leased buffer. Returned to its pool by [`release`](Self::release) or on drop.
pub struct PooledBuffer {
    buffer: Vec<u8>,
    lease: u64,
    pool: Arc<PoolShared>,
    returned: bool,
}

impl PooledBuffer {
    /// Lease id of this checkout
    pub fn lease(&self) -> u64 {
        self.lease
    }

    /// Return the buffer to the pool, truncated to empty.
    pub fn release(mut self) -> Result<()> {
        self.returned = true;
        let buffer = std::mem::take(&mut self.buffer);
        self.pool.checkin(self.lease, buffer)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if !self.returned {
            let buffer = std::mem::take(&mut self.buffer);
            let _ = self.pool.checkin(self.lease, buffer);
        }
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

/// Thread-safe pool of reusable byte buffers
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create a new buffer pool with `pool_size` pre-allocated buffers
    pub fn new(pool_size: usize) -> Self {
        let free = (0..pool_size.min(MAX_IDLE_BUFFERS))
            .map(|_| Vec::with_capacity(DEFAULT_BUFFER_CAPACITY))
            .collect();

        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    free,
                    outstanding: HashSet::new(),
                }),
                next_lease: AtomicU64::new(1),
            }),
        }
    }

    /// Lease a buffer with at least `capacity` bytes reserved
    pub fn acquire(&self, capacity: usize) -> PooledBuffer {
        let lease = self.shared.next_lease.fetch_add(1, Ordering::Relaxed);
        let mut buffer = {
            let mut state = self.shared.lock();
            state.outstanding.insert(lease);
            state
                .free
                .pop()
                .unwrap_or_else(|| Vec::with_capacity(DEFAULT_BUFFER_CAPACITY))
        };
        buffer.reserve(capacity);

        PooledBuffer {
            buffer,
            lease,
            pool: self.shared.clone(),
            returned: false,
        }
    }

    /// Number of idle buffers ready for reuse
    pub fn available(&self) -> usize {
        self.shared.lock().free.len()
    }

    /// Number of leases currently checked out
    pub fn outstanding(&self) -> usize {
        self.shared.lock().outstanding.len()
    }

    #[cfg(test)]
    fn checkin(&self, lease: u64, buffer: Vec<u8>) -> Result<()> {
        self.shared.checkin(lease, buffer)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_basic() {
        let pool = BufferPool::new(10);
        assert_eq!(pool.available(), 10);

        let mut buf = pool.acquire(16);
        assert_eq!(pool.available(), 9);
        assert_eq!(pool.outstanding(), 1);

        buf.push(42);
        assert_eq!(buf[0], 42);

        drop(buf);
        assert_eq!(pool.available(), 10);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_buffer_pool_reuse_is_truncated() {
        let pool = BufferPool::new(1);

        let mut buf1 = pool.acquire(4);
        buf1.extend_from_slice(b"test");
        buf1.release().unwrap();

        let buf2 = pool.acquire(0);
        assert_eq!(buf2.len(), 0);
        assert!(buf2.capacity() >= 4);
    }

    #[test]
    fn test_second_return_of_a_lease_is_detected() {
        let pool = BufferPool::new(1);
        let buf = pool.acquire(8);
        let lease = buf.lease();
        buf.release().unwrap();

        let err = pool.checkin(lease, Vec::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::DoubleFree(id) if id == lease));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_leases_are_unique() {
        let pool = BufferPool::new(2);
        let a = pool.acquire(1);
        let b = pool.acquire(1);
        assert_ne!(a.lease(), b.lease());
        assert_eq!(pool.outstanding(), 2);
    }

    #[test]
    fn test_buffer_size_limit() {
        let pool = BufferPool::new(0);

        {
            let mut buf = pool.acquire(MAX_POOLED_BUFFER_SIZE + 1);
            buf.extend_from_slice(&vec![0u8; MAX_POOLED_BUFFER_SIZE + 1]);
        }

        // Oversized buffer is released but not kept
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.outstanding(), 0);
    }
}
