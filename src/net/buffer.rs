//! Frame buffer pool
//!
//! Provides fixed-size byte buffers for frame encoding and decoding:
//! - Every buffer holds exactly one maximum-size frame
//! - Buffers are checked out through an RAII guard and returned on drop
//! - Concurrent checkout never hands the same buffer to two holders
//!
//! Data read from a pooled buffer must be copied into caller-owned memory
//! before the guard is dropped.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::net::codec::MAX_FRAME_SIZE;

/// Default number of idle buffers kept by a pool
pub const DEFAULT_MAX_POOLED: usize = 1024;

static SHARED_POOL: Lazy<Arc<BufferPool>> =
    Lazy::new(|| Arc::new(BufferPool::new(DEFAULT_MAX_POOLED)));

/// Process-wide buffer pool used by codecs that are not given their own
pub fn shared_pool() -> Arc<BufferPool> {
    SHARED_POOL.clone()
}

/// Pool of fixed `MAX_FRAME_SIZE` byte buffers
#[derive(Debug)]
pub struct BufferPool {
    /// Idle buffers ready for checkout
    idle: Mutex<Vec<Box<[u8]>>>,
    /// Maximum number of idle buffers retained
    max_idle: usize,
}

impl BufferPool {
    /// Create a pool that retains at most `max_idle` idle buffers
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Check out a buffer, allocating a fresh one when the pool is empty
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; MAX_FRAME_SIZE].into_boxed_slice());
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Number of idle buffers currently held
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn release(&self, buf: Box<[u8]>) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_POOLED)
    }
}

/// A buffer checked out of a [`BufferPool`]
///
/// Always `MAX_FRAME_SIZE` bytes long. Returned to its pool on drop.
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .finish()
    }
}
