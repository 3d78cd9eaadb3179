//! Reusable byte-buffer pool.
//!
//! Every component that needs a scratch or destination buffer rents one from a
//! [`BufferPool`]. A rented buffer is a [`PooledBuf`] guard: it owns its storage
//! and hands it back to the pool when dropped, so a buffer can be returned at most
//! once and cannot be touched after it has been returned.

use crate::error::ProtocolError;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Default largest buffer the pool will hand out (16 MiB).
pub const DEFAULT_MAX_BUFFER_LEN: usize = 16 * 1024 * 1024;

/// Default largest buffer kept on the free list after return (256 KiB).
pub const DEFAULT_MAX_RETAINED_LEN: usize = 256 * 1024;

/// Default number of idle buffers kept on the free list.
pub const DEFAULT_MAX_IDLE: usize = 64;

/// Pool sizing limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Largest length `rent` will accept.
    pub max_buffer_len: usize,
    /// Buffers whose capacity exceeds this are freed instead of retained.
    pub max_retained_len: usize,
    /// Maximum number of idle buffers retained.
    pub max_idle: usize,
    /// Maximum number of buffers rented at once (0 = unlimited).
    pub max_outstanding: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_buffer_len: DEFAULT_MAX_BUFFER_LEN,
            max_retained_len: DEFAULT_MAX_RETAINED_LEN,
            max_idle: DEFAULT_MAX_IDLE,
            max_outstanding: 0,
        }
    }
}

impl PoolConfig {
    pub fn with_max_outstanding(mut self, max: usize) -> Self {
        self.max_outstanding = max;
        self
    }

    pub fn with_max_buffer_len(mut self, len: usize) -> Self {
        self.max_buffer_len = len;
        self
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total buffers handed out.
    pub rented: u64,
    /// Total buffers handed back (or detached).
    pub returned: u64,
    /// Buffers currently rented.
    pub outstanding: usize,
    /// Buffers sitting on the free list.
    pub idle: usize,
}

struct PoolShared {
    config: PoolConfig,
    free: Mutex<Vec<Vec<u8>>>,
    rented: AtomicU64,
    returned: AtomicU64,
    outstanding: AtomicUsize,
}

impl PoolShared {
    fn release(&self, mut buf: Vec<u8>) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);

        if buf.capacity() > self.config.max_retained_len {
            return;
        }
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.config.max_idle {
            free.push(buf);
        }
    }
}

/// Thread-safe pool of byte buffers. Cloning shares the same pool.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Creates an empty pool with the given limits.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config,
                free: Mutex::new(Vec::with_capacity(config.max_idle)),
                rented: AtomicU64::new(0),
                returned: AtomicU64::new(0),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns the pool limits.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Rents a zero-filled buffer of exactly `len` bytes.
    pub fn rent(&self, len: usize) -> Result<PooledBuf, ProtocolError> {
        let mut buf = self.rent_with_capacity(len)?;
        buf.buf.resize(len, 0);
        Ok(buf)
    }

    /// Rents an empty buffer with at least `capacity` bytes reserved.
    ///
    /// The buffer can then be grown through [`PooledBuf::vec_mut`].
    pub fn rent_with_capacity(&self, capacity: usize) -> Result<PooledBuf, ProtocolError> {
        let shared = &self.shared;
        if capacity > shared.config.max_buffer_len {
            return Err(ProtocolError::PoolExhausted {
                requested: capacity,
                outstanding: shared.outstanding.load(Ordering::Acquire),
            });
        }

        let prev = shared.outstanding.fetch_add(1, Ordering::AcqRel);
        if shared.config.max_outstanding > 0 && prev >= shared.config.max_outstanding {
            shared.outstanding.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!(
                "buffer pool exhausted ({} outstanding, {} bytes requested)",
                prev,
                capacity
            );
            return Err(ProtocolError::PoolExhausted {
                requested: capacity,
                outstanding: prev,
            });
        }
        shared.rented.fetch_add(1, Ordering::Relaxed);

        let mut buf = shared.free.lock().pop().unwrap_or_default();
        if buf.capacity() < capacity {
            buf.reserve_exact(capacity - buf.len());
        }

        Ok(PooledBuf {
            buf,
            pool: Some(self.shared.clone()),
        })
    }

    /// Returns current pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            rented: self.shared.rented.load(Ordering::Relaxed),
            returned: self.shared.returned.load(Ordering::Relaxed),
            outstanding: self.shared.outstanding.load(Ordering::Acquire),
            idle: self.shared.free.lock().len(),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A rented buffer. Returns its storage to the owning pool on drop.
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Option<Arc<PoolShared>>,
}

impl PooledBuf {
    /// Mutable access to the backing vector, for buffers that grow while filled.
    pub fn vec_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Shortens the visible contents to `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Detaches the storage from the pool. The pool counts it as returned.
    pub fn into_vec(mut self) -> Vec<u8> {
        let buf = std::mem::take(&mut self.buf);
        if let Some(shared) = self.pool.take() {
            shared.returned.fetch_add(1, Ordering::Relaxed);
            shared.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
        buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(shared) = self.pool.take() {
            shared.release(std::mem::take(&mut self.buf));
        }
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.buf.len())
            .finish()
    }
}
