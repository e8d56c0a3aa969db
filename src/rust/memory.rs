//! Accounting for the numeric buffers the pipeline allocates.
//!
//! Every tensor buffer created while serving a request is registered with a
//! [`TensorMemory`] through a [`TrackedBuffer`] guard. The guard unregisters
//! on drop, so a buffer is accounted for exactly as long as it is alive on
//! both the success and the error path.
//!
//! Input tensors are recycled through a bounded [`BufferPool`]. Buffers
//! parked in the pool are not live, but they are still resident; the
//! [`crate::MemoryReclaimer`] drains them.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

/// Default number of cached input buffers kept between calls.
pub const DEFAULT_POOL_CAPACITY: usize = 4;

/// Point-in-time view of live and cached tensor memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    /// Buffers currently owned by an in-flight call
    pub live_buffers: usize,
    /// Bytes held by live buffers
    pub live_bytes: usize,
    /// Buffers parked in the pool for reuse
    pub cached_buffers: usize,
    /// Bytes held by parked buffers
    pub cached_bytes: usize,
    /// Buffers registered since start-up
    pub total_allocations: u64,
}

impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "live={} ({} bytes), cached={} ({} bytes)",
            self.live_buffers, self.live_bytes, self.cached_buffers, self.cached_bytes
        )
    }
}

/// Live-buffer ledger plus the pool of reusable input buffers.
#[derive(Debug)]
pub struct TensorMemory {
    live_buffers: AtomicUsize,
    live_bytes: AtomicUsize,
    total_allocations: AtomicU64,
    pool: BufferPool,
}

impl TensorMemory {
    pub fn new(pool_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            live_buffers: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
            total_allocations: AtomicU64::new(0),
            pool: BufferPool::new(pool_capacity),
        })
    }

    /// Registers a live buffer of `bytes` bytes until the returned guard drops.
    pub fn track(self: &Arc<Self>, bytes: usize) -> TrackedBuffer {
        self.live_buffers.fetch_add(1, Ordering::AcqRel);
        self.live_bytes.fetch_add(bytes, Ordering::AcqRel);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        TrackedBuffer {
            memory: Arc::clone(self),
            bytes,
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn stats(&self) -> MemoryStats {
        let (cached_buffers, cached_bytes) = self.pool.usage();
        MemoryStats {
            live_buffers: self.live_buffers.load(Ordering::Acquire),
            live_bytes: self.live_bytes.load(Ordering::Acquire),
            cached_buffers,
            cached_bytes,
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
        }
    }

    fn release(&self, bytes: usize) {
        self.live_buffers.fetch_sub(1, Ordering::AcqRel);
        self.live_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Guard for one registered buffer. Dropping it unregisters the buffer.
#[derive(Debug)]
pub struct TrackedBuffer {
    memory: Arc<TensorMemory>,
    bytes: usize,
}

impl Drop for TrackedBuffer {
    fn drop(&mut self) {
        self.memory.release(self.bytes);
    }
}

/// Bounded, thread-safe pool of `f32` buffers.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<f32>>>,
    max_buffers: usize,
}

impl BufferPool {
    pub fn new(max_buffers: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_buffers)),
            max_buffers,
        }
    }

    /// Takes a cleared buffer with room for at least `len` values.
    pub fn acquire(&self, len: usize) -> Vec<f32> {
        let cached = self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match cached {
            Some(mut buffer) => {
                buffer.clear();
                buffer.reserve(len);
                buffer
            }
            None => Vec::with_capacity(len),
        }
    }

    /// Returns a buffer for reuse. Dropped instead when the pool is full.
    pub fn release(&self, mut buffer: Vec<f32>) {
        buffer.clear();
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if buffers.len() < self.max_buffers {
            buffers.push(buffer);
        }
    }

    /// Frees every parked buffer, returning how many were dropped.
    pub fn drain(&self) -> usize {
        let drained = {
            let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *buffers)
        };
        drained.len()
    }

    fn usage(&self) -> (usize, usize) {
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes = buffers
            .iter()
            .map(|b| b.capacity() * std::mem::size_of::<f32>())
            .sum();
        (buffers.len(), bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_buffer_released_on_drop() {
        let memory = TensorMemory::new(2);
        {
            let _a = memory.track(100);
            let _b = memory.track(28);
            let stats = memory.stats();
            assert_eq!(stats.live_buffers, 2);
            assert_eq!(stats.live_bytes, 128);
        }
        let stats = memory.stats();
        assert_eq!(stats.live_buffers, 0);
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(stats.total_allocations, 2);
    }

    #[test]
    fn test_tracked_buffer_released_on_error_path() {
        let memory = TensorMemory::new(2);
        let failing = |memory: &Arc<TensorMemory>| -> Result<(), String> {
            let _guard = memory.track(64);
            Err("forward pass failed".to_string())
        };
        assert!(failing(&memory).is_err());
        assert_eq!(memory.stats().live_buffers, 0);
    }

    #[test]
    fn test_pool_reuses_and_caps_buffers() {
        let pool = BufferPool::new(1);
        let mut first = pool.acquire(16);
        first.extend_from_slice(&[1.0; 16]);
        pool.release(first);
        pool.release(vec![0.0; 8]);
        assert_eq!(pool.usage().0, 1);

        let reused = pool.acquire(16);
        assert!(reused.is_empty());
        assert!(reused.capacity() >= 16);
        assert_eq!(pool.usage().0, 0);
    }

    #[test]
    fn test_pool_drain() {
        let memory = TensorMemory::new(4);
        memory.pool().release(Vec::with_capacity(10));
        memory.pool().release(Vec::with_capacity(10));
        assert_eq!(memory.stats().cached_buffers, 2);
        assert!(memory.stats().cached_bytes >= 80);
        assert_eq!(memory.pool().drain(), 2);
        assert_eq!(memory.stats().cached_bytes, 0);
    }
}
