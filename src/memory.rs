//! Host and device buffers for the emulated accelerator
//!
//! Every buffer is accounted against its device's memory budget and released
//! when the last handle is dropped.

use crate::error::{Result, RuntimeError};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

const MB: f64 = 1024.0 * 1024.0;

/// Where a buffer lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Pinned host memory, readable by the host at any time
    Host,
    /// Device-resident memory
    Device,
    /// Memory visible to both sides
    Shared,
}

/// Tracks live and peak bytes for one device
#[derive(Debug)]
pub struct MemoryTracker {
    limit: usize,
    in_use: AtomicUsize,
    peak: AtomicUsize,
    live_allocations: AtomicUsize,
}

/// Snapshot of a device's memory accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes currently allocated
    pub bytes_in_use: usize,
    /// Highest value `bytes_in_use` reached
    pub peak_bytes: usize,
    /// Number of live buffers
    pub live_allocations: usize,
    /// Budget in bytes
    pub limit_bytes: usize,
}

impl MemoryTracker {
    /// Create a tracker with a budget in bytes
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_use: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            live_allocations: AtomicUsize::new(0),
        }
    }

    fn reserve(&self, bytes: usize) -> Result<()> {
        let mut current = self.in_use.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.limit {
                return Err(RuntimeError::OutOfMemory {
                    requested_mb: bytes as f64 / MB,
                    available_mb: (self.limit - current) as f64 / MB,
                });
            }
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::Relaxed);
                    self.live_allocations.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn available_bytes(&self) -> usize {
        self.limit.saturating_sub(self.in_use.load(Ordering::Relaxed))
    }

    fn release(&self, bytes: usize) {
        self.in_use.fetch_sub(bytes, Ordering::AcqRel);
        self.live_allocations.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current accounting snapshot
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            bytes_in_use: self.in_use.load(Ordering::Relaxed),
            peak_bytes: self.peak.load(Ordering::Relaxed),
            live_allocations: self.live_allocations.load(Ordering::Relaxed),
            limit_bytes: self.limit,
        }
    }
}

struct BufferInner<T> {
    id: u64,
    kind: MemoryKind,
    len: usize,
    data: RwLock<Vec<T>>,
    tracker: Arc<MemoryTracker>,
}

impl<T> Drop for BufferInner<T> {
    fn drop(&mut self) {
        self.tracker.release(self.len * std::mem::size_of::<T>());
        tracing::debug!("Freed buffer #{} ({:?}, {} elements)", self.id, self.kind, self.len);
    }
}

/// Fixed-size typed buffer; clones share the same allocation
pub struct Buffer<T> {
    inner: Arc<BufferInner<T>>,
}

impl<T> Clone for Buffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("len", &self.inner.len)
            .finish()
    }
}

impl<T: Copy + Default + Send + Sync + 'static> Buffer<T> {
    /// Allocate `len` default-initialized elements against `tracker`
    pub fn allocate(kind: MemoryKind, len: usize, tracker: Arc<MemoryTracker>) -> Result<Self> {
        if len == 0 {
            return Err(RuntimeError::Buffer("zero-length allocation".to_string()));
        }
        let bytes = len
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| RuntimeError::OutOfMemory {
                requested_mb: len as f64 * std::mem::size_of::<T>() as f64 / MB,
                available_mb: tracker.available_bytes() as f64 / MB,
            })?;
        tracker.reserve(bytes)?;

        let id = NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Allocated buffer #{} ({:?}, {} elements)", id, kind, len);

        Ok(Self {
            inner: Arc::new(BufferInner {
                id,
                kind,
                len,
                data: RwLock::new(vec![T::default(); len]),
                tracker,
            }),
        })
    }

    /// Overwrite the buffer from a host slice of the same length
    pub fn copy_from_slice(&self, src: &[T]) -> Result<()> {
        if src.len() != self.len() {
            return Err(RuntimeError::Buffer(format!(
                "source has {} elements, buffer #{} has {}",
                src.len(),
                self.id(),
                self.len()
            )));
        }
        self.write().copy_from_slice(src);
        Ok(())
    }

    /// Copy the contents out
    pub fn to_vec(&self) -> Vec<T> {
        self.read().clone()
    }
}

impl<T> Buffer<T> {
    /// Allocation id, unique per process
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Memory kind
    pub fn kind(&self) -> MemoryKind {
        self.inner.kind
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// Always false; zero-length buffers are rejected at allocation
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Size in bytes
    pub fn size_bytes(&self) -> usize {
        self.inner.len * std::mem::size_of::<T>()
    }

    /// True if both handles name the same allocation
    pub fn same_allocation(&self, other: &Buffer<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Shared access to the contents
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.inner.data.read()
    }

    /// Exclusive access to the contents
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.inner.data.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_accounting() {
        let tracker = Arc::new(MemoryTracker::new(1024));
        let a = Buffer::<f64>::allocate(MemoryKind::Device, 16, tracker.clone()).unwrap();
        let b = Buffer::<f32>::allocate(MemoryKind::Host, 32, tracker.clone()).unwrap();

        let stats = tracker.stats();
        assert_eq!(stats.bytes_in_use, 256);
        assert_eq!(stats.live_allocations, 2);

        drop(a);
        let stats = tracker.stats();
        assert_eq!(stats.bytes_in_use, 128);
        assert_eq!(stats.peak_bytes, 256);
        assert_eq!(b.size_bytes(), 128);
    }

    #[test]
    fn test_budget_exhausted() {
        let tracker = Arc::new(MemoryTracker::new(64));
        let err = Buffer::<f64>::allocate(MemoryKind::Device, 9, tracker).unwrap_err();
        assert!(matches!(err, RuntimeError::OutOfMemory { .. }));
    }

    #[test]
    fn test_oversized_length_does_not_wrap() {
        let tracker = Arc::new(MemoryTracker::new(1 << 20));
        let err = Buffer::<f32>::allocate(MemoryKind::Host, 1 << 62, tracker.clone()).unwrap_err();
        assert!(matches!(err, RuntimeError::OutOfMemory { .. }));

        let err = Buffer::<f64>::allocate(MemoryKind::Device, usize::MAX, tracker.clone()).unwrap_err();
        assert!(matches!(err, RuntimeError::OutOfMemory { .. }));
        assert_eq!(tracker.stats().bytes_in_use, 0);
    }

    #[test]
    fn test_zero_length_rejected() {
        let tracker = Arc::new(MemoryTracker::new(64));
        assert!(Buffer::<f32>::allocate(MemoryKind::Host, 0, tracker).is_err());
    }

    #[test]
    fn test_clone_shares_allocation() {
        let tracker = Arc::new(MemoryTracker::new(1024));
        let a = Buffer::<f32>::allocate(MemoryKind::Shared, 4, tracker.clone()).unwrap();
        let b = a.clone();
        a.copy_from_slice(&[1.0, 2.0, 3.0, 4.0]).unwrap();

        assert!(a.same_allocation(&b));
        assert_eq!(b.to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(tracker.stats().live_allocations, 1);
        assert!(a.copy_from_slice(&[1.0]).is_err());
    }
}
