use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Reusable chunk buffers shared by the workers and the result sink.
///
/// Every buffer the pool hands out is backed by a full `chunk_len` allocation.
/// Workers may view it shorter (the last chunk of a file), but the pool always
/// stores the full-length buffer again on release, so capacity never shrinks.
#[derive(Debug)]
pub struct BufferPool {
    chunk_len: usize,
    idle: Mutex<Vec<BytesMut>>,
    allocated: AtomicUsize,
    limit: Option<Arc<Semaphore>>,
}

/// A buffer checked out of a [`BufferPool`].
///
/// Release goes through [`BufferPool::release`], which consumes the handle,
/// so a buffer cannot be returned twice.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    _permit: Option<OwnedSemaphorePermit>,
}

impl BufferPool {
    pub fn new(chunk_len: usize) -> Self {
        Self {
            chunk_len,
            idle: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
            limit: None,
        }
    }

    /// Caps the number of buffers that may be checked out at once.
    /// Acquisition past the cap waits for a release instead of failing.
    pub fn with_cap(chunk_len: usize, cap: usize) -> Self {
        Self {
            limit: Some(Arc::new(Semaphore::new(cap.max(1)))),
            ..Self::new(chunk_len)
        }
    }

    /// Checks out a buffer viewed as `len` bytes. `len` larger than the
    /// chunk length is clamped.
    pub async fn acquire(&self, len: usize) -> PooledBuffer {
        let permit = match &self.limit {
            // the semaphore is never closed, so acquisition only fails if it were
            Some(limit) => limit.clone().acquire_owned().await.ok(),
            None => None,
        };

        let mut buf = self.idle.lock().pop().unwrap_or_else(|| {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            BytesMut::zeroed(self.chunk_len)
        });
        buf.truncate(len.min(self.chunk_len));

        PooledBuffer {
            buf,
            _permit: permit,
        }
    }

    pub fn release(&self, buffer: PooledBuffer) {
        let PooledBuffer { mut buf, _permit } = buffer;
        if buf.capacity() < self.chunk_len {
            // not one of ours; let it go rather than shrink a slot
            self.allocated.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        buf.resize(self.chunk_len, 0);
        self.idle.lock().push(buf);
    }

    /// Accounts for a checked-out buffer that will never come back, e.g.
    /// one dropped while its worker panicked.
    pub fn mark_lost(&self) {
        self.allocated.fetch_sub(1, Ordering::Relaxed);
    }

    /// Number of buffers currently sitting in the pool.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Number of buffers the pool has allocated and not lost.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl PooledBuffer {
    /// Size of the backing allocation, independent of the current view.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}
