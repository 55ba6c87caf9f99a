//! Reusable byte buffers for request and response bodies.
use std::{
    ops::{Deref, DerefMut},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::BytesMut;

const INITIAL_CAPACITY: usize = 4 * 1024;
/// Default ceiling on the capacity a buffer may keep while idle.
pub const DEFAULT_MAX_RETAINED_CAPACITY: usize = 64 * 1024;

#[derive(Debug)]
struct Inner {
    idle: Mutex<Vec<BytesMut>>,
    max_idle: usize,
    max_retained_capacity: usize,
    outstanding: AtomicUsize,
}

/// Pool of `BytesMut` buffers handed out as [`PooledBuffer`] guards.
///
/// A guard returns its buffer on drop, so release happens on every exit path of the
/// holder, including early returns, timeouts and panics.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl BufferPool {
    pub fn new(max_idle: usize) -> Self {
        Self::with_max_retained_capacity(max_idle, DEFAULT_MAX_RETAINED_CAPACITY)
    }

    /// Buffers that grew past `max_retained_capacity` are freed on release instead of
    /// going back to the idle list.
    pub fn with_max_retained_capacity(max_idle: usize, max_retained_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                idle: Mutex::new(Vec::new()),
                max_idle,
                max_retained_capacity: max_retained_capacity.max(INITIAL_CAPACITY),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    pub fn acquire(&self) -> PooledBuffer {
        let buf = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(INITIAL_CAPACITY));
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuffer {
            buf,
            pool: self.inner.clone(),
        }
    }

    /// Buffers currently held by callers
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Buffers waiting for reuse
    pub fn idle(&self) -> usize {
        self.inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A buffer borrowed from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<Inner>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
        let mut buf = std::mem::take(&mut self.buf);
        if buf.capacity() > self.pool.max_retained_capacity {
            return;
        }
        buf.clear();
        let mut idle = self.pool.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.pool.max_idle {
            idle.push(buf);
        }
    }
}
