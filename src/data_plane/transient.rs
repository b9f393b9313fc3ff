//! Transient staging buffer pool.

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

/// Fixed pool of staging buffers for receives whose destination view is
/// not known at post time. Checkout fails rather than blocks when the
/// pool is exhausted; callers fall back to a one-off allocation.
#[derive(Clone)]
pub struct TransientPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    buffers: Mutex<Vec<BytesMut>>,
    buffer_size: usize,
}

impl TransientPool {
    pub fn new(buffer_size: usize, count: usize) -> Self {
        let buffers = (0..count)
            .map(|_| BytesMut::with_capacity(buffer_size))
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                buffers: Mutex::new(buffers),
                buffer_size,
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn available(&self) -> usize {
        self.inner.buffers.lock().expect("transient pool poisoned").len()
    }

    pub fn checkout(&self) -> Option<TransientBuffer> {
        let mut buffers = self.inner.buffers.lock().expect("transient pool poisoned");
        let buf = buffers.pop()?;
        Some(TransientBuffer {
            buf: Some(buf),
            inner: Arc::clone(&self.inner),
        })
    }
}

/// A checked-out staging buffer; returns to the pool on drop.
pub struct TransientBuffer {
    buf: Option<BytesMut>,
    inner: Arc<PoolInner>,
}

impl TransientBuffer {
    pub fn capacity(&self) -> usize {
        self.inner.buffer_size
    }

    /// Stage `data` and copy it out as an owned `Bytes`.
    pub fn stage(&mut self, data: &[u8]) -> Bytes {
        let buf = self.buf.as_mut().expect("transient buffer taken");
        buf.clear();
        buf.extend_from_slice(data);
        Bytes::copy_from_slice(buf)
    }
}

impl Drop for TransientBuffer {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.clear();
            self.inner
                .buffers
                .lock()
                .expect("transient pool poisoned")
                .push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_and_return() {
        let pool = TransientPool::new(64, 2);
        assert_eq!(pool.available(), 2);

        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        assert!(pool.checkout().is_none());
        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn stage_copies_out() {
        let pool = TransientPool::new(16, 1);
        let mut buf = pool.checkout().unwrap();
        let staged = buf.stage(b"abc");
        assert_eq!(staged, Bytes::from_static(b"abc"));
    }
}
