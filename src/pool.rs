use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// A small pool of reusable `Vec<u8>` scratch buffers, borrowed for the
/// lifetime of a single `copy-until-boundary` loop and returned on drop
/// (including on every error exit, since the return happens in `Drop`, not
/// at the end of a success path).
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Mutex<Vec<Vec<u8>>>>,
    buf_capacity: usize,
}

impl BufferPool {
    pub fn new(buf_capacity: usize) -> Self {
        BufferPool {
            inner: Arc::new(Mutex::new(Vec::new())),
            buf_capacity,
        }
    }

    /// Borrows a buffer from the pool, allocating a fresh one if none is
    /// free. The returned buffer is empty and has at least `buf_capacity`
    /// bytes of spare capacity.
    pub fn take(&self) -> PooledBuffer {
        let buf = {
            let mut free = self.inner.lock().unwrap();
            free.pop()
        }
        .unwrap_or_else(|| Vec::with_capacity(self.buf_capacity));

        PooledBuffer {
            buf,
            pool: self.inner.clone(),
        }
    }
}

/// A buffer on loan from a [`BufferPool`]. Clears and returns itself to the
/// pool's free list on drop.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.buf.clear();
        let buf = std::mem::take(&mut self.buf);
        if let Ok(mut free) = self.pool.lock() {
            free.push(buf);
        }
    }
}
