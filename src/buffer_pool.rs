//! Reusable transfer buffers.
//!
//! Stream tasks churn through large buffers at a high rate; recycling
//! them through a small pool keeps the hot loops allocation-free.

use std::sync::Mutex;

/// A fixed-size pool of equally sized byte buffers.
///
/// `get` hands out a zeroed buffer, reusing a returned one when
/// available; `put` returns a buffer, dropping it when the pool is full.
/// Buffers of the wrong size (a caller that resized one) are discarded.
///
/// # Examples
///
/// ```
/// use netgauge::buffer_pool::BufferPool;
///
/// let pool = BufferPool::new(131_072, 4);
/// let buf = pool.get();
/// assert_eq!(buf.len(), 131_072);
/// pool.put(buf);
/// ```
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buffer_len: usize,
    capacity: usize,
}

impl BufferPool {
    pub fn new(buffer_len: usize, capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(capacity)),
            buffer_len,
            capacity,
        }
    }

    /// Takes a zeroed buffer of the configured length.
    pub fn get(&self) -> Vec<u8> {
        let recycled = self.buffers.lock().unwrap().pop();
        match recycled {
            Some(buf) => buf,
            None => vec![0u8; self.buffer_len],
        }
    }

    /// Returns a buffer for reuse.
    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.len() != self.buffer_len {
            return;
        }
        buf.fill(0);
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.capacity {
            buffers.push(buf);
        }
    }

    /// Number of buffers currently pooled.
    pub fn pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}
