//! Pooled byte buffers (spec §9 "Buffer pooling"): a sized free-list of
//! `partSize`-byte buffers bounding peak memory at roughly
//! `threads × partSize × 2` (one under encryption, one in flight upload).
//! Callers `get`/`put` explicitly around their read into the buffer and
//! copy the live slice out (into a `Bytes`) before releasing it back to
//! the pool — a pooled buffer is never handed to the networking layer
//! directly.

use parking_lot::Mutex;

pub struct BufferPool {
    part_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(part_size: usize, capacity_hint: usize) -> Self {
        Self {
            part_size,
            free: Mutex::new(Vec::with_capacity(capacity_hint)),
        }
    }

    /// Returns a zero-length buffer with at least `part_size` capacity,
    /// reused from the free-list when available.
    pub fn get(&self) -> Vec<u8> {
        let mut buf = self.free.lock().pop().unwrap_or_default();
        buf.clear();
        if buf.capacity() < self.part_size {
            buf.reserve(self.part_size - buf.capacity());
        }
        buf
    }

    /// Returns a buffer to the pool. Callers must have already copied out
    /// whatever valid bytes they read.
    pub fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut free = self.free.lock();
        // Don't let a pool serving many short-lived transfers grow without
        // bound; a handful of spares per worker is enough.
        if free.len() < 64 {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reused_buffer_has_expected_capacity() {
        let pool = BufferPool::new(1024, 2);
        let buf = pool.get();
        assert!(buf.capacity() >= 1024);
        assert_eq!(buf.len(), 0);
        pool.put(buf);
        let buf2 = pool.get();
        assert!(buf2.capacity() >= 1024);
    }
}
