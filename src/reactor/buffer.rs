//! Fixed-size buffer pool for connection I/O.
//!
//! Buffers are pre-allocated and reused to avoid allocation overhead on the
//! hot path. Echo never reads while a write is pending, so each connection
//! needs exactly one buffer: reads fill it, writes drain it.

/// Pool of fixed-size buffers with a LIFO free list.
pub struct BufferPool {
    /// Actual buffer storage.
    buffers: Vec<Vec<u8>>,
    /// Stack of available buffer indices (LIFO for cache locality).
    free_list: Vec<usize>,
    /// Size of each buffer.
    buffer_size: usize,
}

impl BufferPool {
    /// Create a pool of `count` buffers of `size` bytes each.
    pub fn new(count: usize, size: usize) -> Self {
        let buffers = (0..count).map(|_| vec![0u8; size]).collect();
        let free_list = (0..count).collect();

        Self {
            buffers,
            free_list,
            buffer_size: size,
        }
    }

    /// Allocate a buffer from the pool.
    ///
    /// Returns `None` if no buffers are available.
    pub fn alloc(&mut self) -> Option<usize> {
        self.free_list.pop()
    }

    /// Return a buffer to the pool.
    pub fn free(&mut self, idx: usize) {
        debug_assert!(idx < self.buffers.len(), "buffer index out of bounds");
        self.free_list.push(idx);
    }

    /// Get an immutable reference to a buffer.
    ///
    /// # Panics
    /// Panics if `idx` is out of bounds.
    pub fn get(&self, idx: usize) -> &[u8] {
        &self.buffers[idx]
    }

    /// Get a mutable reference to a buffer.
    ///
    /// # Panics
    /// Panics if `idx` is out of bounds.
    pub fn get_mut(&mut self, idx: usize) -> &mut [u8] {
        &mut self.buffers[idx]
    }

    /// Size of each buffer in the pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of available buffers.
    pub fn available(&self) -> usize {
        self.free_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_free() {
        let mut pool = BufferPool::new(2, 64);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.buffer_size(), 64);

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.available(), 0);
        assert!(pool.alloc().is_none());

        pool.free(a);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.alloc(), Some(a));
    }

    #[test]
    fn test_buffer_contents_survive_reuse() {
        let mut pool = BufferPool::new(1, 8);
        let idx = pool.alloc().unwrap();
        pool.get_mut(idx).copy_from_slice(b"abcdefgh");
        pool.free(idx);

        let idx = pool.alloc().unwrap();
        assert_eq!(pool.get(idx), b"abcdefgh");
    }
}
