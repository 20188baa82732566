use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::buffer::io_buf::{round_up, IoBuf};
use crate::service::BufferPoolConfig;

#[derive(Debug)]
pub(crate) struct PoolShared {
    free: Mutex<Vec<Vec<u8>>>,
    chunk: usize,
    max: usize,
}

impl PoolShared {
    pub(crate) fn restock(&self, storage: Vec<u8>) {
        self.free.lock().push(storage);
    }
}

/// A thread-safe free list of reusable buffers.
///
/// `acquire` hands out a buffer of at least the requested logical size,
/// growing the pool with a fresh allocation when no free buffer is available
/// rather than making the caller wait. Dropping a recyclable buffer returns
/// its storage here; a buffer is on the free list or in flight, never both.
#[derive(Debug, Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(config: &BufferPoolConfig) -> BufferPool {
        let chunk = config.chunk_size.max(1);
        let max = config.max_buffer_size.max(chunk);
        let mut free = Vec::with_capacity(config.initial_buffers);
        for _ in 0..config.initial_buffers {
            free.push(vec![0; chunk]);
        }
        BufferPool {
            shared: Arc::new(PoolShared {
                free: Mutex::new(free),
                chunk,
                max,
            }),
        }
    }

    /// Hand out a buffer with logical size `size`, cursors reset to zero.
    ///
    /// Requests above the pool's hard cap fail with `None`; an empty free
    /// list allocates instead of blocking.
    pub fn acquire(&self, size: usize) -> Option<IoBuf> {
        if size > self.shared.max {
            warn!("fail to get free buffer with size {}", size);
            return None;
        }
        let storage = self.shared.free.lock().pop();
        let storage = match storage {
            Some(storage) => storage,
            None => {
                let alloc = round_up(size, self.shared.chunk).min(self.shared.max.max(size));
                vec![0; alloc]
            }
        };
        Some(IoBuf::from_storage(
            storage,
            size,
            self.shared.chunk,
            self.shared.max,
            Arc::downgrade(&self.shared),
        ))
    }

    /// Return a buffer to the pool. Non-recyclable buffers are freed instead;
    /// recyclable ones would come back on drop anyway, this just makes the
    /// hand-back explicit at the call site.
    pub fn release(&self, buf: IoBuf) {
        drop(buf);
    }

    /// Number of buffers currently on the free list.
    pub fn free_count(&self) -> usize {
        self.shared.free.lock().len()
    }

    pub fn max_buffer_size(&self) -> usize {
        self.shared.max
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new(&BufferPoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_meets_requested_size() {
        let pool = BufferPool::default();
        let buf = pool.acquire(100).unwrap();
        assert!(buf.size() >= 100);
        assert!(buf.capacity() >= buf.size());
        assert!(buf.recyclable());
    }

    #[test]
    fn empty_pool_allocates_instead_of_blocking() {
        let pool = BufferPool::new(&BufferPoolConfig {
            initial_buffers: 0,
            ..Default::default()
        });
        assert_eq!(pool.free_count(), 0);
        assert!(pool.acquire(16).is_some());
    }

    #[test]
    fn dropped_buffers_come_back() {
        let pool = BufferPool::default();
        let buf = pool.acquire(64).unwrap();
        assert_eq!(pool.free_count(), 0);
        drop(buf);
        assert_eq!(pool.free_count(), 1);

        // the recycled storage is handed out again
        let again = pool.acquire(32).unwrap();
        assert_eq!(pool.free_count(), 0);
        assert_eq!(again.size(), 32);
        assert_eq!(again.read_pos(), 0);
        assert_eq!(again.write_pos(), 0);
    }

    #[test]
    fn explicit_release_matches_drop() {
        let pool = BufferPool::default();
        let buf = pool.acquire(8).unwrap();
        pool.release(buf);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn over_cap_requests_fail() {
        let pool = BufferPool::new(&BufferPoolConfig {
            max_buffer_size: 1024,
            ..Default::default()
        });
        assert!(pool.acquire(1025).is_none());
        assert!(pool.acquire(1024).is_some());
    }

    #[test]
    fn initial_buffers_are_preallocated() {
        let pool = BufferPool::new(&BufferPoolConfig {
            initial_buffers: 4,
            ..Default::default()
        });
        assert_eq!(pool.free_count(), 4);
        let _a = pool.acquire(10).unwrap();
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn non_recyclable_buffers_do_not_restock() {
        let pool = BufferPool::default();
        let mut buf = pool.acquire(8).unwrap();
        buf.set_recyclable(false);
        pool.release(buf);
        assert_eq!(pool.free_count(), 0);
    }
}
