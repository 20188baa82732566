//! Pooled buffers backing every I/O operation.
//!
//! [`IoBuf`] is a growable byte container with independent read/write
//! cursors, fixed-width accessors, and a tag set for out-of-band metadata.
//! [`BufferPool`] is the thread-safe free list they are recycled through.

pub use io_buf::{IoBuf, DEFAULT_CHUNK_SIZE, MAX_BUF_SIZE};
pub use pool::BufferPool;

mod io_buf;
mod pool;
