use std::sync::{Arc, Weak};

use crate::buffer::pool::PoolShared;
use crate::session::Session;

/// Allocation granularity: logical sizes round up to a multiple of this.
pub const DEFAULT_CHUNK_SIZE: usize = 2048;
/// Hard cap on a single buffer.
pub const MAX_BUF_SIZE: usize = 256 * 1024 * 1024;

pub(crate) fn round_up(value: usize, chunk: usize) -> usize {
    let rem = value % chunk;
    if rem > 0 {
        value + chunk - rem
    } else {
        value
    }
}

/// A growable byte container with independent read/write cursors.
///
/// The logical `size` is always within the allocated capacity, and both
/// cursors stay within `size`. Reads past the logical size yield the zero
/// value; writes that would cross it are refused outright, so an `IoBuf` can
/// never be driven out of bounds by cursor arithmetic.
///
/// The `code`/`flag`/`kind`/`state` tags carry out-of-band routing metadata
/// for higher layers; the engine itself uses `kind` to mark queued frames as
/// incoming or outgoing and lends `state`/`flag` to the frame codec for its
/// per-session extraction state.
///
/// A buffer acquired from a [`BufferPool`](crate::BufferPool) is recyclable:
/// dropping it returns the storage to the pool. The back-references to the
/// pool and to the owning [`Session`] are weak and never extend either
/// lifetime.
#[derive(Debug)]
pub struct IoBuf {
    data: Vec<u8>,
    size: usize,
    read_pos: usize,
    write_pos: usize,

    code: i32,
    flag: i32,
    kind: i32,
    state: i32,

    recyclable: bool,
    chunk: usize,
    max: usize,

    pool: Weak<PoolShared>,
    session: Weak<Session>,
}

impl IoBuf {
    /// Create a standalone (non-pooled) buffer with the given logical size.
    pub fn new(size: usize) -> IoBuf {
        let size = size.min(MAX_BUF_SIZE);
        let alloc = round_up(size, DEFAULT_CHUNK_SIZE).min(MAX_BUF_SIZE.max(size));
        IoBuf {
            data: vec![0; alloc],
            size,
            read_pos: 0,
            write_pos: 0,
            code: 0,
            flag: 0,
            kind: 0,
            state: 0,
            recyclable: false,
            chunk: DEFAULT_CHUNK_SIZE,
            max: MAX_BUF_SIZE,
            pool: Weak::new(),
            session: Weak::new(),
        }
    }

    /// Create a standalone buffer holding a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> IoBuf {
        let mut buf = IoBuf::new(bytes.len());
        buf.put_bytes(bytes);
        buf.write_pos = 0;
        buf
    }

    pub(crate) fn from_storage(
        mut storage: Vec<u8>,
        size: usize,
        chunk: usize,
        max: usize,
        pool: Weak<PoolShared>,
    ) -> IoBuf {
        if storage.len() < size {
            let alloc = round_up(size, chunk).min(max.max(size));
            storage.resize(alloc, 0);
        }
        IoBuf {
            data: storage,
            size,
            read_pos: 0,
            write_pos: 0,
            code: 0,
            flag: 0,
            kind: 0,
            state: 0,
            recyclable: true,
            chunk,
            max,
            pool,
            session: Weak::new(),
        }
    }

    /// The logical size: the byte range the cursors may touch.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Allocated capacity, always at least `size`.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Ask for a new logical size and return the size actually granted.
    ///
    /// Growth past the current capacity reallocates at chunk granularity;
    /// requests above the hard cap are clamped to it.
    pub fn resize(&mut self, value: usize) -> usize {
        let value = value.min(self.max);
        if value > self.data.len() {
            let alloc = round_up(value, self.chunk).min(self.max.max(value));
            self.data.resize(alloc, 0);
        }
        self.size = value;
        if self.read_pos > self.size {
            self.read_pos = self.size;
        }
        if self.write_pos > self.size {
            self.write_pos = self.size;
        }
        self.size
    }

    /// Reset to an empty buffer: zero size, both cursors at the start.
    pub fn clear(&mut self) {
        self.size = 0;
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Move the unread tail to the front and shrink the logical size to it.
    pub fn compact(&mut self) {
        let start = self.read_pos.min(self.size);
        let left = self.size - start;
        self.data.copy_within(start..self.size, 0);
        self.size = left;
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// The full logical contents, independent of the cursors.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// Unread remainder: everything between the read cursor and the size.
    pub fn remaining(&self) -> usize {
        self.size - self.read_pos.min(self.size)
    }

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn set_read_pos(&mut self, pos: usize) {
        self.read_pos = pos.min(self.size);
    }

    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    pub fn set_write_pos(&mut self, pos: usize) {
        self.write_pos = pos.min(self.size);
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn set_code(&mut self, value: i32) {
        self.code = value;
    }

    pub fn flag(&self) -> i32 {
        self.flag
    }

    pub fn set_flag(&mut self, value: i32) {
        self.flag = value;
    }

    pub fn kind(&self) -> i32 {
        self.kind
    }

    pub fn set_kind(&mut self, value: i32) {
        self.kind = value;
    }

    pub fn state(&self) -> i32 {
        self.state
    }

    pub fn set_state(&mut self, value: i32) {
        self.state = value;
    }

    pub fn recyclable(&self) -> bool {
        self.recyclable
    }

    pub fn set_recyclable(&mut self, value: bool) {
        self.recyclable = value;
    }

    /// Look up the owning session, if it is still alive.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    pub(crate) fn bind_session(&mut self, session: &Arc<Session>) {
        self.session = Arc::downgrade(session);
    }

    pub fn get_u8(&mut self) -> u8 {
        if self.read_pos + 1 > self.size {
            return 0;
        }
        let value = self.data[self.read_pos];
        self.read_pos += 1;
        value
    }

    pub fn get_i16(&mut self) -> i16 {
        const WIDTH: usize = 2;
        if self.read_pos + WIDTH > self.size {
            return 0;
        }
        let mut raw = [0u8; WIDTH];
        raw.copy_from_slice(&self.data[self.read_pos..self.read_pos + WIDTH]);
        self.read_pos += WIDTH;
        i16::from_be_bytes(raw)
    }

    pub fn get_i32(&mut self) -> i32 {
        const WIDTH: usize = 4;
        if self.read_pos + WIDTH > self.size {
            return 0;
        }
        let mut raw = [0u8; WIDTH];
        raw.copy_from_slice(&self.data[self.read_pos..self.read_pos + WIDTH]);
        self.read_pos += WIDTH;
        i32::from_be_bytes(raw)
    }

    pub fn get_f64(&mut self) -> f64 {
        const WIDTH: usize = 8;
        if self.read_pos + WIDTH > self.size {
            return 0.0;
        }
        let mut raw = [0u8; WIDTH];
        raw.copy_from_slice(&self.data[self.read_pos..self.read_pos + WIDTH]);
        self.read_pos += WIDTH;
        f64::from_be_bytes(raw)
    }

    /// Copy up to `out.len()` bytes to `out`, returning how many were copied.
    pub fn get_bytes(&mut self, out: &mut [u8]) -> usize {
        let len = out.len().min(self.remaining());
        if len == 0 {
            return 0;
        }
        out[..len].copy_from_slice(&self.data[self.read_pos..self.read_pos + len]);
        self.read_pos += len;
        len
    }

    /// Read up to `len` bytes as a string, lossily decoding invalid UTF-8.
    pub fn get_str(&mut self, len: usize) -> String {
        let len = len.min(self.remaining());
        if len == 0 {
            return String::new();
        }
        let value =
            String::from_utf8_lossy(&self.data[self.read_pos..self.read_pos + len]).into_owned();
        self.read_pos += len;
        value
    }

    pub fn put_u8(&mut self, value: u8) {
        if self.write_pos + 1 > self.size {
            return;
        }
        self.data[self.write_pos] = value;
        self.write_pos += 1;
    }

    pub fn put_i16(&mut self, value: i16) {
        const WIDTH: usize = 2;
        if self.write_pos + WIDTH > self.size {
            return;
        }
        self.data[self.write_pos..self.write_pos + WIDTH].copy_from_slice(&value.to_be_bytes());
        self.write_pos += WIDTH;
    }

    pub fn put_i32(&mut self, value: i32) {
        const WIDTH: usize = 4;
        if self.write_pos + WIDTH > self.size {
            return;
        }
        self.data[self.write_pos..self.write_pos + WIDTH].copy_from_slice(&value.to_be_bytes());
        self.write_pos += WIDTH;
    }

    pub fn put_f64(&mut self, value: f64) {
        const WIDTH: usize = 8;
        if self.write_pos + WIDTH > self.size {
            return;
        }
        self.data[self.write_pos..self.write_pos + WIDTH].copy_from_slice(&value.to_be_bytes());
        self.write_pos += WIDTH;
    }

    /// Write the whole slice, or nothing at all if it does not fit.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        if self.write_pos + bytes.len() > self.size {
            return;
        }
        self.data[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
    }

    pub fn put_str(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    pub(crate) fn take_storage(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

impl Drop for IoBuf {
    fn drop(&mut self) {
        if !self.recyclable || self.data.is_empty() {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            let storage = self.take_storage();
            pool.restock(storage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_and_capacity_invariants() {
        let buf = IoBuf::new(100);
        assert_eq!(buf.size(), 100);
        assert!(buf.capacity() >= buf.size());
        // allocation is chunk-granular
        assert_eq!(buf.capacity() % DEFAULT_CHUNK_SIZE, 0);
    }

    #[test]
    fn accessors_round_trip() {
        let mut buf = IoBuf::new(64);
        buf.put_u8(0x7f);
        buf.put_i16(-2);
        buf.put_i32(123_456);
        buf.put_f64(2.5);
        buf.put_str("hello");

        assert_eq!(buf.get_u8(), 0x7f);
        assert_eq!(buf.get_i16(), -2);
        assert_eq!(buf.get_i32(), 123_456);
        assert_eq!(buf.get_f64(), 2.5);
        assert_eq!(buf.get_str(5), "hello");
    }

    #[test]
    fn reads_past_size_yield_zero() {
        let mut buf = IoBuf::new(2);
        assert_eq!(buf.get_i32(), 0);
        assert_eq!(buf.read_pos(), 0);
        assert_eq!(buf.get_i16(), 0);
        assert_eq!(buf.read_pos(), 2);
        assert_eq!(buf.get_u8(), 0);
    }

    #[test]
    fn writes_past_size_are_refused() {
        let mut buf = IoBuf::new(3);
        buf.put_i32(42);
        assert_eq!(buf.write_pos(), 0);
        buf.put_bytes(b"abcd");
        assert_eq!(buf.write_pos(), 0);
        buf.put_u8(1);
        assert_eq!(buf.write_pos(), 1);
    }

    #[test]
    fn resize_grows_and_clamps() {
        let mut buf = IoBuf::new(10);
        let cap = buf.capacity();
        assert_eq!(buf.resize(cap + 1), cap + 1);
        assert!(buf.capacity() >= cap + 1);

        // cursors stay inside the logical size after shrinking
        buf.set_read_pos(cap);
        buf.resize(4);
        assert_eq!(buf.read_pos(), 4);
    }

    #[test]
    fn compact_keeps_unread_tail() {
        let mut buf = IoBuf::from_slice(b"0123456789");
        buf.set_read_pos(6);
        buf.compact();
        assert_eq!(buf.bytes(), b"6789");
        assert_eq!(buf.read_pos(), 0);
        assert_eq!(buf.size(), 4);
    }
}
