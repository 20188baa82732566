//! The per-connection state machine.
//!
//! A [`Session`] owns the read/write frame queues of one connection, drives
//! the frame codec over the accumulated byte stream, and invokes the
//! application [`Handler`]. Ordering guarantees are per direction: an orderly
//! direction delivers frames strictly FIFO and holds the next frame until the
//! previous one's deferred work signals completion.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};

use crate::buffer::{BufferPool, IoBuf};
use crate::codec::{Extracted, FrameCodec, STATE_WAIT_FOR_HEADER};
use crate::service::{SessionConfig, Shutdown};

pub use data::ScratchValue;
pub use handler::{Direction, Handler, IoDirection, ProcessFlags};
pub use registry::SessionRegistry;

mod data;
mod handler;
mod registry;

/// `kind` tag on frames queued for the handler.
pub const KIND_INCOMING: i32 = 1;
pub const KIND_OUTGOING: i32 = 2;

/// The transport halves a session drives. Any duplex byte stream works; TLS
/// streams arrive here already decrypted.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Open,
    Closing,
    Closed,
}

/// Everything a session needs besides its transport.
pub struct SessionParts {
    pub handler: Arc<dyn Handler>,
    pub codec: Option<Arc<dyn FrameCodec>>,
    pub pool: BufferPool,
    pub registry: Option<Arc<SessionRegistry>>,
    pub config: SessionConfig,
    pub read_buffer_size: usize,
}

/// The connection state machine. See the module docs.
///
/// All methods are safe to call from any task; `close` in particular is the
/// only cancellation mechanism and may race freely with the I/O paths.
pub struct Session {
    weak_self: Weak<Session>,

    id: AtomicU64,
    state: Mutex<SessionState>,

    handler: Arc<dyn Handler>,
    codec: Option<Arc<dyn FrameCodec>>,
    pool: BufferPool,
    registry: Weak<SessionRegistry>,

    orderly_read: AtomicBool,
    orderly_write: AtomicBool,
    max_read_queue: AtomicUsize,
    max_write_queue: AtomicUsize,

    read_queue: Mutex<VecDeque<IoBuf>>,
    write_queue: Mutex<VecDeque<IoBuf>>,

    // Outstanding deferred completions, one gate per direction. The gate is
    // held across handler calls, distinct from the queue locks, so orderly
    // delivery stays serialized and a completion signal can never slip in
    // between a delivery and its outstanding count.
    read_gate: tokio::sync::Mutex<i32>,
    write_gate: tokio::sync::Mutex<i32>,

    write_wake: Notify,
    notify_closed: broadcast::Sender<()>,

    last_read_time: Mutex<Instant>,
    last_write_time: Mutex<Instant>,

    read_cache: Mutex<IoBuf>,
    round_cache: Mutex<IoBuf>,
    read_buffer_size: usize,

    local_addr: Mutex<Option<SocketAddr>>,
    peer_addr: Mutex<Option<SocketAddr>>,

    data: DashMap<String, ScratchValue>,
}

impl Session {
    pub fn new(parts: SessionParts) -> Arc<Session> {
        let (notify_closed, _) = broadcast::channel(1);
        let read_buffer_size = parts.read_buffer_size.max(1);

        let mut read_cache = parts
            .pool
            .acquire(read_buffer_size)
            .unwrap_or_else(|| IoBuf::new(read_buffer_size));
        read_cache.clear();
        read_cache.set_state(STATE_WAIT_FOR_HEADER);

        let mut round_cache = parts
            .pool
            .acquire(read_buffer_size)
            .unwrap_or_else(|| IoBuf::new(read_buffer_size));
        round_cache.clear();

        let registry = parts
            .registry
            .as_ref()
            .map(Arc::downgrade)
            .unwrap_or_default();

        Arc::new_cyclic(|weak_self| Session {
            weak_self: weak_self.clone(),
            id: AtomicU64::new(0),
            state: Mutex::new(SessionState::Init),
            handler: parts.handler,
            codec: parts.codec,
            pool: parts.pool,
            registry,
            orderly_read: AtomicBool::new(parts.config.orderly_read),
            orderly_write: AtomicBool::new(parts.config.orderly_write),
            max_read_queue: AtomicUsize::new(parts.config.max_read_queue),
            max_write_queue: AtomicUsize::new(parts.config.max_write_queue),
            read_queue: Mutex::new(VecDeque::new()),
            write_queue: Mutex::new(VecDeque::new()),
            read_gate: tokio::sync::Mutex::new(0),
            write_gate: tokio::sync::Mutex::new(0),
            write_wake: Notify::new(),
            notify_closed,
            last_read_time: Mutex::new(Instant::now()),
            last_write_time: Mutex::new(Instant::now()),
            read_cache: Mutex::new(read_cache),
            round_cache: Mutex::new(round_cache),
            read_buffer_size,
            local_addr: Mutex::new(None),
            peer_addr: Mutex::new(None),
            data: DashMap::new(),
        })
    }

    fn arc(&self) -> Arc<Session> {
        self.weak_self.upgrade().expect("session self reference lost")
    }

    /// Bring the session up on an established transport.
    ///
    /// Registers with the registry, records the endpoints, fires
    /// `on_connect`, and spawns the read and write tasks. Does nothing unless
    /// the session is still in its initial state.
    pub async fn open(
        &self,
        reader: BoxedReader,
        writer: BoxedWriter,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Init {
                return;
            }
            *state = SessionState::Open;
        }

        *self.local_addr.lock() = local_addr;
        *self.peer_addr.lock() = peer_addr;

        if let Some(registry) = self.registry.upgrade() {
            registry.add(&self.arc());
        }

        self.invoke_on_connect().await;

        // the handler may have closed us from on_connect
        if self.state() != SessionState::Open {
            return;
        }

        self.touch_read();
        self.touch_write();

        {
            let mut cache = self.read_cache.lock();
            cache.clear();
            cache.set_state(STATE_WAIT_FOR_HEADER);
            cache.set_flag(0);
        }
        self.round_cache.lock().clear();

        let write_session = self.arc();
        tokio::spawn(async move {
            write_session.write_loop(writer).await;
        });

        let read_session = self.arc();
        tokio::spawn(async move {
            read_session.read_loop(reader).await;
        });
    }

    /// Close the session.
    ///
    /// With `right_now` false and frames still queued in either direction,
    /// only the closing flag is set; the actual shutdown happens when both
    /// queues next drain. Closing an already closed session has no effect.
    pub async fn close(&self, right_now: bool) {
        let mut right_now = right_now;
        if !right_now {
            let write_queue = self.write_queue.lock();
            let read_queue = self.read_queue.lock();
            if write_queue.is_empty() && read_queue.is_empty() {
                right_now = true;
            } else {
                // flip to Closing while both queues are pinned, so the drain
                // paths cannot miss the deferred close
                let mut state = self.state.lock();
                if *state == SessionState::Open {
                    *state = SessionState::Closing;
                }
                return;
            }
        }

        let was = {
            let mut state = self.state.lock();
            let previous = *state;
            if previous == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
            previous
        };

        let _ = self.notify_closed.send(());

        if was == SessionState::Open || was == SessionState::Closing {
            self.invoke_on_disconnect().await;
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id());
        }
    }

    /// Queue a frame for sending. Refused once the session is closing.
    ///
    /// A full outgoing queue drops the frame and reports a capacity error to
    /// the handler.
    pub async fn write(&self, mut frame: IoBuf) {
        if self.state() != SessionState::Open {
            return;
        }
        if self.outgoing_queue_full() {
            self.emit_error(IoDirection::Write, 0, "outgoing message queue is full")
                .await;
            return;
        }
        frame.bind_session(&self.arc());
        self.write_queue.lock().push_back(frame);
        self.write_wake.notify_one();
    }

    /// Queue raw bytes for sending, split at the pool's buffer cap.
    pub async fn write_bytes(&self, bytes: &[u8]) {
        if self.state() != SessionState::Open || bytes.is_empty() {
            return;
        }
        if self.outgoing_queue_full() {
            self.emit_error(IoDirection::Write, 0, "outgoing message queue is full")
                .await;
            return;
        }
        let cap = self.pool.max_buffer_size();
        let mut rest = bytes;
        while !rest.is_empty() {
            let take = rest.len().min(cap);
            let mut frame = match self.acquire_buffer(take) {
                Some(frame) => frame,
                None => return,
            };
            frame.put_bytes(&rest[..take]);
            frame.set_write_pos(0);
            self.write_queue.lock().push_back(frame);
            rest = &rest[take..];
        }
        self.write_wake.notify_one();
    }

    /// Encode a payload through the session's codec and queue it.
    pub async fn write_payload(&self, payload: &[u8]) {
        if let Some(frame) = self.encode(payload) {
            self.write(frame).await;
        }
    }

    /// Fan a payload out to every session in the registry.
    pub async fn broadcast(&self, payload: &[u8]) {
        if let Some(registry) = self.registry.upgrade() {
            registry.broadcast(payload).await;
        }
    }

    /// Drain the incoming frame queue through the handler.
    ///
    /// `is_async_callback` is the completion signal: deferred work on an
    /// orderly session must call this with `true` once it finishes, which
    /// releases the next queued frame.
    pub async fn process_incoming_data(&self, is_async_callback: bool) {
        let mut drained_while_closing = false;

        if self.is_alive() {
            if self.orderly_read.load(Ordering::Relaxed) {
                let mut gate = self.read_gate.lock().await;
                if is_async_callback {
                    *gate -= 1;
                    if *gate < 0 {
                        *gate = 0;
                    }
                }
                if *gate > 0 {
                    return;
                }
                drained_while_closing = self.drain_incoming(Some(&mut gate)).await;
            } else {
                drained_while_closing = self.drain_incoming(None).await;
            }
        }

        if drained_while_closing {
            self.close(true).await;
        }
    }

    /// The write-side counterpart of [`Session::process_incoming_data`]:
    /// deferred `on_write` work signals completion here to release the next
    /// queued write.
    pub async fn process_outgoing_data(&self, is_async_callback: bool) {
        if !self.is_alive() {
            return;
        }
        if self.orderly_write.load(Ordering::Relaxed) {
            let mut gate = self.write_gate.lock().await;
            if is_async_callback {
                *gate -= 1;
                if *gate < 0 {
                    *gate = 0;
                }
            }
            if *gate > 0 {
                return;
            }
        }
        self.write_wake.notify_one();
    }

    /// Check the session against an idle threshold, firing `on_idle` when
    /// exceeded. Never closes the session.
    pub async fn test_idle(&self, kind: Direction, idle_for: Duration) -> bool {
        if self.state() != SessionState::Open {
            return false;
        }
        let read_idle = self.last_read_time.lock().elapsed();
        let write_idle = self.last_write_time.lock().elapsed();

        let is_idle = match kind {
            Direction::Both => read_idle > idle_for && write_idle > idle_for,
            Direction::Read => read_idle > idle_for,
            Direction::Write => write_idle > idle_for,
        };

        if is_idle {
            self.invoke_on_idle(kind).await;
        }
        is_idle
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::Relaxed);
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn connected(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn orderly(&self, direction: Direction) -> bool {
        match direction {
            Direction::Read => self.orderly_read.load(Ordering::Relaxed),
            Direction::Write => self.orderly_write.load(Ordering::Relaxed),
            Direction::Both => {
                self.orderly_read.load(Ordering::Relaxed)
                    && self.orderly_write.load(Ordering::Relaxed)
            }
        }
    }

    pub fn set_orderly(&self, direction: Direction, value: bool) {
        match direction {
            Direction::Read => self.orderly_read.store(value, Ordering::Relaxed),
            Direction::Write => self.orderly_write.store(value, Ordering::Relaxed),
            Direction::Both => {
                self.orderly_read.store(value, Ordering::Relaxed);
                self.orderly_write.store(value, Ordering::Relaxed);
            }
        }
    }

    /// Max queued frames for a direction; 0 means unbounded.
    pub fn max_queue(&self, direction: Direction) -> usize {
        match direction {
            Direction::Write => self.max_write_queue.load(Ordering::Relaxed),
            _ => self.max_read_queue.load(Ordering::Relaxed),
        }
    }

    pub fn set_max_queue(&self, direction: Direction, value: usize) {
        match direction {
            Direction::Read => self.max_read_queue.store(value, Ordering::Relaxed),
            Direction::Write => self.max_write_queue.store(value, Ordering::Relaxed),
            Direction::Both => {
                self.max_read_queue.store(value, Ordering::Relaxed);
                self.max_write_queue.store(value, Ordering::Relaxed);
            }
        }
    }

    /// Frames currently waiting in a queue.
    pub fn queue_len(&self, direction: Direction) -> usize {
        match direction {
            Direction::Write => self.write_queue.lock().len(),
            _ => self.read_queue.lock().len(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock()
    }

    /// Borrow the codec state cache. Used by [`FrameCodec`] implementations
    /// during extraction.
    pub fn read_cache(&self) -> MutexGuard<'_, IoBuf> {
        self.read_cache.lock()
    }

    /// Get a pooled buffer bound to this session.
    pub fn acquire_buffer(&self, size: usize) -> Option<IoBuf> {
        let mut buf = self.pool.acquire(size)?;
        buf.bind_session(&self.arc());
        Some(buf)
    }

    /// Hand a buffer back to the pool explicitly.
    pub fn take_back(&self, buf: IoBuf) {
        self.pool.release(buf);
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn encode(&self, payload: &[u8]) -> Option<IoBuf> {
        self.codec
            .as_ref()
            .and_then(|codec| codec.encode(&self.arc(), payload))
    }

    pub fn decode<'a>(&self, frame: &'a IoBuf) -> Option<&'a [u8]> {
        self.codec.as_ref().map(|codec| codec.decode(frame))
    }

    pub fn registry(&self) -> Option<Arc<SessionRegistry>> {
        self.registry.upgrade()
    }

    pub fn session_count(&self) -> usize {
        self.registry
            .upgrade()
            .map(|registry| registry.session_count())
            .unwrap_or(0)
    }

    pub fn session_by_id(&self, id: u64) -> Option<Arc<Session>> {
        self.registry
            .upgrade()
            .and_then(|registry| registry.session_by_id(id))
    }

    pub fn put_data(&self, key: impl Into<String>, value: impl Into<ScratchValue>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn get_data(&self, key: &str) -> Option<ScratchValue> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    pub fn has_data(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn remove_data(&self, key: &str) -> Option<ScratchValue> {
        self.data.remove(key).map(|(_, value)| value)
    }

    pub fn put_shared(&self, key: impl Into<String>, value: impl Into<ScratchValue>) {
        if let Some(registry) = self.registry.upgrade() {
            registry.put_shared(key, value);
        }
    }

    pub fn get_shared(&self, key: &str) -> Option<ScratchValue> {
        self.registry
            .upgrade()
            .and_then(|registry| registry.get_shared(key))
    }

    pub(crate) fn subscribe_close(&self) -> broadcast::Receiver<()> {
        self.notify_closed.subscribe()
    }

    fn is_alive(&self) -> bool {
        matches!(self.state(), SessionState::Open | SessionState::Closing)
    }

    fn is_closing(&self) -> bool {
        self.state() == SessionState::Closing
    }

    fn outgoing_queue_full(&self) -> bool {
        let max = self.max_write_queue.load(Ordering::Relaxed);
        max > 0 && self.write_queue.lock().len() >= max
    }

    fn touch_read(&self) {
        *self.last_read_time.lock() = Instant::now();
    }

    fn touch_write(&self) {
        *self.last_write_time.lock() = Instant::now();
    }

    async fn read_loop(self: Arc<Self>, mut reader: BoxedReader) {
        let mut shutdown = Shutdown::subscribe(&self.notify_closed);
        let mut staging = vec![0u8; self.read_buffer_size];
        loop {
            let read = tokio::select! {
                result = reader.read(&mut staging) => result,
                _ = shutdown.recv() => {
                    debug!("session {} exit read loop after close signal", self.id());
                    return;
                }
            };

            let n = match read {
                Ok(0) => {
                    debug!("session {} reached end of stream", self.id());
                    self.close(true).await;
                    return;
                }
                Ok(n) => n,
                Err(err) => {
                    let code = err.raw_os_error().unwrap_or(-1);
                    self.emit_error(IoDirection::Read, code, &err.to_string()).await;
                    self.close(true).await;
                    return;
                }
            };

            self.touch_read();

            let frames = match self.extract_frames(&staging[..n]) {
                Ok(frames) => frames,
                Err(violation) => {
                    warn!(
                        "session {}: {}; the session will be closed",
                        self.id(),
                        violation
                    );
                    self.emit_error(IoDirection::Read, 0, &violation).await;
                    self.close(true).await;
                    return;
                }
            };

            if frames.is_empty() {
                continue;
            }

            let (queued, overflowed) = self.enqueue_incoming(frames);
            if overflowed {
                self.emit_error(IoDirection::Read, 0, "incoming message queue is full")
                    .await;
            }
            if queued > 0 {
                self.process_incoming_data(false).await;
            }
            // reading always continues; errors above are the only exits
        }
    }

    /// Append a delivery to the round cache and run the codec over it.
    fn extract_frames(&self, bytes: &[u8]) -> Result<Vec<IoBuf>, String> {
        let mut ready = Vec::new();
        match &self.codec {
            Some(codec) => {
                let mut round = self.round_cache.lock();
                let old = round.size();
                if round.resize(old + bytes.len()) < old + bytes.len() {
                    return Err("read accumulation exceeds the buffer hard cap".to_string());
                }
                round.set_write_pos(old);
                round.put_bytes(bytes);
                round.set_read_pos(0);
                round.set_write_pos(0);

                match codec.extract(&self.arc(), &mut round, &mut ready) {
                    Extracted::Consumed => round.clear(),
                    Extracted::Partial => {
                        if round.remaining() == 0 {
                            round.clear();
                        } else {
                            round.compact();
                        }
                    }
                    Extracted::Corrupt(reason) => return Err(reason),
                }
            }
            None => {
                // no codec: each delivery is one raw frame
                match self.acquire_buffer(bytes.len()) {
                    Some(mut frame) => {
                        frame.put_bytes(bytes);
                        ready.push(frame);
                    }
                    None => {
                        warn!(
                            "session {} dropped {} incoming bytes, no buffer available",
                            self.id(),
                            bytes.len()
                        );
                    }
                }
            }
        }
        Ok(ready)
    }

    fn enqueue_incoming(&self, frames: Vec<IoBuf>) -> (usize, bool) {
        let max = self.max_read_queue.load(Ordering::Relaxed);
        let this = self.arc();
        let mut queue = self.read_queue.lock();
        let mut queued = 0;
        let mut overflowed = false;
        for mut frame in frames {
            if max > 0 && queue.len() >= max {
                // the rest of the batch is dropped and recycled
                overflowed = true;
                break;
            }
            frame.set_read_pos(0);
            frame.set_write_pos(0);
            frame.set_kind(KIND_INCOMING);
            frame.bind_session(&this);
            queue.push_back(frame);
            queued += 1;
        }
        (queued, overflowed)
    }

    /// Pop and deliver queued frames until the queue is empty or an async,
    /// non-concurrent handler result parks the session. Returns whether both
    /// queues drained while the session was closing.
    async fn drain_incoming(&self, mut gate: Option<&mut i32>) -> bool {
        loop {
            let frame = self.read_queue.lock().pop_front();
            let Some(frame) = frame else {
                return self.is_closing() && self.write_queue.lock().is_empty();
            };

            let flags = self.invoke_on_read(frame).await;
            if !flags.is_async() {
                continue;
            }
            if flags.is_concurrent() {
                continue;
            }
            if let Some(gate) = gate.as_deref_mut() {
                *gate += 1;
            }
            // wait for the completion signal
            return false;
        }
    }

    async fn write_loop(self: Arc<Self>, mut writer: BoxedWriter) {
        let mut shutdown = Shutdown::subscribe(&self.notify_closed);
        loop {
            tokio::select! {
                _ = self.write_wake.notified() => {}
                _ = shutdown.recv() => {
                    debug!("session {} exit write loop after close signal", self.id());
                    return;
                }
            }
            if !self.write_round(&mut writer).await {
                return;
            }
        }
    }

    async fn write_round(&self, writer: &mut BoxedWriter) -> bool {
        if self.orderly_write.load(Ordering::Relaxed) {
            // the gate is held across the whole flush so a completion signal
            // can never slip in between delivery and the outstanding count
            let mut gate = self.write_gate.lock().await;
            if *gate > 0 {
                // resumed by the completion signal
                return true;
            }
            self.flush_outgoing(writer, Some(&mut gate)).await
        } else {
            self.flush_outgoing(writer, None).await
        }
    }

    /// Send queued frames FIFO until the queue is empty or ordering parks
    /// the writer. Returns false when the session died on a transport error.
    async fn flush_outgoing(&self, writer: &mut BoxedWriter, mut gate: Option<&mut i32>) -> bool {
        loop {
            let frame = self.write_queue.lock().pop_front();
            let Some(mut frame) = frame else {
                if self.is_closing() && self.read_queue.lock().is_empty() {
                    self.close(true).await;
                }
                return true;
            };

            let sent = async {
                writer.write_all(frame.bytes()).await?;
                writer.flush().await
            }
            .await;

            if let Err(err) = sent {
                let code = err.raw_os_error().unwrap_or(-1);
                self.emit_error(IoDirection::Write, code, &err.to_string()).await;
                self.close(true).await;
                return false;
            }

            self.touch_write();

            frame.set_read_pos(0);
            frame.set_write_pos(0);
            frame.set_kind(KIND_OUTGOING);
            frame.bind_session(&self.arc());

            let flags = self.invoke_on_write(frame).await;
            if flags.is_async() && !flags.is_concurrent() {
                if let Some(gate) = gate.as_deref_mut() {
                    *gate += 1;
                }
                // wait for the completion signal
                return true;
            }
        }
    }

    async fn invoke_on_connect(&self) {
        let this = self.arc();
        let call = AssertUnwindSafe(self.handler.on_connect(&this)).catch_unwind();
        if call.await.is_err() {
            warn!("panic found in on_connect handler");
        }
    }

    async fn invoke_on_disconnect(&self) {
        let this = self.arc();
        let call = AssertUnwindSafe(self.handler.on_disconnect(&this)).catch_unwind();
        if call.await.is_err() {
            warn!("panic found in on_disconnect handler");
        }
    }

    async fn invoke_on_read(&self, frame: IoBuf) -> ProcessFlags {
        let this = self.arc();
        let call = AssertUnwindSafe(self.handler.on_read(&this, frame)).catch_unwind();
        match call.await {
            Ok(flags) => flags,
            Err(_) => {
                warn!("panic found in on_read handler");
                ProcessFlags::SYNC
            }
        }
    }

    async fn invoke_on_write(&self, frame: IoBuf) -> ProcessFlags {
        let this = self.arc();
        let call = AssertUnwindSafe(self.handler.on_write(&this, frame)).catch_unwind();
        match call.await {
            Ok(flags) => flags,
            Err(_) => {
                warn!("panic found in on_write handler");
                ProcessFlags::SYNC
            }
        }
    }

    async fn invoke_on_idle(&self, kind: Direction) {
        let this = self.arc();
        let call = AssertUnwindSafe(self.handler.on_idle(&this, kind)).catch_unwind();
        if call.await.is_err() {
            warn!("panic found in on_idle handler");
        }
    }

    pub(crate) async fn emit_error(&self, direction: IoDirection, code: i32, message: &str) {
        let this = self.arc();
        let call =
            AssertUnwindSafe(self.handler.on_error(&this, direction, code, message)).catch_unwind();
        if call.await.is_err() {
            warn!("panic found in on_error handler");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use async_trait::async_trait;

    use super::*;

    pub(crate) struct NoopHandler;

    #[async_trait]
    impl Handler for NoopHandler {}

    pub(crate) fn build_test_session() -> Arc<Session> {
        Session::new(SessionParts {
            handler: Arc::new(NoopHandler),
            codec: None,
            pool: BufferPool::default(),
            registry: None,
            config: SessionConfig::default(),
            read_buffer_size: 4096,
        })
    }

    #[test]
    fn enqueue_respects_the_read_queue_bound() {
        let session = build_test_session();
        session.set_max_queue(Direction::Read, 2);

        let frames: Vec<IoBuf> = (0..5).map(|_| IoBuf::new(8)).collect();
        let (queued, overflowed) = session.enqueue_incoming(frames);

        assert_eq!(queued, 2);
        assert!(overflowed);
        assert_eq!(session.read_queue.lock().len(), 2);
    }

    #[test]
    fn queued_frames_are_tagged_and_bound() {
        let session = build_test_session();
        let (queued, overflowed) = session.enqueue_incoming(vec![IoBuf::new(4)]);
        assert_eq!(queued, 1);
        assert!(!overflowed);

        let frame = session.read_queue.lock().pop_front().unwrap();
        assert_eq!(frame.kind(), KIND_INCOMING);
        assert!(frame.session().is_some());
        assert_eq!(frame.session().unwrap().id(), session.id());
    }

    #[test]
    fn orderly_and_queue_settings_cover_both_directions() {
        let session = build_test_session();
        session.set_orderly(Direction::Both, true);
        assert!(session.orderly(Direction::Read));
        assert!(session.orderly(Direction::Write));

        session.set_orderly(Direction::Write, false);
        assert!(!session.orderly(Direction::Both));

        session.set_max_queue(Direction::Both, 7);
        assert_eq!(session.max_queue(Direction::Read), 7);
        assert_eq!(session.max_queue(Direction::Write), 7);
    }

    #[test]
    fn scratch_storage_round_trips() {
        let session = build_test_session();
        session.put_data("attempts", 3i64);
        session.put_data("name", "peer-1");

        assert_eq!(session.get_data("attempts").unwrap().as_int(), Some(3));
        assert_eq!(session.get_data("name").unwrap().as_text(), Some("peer-1"));
        assert!(session.get_data("missing").is_none());
        assert_eq!(session.remove_data("attempts").unwrap().as_int(), Some(3));
        assert!(!session.has_data("attempts"));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_removes_from_registry_once() {
        let registry = SessionRegistry::new();
        let session = Session::new(SessionParts {
            handler: Arc::new(NoopHandler),
            codec: None,
            pool: BufferPool::default(),
            registry: Some(registry.clone()),
            config: SessionConfig::default(),
            read_buffer_size: 1024,
        });

        let (client, server) = tokio::io::duplex(1024);
        let (read_half, write_half) = tokio::io::split(server);
        session
            .open(Box::new(read_half), Box::new(write_half), None, None)
            .await;
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(registry.session_count(), 1);

        session.close(true).await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(registry.session_count(), 0);

        session.close(true).await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(registry.session_count(), 0);

        drop(client);
    }

    #[tokio::test]
    async fn deferred_close_waits_for_queued_frames() {
        let session = build_test_session();
        // a queued read frame keeps the session in Closing
        session.enqueue_incoming(vec![IoBuf::new(4)]);
        {
            let mut state = session.state.lock();
            *state = SessionState::Open;
        }

        session.close(false).await;
        assert_eq!(session.state(), SessionState::Closing);

        // draining the queue completes the close
        session.process_incoming_data(false).await;
        assert_eq!(session.state(), SessionState::Closed);
    }
}
