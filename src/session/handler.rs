use std::sync::Arc;

use async_trait::async_trait;

use crate::buffer::IoBuf;
use crate::session::Session;

/// How a handler dealt with a frame, as a two-bit set.
///
/// Bit 0 (`ASYNC`) means the real work was deferred, typically to a worker;
/// bit 1 (`CONCURRENT`) means the session may keep draining its queue without
/// waiting for that work to finish. An async, non-concurrent result on an
/// orderly session parks the queue until the deferred work signals completion
/// through [`Session::process_incoming_data`] /
/// [`Session::process_outgoing_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessFlags(u8);

impl ProcessFlags {
    /// Handled inline; the frame is done.
    pub const SYNC: ProcessFlags = ProcessFlags(0);
    /// Work was deferred.
    pub const ASYNC: ProcessFlags = ProcessFlags(0b01);
    /// Safe to continue draining without waiting.
    pub const CONCURRENT: ProcessFlags = ProcessFlags(0b10);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_async(self) -> bool {
        self.0 & Self::ASYNC.0 != 0
    }

    pub fn is_concurrent(self) -> bool {
        self.0 & Self::CONCURRENT.0 != 0
    }
}

impl std::ops::BitOr for ProcessFlags {
    type Output = ProcessFlags;

    fn bitor(self, rhs: ProcessFlags) -> ProcessFlags {
        ProcessFlags(self.0 | rhs.0)
    }
}

/// A per-direction selector used for ordering, queue bounds and idle checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Both,
    Read,
    Write,
}

/// Which operation an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Connect,
    Read,
    Write,
}

/// The application-facing callback contract, invoked by [`Session`].
///
/// Every callback runs on the session's I/O tasks (or, for completion
/// signals, on whatever task delivers them); panics are caught at the call
/// site and logged, so a misbehaving handler cannot take the I/O loop down.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn on_connect(&self, _session: &Arc<Session>) {}

    async fn on_disconnect(&self, _session: &Arc<Session>) {}

    /// A complete incoming frame. Ownership of the buffer moves to the
    /// handler; dropping it returns it to the pool.
    async fn on_read(&self, _session: &Arc<Session>, _frame: IoBuf) -> ProcessFlags {
        ProcessFlags::SYNC
    }

    /// An outgoing frame that has been flushed to the transport.
    async fn on_write(&self, _session: &Arc<Session>, _frame: IoBuf) -> ProcessFlags {
        ProcessFlags::SYNC
    }

    /// The session exceeded an idle threshold. Closing (or not) is the
    /// handler's decision; the engine never closes idle sessions itself.
    async fn on_idle(&self, _session: &Arc<Session>, _kind: Direction) {}

    /// A transport, protocol or capacity error. `code` carries the platform
    /// error code where one exists; a `Connect` error with code 0 is a
    /// connect timeout.
    async fn on_error(
        &self,
        _session: &Arc<Session>,
        _direction: IoDirection,
        _code: i32,
        _message: &str,
    ) {
    }
}
