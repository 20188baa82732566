//! Frame extraction and encoding.
//!
//! A [`FrameCodec`] turns the raw byte stream of a session into discrete
//! application frames and back. The per-session extraction state (the
//! two-state header/body machine and any partially received prefix) lives in
//! the session's read cache, so codec instances themselves are stateless and
//! can be shared across sessions.

use std::sync::Arc;

use crate::buffer::IoBuf;
use crate::session::Session;

pub use message::MessageCodec;
pub use string::StringCodec;

mod message;
mod string;

/// Extraction state stored in the read cache's `state` tag.
pub const STATE_WAIT_FOR_HEADER: i32 = 0;
pub const STATE_WAIT_FOR_BODY: i32 = 1;

/// Outcome of one extraction round.
#[derive(Debug, PartialEq, Eq)]
pub enum Extracted {
    /// Every input byte was consumed; the accumulation buffer can be reset.
    Consumed,
    /// Unconsumed trailing bytes must be kept for the next round.
    Partial,
    /// Unrecoverable framing violation; the session must be closed.
    Corrupt(String),
}

/// A per-connection protocol state machine.
///
/// `extract` pulls zero or more complete frames out of the accumulated
/// incoming bytes, `encode` turns an application payload into an on-wire
/// frame, and `decode` exposes a received frame's body without copying.
pub trait FrameCodec: Send + Sync {
    /// Extract complete frames from `data` into `ready`.
    ///
    /// `data` is the session's accumulation buffer; its read cursor marks how
    /// far extraction got. The session preserves any unread remainder across
    /// calls when the result is [`Extracted::Partial`].
    fn extract(
        &self,
        session: &Arc<Session>,
        data: &mut IoBuf,
        ready: &mut Vec<IoBuf>,
    ) -> Extracted;

    /// Encode `payload` into a pooled frame ready for the write queue.
    ///
    /// Returns `None` when no buffer could be acquired.
    fn encode(&self, session: &Arc<Session>, payload: &[u8]) -> Option<IoBuf>;

    /// A view over the frame's body region. Does not copy.
    fn decode<'a>(&self, frame: &'a IoBuf) -> &'a [u8];
}
