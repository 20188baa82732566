use std::sync::Arc;

use super::{Extracted, FrameCodec};
use crate::buffer::IoBuf;
use crate::session::Session;

/// Delimiter-terminated string framing.
///
/// Frames are runs of bytes separated by a terminator character; the
/// terminator is stripped from extracted frames and appended by `encode`.
/// A run reaching `max_len` is emitted as a frame at the cap.
#[derive(Debug, Clone)]
pub struct StringCodec {
    terminator: u8,
    max_len: usize,
}

impl StringCodec {
    /// Newline-terminated strings up to 1 KiB.
    pub fn new() -> StringCodec {
        StringCodec {
            terminator: b'\n',
            max_len: 1024,
        }
    }

    pub fn with_terminator(terminator: u8, max_len: usize) -> StringCodec {
        StringCodec {
            terminator,
            max_len: max_len.max(1),
        }
    }

    fn emit(
        session: &Arc<Session>,
        cache: &mut IoBuf,
        ready: &mut Vec<IoBuf>,
    ) -> Option<()> {
        let mut frame = session.acquire_buffer(cache.size())?;
        frame.put_bytes(cache.bytes());
        ready.push(frame);
        cache.clear();
        cache.set_flag(0);
        Some(())
    }
}

impl Default for StringCodec {
    fn default() -> Self {
        StringCodec::new()
    }
}

impl FrameCodec for StringCodec {
    fn extract(
        &self,
        session: &Arc<Session>,
        data: &mut IoBuf,
        ready: &mut Vec<IoBuf>,
    ) -> Extracted {
        let mut cache = session.read_cache();
        let mut total = 0usize;

        while data.remaining() > 0 {
            let ch = data.get_u8();
            if ch == self.terminator {
                if cache.size() > 0 {
                    if Self::emit(session, &mut cache, ready).is_none() {
                        return Extracted::Partial;
                    }
                    total += 1;
                }
            } else {
                let len = cache.size();
                cache.resize(len + 1);
                cache.put_u8(ch);

                if cache.size() >= self.max_len {
                    if Self::emit(session, &mut cache, ready).is_none() {
                        return Extracted::Partial;
                    }
                    total += 1;
                }
            }
        }

        if total > 0 && cache.size() == 0 {
            Extracted::Consumed
        } else {
            Extracted::Partial
        }
    }

    fn encode(&self, session: &Arc<Session>, payload: &[u8]) -> Option<IoBuf> {
        let mut frame = session.acquire_buffer(payload.len() + 1)?;
        frame.put_bytes(payload);
        frame.put_u8(self.terminator);
        frame.set_write_pos(0);
        Some(frame)
    }

    fn decode<'a>(&self, frame: &'a IoBuf) -> &'a [u8] {
        frame.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::build_test_session;

    fn feed(
        codec: &StringCodec,
        session: &Arc<Session>,
        chunk: &[u8],
        ready: &mut Vec<IoBuf>,
    ) -> Extracted {
        let mut data = IoBuf::from_slice(chunk);
        codec.extract(session, &mut data, ready)
    }

    #[test]
    fn lines_split_on_terminator() {
        let session = build_test_session();
        let codec = StringCodec::new();
        let mut ready = Vec::new();

        let outcome = feed(&codec, &session, b"abc\ndefg\n", &mut ready);
        assert_eq!(outcome, Extracted::Consumed);
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].bytes(), b"abc");
        assert_eq!(ready[1].bytes(), b"defg");
    }

    #[test]
    fn partial_line_waits_for_more_input() {
        let session = build_test_session();
        let codec = StringCodec::new();
        let mut ready = Vec::new();

        feed(&codec, &session, b"hel", &mut ready);
        assert!(ready.is_empty());

        let outcome = feed(&codec, &session, b"lo\n", &mut ready);
        assert_eq!(outcome, Extracted::Consumed);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].bytes(), b"hello");
    }

    #[test]
    fn empty_lines_are_skipped() {
        let session = build_test_session();
        let codec = StringCodec::new();
        let mut ready = Vec::new();

        feed(&codec, &session, b"\n\na\n", &mut ready);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].bytes(), b"a");
    }

    #[test]
    fn overlong_runs_are_emitted_at_the_cap() {
        let session = build_test_session();
        let codec = StringCodec::with_terminator(b'\n', 4);
        let mut ready = Vec::new();

        feed(&codec, &session, b"abcdefghij\n", &mut ready);
        assert_eq!(ready.len(), 3);
        assert_eq!(ready[0].bytes(), b"abcd");
        assert_eq!(ready[1].bytes(), b"efgh");
        assert_eq!(ready[2].bytes(), b"ij");
    }

    #[test]
    fn encode_appends_the_terminator() {
        let session = build_test_session();
        let codec = StringCodec::new();
        let frame = codec.encode(&session, b"ping").unwrap();
        assert_eq!(frame.bytes(), b"ping\n");

        let mut ready = Vec::new();
        let mut data = IoBuf::from_slice(frame.bytes());
        let outcome = codec.extract(&session, &mut data, &mut ready);
        assert_eq!(outcome, Extracted::Consumed);
        assert_eq!(codec.decode(&ready[0]), b"ping");
    }
}
