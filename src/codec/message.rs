use std::sync::Arc;

use tracing::warn;

use super::{Extracted, FrameCodec, STATE_WAIT_FOR_BODY, STATE_WAIT_FOR_HEADER};
use crate::buffer::IoBuf;
use crate::session::Session;

/// Generic header + length-prefixed binary framing.
///
/// Every frame starts with a fixed-size header; a big-endian length field
/// inside the header gives the body size. A `body_len_offset` of `None`
/// disables the length field, making every frame exactly `header_size` bytes.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    header_size: usize,
    body_len_offset: Option<usize>,
    body_len_width: usize,
    max_body_size: usize,
}

impl MessageCodec {
    /// Four-byte header that is itself the four-byte body length, bodies up
    /// to 1 KiB.
    pub fn new() -> MessageCodec {
        MessageCodec {
            header_size: 4,
            body_len_offset: Some(0),
            body_len_width: 4,
            max_body_size: 1024,
        }
    }

    /// Fully configured layout. Out-of-range arguments are clamped: the
    /// header is at least one byte, the width at most four bytes and never
    /// wider than the header, and a length field that would not fit inside
    /// the header is disabled.
    pub fn with_layout(
        header_size: usize,
        body_len_offset: Option<usize>,
        body_len_width: usize,
        max_body_size: usize,
    ) -> MessageCodec {
        let header_size = header_size.max(1);
        let body_len_width = body_len_width.min(4).min(header_size);
        let body_len_offset = match body_len_offset {
            Some(_) if body_len_width == 0 => None,
            Some(offset) if offset + body_len_width > header_size => None,
            other => other,
        };
        MessageCodec {
            header_size,
            body_len_offset,
            body_len_width,
            max_body_size,
        }
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    fn reset_cache(cache: &mut IoBuf) {
        cache.set_state(STATE_WAIT_FOR_HEADER);
        cache.set_read_pos(0);
        cache.set_write_pos(0);
        cache.set_flag(0);
    }

    /// Try to complete the pending frame whose header sits in the cache.
    ///
    /// `None` means no buffer was available; `Some(emitted)` otherwise.
    fn take_body(
        &self,
        session: &Arc<Session>,
        cache: &mut IoBuf,
        data: &mut IoBuf,
        ready: &mut Vec<IoBuf>,
    ) -> Option<bool> {
        let body_len = cache.flag() as usize;
        if data.remaining() < body_len {
            return Some(false);
        }
        let mut frame = session.acquire_buffer(self.header_size + body_len)?;
        frame.put_bytes(&cache.bytes()[..self.header_size]);
        let start = data.read_pos();
        frame.put_bytes(&data.bytes()[start..start + body_len]);
        data.set_read_pos(start + body_len);
        ready.push(frame);
        Self::reset_cache(cache);
        Some(true)
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        MessageCodec::new()
    }
}

impl FrameCodec for MessageCodec {
    fn extract(
        &self,
        session: &Arc<Session>,
        data: &mut IoBuf,
        ready: &mut Vec<IoBuf>,
    ) -> Extracted {
        let mut cache = session.read_cache();
        let mut total = 0usize;

        if cache.state() == STATE_WAIT_FOR_BODY {
            match self.take_body(session, &mut cache, data, ready) {
                None => return Extracted::Partial,
                Some(true) => total += 1,
                Some(false) => {}
            }
        }

        while cache.state() == STATE_WAIT_FOR_HEADER && data.remaining() >= self.header_size {
            cache.resize(self.header_size);
            cache.set_read_pos(0);
            cache.set_write_pos(0);

            let start = data.read_pos();
            cache.put_bytes(&data.bytes()[start..start + self.header_size]);

            let mut body_len: i64 = 0;
            if let Some(offset) = self.body_len_offset {
                data.set_read_pos(start + offset);
                body_len = match self.body_len_width {
                    1 => data.get_u8() as i64,
                    2 => data.get_i16() as i64,
                    _ => data.get_i32() as i64,
                };
            }
            data.set_read_pos(start + self.header_size);

            if body_len < 0 {
                return Extracted::Corrupt(format!("frame body length {} less than 0", body_len));
            }
            let body_len = body_len as usize;

            if body_len > 0 {
                if body_len > self.max_body_size {
                    return Extracted::Corrupt(format!(
                        "frame body length {} is too large",
                        body_len
                    ));
                }
                let want = self.header_size + body_len;
                if cache.resize(want) < want {
                    return Extracted::Corrupt("frame exceeds the buffer hard cap".to_string());
                }
                cache.set_flag(body_len as i32);
                cache.set_state(STATE_WAIT_FOR_BODY);
            } else {
                // header-only frame, ready as is
                let mut frame = match session.acquire_buffer(self.header_size) {
                    Some(frame) => frame,
                    None => return Extracted::Partial,
                };
                frame.put_bytes(&cache.bytes()[..self.header_size]);
                ready.push(frame);
                total += 1;
                Self::reset_cache(&mut cache);
                continue;
            }

            match self.take_body(session, &mut cache, data, ready) {
                None => return Extracted::Partial,
                Some(true) => total += 1,
                Some(false) => {}
            }
        }

        if total > 0 && data.remaining() == 0 {
            return Extracted::Consumed;
        }
        if cache.state() != STATE_WAIT_FOR_HEADER && cache.state() != STATE_WAIT_FOR_BODY {
            return Extracted::Corrupt("inconsistent frame extraction state".to_string());
        }
        Extracted::Partial
    }

    /// Build the on-wire frame around `payload`.
    ///
    /// With a length field configured, the payload is the frame body: the
    /// header is zeroed except for the stamped body length. Without one the
    /// payload is taken as the complete frame image.
    fn encode(&self, session: &Arc<Session>, payload: &[u8]) -> Option<IoBuf> {
        let Some(offset) = self.body_len_offset else {
            let mut frame = session.acquire_buffer(payload.len())?;
            frame.put_bytes(payload);
            frame.set_write_pos(0);
            return Some(frame);
        };

        if payload.len() > self.max_body_size {
            warn!(
                "refusing to encode a {} byte body, larger than the {} cap",
                payload.len(),
                self.max_body_size
            );
            return None;
        }

        let mut header = vec![0u8; self.header_size];
        match self.body_len_width {
            1 => header[offset] = payload.len() as u8,
            2 => header[offset..offset + 2].copy_from_slice(&(payload.len() as i16).to_be_bytes()),
            _ => header[offset..offset + 4].copy_from_slice(&(payload.len() as i32).to_be_bytes()),
        }

        let mut frame = session.acquire_buffer(self.header_size + payload.len())?;
        frame.put_bytes(&header);
        frame.put_bytes(payload);
        frame.set_write_pos(0);
        Some(frame)
    }

    fn decode<'a>(&self, frame: &'a IoBuf) -> &'a [u8] {
        if self.body_len_offset.is_none() {
            return frame.bytes();
        }
        let start = self.header_size.min(frame.size());
        &frame.bytes()[start..]
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::session::tests::build_test_session;

    /// Append a delivery to the accumulation buffer and run one extraction
    /// round, preserving leftovers the way the session read path does.
    fn feed(
        codec: &MessageCodec,
        session: &Arc<Session>,
        acc: &mut IoBuf,
        chunk: &[u8],
        ready: &mut Vec<IoBuf>,
    ) -> Extracted {
        let old = acc.size();
        acc.resize(old + chunk.len());
        acc.set_write_pos(old);
        acc.put_bytes(chunk);
        acc.set_read_pos(0);
        acc.set_write_pos(0);
        let outcome = codec.extract(session, acc, ready);
        match outcome {
            Extracted::Consumed => acc.clear(),
            Extracted::Partial => {
                if acc.remaining() == 0 {
                    acc.clear();
                } else {
                    acc.compact();
                }
            }
            Extracted::Corrupt(_) => {}
        }
        outcome
    }

    fn frame_with_body(body: &[u8]) -> Vec<u8> {
        // header: 4 pad bytes, then a 4-byte big-endian body length
        let mut wire = vec![0u8; 4];
        wire.extend_from_slice(&(body.len() as i32).to_be_bytes());
        wire.extend_from_slice(body);
        wire
    }

    #[test]
    fn header_then_body_split_across_deliveries() {
        let session = build_test_session();
        let codec = MessageCodec::with_layout(8, Some(4), 4, 1024);
        let wire = frame_with_body(b"hello");
        assert_eq!(wire.len(), 13);

        let mut acc = IoBuf::new(0);
        let mut ready = Vec::new();

        feed(&codec, &session, &mut acc, &wire[..8], &mut ready);
        assert!(ready.is_empty());

        feed(&codec, &session, &mut acc, &wire[8..], &mut ready);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].bytes(), &wire[..]);
        assert_eq!(codec.decode(&ready[0]), b"hello");
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(7)]
    #[case(8)]
    #[case(12)]
    fn round_trip_survives_any_split(#[case] split: usize) {
        let session = build_test_session();
        let codec = MessageCodec::with_layout(8, Some(4), 4, 1024);
        let wire = frame_with_body(b"hello");

        let mut acc = IoBuf::new(0);
        let mut ready = Vec::new();
        feed(&codec, &session, &mut acc, &wire[..split], &mut ready);
        feed(&codec, &session, &mut acc, &wire[split..], &mut ready);

        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].bytes(), &wire[..]);
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let session = build_test_session();
        let codec = MessageCodec::with_layout(8, Some(4), 4, 1024);
        let wire = frame_with_body(b"abc");

        let mut acc = IoBuf::new(0);
        let mut ready = Vec::new();
        for byte in &wire {
            feed(&codec, &session, &mut acc, &[*byte], &mut ready);
        }
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].bytes(), &wire[..]);
    }

    #[test]
    fn back_to_back_frames_in_one_delivery() {
        let session = build_test_session();
        let codec = MessageCodec::with_layout(8, Some(4), 4, 1024);
        let mut wire = frame_with_body(b"one");
        wire.extend_from_slice(&frame_with_body(b"three"));

        let mut acc = IoBuf::new(0);
        let mut ready = Vec::new();
        let outcome = feed(&codec, &session, &mut acc, &wire, &mut ready);
        assert_eq!(outcome, Extracted::Consumed);
        assert_eq!(ready.len(), 2);
        assert_eq!(codec.decode(&ready[0]), b"one");
        assert_eq!(codec.decode(&ready[1]), b"three");
    }

    #[test]
    fn zero_length_body_emits_header_only_frame() {
        let session = build_test_session();
        let codec = MessageCodec::with_layout(8, Some(4), 4, 1024);
        let wire = frame_with_body(b"");

        let mut acc = IoBuf::new(0);
        let mut ready = Vec::new();
        feed(&codec, &session, &mut acc, &wire, &mut ready);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].size(), 8);
    }

    #[test]
    fn oversized_body_is_a_protocol_violation() {
        let session = build_test_session();
        let codec = MessageCodec::with_layout(8, Some(4), 4, 16);
        let wire = frame_with_body(&[0u8; 17]);

        let mut acc = IoBuf::new(0);
        let mut ready = Vec::new();
        let outcome = feed(&codec, &session, &mut acc, &wire, &mut ready);
        assert!(matches!(outcome, Extracted::Corrupt(_)));
        assert!(ready.is_empty());
    }

    #[test]
    fn negative_length_is_a_protocol_violation() {
        let session = build_test_session();
        let codec = MessageCodec::with_layout(8, Some(4), 4, 1024);
        let mut wire = vec![0u8; 4];
        wire.extend_from_slice(&(-5i32).to_be_bytes());

        let mut acc = IoBuf::new(0);
        let mut ready = Vec::new();
        let outcome = feed(&codec, &session, &mut acc, &wire, &mut ready);
        assert!(matches!(outcome, Extracted::Corrupt(_)));
    }

    #[test]
    fn fixed_size_framing_without_length_field() {
        let session = build_test_session();
        let codec = MessageCodec::with_layout(6, None, 0, 0);

        let mut acc = IoBuf::new(0);
        let mut ready = Vec::new();
        feed(&codec, &session, &mut acc, b"aaabbbcccddd", &mut ready);
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].bytes(), b"aaabbb");
        assert_eq!(ready[1].bytes(), b"cccddd");
    }

    #[test]
    fn encode_stamps_the_length_field() {
        let session = build_test_session();
        let codec = MessageCodec::with_layout(8, Some(4), 4, 1024);

        let frame = codec.encode(&session, b"hello").unwrap();
        assert_eq!(frame.size(), 13);
        assert_eq!(&frame.bytes()[..4], &[0u8; 4]);
        assert_eq!(&frame.bytes()[4..8], &5i32.to_be_bytes());
        assert_eq!(codec.decode(&frame), b"hello");
    }

    #[rstest]
    #[case(2)]
    #[case(6)]
    #[case(11)]
    fn encode_extract_decode_round_trip(#[case] split: usize) {
        let session = build_test_session();
        let codec = MessageCodec::with_layout(8, Some(4), 4, 1024);

        let frame = codec.encode(&session, b"hello").unwrap();
        let wire = frame.bytes().to_vec();

        let mut acc = IoBuf::new(0);
        let mut ready = Vec::new();
        feed(&codec, &session, &mut acc, &wire[..split], &mut ready);
        feed(&codec, &session, &mut acc, &wire[split..], &mut ready);

        assert_eq!(ready.len(), 1);
        assert_eq!(codec.decode(&ready[0]), b"hello");
    }

    #[test]
    fn encode_refuses_an_oversized_body() {
        let session = build_test_session();
        let codec = MessageCodec::with_layout(8, Some(4), 4, 16);
        assert!(codec.encode(&session, &[0u8; 17]).is_none());
        assert!(codec.encode(&session, &[0u8; 16]).is_some());
    }

    #[test]
    fn layout_clamps_disable_bad_length_fields() {
        // a length field hanging past the header cannot be used
        let codec = MessageCodec::with_layout(4, Some(2), 4, 64);
        assert!(codec.body_len_offset.is_none());

        let codec = MessageCodec::with_layout(0, Some(0), 9, 64);
        assert_eq!(codec.header_size, 1);
        assert_eq!(codec.body_len_width, 1);
    }
}
