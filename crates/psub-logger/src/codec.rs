// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire framing for the bus protocol.
//!
//! Every frame is `op: u8`, `len: u32` and `len` body bytes, all integers big-endian.
//! Subjects are a `u16` token count followed by `u16`-length-prefixed UTF-8 tokens.
//! A message body is the subject, `ttl: i64`, `age: u64`, a `u16` count of `u32`
//! postmarks and a `u32`-length-prefixed payload.

use crate::constants::MAX_FRAME_SIZE;
use crate::errors::CodecError;
use crate::message::Message;
use crate::subject::Subject;

const HEADER_LEN: usize = 5;

pub const OP_SUBSCRIBE: u8 = 0x01;
pub const OP_UNSUBSCRIBE: u8 = 0x02;
pub const OP_MESSAGE: u8 = 0x03;

/// One decoded protocol operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Subscribe(Subject),
    Unsubscribe(Subject),
    Message(Message),
    /// An operation this client does not understand, kept for logging.
    Unknown(u8, Vec<u8>),
}

/// Encodes a message as a publish frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    encode_frame(&Frame::Message(message.clone()))
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let mut body = Vec::new();
    let op = match frame {
        Frame::Subscribe(subject) => {
            put_subject(&mut body, subject)?;
            OP_SUBSCRIBE
        }
        Frame::Unsubscribe(subject) => {
            put_subject(&mut body, subject)?;
            OP_UNSUBSCRIBE
        }
        Frame::Message(message) => {
            put_subject(&mut body, &message.subject)?;
            body.extend_from_slice(&message.ttl.to_be_bytes());
            body.extend_from_slice(&message.age.to_be_bytes());
            let count = u16::try_from(message.postmarks.len())
                .map_err(|_| CodecError::Oversized("postmark list"))?;
            body.extend_from_slice(&count.to_be_bytes());
            for postmark in &message.postmarks {
                body.extend_from_slice(&postmark.to_be_bytes());
            }
            let len = u32::try_from(message.payload.len())
                .map_err(|_| CodecError::Oversized("payload"))?;
            body.extend_from_slice(&len.to_be_bytes());
            body.extend_from_slice(&message.payload);
            OP_MESSAGE
        }
        Frame::Unknown(op, bytes) => {
            body.extend_from_slice(bytes);
            *op
        }
    };

    if body.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(op);
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_SIZE
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn put_subject(out: &mut Vec<u8>, subject: &Subject) -> Result<(), CodecError> {
    let count =
        u16::try_from(subject.tokens().len()).map_err(|_| CodecError::Oversized("subject"))?;
    out.extend_from_slice(&count.to_be_bytes());
    for token in subject.tokens() {
        let len = u16::try_from(token.len()).map_err(|_| CodecError::Oversized("subject token"))?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(token.as_bytes());
    }
    Ok(())
}

/// Accumulates inbound bytes and yields complete frames.
///
/// Partial frames stay buffered until the rest arrives. Any decode error clears the
/// buffer so a corrupt prefix can never desynchronise later frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    discarded: Vec<u8>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.discarded.clear();
    }

    /// Takes the bytes thrown away by the last decode error.
    pub fn take_discarded(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.discarded)
    }

    /// Returns the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        match self.try_next() {
            Ok(frame) => Ok(frame),
            Err(e) => {
                self.discarded = std::mem::take(&mut self.buf);
                Err(e)
            }
        }
    }

    fn try_next(&mut self) -> Result<Option<Frame>, CodecError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let op = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(len));
        }
        let total = HEADER_LEN + len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let frame = decode_body(op, &self.buf[HEADER_LEN..total])?;
        self.buf.drain(..total);
        Ok(Some(frame))
    }
}

/// Decodes every complete frame in `bytes`, failing on trailing partial data.
pub fn decode(bytes: &[u8]) -> Result<Vec<Frame>, CodecError> {
    let mut decoder = FrameDecoder::new();
    decoder.extend(bytes);
    let mut frames = Vec::new();
    while let Some(frame) = decoder.next_frame()? {
        frames.push(frame);
    }
    if decoder.buffered() > 0 {
        return Err(CodecError::Truncated("frame"));
    }
    Ok(frames)
}

fn decode_body(op: u8, body: &[u8]) -> Result<Frame, CodecError> {
    let mut reader = BodyReader { body, pos: 0 };
    let frame = match op {
        OP_SUBSCRIBE => Frame::Subscribe(reader.subject()?),
        OP_UNSUBSCRIBE => Frame::Unsubscribe(reader.subject()?),
        OP_MESSAGE => {
            let subject = reader.subject()?;
            let ttl = i64::from_be_bytes(reader.array("ttl")?);
            let age = u64::from_be_bytes(reader.array("age")?);
            let count = u16::from_be_bytes(reader.array("postmark count")?);
            let mut postmarks = Vec::with_capacity(count as usize);
            for _ in 0..count {
                postmarks.push(u32::from_be_bytes(reader.array("postmark")?));
            }
            let len = u32::from_be_bytes(reader.array("payload length")?) as usize;
            let payload = reader.take(len, "payload")?.to_vec();
            Frame::Message(Message {
                subject,
                payload,
                ttl,
                age,
                postmarks,
            })
        }
        other => return Ok(Frame::Unknown(other, body.to_vec())),
    };
    let remaining = body.len() - reader.pos;
    if remaining > 0 {
        return Err(CodecError::TrailingBytes(remaining));
    }
    Ok(frame)
}

struct BodyReader<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.body.len())
            .ok_or(CodecError::Truncated(what))?;
        let slice = &self.body[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn subject(&mut self) -> Result<Subject, CodecError> {
        let count = u16::from_be_bytes(self.array("subject token count")?);
        let mut tokens = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = u16::from_be_bytes(self.array("subject token length")?) as usize;
            let raw = self.take(len, "subject token")?;
            let token = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?;
            tokens.push(token.to_string());
        }
        Ok(Subject::new(tokens)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SubjectError;
    use proptest::prelude::*;

    fn message(subject: &str, payload: &[u8]) -> Message {
        Message {
            subject: Subject::parse(subject).expect("valid subject"),
            payload: payload.to_vec(),
            ttl: -43_200_000,
            age: 17,
            postmarks: vec![1, 0xFFFF_FFFF],
        }
    }

    #[test]
    fn test_decode_several_frames_from_one_read() {
        let mut bytes = encode(&message("A/B", b"one")).expect("encode");
        bytes.extend(encode_frame(&Frame::Subscribe(Subject::parse("C/*").expect("subject"))).expect("encode"));
        bytes.extend(encode(&message("D", b"")).expect("encode"));

        let frames = decode(&bytes).expect("decode");
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], Frame::Message(message("A/B", b"one")));
        assert_eq!(
            frames[1],
            Frame::Subscribe(Subject::parse("C/*").expect("subject"))
        );
        assert_eq!(frames[2], Frame::Message(message("D", b"")));
    }

    #[test]
    fn test_partial_frame_stays_buffered() {
        let bytes = encode(&message("Stat/Heartbeat", b"<Code>123</Code>")).expect("encode");
        let (head, tail) = bytes.split_at(bytes.len() - 3);

        let mut decoder = FrameDecoder::new();
        decoder.extend(head);
        assert_eq!(decoder.next_frame(), Ok(None));
        assert_eq!(decoder.buffered(), head.len());

        decoder.extend(tail);
        let frame = decoder.next_frame().expect("decode").expect("complete frame");
        assert_eq!(frame, Frame::Message(message("Stat/Heartbeat", b"<Code>123</Code>")));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_oversized_frame_discards_buffer() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[OP_MESSAGE, 0xFF, 0xFF, 0xFF, 0xFF, 1, 2, 3]);
        assert!(matches!(
            decoder.next_frame(),
            Err(CodecError::FrameTooLarge(_))
        ));
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(
            decoder.take_discarded(),
            vec![OP_MESSAGE, 0xFF, 0xFF, 0xFF, 0xFF, 1, 2, 3]
        );
        assert!(decoder.take_discarded().is_empty());

        // The stream continues with the next well-formed frame.
        decoder.extend(&encode(&message("A", b"x")).expect("encode"));
        assert_eq!(
            decoder.next_frame(),
            Ok(Some(Frame::Message(message("A", b"x"))))
        );
    }

    #[test]
    fn test_corrupt_body_is_an_error() {
        // Subscribe frame whose subject has an empty token.
        let bytes = [OP_SUBSCRIBE, 0, 0, 0, 4, 0, 1, 0, 0];
        assert_eq!(
            decode(&bytes),
            Err(CodecError::Subject(SubjectError::EmptyToken(String::new())))
        );

        // Declared payload length runs past the body.
        let mut bytes = encode(&message("A", b"abc")).expect("encode");
        let len = bytes.len();
        bytes[len - 4] = 9;
        assert_eq!(decode(&bytes), Err(CodecError::Truncated("payload")));
    }

    #[test]
    fn test_unknown_op_is_surfaced() {
        let bytes = encode_frame(&Frame::Unknown(0x7F, vec![9, 9])).expect("encode");
        assert_eq!(decode(&bytes), Ok(vec![Frame::Unknown(0x7F, vec![9, 9])]));
    }

    proptest! {
        #[test]
        fn prop_message_round_trip(
            tokens in prop::collection::vec("[A-Za-z0-9*]{1,12}", 1..6),
            payload in prop::collection::vec(any::<u8>(), 0..512),
            ttl in any::<i64>(),
            age in any::<u64>(),
            postmarks in prop::collection::vec(any::<u32>(), 0..8),
        ) {
            let original = Message {
                subject: Subject::new(tokens).expect("non-empty tokens"),
                payload,
                ttl,
                age,
                postmarks,
            };
            let frames = decode(&encode(&original).expect("encode")).expect("decode");
            prop_assert_eq!(frames, vec![Frame::Message(original)]);
        }
    }
}
