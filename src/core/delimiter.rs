//! # Delimiter Framing
//!
//! ## Wire Format
//! ```text
//! [Payload] [Delimiter]
//! ```
//!
//! Reads advance one byte at a time into a growing accumulator, and a frame ends
//! as soon as the accumulator's tail equals the delimiter. No escaping is done: a
//! payload that contains the full delimiter sequence is split at that point, so
//! callers must choose a delimiter that never occurs in their data. Individual
//! delimiter bytes inside a payload are fine.

use bytes::{Bytes, BytesMut};

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::codec::{parts_len, Decoded, FrameCodec, ReceiveWindow};
use crate::error::{constants, ProtocolError, Result};

/// Delimiter-terminated codec.
#[derive(Debug)]
pub struct DelimiterCodec {
    delimiter: Bytes,
    append_on_send: bool,
    strip_on_receive: bool,
    max_frame: usize,
    accumulator: BytesMut,
    byte: [u8; 1],
}

impl DelimiterCodec {
    /// Codec for `delimiter`, appending on send and stripping on receive.
    pub fn new(delimiter: impl Into<Bytes>) -> Result<Self> {
        let delimiter = delimiter.into();
        if delimiter.is_empty() {
            return Err(ProtocolError::InvalidArgument(
                constants::ERR_EMPTY_DELIMITER.into(),
            ));
        }
        Ok(Self {
            delimiter,
            append_on_send: true,
            strip_on_receive: true,
            max_frame: MAX_PAYLOAD_SIZE,
            accumulator: BytesMut::new(),
            byte: [0],
        })
    }

    /// `\r\n`-terminated lines.
    pub fn lines() -> Self {
        Self {
            delimiter: Bytes::from_static(b"\r\n"),
            append_on_send: true,
            strip_on_receive: true,
            max_frame: MAX_PAYLOAD_SIZE,
            accumulator: BytesMut::new(),
            byte: [0],
        }
    }

    /// Whether `encode_frame` appends the delimiter.
    pub fn append_on_send(mut self, enabled: bool) -> Self {
        self.append_on_send = enabled;
        self
    }

    /// Whether emitted frames have the delimiter removed.
    pub fn strip_on_receive(mut self, enabled: bool) -> Self {
        self.strip_on_receive = enabled;
        self
    }

    /// Upper bound on an unterminated frame, delimiter excluded.
    pub fn max_frame(mut self, max: usize) -> Self {
        self.max_frame = max;
        self
    }

    /// The byte sequence that ends each frame.
    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// Bytes accumulated toward the current frame.
    pub fn pending_len(&self) -> usize {
        self.accumulator.len()
    }
}

impl FrameCodec for DelimiterCodec {
    fn name(&self) -> &'static str {
        "delimiter"
    }

    fn max_payload(&self) -> usize {
        self.max_frame
    }

    fn window(&self) -> ReceiveWindow {
        ReceiveWindow {
            size: 1,
            offset: 0,
            count: 1,
        }
    }

    fn receive_buffer(&mut self) -> &mut [u8] {
        &mut self.byte
    }

    fn on_bytes_received(&mut self, count: usize) -> Result<Decoded> {
        match count {
            0 => return Ok(Decoded::Pending),
            1 => self.accumulator.extend_from_slice(&self.byte),
            n => {
                return Err(ProtocolError::InvalidFrame(format!(
                    "read of {n} bytes overran a window of 1"
                )))
            }
        }

        if !self.accumulator.ends_with(&self.delimiter) {
            if self.accumulator.len() > self.max_frame + self.delimiter.len() {
                return Err(ProtocolError::OversizedPacket(self.accumulator.len()));
            }
            return Ok(Decoded::Pending);
        }

        let mut frame = self.accumulator.split();
        if self.strip_on_receive {
            frame.truncate(frame.len() - self.delimiter.len());
        }
        Ok(Decoded::Frame(frame.freeze()))
    }

    fn encode_frame(&self, parts: &[&[u8]], dst: &mut BytesMut) -> Result<usize> {
        let total = parts_len(parts);
        if total > self.max_frame {
            return Err(ProtocolError::OversizedPacket(total));
        }

        dst.reserve(total + self.delimiter.len());
        for part in parts {
            dst.extend_from_slice(part);
        }
        if self.append_on_send {
            dst.extend_from_slice(&self.delimiter);
        }
        Ok(total)
    }

    fn box_clone(&self) -> Box<dyn FrameCodec> {
        Box::new(Self {
            delimiter: self.delimiter.clone(),
            append_on_send: self.append_on_send,
            strip_on_receive: self.strip_on_receive,
            max_frame: self.max_frame,
            accumulator: BytesMut::new(),
            byte: [0],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(decoded: Vec<Decoded>) -> Vec<Bytes> {
        decoded
            .into_iter()
            .filter_map(|d| match d {
                Decoded::Frame(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn strips_delimiter_by_default() {
        let mut codec = DelimiterCodec::new(&b"|"[..]).expect("codec");
        let decoded = codec.decode_all(b"ab|").expect("decode");
        assert_eq!(frames(decoded), vec![Bytes::from_static(b"ab")]);
    }

    #[test]
    fn keeps_delimiter_when_configured() {
        let mut codec = DelimiterCodec::lines().strip_on_receive(false);
        let decoded = codec.decode_all(b"hi\r\nyo\r\n").expect("decode");
        assert_eq!(
            frames(decoded),
            vec![Bytes::from_static(b"hi\r\n"), Bytes::from_static(b"yo\r\n")]
        );
    }

    #[test]
    fn partial_delimiter_bytes_stay_in_payload() {
        let mut codec = DelimiterCodec::lines();
        let decoded = codec.decode_all(b"a\rb\nc\r\n").expect("decode");
        assert_eq!(frames(decoded), vec![Bytes::from_static(b"a\rb\nc")]);
    }

    #[test]
    fn embedded_delimiter_splits_the_payload() {
        let codec = DelimiterCodec::new(&b"|"[..]).expect("codec");
        let mut wire = BytesMut::new();
        codec.encode_frame(&[b"a|b"], &mut wire).expect("encode");

        let decoded = codec.box_clone().decode_all(&wire).expect("decode");
        assert_eq!(
            frames(decoded),
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
    }

    #[test]
    fn send_reports_pre_delimiter_length() {
        let codec = DelimiterCodec::lines();
        let mut wire = BytesMut::new();
        let len = codec.encode_frame(&[b"ab", b"cd"], &mut wire).expect("encode");
        assert_eq!(len, 4);
        assert_eq!(&wire[..], b"abcd\r\n");
    }

    #[test]
    fn append_can_be_disabled() {
        let codec = DelimiterCodec::lines().append_on_send(false);
        let mut wire = BytesMut::new();
        codec.encode_frame(&[b"raw"], &mut wire).expect("encode");
        assert_eq!(&wire[..], b"raw");
    }

    #[test]
    fn empty_delimiter_is_rejected() {
        assert!(matches!(
            DelimiterCodec::new(Bytes::new()),
            Err(ProtocolError::InvalidArgument(_))
        ));
    }

    #[test]
    fn unterminated_frame_over_limit_is_violation() {
        let mut codec = DelimiterCodec::lines().max_frame(4);
        let result = codec.decode_all(b"abcdefgh");
        assert!(matches!(result, Err(ProtocolError::OversizedPacket(_))));
    }

    #[test]
    fn window_is_always_one_byte() {
        let mut codec = DelimiterCodec::lines();
        codec.decode_all(b"abc").expect("decode");
        assert_eq!(codec.window(), ReceiveWindow { size: 1, offset: 0, count: 1 });
        assert_eq!(codec.pending_len(), 3);
    }
}
