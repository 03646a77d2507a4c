//! # Length-Prefixed Framing
//!
//! ## Wire Format
//! ```text
//! [Length(2 or 4, little-endian)] [Payload(Length)]
//! ```
//!
//! The standard width carries up to 65 535 bytes; the extended width is selected
//! at construction for larger payloads. A zero length is not an empty message but
//! an in-band close signal. Lengths above the configured maximum are rejected
//! before any body buffer is allocated.

use std::mem;

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::codec::{parts_len, Decoded, FrameCodec, ReceiveWindow};
use crate::error::{ProtocolError, Result};

/// Width of the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixWidth {
    /// 2-byte prefix
    Standard,
    /// 4-byte prefix
    Extended,
}

impl PrefixWidth {
    /// Number of prefix bytes on the wire.
    pub const fn size(self) -> usize {
        match self {
            PrefixWidth::Standard => 2,
            PrefixWidth::Extended => 4,
        }
    }

    /// Largest length the prefix can express.
    pub const fn limit(self) -> usize {
        match self {
            PrefixWidth::Standard => u16::MAX as usize,
            PrefixWidth::Extended => u32::MAX as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingLength,
    AwaitingBody,
}

/// Length-prefixed codec with a two-state reassembly machine.
#[derive(Debug)]
pub struct PrefixLengthCodec {
    width: PrefixWidth,
    max_payload: usize,
    state: State,
    header: [u8; 4],
    // Allocated per message once the length is known.
    body: Vec<u8>,
    offset: usize,
}

impl PrefixLengthCodec {
    /// Standard 2-byte prefix, max payload 65 535.
    pub fn new() -> Self {
        Self::with_max_payload(PrefixWidth::Standard, PrefixWidth::Standard.limit())
    }

    /// Extended 4-byte prefix, max payload 16 MB.
    pub fn extended() -> Self {
        Self::with_max_payload(PrefixWidth::Extended, MAX_PAYLOAD_SIZE)
    }

    /// Custom maximum, clamped to what `width` can express.
    pub fn with_max_payload(width: PrefixWidth, max_payload: usize) -> Self {
        Self {
            width,
            max_payload: max_payload.min(width.limit()),
            state: State::AwaitingLength,
            header: [0; 4],
            body: Vec::new(),
            offset: 0,
        }
    }

    /// Size of the length header on the wire.
    pub fn width(&self) -> PrefixWidth {
        self.width
    }

    /// True while waiting for the length prefix.
    pub fn is_awaiting_length(&self) -> bool {
        self.state == State::AwaitingLength
    }

    fn parse_length(&self) -> usize {
        match self.width {
            PrefixWidth::Standard => u16::from_le_bytes([self.header[0], self.header[1]]) as usize,
            PrefixWidth::Extended => u32::from_le_bytes(self.header) as usize,
        }
    }
}

impl Default for PrefixLengthCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec for PrefixLengthCodec {
    fn name(&self) -> &'static str {
        match self.width {
            PrefixWidth::Standard => "prefix-length",
            PrefixWidth::Extended => "extended-prefix-length",
        }
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn window(&self) -> ReceiveWindow {
        let size = match self.state {
            State::AwaitingLength => self.width.size(),
            State::AwaitingBody => self.body.len(),
        };
        ReceiveWindow {
            size,
            offset: self.offset,
            count: size - self.offset,
        }
    }

    fn receive_buffer(&mut self) -> &mut [u8] {
        match self.state {
            State::AwaitingLength => &mut self.header[self.offset..self.width.size()],
            State::AwaitingBody => &mut self.body[self.offset..],
        }
    }

    fn on_bytes_received(&mut self, count: usize) -> Result<Decoded> {
        let window = self.window();
        if count > window.count {
            return Err(ProtocolError::InvalidFrame(format!(
                "read of {count} bytes overran a window of {}",
                window.count
            )));
        }

        self.offset += count;
        if self.offset < window.size {
            return Ok(Decoded::Pending);
        }
        self.offset = 0;

        match self.state {
            State::AwaitingLength => {
                let length = self.parse_length();
                if length == 0 {
                    return Ok(Decoded::Close);
                }
                if length > self.max_payload {
                    return Err(ProtocolError::OversizedPacket(length));
                }
                self.body = vec![0; length];
                self.state = State::AwaitingBody;
                Ok(Decoded::Pending)
            }
            State::AwaitingBody => {
                self.state = State::AwaitingLength;
                Ok(Decoded::Frame(Bytes::from(mem::take(&mut self.body))))
            }
        }
    }

    fn encode_frame(&self, parts: &[&[u8]], dst: &mut BytesMut) -> Result<usize> {
        let total = parts_len(parts);
        if total > self.max_payload {
            return Err(ProtocolError::OversizedPacket(total));
        }

        dst.reserve(self.width.size() + total);
        match self.width {
            PrefixWidth::Standard => dst.put_u16_le(total as u16),
            PrefixWidth::Extended => dst.put_u32_le(total as u32),
        }
        for part in parts {
            dst.extend_from_slice(part);
        }
        Ok(total)
    }

    fn box_clone(&self) -> Box<dyn FrameCodec> {
        Box::new(Self::with_max_payload(self.width, self.max_payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(codec: &PrefixLengthCodec, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        codec.encode_frame(&[payload], &mut buf).expect("encode");
        buf
    }

    #[test]
    fn encodes_little_endian_prefix() {
        let codec = PrefixLengthCodec::new();
        let wire = frame(&codec, b"abc");
        assert_eq!(&wire[..], &[3, 0, b'a', b'b', b'c']);

        let codec = PrefixLengthCodec::extended();
        let wire = frame(&codec, &[7; 258]);
        assert_eq!(&wire[..4], &[2, 1, 0, 0]);
        assert_eq!(wire.len(), 262);
    }

    #[test]
    fn window_tracks_state_machine() {
        let mut codec = PrefixLengthCodec::new();
        assert_eq!(codec.window(), ReceiveWindow { size: 2, offset: 0, count: 2 });

        codec.receive_buffer()[0] = 5;
        assert_eq!(codec.on_bytes_received(1).expect("step"), Decoded::Pending);
        assert_eq!(codec.window(), ReceiveWindow { size: 2, offset: 1, count: 1 });

        codec.receive_buffer()[0] = 0;
        assert_eq!(codec.on_bytes_received(1).expect("step"), Decoded::Pending);
        assert!(!codec.is_awaiting_length());
        assert_eq!(codec.window(), ReceiveWindow { size: 5, offset: 0, count: 5 });
    }

    #[test]
    fn byte_at_a_time_matches_single_chunk() {
        let codec = PrefixLengthCodec::new();
        let mut wire = frame(&codec, b"first");
        wire.extend_from_slice(&frame(&codec, b"second"));

        let whole = codec.box_clone().decode_all(&wire).expect("decode");
        let mut trickle = codec.box_clone();
        let mut pieces = Vec::new();
        for byte in wire.iter() {
            pieces.extend(trickle.decode_all(&[*byte]).expect("decode"));
        }

        assert_eq!(whole, pieces);
        assert_eq!(
            whole,
            vec![
                Decoded::Frame(Bytes::from_static(b"first")),
                Decoded::Frame(Bytes::from_static(b"second")),
            ]
        );
    }

    #[test]
    fn zero_length_prefix_is_close_signal() {
        let mut codec = PrefixLengthCodec::new();
        let decoded = codec.decode_all(&[0x00, 0x00]).expect("decode");
        assert_eq!(decoded, vec![Decoded::Close]);
    }

    #[test]
    fn empty_payload_encodes_close_signal() {
        let codec = PrefixLengthCodec::new();
        assert_eq!(&frame(&codec, b"")[..], &[0, 0]);
    }

    #[test]
    fn declared_length_over_max_is_rejected() {
        let mut codec = PrefixLengthCodec::with_max_payload(PrefixWidth::Standard, 1000);
        let header = 5000u16.to_le_bytes();
        let result = codec.decode_all(&header);
        assert!(matches!(result, Err(ProtocolError::OversizedPacket(5000))));
        assert!(codec.body.is_empty(), "no body buffer may be allocated");
    }

    #[test]
    fn oversized_send_is_rejected() {
        let codec = PrefixLengthCodec::with_max_payload(PrefixWidth::Standard, 4);
        let mut buf = BytesMut::new();
        let result = codec.encode_frame(&[b"abc", b"de"], &mut buf);
        assert!(matches!(result, Err(ProtocolError::OversizedPacket(5))));
        assert!(buf.is_empty());
    }

    #[test]
    fn max_is_clamped_to_width() {
        let codec = PrefixLengthCodec::with_max_payload(PrefixWidth::Standard, 1 << 20);
        assert_eq!(codec.max_payload(), 65_535);
    }

    #[test]
    fn clone_does_not_share_progress() {
        let mut codec = PrefixLengthCodec::new();
        codec.decode_all(&[3, 0, b'x']).expect("decode");
        let mut fresh = codec.box_clone();
        assert_eq!(fresh.window().size, 2);
        assert_eq!(
            fresh.decode_all(&[1, 0, b'y']).expect("decode"),
            vec![Decoded::Frame(Bytes::from_static(b"y"))]
        );
    }
}
