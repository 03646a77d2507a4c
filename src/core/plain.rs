//! Unframed codec: every completed read becomes one message.
//!
//! Message boundaries are whatever a single read returns and bear no relation to
//! the sender's writes. Use this only to interoperate with peers that speak a raw
//! byte stream.

use bytes::{Bytes, BytesMut};

use crate::config::DEFAULT_PLAIN_BUFFER;
use crate::core::codec::{parts_len, Decoded, FrameCodec, ReceiveWindow};
use crate::error::{constants, ProtocolError, Result};

/// No framing: every read from the socket is delivered as one message, so
/// message boundaries follow TCP segmentation.
#[derive(Debug)]
pub struct PlainCodec {
    buffer: Vec<u8>,
}

impl PlainCodec {
    /// Plain codec reading up to 8 KB at a time.
    pub fn new() -> Self {
        Self {
            buffer: vec![0; DEFAULT_PLAIN_BUFFER],
        }
    }

    /// Plain codec with a custom read size.
    pub fn with_buffer_size(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(ProtocolError::InvalidArgument(constants::ERR_ZERO_BUFFER.into()));
        }
        Ok(Self {
            buffer: vec![0; size],
        })
    }
}

impl Default for PlainCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec for PlainCodec {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn max_payload(&self) -> usize {
        usize::MAX
    }

    fn window(&self) -> ReceiveWindow {
        ReceiveWindow {
            size: self.buffer.len(),
            offset: 0,
            count: self.buffer.len(),
        }
    }

    fn receive_buffer(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    fn on_bytes_received(&mut self, count: usize) -> Result<Decoded> {
        if count > self.buffer.len() {
            return Err(ProtocolError::InvalidFrame(format!(
                "read of {count} bytes overran a window of {}",
                self.buffer.len()
            )));
        }
        Ok(Decoded::Frame(Bytes::copy_from_slice(&self.buffer[..count])))
    }

    fn encode_frame(&self, parts: &[&[u8]], dst: &mut BytesMut) -> Result<usize> {
        let total = parts_len(parts);
        dst.reserve(total);
        for part in parts {
            dst.extend_from_slice(part);
        }
        Ok(total)
    }

    fn box_clone(&self) -> Box<dyn FrameCodec> {
        Box::new(Self {
            buffer: vec![0; self.buffer.len()],
        })
    }
}
