//! # Framing Codec Contract
//!
//! A [`FrameCodec`] turns raw stream bytes into frames and outbound byte sequences
//! into wire bytes. Reassembly is driven through an explicit receive window: the
//! receive loop reads into [`FrameCodec::receive_buffer`], then reports how many
//! bytes arrived via [`FrameCodec::on_bytes_received`]. A single read never
//! crosses a frame boundary, so one chunk advances at most one frame.
//!
//! Codecs are per connection. [`FrameCodec::box_clone`] produces an independent
//! instance; two clones never share reassembly progress.

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::error::Result;

/// Where and how much the next read should fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveWindow {
    /// Total size of the current receive buffer
    pub size: usize,
    /// Position the next read writes to
    pub offset: usize,
    /// Maximum number of bytes the next read may deliver
    pub count: usize,
}

/// Outcome of one reassembly step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// More bytes are needed before a frame is complete.
    Pending,
    /// A complete frame payload.
    Frame(Bytes),
    /// The peer signalled a graceful close in-band.
    Close,
}

/// Stateful framing strategy for one connection.
pub trait FrameCodec: Send + Sync + fmt::Debug + 'static {
    /// Short variant name used in logs.
    fn name(&self) -> &'static str;

    /// Largest payload this codec accepts or emits.
    fn max_payload(&self) -> usize;

    /// Current receive window.
    fn window(&self) -> ReceiveWindow;

    /// The slice the next read must fill: `buffer[offset..offset + count]`.
    fn receive_buffer(&mut self) -> &mut [u8];

    /// Account for `count` bytes written into [`FrameCodec::receive_buffer`].
    ///
    /// An error is a protocol violation and must end the connection.
    fn on_bytes_received(&mut self, count: usize) -> Result<Decoded>;

    /// Append the wire form of the concatenated `parts` to `dst`.
    ///
    /// Returns the payload length before framing.
    fn encode_frame(&self, parts: &[&[u8]], dst: &mut BytesMut) -> Result<usize>;

    /// Fresh, independent copy of this codec.
    fn box_clone(&self) -> Box<dyn FrameCodec>;

    /// Feed an arbitrary run of stream bytes, returning every decoded frame.
    ///
    /// Stops at the first [`Decoded::Close`], which is included in the output.
    fn decode_all(&mut self, mut data: &[u8]) -> Result<Vec<Decoded>> {
        let mut out = Vec::new();
        while !data.is_empty() {
            let window = self.receive_buffer();
            let n = window.len().min(data.len());
            window[..n].copy_from_slice(&data[..n]);
            data = &data[n..];
            match self.on_bytes_received(n)? {
                Decoded::Pending => {}
                Decoded::Close => {
                    out.push(Decoded::Close);
                    break;
                }
                frame => out.push(frame),
            }
        }
        Ok(out)
    }
}

impl Clone for Box<dyn FrameCodec> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Total length of a multi-part payload.
pub(crate) fn parts_len(parts: &[&[u8]]) -> usize {
    parts.iter().map(|p| p.len()).sum()
}
