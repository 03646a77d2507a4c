//! Plain-socket protocol: frames go straight over the TCP stream.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::trace;

use crate::core::codec::FrameCodec;
use crate::core::{DelimiterCodec, PlainCodec, PrefixLengthCodec};
use crate::error::Result;
use crate::transport::{BoxedStream, Protocol, Role};

/// A codec over an unencrypted TCP socket.
#[derive(Debug)]
pub struct TcpProtocol {
    codec: Box<dyn FrameCodec>,
    nodelay: bool,
}

impl TcpProtocol {
    /// Wrap any codec. `TCP_NODELAY` is on.
    pub fn new(codec: impl FrameCodec) -> Self {
        Self::from_boxed(Box::new(codec))
    }

    /// Same as [`new`](Self::new) for a codec that is already boxed.
    pub fn from_boxed(codec: Box<dyn FrameCodec>) -> Self {
        Self {
            codec,
            nodelay: true,
        }
    }

    /// 2-byte length prefix.
    pub fn prefix_length() -> Self {
        Self::new(PrefixLengthCodec::new())
    }

    /// 4-byte length prefix.
    pub fn extended_prefix_length() -> Self {
        Self::new(PrefixLengthCodec::extended())
    }

    /// Frames terminated by `delimiter`.
    pub fn delimiter(delimiter: impl Into<Bytes>) -> Result<Self> {
        Ok(Self::new(DelimiterCodec::new(delimiter)?))
    }

    /// `\r\n`-terminated lines.
    pub fn lines() -> Self {
        Self::new(DelimiterCodec::lines())
    }

    /// No framing.
    pub fn plain() -> Self {
        Self::new(PlainCodec::new())
    }

    /// Toggle `TCP_NODELAY` on established sockets (on by default).
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[async_trait]
impl Protocol for TcpProtocol {
    fn codec(&self) -> &dyn FrameCodec {
        self.codec.as_ref()
    }

    async fn get_stream(&self, tcp: TcpStream, role: Role) -> Result<BoxedStream> {
        tcp.set_nodelay(self.nodelay)?;
        trace!(?role, codec = self.codec.name(), "Using raw socket stream");
        Ok(Box::new(tcp))
    }

    fn box_clone(&self) -> Box<dyn Protocol> {
        Box::new(Self {
            codec: self.codec.box_clone(),
            nodelay: self.nodelay,
        })
    }
}
