//! # Transport Layer
//!
//! A [`Protocol`] couples a framing codec with the way a connected socket becomes
//! the byte stream that codec runs over. [`tcp::TcpProtocol`] uses the socket
//! directly; [`tls::TlsProtocol`] wraps any other protocol and layers a negotiated
//! TLS stream on top, leaving the framing untouched.
//!
//! ## Lifecycle
//! A protocol is built once as a template. Servers call [`Protocol::box_clone`]
//! for every accepted socket so no two connections share reassembly state.
//! Dropping a protocol releases whatever it owns.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};

use crate::config::{FramingConfig, FramingKind};
use crate::core::codec::FrameCodec;
use crate::core::{DelimiterCodec, PlainCodec, PrefixLengthCodec, PrefixWidth};
use crate::error::Result;

pub(crate) mod engine;
pub mod tcp;
pub mod tls;

pub use tcp::TcpProtocol;
pub use tls::{TlsClientConfig, TlsProtocol, TlsServerConfig};

/// Any bidirectional byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased stream returned by [`Protocol::get_stream`].
pub type BoxedStream = Box<dyn AsyncStream>;

/// Which side of the conversation a stream is being prepared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The side that initiated the TCP connection
    Client,
    /// The side that accepted it
    Server,
}

/// Pluggable framing strategy plus stream provisioning for one connection.
#[async_trait]
pub trait Protocol: Send + Sync + fmt::Debug + 'static {
    /// The framing template. Never used for reassembly directly.
    fn codec(&self) -> &dyn FrameCodec;

    fn name(&self) -> &'static str {
        self.codec().name()
    }

    /// Whether `get_stream` negotiates a secure channel.
    fn is_secure(&self) -> bool {
        false
    }

    /// Create an unconnected socket for `addr`'s address family.
    fn socket(&self, addr: &SocketAddr) -> io::Result<TcpSocket> {
        if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
    }

    /// Turn a connected socket into the stream frames are read from and written to.
    async fn get_stream(&self, tcp: TcpStream, role: Role) -> Result<BoxedStream>;

    /// Called once the outbound TCP connect completes.
    async fn on_connect(&self, tcp: TcpStream) -> Result<BoxedStream> {
        self.get_stream(tcp, Role::Client).await
    }

    /// Called for every socket a server accepts.
    async fn on_accepted_by_server(&self, tcp: TcpStream) -> Result<BoxedStream> {
        self.get_stream(tcp, Role::Server).await
    }

    /// Fresh reassembly state for a receive loop.
    fn new_decoder(&self) -> Box<dyn FrameCodec> {
        self.codec().box_clone()
    }

    /// Frame `parts` into `dst`, returning the payload length before framing.
    fn encode_frame(&self, parts: &[&[u8]], dst: &mut BytesMut) -> Result<usize> {
        self.codec().encode_frame(parts, dst)
    }

    /// Independent copy for a new connection.
    fn box_clone(&self) -> Box<dyn Protocol>;
}

impl Clone for Box<dyn Protocol> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Build a plain-socket protocol from the framing section of the configuration.
pub fn protocol_from_config(config: &FramingConfig) -> Result<TcpProtocol> {
    let codec: Box<dyn FrameCodec> = match config.kind {
        FramingKind::PrefixLength => Box::new(PrefixLengthCodec::with_max_payload(
            PrefixWidth::Standard,
            config.max_payload_size,
        )),
        FramingKind::ExtendedPrefixLength => Box::new(PrefixLengthCodec::with_max_payload(
            PrefixWidth::Extended,
            config.max_payload_size,
        )),
        FramingKind::Delimiter => Box::new(
            DelimiterCodec::new(config.delimiter.clone().into_bytes())?
                .append_on_send(config.append_delimiter)
                .strip_on_receive(config.strip_delimiter)
                .max_frame(config.max_payload_size),
        ),
        FramingKind::Plain => Box::new(PlainCodec::with_buffer_size(config.plain_buffer_size)?),
    };
    Ok(TcpProtocol::from_boxed(codec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_selects_codec() {
        let mut config = FramingConfig::default();
        assert_eq!(protocol_from_config(&config).expect("build").name(), "prefix-length");

        config.kind = FramingKind::ExtendedPrefixLength;
        config.max_payload_size = 1 << 20;
        let protocol = protocol_from_config(&config).expect("build");
        assert_eq!(protocol.name(), "extended-prefix-length");
        assert_eq!(protocol.codec().max_payload(), 1 << 20);

        config.kind = FramingKind::Delimiter;
        config.delimiter = String::new();
        assert!(protocol_from_config(&config).is_err());
    }

    #[test]
    fn boxed_protocol_clones_independently() {
        let template: Box<dyn Protocol> = Box::new(TcpProtocol::prefix_length());
        let copy = template.clone();
        assert_eq!(copy.name(), template.name());
        assert!(!copy.is_secure());
    }
}
