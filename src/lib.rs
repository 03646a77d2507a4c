//! # framelink
//!
//! Pluggable wire framing over TCP, with a connection lifecycle and an async
//! receive/send engine.
//!
//! A [`transport::Protocol`] decides how a byte stream becomes messages:
//! length-prefixed, delimiter-terminated or unframed, optionally inside TLS.
//! A [`service::Connection`] owns one socket and one protocol instance and runs
//! a receive loop that delivers messages in wire order. A [`service::Server`]
//! clones its protocol template for every accepted socket and can broadcast to
//! every live connection.
//!
//! ## Example
//! ```rust,no_run
//! use framelink::prelude::*;
//!
//! # async fn run() -> Result<()> {
//! let server = Server::new(TcpProtocol::prefix_length());
//! let addr = server.start("127.0.0.1:0").await?;
//!
//! let client = Connection::new(TcpProtocol::prefix_length());
//! client.on_message(|message| {
//!     println!("{:?}", message.payload());
//!     Ok(())
//! });
//! client.connect(&addr.to_string()).await?;
//! client.send(b"ping").await?;
//!
//! server.broadcast(b"hello everyone").await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod service;
pub mod transport;
pub mod utils;

/// Common imports.
pub mod prelude {
    pub use crate::core::{DelimiterCodec, FrameCodec, Message, PlainCodec, PrefixLengthCodec, PrefixWidth};
    pub use crate::error::{ProtocolError, Result};
    pub use crate::service::{
        BroadcastReport, Connection, ConnectionState, DisconnectReason, HandlerResult, Server,
    };
    pub use crate::transport::{Protocol, TcpProtocol, TlsClientConfig, TlsProtocol, TlsServerConfig};
}

pub use error::{ProtocolError, Result};
