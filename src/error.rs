//! # Error Types
//!
//! Error handling for framing, connection and server operations.
//!
//! ## Error Categories
//! - **Usage errors**: invalid arguments, sending on a closed connection, starting
//!   a running server. Reported synchronously at the call site.
//! - **Transport errors**: resets, refusals, broken pipes, abrupt EOF. Inside a
//!   running connection these are turned into a disconnect, never re-raised.
//! - **Protocol violations**: oversized or garbled frames. Handled like transport
//!   errors and optionally surfaced through the error channel.
//! - **Handler errors**: failures or panics raised by caller-supplied callbacks.
//!
//! ## Example Usage
//! ```rust
//! use framelink::error::{ProtocolError, Result};
//!
//! fn check_port(port: u16) -> Result<u16> {
//!     if port == 0 {
//!         return Err(ProtocolError::InvalidArgument("port must not be zero".into()));
//!     }
//!     Ok(port)
//! }
//!
//! assert!(check_port(0).unwrap_err().is_usage_error());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Argument validation errors
    pub const ERR_EMPTY_ADDRESS: &str = "Endpoint address must not be empty";
    pub const ERR_ZERO_PORT: &str = "Endpoint port must not be zero";
    pub const ERR_EMPTY_DELIMITER: &str = "Delimiter must contain at least one byte";
    pub const ERR_ZERO_BUFFER: &str = "Receive buffer size must be greater than zero";

    /// TLS configuration errors
    pub const ERR_NO_CLIENT_TLS: &str = "No TLS client configuration for the connecting side";
    pub const ERR_NO_SERVER_TLS: &str = "No TLS server configuration for the accepting side";
    pub const ERR_INVALID_SERVER_NAME: &str = "Invalid TLS server name";
    pub const ERR_CERTIFICATE_REJECTED: &str = "Server certificate rejected by predicate";
    pub const ERR_PINNED_MISMATCH: &str = "Pinned certificate hash mismatch";
}

/// ProtocolError is the primary error type for all operations in this crate
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection is not connected")]
    NotConnected,

    #[error("Connection is already connected")]
    AlreadyConnected,

    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Server is not running")]
    NotRunning,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Handler error: {0}")]
    Handler(String),
}

impl ProtocolError {
    /// Returns true for errors caused by misuse of the API rather than the peer
    /// or the network.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::NotConnected
                | ProtocolError::AlreadyConnected
                | ProtocolError::AlreadyRunning
                | ProtocolError::NotRunning
                | ProtocolError::InvalidArgument(_)
                | ProtocolError::OversizedPacket(_)
                | ProtocolError::ConfigError(_)
        )
    }

    /// Returns true when the error means the transport is gone.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::ConnectionClosed => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_are_classified() {
        assert!(ProtocolError::NotConnected.is_usage_error());
        assert!(ProtocolError::OversizedPacket(70_000).is_usage_error());
        assert!(!ProtocolError::ConnectionClosed.is_usage_error());
        assert!(!ProtocolError::Timeout.is_usage_error());
    }

    #[test]
    fn reset_is_a_disconnect() {
        let err = ProtocolError::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(err.is_disconnect());
        let err = ProtocolError::Io(io::Error::from(io::ErrorKind::InvalidData));
        assert!(!err.is_disconnect());
    }
}
