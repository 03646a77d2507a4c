//! # Service Layer
//!
//! Connections and the server that accepts them.
//!
//! ## Components
//! - **Connection**: one framed conversation, client or accepted
//! - **Server**: accept loop, live-connection registry and broadcast
//! - **Events**: callback types and disconnect reasons

pub mod connection;
pub mod events;
pub mod server;

pub use connection::{Connection, ConnectionState};
pub use events::{DisconnectReason, HandlerError, HandlerResult, ReceiveHandler};
pub use server::{BroadcastReport, Server};
