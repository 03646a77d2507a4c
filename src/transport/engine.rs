//! # Receive/Send Engine
//!
//! One receive task per connection. It reads straight into the codec's window,
//! hands each completed frame to the connection before issuing the next read,
//! and turns every way the stream can end into exactly one disconnect.
//!
//! Writes are whole frames: the caller holds the writer lock for the full frame
//! so concurrent senders never interleave bytes.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::core::codec::{Decoded, FrameCodec};
use crate::service::connection::Connection;
use crate::service::events::DisconnectReason;
use crate::transport::BoxedStream;

/// Drive `reader` until the peer goes away, the codec rejects the stream, a
/// handler fails unobserved, or `shutdown` fires.
pub(crate) async fn receive_loop(
    connection: Connection,
    mut reader: ReadHalf<BoxedStream>,
    mut codec: Box<dyn FrameCodec>,
    shutdown: CancellationToken,
) {
    trace!(conn_id = connection.id(), codec = codec.name(), "Receive loop started");

    let reason = loop {
        let read = {
            let window = codec.receive_buffer();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                result = reader.read(window) => Some(result),
            }
        };

        // Cancelled: whoever cancelled already ran the disconnect.
        let Some(read) = read else { break None };

        match read {
            Ok(0) => break Some(DisconnectReason::RemoteClosed),
            Ok(n) => match codec.on_bytes_received(n) {
                Ok(Decoded::Pending) => {}
                Ok(Decoded::Frame(payload)) => {
                    if let Err(reason) = connection.dispatch_frame(payload) {
                        break Some(reason);
                    }
                }
                Ok(Decoded::Close) => break Some(DisconnectReason::CloseSignal),
                Err(e) => {
                    warn!(conn_id = connection.id(), error = %e, "Protocol violation");
                    connection.record_protocol_violation(&e);
                    break Some(DisconnectReason::ProtocolViolation(e.to_string()));
                }
            },
            Err(e) => break Some(transport_reason(&e)),
        }
    };

    match reason {
        Some(reason) => {
            debug!(conn_id = connection.id(), %reason, "Receive loop ended");
            connection.disconnect(reason);
        }
        None => trace!(conn_id = connection.id(), "Receive loop cancelled"),
    }
}

/// Write one encoded frame, or nothing if `shutdown` fires first.
pub(crate) async fn write_frame(
    writer: &mut WriteHalf<BoxedStream>,
    frame: &[u8],
    shutdown: &CancellationToken,
) -> io::Result<()> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(io::Error::from(io::ErrorKind::NotConnected)),
        result = async {
            writer.write_all(frame).await?;
            writer.flush().await
        } => result,
    }
}

pub(crate) fn transport_reason(error: &io::Error) -> DisconnectReason {
    match error.kind() {
        io::ErrorKind::UnexpectedEof => DisconnectReason::RemoteClosed,
        _ => DisconnectReason::Transport(error.to_string()),
    }
}
