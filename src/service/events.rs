//! Callback types, disconnect reasons and the plumbing that invokes callbacks
//! without letting a panicking one take the receive loop down with it.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::error;

use crate::core::Message;
use crate::error::ProtocolError;
use crate::service::connection::Connection;

/// Error type handlers and observers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type handlers and observers return.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Replacement receive handler installed with
/// [`Connection::set_receive_handler`](crate::service::Connection::set_receive_handler).
pub type ReceiveHandler = Arc<dyn Fn(Message) -> HandlerResult + Send + Sync>;

pub(crate) type MessageObserver = dyn Fn(&Message) -> HandlerResult + Send + Sync;
pub(crate) type ConnectObserver = dyn Fn(&Connection) -> HandlerResult + Send + Sync;
pub(crate) type DisconnectObserver = dyn Fn(&Connection, &DisconnectReason) + Send + Sync;
pub(crate) type ErrorObserver = dyn Fn(&Connection, &ProtocolError) + Send + Sync;
pub(crate) type SendObserver = dyn Fn(&Connection, usize) + Send + Sync;

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `dispose` was called on this side
    Local,
    /// The peer closed the stream
    RemoteClosed,
    /// The peer sent the zero-length close frame
    CloseSignal,
    /// The peer sent bytes the codec could not accept
    ProtocolViolation(String),
    /// Read or write failure on the underlying stream
    Transport(String),
    /// A receive handler failed and nothing observed the error
    HandlerError(String),
}

impl DisconnectReason {
    /// True when the connection ended through a fault rather than an orderly close.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            DisconnectReason::ProtocolViolation(_)
                | DisconnectReason::Transport(_)
                | DisconnectReason::HandlerError(_)
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Local => f.write_str("disposed locally"),
            DisconnectReason::RemoteClosed => f.write_str("closed by peer"),
            DisconnectReason::CloseSignal => f.write_str("close signal received"),
            DisconnectReason::ProtocolViolation(e) => write!(f, "protocol violation: {e}"),
            DisconnectReason::Transport(e) => write!(f, "transport error: {e}"),
            DisconnectReason::HandlerError(e) => write!(f, "handler error: {e}"),
        }
    }
}

/// Receives what a connection cannot handle alone. Implemented by the server
/// that accepted it.
pub(crate) trait Supervisor: Send + Sync {
    fn on_message(&self, message: &Message) -> HandlerResult;

    /// Returns true if anyone observed the error.
    fn on_error(&self, connection: &Connection, error: &ProtocolError) -> bool;

    fn on_disconnect(&self, connection: &Connection, reason: &DisconnectReason);
}

/// Append-only list of callbacks.
pub(crate) struct Observers<T: ?Sized> {
    entries: RwLock<Vec<Arc<T>>>,
}

impl<T: ?Sized> Observers<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, observer: Arc<T>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Copy of the current list so callbacks run without the lock held.
    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Wrapper that formats a panic payload when logged or displayed.
#[derive(Debug)]
pub(crate) struct PanicMessage(Box<dyn Any + Send>);

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.0.downcast_ref::<String>() {
            f.write_str(s)
        } else if let Some(s) = self.0.downcast_ref::<&'static str>() {
            f.write_str(s)
        } else {
            write!(f, "{:?}", self.0)
        }
    }
}

/// Run a caller-supplied handler, folding both returned errors and panics into
/// [`ProtocolError::Handler`].
pub(crate) fn invoke_handler<F>(handler: F) -> Result<(), ProtocolError>
where
    F: FnOnce() -> HandlerResult,
{
    match panic::catch_unwind(AssertUnwindSafe(handler)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ProtocolError::Handler(e.to_string())),
        Err(payload) => Err(ProtocolError::Handler(format!(
            "handler panicked: {}",
            PanicMessage(payload)
        ))),
    }
}

/// Run a notification callback that has no error channel; a panic is logged.
pub(crate) fn notify<F: FnOnce()>(label: &'static str, callback: F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        error!(callback = label, panic = %PanicMessage(payload), "Observer panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returned_error_becomes_handler_error() {
        let result = invoke_handler(|| Err("bad payload".into()));
        assert!(matches!(result, Err(ProtocolError::Handler(msg)) if msg == "bad payload"));
    }

    #[test]
    fn panic_is_captured_with_its_message() {
        let result = invoke_handler(|| panic!("boom"));
        assert!(matches!(result, Err(ProtocolError::Handler(msg)) if msg.contains("boom")));
    }

    #[test]
    fn notify_swallows_panics() {
        notify("test", || panic!("ignored"));
    }

    #[test]
    fn snapshot_is_detached_from_later_pushes() {
        let observers: Observers<dyn Fn() -> u8 + Send + Sync> = Observers::new();
        assert!(observers.snapshot().is_empty());
        observers.push(Arc::new(|| 1));
        let snapshot = observers.snapshot();
        observers.push(Arc::new(|| 2));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(observers.snapshot().len(), 2);
    }

    #[test]
    fn fault_reasons_are_errors() {
        assert!(DisconnectReason::Transport("reset".into()).is_error());
        assert!(!DisconnectReason::CloseSignal.is_error());
        assert_eq!(DisconnectReason::Local.to_string(), "disposed locally");
    }
}
