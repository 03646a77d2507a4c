//! Timeout defaults and async timeout helpers.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default timeout for connect attempts
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for a secure-channel handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for a reply in `send_and_wait`
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default grace period when a server shuts down
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a fallible future with a deadline, mapping expiry to [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
