//! Timeout defaults and async timeout wrappers.

use crate::error::{BusError, Result};
use std::future::Future;
use std::time::Duration;

/// Default time to wait for a method reply
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

/// Default time allowed for the authentication exchange
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the receive loop sweeps expired pending calls
pub const PENDING_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Run `fut`, mapping an elapsed deadline to [`BusError::Timeout`]
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(BusError::Timeout),
    }
}
