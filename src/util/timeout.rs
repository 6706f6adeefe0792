//! Timeout helper.

use std::future::Future;
use std::time::Duration;

use crate::error::ParleyError;

/// Bound a fallible future by `duration`, failing with [`ParleyError::Timeout`].
pub async fn with_timeout<T>(
    duration: Duration,
    future: impl Future<Output = Result<T, ParleyError>>,
) -> Result<T, ParleyError> {
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ParleyError::Timeout(duration.as_millis() as u64)),
    }
}
