//! Bounded, cancellable polling

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{Error, Result};

/// Sleep for `duration` unless `cancel` fires first.
///
/// Returns [`Error::Cancelled`] when interrupted.
pub async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::cancelled("sleep")),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Poll `check_fn` until it returns `Ok(true)`, the timeout expires, or
/// `cancel` fires.
///
/// Errors from `check_fn` are treated as "not yet" and logged at trace level;
/// polling failures against a reconfiguring service are expected.
///
/// # Arguments
/// * `cancel` - Cancellation signal, checked before every attempt
/// * `timeout` - Upper bound on the whole wait
/// * `poll_interval` - Delay between attempts
/// * `operation` - Name used in the timeout error
/// * `timeout_msg` - Message used in the timeout error
/// * `check_fn` - The condition to poll
pub async fn poll_until<F, Fut>(
    cancel: &CancellationToken,
    timeout: Duration,
    poll_interval: Duration,
    operation: &str,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(operation));
        }
        if start.elapsed() > timeout {
            return Err(Error::timeout(operation, timeout_msg));
        }

        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => {
                trace!(operation, "Polling condition not yet met, retrying...");
            }
            Err(e) => {
                trace!(operation, error = %e, "Polling check returned error (retrying)");
            }
        }

        sleep_or_cancel(cancel, poll_interval)
            .await
            .map_err(|_| Error::cancelled(operation))?;
    }
}
