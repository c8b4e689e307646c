//! Bootstrap helpers for angzarr-rpc binaries.

use std::future::Future;

use backon::Retryable;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::retry::connection_backoff;

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "ANGZARR_RPC_LOG";

/// Initialize tracing with the `ANGZARR_RPC_LOG` environment variable.
///
/// Defaults to "info" level if unset or unparsable.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run `connect` until it succeeds, backing off between attempts.
///
/// Returns the last error once [`connection_backoff`] is exhausted.
pub async fn connect_with_retry<T, E, F, Fut>(target: &str, connect: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let connected = connect
        .retry(connection_backoff())
        .notify(|e: &E, delay| {
            warn!(
                target_name = %target,
                error = %e,
                retry_in_ms = %delay.as_millis(),
                "Connection attempt failed"
            );
        })
        .await?;

    info!(target_name = %target, "Connected");
    Ok(connected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_connect_with_retry_recovers() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;

        let result: Result<&str, String> = connect_with_retry("broker", || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("refused".to_string())
            } else {
                Ok("connected")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "connected");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
