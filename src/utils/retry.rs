//! Backoff policies built on `backon`.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for re-dialing a lost broker connection. Unbounded attempts.
///
/// - Min delay: 100ms
/// - Max delay: 30s, up to 60s with jitter
/// - Jitter enabled
pub fn reconnect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .without_max_times()
        .with_jitter()
}

/// Backoff for the initial broker connection at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s, up to 10s with jitter
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}
