//! Shared utilities for the backend implementations.
//!
//! Provides the pooled [`reqwest`] client shared by every remote backend,
//! the credential provider, and the document store, plus the bounded
//! retry/backoff loop used by the rate-limit-aware variants.

use lazy_static::lazy_static;
use std::future::Future;
use std::time::Duration;

use crate::incidentllm::error::{PlatformError, Result};

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// A single client keeps TLS sessions and DNS lookups warm, which
    /// matters when several backends hit the same upstream hosts
    /// concurrently during an investigation.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Bounded retry policy with exponential backoff and jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomised to avoid thundering herds.
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Policy for the remote GQL endpoint: up to 5 attempts with a linear
    /// ~15 s x attempt wait, mirroring its documented throttling window.
    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: step,
            max_delay: step * max_attempts,
            multiplier: 1.0,
            jitter_factor: 0.05,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = if (self.multiplier - 1.0).abs() < f64::EPSILON {
            // Linear policies scale with the attempt number.
            self.initial_delay.as_millis() as f64 * (attempt + 1) as f64
        } else {
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32)
        };
        let capped = base.min(self.max_delay.as_millis() as f64);
        let jitter_range = capped * self.jitter_factor;
        let jitter = rand::random::<f64>() * jitter_range - jitter_range / 2.0;
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Retry `operation` under `policy`, retrying only errors classified as
/// retryable (rate limit, upstream unavailable). `on_retry` runs between
/// attempts; backends use it to re-acquire bearer tokens.
pub async fn retry_with_backoff<F, Fut, T, R, RFut>(
    policy: &BackoffPolicy,
    mut operation: F,
    mut on_retry: R,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    R: FnMut() -> RFut,
    RFut: Future<Output = ()>,
{
    let mut last_error = None;
    for attempt in 0..policy.max_attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }
                log::warn!(
                    "retryable backend error on attempt {}/{}: {}",
                    attempt + 1,
                    policy.max_attempts,
                    err
                );
                last_error = Some(err);
                if attempt + 1 < policy.max_attempts {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                    on_retry().await;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| PlatformError::internal("retry loop without attempts")))
}
