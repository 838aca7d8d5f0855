//! Named quotas with fixed-window and token-bucket policies.
//!
//! State lives in a [`RateLimitStore`]. The in-memory store suits tests and
//! single-instance deployments; enable `redis-backend` to share counters
//! across instances.

mod clock;
mod limiter;
pub mod policy;
mod store;
#[cfg(feature = "redis-backend")]
mod store_redis;

pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{GLOBAL_KEY, LimitArgs, LimitStatus, RateLimitSnapshot, RateLimiter};
pub use policy::{BucketState, EvalMode, Evaluation, LimitPolicy, LimitRequest, PolicyKind};
pub use store::{MemoryRateLimitStore, RateLimitStore};
#[cfg(feature = "redis-backend")]
pub use store_redis::{RedisConfig, RedisRateLimitStore};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Unknown rate limit: {name}")]
    UnknownLimit { name: String },

    #[error("Rate limit storage error: {message}")]
    Storage { message: String },
}

pub type RateLimitResult<T> = std::result::Result<T, RateLimitError>;
pub type StoreResult<T> = RateLimitResult<T>;

#[cfg(feature = "redis-backend")]
pub(crate) trait StorageResultExt<T> {
    fn storage_err(self) -> StoreResult<T>;
    fn storage_err_ctx(self, context: &str) -> StoreResult<T>;
}

#[cfg(feature = "redis-backend")]
impl<T, E: std::fmt::Display> StorageResultExt<T> for std::result::Result<T, E> {
    fn storage_err(self) -> StoreResult<T> {
        self.map_err(|e| RateLimitError::Storage {
            message: e.to_string(),
        })
    }

    fn storage_err_ctx(self, context: &str) -> StoreResult<T> {
        self.map_err(|e| RateLimitError::Storage {
            message: format!("{}: {}", context, e),
        })
    }
}

#[cfg(feature = "redis-backend")]
pub(crate) async fn with_retry<F, Fut, T>(
    max_retries: u32,
    initial_backoff: std::time::Duration,
    max_backoff: std::time::Duration,
    is_retryable: impl Fn(&RateLimitError) -> bool,
    operation: F,
) -> StoreResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;
    let mut backoff = initial_backoff;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries && is_retryable(&e) => {
                attempt += 1;
                tracing::warn!(
                    attempt = attempt,
                    error = %e,
                    "Retrying rate limit store operation after transient failure"
                );
                let jitter_factor = 1.0 + (rand::random::<f64>() * 0.2 - 0.1);
                tokio::time::sleep(backoff.mul_f64(jitter_factor)).await;
                backoff = (backoff * 2).min(max_backoff);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_error_display() {
        let err = RateLimitError::UnknownLimit {
            name: "send_message".to_string(),
        };
        assert!(err.to_string().contains("send_message"));
    }
}
