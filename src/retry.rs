//! Error taxonomy and retry policy.
//!
//! Grounded on the teacher's `retry::QueryError`/`RetryConfig`, with the
//! WASM-only jitter source (`js_sys::Math::random`) and sleep
//! (`wasm_bindgen_futures`) swapped for `rand` and `tokio::time::sleep`.

use crate::cancellation::{CancellationSignal, FetchContext};
use rand::Rng;
use std::time::Duration;
use thiserror::Error;

/// Failure modes a query function (or the engine itself) can report.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum QueryError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("http {status}: {message}")]
    Http {
        status: u16,
        message: String,
        body: Option<String>,
    },

    #[error("failed to serialize request: {0}")]
    Serialization(String),

    #[error("failed to deserialize response: {0}")]
    Deserialization(String),

    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("fetch was cancelled")]
    Cancelled,

    #[error("fetch paused: offline")]
    Paused,

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimit { retry_after_ms: u64 },

    #[error("{message}")]
    Custom {
        message: String,
        code: Option<String>,
    },

    #[error("cache error: {message}")]
    Cache { message: String },
}

impl QueryError {
    pub fn network(message: impl Into<String>) -> Self {
        QueryError::Network {
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>, body: Option<String>) -> Self {
        QueryError::Http {
            status,
            message: message.into(),
            body,
        }
    }

    pub fn custom(message: impl Into<String>) -> Self {
        QueryError::Custom {
            message: message.into(),
            code: None,
        }
    }

    /// Whether the engine should attempt another retry for this error,
    /// absent any user-supplied `retry` predicate override.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueryError::Network { .. } => true,
            QueryError::Timeout { .. } => true,
            QueryError::Http { status, .. } => *status >= 500 || *status == 429,
            QueryError::RateLimit { .. } => true,
            QueryError::Cancelled => false,
            QueryError::Paused => false,
            QueryError::Serialization(_) => false,
            QueryError::Deserialization(_) => false,
            QueryError::TypeMismatch { .. } => false,
            QueryError::Custom { .. } => false,
            QueryError::Cache { .. } => false,
        }
    }

    /// A server-suggested delay override (e.g. `Retry-After`), if any.
    pub fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            QueryError::RateLimit { retry_after_ms } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            QueryError::Cancelled | QueryError::Paused => ErrorSeverity::Info,
            QueryError::RateLimit { .. } | QueryError::Timeout { .. } => ErrorSeverity::Warning,
            QueryError::Http { status, .. } if *status >= 500 => ErrorSeverity::Critical,
            QueryError::Network { .. } => ErrorSeverity::Error,
            _ => ErrorSeverity::Error,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Backoff shape between retry attempts.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryDelay {
    Fixed(Duration),
    Linear { base: Duration },
    Exponential { base: Duration, max: Duration },
}

impl RetryDelay {
    /// `attempt` is 1-based (the delay before the *second* call).
    pub fn calculate(&self, attempt: u32, jitter: bool) -> Duration {
        let raw = match self {
            RetryDelay::Fixed(d) => *d,
            RetryDelay::Linear { base } => *base * attempt,
            RetryDelay::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                (*base * factor).min(*max)
            }
        };
        if jitter {
            let jitter_factor = rand::thread_rng().gen_range(0.5..1.0);
            raw.mul_f64(jitter_factor)
        } else {
            raw
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::Exponential {
            base: Duration::from_millis(1000),
            max: Duration::from_secs(30),
        }
    }
}

/// How many times, and how to space, retry attempts.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay: RetryDelay,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: RetryDelay::default(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay: RetryDelay::Fixed(Duration::ZERO),
            jitter: false,
        }
    }
}

/// Runs `op` under `config`, retrying retryable failures up to
/// `max_attempts` times. `op` receives a fresh [`FetchContext`] per attempt
/// and can bail out early by observing `signal.is_cancelled()`.
pub async fn execute_with_retry<T, F, Fut>(
    config: &RetryConfig,
    signal: &CancellationSignal,
    mut op: F,
) -> Result<T, QueryError>
where
    F: FnMut(FetchContext) -> Fut,
    Fut: std::future::Future<Output = Result<T, QueryError>>,
{
    let mut attempt = 1;
    loop {
        if signal.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        let ctx = FetchContext {
            signal: signal.clone(),
            attempt,
        };
        let result = op(ctx).await;
        match result {
            Ok(value) => return Ok(value),
            Err(err) => {
                if signal.is_cancelled() {
                    return Err(QueryError::Cancelled);
                }
                if attempt >= config.max_attempts || !err.is_retryable() {
                    return Err(err);
                }
                let delay = err
                    .suggested_retry_delay()
                    .unwrap_or_else(|| config.delay.calculate(attempt, config.jitter));
                tracing::debug!(attempt, ?delay, error = %err, "query fetch failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = signal.cancelled() => return Err(QueryError::Cancelled),
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_attempts: 5,
            delay: RetryDelay::Fixed(Duration::from_millis(1)),
            jitter: false,
        };
        let signal = CancellationSignal::new();
        let result = execute_with_retry(&config, &signal, |_ctx| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(QueryError::network("boom"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::default();
        let signal = CancellationSignal::new();
        let result: Result<(), QueryError> = execute_with_retry(&config, &signal, |_ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(QueryError::Deserialization("bad payload".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_backoff() {
        let config = RetryConfig {
            max_attempts: 10,
            delay: RetryDelay::Fixed(Duration::from_secs(30)),
            jitter: false,
        };
        let signal = CancellationSignal::new();
        let signal2 = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            signal2.cancel();
        });
        let result: Result<(), QueryError> =
            execute_with_retry(&config, &signal, |_ctx| async { Err(QueryError::network("x")) })
                .await;
        assert_eq!(result, Err(QueryError::Cancelled));
    }

    #[test]
    fn exponential_delay_is_capped() {
        let delay = RetryDelay::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(delay.calculate(10, false), Duration::from_millis(500));
    }
}
