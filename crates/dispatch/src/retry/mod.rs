//! Unified retry module for outbound provider calls
//!
//! Executes an async operation with classification-driven retry, exponential
//! backoff with jitter, and rate-limit-aware delay override.
//!
//! ## Usage
//! ```rust,no_run
//! use llm_dispatch::retry::{execute_with_retry, ProviderError, RetryConfig};
//!
//! # async fn run() -> llm_dispatch::Result<()> {
//! let config = RetryConfig::default();
//! let value = execute_with_retry(&config, || async { Ok::<_, ProviderError>("success") }, None).await?;
//! assert_eq!(value, "success");
//! # Ok(())
//! # }
//! ```

mod classify;

pub use classify::*;

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DispatchError, Result};

/// Configuration for retry behavior with exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (excluding initial attempt)
    pub max_retries: u32,
    /// Delay before the first retry and lower clamp for every retry
    pub base_delay: Duration,
    /// Upper clamp for computed delays
    pub max_delay: Duration,
    /// Multiplier for exponential backoff calculation
    pub backoff_multiplier: f64,
    /// Fraction of the delay used as uniform +/- jitter (0.0 disables jitter)
    pub jitter_factor: f64,
    /// Status codes treated as transient
    pub retryable_status_codes: BTreeSet<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            retryable_status_codes: default_retryable_status_codes(),
        }
    }
}

pub fn default_retryable_status_codes() -> BTreeSet<u16> {
    [429, 500, 502, 503, 504].into_iter().collect()
}

impl RetryConfig {
    /// Create conservative retry config for production
    pub fn conservative() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 1.5,
            ..Default::default()
        }
    }

    /// Create aggressive retry config for high-availability scenarios
    pub fn aggressive() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(120),
            backoff_multiplier: 2.5,
            ..Default::default()
        }
    }

    /// Create fast retry config for low-latency requirements
    pub fn fast() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    pub fn with_retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    /// Decide whether a failure is worth another attempt.
    ///
    /// A status code is authoritative; without one, the error's own hint or a
    /// known network-failure message makes it retryable.
    pub fn is_retryable<E: RetryableError>(&self, error: &E) -> bool {
        if let Some(code) = error.status_code() {
            return self.retryable_status_codes.contains(&code);
        }
        error.is_retryable() || is_network_error_message(&error.error_message())
    }

    /// Backoff delay for a 0-based attempt index, before any retry-after override
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ns = self.base_delay.as_nanos() as f64;
        let max_ns = (self.max_delay.as_nanos() as f64).max(base_ns);
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut delay_ns = base_ns * self.backoff_multiplier.max(1.0).powi(exponent);
        if !delay_ns.is_finite() || delay_ns > max_ns {
            delay_ns = max_ns;
        }

        if self.jitter_factor > 0.0 {
            let range = delay_ns * self.jitter_factor;
            if range > 0.0 {
                delay_ns += rand::thread_rng().gen_range(-range..=range);
            }
        }

        Duration::from_nanos(delay_ns.clamp(base_ns, max_ns).round() as u64)
    }
}

/// Details handed to the `on_retry` observer before each wait
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// 1-based number of the attempt that just failed
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub error_type: String,
    pub message: String,
    pub status_code: Option<u16>,
    pub rate_limited: bool,
}

/// Observer invoked before every retry; returning an error aborts the loop
pub type OnRetry<'a> = &'a (dyn Fn(&RetryAttempt) -> anyhow::Result<()> + Send + Sync);

/// Execute an async operation with retry logic and exponential backoff
pub async fn execute_with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation: F,
    on_retry: Option<OnRetry<'_>>,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: RetryableError,
{
    execute_with_retry_cancellable(config, &CancellationToken::new(), operation, on_retry).await
}

/// Execute with retry, abandoning inter-attempt waits when `cancel` fires
pub async fn execute_with_retry_cancellable<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
    on_retry: Option<OnRetry<'_>>,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: RetryableError,
{
    let start_time = Instant::now();
    let max_attempts = config.max_retries.saturating_add(1);
    let mut total_delay = Duration::ZERO;

    if cancel.is_cancelled() {
        return Err(DispatchError::Cancelled { attempts: 0 });
    }

    let mut attempt: u32 = 0;
    loop {
        debug!(
            "Retry attempt {}/{} (total elapsed: {:?})",
            attempt + 1,
            max_attempts,
            start_time.elapsed()
        );

        let error = match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        "Operation succeeded after {} retries (total time: {:?}, delays: {:?})",
                        attempt,
                        start_time.elapsed(),
                        total_delay
                    );
                } else {
                    debug!("Operation succeeded on first attempt ({:?})", start_time.elapsed());
                }
                return Ok(result);
            }
            Err(error) => error,
        };

        let retryable = config.is_retryable(&error);
        let attempts_made = attempt + 1;

        if attempt >= config.max_retries || !retryable {
            error!(
                "Operation failed permanently: {} (type: {}, attempt {}/{}, retryable: {})",
                error.error_message(),
                error.error_type(),
                attempts_made,
                max_attempts,
                retryable
            );
            return Err(DispatchError::AttemptsFailed {
                attempts: attempts_made,
                source: Box::new(to_dispatch_error(&error, retryable)),
            });
        }

        let rate_limit_hint = error.retry_after();
        let delay = rate_limit_hint.unwrap_or_else(|| config.delay_for_attempt(attempt));

        warn!(
            "Operation failed, retrying: {} (attempt {}/{}, delay: {:?}, rate limited: {})",
            error.error_message(),
            attempts_made,
            max_attempts,
            delay,
            rate_limit_hint.is_some()
        );

        if let Some(observer) = on_retry {
            let event = RetryAttempt {
                attempt: attempts_made,
                max_attempts,
                delay,
                error_type: error.error_type(),
                message: error.error_message(),
                status_code: error.status_code(),
                rate_limited: rate_limit_hint.is_some(),
            };
            if let Err(callback_error) = observer(&event) {
                error!("Retry callback aborted retry loop: {}", callback_error);
                return Err(DispatchError::CallbackAbort {
                    attempt: attempts_made,
                    reason: callback_error.to_string(),
                });
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                warn!("Retry wait cancelled after {} attempt(s)", attempts_made);
                return Err(DispatchError::Cancelled { attempts: attempts_made });
            }
            _ = tokio::time::sleep(delay) => {}
        }

        total_delay += delay;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct TestError {
        message: String,
        is_retryable: bool,
    }

    impl RetryableError for TestError {
        fn is_retryable(&self) -> bool {
            self.is_retryable
        }

        fn error_type(&self) -> String {
            "test_error".to_string()
        }

        fn error_message(&self) -> String {
            self.message.clone()
        }
    }

    fn quick_config() -> RetryConfig {
        RetryConfig::new()
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_jitter_factor(0.0)
    }

    #[tokio::test]
    async fn test_successful_operation_no_retry() {
        let config = RetryConfig::default();
        let result = execute_with_retry(&config, || async { Ok::<i32, TestError>(42) }, None).await;

        assert_eq!(result.expect("operation should succeed"), 42);
    }

    #[tokio::test]
    async fn test_retry_with_eventual_success() {
        let config = quick_config();
        let counter = Arc::new(Mutex::new(0));

        let result = execute_with_retry(
            &config,
            || {
                let counter = counter.clone();
                async move {
                    let mut count = counter.lock().expect("Lock should not be poisoned");
                    *count += 1;

                    if *count < 3 {
                        Err(TestError {
                            message: "temporary failure".to_string(),
                            is_retryable: true,
                        })
                    } else {
                        Ok(42)
                    }
                }
            },
            None,
        )
        .await;

        assert_eq!(result.expect("operation should succeed"), 42);
        assert_eq!(*counter.lock().expect("Lock should not be poisoned"), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_single_attempt() {
        let config = quick_config().with_max_retries(5);
        let calls = AtomicU32::new(0);

        let result: Result<i32> = execute_with_retry(
            &config,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(TestError {
                        message: "permanent failure".to_string(),
                        is_retryable: false,
                    })
                }
            },
            None,
        )
        .await;

        let err = result.expect_err("operation should fail");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts(), Some(1));
        assert!(matches!(err.root(), DispatchError::NonRetryable { .. }));
        assert!(err.to_string().contains("permanent failure"));
    }

    #[tokio::test]
    async fn test_max_retries_exceeded() {
        let config = quick_config().with_max_retries(2);
        let calls = AtomicU32::new(0);

        let result: Result<i32> = execute_with_retry(
            &config,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(TestError {
                        message: "always fails".to_string(),
                        is_retryable: true,
                    })
                }
            },
            None,
        )
        .await;

        let err = result.expect_err("operation should fail");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts(), Some(3));
        assert!(matches!(err.root(), DispatchError::RetryableTransport { .. }));
    }

    #[tokio::test]
    async fn test_zero_retries_calls_once() {
        let config = quick_config().with_max_retries(0);
        let calls = AtomicU32::new(0);

        let result: Result<()> = execute_with_retry(
            &config,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::from_status_code(503, "unavailable")) }
            },
            None,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_status_code_outside_allowlist_not_retried() {
        let config = quick_config().with_retryable_status_codes([503]);
        let calls = AtomicU32::new(0);

        let result: Result<()> = execute_with_retry(
            &config,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::from_status_code(429, "rate limited")) }
            },
            None,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_overrides_backoff() {
        let config = RetryConfig::new()
            .with_max_retries(1)
            .with_base_delay(Duration::from_millis(10))
            .with_jitter_factor(0.0);
        let seen = Mutex::new(Vec::new());
        let observer = |event: &RetryAttempt| -> anyhow::Result<()> {
            seen.lock().expect("lock").push(event.delay);
            Ok(())
        };
        let calls = AtomicU32::new(0);

        let result = execute_with_retry(
            &config,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ProviderError::from_status_code(429, "slow down")
                            .with_retry_after(Duration::from_secs(2)))
                    } else {
                        Ok("done")
                    }
                }
            },
            Some(&observer),
        )
        .await;

        assert_eq!(result.expect("second attempt succeeds"), "done");
        assert_eq!(*seen.lock().expect("lock"), vec![Duration::from_secs(2)]);
    }

    #[tokio::test]
    async fn test_callback_failure_aborts() {
        let config = quick_config();
        let calls = AtomicU32::new(0);
        let observer = |_: &RetryAttempt| -> anyhow::Result<()> { Err(anyhow::anyhow!("observer down")) };

        let result: Result<()> = execute_with_retry(
            &config,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::from_status_code(502, "bad gateway")) }
            },
            Some(&observer),
        )
        .await;

        match result {
            Err(DispatchError::CallbackAbort { attempt, reason }) => {
                assert_eq!(attempt, 1);
                assert!(reason.contains("observer down"));
            }
            other => panic!("expected callback abort, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_secs(30))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter_factor(0.0);
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: Result<()> = execute_with_retry_cancellable(
            &config,
            &token,
            || async { Err(ProviderError::from_message("connection refused")) },
            None,
        )
        .await;

        assert!(matches!(result, Err(DispatchError::Cancelled { attempts: 1 })));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .with_jitter_factor(0.0);

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_millis(1000))
            .with_backoff_multiplier(10.0)
            .with_max_delay(Duration::from_millis(2000))
            .with_jitter_factor(0.0);

        assert_eq!(config.delay_for_attempt(5), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(200), Duration::from_millis(2000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000))
            .with_jitter_factor(0.5);

        for attempt in 0..6 {
            let delay = config.delay_for_attempt(attempt);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_retry_config_presets() {
        assert_eq!(RetryConfig::conservative().max_retries, 2);
        assert_eq!(RetryConfig::aggressive().max_retries, 5);
        assert_eq!(RetryConfig::fast().jitter_factor, 0.0);
        assert_eq!(
            RetryConfig::default().retryable_status_codes,
            [429, 500, 502, 503, 504].into_iter().collect()
        );
    }
}
