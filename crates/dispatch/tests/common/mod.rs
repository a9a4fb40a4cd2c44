//! Shared helpers for the integration suites

#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use llm_dispatch::retry::{ProviderError, RetryConfig};

pub const SHORT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub type BoxedAttempt<T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send>>;

/// Retry config with millisecond delays and no jitter
pub fn quick_retry(max_retries: u32) -> RetryConfig {
    RetryConfig::fast()
        .with_max_retries(max_retries)
        .with_base_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(20))
}

/// Operation failing with `status` for the first `fail_until` calls, then yielding `value`
pub fn eventually_successful<T: Clone + Send + 'static>(
    counter: Arc<AtomicU32>,
    fail_until: u32,
    status: u16,
    value: T,
) -> impl FnMut() -> BoxedAttempt<T> {
    move || {
        let counter = counter.clone();
        let value = value.clone();
        Box::pin(async move {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= fail_until {
                Err(ProviderError::from_status_code(status, format!("failure #{}", call)))
            } else {
                Ok(value)
            }
        })
    }
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + SHORT_TEST_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {:?}",
            SHORT_TEST_TIMEOUT
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
