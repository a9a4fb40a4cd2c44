use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{DispatchError, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,   // Normal operation
    Open,     // Failing, rejecting requests
    HalfOpen, // Testing if service recovered
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub max_failures: u32,
    /// Time since the last failure before a trial call is let through
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Per-provider failure tracker.
///
/// All counters live behind one lock; the lock is never held across the
/// guarded operation's await point.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure: Option<chrono::DateTime<chrono::Utc>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                last_failure_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` unless the circuit is open.
    ///
    /// Caller cancellation and observer aborts are not counted as provider failures.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.try_acquire()?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                if !error.is_caller_abort() {
                    self.record_failure();
                }
                Err(error)
            }
        }
    }

    /// Admission check; moves Open -> HalfOpen once the reset timeout elapsed
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let elapsed = inner
            .last_failure
            .map(|at| at.elapsed())
            .unwrap_or(self.config.reset_timeout);
        if elapsed >= self.config.reset_timeout {
            info!("🔄 Circuit breaker {} moving to HALF_OPEN state", self.name);
            inner.state = CircuitState::HalfOpen;
            Ok(())
        } else {
            debug!("⭕ Circuit breaker {} OPEN - blocking request", self.name);
            Err(DispatchError::CircuitOpen {
                provider: self.name.clone(),
                retry_in: self.config.reset_timeout.saturating_sub(elapsed),
            })
        }
    }

    /// Record successful request
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                info!("✅ Circuit breaker {} - recovery successful, moving to CLOSED", self.name);
                inner.state = CircuitState::Closed;
            }
            CircuitState::Open => {
                warn!("⚠️ Circuit breaker {} - success recorded in OPEN state", self.name);
            }
            CircuitState::Closed => {
                if inner.failure_count > 0 {
                    debug!(
                        "✅ Circuit breaker {} - resetting failure count from {}",
                        self.name, inner.failure_count
                    );
                }
            }
        }
        if inner.state == CircuitState::Closed {
            inner.failure_count = 0;
        }
    }

    /// Record failed request
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(chrono::Utc::now());

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                if inner.failure_count >= self.config.max_failures {
                    warn!(
                        "🚨 Circuit breaker {} OPENING - {} consecutive failures",
                        self.name, inner.failure_count
                    );
                    inner.state = CircuitState::Open;
                } else {
                    debug!(
                        "❌ Circuit breaker {} - failure {}/{}",
                        self.name, inner.failure_count, self.config.max_failures
                    );
                }
            }
            CircuitState::Open => {
                debug!("❌ Circuit breaker {} - additional failure in OPEN state", self.name);
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn last_failure(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.inner.lock().last_failure_at
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure: inner.last_failure_at,
        }
    }

    /// Force the breaker back to Closed
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.last_failure_at = None;
        info!("Circuit breaker {} reset", self.name);
    }

    /// Get current state info
    pub fn state_info(&self) -> String {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => format!("CLOSED (failures: {})", inner.failure_count),
            CircuitState::Open => match inner.last_failure {
                Some(last_failure) => {
                    let remaining = self.config.reset_timeout.saturating_sub(last_failure.elapsed());
                    format!("OPEN (recovery in: {:?})", remaining)
                }
                None => "OPEN".to_string(),
            },
            CircuitState::HalfOpen => format!("HALF_OPEN (failures: {})", inner.failure_count),
        }
    }
}
