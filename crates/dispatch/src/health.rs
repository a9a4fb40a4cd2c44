//! Provider Health Checker - one circuit breaker and retry policy per provider

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::Result;
use crate::provider::{ChunkStream, ProviderClient, ProviderRequest};
use crate::retry::{execute_with_retry_cancellable, OnRetry, RetryConfig, RetryableError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Recovering,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub provider: String,
    pub status: HealthStatus,
    pub circuit_state: Option<CircuitState>,
    pub failure_count: u32,
    pub last_failure: Option<chrono::DateTime<chrono::Utc>>,
}

impl HealthSnapshot {
    fn unknown(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            status: HealthStatus::Unknown,
            circuit_state: None,
            failure_count: 0,
            last_failure: None,
        }
    }

    fn from_breaker(breaker: &CircuitBreaker) -> Self {
        let snapshot = breaker.snapshot();
        let status = match snapshot.state {
            CircuitState::Closed => HealthStatus::Healthy,
            CircuitState::HalfOpen => HealthStatus::Recovering,
            CircuitState::Open => HealthStatus::Unhealthy,
        };
        Self {
            provider: breaker.name().to_string(),
            status,
            circuit_state: Some(snapshot.state),
            failure_count: snapshot.failure_count,
            last_failure: snapshot.last_failure,
        }
    }
}

/// Fault-tolerant call path keyed by provider name.
///
/// Breakers and retry configs are created lazily on first use.
#[derive(Debug)]
pub struct ProviderHealthChecker {
    breaker_config: CircuitBreakerConfig,
    default_retry: RetryConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    retry_configs: RwLock<HashMap<String, RetryConfig>>,
}

impl Default for ProviderHealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderHealthChecker {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default(), RetryConfig::default())
    }

    pub fn with_config(breaker_config: CircuitBreakerConfig, default_retry: RetryConfig) -> Self {
        Self {
            breaker_config,
            default_retry,
            breakers: RwLock::new(HashMap::new()),
            retry_configs: RwLock::new(HashMap::new()),
        }
    }

    pub fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(provider) {
            return breaker.clone();
        }

        self.breakers
            .write()
            .entry(provider.to_string())
            .or_insert_with(|| {
                debug!("Creating circuit breaker for provider {}", provider);
                Arc::new(CircuitBreaker::new(provider, self.breaker_config.clone()))
            })
            .clone()
    }

    pub fn retry_config(&self, provider: &str) -> RetryConfig {
        if let Some(config) = self.retry_configs.read().get(provider) {
            return config.clone();
        }

        self.retry_configs
            .write()
            .entry(provider.to_string())
            .or_insert_with(|| self.default_retry.clone())
            .clone()
    }

    /// Per-provider retry override
    pub fn set_retry_config(&self, provider: &str, config: RetryConfig) {
        self.retry_configs.write().insert(provider.to_string(), config);
    }

    /// Run `operation` with retry inside the provider's circuit breaker.
    ///
    /// An open circuit fails fast without consuming any retry budget.
    pub async fn execute_with_health_check<F, Fut, T, E>(
        &self,
        provider: &str,
        operation: F,
        on_retry: Option<OnRetry<'_>>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: RetryableError,
    {
        self.execute_with_health_check_cancellable(
            provider,
            &CancellationToken::new(),
            operation,
            on_retry,
        )
        .await
    }

    pub async fn execute_with_health_check_cancellable<F, Fut, T, E>(
        &self,
        provider: &str,
        cancel: &CancellationToken,
        operation: F,
        on_retry: Option<OnRetry<'_>>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: RetryableError,
    {
        let breaker = self.breaker(provider);
        let config = self.retry_config(provider);

        breaker
            .execute(|| execute_with_retry_cancellable(&config, cancel, operation, on_retry))
            .await
    }

    /// Wrapped inference call through a provider client
    pub async fn invoke_provider(
        &self,
        client: &dyn ProviderClient,
        request: &ProviderRequest,
    ) -> Result<ChunkStream> {
        self.execute_with_health_check(
            client.provider_id(),
            || client.invoke(request.clone()),
            None,
        )
        .await
    }

    pub fn get_provider_health(&self, provider: &str) -> HealthSnapshot {
        match self.breakers.read().get(provider) {
            Some(breaker) => HealthSnapshot::from_breaker(breaker),
            None => HealthSnapshot::unknown(provider),
        }
    }

    pub fn all_provider_health(&self) -> Vec<HealthSnapshot> {
        let mut snapshots: Vec<HealthSnapshot> = self
            .breakers
            .read()
            .values()
            .map(|breaker| HealthSnapshot::from_breaker(breaker))
            .collect();
        snapshots.sort_by(|a, b| a.provider.cmp(&b.provider));
        snapshots
    }

    /// Force a provider's circuit closed
    pub fn reset_provider(&self, provider: &str) {
        if let Some(breaker) = self.breakers.read().get(provider) {
            breaker.reset();
            info!("Provider {} health reset", provider);
        }
    }
}
