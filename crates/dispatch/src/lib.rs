//! Resilient model dispatch: canonical model registry, recommendation and
//! selection, background discovery, and retry/circuit-breaker execution for
//! outbound provider calls.

pub mod api;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod discovery;
pub mod error;
pub mod health;
pub mod logging;
pub mod manager;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod selector;

pub use api::ModelApi;
pub use cache::{CacheStore, InMemoryCacheStore, PerformanceData};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{DiscoveryConfig, DispatchConfig};
pub use discovery::{DiscoveryService, DiscoveryTask, DiscoveryTaskKind, ModelLister, TaskPriority};
pub use error::{DispatchError, Result};
pub use health::{HealthSnapshot, HealthStatus, ProviderHealthChecker};
pub use logging::{init_logging, LoggingConfig};
pub use manager::{
    ModelManager, ModelRecommendation, SelectionCriteria, SpeedPreference, TaskType,
    UserPreferences,
};
pub use provider::{ChunkStream, OutputChunk, ProviderClient, ProviderRequest};
pub use registry::{CanonicalModel, ModelRegistry};
pub use retry::{execute_with_retry, ProviderError, RetryConfig, RetryableError};
pub use selector::{ModelSelector, SelectionRequest, SelectionResponse};
