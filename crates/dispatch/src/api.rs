//! Single entry point wiring registry, manager, selector, health checker and discovery

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::config::DispatchConfig;
use crate::discovery::DiscoveryService;
use crate::error::Result;
use crate::health::{HealthSnapshot, ProviderHealthChecker};
use crate::manager::{ModelManager, UserPreferences};
use crate::provider::{ChunkStream, ProviderClient, ProviderRequest};
use crate::registry::ModelRegistry;
use crate::retry::{self, OnRetry, RetryConfig, RetryableError};
use crate::selector::{
    ModelComparison, ModelSelector, QuickSelectOptions, SelectionRequest, SelectionResponse,
};

#[derive(Debug)]
pub struct ModelApi {
    config: DispatchConfig,
    registry: Arc<ModelRegistry>,
    manager: Arc<ModelManager>,
    selector: ModelSelector,
    health: Arc<ProviderHealthChecker>,
    /// Present only when `config.discovery.enabled`
    discovery: Option<DiscoveryService>,
}

impl ModelApi {
    pub fn new(config: DispatchConfig, registry: Arc<ModelRegistry>) -> Self {
        Self::build(config, registry, None)
    }

    /// Built-in catalog with default configuration; discovery stays off
    pub fn builtin() -> Self {
        Self::new(DispatchConfig::default(), Arc::new(ModelRegistry::builtin()))
    }

    /// Built-in catalog configured from `DISPATCH_*` variables
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(
            DispatchConfig::from_env()?,
            Arc::new(ModelRegistry::builtin()),
        ))
    }

    /// Same as `new` with performance entries written through to `store`
    pub fn with_store(
        config: DispatchConfig,
        registry: Arc<ModelRegistry>,
        store: Arc<dyn CacheStore>,
    ) -> Self {
        Self::build(config, registry, Some(store))
    }

    fn build(
        config: DispatchConfig,
        registry: Arc<ModelRegistry>,
        store: Option<Arc<dyn CacheStore>>,
    ) -> Self {
        let mut manager = ModelManager::with_cache_ttl(registry.clone(), config.cache_ttl);
        if let Some(store) = store {
            manager = manager.with_store(store);
        }
        let manager = Arc::new(manager);

        let health = Arc::new(ProviderHealthChecker::with_config(
            config.breaker.clone(),
            config.retry.clone(),
        ));
        let discovery = config.discovery.enabled.then(|| {
            DiscoveryService::new(
                config.discovery.clone(),
                registry.clone(),
                manager.clone(),
                health.clone(),
            )
        });

        info!(
            "Model API ready: {} models across {} providers (discovery: {})",
            registry.len(),
            registry.providers().len(),
            discovery.is_some()
        );

        Self {
            selector: ModelSelector::new(manager.clone()),
            config,
            registry,
            manager,
            health,
            discovery,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<ModelManager> {
        &self.manager
    }

    pub fn selector(&self) -> &ModelSelector {
        &self.selector
    }

    pub fn health(&self) -> &Arc<ProviderHealthChecker> {
        &self.health
    }

    pub fn discovery(&self) -> Option<&DiscoveryService> {
        self.discovery.as_ref()
    }

    // ---- selection ----

    pub async fn select_model(&self, request: &SelectionRequest) -> Result<SelectionResponse> {
        self.selector.select_model(request).await
    }

    pub async fn get_quick_select_options(
        &self,
        request: &SelectionRequest,
    ) -> Result<QuickSelectOptions> {
        self.selector.get_quick_select_options(request).await
    }

    pub async fn compare_models(
        &self,
        model_ids: &[String],
        request: &SelectionRequest,
    ) -> Result<Vec<ModelComparison>> {
        self.selector.compare_models(model_ids, request).await
    }

    // ---- preferences ----

    pub async fn add_favorite(&self, model_id: &str) -> Result<()> {
        self.manager.add_favorite(model_id).await
    }

    pub async fn remove_favorite(&self, model_id: &str) {
        self.manager.remove_favorite(model_id).await
    }

    pub async fn update_preferences(&self, preferences: UserPreferences) {
        self.manager.update_preferences(preferences).await
    }

    pub async fn get_preferences(&self) -> UserPreferences {
        self.manager.get_preferences().await
    }

    // ---- discovery ----

    /// Fire-and-forget; tasks run once discovery is started
    pub fn refresh_models(&self, provider: Option<&str>) {
        match &self.discovery {
            Some(discovery) => discovery.refresh_models(provider),
            None => debug!("Discovery disabled, ignoring refresh of {:?}", provider),
        }
    }

    /// Start background discovery and queue an initial refresh of every provider
    pub fn start_discovery(&self) {
        let Some(discovery) = &self.discovery else {
            warn!("Discovery disabled in configuration, not starting");
            return;
        };
        discovery.start();
        discovery.refresh_models(None);
    }

    /// Stop discovery and wait for its workers
    pub async fn shutdown(&self) {
        if let Some(discovery) = &self.discovery {
            discovery.stop().await;
        }
    }

    // ---- execution ----

    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        operation: F,
        config: &RetryConfig,
        on_retry: Option<OnRetry<'_>>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: RetryableError,
    {
        retry::execute_with_retry(config, operation, on_retry).await
    }

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
        self.health
            .execute_with_health_check(provider, operation, on_retry)
            .await
    }

    pub async fn invoke_provider(
        &self,
        client: &dyn ProviderClient,
        request: &ProviderRequest,
    ) -> Result<ChunkStream> {
        self.health.invoke_provider(client, request).await
    }

    pub fn get_provider_health(&self, provider: &str) -> HealthSnapshot {
        self.health.get_provider_health(provider)
    }
}
