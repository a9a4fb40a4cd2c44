//! End-to-end use of the `ModelApi` facade

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use llm_dispatch::{
    CacheStore, ChunkStream, DispatchConfig, DispatchError, HealthStatus, InMemoryCacheStore,
    ModelApi, ModelRegistry, OutputChunk, PerformanceData, ProviderClient, ProviderError,
    ProviderRequest, SelectionCriteria, SelectionRequest, TaskType, UserPreferences,
};

use common::{eventually_successful, quick_retry, wait_until};

fn test_config() -> DispatchConfig {
    let mut config = DispatchConfig::default();
    config.retry = quick_retry(2);
    config.breaker.max_failures = 2;
    config
}

fn discovery_config(server: &mockito::Server) -> DispatchConfig {
    let mut config = test_config();
    config.discovery.enabled = true;
    config.discovery.openrouter_base_url = server.url();
    config.discovery.request_timeout = Duration::from_secs(5);
    config
}

/// Client that fails `failures` times before streaming a fixed reply
struct FlakyClient {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl ProviderClient for FlakyClient {
    fn provider_id(&self) -> &str {
        "groq"
    }

    async fn invoke(&self, request: ProviderRequest) -> Result<ChunkStream, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(ProviderError::from_response(
                503,
                "overloaded",
                [("x-ratelimit-reset-requests", "5ms")],
            ));
        }
        let reply = format!("{} says hi", request.model);
        let chunks = vec![Ok(OutputChunk::text(reply)), Ok(OutputChunk::text("!"))];
        Ok(futures::stream::iter(chunks).boxed())
    }
}

#[tokio::test]
async fn test_selection_surface() {
    let api = ModelApi::new(test_config(), Arc::new(ModelRegistry::builtin()));

    let response = api
        .select_model(&SelectionRequest::new(TaskType::Reasoning).with_features(["reasoning"]))
        .await
        .expect("reasoning models exist");
    assert!(response.recommendation.model.capabilities.reasoning);

    let options = api
        .get_quick_select_options(&SelectionRequest::new(TaskType::Chat))
        .await
        .expect("options");
    assert!(options.recommended.is_some());

    let ids = vec!["gemini-2.5-pro".to_string(), "grok-3".to_string()];
    let ranked = api
        .compare_models(&ids, &SelectionRequest::new(TaskType::General))
        .await
        .expect("known models");
    assert_eq!(ranked.len(), 2);
}

#[tokio::test]
async fn test_preferences_round_trip() {
    let api = ModelApi::builtin();
    let preferences = UserPreferences {
        default_model: Some("claude-sonnet-4".to_string()),
        preferred_providers: vec!["bedrock".to_string()],
        max_cost: Some(5.0),
        ..UserPreferences::default()
    };

    api.update_preferences(preferences.clone()).await;
    assert_eq!(api.get_preferences().await, preferences);

    let response = api
        .select_model(&SelectionRequest::new(TaskType::General).with_features(["vision"]))
        .await
        .expect("vision models under the preference ceiling");
    assert!(response.recommendation.model.pricing.input_per_million <= 5.0);

    api.add_favorite("claude-sonnet-4").await.expect("known model");
    assert!(matches!(
        api.add_favorite("claude-9").await,
        Err(DispatchError::NotFound(_))
    ));
    api.remove_favorite("claude-sonnet-4").await;
    assert!(api.manager().favorites().await.is_empty());
}

#[tokio::test]
async fn test_execute_with_retry_uses_given_config() {
    let api = ModelApi::builtin();
    let counter = Arc::new(AtomicU32::new(0));

    let value = api
        .execute_with_retry(eventually_successful(counter.clone(), 2, 503, 5u8), &quick_retry(3), None)
        .await
        .expect("recovers");

    assert_eq!(value, 5);
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_invoke_provider_retries_then_streams() {
    let api = ModelApi::new(test_config(), Arc::new(ModelRegistry::builtin()));
    let client = FlakyClient {
        failures: 2,
        calls: AtomicU32::new(0),
    };
    assert_eq!(api.get_provider_health("groq").status, HealthStatus::Unknown);

    let stream = api
        .invoke_provider(&client, &ProviderRequest::new("llama-3.1-8b-instant", "hello"))
        .await
        .expect("third attempt streams");
    let text: String = stream
        .map(|chunk| chunk.map(|c| c.content).unwrap_or_default())
        .collect::<Vec<_>>()
        .await
        .concat();

    assert_eq!(text, "llama-3.1-8b-instant says hi!");
    assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    assert_eq!(api.get_provider_health("groq").status, HealthStatus::Healthy);
}

#[tokio::test]
async fn test_health_checked_failures_open_circuit() {
    let api = ModelApi::new(test_config(), Arc::new(ModelRegistry::builtin()));
    let client = FlakyClient {
        failures: u32::MAX,
        calls: AtomicU32::new(0),
    };
    let request = ProviderRequest::new("llama-3.3-70b-versatile", "hello");

    for _ in 0..2 {
        let err = api
            .invoke_provider(&client, &request)
            .await
            .err()
            .expect("always overloaded");
        assert_eq!(err.attempts(), Some(3));
    }
    assert_eq!(client.calls.load(Ordering::SeqCst), 6);

    let err = api
        .execute_with_health_check("groq", || async { Ok::<_, ProviderError>(()) }, None)
        .await
        .expect_err("circuit open");
    assert!(err.is_circuit_open());
    assert_eq!(api.get_provider_health("groq").status, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn test_performance_store_is_shared_across_instances() {
    let store: Arc<dyn CacheStore> = Arc::new(InMemoryCacheStore::new());
    let registry = Arc::new(ModelRegistry::builtin());
    let criteria = SelectionCriteria::new(TaskType::General).with_provider("xai");

    let writer = ModelApi::with_store(test_config(), registry.clone(), store.clone());
    let baseline = writer
        .manager()
        .get_recommendation(&criteria)
        .await
        .expect("grok is available");
    writer
        .manager()
        .record_performance("grok-3", PerformanceData::new(8.0, 9.0, 6.0))
        .await;
    assert!(store.get("perf:grok-3").await.is_some());

    let reader = ModelApi::with_store(test_config(), registry, store);
    let warmed = reader
        .manager()
        .get_recommendation(&criteria)
        .await
        .expect("grok is available");
    assert!(warmed.confidence > baseline.confidence);
}

#[tokio::test]
async fn test_discovery_lifecycle() {
    let mut server = mockito::Server::new_async().await;
    let _listing = server
        .mock("GET", "/models")
        .with_status(200)
        .with_body(r#"{"data": [{"id": "openai/gpt-4o"}]}"#)
        .create_async()
        .await;

    let api = ModelApi::new(discovery_config(&server), Arc::new(ModelRegistry::builtin()));
    let discovery = api.discovery().expect("discovery enabled");

    api.start_discovery();
    let providers = discovery.known_providers().len() as u64;
    wait_until(|| discovery.stats().succeeded >= providers).await;

    tokio::time::timeout(Duration::from_secs(5), api.shutdown())
        .await
        .expect("shutdown joins workers");
    assert_eq!(discovery.stats().failed, 0);
}

#[tokio::test]
async fn test_dropping_api_releases_discovery_tasks() {
    let mut server = mockito::Server::new_async().await;
    let _listing = server
        .mock("GET", "/models")
        .with_status(200)
        .with_body(r#"{"data": []}"#)
        .create_async()
        .await;

    let api = ModelApi::new(discovery_config(&server), Arc::new(ModelRegistry::builtin()));
    api.start_discovery();
    let manager = api.manager().clone();
    let health = api.health().clone();
    assert!(Arc::strong_count(&manager) > 1);

    drop(api);

    wait_until(|| Arc::strong_count(&manager) == 1 && Arc::strong_count(&health) == 1).await;
}

#[tokio::test]
async fn test_oversized_ttl_does_not_panic_store_writes() {
    let store: Arc<dyn CacheStore> = Arc::new(InMemoryCacheStore::new());
    let mut config = test_config();
    config.cache_ttl = Duration::from_secs(u64::MAX);
    assert!(config.validate().is_err());

    let api = ModelApi::with_store(config, Arc::new(ModelRegistry::builtin()), store.clone());
    api.manager()
        .record_performance("gpt-4o", PerformanceData::new(7.0, 8.0, 6.0))
        .await;

    assert!(store.get("perf:gpt-4o").await.is_some());
}
