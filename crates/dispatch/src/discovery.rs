//! Discovery Service - background model listing and availability refresh
//!
//! A periodic scheduler and an explicit refresh call feed a bounded FIFO
//! queue drained by a fixed worker pool. Failed tasks are requeued with a
//! quadratic delay until they run out of retries.

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DiscoveryConfig;
use crate::health::ProviderHealthChecker;
use crate::manager::ModelManager;
use crate::registry::{CanonicalModel, ModelRegistry};
use crate::retry::{execute_with_retry_cancellable, ProviderError};

/// Relative price change below which pricing deltas are not reported
const PRICE_DELTA_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryTaskKind {
    DiscoverModels,
    UpdatePricing,
    CheckAvailability,
    UpdateLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryTask {
    pub id: Uuid,
    pub provider: String,
    pub kind: DiscoveryTaskKind,
    pub priority: TaskPriority,
    pub retry_count: u32,
    pub scheduled_at: DateTime<Utc>,
}

impl DiscoveryTask {
    pub fn new(provider: &str, kind: DiscoveryTaskKind, priority: TaskPriority) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.to_string(),
            kind,
            priority,
            retry_count: 0,
            scheduled_at: Utc::now(),
        }
    }

    pub fn scheduled_in(mut self, delay: Duration) -> Self {
        self.scheduled_at = deadline_after(delay);
        self
    }

    pub fn is_due(&self) -> bool {
        self.scheduled_at <= Utc::now()
    }
}

/// One model as reported by a provider listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredModel {
    pub provider: String,
    pub provider_model_id: String,
    pub display_name: String,
    pub context_length: Option<u32>,
    pub input_per_million: Option<f64>,
    pub output_per_million: Option<f64>,
}

/// Live model-listing endpoint of one provider
#[async_trait]
pub trait ModelLister: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn list_models(&self) -> Result<Vec<DiscoveredModel>, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct OpenRouterListing {
    data: Vec<OpenRouterModel>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterModel {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    context_length: Option<u64>,
    #[serde(default)]
    pricing: Option<OpenRouterPricing>,
}

/// Per-token prices as decimal strings
#[derive(Debug, Deserialize)]
struct OpenRouterPricing {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    completion: Option<String>,
}

fn per_token_to_per_million(raw: Option<&str>) -> Option<f64> {
    let per_token: f64 = raw?.trim().parse().ok()?;
    // Negative prices mark variable-priced routers
    (per_token >= 0.0).then(|| per_token * 1_000_000.0)
}

/// Decode an OpenRouter `/models` response body
pub fn parse_openrouter_models(body: &str) -> anyhow::Result<Vec<DiscoveredModel>> {
    let listing: OpenRouterListing =
        serde_json::from_str(body).context("malformed OpenRouter model listing")?;

    Ok(listing
        .data
        .into_iter()
        .map(|model| {
            let pricing = model.pricing.as_ref();
            DiscoveredModel {
                provider: "openrouter".to_string(),
                display_name: model.name.unwrap_or_else(|| model.id.clone()),
                context_length: model
                    .context_length
                    .map(|len| u32::try_from(len).unwrap_or(u32::MAX)),
                input_per_million: per_token_to_per_million(
                    pricing.and_then(|p| p.prompt.as_deref()),
                ),
                output_per_million: per_token_to_per_million(
                    pricing.and_then(|p| p.completion.as_deref()),
                ),
                provider_model_id: model.id,
            }
        })
        .collect())
}

#[cfg(feature = "live-discovery")]
pub struct OpenRouterLister {
    client: reqwest::Client,
    models_url: String,
}

#[cfg(feature = "live-discovery")]
impl OpenRouterLister {
    pub fn new(base_url: &str, timeout: Duration) -> crate::Result<Self> {
        let path = crate::provider::ProviderProfile::find("openrouter")
            .and_then(|profile| profile.models_path)
            .unwrap_or("/models");
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::DispatchError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            models_url: format!("{}{}", base_url.trim_end_matches('/'), path),
        })
    }
}

#[cfg(feature = "live-discovery")]
#[async_trait]
impl ModelLister for OpenRouterLister {
    fn provider_id(&self) -> &str {
        "openrouter"
    }

    async fn list_models(&self) -> Result<Vec<DiscoveredModel>, ProviderError> {
        debug!("Listing OpenRouter models from {}", self.models_url);
        let response = self
            .client
            .get(&self.models_url)
            .send()
            .await
            .map_err(ProviderError::from_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_response(
                status.as_u16(),
                format!("model listing failed: {}", body),
                headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(ProviderError::from_reqwest_error)?;
        parse_openrouter_models(&body)
            .map_err(|e| ProviderError::new("decode", format!("{:#}", e), false))
    }
}

/// Registry-derived catalog for providers without a live listing path.
///
/// Never reflects upstream changes.
pub fn fallback_catalog(registry: &ModelRegistry, provider: &str) -> Vec<DiscoveredModel> {
    registry
        .by_provider(provider)
        .into_iter()
        .filter_map(|model| {
            model
                .provider_model_id(provider)
                .map(|provider_model_id| DiscoveredModel {
                    provider: provider.to_string(),
                    provider_model_id: provider_model_id.to_string(),
                    display_name: model.display_name.clone(),
                    context_length: Some(model.limits.context_window),
                    input_per_million: Some(model.pricing.input_per_million),
                    output_per_million: Some(model.pricing.output_per_million),
                })
        })
        .collect()
}

/// Extension point for merging discoveries into the registry.
///
/// Discovered models are only logged; nothing is ever mapped.
pub fn map_to_canonical(_discovered: &DiscoveredModel) -> Option<CanonicalModel> {
    None
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub requeued: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DiscoveryStats {
        DiscoveryStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}

struct ProviderListing {
    models: Vec<DiscoveredModel>,
    live: bool,
}

/// State shared by the scheduler, the workers and deferred requeues
struct DiscoveryContext {
    config: DiscoveryConfig,
    registry: Arc<ModelRegistry>,
    manager: Arc<ModelManager>,
    health: Arc<ProviderHealthChecker>,
    listers: RwLock<HashMap<String, Arc<dyn ModelLister>>>,
    counters: StatsCounters,
    sender: mpsc::Sender<DiscoveryTask>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

pub struct DiscoveryService {
    ctx: Arc<DiscoveryContext>,
    receiver: Arc<Mutex<mpsc::Receiver<DiscoveryTask>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for DiscoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryService")
            .field("config", &self.ctx.config)
            .field("stats", &self.ctx.counters.snapshot())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl DiscoveryService {
    /// Build the service; the OpenRouter live lister is registered when available
    pub fn new(
        config: DiscoveryConfig,
        registry: Arc<ModelRegistry>,
        manager: Arc<ModelManager>,
        health: Arc<ProviderHealthChecker>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));

        let service = Self {
            ctx: Arc::new(DiscoveryContext {
                config,
                registry,
                manager,
                health,
                listers: RwLock::new(HashMap::new()),
                counters: StatsCounters::default(),
                sender,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
            receiver: Arc::new(Mutex::new(receiver)),
            started: AtomicBool::new(false),
        };

        #[cfg(feature = "live-discovery")]
        match OpenRouterLister::new(
            &service.ctx.config.openrouter_base_url,
            service.ctx.config.request_timeout,
        ) {
            Ok(lister) => service.register_lister(Arc::new(lister)),
            Err(e) => warn!("OpenRouter live discovery disabled: {}", e),
        }

        service
    }

    /// Add or replace the live lister for a provider
    pub fn register_lister(&self, lister: Arc<dyn ModelLister>) {
        let provider = lister.provider_id().to_string();
        debug!("Registered live model lister for {}", provider);
        self.ctx.listers.write().insert(provider, lister);
    }

    pub fn has_live_lister(&self, provider: &str) -> bool {
        self.ctx.listers.read().contains_key(provider)
    }

    pub fn known_providers(&self) -> Vec<String> {
        self.ctx.known_providers()
    }

    pub fn stats(&self) -> DiscoveryStats {
        self.ctx.counters.snapshot()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Non-blocking enqueue; `false` when the queue is full and the task was dropped
    pub fn enqueue(&self, task: DiscoveryTask) -> bool {
        self.ctx.enqueue(task)
    }

    /// Enqueue high-priority discovery for one provider, or for every known provider
    pub fn refresh_models(&self, provider: Option<&str>) {
        let providers = match provider {
            Some(provider) => vec![provider.to_string()],
            None => self.known_providers(),
        };

        info!("Refreshing models for {} provider(s)", providers.len());
        for provider in providers {
            self.enqueue(DiscoveryTask::new(
                &provider,
                DiscoveryTaskKind::DiscoverModels,
                TaskPriority::High,
            ));
        }
    }

    /// Spawn the scheduler and the worker pool.
    ///
    /// Must be called from within a tokio runtime. Repeated calls are no-ops
    /// and a stopped service cannot be restarted.
    pub fn start(&self) {
        if self.ctx.cancel.is_cancelled() {
            warn!("Discovery service already stopped, ignoring start");
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let ctx = self.ctx.clone();
        ctx.tracker.spawn(run_scheduler(ctx.clone()));
        for worker_id in 0..ctx.config.workers {
            ctx.tracker
                .spawn(run_worker(worker_id, ctx.clone(), self.receiver.clone()));
        }

        info!(
            "🚀 Discovery service started: {} workers, queue capacity {}, interval {:?}",
            ctx.config.workers, ctx.config.queue_capacity, ctx.config.interval
        );
    }

    /// Signal the scheduler and all workers, then wait for them to exit
    pub async fn stop(&self) {
        self.ctx.cancel.cancel();
        self.ctx.tracker.close();
        self.ctx.tracker.wait().await;
        info!("🛑 Discovery service stopped ({:?})", self.stats());
    }
}

impl Drop for DiscoveryService {
    /// Background tasks hold the shared context; cancel them so it is released
    fn drop(&mut self) {
        self.ctx.cancel.cancel();
        self.ctx.tracker.close();
    }
}

impl DiscoveryContext {
    fn known_providers(&self) -> Vec<String> {
        let mut providers: BTreeSet<String> = self.registry.providers().into_iter().collect();
        providers.extend(self.listers.read().keys().cloned());
        providers.into_iter().collect()
    }

    fn enqueue(&self, task: DiscoveryTask) -> bool {
        if self.offer(task) {
            StatsCounters::bump(&self.counters.enqueued);
            true
        } else {
            false
        }
    }

    fn offer(&self, task: DiscoveryTask) -> bool {
        match self.sender.try_send(task) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(task)) => {
                StatsCounters::bump(&self.counters.dropped);
                warn!(
                    "Discovery queue full, dropping {:?} task for {}",
                    task.kind, task.provider
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                StatsCounters::bump(&self.counters.dropped);
                debug!("Discovery queue closed, dropping task {}", task.id);
                false
            }
        }
    }

    fn schedule_round(&self) {
        let providers = self.known_providers();
        debug!("Scheduling discovery round for {} providers", providers.len());

        for provider in providers {
            self.enqueue(DiscoveryTask::new(
                &provider,
                DiscoveryTaskKind::DiscoverModels,
                TaskPriority::Low,
            ));
            self.enqueue(DiscoveryTask::new(
                &provider,
                DiscoveryTaskKind::CheckAvailability,
                TaskPriority::High,
            ));
        }
    }

    /// Put a not-yet-due task back on the queue at its scheduled time
    fn defer(self: &Arc<Self>, mut task: DiscoveryTask) {
        let delay = (task.scheduled_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let ctx = self.clone();

        self.tracker.spawn(async move {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // The timer is authoritative once it fires
                    task.scheduled_at = task.scheduled_at.min(Utc::now());
                    ctx.offer(task);
                }
            }
        });
    }

    async fn execute(self: &Arc<Self>, mut task: DiscoveryTask) {
        debug!(
            "Running {:?} for {} (task {}, retry {})",
            task.kind, task.provider, task.id, task.retry_count
        );

        let error = match self.run_task(&task).await {
            Ok(()) => {
                StatsCounters::bump(&self.counters.succeeded);
                return;
            }
            Err(error) => error,
        };

        if self.cancel.is_cancelled() {
            debug!("Discovery task {} abandoned on shutdown", task.id);
            return;
        }

        if task.retry_count < self.config.max_task_retries {
            task.retry_count += 1;
            let delay = self
                .config
                .retry_delay_unit
                .saturating_mul(task.retry_count.saturating_mul(task.retry_count));
            task.scheduled_at = deadline_after(delay);
            StatsCounters::bump(&self.counters.requeued);
            warn!(
                "Discovery task {:?} for {} failed, requeued in {:?} (retry {}/{}): {:#}",
                task.kind,
                task.provider,
                delay,
                task.retry_count,
                self.config.max_task_retries,
                error
            );
            self.defer(task);
        } else {
            StatsCounters::bump(&self.counters.failed);
            error!(
                "Discovery task {:?} for {} dropped after {} retries: {:#}",
                task.kind, task.provider, task.retry_count, error
            );
        }
    }

    async fn run_task(&self, task: &DiscoveryTask) -> anyhow::Result<()> {
        match task.kind {
            DiscoveryTaskKind::DiscoverModels => self.discover_models(&task.provider).await,
            DiscoveryTaskKind::UpdatePricing => self.update_pricing(&task.provider).await,
            DiscoveryTaskKind::CheckAvailability => self.check_availability(&task.provider).await,
            DiscoveryTaskKind::UpdateLimits => self.update_limits(&task.provider).await,
        }
    }

    async fn list_provider(&self, provider: &str) -> anyhow::Result<ProviderListing> {
        let lister = self.listers.read().get(provider).cloned();
        let Some(lister) = lister else {
            return Ok(ProviderListing {
                models: fallback_catalog(&self.registry, provider),
                live: false,
            });
        };

        let lister: &dyn ModelLister = lister.as_ref();
        let breaker = self.health.breaker(provider);
        let models = breaker
            .execute(|| {
                execute_with_retry_cancellable(
                    &self.config.retry,
                    &self.cancel,
                    || lister.list_models(),
                    None,
                )
            })
            .await
            .with_context(|| format!("listing models for {}", provider))?;

        Ok(ProviderListing { models, live: true })
    }

    /// Registry models of `provider` paired with their listing entry, if any
    fn match_registry<'a>(
        &'a self,
        provider: &str,
        listing: &'a ProviderListing,
    ) -> Vec<(&'a CanonicalModel, Option<&'a DiscoveredModel>)> {
        let by_id: HashMap<&str, &DiscoveredModel> = listing
            .models
            .iter()
            .map(|model| (model.provider_model_id.as_str(), model))
            .collect();

        self.registry
            .by_provider(provider)
            .into_iter()
            .map(|model| {
                let discovered = model
                    .provider_model_id(provider)
                    .and_then(|id| by_id.get(id).copied());
                (model, discovered)
            })
            .collect()
    }

    async fn discover_models(&self, provider: &str) -> anyhow::Result<()> {
        let listing = self.list_provider(provider).await?;
        let known: HashSet<&str> = self
            .registry
            .by_provider(provider)
            .into_iter()
            .filter_map(|model| model.provider_model_id(provider))
            .collect();

        let mut mapped = 0usize;
        for discovered in &listing.models {
            if map_to_canonical(discovered).is_some() {
                mapped += 1;
            } else if !known.contains(discovered.provider_model_id.as_str()) {
                debug!(
                    "Discovered unmapped model {}/{} ({})",
                    provider, discovered.provider_model_id, discovered.display_name
                );
            }
        }

        let in_registry = listing
            .models
            .iter()
            .filter(|m| known.contains(m.provider_model_id.as_str()))
            .count();
        info!(
            "Discovered {} models for {} ({} in registry, {} mapped, live: {})",
            listing.models.len(),
            provider,
            in_registry,
            mapped,
            listing.live
        );
        Ok(())
    }

    async fn update_pricing(&self, provider: &str) -> anyhow::Result<()> {
        let listing = self.list_provider(provider).await?;
        let mut changed = 0usize;

        for (model, discovered) in self.match_registry(provider, &listing) {
            let Some(discovered) = discovered else { continue };
            let deltas = [
                ("input", model.pricing.input_per_million, discovered.input_per_million),
                ("output", model.pricing.output_per_million, discovered.output_per_million),
            ];
            for (side, current, observed) in deltas {
                let Some(observed) = observed else { continue };
                if price_changed(current, observed) {
                    changed += 1;
                    info!(
                        "💲 {} {} price via {}: {:.4} -> {:.4} per million",
                        model.id, side, provider, current, observed
                    );
                }
            }
        }

        debug!("Pricing check for {}: {} deltas", provider, changed);
        Ok(())
    }

    async fn update_limits(&self, provider: &str) -> anyhow::Result<()> {
        let listing = self.list_provider(provider).await?;
        let mut changed = 0usize;

        for (model, discovered) in self.match_registry(provider, &listing) {
            let Some(observed) = discovered.and_then(|d| d.context_length) else {
                continue;
            };
            if observed != model.limits.context_window {
                changed += 1;
                info!(
                    "📏 {} context window via {}: {} -> {}",
                    model.id, provider, model.limits.context_window, observed
                );
            }
        }

        debug!("Limits check for {}: {} deltas", provider, changed);
        Ok(())
    }

    async fn check_availability(&self, provider: &str) -> anyhow::Result<()> {
        let listing = self.list_provider(provider).await?;
        let mut unavailable = 0usize;

        for (model, discovered) in self.match_registry(provider, &listing) {
            let available = !listing.live || discovered.is_some();
            if !available {
                unavailable += 1;
                warn!("Model {} not listed by {}", model.id, provider);
            }
            self.manager
                .set_availability(provider, &model.id, available)
                .await;
        }

        debug!(
            "Availability check for {}: {} unavailable (live: {})",
            provider, unavailable, listing.live
        );
        Ok(())
    }
}

fn price_changed(current: f64, observed: f64) -> bool {
    let scale = current.abs().max(f64::EPSILON);
    (observed - current).abs() / scale > PRICE_DELTA_TOLERANCE
}

/// `now + delay`, saturating at the latest representable time
fn deadline_after(delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

async fn run_scheduler(ctx: Arc<DiscoveryContext>) {
    let period = ctx.config.interval;
    let Some(first_tick) = tokio::time::Instant::now().checked_add(period) else {
        warn!("Discovery interval {:?} out of range, scheduler idle", period);
        ctx.cancel.cancelled().await;
        return;
    };
    let mut ticker = tokio::time::interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => ctx.schedule_round(),
        }
    }
    debug!("Discovery scheduler exited");
}

async fn run_worker(
    worker_id: usize,
    ctx: Arc<DiscoveryContext>,
    receiver: Arc<Mutex<mpsc::Receiver<DiscoveryTask>>>,
) {
    debug!("Discovery worker {} started", worker_id);

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            task = async { receiver.lock().await.recv().await } => task,
        };
        let Some(task) = next else { break };

        if !task.is_due() {
            ctx.defer(task);
            continue;
        }

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = ctx.execute(task) => {}
        }
    }

    debug!("Discovery worker {} exited", worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Capabilities, ModelLimits, Pricing};
    use crate::retry::RetryConfig;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU32;

    fn acme_registry() -> Arc<ModelRegistry> {
        let model = CanonicalModel {
            id: "acme-large".to_string(),
            display_name: "Acme Large".to_string(),
            family: "acme".to_string(),
            capabilities: Capabilities::default(),
            limits: ModelLimits {
                max_output_tokens: 4096,
                context_window: 32_000,
                max_thinking_tokens: None,
                default_temperature: 0.7,
            },
            pricing: Pricing::usd(1.0, 2.0),
            providers: BTreeMap::from([("acme".to_string(), "acme/large-v1".to_string())]),
        };
        Arc::new(ModelRegistry::from_models(vec![model]).expect("valid registry"))
    }

    fn test_config() -> DiscoveryConfig {
        DiscoveryConfig {
            workers: 2,
            queue_capacity: 16,
            max_task_retries: 1,
            retry_delay_unit: Duration::from_millis(10),
            retry: RetryConfig::fast().with_max_retries(0),
            ..DiscoveryConfig::default()
        }
    }

    fn service_with(registry: Arc<ModelRegistry>, config: DiscoveryConfig) -> DiscoveryService {
        let manager = Arc::new(ModelManager::new(registry.clone()));
        DiscoveryService::new(
            config,
            registry,
            manager,
            Arc::new(ProviderHealthChecker::new()),
        )
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    struct StaticLister {
        provider: &'static str,
        models: Vec<DiscoveredModel>,
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl ModelLister for StaticLister {
        fn provider_id(&self) -> &str {
            self.provider
        }

        async fn list_models(&self) -> Result<Vec<DiscoveredModel>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ProviderError::from_status_code(503, "listing unavailable"))
            } else {
                Ok(self.models.clone())
            }
        }
    }

    #[test]
    fn test_parse_openrouter_listing() {
        let body = r#"{"data": [
            {"id": "openai/gpt-4o", "name": "OpenAI: GPT-4o", "context_length": 128000,
             "pricing": {"prompt": "0.0000025", "completion": "0.00001"}},
            {"id": "openrouter/auto", "pricing": {"prompt": "-1", "completion": "-1"}}
        ]}"#;

        let models = parse_openrouter_models(body).expect("valid listing");
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].display_name, "OpenAI: GPT-4o");
        assert_eq!(models[0].context_length, Some(128_000));
        assert!((models[0].input_per_million.unwrap_or_default() - 2.5).abs() < 1e-9);
        assert!((models[0].output_per_million.unwrap_or_default() - 10.0).abs() < 1e-9);
        assert_eq!(models[1].display_name, "openrouter/auto");
        assert_eq!(models[1].input_per_million, None);

        assert!(parse_openrouter_models("{\"models\": []}").is_err());
    }

    #[test]
    fn test_fallback_catalog_and_mapping() {
        let registry = acme_registry();
        let catalog = fallback_catalog(&registry, "acme");
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].provider_model_id, "acme/large-v1");
        assert!(map_to_canonical(&catalog[0]).is_none());
        assert!(fallback_catalog(&registry, "nobody").is_empty());
    }

    #[test]
    fn test_price_change_tolerance() {
        assert!(!price_changed(2.5, 2.5));
        assert!(!price_changed(10.0, 10.05));
        assert!(price_changed(10.0, 12.0));
        assert!(price_changed(0.0, 0.1));
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let config = DiscoveryConfig {
            queue_capacity: 2,
            ..test_config()
        };
        let service = service_with(acme_registry(), config);

        let task = || DiscoveryTask::new("acme", DiscoveryTaskKind::DiscoverModels, TaskPriority::Low);
        assert!(service.enqueue(task()));
        assert!(service.enqueue(task()));
        assert!(!service.enqueue(task()));

        let stats = service.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn test_fallback_availability_marks_models_available() {
        let registry = acme_registry();
        let manager = Arc::new(ModelManager::new(registry.clone()));
        let service = DiscoveryService::new(
            test_config(),
            registry,
            manager.clone(),
            Arc::new(ProviderHealthChecker::new()),
        );

        service.enqueue(DiscoveryTask::new(
            "acme",
            DiscoveryTaskKind::CheckAvailability,
            TaskPriority::High,
        ));
        service.start();
        wait_for(|| service.stats().succeeded == 1).await;
        service.stop().await;

        assert_eq!(manager.is_available("acme", "acme-large").await, Some(true));
    }

    #[tokio::test]
    async fn test_live_listing_marks_missing_models_unavailable() {
        let registry = acme_registry();
        let manager = Arc::new(ModelManager::new(registry.clone()));
        let service = DiscoveryService::new(
            test_config(),
            registry,
            manager.clone(),
            Arc::new(ProviderHealthChecker::new()),
        );
        service.register_lister(Arc::new(StaticLister {
            provider: "acme",
            models: vec![],
            calls: AtomicU32::new(0),
            fail: false,
        }));

        service.enqueue(DiscoveryTask::new(
            "acme",
            DiscoveryTaskKind::CheckAvailability,
            TaskPriority::High,
        ));
        service.start();
        wait_for(|| service.stats().succeeded == 1).await;
        service.stop().await;

        assert_eq!(manager.is_available("acme", "acme-large").await, Some(false));
    }

    #[tokio::test]
    async fn test_failed_task_requeued_then_dropped() {
        let lister = Arc::new(StaticLister {
            provider: "acme",
            models: vec![],
            calls: AtomicU32::new(0),
            fail: true,
        });
        let service = service_with(acme_registry(), test_config());
        service.register_lister(lister.clone());

        service.enqueue(DiscoveryTask::new(
            "acme",
            DiscoveryTaskKind::DiscoverModels,
            TaskPriority::High,
        ));
        service.start();
        wait_for(|| service.stats().failed == 1).await;
        service.stop().await;

        let stats = service.stats();
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.succeeded, 0);
        assert_eq!(lister.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_future_task_waits_until_due() {
        let service = service_with(acme_registry(), test_config());
        service.enqueue(
            DiscoveryTask::new("acme", DiscoveryTaskKind::UpdateLimits, TaskPriority::Normal)
                .scheduled_in(Duration::from_millis(50)),
        );
        service.start();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(service.stats().succeeded, 0);

        wait_for(|| service.stats().succeeded == 1).await;
        service.stop().await;
    }

    #[tokio::test]
    async fn test_stop_joins_idle_workers() {
        let service = service_with(acme_registry(), test_config());
        service.start();
        service.start();
        assert!(service.is_started());

        tokio::time::timeout(Duration::from_secs(2), service.stop())
            .await
            .expect("stop completes");
        assert_eq!(service.stats(), DiscoveryStats::default());
    }

    /// Always-failing lister that records when it was called
    struct OutageLister {
        calls: parking_lot::Mutex<Vec<tokio::time::Instant>>,
    }

    #[async_trait]
    impl ModelLister for OutageLister {
        fn provider_id(&self) -> &str {
            "acme"
        }

        async fn list_models(&self) -> Result<Vec<DiscoveredModel>, ProviderError> {
            self.calls.lock().push(tokio::time::Instant::now());
            Err(ProviderError::from_status_code(503, "listing unavailable"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_delays_grow_quadratically_until_dropped() {
        let config = DiscoveryConfig {
            retry: RetryConfig::fast().with_max_retries(0),
            ..DiscoveryConfig::default()
        };
        assert_eq!(config.max_task_retries, 3);
        let unit = config.retry_delay_unit;
        assert_eq!(unit, Duration::from_secs(60));

        let lister = Arc::new(OutageLister {
            calls: parking_lot::Mutex::new(Vec::new()),
        });
        let service = service_with(acme_registry(), config);
        service.register_lister(lister.clone());
        service.enqueue(DiscoveryTask::new(
            "acme",
            DiscoveryTaskKind::UpdatePricing,
            TaskPriority::Normal,
        ));
        service.start();

        // 1 + 4 + 9 units, well before the first scheduler tick
        tokio::time::sleep(unit * 15).await;

        let calls = lister.calls.lock().clone();
        assert_eq!(calls.len(), 4);
        for (retry, pair) in calls.windows(2).enumerate() {
            let n = retry as u32 + 1;
            let gap = pair[1] - pair[0];
            let expected = unit * n * n;
            assert!(
                gap + Duration::from_secs(1) >= expected && gap <= expected + Duration::from_secs(1),
                "requeue {} waited {:?}, expected {:?}",
                n,
                gap,
                expected
            );
        }

        let stats = service.stats();
        assert_eq!(stats.requeued, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 0);

        tokio::time::sleep(unit * 30).await;
        assert_eq!(lister.calls.lock().len(), 4);
        service.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_tick_enqueues_round_per_provider() {
        let config = DiscoveryConfig {
            workers: 0,
            ..DiscoveryConfig::default()
        };
        let interval = config.interval;
        let service = service_with(acme_registry(), config);
        let providers = service.known_providers();
        service.start();

        tokio::time::sleep(interval - Duration::from_secs(1)).await;
        assert_eq!(service.stats().enqueued, 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(service.stats().enqueued, 2 * providers.len() as u64);

        let mut queued = Vec::new();
        {
            let mut receiver = service.receiver.lock().await;
            while let Ok(task) = receiver.try_recv() {
                queued.push((task.provider, task.kind, task.priority, task.retry_count));
            }
        }
        let expected: Vec<_> = providers
            .iter()
            .flat_map(|provider| {
                [
                    (provider.clone(), DiscoveryTaskKind::DiscoverModels, TaskPriority::Low, 0),
                    (provider.clone(), DiscoveryTaskKind::CheckAvailability, TaskPriority::High, 0),
                ]
            })
            .collect();
        assert_eq!(queued, expected);

        tokio::time::sleep(interval).await;
        assert_eq!(service.stats().enqueued, 4 * providers.len() as u64);
        service.stop().await;
    }

    #[test]
    fn test_far_future_schedule_saturates() {
        let task = DiscoveryTask::new("acme", DiscoveryTaskKind::UpdateLimits, TaskPriority::Low)
            .scheduled_in(Duration::MAX);
        assert_eq!(task.scheduled_at, DateTime::<Utc>::MAX_UTC);
        assert!(!task.is_due());

        let soon = DiscoveryTask::new("acme", DiscoveryTaskKind::UpdateLimits, TaskPriority::Low)
            .scheduled_in(Duration::from_secs(60));
        assert!(soon.scheduled_at < DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn test_drop_cancels_background_tasks() {
        let registry = acme_registry();
        let manager = Arc::new(ModelManager::new(registry.clone()));
        let service = DiscoveryService::new(
            test_config(),
            registry,
            manager.clone(),
            Arc::new(ProviderHealthChecker::new()),
        );
        service.enqueue(
            DiscoveryTask::new("acme", DiscoveryTaskKind::DiscoverModels, TaskPriority::Low)
                .scheduled_in(Duration::from_secs(3600)),
        );
        service.start();
        let tracker = service.ctx.tracker.clone();
        tokio::task::yield_now().await;

        drop(service);

        tokio::time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .expect("tasks exit after drop");
        assert_eq!(Arc::strong_count(&manager), 1);
    }

    #[tokio::test]
    async fn test_known_providers_include_listers() {
        let service = service_with(acme_registry(), test_config());
        let providers = service.known_providers();
        assert!(providers.contains(&"acme".to_string()));
        #[cfg(feature = "live-discovery")]
        assert!(providers.contains(&"openrouter".to_string()));
    }
}
