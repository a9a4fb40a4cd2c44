//! Model Manager - preferences, favorites and recommendation scoring
//!
//! Preferences/favorites and the performance cache are guarded by two
//! independent locks. Scoring never holds both at once: it copies what it
//! needs from one, releases it, then reads the other.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::{CacheSnapshot, CacheStore, ModelCache, PerformanceData};
use crate::error::{DispatchError, Result};
use crate::registry::{CanonicalModel, ModelRegistry};

/// Families with a long track record, which raise recommendation confidence
pub const WELL_KNOWN_FAMILIES: &[&str] = &["gpt", "claude", "gemini", "llama", "mistral"];

/// Price ceiling assumed by the cost-efficiency term when none is given
pub const DEFAULT_COST_REFERENCE: f64 = 100.0;

const MAX_FALLBACKS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    General,
    Chat,
    Code,
    Reasoning,
    Vision,
    Summarization,
    Creative,
}

impl TaskType {
    /// Lenient parse of a task tag; unknown tags map to `General`
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "chat" | "conversation" => TaskType::Chat,
            "code" | "coding" | "programming" => TaskType::Code,
            "reasoning" | "analysis" | "math" => TaskType::Reasoning,
            "vision" | "image" => TaskType::Vision,
            "summarization" | "summary" | "summarize" => TaskType::Summarization,
            "creative" | "writing" => TaskType::Creative,
            _ => TaskType::General,
        }
    }

    /// Whether the model has the capability this task type calls for
    fn matches(&self, model: &CanonicalModel) -> bool {
        match self {
            TaskType::Code => model.capabilities.code,
            TaskType::Reasoning => model.capabilities.reasoning,
            TaskType::Vision => model.capabilities.vision,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedPreference {
    Fast,
    #[default]
    Balanced,
    Quality,
}

/// Task-derived constraints used to filter and score candidates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionCriteria {
    pub task_type: TaskType,
    pub required_features: Vec<String>,
    /// Ceiling on input price per million tokens
    pub max_cost: Option<f64>,
    /// Minimum cached quality (0-10); models without data are not filtered
    pub min_quality: Option<f64>,
    pub speed: SpeedPreference,
    pub required_context: Option<u32>,
    pub provider: Option<String>,
}

impl SelectionCriteria {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            ..Default::default()
        }
    }

    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_features = features.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost = Some(max_cost);
        self
    }

    pub fn with_min_quality(mut self, min_quality: f64) -> Self {
        self.min_quality = Some(min_quality);
        self
    }

    pub fn with_speed(mut self, speed: SpeedPreference) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_required_context(mut self, tokens: u32) -> Self {
        self.required_context = Some(tokens);
        self
    }

    pub fn with_provider(mut self, provider: &str) -> Self {
        self.provider = Some(provider.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub default_model: Option<String>,
    /// Earlier entries are stronger preferences
    pub preferred_providers: Vec<String>,
    pub max_cost: Option<f64>,
    pub excluded_models: BTreeSet<String>,
    pub auto_select: bool,
    pub enable_fallback: bool,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            default_model: None,
            preferred_providers: Vec::new(),
            max_cost: None,
            excluded_models: BTreeSet::new(),
            auto_select: true,
            enable_fallback: true,
        }
    }
}

/// Scored, ranked model + provider choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecommendation {
    pub model: CanonicalModel,
    pub provider: String,
    pub provider_model_id: String,
    /// 0-100
    pub score: f64,
    /// 0-1
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub fallbacks: Vec<ModelRecommendation>,
}

#[derive(Debug, Default)]
struct PreferenceState {
    preferences: UserPreferences,
    favorites: BTreeSet<String>,
}

/// Copy of preference state taken under the read lock
#[derive(Debug, Clone)]
pub(crate) struct ScoringContext {
    preferences: UserPreferences,
    favorites: BTreeSet<String>,
    performance: HashMap<String, PerformanceData>,
}

pub struct ModelManager {
    registry: Arc<ModelRegistry>,
    state: RwLock<PreferenceState>,
    cache: RwLock<ModelCache>,
    store: Option<Arc<dyn CacheStore>>,
    cache_ttl: Duration,
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("models", &self.registry.len())
            .field("cache_ttl", &self.cache_ttl)
            .field("external_store", &self.store.is_some())
            .finish()
    }
}

impl ModelManager {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self::with_cache_ttl(registry, Duration::from_secs(3600))
    }

    pub fn with_cache_ttl(registry: Arc<ModelRegistry>, cache_ttl: Duration) -> Self {
        Self {
            registry,
            state: RwLock::new(PreferenceState::default()),
            cache: RwLock::new(ModelCache::new(cache_ttl)),
            store: None,
            cache_ttl,
        }
    }

    /// Write performance entries through to an external store
    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn list_models(&self) -> Vec<CanonicalModel> {
        self.registry.all().to_vec()
    }

    pub fn get_model(&self, id: &str) -> Result<CanonicalModel> {
        self.registry
            .get(id)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound(id.to_string()))
    }

    // ---- preferences & favorites ----

    pub async fn get_preferences(&self) -> UserPreferences {
        self.state.read().await.preferences.clone()
    }

    /// Replace the preference record wholesale
    pub async fn update_preferences(&self, preferences: UserPreferences) {
        if let Some(default_model) = &preferences.default_model {
            if !self.registry.contains(default_model) {
                warn!("Default model {} is not in the registry", default_model);
            }
        }
        self.state.write().await.preferences = preferences;
        info!("User preferences updated");
    }

    pub async fn add_favorite(&self, model_id: &str) -> Result<()> {
        if !self.registry.contains(model_id) {
            return Err(DispatchError::NotFound(model_id.to_string()));
        }
        if self.state.write().await.favorites.insert(model_id.to_string()) {
            debug!("Added favorite model {}", model_id);
        }
        Ok(())
    }

    pub async fn remove_favorite(&self, model_id: &str) {
        if self.state.write().await.favorites.remove(model_id) {
            debug!("Removed favorite model {}", model_id);
        }
    }

    pub async fn favorites(&self) -> Vec<String> {
        self.state.read().await.favorites.iter().cloned().collect()
    }

    pub async fn is_favorite(&self, model_id: &str) -> bool {
        self.state.read().await.favorites.contains(model_id)
    }

    // ---- cache ----

    pub async fn record_performance(&self, model_id: &str, data: PerformanceData) {
        self.cache.write().await.set_performance(model_id, data.clone());

        if let Some(store) = &self.store {
            match serde_json::to_value(&data) {
                Ok(value) => store.set(&perf_key(model_id), value, self.cache_ttl).await,
                Err(e) => warn!("Failed to serialize performance for {}: {}", model_id, e),
            }
        }
    }

    pub async fn set_availability(&self, provider: &str, model_id: &str, available: bool) {
        self.cache
            .write()
            .await
            .set_availability(provider, model_id, available);
    }

    pub async fn is_available(&self, provider: &str, model_id: &str) -> Option<bool> {
        self.cache.read().await.availability(provider, model_id)
    }

    pub async fn cache_snapshot(&self) -> CacheSnapshot {
        self.cache.read().await.snapshot()
    }

    // ---- selection ----

    /// Registry models that pass every filter of `criteria`
    pub async fn candidates(&self, criteria: &SelectionCriteria) -> Vec<CanonicalModel> {
        let context = self.scoring_context(self.registry.all()).await;
        self.filter_models(criteria, &context).await
    }

    pub async fn get_recommendation(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<ModelRecommendation> {
        let context = self.scoring_context(self.registry.all()).await;
        let candidates = self.filter_models(criteria, &context).await;
        if candidates.is_empty() {
            debug!("No models match criteria: {:?}", criteria);
            return Err(DispatchError::NoCandidates);
        }

        let mut ranked = self.rank(&candidates, criteria, &context).await;
        let mut primary = ranked.remove(0);
        if context.preferences.enable_fallback {
            primary.fallbacks = ranked.into_iter().take(MAX_FALLBACKS).collect();
        }

        info!(
            "Recommended {} via {} (score {:.1}, confidence {:.2}, {} fallbacks)",
            primary.model.id,
            primary.provider,
            primary.score,
            primary.confidence,
            primary.fallbacks.len()
        );
        Ok(primary)
    }

    /// Score an arbitrary candidate list with the recommendation scoring function
    pub async fn score_models(
        &self,
        models: &[CanonicalModel],
        criteria: &SelectionCriteria,
    ) -> Vec<ModelRecommendation> {
        let context = self.scoring_context(models).await;
        self.rank(models, criteria, &context).await
    }

    async fn scoring_context(&self, models: &[CanonicalModel]) -> ScoringContext {
        let (preferences, favorites) = {
            let state = self.state.read().await;
            (state.preferences.clone(), state.favorites.clone())
        };

        let mut performance = HashMap::new();
        let mut missing = Vec::new();
        {
            let cache = self.cache.read().await;
            for model in models {
                match cache.performance(&model.id) {
                    Some(data) => {
                        performance.insert(model.id.clone(), data.clone());
                    }
                    None => missing.push(model.id.clone()),
                }
            }
        }

        if let Some(store) = &self.store {
            for model_id in missing {
                if let Some(value) = store.get(&perf_key(&model_id)).await {
                    match serde_json::from_value::<PerformanceData>(value) {
                        Ok(data) => {
                            performance.insert(model_id, data);
                        }
                        Err(e) => debug!("Ignoring malformed cached performance for {}: {}", model_id, e),
                    }
                }
            }
        }

        ScoringContext {
            preferences,
            favorites,
            performance,
        }
    }

    async fn filter_models(
        &self,
        criteria: &SelectionCriteria,
        context: &ScoringContext,
    ) -> Vec<CanonicalModel> {
        let ceiling = effective_ceiling(criteria.max_cost, context.preferences.max_cost);
        let cache = self.cache.read().await;

        self.registry
            .all()
            .iter()
            .filter(|model| !context.preferences.excluded_models.contains(&model.id))
            .filter(|model| ceiling.map_or(true, |c| model.pricing.input_per_million <= c))
            .filter(|model| {
                criteria
                    .required_context
                    .map_or(true, |needed| model.limits.context_window >= needed)
            })
            .filter(|model| {
                criteria
                    .required_features
                    .iter()
                    .all(|feature| model.supports(feature))
            })
            .filter(|model| {
                criteria
                    .provider
                    .as_deref()
                    .map_or(true, |provider| model.has_provider(provider))
            })
            .filter(|model| match (criteria.min_quality, context.performance.get(&model.id)) {
                (Some(min), Some(data)) => data.quality >= min,
                _ => true,
            })
            .filter(|model| {
                let mut providers: Vec<&str> = match criteria.provider.as_deref() {
                    Some(provider) => vec![provider],
                    None => model.providers.keys().map(String::as_str).collect(),
                };
                providers.retain(|provider| cache.availability(provider, &model.id) != Some(false));
                !providers.is_empty()
            })
            .cloned()
            .collect()
    }

    async fn rank(
        &self,
        models: &[CanonicalModel],
        criteria: &SelectionCriteria,
        context: &ScoringContext,
    ) -> Vec<ModelRecommendation> {
        let cache = self.cache.read().await;
        let mut ranked: Vec<ModelRecommendation> = models
            .iter()
            .map(|model| score_model(model, criteria, context, &cache))
            .collect();
        drop(cache);

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| match criteria.speed {
                    SpeedPreference::Fast => a.model.blended_price().total_cmp(&b.model.blended_price()),
                    SpeedPreference::Quality => b.model.blended_price().total_cmp(&a.model.blended_price()),
                    SpeedPreference::Balanced => std::cmp::Ordering::Equal,
                })
                .then_with(|| a.model.id.cmp(&b.model.id))
        });
        ranked
    }
}

fn perf_key(model_id: &str) -> String {
    format!("perf:{model_id}")
}

/// Tighter of the request ceiling and the preference ceiling; non-positive means none
fn effective_ceiling(request: Option<f64>, preference: Option<f64>) -> Option<f64> {
    let request = request.filter(|c| *c > 0.0);
    let preference = preference.filter(|c| *c > 0.0);
    match (request, preference) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Bonus for the first preferred provider found, decreasing with rank
pub(crate) fn provider_preference_bonus(rank: usize) -> f64 {
    (10.0 - 2.0 * rank as f64).max(0.0)
}

fn score_model(
    model: &CanonicalModel,
    criteria: &SelectionCriteria,
    context: &ScoringContext,
    cache: &ModelCache,
) -> ModelRecommendation {
    let mut reasons = Vec::new();
    let mut score = 50.0;

    if criteria.task_type.matches(model) {
        score += 20.0;
        reasons.push(format!("Well suited for {:?} tasks", criteria.task_type).to_lowercase());
    }

    for feature in &criteria.required_features {
        if model.supports(feature) {
            score += 10.0;
            reasons.push(format!("Supports {feature}"));
        }
    }

    let price = model.pricing.input_per_million;
    let ceiling = effective_ceiling(criteria.max_cost, context.preferences.max_cost)
        .unwrap_or(DEFAULT_COST_REFERENCE);
    let cost_efficiency = 20.0 * (1.0 - (price / ceiling).min(1.0));
    score += cost_efficiency;
    if cost_efficiency >= 15.0 {
        reasons.push(format!("Cost effective at ${price:.2}/M input tokens"));
    }

    let performance = context.performance.get(&model.id);
    if let Some(data) = performance {
        score += data.score_signal();
        reasons.push(format!(
            "Observed quality {:.1}/10, reliability {:.1}/10",
            data.quality, data.reliability
        ));
    }

    score = score.clamp(0.0, 100.0);

    if context.favorites.contains(&model.id) {
        score += 15.0;
        reasons.push("In your favorites".to_string());
    }

    let usable = |provider: &str| cache.availability(provider, &model.id) != Some(false);
    let preferred = context
        .preferences
        .preferred_providers
        .iter()
        .enumerate()
        .find(|(_, provider)| model.has_provider(provider) && usable(provider));

    let provider = match (&criteria.provider, preferred) {
        (Some(fixed), _) => fixed.clone(),
        (None, Some((rank, provider))) => {
            score += provider_preference_bonus(rank);
            reasons.push(format!("Available from preferred provider {provider}"));
            provider.clone()
        }
        (None, None) => model
            .providers
            .keys()
            .find(|provider| usable(provider))
            .or_else(|| model.providers.keys().next())
            .cloned()
            .unwrap_or_default(),
    };

    if criteria.provider.is_some() {
        if let Some((rank, _)) = context
            .preferences
            .preferred_providers
            .iter()
            .enumerate()
            .find(|(_, p)| **p == provider)
        {
            score += provider_preference_bonus(rank);
        }
    }

    score = score.clamp(0.0, 100.0);

    // tenths, so the sum lands exactly on 1.0
    let mut confidence_tenths: u32 = 7;
    if WELL_KNOWN_FAMILIES
        .iter()
        .any(|family| model.family.eq_ignore_ascii_case(family))
    {
        confidence_tenths += 2;
    }
    if performance.is_some() {
        confidence_tenths += 1;
    }
    let confidence = (f64::from(confidence_tenths) / 10.0).clamp(0.0, 1.0);

    let provider_model_id = model
        .provider_model_id(&provider)
        .unwrap_or(&model.id)
        .to_string();

    ModelRecommendation {
        model: model.clone(),
        provider,
        provider_model_id,
        score,
        confidence,
        reasons,
        fallbacks: Vec::new(),
    }
}
