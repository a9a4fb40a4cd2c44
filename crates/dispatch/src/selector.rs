//! Model Selector - task-facing selection API
//!
//! Quick-select shortcuts are deliberately independent single-pass scans and
//! do not reuse recommendation scoring; their rankings may differ from
//! [`ModelSelector::select_model`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{DispatchError, Result};
use crate::manager::{ModelManager, ModelRecommendation, SelectionCriteria, SpeedPreference, TaskType};
use crate::registry::CanonicalModel;

/// Input price per million below which a model counts as cheap
pub const LOW_PRICE_THRESHOLD: f64 = 1.0;
/// Input price per million above which a model counts as expensive
pub const HIGH_PRICE_THRESHOLD: f64 = 10.0;

const DEFAULT_INPUT_TOKENS: u32 = 1_000;

const SMALL_MODEL_FRAGMENTS: &[&str] = &["mini", "haiku", "flash", "nano", "instant", "8b", "small"];
const FLAGSHIP_FRAGMENTS: &[&str] = &["opus", "sonnet", "gpt-4o", "gpt-4.1", "pro", "large", "grok", "70b"];
const REASONING_FRAGMENTS: &[&str] = &["reasoner", "-r1", "o1", "o3"];

/// Rough token count for a prompt (4 characters per token, at least 1)
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    (chars / 4).max(1)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionRequest {
    pub task_type: TaskType,
    pub prompt: Option<String>,
    /// Explicit input size; estimated from `prompt` when absent
    pub input_tokens: Option<u32>,
    pub required_features: Vec<String>,
    pub max_cost: Option<f64>,
    pub min_quality: Option<f64>,
    pub speed: SpeedPreference,
    pub required_context: Option<u32>,
    pub provider: Option<String>,
}

impl SelectionRequest {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            ..Default::default()
        }
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = Some(prompt.to_string());
        self
    }

    pub fn with_input_tokens(mut self, tokens: u32) -> Self {
        self.input_tokens = Some(tokens);
        self
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

    pub fn with_speed(mut self, speed: SpeedPreference) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_provider(mut self, provider: &str) -> Self {
        self.provider = Some(provider.to_string());
        self
    }

    pub fn with_required_context(mut self, tokens: u32) -> Self {
        self.required_context = Some(tokens);
        self
    }

    pub fn input_tokens(&self) -> u32 {
        self.input_tokens
            .or_else(|| self.prompt.as_deref().map(estimate_tokens))
            .unwrap_or(DEFAULT_INPUT_TOKENS)
    }

    pub fn to_criteria(&self) -> SelectionCriteria {
        // The prompt itself must fit in the context window
        let prompt_context = self.prompt.as_deref().map(estimate_tokens);
        let required_context = match (self.required_context, prompt_context) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        SelectionCriteria {
            task_type: self.task_type,
            required_features: self.required_features.clone(),
            max_cost: self.max_cost,
            min_quality: self.min_quality,
            speed: self.speed,
            required_context,
            provider: self.provider.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub input_tokens: u32,
    pub estimated_output_tokens: u32,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformancePrediction {
    pub expected_latency_ms: u32,
    /// 0-10
    pub quality_score: f64,
    pub throughput_tokens_per_sec: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionResponse {
    pub recommendation: ModelRecommendation,
    pub cost_estimate: CostEstimate,
    pub performance: PerformancePrediction,
    pub alternatives: Vec<ModelRecommendation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickPick {
    pub model_id: String,
    pub display_name: String,
    pub provider: String,
    /// Value of the metric this pick optimised
    pub metric: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickSelectOptions {
    pub fastest: Option<QuickPick>,
    pub cheapest: Option<QuickPick>,
    pub best_quality: Option<QuickPick>,
    pub balanced: Option<QuickPick>,
    pub recommended: Option<ModelRecommendation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelComparison {
    pub rank: usize,
    pub recommendation: ModelRecommendation,
    pub cost_estimate: CostEstimate,
    pub performance: PerformancePrediction,
    pub pros: Vec<String>,
    pub cons: Vec<String>,
}

/// Estimate request cost; output is assumed to be half the input
pub fn estimate_cost(model: &CanonicalModel, input_tokens: u32) -> CostEstimate {
    let estimated_output_tokens = input_tokens / 2;
    let input_cost = f64::from(input_tokens) * model.pricing.input_per_million / 1_000_000.0;
    let output_cost =
        f64::from(estimated_output_tokens) * model.pricing.output_per_million / 1_000_000.0;

    CostEstimate {
        input_tokens,
        estimated_output_tokens,
        input_cost,
        output_cost,
        total_cost: input_cost + output_cost,
        currency: model.pricing.currency.clone(),
    }
}

fn name_has(model: &CanonicalModel, fragments: &[&str]) -> bool {
    let id = model.id.to_ascii_lowercase();
    fragments.iter().any(|fragment| id.contains(fragment))
}

/// Heuristic prediction from the model's name class, not measured telemetry
pub fn predict_performance(model: &CanonicalModel) -> PerformancePrediction {
    let (expected_latency_ms, quality_score, throughput_tokens_per_sec) =
        if name_has(model, REASONING_FRAGMENTS) {
            (4_000, 9.5, 40)
        } else if name_has(model, SMALL_MODEL_FRAGMENTS) {
            (400, 7.0, 150)
        } else if name_has(model, FLAGSHIP_FRAGMENTS) {
            (1_200, 9.0, 60)
        } else {
            (800, 8.0, 80)
        };

    PerformancePrediction {
        expected_latency_ms,
        quality_score,
        throughput_tokens_per_sec,
    }
}

fn default_provider(model: &CanonicalModel, fixed: Option<&str>) -> String {
    fixed
        .filter(|provider| model.has_provider(provider))
        .map(str::to_string)
        .or_else(|| model.providers.keys().next().cloned())
        .unwrap_or_default()
}

fn quick_pick(model: &CanonicalModel, fixed: Option<&str>, metric: f64, reason: String) -> QuickPick {
    QuickPick {
        model_id: model.id.clone(),
        display_name: model.display_name.clone(),
        provider: default_provider(model, fixed),
        metric,
        reason,
    }
}

fn speed_score(model: &CanonicalModel) -> f64 {
    let mut score = 50.0;
    if name_has(model, SMALL_MODEL_FRAGMENTS) {
        score += 30.0;
    }
    if model.capabilities.reasoning {
        score -= 10.0;
    }
    score - (model.blended_price() / 10.0).min(20.0)
}

fn quality_score(model: &CanonicalModel) -> f64 {
    let mut score = 50.0;
    if name_has(model, FLAGSHIP_FRAGMENTS) {
        score += 30.0;
    }
    if model.capabilities.reasoning {
        score += 20.0;
    }
    score
}

fn balanced_score(model: &CanonicalModel) -> f64 {
    let cost_score = 100.0 * (1.0 - (model.blended_price() / 50.0).min(1.0));
    0.5 * cost_score + 0.5 * quality_score(model)
}

/// Single pass keeping the first model with the greatest key
fn scan_max<'a>(
    models: &'a [CanonicalModel],
    key: impl Fn(&CanonicalModel) -> f64,
) -> Option<(&'a CanonicalModel, f64)> {
    let mut best: Option<(&CanonicalModel, f64)> = None;
    for model in models {
        let value = key(model);
        if best.map_or(true, |(_, current)| value > current) {
            best = Some((model, value));
        }
    }
    best
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    manager: Arc<ModelManager>,
}

impl ModelSelector {
    pub fn new(manager: Arc<ModelManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ModelManager> {
        &self.manager
    }

    pub async fn select_model(&self, request: &SelectionRequest) -> Result<SelectionResponse> {
        let criteria = request.to_criteria();
        let recommendation = self.manager.get_recommendation(&criteria).await?;
        let alternatives = recommendation.fallbacks.clone();

        let cost_estimate = estimate_cost(&recommendation.model, request.input_tokens());
        let performance = predict_performance(&recommendation.model);

        debug!(
            "Selected {} for {:?}: estimated cost {:.6} {}",
            recommendation.model.id,
            request.task_type,
            cost_estimate.total_cost,
            cost_estimate.currency
        );

        Ok(SelectionResponse {
            recommendation,
            cost_estimate,
            performance,
            alternatives,
        })
    }

    pub async fn get_quick_select_options(
        &self,
        request: &SelectionRequest,
    ) -> Result<QuickSelectOptions> {
        let criteria = request.to_criteria();
        let candidates = self.manager.candidates(&criteria).await;
        if candidates.is_empty() {
            return Err(DispatchError::NoCandidates);
        }
        let fixed = criteria.provider.as_deref();

        let fastest = scan_max(&candidates, speed_score).map(|(model, metric)| {
            quick_pick(model, fixed, metric, "Small, low-latency model".to_string())
        });

        let cheapest = scan_max(&candidates, |model| -model.blended_price()).map(|(model, metric)| {
            quick_pick(
                model,
                fixed,
                -metric,
                format!("Lowest combined price: ${:.2}/M tokens", -metric),
            )
        });

        let best_quality = scan_max(&candidates, quality_score).map(|(model, metric)| {
            quick_pick(model, fixed, metric, "Flagship-class model".to_string())
        });

        let balanced = scan_max(&candidates, balanced_score).map(|(model, metric)| {
            quick_pick(model, fixed, metric, "Best cost/quality balance".to_string())
        });

        let recommended = self.manager.get_recommendation(&criteria).await.ok();

        Ok(QuickSelectOptions {
            fastest,
            cheapest,
            best_quality,
            balanced,
            recommended,
        })
    }

    /// Score the given models with recommendation scoring and attach pros/cons
    pub async fn compare_models(
        &self,
        model_ids: &[String],
        request: &SelectionRequest,
    ) -> Result<Vec<ModelComparison>> {
        let models = model_ids
            .iter()
            .map(|id| self.manager.get_model(id))
            .collect::<Result<Vec<_>>>()?;

        let criteria = request.to_criteria();
        let scored = self.manager.score_models(&models, &criteria).await;
        let input_tokens = request.input_tokens();

        info!("Compared {} models", scored.len());
        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(position, recommendation)| {
                let (pros, cons) = pros_and_cons(&recommendation.model);
                ModelComparison {
                    rank: position + 1,
                    cost_estimate: estimate_cost(&recommendation.model, input_tokens),
                    performance: predict_performance(&recommendation.model),
                    recommendation,
                    pros,
                    cons,
                }
            })
            .collect())
    }
}

fn pros_and_cons(model: &CanonicalModel) -> (Vec<String>, Vec<String>) {
    let mut pros = Vec::new();
    let mut cons = Vec::new();
    let price = model.pricing.input_per_million;

    if price < LOW_PRICE_THRESHOLD {
        pros.push("Low cost".to_string());
    }
    if model.capabilities.vision {
        pros.push("Supports vision".to_string());
    }
    if model.capabilities.reasoning {
        pros.push("Advanced reasoning".to_string());
    }
    if model.limits.context_window > 100_000 {
        pros.push(format!("Large context window ({} tokens)", model.limits.context_window));
    }

    if price > HIGH_PRICE_THRESHOLD {
        cons.push("High cost".to_string());
    }
    if !model.capabilities.streaming {
        cons.push("No streaming support".to_string());
    }
    if model.limits.context_window < 50_000 {
        cons.push(format!("Small context window ({} tokens)", model.limits.context_window));
    }

    (pros, cons)
}
