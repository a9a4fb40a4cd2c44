//! Canonical Model Registry - static catalog of vendor-agnostic models

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::error::{DispatchError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub vision: bool,
    pub tools: bool,
    pub reasoning: bool,
    pub streaming: bool,
    pub code: bool,
    pub prompt_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelLimits {
    pub max_output_tokens: u32,
    pub context_window: u32,
    pub max_thinking_tokens: Option<u32>,
    pub default_temperature: f32,
}

/// Prices per million tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_write_per_million: Option<f64>,
    pub cache_read_per_million: Option<f64>,
    pub thinking_per_million: Option<f64>,
    pub currency: String,
}

impl Pricing {
    pub fn usd(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
            cache_write_per_million: None,
            cache_read_per_million: None,
            thinking_per_million: None,
            currency: "USD".to_string(),
        }
    }

    pub fn with_cache(mut self, write: f64, read: f64) -> Self {
        self.cache_write_per_million = Some(write);
        self.cache_read_per_million = Some(read);
        self
    }

    pub fn with_thinking(mut self, price: f64) -> Self {
        self.thinking_per_million = Some(price);
        self
    }
}

/// Vendor-agnostic model description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalModel {
    pub id: String,
    pub display_name: String,
    pub family: String,
    pub capabilities: Capabilities,
    pub limits: ModelLimits,
    pub pricing: Pricing,
    /// provider id -> provider-specific model id
    pub providers: BTreeMap<String, String>,
}

impl CanonicalModel {
    /// Whether a named feature is supported; unknown names are unsupported
    pub fn supports(&self, feature: &str) -> bool {
        let caps = &self.capabilities;
        match feature.trim().to_ascii_lowercase().as_str() {
            "vision" | "image" | "images" => caps.vision,
            "tools" | "tool_use" | "function_calling" | "functions" => caps.tools,
            "reasoning" | "thinking" => caps.reasoning,
            "streaming" | "stream" => caps.streaming,
            "code" | "coding" => caps.code,
            "prompt_cache" | "prompt-cache" | "cache" | "caching" => caps.prompt_cache,
            _ => false,
        }
    }

    /// Input plus output price per million tokens
    pub fn blended_price(&self) -> f64 {
        self.pricing.input_per_million + self.pricing.output_per_million
    }

    pub fn provider_model_id(&self, provider: &str) -> Option<&str> {
        self.providers.get(provider).map(String::as_str)
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        self.providers.contains_key(provider)
    }
}

/// Immutable lookup over canonical models
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<CanonicalModel>,
    index: HashMap<String, usize>,
}

impl ModelRegistry {
    /// Build a registry, rejecting duplicate ids and models without providers
    pub fn from_models(models: Vec<CanonicalModel>) -> Result<Self> {
        let mut index = HashMap::with_capacity(models.len());
        for (position, model) in models.iter().enumerate() {
            if model.providers.is_empty() {
                return Err(DispatchError::Config(format!(
                    "model {} has no provider mapping",
                    model.id
                )));
            }
            if index.insert(model.id.clone(), position).is_some() {
                return Err(DispatchError::Config(format!(
                    "duplicate model id {}",
                    model.id
                )));
            }
        }

        debug!("Model registry loaded with {} models", models.len());
        Ok(Self { models, index })
    }

    /// Registry populated with the built-in catalog
    pub fn builtin() -> Self {
        let models = builtin_models();
        let index = models
            .iter()
            .enumerate()
            .map(|(position, model)| (model.id.clone(), position))
            .collect();
        Self { models, index }
    }

    pub fn get(&self, id: &str) -> Option<&CanonicalModel> {
        self.index.get(id).map(|&position| &self.models[position])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn all(&self) -> &[CanonicalModel] {
        &self.models
    }

    pub fn by_provider(&self, provider: &str) -> Vec<&CanonicalModel> {
        self.models
            .iter()
            .filter(|model| model.has_provider(provider))
            .collect()
    }

    pub fn by_family(&self, family: &str) -> Vec<&CanonicalModel> {
        self.models
            .iter()
            .filter(|model| model.family.eq_ignore_ascii_case(family))
            .collect()
    }

    /// Distinct provider ids across all models, sorted
    pub fn providers(&self) -> Vec<String> {
        self.models
            .iter()
            .flat_map(|model| model.providers.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

struct CatalogEntry {
    id: &'static str,
    name: &'static str,
    family: &'static str,
    caps: Capabilities,
    max_output: u32,
    context: u32,
    thinking: Option<u32>,
    pricing: Pricing,
    providers: &'static [(&'static str, &'static str)],
}

fn caps(vision: bool, tools: bool, reasoning: bool, code: bool, prompt_cache: bool) -> Capabilities {
    Capabilities {
        vision,
        tools,
        reasoning,
        streaming: true,
        code,
        prompt_cache,
    }
}

fn build(entry: CatalogEntry) -> CanonicalModel {
    CanonicalModel {
        id: entry.id.to_string(),
        display_name: entry.name.to_string(),
        family: entry.family.to_string(),
        capabilities: entry.caps,
        limits: ModelLimits {
            max_output_tokens: entry.max_output,
            context_window: entry.context,
            max_thinking_tokens: entry.thinking,
            default_temperature: 0.7,
        },
        pricing: entry.pricing,
        providers: entry
            .providers
            .iter()
            .map(|(provider, model_id)| (provider.to_string(), model_id.to_string()))
            .collect(),
    }
}

fn builtin_models() -> Vec<CanonicalModel> {
    vec![
        // ---- OpenAI ----
        build(CatalogEntry {
            id: "gpt-4o",
            name: "GPT-4o",
            family: "gpt",
            caps: caps(true, true, false, true, true),
            max_output: 16_384,
            context: 128_000,
            thinking: None,
            pricing: Pricing::usd(2.5, 10.0).with_cache(2.5, 1.25),
            providers: &[("openai", "gpt-4o"), ("openrouter", "openai/gpt-4o")],
        }),
        build(CatalogEntry {
            id: "gpt-4o-mini",
            name: "GPT-4o mini",
            family: "gpt",
            caps: caps(true, true, false, true, true),
            max_output: 16_384,
            context: 128_000,
            thinking: None,
            pricing: Pricing::usd(0.15, 0.6).with_cache(0.15, 0.075),
            providers: &[
                ("openai", "gpt-4o-mini"),
                ("openrouter", "openai/gpt-4o-mini"),
            ],
        }),
        build(CatalogEntry {
            id: "gpt-4.1",
            name: "GPT-4.1",
            family: "gpt",
            caps: caps(true, true, false, true, true),
            max_output: 32_768,
            context: 1_047_576,
            thinking: None,
            pricing: Pricing::usd(2.0, 8.0).with_cache(2.0, 0.5),
            providers: &[("openai", "gpt-4.1"), ("openrouter", "openai/gpt-4.1")],
        }),
        build(CatalogEntry {
            id: "o3-mini",
            name: "o3-mini",
            family: "gpt",
            caps: caps(false, true, true, true, true),
            max_output: 100_000,
            context: 200_000,
            thinking: Some(100_000),
            pricing: Pricing::usd(1.1, 4.4).with_cache(1.1, 0.55),
            providers: &[("openai", "o3-mini"), ("openrouter", "openai/o3-mini")],
        }),
        // ---- Anthropic ----
        build(CatalogEntry {
            id: "claude-sonnet-4",
            name: "Claude Sonnet 4",
            family: "claude",
            caps: caps(true, true, true, true, true),
            max_output: 64_000,
            context: 200_000,
            thinking: Some(32_000),
            pricing: Pricing::usd(3.0, 15.0).with_cache(3.75, 0.3).with_thinking(15.0),
            providers: &[
                ("anthropic", "claude-sonnet-4-20250514"),
                ("bedrock", "anthropic.claude-sonnet-4-20250514-v1:0"),
                ("openrouter", "anthropic/claude-sonnet-4"),
            ],
        }),
        build(CatalogEntry {
            id: "claude-opus-4",
            name: "Claude Opus 4",
            family: "claude",
            caps: caps(true, true, true, true, true),
            max_output: 32_000,
            context: 200_000,
            thinking: Some(32_000),
            pricing: Pricing::usd(15.0, 75.0).with_cache(18.75, 1.5).with_thinking(75.0),
            providers: &[
                ("anthropic", "claude-opus-4-20250514"),
                ("bedrock", "anthropic.claude-opus-4-20250514-v1:0"),
                ("openrouter", "anthropic/claude-opus-4"),
            ],
        }),
        build(CatalogEntry {
            id: "claude-3-5-haiku",
            name: "Claude 3.5 Haiku",
            family: "claude",
            caps: caps(false, true, false, true, true),
            max_output: 8_192,
            context: 200_000,
            thinking: None,
            pricing: Pricing::usd(0.8, 4.0).with_cache(1.0, 0.08),
            providers: &[
                ("anthropic", "claude-3-5-haiku-20241022"),
                ("bedrock", "anthropic.claude-3-5-haiku-20241022-v1:0"),
                ("openrouter", "anthropic/claude-3.5-haiku"),
            ],
        }),
        // ---- Google ----
        build(CatalogEntry {
            id: "gemini-2.5-pro",
            name: "Gemini 2.5 Pro",
            family: "gemini",
            caps: caps(true, true, true, true, true),
            max_output: 65_536,
            context: 1_048_576,
            thinking: Some(32_768),
            pricing: Pricing::usd(1.25, 10.0).with_cache(1.25, 0.31),
            providers: &[
                ("gemini", "gemini-2.5-pro"),
                ("openrouter", "google/gemini-2.5-pro"),
            ],
        }),
        build(CatalogEntry {
            id: "gemini-2.0-flash",
            name: "Gemini 2.0 Flash",
            family: "gemini",
            caps: caps(true, true, false, true, false),
            max_output: 8_192,
            context: 1_048_576,
            thinking: None,
            pricing: Pricing::usd(0.1, 0.4),
            providers: &[
                ("gemini", "gemini-2.0-flash"),
                ("openrouter", "google/gemini-2.0-flash-001"),
            ],
        }),
        // ---- Meta via Groq / Together ----
        build(CatalogEntry {
            id: "llama-3.3-70b",
            name: "Llama 3.3 70B",
            family: "llama",
            caps: caps(false, true, false, true, false),
            max_output: 32_768,
            context: 131_072,
            thinking: None,
            pricing: Pricing::usd(0.59, 0.79),
            providers: &[
                ("groq", "llama-3.3-70b-versatile"),
                ("together", "meta-llama/Llama-3.3-70B-Instruct-Turbo"),
                ("openrouter", "meta-llama/llama-3.3-70b-instruct"),
            ],
        }),
        build(CatalogEntry {
            id: "llama-3.1-8b",
            name: "Llama 3.1 8B",
            family: "llama",
            caps: caps(false, true, false, false, false),
            max_output: 8_192,
            context: 131_072,
            thinking: None,
            pricing: Pricing::usd(0.05, 0.08),
            providers: &[
                ("groq", "llama-3.1-8b-instant"),
                ("openrouter", "meta-llama/llama-3.1-8b-instruct"),
            ],
        }),
        // ---- Mistral ----
        build(CatalogEntry {
            id: "mistral-large",
            name: "Mistral Large",
            family: "mistral",
            caps: caps(false, true, false, true, false),
            max_output: 8_192,
            context: 131_072,
            thinking: None,
            pricing: Pricing::usd(2.0, 6.0),
            providers: &[
                ("mistral", "mistral-large-latest"),
                ("bedrock", "mistral.mistral-large-2407-v1:0"),
                ("openrouter", "mistralai/mistral-large"),
            ],
        }),
        build(CatalogEntry {
            id: "codestral",
            name: "Codestral",
            family: "mistral",
            caps: caps(false, true, false, true, false),
            max_output: 8_192,
            context: 256_000,
            thinking: None,
            pricing: Pricing::usd(0.3, 0.9),
            providers: &[
                ("mistral", "codestral-latest"),
                ("openrouter", "mistralai/codestral-2501"),
            ],
        }),
        // ---- DeepSeek ----
        build(CatalogEntry {
            id: "deepseek-chat",
            name: "DeepSeek V3",
            family: "deepseek",
            caps: caps(false, true, false, true, true),
            max_output: 8_192,
            context: 64_000,
            thinking: None,
            pricing: Pricing::usd(0.27, 1.1).with_cache(0.27, 0.07),
            providers: &[
                ("deepseek", "deepseek-chat"),
                ("openrouter", "deepseek/deepseek-chat"),
            ],
        }),
        build(CatalogEntry {
            id: "deepseek-reasoner",
            name: "DeepSeek R1",
            family: "deepseek",
            caps: caps(false, false, true, true, true),
            max_output: 8_192,
            context: 64_000,
            thinking: Some(32_768),
            pricing: Pricing::usd(0.55, 2.19).with_cache(0.55, 0.14),
            providers: &[
                ("deepseek", "deepseek-reasoner"),
                ("openrouter", "deepseek/deepseek-r1"),
            ],
        }),
        // ---- xAI ----
        build(CatalogEntry {
            id: "grok-3",
            name: "Grok 3",
            family: "grok",
            caps: caps(false, true, false, true, false),
            max_output: 16_384,
            context: 131_072,
            thinking: None,
            pricing: Pricing::usd(3.0, 15.0),
            providers: &[("xai", "grok-3"), ("openrouter", "x-ai/grok-3")],
        }),
    ]
}
