//! Provider client capability and per-provider configuration records
//!
//! Vendor adapters differ only in endpoint, auth header and JSON field names,
//! so they are described by [`ProviderProfile`] records and driven through a
//! single [`ProviderClient`] trait.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::retry::ProviderError;

/// Chat message for conversation context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.to_string(),
        }
    }

    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }
}

/// Request object handed to a provider client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// Provider-specific model identifier
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stream: bool,
}

impl ProviderRequest {
    pub fn new(model: &str, prompt: &str) -> Self {
        Self {
            model: model.to_string(),
            messages: vec![ChatMessage::user(prompt)],
            max_tokens: None,
            temperature: None,
            stream: true,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: &str) -> Self {
        self.messages.insert(0, ChatMessage::system(system_prompt));
        self
    }

    pub fn with_parameters(mut self, max_tokens: Option<u32>, temperature: Option<f32>) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One piece of streamed model output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl OutputChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            finish_reason: None,
            usage: None,
        }
    }
}

pub type ChunkStream = BoxStream<'static, Result<OutputChunk, ProviderError>>;

/// External collaborator that talks to one vendor
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider identifier used for circuit breaking, e.g. "openai"
    fn provider_id(&self) -> &str;

    /// Submit a request and receive a lazy sequence of output chunks
    async fn invoke(&self, request: ProviderRequest) -> Result<ChunkStream, ProviderError>;
}

/// Per-provider wire configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProviderProfile {
    pub id: &'static str,
    pub display_name: &'static str,
    pub base_url: &'static str,
    /// Header carrying the credential
    pub auth_header: &'static str,
    /// Prefix placed before the key, e.g. "Bearer "
    pub auth_scheme: &'static str,
    /// Path of the model-listing endpoint, if the provider has a public one
    pub models_path: Option<&'static str>,
    pub model_field: &'static str,
    pub messages_field: &'static str,
    /// JSON pointer to the text of one streamed chunk
    pub content_pointer: &'static str,
}

const OPENAI_COMPATIBLE_CONTENT: &str = "/choices/0/delta/content";

static BUILTIN_PROFILES: &[ProviderProfile] = &[
    ProviderProfile {
        id: "openai",
        display_name: "OpenAI",
        base_url: "https://api.openai.com/v1",
        auth_header: "Authorization",
        auth_scheme: "Bearer ",
        models_path: None,
        model_field: "model",
        messages_field: "messages",
        content_pointer: OPENAI_COMPATIBLE_CONTENT,
    },
    ProviderProfile {
        id: "anthropic",
        display_name: "Anthropic",
        base_url: "https://api.anthropic.com/v1",
        auth_header: "x-api-key",
        auth_scheme: "",
        models_path: None,
        model_field: "model",
        messages_field: "messages",
        content_pointer: "/delta/text",
    },
    ProviderProfile {
        id: "gemini",
        display_name: "Google Gemini",
        base_url: "https://generativelanguage.googleapis.com/v1beta",
        auth_header: "x-goog-api-key",
        auth_scheme: "",
        models_path: None,
        model_field: "model",
        messages_field: "contents",
        content_pointer: "/candidates/0/content/parts/0/text",
    },
    ProviderProfile {
        id: "bedrock",
        display_name: "AWS Bedrock",
        base_url: "https://bedrock-runtime.us-east-1.amazonaws.com",
        auth_header: "Authorization",
        auth_scheme: "AWS4-HMAC-SHA256 ",
        models_path: None,
        model_field: "modelId",
        messages_field: "messages",
        content_pointer: "/delta/text",
    },
    ProviderProfile {
        id: "openrouter",
        display_name: "OpenRouter",
        base_url: "https://openrouter.ai/api/v1",
        auth_header: "Authorization",
        auth_scheme: "Bearer ",
        models_path: Some("/models"),
        model_field: "model",
        messages_field: "messages",
        content_pointer: OPENAI_COMPATIBLE_CONTENT,
    },
    ProviderProfile {
        id: "groq",
        display_name: "Groq",
        base_url: "https://api.groq.com/openai/v1",
        auth_header: "Authorization",
        auth_scheme: "Bearer ",
        models_path: None,
        model_field: "model",
        messages_field: "messages",
        content_pointer: OPENAI_COMPATIBLE_CONTENT,
    },
    ProviderProfile {
        id: "mistral",
        display_name: "Mistral",
        base_url: "https://api.mistral.ai/v1",
        auth_header: "Authorization",
        auth_scheme: "Bearer ",
        models_path: None,
        model_field: "model",
        messages_field: "messages",
        content_pointer: OPENAI_COMPATIBLE_CONTENT,
    },
    ProviderProfile {
        id: "deepseek",
        display_name: "DeepSeek",
        base_url: "https://api.deepseek.com/v1",
        auth_header: "Authorization",
        auth_scheme: "Bearer ",
        models_path: None,
        model_field: "model",
        messages_field: "messages",
        content_pointer: OPENAI_COMPATIBLE_CONTENT,
    },
    ProviderProfile {
        id: "xai",
        display_name: "xAI",
        base_url: "https://api.x.ai/v1",
        auth_header: "Authorization",
        auth_scheme: "Bearer ",
        models_path: None,
        model_field: "model",
        messages_field: "messages",
        content_pointer: OPENAI_COMPATIBLE_CONTENT,
    },
    ProviderProfile {
        id: "together",
        display_name: "Together AI",
        base_url: "https://api.together.xyz/v1",
        auth_header: "Authorization",
        auth_scheme: "Bearer ",
        models_path: None,
        model_field: "model",
        messages_field: "messages",
        content_pointer: OPENAI_COMPATIBLE_CONTENT,
    },
    ProviderProfile {
        id: "fireworks",
        display_name: "Fireworks AI",
        base_url: "https://api.fireworks.ai/inference/v1",
        auth_header: "Authorization",
        auth_scheme: "Bearer ",
        models_path: None,
        model_field: "model",
        messages_field: "messages",
        content_pointer: OPENAI_COMPATIBLE_CONTENT,
    },
    ProviderProfile {
        id: "perplexity",
        display_name: "Perplexity",
        base_url: "https://api.perplexity.ai",
        auth_header: "Authorization",
        auth_scheme: "Bearer ",
        models_path: None,
        model_field: "model",
        messages_field: "messages",
        content_pointer: OPENAI_COMPATIBLE_CONTENT,
    },
    ProviderProfile {
        id: "cohere",
        display_name: "Cohere",
        base_url: "https://api.cohere.com/v2",
        auth_header: "Authorization",
        auth_scheme: "Bearer ",
        models_path: None,
        model_field: "model",
        messages_field: "messages",
        content_pointer: "/delta/message/content/text",
    },
    ProviderProfile {
        id: "ollama",
        display_name: "Ollama",
        base_url: "http://localhost:11434/api",
        auth_header: "Authorization",
        auth_scheme: "Bearer ",
        models_path: None,
        model_field: "model",
        messages_field: "messages",
        content_pointer: "/message/content",
    },
];

impl ProviderProfile {
    pub fn builtin() -> &'static [ProviderProfile] {
        BUILTIN_PROFILES
    }

    pub fn find(id: &str) -> Option<&'static ProviderProfile> {
        BUILTIN_PROFILES
            .iter()
            .find(|profile| profile.id.eq_ignore_ascii_case(id))
    }

    /// Value for the auth header
    pub fn auth_header_value(&self, api_key: &str) -> String {
        format!("{}{}", self.auth_scheme, api_key)
    }

    pub fn models_url(&self) -> Option<String> {
        self.models_path
            .map(|path| format!("{}{}", self.base_url.trim_end_matches('/'), path))
    }

    /// Pull the text of one streamed chunk out of a decoded event payload
    pub fn extract_content<'a>(&self, payload: &'a serde_json::Value) -> Option<&'a str> {
        payload.pointer(self.content_pointer).and_then(|v| v.as_str())
    }

    /// Build the JSON body for a request in this provider's field names
    pub fn request_body(&self, request: &ProviderRequest) -> serde_json::Value {
        let mut body = serde_json::Map::new();
        body.insert(
            self.model_field.to_string(),
            serde_json::Value::String(request.model.clone()),
        );
        body.insert(
            self.messages_field.to_string(),
            serde_json::to_value(&request.messages).unwrap_or(serde_json::Value::Null),
        );
        if let Some(max_tokens) = request.max_tokens {
            body.insert("max_tokens".to_string(), max_tokens.into());
        }
        if let Some(temperature) = request.temperature {
            body.insert("temperature".to_string(), f64::from(temperature).into());
        }
        body.insert("stream".to_string(), request.stream.into());
        serde_json::Value::Object(body)
    }
}
