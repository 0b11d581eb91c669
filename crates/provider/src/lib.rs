//! Model backend abstraction
//!
//! Defines the `ModelBackend` trait that decouples orchestration from the
//! wire protocol of a particular LLM endpoint. `OpenRouterBackend` is the
//! production implementation; tests drive the orchestrators with scripted
//! fakes implementing the same trait.
//!
//! A backend performs exactly one bounded request to one model and classifies
//! the outcome. It never retries and never picks another model: that policy
//! lives in the orchestrator crate.

pub mod classify;
pub mod openrouter;

pub use classify::{classify_status, is_rate_limit_error, is_rate_limit_message, parse_reset_hint};
pub use openrouter::{OpenRouterBackend, OpenRouterSettings};

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;

/// Boxed future used by dyn-compatible traits across the workspace.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant that solves data analysis tasks. Provide concise, accurate answers.";
pub const DEFAULT_TEMPERATURE: f32 = 0.3;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// One prompt addressed to one model.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Image references (URLs or `data:` URLs). Non-empty switches the user
    /// message to the multi-part format.
    pub images: Vec<String>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            images: Vec::new(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn with_limits(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// Same request addressed to another model.
    pub fn for_model(&self, model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..self.clone()
        }
    }
}

/// A successful model response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub content: String,
    /// Model id echoed by the provider, or the requested id.
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<serde_json::Value>,
    #[serde(serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Why a single model call failed.
///
/// Callers treat every variant as "try the next candidate"; the distinction
/// matters for throttle bookkeeping, logs and metrics.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    #[error("rate limited on model {model}")]
    RateLimited { model: String },

    #[error("server error {status} on model {model}")]
    ServerError { model: String, status: u16 },

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error(transparent)]
    Credentials(#[from] model_pool::Error),

    #[error("timeout on model {model}")]
    Timeout { model: String },

    #[error("transport error on model {model}: {message}")]
    Transport { model: String, message: String },

    #[error("invalid response from model {model}: {message}")]
    Decode { model: String, message: String },
}

impl CallError {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            CallError::RateLimited { .. } => "rate_limited",
            CallError::ServerError { .. } => "server_error",
            CallError::Api { .. } => "api_error",
            CallError::Credentials(_) => "credentials",
            CallError::Timeout { .. } => "timeout",
            CallError::Transport { .. } => "transport",
            CallError::Decode { .. } => "decode",
        }
    }
}

/// Result alias for backend calls.
pub type Result<T> = std::result::Result<T, CallError>;

/// A single-call model endpoint.
///
/// Takes the request by value so implementations can move it into spawned
/// tasks. Uses `BoxFuture` for dyn-compatibility (`Arc<dyn ModelBackend>`).
pub trait ModelBackend: Send + Sync {
    /// Identifier for logging (e.g. "openrouter").
    fn id(&self) -> &str;

    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<Completion>>;
}
