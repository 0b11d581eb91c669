//! OpenRouter chat-completions backend
//!
//! One request per call using the pool's active API key. Throttling signals
//! (HTTP 429 or an embedded rate-limit error) mark the model in the shared
//! throttle table before the error is returned, so every other caller skips
//! it until the reset time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use model_pool::ModelPool;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::classify::{classify_status, is_rate_limit_error, parse_reset_hint};
use crate::{BoxFuture, CallError, Completion, CompletionRequest, ModelBackend, Result};

/// Header carrying the throttle reset time on 429 responses.
const RESET_HEADER: &str = "x-ratelimit-reset";

/// Connection settings for the OpenRouter API.
#[derive(Debug, Clone)]
pub struct OpenRouterSettings {
    /// API root, e.g. `https://openrouter.ai/api/v1`.
    pub base_url: String,
    pub timeout: Duration,
    /// Sent as `HTTP-Referer` for OpenRouter app attribution.
    pub referer: String,
    /// Sent as `X-Title`.
    pub title: String,
}

impl Default for OpenRouterSettings {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            timeout: Duration::from_secs(60),
            referer: "http://localhost:3000".to_string(),
            title: "LLM Quiz Solver".to_string(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: MessageContent<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum MessageContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl<'a> },
}

#[derive(Serialize)]
struct ImageUrl<'a> {
    url: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    model: Option<String>,
    usage: Option<serde_json::Value>,
    error: Option<EmbeddedError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddedError {
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: String,
}

/// Build the system + user exchange. Images switch the user message to parts.
fn build_body(request: &CompletionRequest) -> ChatRequest<'_> {
    let user = if request.images.is_empty() {
        MessageContent::Text(&request.prompt)
    } else {
        let mut parts = Vec::with_capacity(request.images.len() + 1);
        parts.push(ContentPart::Text {
            text: &request.prompt,
        });
        parts.extend(request.images.iter().map(|url| ContentPart::ImageUrl {
            image_url: ImageUrl { url },
        }));
        MessageContent::Parts(parts)
    };
    ChatRequest {
        model: &request.model,
        messages: [
            ChatMessage {
                role: "system",
                content: MessageContent::Text(&request.system_prompt),
            },
            ChatMessage {
                role: "user",
                content: user,
            },
        ],
        temperature: request.temperature,
        max_tokens: request.max_tokens,
    }
}

/// Production `ModelBackend` talking to OpenRouter.
pub struct OpenRouterBackend {
    client: reqwest::Client,
    pool: Arc<ModelPool>,
    settings: OpenRouterSettings,
}

impl OpenRouterBackend {
    pub fn new(client: reqwest::Client, pool: Arc<ModelPool>, settings: OpenRouterSettings) -> Self {
        Self {
            client,
            pool,
            settings,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    #[instrument(skip_all, fields(model = %request.model, images = request.images.len()))]
    async fn call(&self, request: CompletionRequest) -> Result<Completion> {
        let model = request.model.as_str();
        if self.pool.rate_limits().is_limited(model) {
            debug!("model throttled, not calling");
            return Err(CallError::RateLimited {
                model: model.to_string(),
            });
        }

        let api_key = self.pool.credentials().current()?;
        info!(prompt_chars = request.prompt.len(), "calling model");

        let started = Instant::now();
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key.expose())
            .header("HTTP-Referer", &self.settings.referer)
            .header("X-Title", &self.settings.title)
            .timeout(self.settings.timeout)
            .json(&build_body(&request))
            .send()
            .await
            .map_err(|e| transport_error(model, e))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let reset_at = parse_reset_hint(
                response
                    .headers()
                    .get(RESET_HEADER)
                    .and_then(|v| v.to_str().ok()),
            );
            self.pool.rate_limits().mark_limited(model, reset_at);
            return Err(CallError::RateLimited {
                model: model.to_string(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| transport_error(model, e))?;
        let elapsed = started.elapsed();

        if !status.is_success() {
            warn!(status = status.as_u16(), "model endpoint returned error status");
            return Err(classify_status(model, status.as_u16(), &body));
        }

        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|e| CallError::Decode {
            model: model.to_string(),
            message: e.to_string(),
        })?;

        if let Some(error) = parsed.error {
            if is_rate_limit_error(error.code.as_ref(), &error.message) {
                self.pool.rate_limits().mark_limited(model, None);
                return Err(CallError::RateLimited {
                    model: model.to_string(),
                });
            }
            return Err(CallError::Api {
                status: embedded_status(error.code.as_ref()).unwrap_or(status.as_u16()),
                message: error.message,
            });
        }

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default();

        info!(
            elapsed_ms = elapsed.as_millis() as u64,
            content_chars = content.len(),
            "model response received"
        );

        Ok(Completion {
            content,
            model: parsed.model.unwrap_or_else(|| model.to_string()),
            usage: parsed.usage,
            elapsed,
        })
    }
}

impl ModelBackend for OpenRouterBackend {
    fn id(&self) -> &str {
        "openrouter"
    }

    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<Completion>> {
        Box::pin(async move {
            let model = request.model.clone();
            let started = Instant::now();
            let result = self.call(request).await;
            let outcome = match &result {
                Ok(_) => "success",
                Err(e) => e.label(),
            };
            metrics::counter!("llm_calls_total", "model" => model.clone(), "outcome" => outcome)
                .increment(1);
            metrics::histogram!("llm_call_duration_seconds", "model" => model)
                .record(started.elapsed().as_secs_f64());
            result
        })
    }
}

fn transport_error(model: &str, e: reqwest::Error) -> CallError {
    if e.is_timeout() {
        CallError::Timeout {
            model: model.to_string(),
        }
    } else {
        CallError::Transport {
            model: model.to_string(),
            message: e.to_string(),
        }
    }
}

fn embedded_status(code: Option<&serde_json::Value>) -> Option<u16> {
    match code? {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
