//! Model registry and fallback preference chain
//!
//! The registry is fixed at startup. Its order matters: the race path picks
//! the first N non-throttled entries in registry order, while the fallback
//! path walks the (separately ordered) preference chain.

use serde::Serialize;

/// Model used when a session does not request one.
pub const DEFAULT_MODEL: &str = "google/gemini-2.0-flash-exp:free";

/// Built-in registry: (id, display name, provider).
const BUILTIN_MODELS: &[(&str, &str, &str)] = &[
    ("google/gemini-2.0-flash-exp:free", "Gemini 2.0 Flash", "Google"),
    ("qwen/qwen3-235b-a22b:free", "Qwen3 235B", "Qwen"),
    ("meta-llama/llama-3.3-70b-instruct:free", "Llama 3.3 70B", "Meta"),
    ("openai/gpt-oss-120b:free", "GPT OSS 120B", "OpenAI"),
    ("openai/gpt-oss-20b:free", "GPT OSS 20B", "OpenAI"),
    ("qwen/qwen3-coder:free", "Qwen3 Coder", "Qwen"),
    ("qwen/qwen3-4b:free", "Qwen3 4B", "Qwen"),
    ("mistralai/mistral-7b-instruct:free", "Mistral 7B", "Mistral"),
    ("mistralai/devstral-2512:free", "Devstral 2512", "Mistral"),
    ("mistralai/mistral-small-3.1-24b-instruct:free", "Mistral Small 3.1", "Mistral"),
    ("mistralai/mistral-small-3.2-24b-instruct:free", "Mistral Small 3.2", "Mistral"),
    ("google/gemma-3-27b-it:free", "Gemma 3 27B", "Google"),
    ("google/gemma-3-12b-it:free", "Gemma 3 12B", "Google"),
    ("google/gemma-3-4b-it:free", "Gemma 3 4B", "Google"),
    ("google/gemma-3n-e4b-it:free", "Gemma 3N E4B", "Google"),
    ("nvidia/nemotron-nano-12b-v2-vl:free", "Nemotron 12B VL", "NVIDIA"),
    ("nvidia/nemotron-nano-9b-v2:free", "Nemotron 9B", "NVIDIA"),
    ("moonshotai/kimi-k2:free", "Kimi K2", "Moonshot"),
    ("meituan/longcat-flash-chat:free", "LongCat Flash Chat", "Meituan"),
    ("amazon/nova-2-lite-v1:free", "Nova 2 Lite", "Amazon"),
    ("arcee-ai/trinity-mini:free", "Trinity Mini", "Arcee AI"),
    ("nex-agi/deepseek-v3.1-nex-n1:free", "DeepSeek V3.1", "Nex AGI"),
    ("tngtech/deepseek-r1t2-chimera:free", "DeepSeek R1T2 Chimera", "TNG Tech"),
    ("tngtech/deepseek-r1t-chimera:free", "DeepSeek R1T Chimera", "TNG Tech"),
    ("allenai/olmo-3-32b-think:free", "OLMo 3 32B Think", "Allen AI"),
    ("kwaipilot/kat-coder-pro:free", "KAT Coder Pro", "Kwai Pilot"),
    ("z-ai/glm-4.5-air:free", "GLM 4.5 Air", "Z-AI"),
    ("meta-llama/llama-3.2-3b-instruct:free", "Llama 3.2 3B", "Meta"),
    ("nousresearch/hermes-3-llama-3.1-405b:free", "Hermes 3 Llama 405B", "Nous Research"),
    (
        "cognitivecomputations/dolphin-mistral-24b-venice-edition:free",
        "Dolphin Mistral 24B Venice",
        "Cognitive Computations",
    ),
];

/// Built-in fallback chain, most preferred first.
const BUILTIN_FALLBACK_CHAIN: &[&str] = &[
    "google/gemini-2.0-flash-exp:free",
    "qwen/qwen3-235b-a22b:free",
    "mistralai/devstral-2512:free",
    "meta-llama/llama-3.3-70b-instruct:free",
    "amazon/nova-2-lite-v1:free",
    "google/gemma-3-27b-it:free",
    "openai/gpt-oss-120b:free",
    "openai/gpt-oss-20b:free",
];

/// One addressable model backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    pub provider: String,
    #[serde(rename = "default")]
    pub is_default: bool,
}

/// Ordered model list plus the fallback preference chain.
#[derive(Debug, Clone)]
pub struct Registry {
    models: Vec<ModelDescriptor>,
    fallback_chain: Vec<String>,
}

impl Registry {
    /// The built-in OpenRouter free-tier registry.
    pub fn builtin() -> Self {
        let models = BUILTIN_MODELS
            .iter()
            .map(|(id, name, provider)| ModelDescriptor {
                id: (*id).to_string(),
                name: (*name).to_string(),
                provider: (*provider).to_string(),
                is_default: *id == DEFAULT_MODEL,
            })
            .collect();
        let fallback_chain = BUILTIN_FALLBACK_CHAIN
            .iter()
            .map(|id| (*id).to_string())
            .collect();
        Self {
            models,
            fallback_chain,
        }
    }

    pub fn new(models: Vec<ModelDescriptor>, fallback_chain: Vec<String>) -> Self {
        Self {
            models,
            fallback_chain,
        }
    }

    /// Replace the fallback chain, keeping the model list.
    pub fn with_fallback_chain(mut self, chain: Vec<String>) -> Self {
        self.fallback_chain = chain;
        self
    }

    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    pub fn fallback_chain(&self) -> &[String] {
        &self.fallback_chain
    }

    /// The entry flagged as default, else the first model, else [`DEFAULT_MODEL`].
    pub fn default_model(&self) -> &str {
        self.models
            .iter()
            .find(|m| m.is_default)
            .or_else(|| self.models.first())
            .map(|m| m.id.as_str())
            .unwrap_or(DEFAULT_MODEL)
    }

    /// Whether `id` is known, either as a registry entry or a chain member.
    pub fn contains(&self, id: &str) -> bool {
        self.models.iter().any(|m| m.id == id) || self.fallback_chain.iter().any(|m| m == id)
    }
}
