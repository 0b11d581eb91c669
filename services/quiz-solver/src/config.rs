//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys and the quiz secret are never stored in the TOML: keys come from
//! the OPENROUTER_API_KEY* env vars or `api_key_file`, the quiz secret from
//! QUIZ_SECRET or `quiz_secret_file`.

use common::Secret;
use model_pool::keys_from_env;
use orchestrator::HybridSettings;
use provider::OpenRouterSettings;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub openrouter: OpenRouterConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub solver: SolverConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

/// HTTP control surface settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds a finished session stays readable before it is dropped
    #[serde(default = "default_finished_session_ttl")]
    pub finished_session_ttl_secs: u64,
    /// Path to a file containing the quiz secret (alternative to QUIZ_SECRET)
    #[serde(default)]
    pub quiz_secret_file: Option<PathBuf>,
    #[serde(skip)]
    pub quiz_secret: Option<Secret<String>>,
}

/// Model provider settings
#[derive(Debug, Deserialize)]
pub struct OpenRouterConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_referer")]
    pub referer: String,
    #[serde(default = "default_title")]
    pub title: String,
    /// File with one API key per line, used when no OPENROUTER_API_KEY* is set
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
    #[serde(skip)]
    pub api_keys: Vec<Secret<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelsConfig {
    /// Replaces the built-in fallback chain when set.
    #[serde(default)]
    pub fallback_chain: Option<Vec<String>>,
}

/// Retry, wait and dispatch timing for every session
#[derive(Debug, Clone, Deserialize)]
pub struct SolverConfig {
    #[serde(default = "default_retry_budget")]
    pub retry_budget_secs: u64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_exhausted_poll_interval")]
    pub exhausted_poll_interval_ms: u64,
    #[serde(default = "default_advance_delay")]
    pub advance_delay_ms: u64,
    #[serde(default = "default_max_page_images")]
    pub max_page_images: usize,
    #[serde(default = "default_max_prompt_images")]
    pub max_prompt_images: usize,
    #[serde(default = "default_primary_deadline")]
    pub primary_deadline_secs: u64,
    #[serde(default = "default_race_width")]
    pub race_width: usize,
    #[serde(default = "default_race_timeout")]
    pub race_timeout_secs: u64,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

/// Generated-code execution settings
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
}

fn default_max_connections() -> usize {
    1000
}

fn default_finished_session_ttl() -> u64 {
    300
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_referer() -> String {
    "http://localhost:3000".to_string()
}

fn default_title() -> String {
    "LLM Quiz Solver".to_string()
}

fn default_retry_budget() -> u64 {
    180
}

fn default_retry_delay() -> u64 {
    2000
}

fn default_poll_interval() -> u64 {
    500
}

fn default_exhausted_poll_interval() -> u64 {
    1000
}

fn default_advance_delay() -> u64 {
    1000
}

fn default_max_page_images() -> usize {
    5
}

fn default_max_prompt_images() -> usize {
    3
}

fn default_primary_deadline() -> u64 {
    15
}

fn default_race_width() -> usize {
    3
}

fn default_race_timeout() -> u64 {
    20
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("temp")
}

fn default_true() -> bool {
    true
}

fn default_interpreter() -> String {
    "python".to_string()
}

fn default_sandbox_timeout() -> u64 {
    30
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_request_timeout(),
            referer: default_referer(),
            title: default_title(),
            api_key_file: None,
            api_keys: Vec::new(),
        }
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            retry_budget_secs: default_retry_budget(),
            retry_delay_ms: default_retry_delay(),
            poll_interval_ms: default_poll_interval(),
            exhausted_poll_interval_ms: default_exhausted_poll_interval(),
            advance_delay_ms: default_advance_delay(),
            max_page_images: default_max_page_images(),
            max_prompt_images: default_max_prompt_images(),
            primary_deadline_secs: default_primary_deadline(),
            race_width: default_race_width(),
            race_timeout_secs: default_race_timeout(),
            fetch_timeout_secs: default_fetch_timeout(),
            download_dir: default_download_dir(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interpreter: default_interpreter(),
            timeout_secs: default_sandbox_timeout(),
        }
    }
}

impl OpenRouterConfig {
    pub fn settings(&self) -> OpenRouterSettings {
        OpenRouterSettings {
            base_url: self.base_url.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            referer: self.referer.clone(),
            title: self.title.clone(),
        }
    }
}

impl SolverConfig {
    pub fn hybrid_settings(&self) -> HybridSettings {
        HybridSettings {
            primary_deadline: Duration::from_secs(self.primary_deadline_secs),
            race_width: self.race_width,
            race_timeout: Duration::from_secs(self.race_timeout_secs),
        }
    }

    fn validate(&self) -> common::Result<()> {
        let non_zero = [
            ("solver.retry_budget_secs", self.retry_budget_secs),
            ("solver.poll_interval_ms", self.poll_interval_ms),
            ("solver.exhausted_poll_interval_ms", self.exhausted_poll_interval_ms),
            ("solver.primary_deadline_secs", self.primary_deadline_secs),
            ("solver.race_timeout_secs", self.race_timeout_secs),
            ("solver.fetch_timeout_secs", self.fetch_timeout_secs),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(common::Error::invalid(field, "must be greater than 0"));
            }
        }
        if self.race_width == 0 {
            return Err(common::Error::invalid(
                "solver.race_width",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// API key resolution order:
    /// 1. OPENROUTER_API_KEY, OPENROUTER_API_KEY_2..4 env vars
    /// 2. api_key_file path from config, one key per line
    ///
    /// Quiz secret resolution order:
    /// 1. QUIZ_SECRET env var
    /// 2. quiz_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        config.openrouter.api_keys = keys_from_env();
        if config.openrouter.api_keys.is_empty()
            && let Some(ref key_file) = config.openrouter.api_key_file
        {
            let contents = read_secret_file("api_key_file", key_file)?;
            config.openrouter.api_keys = contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(|line| Secret::new(line.to_owned()))
                .collect();
        }

        if let Ok(secret) = std::env::var("QUIZ_SECRET") {
            config.server.quiz_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = config.server.quiz_secret_file {
            let secret = read_secret_file("quiz_secret_file", secret_file)?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                config.server.quiz_secret = Some(Secret::new(secret));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.openrouter.base_url.starts_with("http://")
            && !self.openrouter.base_url.starts_with("https://")
        {
            return Err(common::Error::invalid(
                "openrouter.base_url",
                format!(
                    "must start with http:// or https://, got: {}",
                    self.openrouter.base_url
                ),
            ));
        }

        if self.openrouter.timeout_secs == 0 {
            return Err(common::Error::invalid(
                "openrouter.timeout_secs",
                "must be greater than 0",
            ));
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::invalid(
                "server.max_connections",
                "must be greater than 0",
            ));
        }

        if self.sandbox.timeout_secs == 0 {
            return Err(common::Error::invalid(
                "sandbox.timeout_secs",
                "must be greater than 0",
            ));
        }

        if let Some(chain) = &self.models.fallback_chain {
            if chain.is_empty() {
                return Err(common::Error::invalid(
                    "models.fallback_chain",
                    "must not be empty",
                ));
            }
            if chain.iter().any(|id| id.trim().is_empty()) {
                return Err(common::Error::invalid(
                    "models.fallback_chain",
                    "must not contain blank model ids",
                ));
            }
        }

        self.solver.validate()
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("llm-quiz-solver.toml")
    }
}

fn read_secret_file(field: &str, path: &Path) -> common::Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        common::Error::SecretSource(format!("failed to read {field} {}: {e}", path.display()))
    })
}
