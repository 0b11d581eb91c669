//! Process-wide dispatch context

use common::Secret;
use tracing::info;

use crate::credentials::CredentialPool;
use crate::rate_limit::RateLimitTracker;
use crate::registry::Registry;

/// Registry, throttle table and credentials, shared as `Arc<ModelPool>`.
pub struct ModelPool {
    registry: Registry,
    rate_limits: RateLimitTracker,
    credentials: CredentialPool,
}

impl ModelPool {
    pub fn new(registry: Registry, keys: Vec<Secret<String>>) -> Self {
        info!(
            models = registry.models().len(),
            fallback_chain = registry.fallback_chain().len(),
            "model pool initialized"
        );
        Self {
            registry,
            rate_limits: RateLimitTracker::new(),
            credentials: CredentialPool::new(keys),
        }
    }

    /// Use a custom throttle tracker (e.g. a shorter default window).
    pub fn with_rate_limits(mut self, rate_limits: RateLimitTracker) -> Self {
        self.rate_limits = rate_limits;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn rate_limits(&self) -> &RateLimitTracker {
        &self.rate_limits
    }

    pub fn credentials(&self) -> &CredentialPool {
        &self.credentials
    }

    /// Health summary for the health endpoint.
    ///
    /// `unhealthy` without keys, `degraded` when every fallback-chain model is
    /// throttled, otherwise `healthy`.
    pub fn health(&self) -> serde_json::Value {
        let limited = self.rate_limits.limited_models();
        let chain = self.registry.fallback_chain();
        let chain_available = chain
            .iter()
            .filter(|id| !limited.iter().any(|l| l == *id))
            .count();

        let status = if self.credentials.is_empty() {
            "unhealthy"
        } else if chain_available == 0 && !chain.is_empty() {
            "degraded"
        } else {
            "healthy"
        };

        let keys = self.credentials.info();
        serde_json::json!({
            "status": status,
            "keys_total": keys.total_keys,
            "key_index": keys.current_index,
            "models_total": self.registry.models().len(),
            "fallback_chain_available": chain_available,
            "rate_limited_models": limited,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<Secret<String>> {
        (0..n).map(|i| Secret::new(format!("k{i}"))).collect()
    }

    #[test]
    fn healthy_with_keys_and_free_models() {
        let pool = ModelPool::new(Registry::builtin(), keys(1));
        let health = pool.health();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["keys_total"], 1);
        assert_eq!(health["fallback_chain_available"], 8);
    }

    #[test]
    fn unhealthy_without_keys() {
        let pool = ModelPool::new(Registry::builtin(), vec![]);
        assert_eq!(pool.health()["status"], "unhealthy");
    }

    #[test]
    fn degraded_when_whole_chain_throttled() {
        let registry = Registry::builtin().with_fallback_chain(vec!["a".into(), "b".into()]);
        let pool = ModelPool::new(registry, keys(2));
        pool.rate_limits().mark_limited("a", None);
        assert_eq!(pool.health()["status"], "healthy");
        pool.rate_limits().mark_limited("b", None);

        let health = pool.health();
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["rate_limited_models"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn health_never_contains_key_material() {
        let pool = ModelPool::new(Registry::builtin(), keys(2));
        let rendered = pool.health().to_string();
        assert!(!rendered.contains("k0"));
        assert!(!rendered.contains("k1"));
    }
}
