//! Throttle table shared by every dispatch path
//!
//! Presence of an unexpired reset timestamp means the model is throttled.
//! Expired entries are evicted lazily on read, so there is no background
//! sweeper: `is_limited` is both the query and the cleanup.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, info, warn};

/// Throttle window applied when the provider gives no reset hint.
pub const DEFAULT_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Per-model throttle state for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub limited: bool,
    /// Reset time as epoch milliseconds, when throttled.
    pub reset_at_ms: Option<u64>,
    pub remaining_ms: u64,
}

/// Model id -> reset time.
pub struct RateLimitTracker {
    entries: Mutex<HashMap<String, SystemTime>>,
    default_window: Duration,
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_LIMIT_WINDOW)
    }

    pub fn with_window(default_window: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_window,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, SystemTime>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `model` throttled until `reset_at`, or for the default window.
    pub fn mark_limited(&self, model: &str, reset_at: Option<SystemTime>) {
        let reset_at = reset_at.unwrap_or_else(|| SystemTime::now() + self.default_window);
        let remaining_secs = reset_at
            .duration_since(SystemTime::now())
            .unwrap_or_default()
            .as_secs();
        warn!(model, remaining_secs, "model marked as rate limited");
        metrics::counter!("llm_rate_limits_total", "model" => model.to_string()).increment(1);
        self.entries().insert(model.to_string(), reset_at);
    }

    /// Whether `model` is throttled right now. Evicts the entry once expired.
    pub fn is_limited(&self, model: &str) -> bool {
        let mut entries = self.entries();
        match entries.get(model) {
            None => false,
            Some(reset_at) if SystemTime::now() >= *reset_at => {
                debug!(model, "rate limit expired");
                entries.remove(model);
                false
            }
            Some(_) => true,
        }
    }

    /// Drop any throttle entry for `model`.
    pub fn clear(&self, model: &str) {
        if self.entries().remove(model).is_some() {
            info!(model, "rate limit cleared");
        }
    }

    /// Ids currently throttled, sorted. Expired entries are evicted.
    pub fn limited_models(&self) -> Vec<String> {
        let now = SystemTime::now();
        let mut entries = self.entries();
        entries.retain(|_, reset_at| *reset_at > now);
        let mut ids: Vec<String> = entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Status for each of `models`, including ones that are not throttled.
    pub fn status<'a, I>(&self, models: I) -> BTreeMap<String, RateLimitStatus>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let now = SystemTime::now();
        let entries = self.entries();
        models
            .into_iter()
            .map(|model| {
                let status = match entries.get(model) {
                    Some(reset_at) if *reset_at > now => RateLimitStatus {
                        limited: true,
                        reset_at_ms: Some(epoch_millis(*reset_at)),
                        remaining_ms: reset_at
                            .duration_since(now)
                            .unwrap_or_default()
                            .as_millis() as u64,
                    },
                    _ => RateLimitStatus {
                        limited: false,
                        reset_at_ms: None,
                        remaining_ms: 0,
                    },
                };
                (model.to_string(), status)
            })
            .collect()
    }
}

fn epoch_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_is_not_limited() {
        let tracker = RateLimitTracker::new();
        assert!(!tracker.is_limited("a"));
    }

    #[test]
    fn mark_limited_defaults_to_window() {
        let tracker = RateLimitTracker::new();
        tracker.mark_limited("a", None);
        assert!(tracker.is_limited("a"));

        let status = tracker.status(["a"]);
        let remaining = status["a"].remaining_ms;
        assert!(status["a"].limited);
        assert!(
            remaining > 55_000 && remaining <= 60_000,
            "remaining should be close to 60s, got {remaining}"
        );
    }

    #[test]
    fn clear_unlimits_immediately() {
        let tracker = RateLimitTracker::new();
        tracker.mark_limited("a", None);
        tracker.clear("a");
        assert!(!tracker.is_limited("a"));
    }

    #[test]
    fn expired_entry_is_evicted_on_read() {
        let tracker = RateLimitTracker::new();
        tracker.mark_limited("a", Some(SystemTime::now() - Duration::from_secs(1)));
        assert!(!tracker.is_limited("a"));
        assert!(tracker.entries().get("a").is_none(), "entry should be evicted");
    }

    #[test]
    fn short_window_expires_without_clear() {
        let tracker = RateLimitTracker::with_window(Duration::from_millis(20));
        tracker.mark_limited("a", None);
        assert!(tracker.is_limited("a"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!tracker.is_limited("a"));
    }

    #[test]
    fn status_covers_unlimited_models() {
        let tracker = RateLimitTracker::new();
        tracker.mark_limited("a", None);
        let status = tracker.status(["a", "b"]);
        assert_eq!(status.len(), 2);
        assert!(status["a"].reset_at_ms.is_some());
        assert_eq!(
            status["b"],
            RateLimitStatus {
                limited: false,
                reset_at_ms: None,
                remaining_ms: 0
            }
        );
    }

    #[test]
    fn limited_models_skips_expired() {
        let tracker = RateLimitTracker::new();
        tracker.mark_limited("b", None);
        tracker.mark_limited("a", None);
        tracker.mark_limited("old", Some(SystemTime::now() - Duration::from_secs(5)));
        assert_eq!(tracker.limited_models(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn mark_limited_records_counter() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        RateLimitTracker::new().mark_limited("qwen/qwen3-4b:free", None);

        let output = handle.render();
        assert!(output.contains("llm_rate_limits_total"));
        assert!(output.contains("model=\"qwen/qwen3-4b:free\""));
    }
}
