//! Sequential fallback across the preference chain
//!
//! Candidates are tried strictly one after another. Failure kinds are not
//! distinguished: any error moves on to the next candidate. When the whole
//! chain fails the active API key is rotated and the chain is walked again,
//! at most once per configured key.

use std::sync::Arc;

use model_pool::ModelPool;
use provider::{Completion, CompletionRequest, ModelBackend};
use tracing::{debug, info, instrument, warn};

use crate::DispatchObserver;
use crate::error::{DispatchError, Result};

/// `[requested] + chain`, with `requested` and duplicates removed from the
/// chain and order otherwise preserved.
pub fn attempt_order(requested: &str, chain: &[String]) -> Vec<String> {
    let mut order: Vec<String> = Vec::with_capacity(chain.len() + 1);
    for id in std::iter::once(requested).chain(chain.iter().map(String::as_str)) {
        if !order.iter().any(|seen| seen == id) {
            order.push(id.to_string());
        }
    }
    order
}

#[derive(Clone)]
pub struct FallbackOrchestrator {
    pool: Arc<ModelPool>,
    backend: Arc<dyn ModelBackend>,
}

impl FallbackOrchestrator {
    pub fn new(pool: Arc<ModelPool>, backend: Arc<dyn ModelBackend>) -> Self {
        Self { pool, backend }
    }

    pub fn pool(&self) -> &Arc<ModelPool> {
        &self.pool
    }

    /// Walk the attempt order for `request.model` until one model answers.
    #[instrument(skip_all, fields(requested = %request.model))]
    pub async fn dispatch(
        &self,
        request: CompletionRequest,
        observer: Arc<dyn DispatchObserver>,
    ) -> Result<Completion> {
        let requested = request.model.clone();
        let order = attempt_order(&requested, self.pool.registry().fallback_chain());
        let max_retries = self.pool.credentials().len();
        let mut retry_count = 0;

        loop {
            for model in &order {
                if self.pool.rate_limits().is_limited(model) {
                    debug!(model = %model, "skipping throttled model");
                    continue;
                }
                match self.backend.complete(request.for_model(model)).await {
                    Ok(completion) => {
                        if *model != requested {
                            info!(from = %requested, to = %model, "switched model after fallback");
                            observer.on_model_switch(&requested, model);
                        }
                        return Ok(completion);
                    }
                    Err(e) => {
                        warn!(model = %model, error = %e, "model call failed, trying next");
                    }
                }
            }

            // Rotation happens before the retry budget is checked.
            let rotated = self.pool.credentials().rotate_next();
            if rotated && retry_count < max_retries {
                retry_count += 1;
                info!(retry_count, "every model failed, retrying chain with next API key");
                continue;
            }

            warn!(retry_count, "every model failed under every API key");
            observer.on_all_exhausted();
            return Err(DispatchError::AllModelsExhausted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoopObserver;
    use crate::testing::{FakeBackend, RecordingObserver, Reply, pool};
    use provider::CallError;
    use std::time::Duration;

    fn chain(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn requested_model_moves_to_front() {
        assert_eq!(attempt_order("b", &chain(&["a", "b", "c"])), chain(&["b", "a", "c"]));
    }

    #[test]
    fn attempt_order_has_no_duplicates() {
        assert_eq!(
            attempt_order("x", &chain(&["a", "x", "a", "b"])),
            chain(&["x", "a", "b"])
        );
    }

    #[tokio::test]
    async fn tries_b_then_a_then_c() {
        let pool = pool(&["a", "b", "c"], 1);
        let backend = FakeBackend::new();
        backend.reply("c", Reply::Ok(Duration::ZERO));
        let orchestrator = FallbackOrchestrator::new(pool, backend.clone());
        let observer = Arc::new(RecordingObserver::default());

        let completion = orchestrator
            .dispatch(CompletionRequest::new("b", "q"), observer.clone())
            .await
            .unwrap();

        assert_eq!(completion.model, "c");
        assert_eq!(backend.calls(), chain(&["b", "a", "c"]));
        assert_eq!(
            *observer.switches.lock().unwrap(),
            vec![("b".to_string(), "c".to_string())]
        );
    }

    #[tokio::test]
    async fn first_success_stops_the_walk() {
        let pool = pool(&["a", "b"], 1);
        let backend = FakeBackend::new();
        backend.reply("a", Reply::Ok(Duration::ZERO));
        backend.reply("b", Reply::Ok(Duration::ZERO));
        let orchestrator = FallbackOrchestrator::new(pool, backend.clone());
        let observer = Arc::new(RecordingObserver::default());

        orchestrator
            .dispatch(CompletionRequest::new("a", "q"), observer.clone())
            .await
            .unwrap();

        assert_eq!(backend.calls(), chain(&["a"]));
        assert!(observer.switches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn throttled_models_are_skipped() {
        let pool = pool(&["a", "b", "c"], 1);
        pool.rate_limits().mark_limited("a", None);
        let backend = FakeBackend::new();
        backend.reply("b", Reply::Ok(Duration::ZERO));
        let orchestrator = FallbackOrchestrator::new(pool, backend.clone());

        let completion = orchestrator
            .dispatch(CompletionRequest::new("a", "q"), Arc::new(NoopObserver))
            .await
            .unwrap();

        assert_eq!(completion.model, "b");
        assert_eq!(backend.calls(), chain(&["b"]));
    }

    #[tokio::test]
    async fn single_key_exhaustion_notifies_once() {
        let pool = pool(&["a", "b"], 1);
        let backend = FakeBackend::new();
        backend.reply(
            "a",
            Reply::Fail(Duration::ZERO, CallError::RateLimited { model: "a".into() }),
        );
        let orchestrator = FallbackOrchestrator::new(pool, backend.clone());
        let observer = Arc::new(RecordingObserver::default());

        let err = orchestrator
            .dispatch(CompletionRequest::new("a", "q"), observer.clone())
            .await
            .unwrap_err();

        assert_eq!(err, DispatchError::AllModelsExhausted);
        assert_eq!(backend.calls(), chain(&["a", "b"]));
        assert_eq!(*observer.exhausted.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn rotation_walks_chain_once_per_key_plus_one() {
        // Two keys: initial walk, one retry per key, then exhausted.
        let pool = pool(&["a", "b"], 2);
        let backend = FakeBackend::new();
        let orchestrator = FallbackOrchestrator::new(pool.clone(), backend.clone());

        let err = orchestrator
            .dispatch(CompletionRequest::new("a", "q"), Arc::new(NoopObserver))
            .await
            .unwrap_err();

        assert_eq!(err, DispatchError::AllModelsExhausted);
        assert_eq!(backend.calls().len(), 6);
        // Three rotations over two keys.
        assert_eq!(pool.credentials().current_index(), 1);
    }

    #[tokio::test]
    async fn rotation_recovers_when_next_key_works() {
        let pool = pool(&["a"], 2);
        let backend = FakeBackend::new();
        backend.reply("a", Reply::FailWithKey("key-0".into()));
        backend.watch_keys(pool.clone());
        let orchestrator = FallbackOrchestrator::new(pool.clone(), backend.clone());

        let completion = orchestrator
            .dispatch(CompletionRequest::new("a", "q"), Arc::new(NoopObserver))
            .await
            .unwrap();

        assert_eq!(completion.model, "a");
        assert_eq!(backend.calls(), chain(&["a", "a"]));
        assert_eq!(pool.credentials().current_index(), 1);
    }
}
