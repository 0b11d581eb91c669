//! Fallback with deadline escalation to a race
//!
//! The primary fallback walk runs on its own task so it keeps going after the
//! deadline. When the deadline passes first, a race over alternate models
//! starts alongside it:
//!
//! - race succeeds: an already-finished successful primary wins, otherwise
//!   the race result is used and the primary is left to finish unobserved
//! - race fails: the primary is awaited with no further deadline

use std::sync::Arc;
use std::time::Duration;

use provider::{Completion, CompletionRequest};
use tokio::task::JoinError;
use tracing::{info, instrument, warn};

use crate::DispatchObserver;
use crate::error::{DispatchError, Result};
use crate::fallback::FallbackOrchestrator;
use crate::race::RaceOrchestrator;

#[derive(Debug, Clone)]
pub struct HybridSettings {
    /// How long the primary fallback walk runs alone.
    pub primary_deadline: Duration,
    pub race_width: usize,
    pub race_timeout: Duration,
}

impl Default for HybridSettings {
    fn default() -> Self {
        Self {
            primary_deadline: Duration::from_secs(15),
            race_width: 3,
            race_timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Clone)]
pub struct HybridDispatcher {
    fallback: FallbackOrchestrator,
    race: RaceOrchestrator,
    settings: HybridSettings,
}

impl HybridDispatcher {
    pub fn new(fallback: FallbackOrchestrator, race: RaceOrchestrator, settings: HybridSettings) -> Self {
        Self {
            fallback,
            race,
            settings,
        }
    }

    /// The sequential strategy on its own, for callers that never race.
    pub fn fallback(&self) -> &FallbackOrchestrator {
        &self.fallback
    }

    pub fn settings(&self) -> &HybridSettings {
        &self.settings
    }

    #[instrument(skip_all, fields(requested = %request.model))]
    pub async fn dispatch(
        &self,
        request: CompletionRequest,
        observer: Arc<dyn DispatchObserver>,
    ) -> Result<Completion> {
        let fallback = self.fallback.clone();
        let primary_request = request.clone();
        let mut primary =
            tokio::spawn(async move { fallback.dispatch(primary_request, observer).await });

        if let Ok(joined) = tokio::time::timeout(self.settings.primary_deadline, &mut primary).await {
            return flatten(joined);
        }

        info!(
            deadline_secs = self.settings.primary_deadline.as_secs(),
            "primary still running past deadline, starting race"
        );

        match self
            .race
            .race(request, self.settings.race_width, self.settings.race_timeout)
            .await
        {
            Ok(raced) => {
                if primary.is_finished()
                    && let Ok(Ok(completion)) = (&mut primary).await
                {
                    info!(model = %completion.model, "primary finished during race, using it");
                    return Ok(completion);
                }
                // Dropping the handle detaches the primary; its result is discarded.
                Ok(raced)
            }
            Err(e) => {
                warn!(error = %e, "race failed, waiting for primary");
                flatten(primary.await)
            }
        }
    }
}

fn flatten(joined: std::result::Result<Result<Completion>, JoinError>) -> Result<Completion> {
    joined.map_err(|e| DispatchError::TaskFailed(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoopObserver;
    use crate::testing::{FakeBackend, Reply, pool};
    use provider::CallError;

    fn dispatcher(models: &[&str], backend: Arc<FakeBackend>) -> HybridDispatcher {
        let pool = pool(models, 1);
        HybridDispatcher::new(
            FallbackOrchestrator::new(pool.clone(), backend.clone()),
            RaceOrchestrator::new(pool, backend),
            HybridSettings::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn fast_primary_never_races() {
        let backend = FakeBackend::new();
        backend.reply("a", Reply::Ok(Duration::from_secs(2)));
        let hybrid = dispatcher(&["a", "b", "c"], backend.clone());

        let completion = hybrid
            .dispatch(CompletionRequest::new("a", "q"), Arc::new(NoopObserver))
            .await
            .unwrap();

        assert_eq!(completion.model, "a");
        assert_eq!(backend.calls(), vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_primary_escalates_to_race() {
        let backend = FakeBackend::new();
        backend.reply("a", Reply::Ok(Duration::from_secs(120)));
        backend.reply("b", Reply::Ok(Duration::from_secs(1)));
        let hybrid = dispatcher(&["a", "b", "c"], backend.clone());

        let started = tokio::time::Instant::now();
        let completion = hybrid
            .dispatch(CompletionRequest::new("a", "q"), Arc::new(NoopObserver))
            .await
            .unwrap();

        assert_eq!(completion.model, "b");
        // Deadline plus the race, which waits out the slow participant's timeout.
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_secs(35) && elapsed < Duration::from_secs(36),
            "elapsed {elapsed:?}"
        );
        assert_eq!(backend.calls().len(), 4, "primary plus three racers");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_race_waits_for_primary() {
        let backend = FakeBackend::new();
        backend.reply("a", Reply::Ok(Duration::from_secs(40)));
        backend.reply(
            "b",
            Reply::Fail(Duration::ZERO, CallError::RateLimited { model: "b".into() }),
        );
        let hybrid = dispatcher(&["a", "b", "c"], backend.clone());

        let started = tokio::time::Instant::now();
        let completion = hybrid
            .dispatch(CompletionRequest::new("a", "q"), Arc::new(NoopObserver))
            .await
            .unwrap();

        assert_eq!(completion.model, "a");
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_secs(40) && elapsed < Duration::from_secs(41),
            "elapsed {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn finished_primary_beats_race_result() {
        let backend = FakeBackend::new();
        // "x" is the requested model but not one of the racers.
        backend.reply("x", Reply::Ok(Duration::from_secs(16)));
        backend.reply("a", Reply::Ok(Duration::from_secs(10)));
        let hybrid = dispatcher(&["a", "b", "c", "x"], backend);

        let completion = hybrid
            .dispatch(CompletionRequest::new("x", "q"), Arc::new(NoopObserver))
            .await
            .unwrap();

        assert_eq!(completion.model, "x");
    }

    #[tokio::test(start_paused = true)]
    async fn primary_exhaustion_is_returned_when_race_fails() {
        let backend = FakeBackend::new();
        for model in ["a", "b", "c"] {
            backend.reply(
                model,
                Reply::Fail(Duration::from_secs(6), CallError::Timeout { model: model.into() }),
            );
        }
        let hybrid = dispatcher(&["a", "b", "c"], backend);

        let err = hybrid
            .dispatch(CompletionRequest::new("a", "q"), Arc::new(NoopObserver))
            .await
            .unwrap_err();

        assert_eq!(err, DispatchError::AllModelsExhausted);
    }
}
