//! Concurrent dispatch with priority-ordered result selection
//!
//! Every selected call runs to completion (or its timeout) before a winner is
//! chosen, and the winner is the earliest success in selection order, not the
//! first to finish.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use model_pool::ModelPool;
use provider::{CallError, Completion, CompletionRequest, ModelBackend};
use tracing::{info, instrument, warn};

use crate::error::{DispatchError, ModelFailure, Result};

#[derive(Clone)]
pub struct RaceOrchestrator {
    pool: Arc<ModelPool>,
    backend: Arc<dyn ModelBackend>,
}

impl RaceOrchestrator {
    pub fn new(pool: Arc<ModelPool>, backend: Arc<dyn ModelBackend>) -> Self {
        Self { pool, backend }
    }

    /// First `width` unthrottled registry models, in registry order.
    pub fn select_models(&self, width: usize) -> Vec<String> {
        self.pool
            .registry()
            .models()
            .iter()
            .map(|m| m.id.as_str())
            .filter(|id| !self.pool.rate_limits().is_limited(id))
            .take(width)
            .map(str::to_string)
            .collect()
    }

    #[instrument(skip_all, fields(width = width, timeout_secs = per_call_timeout.as_secs()))]
    pub async fn race(
        &self,
        request: CompletionRequest,
        width: usize,
        per_call_timeout: Duration,
    ) -> Result<Completion> {
        let models = self.select_models(width);
        if models.is_empty() {
            warn!("no unthrottled models to race");
            return Err(DispatchError::AllModelsLimited);
        }
        info!(models = ?models, "racing models");

        let calls = models.iter().map(|model| {
            let request = request.for_model(model);
            async move {
                match tokio::time::timeout(per_call_timeout, self.backend.complete(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(CallError::Timeout {
                        model: model.clone(),
                    }),
                }
            }
        });
        let outcomes = join_all(calls).await;

        let mut failures = Vec::new();
        let mut winner = None;
        for (model, outcome) in models.iter().zip(outcomes) {
            match outcome {
                Ok(completion) if winner.is_none() => winner = Some(completion),
                Ok(_) => {}
                Err(e) => {
                    warn!(model = %model, error = %e, "race participant failed");
                    failures.push(ModelFailure {
                        model: model.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        match winner {
            Some(completion) => {
                info!(model = %completion.model, "race won");
                Ok(completion)
            }
            None => Err(DispatchError::AllModelsFailed { failures }),
        }
    }
}
