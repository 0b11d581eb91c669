//! Error types for multi-model dispatch

use std::fmt;

/// One participant's failure in a race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFailure {
    pub model: String,
    pub message: String,
}

impl fmt::Display for ModelFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.model, self.message)
    }
}

/// Why no model produced an answer.
///
/// All variants escalate to the driver; none is retried here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("all models exhausted across every API key")]
    AllModelsExhausted,

    #[error("all models are rate limited")]
    AllModelsLimited,

    #[error("all models failed: {}", join_failures(.failures))]
    AllModelsFailed { failures: Vec<ModelFailure> },

    #[error("dispatch task failed: {0}")]
    TaskFailed(String),
}

fn join_failures(failures: &[ModelFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
