//! Service-specific error types

use orchestrator::DispatchError;
use thiserror::Error;

/// Failures while solving a quiz question.
///
/// Only `PageFetch` and non-exhaustion `Dispatch` errors end a session.
/// `FileProcessing` degrades the prompt, `CodeExecution` falls back to the
/// direct answer path and `Submission` is treated as a wrong answer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to fetch quiz page: {0}")]
    PageFetch(String),

    #[error("failed to process file: {0}")]
    FileProcessing(String),

    #[error("submission failed: {0}")]
    Submission(String),

    #[error("code execution failed: {0}")]
    CodeExecution(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
