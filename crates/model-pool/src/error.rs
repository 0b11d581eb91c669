//! Error types for credential operations

/// Errors from the credential pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no API keys configured")]
    NoKeysConfigured,

    #[error("invalid API key index {index}: {total} key(s) configured")]
    InvalidIndex { index: usize, total: usize },
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
