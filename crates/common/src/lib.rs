//! Shared types for the quiz solver workspace
//!
//! Holds the pieces every crate needs without pulling in the model or
//! orchestration layers: a redacting [`Secret`] wrapper for API keys and
//! quiz secrets, and the configuration error type.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
