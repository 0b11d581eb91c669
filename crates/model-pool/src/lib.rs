//! Shared model-selection state for every dispatch path
//!
//! One [`ModelPool`] is created per process and handed out as `Arc<ModelPool>`
//! to the HTTP backend, the orchestrators, and every quiz session. It bundles:
//!
//! 1. [`Registry`]: the fixed, ordered list of model backends and the
//!    fallback preference chain
//! 2. [`RateLimitTracker`]: which models are throttled and until when
//! 3. [`CredentialPool`]: the ordered API keys and the active index
//!
//! All three are internally synchronized, so a credential rotated or a model
//! throttled by one session is immediately visible to every other session.

pub mod credentials;
pub mod error;
pub mod pool;
pub mod rate_limit;
pub mod registry;

pub use credentials::{CredentialInfo, CredentialPool, keys_from_env};
pub use error::{Error, Result};
pub use pool::ModelPool;
pub use rate_limit::{DEFAULT_LIMIT_WINDOW, RateLimitStatus, RateLimitTracker};
pub use registry::{DEFAULT_MODEL, ModelDescriptor, Registry};
