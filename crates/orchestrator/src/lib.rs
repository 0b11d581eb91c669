//! Multi-model answer dispatch
//!
//! Three strategies over one `ModelBackend`, all sharing the process-wide
//! `ModelPool`:
//!
//! 1. [`FallbackOrchestrator`]: sequential walk of the preference chain,
//!    then credential rotation and another full walk
//! 2. [`RaceOrchestrator`]: concurrent calls, result chosen by selection
//!    order rather than completion order
//! 3. [`HybridDispatcher`]: fallback first, escalating to a race once the
//!    primary deadline passes
//!
//! Callers learn about switches and exhaustion through [`DispatchObserver`].

pub mod error;
pub mod fallback;
pub mod hybrid;
pub mod race;

pub use error::{DispatchError, ModelFailure, Result};
pub use fallback::{FallbackOrchestrator, attempt_order};
pub use hybrid::{HybridDispatcher, HybridSettings};
pub use race::RaceOrchestrator;

/// Notifications emitted during dispatch. Both default to no-ops.
pub trait DispatchObserver: Send + Sync {
    /// A model other than the requested one produced the answer.
    fn on_model_switch(&self, _from: &str, _to: &str) {}

    /// Every model failed under every API key.
    fn on_all_exhausted(&self) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl DispatchObserver for NoopObserver {}
