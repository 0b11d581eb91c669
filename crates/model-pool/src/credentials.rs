//! Ordered API keys with a single active index
//!
//! The index only moves through `set_index` (operator choice) or
//! `rotate_next` (automatic, after a whole fallback chain failed).

use std::sync::atomic::{AtomicUsize, Ordering};

use common::Secret;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Env vars consulted for API keys, in pool order.
pub const API_KEY_ENV_VARS: &[&str] = &[
    "OPENROUTER_API_KEY",
    "OPENROUTER_API_KEY_2",
    "OPENROUTER_API_KEY_3",
    "OPENROUTER_API_KEY_4",
];

/// Read API keys from [`API_KEY_ENV_VARS`], skipping unset or blank values.
pub fn keys_from_env() -> Vec<Secret<String>> {
    API_KEY_ENV_VARS
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(Secret::new)
        .collect()
}

/// Public view of the pool; never includes key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialInfo {
    pub current_index: usize,
    pub total_keys: usize,
}

pub struct CredentialPool {
    keys: Vec<Secret<String>>,
    current: AtomicUsize,
}

impl CredentialPool {
    pub fn new(keys: Vec<Secret<String>>) -> Self {
        info!(keys = keys.len(), "credential pool initialized");
        Self {
            keys,
            current: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The active key.
    pub fn current(&self) -> Result<Secret<String>> {
        if self.keys.is_empty() {
            return Err(Error::NoKeysConfigured);
        }
        let index = self.current.load(Ordering::Acquire) % self.keys.len();
        Ok(self.keys[index].clone())
    }

    pub fn current_index(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Select the active key explicitly.
    pub fn set_index(&self, index: usize) -> Result<CredentialInfo> {
        let total = self.keys.len();
        if index >= total {
            return Err(Error::InvalidIndex { index, total });
        }
        self.current.store(index, Ordering::Release);
        info!(index, total, "API key selected");
        Ok(self.info())
    }

    /// Advance to the next key. No-op returning false with fewer than two keys.
    pub fn rotate_next(&self) -> bool {
        let total = self.keys.len();
        if total <= 1 {
            return false;
        }
        let previous = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| Some((i + 1) % total))
            .unwrap_or_default();
        warn!(
            from = previous,
            to = (previous + 1) % total,
            total,
            "rotated API key"
        );
        true
    }

    pub fn info(&self) -> CredentialInfo {
        CredentialInfo {
            current_index: self.current_index(),
            total_keys: self.keys.len(),
        }
    }
}
