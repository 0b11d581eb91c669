//! Outcome classification for model endpoint responses
//!
//! Throttling shows up two ways: an HTTP 429, or a 2xx body carrying an
//! embedded `error` object whose code is 429 or whose message talks about
//! rate limiting. Both must mark the model throttled; everything else is an
//! ordinary per-model failure.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::CallError;

/// Phrases in an embedded error message that indicate throttling.
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
];

/// Reset hints above this are epoch milliseconds rather than seconds.
const MILLIS_THRESHOLD: u64 = 1_000_000_000_000;

/// Whether an error message describes throttling.
pub fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Whether an embedded error object (`code`, `message`) means throttling.
///
/// `code` may arrive as a number or a numeric string.
pub fn is_rate_limit_error(code: Option<&serde_json::Value>, message: &str) -> bool {
    let code_is_429 = match code {
        Some(serde_json::Value::Number(n)) => n.as_u64() == Some(429),
        Some(serde_json::Value::String(s)) => s.trim() == "429",
        _ => false,
    };
    code_is_429 || is_rate_limit_message(message)
}

/// Parse an `x-ratelimit-reset` header value into a wall-clock reset time.
///
/// The value is epoch seconds; values above 10^12 are taken as epoch
/// milliseconds. Unparseable values yield `None` (caller uses the default
/// throttle window).
pub fn parse_reset_hint(value: Option<&str>) -> Option<SystemTime> {
    let raw = value?.trim();
    let number = raw
        .parse::<u64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().filter(|f| *f >= 0.0).map(|f| f as u64))?;
    let offset = if number >= MILLIS_THRESHOLD {
        Duration::from_millis(number)
    } else {
        Duration::from_secs(number)
    };
    UNIX_EPOCH.checked_add(offset)
}

/// Classify a non-success HTTP status (other than 429) into a `CallError`.
pub fn classify_status(model: &str, status: u16, body: &str) -> CallError {
    if status >= 500 {
        return CallError::ServerError {
            model: model.to_string(),
            status,
        };
    }
    CallError::Api {
        status,
        message: summarize(body),
    }
}

/// Trim an error body to something log-sized.
fn summarize(body: &str) -> String {
    const LIMIT: usize = 300;
    let trimmed = body.trim();
    if trimmed.len() <= LIMIT {
        return trimmed.to_string();
    }
    let mut end = LIMIT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}
