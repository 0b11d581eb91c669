//! Prometheus metrics exposition
//!
//! - `quiz_sessions_total` (counter): label `outcome`
//! - `quiz_questions_total` (counter)
//! - `quiz_submissions_total` (counter): label `correct`
//! - `quiz_model_switches_total` (counter)
//! - `llm_calls_total`, `llm_call_duration_seconds`: recorded by the provider
//!   crate
//! - `llm_rate_limits_total`: recorded by the model pool

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const LLM_CALL_BUCKETS: &[f64] = &[
    0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 20.0, 30.0, 60.0, 120.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("llm_call_duration_seconds".to_string()),
            LLM_CALL_BUCKETS,
        )
        .expect("bucket list is non-empty")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `llm_call_duration_seconds` gets explicit buckets (100ms to 120s, covering
/// the race deadline and the request timeout) so it renders as a histogram
/// rather than a summary.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a finished session. `outcome` is `complete`, `stopped` or `error`.
pub fn record_session(outcome: &'static str) {
    metrics::counter!("quiz_sessions_total", "outcome" => outcome).increment(1);
}

pub fn record_question() {
    metrics::counter!("quiz_questions_total").increment(1);
}

pub fn record_submission(correct: bool) {
    metrics::counter!("quiz_submissions_total", "correct" => correct.to_string()).increment(1);
}

pub fn record_model_switch() {
    metrics::counter!("quiz_model_switches_total").increment(1);
}

#[cfg(test)]
pub(crate) fn test_recorder() -> (
    metrics_exporter_prometheus::PrometheusRecorder,
    PrometheusHandle,
) {
    let recorder = builder().build_recorder();
    let handle = recorder.handle();
    (recorder, handle)
}
