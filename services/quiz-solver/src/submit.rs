//! Answer submission
//!
//! The submission endpoint reports wrong answers with non-2xx statuses and a
//! normal result body, so a body that parses as [`SubmissionResult`] is used
//! whatever the status.

use std::time::Duration;

use provider::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionPayload {
    pub email: String,
    pub secret: String,
    pub url: String,
    pub answer: Value,
    /// Fields added by a manual payload edit.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SubmissionPayload {
    pub fn new(email: impl Into<String>, secret: impl Into<String>, url: impl Into<String>, answer: Value) -> Self {
        Self {
            email: email.into(),
            secret: secret.into(),
            url: url.into(),
            answer,
            extra: Map::new(),
        }
    }

    /// Overlay a manual edit: known fields are replaced, unknown ones added.
    pub fn apply(&mut self, edit: Map<String, Value>) {
        for (key, value) in edit {
            match key.as_str() {
                "email" => self.email = value_to_string(value),
                "secret" => self.secret = value_to_string(value),
                "url" => self.url = value_to_string(value),
                "answer" => self.answer = value,
                _ => {
                    self.extra.insert(key, value);
                }
            }
        }
    }

    /// JSON view with the secret masked, for events and logs.
    pub fn redacted(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.insert("secret".to_string(), Value::String("[REDACTED]".to_string()));
        }
        value
    }
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResult {
    #[serde(default)]
    pub correct: bool,
    #[serde(default)]
    pub reason: Option<String>,
    /// Continuation URL: the next question, or a hint after a wrong answer.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub delay: Option<f64>,
}

pub trait Submitter: Send + Sync {
    fn submit<'a>(
        &'a self,
        submit_url: &'a str,
        payload: &'a SubmissionPayload,
    ) -> BoxFuture<'a, Result<SubmissionResult>>;
}

pub struct HttpSubmitter {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpSubmitter {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    #[instrument(skip(self, payload))]
    async fn post(&self, submit_url: &str, payload: &SubmissionPayload) -> Result<SubmissionResult> {
        let response = self
            .client
            .post(submit_url)
            .json(payload)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Submission(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Submission(e.to_string()))?;

        if let Ok(result) = serde_json::from_str::<SubmissionResult>(&body)
            && looks_like_result(&body)
        {
            info!(status = status.as_u16(), correct = result.correct, "submission answered");
            return Ok(result);
        }

        warn!(status = status.as_u16(), "submission returned no result body");
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), body.trim()));
        Err(Error::Submission(message))
    }
}

/// A result body must at least carry `correct`; `{}` or `{"error":..}` is not one.
fn looks_like_result(body: &str) -> bool {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("correct").map(Value::is_boolean))
        .unwrap_or(false)
}

impl Submitter for HttpSubmitter {
    fn submit<'a>(
        &'a self,
        submit_url: &'a str,
        payload: &'a SubmissionPayload,
    ) -> BoxFuture<'a, Result<SubmissionResult>> {
        Box::pin(self.post(submit_url, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    fn payload() -> SubmissionPayload {
        SubmissionPayload::new("me@x.io", "s3cret", "https://q.io/1", json!(42))
    }

    #[test]
    fn manual_edit_overrides_and_extends() {
        let mut p = payload();
        let edit = json!({"answer": [1, 2], "url": "https://q.io/other", "note": "manual"});
        p.apply(edit.as_object().unwrap().clone());

        assert_eq!(p.answer, json!([1, 2]));
        assert_eq!(p.url, "https://q.io/other");
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["note"], "manual");
        assert_eq!(json["email"], "me@x.io");
    }

    #[test]
    fn redacted_hides_secret() {
        let json = payload().redacted();
        assert_eq!(json["secret"], "[REDACTED]");
        assert_eq!(json["answer"], 42);
    }

    #[test]
    fn result_defaults_missing_fields() {
        let r: SubmissionResult = serde_json::from_str(r#"{"correct": true, "url": null}"#).unwrap();
        assert!(r.correct);
        assert!(r.url.is_none());
        assert!(r.reason.is_none());
    }

    async fn serve(status: StatusCode, body: Value) -> (String, Arc<Mutex<Option<Value>>>) {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let app = axum::Router::new().route(
            "/submit",
            axum::routing::post(move |axum::Json(received): axum::Json<Value>| {
                let sink = sink.clone();
                let body = body.clone();
                async move {
                    *sink.lock().unwrap() = Some(received);
                    (status, axum::Json(body))
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/submit", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (url, seen)
    }

    fn submitter() -> HttpSubmitter {
        HttpSubmitter::new(reqwest::Client::new(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn posts_payload_and_parses_result() {
        let (url, seen) = serve(
            StatusCode::OK,
            json!({"correct": true, "url": "https://q.io/2", "reason": null}),
        )
        .await;

        let result = submitter().submit(&url, &payload()).await.unwrap();
        assert!(result.correct);
        assert_eq!(result.url.as_deref(), Some("https://q.io/2"));

        let received = seen.lock().unwrap().clone().unwrap();
        assert_eq!(received["email"], "me@x.io");
        assert_eq!(received["secret"], "s3cret");
        assert_eq!(received["answer"], 42);
    }

    #[tokio::test]
    async fn wrong_answer_with_error_status_is_still_a_result() {
        let (url, _) = serve(
            StatusCode::BAD_REQUEST,
            json!({"correct": false, "reason": "off by one"}),
        )
        .await;

        let result = submitter().submit(&url, &payload()).await.unwrap();
        assert!(!result.correct);
        assert_eq!(result.reason.as_deref(), Some("off by one"));
    }

    #[tokio::test]
    async fn error_body_becomes_submission_error() {
        let (url, _) = serve(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "db down"})).await;

        let err = submitter().submit(&url, &payload()).await.unwrap_err();
        assert_eq!(err.to_string(), "submission failed: db down");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_submission_error() {
        let err = submitter()
            .submit("http://127.0.0.1:1/submit", &payload())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Submission(_)));
    }
}
