//! Session manager and HTTP control surface
//!
//! Endpoints:
//! - GET  /health                         pool health, session counts, uptime
//! - GET  /metrics                        Prometheus exposition
//! - GET  /api/models                     registry, fallback chain, throttle status
//! - POST /api/models/test                one-shot probe call
//! - POST /api/rate-limits/clear          clear one model's throttle entry
//! - GET  /api/keys, POST /api/keys       credential info / select active key
//! - GET  /api/sessions, POST /api/sessions
//! - GET  /api/sessions/{id}, DELETE /api/sessions/{id}
//! - GET  /api/sessions/{id}/events?since=N
//! - POST /api/sessions/{id}/{stop,pause,resume,answer,payload,model}
//!
//! Sessions live in memory only. A finished session keeps its outcome and
//! event log until it is deleted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use common::Secret;
use metrics_exporter_prometheus::PrometheusHandle;
use model_pool::ModelPool;
use provider::{CompletionRequest, ModelBackend};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::events::{EventLog, Record};
use crate::session::{QuizSolver, SessionSnapshot, SolveOutcome, SolverDeps};

const PROBE_PROMPT: &str = "Respond with just \"OK\"";
const PROBE_MAX_TOKENS: u32 = 10;

/// Request-level failures, rendered as `{"error":{"type","message"}}`.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("quiz secret does not match")]
    Forbidden,
}

impl ControlError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden => StatusCode::FORBIDDEN,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "invalid_request",
            Self::Forbidden => "forbidden",
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        json_response(
            self.status(),
            json!({
                "error": {
                    "type": self.kind(),
                    "message": self.to_string(),
                }
            }),
        )
    }
}

fn json_response(status: StatusCode, body: Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn ok(body: Value) -> Response {
    json_response(StatusCode::OK, body)
}

type Reply = std::result::Result<Response, ControlError>;

#[derive(Clone)]
struct Session {
    solver: QuizSolver,
    events: Arc<EventLog>,
    outcome: Arc<OnceLock<SolveOutcome>>,
    url: String,
    started_at_ms: u64,
}

impl Session {
    fn view(&self) -> Value {
        json!({
            "session": self.solver.snapshot(),
            "url": self.url,
            "started_at_ms": self.started_at_ms,
            "running": self.outcome.get().is_none(),
            "outcome": self.outcome.get(),
        })
    }
}

/// Parameters for a new session. Every field is optional here so a missing
/// one is reported as a 400 with a readable message.
#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub url: Option<String>,
    pub email: Option<String>,
    pub secret: Option<String>,
    pub model: Option<String>,
}

fn required(field: &str, value: Option<String>) -> std::result::Result<String, ControlError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ControlError::BadRequest(format!("missing required field: {field}")))
}

/// Owns every solver of the process, keyed by session id.
pub struct SessionManager {
    pool: Arc<ModelPool>,
    backend: Arc<dyn ModelBackend>,
    deps: SolverDeps,
    quiz_secret: Option<Secret<String>>,
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    /// How long a finished session stays readable before it is dropped.
    retention: Duration,
    started_at: Instant,
}

impl SessionManager {
    pub fn new(
        pool: Arc<ModelPool>,
        backend: Arc<dyn ModelBackend>,
        deps: SolverDeps,
        quiz_secret: Option<Secret<String>>,
        retention: Duration,
    ) -> Self {
        Self {
            pool,
            backend,
            deps,
            quiz_secret,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            retention,
            started_at: Instant::now(),
        }
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self, id: &str) -> std::result::Result<Session, ControlError> {
        self.sessions()
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(id.to_string()))
    }

    fn check_model(&self, model: &str) -> std::result::Result<(), ControlError> {
        if self.pool.registry().contains(model) {
            Ok(())
        } else {
            Err(ControlError::BadRequest(format!("unknown model: {model}")))
        }
    }

    /// Validate the request and spawn a solver for it.
    pub fn start(&self, request: StartRequest) -> std::result::Result<SessionSnapshot, ControlError> {
        let url = required("url", request.url)?;
        let email = required("email", request.email)?;
        let secret = required("secret", request.secret)?;
        let model = request
            .model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.pool.registry().default_model().to_string());
        self.check_model(&model)?;

        if let Some(expected) = &self.quiz_secret
            && !expected.matches(&secret)
        {
            warn!(email = %email, "session rejected: quiz secret mismatch");
            return Err(ControlError::Forbidden);
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let events = Arc::new(EventLog::default());
        let solver = QuizSolver::new(
            id.clone(),
            email,
            Secret::new(secret),
            model,
            self.deps.clone(),
            events.clone(),
        );
        let outcome = Arc::new(OnceLock::new());

        let session = Session {
            solver: solver.clone(),
            events,
            outcome: outcome.clone(),
            url: url.clone(),
            started_at_ms: now_ms(),
        };
        let snapshot = solver.snapshot();
        self.sessions().insert(id.clone(), session);

        info!(session = %id, url = %url, model = %snapshot.model, "session started");
        let sessions = self.sessions.clone();
        let retention = self.retention;
        let span = info_span!("session", id = %id);
        tokio::spawn(
            async move {
                let result = solver.run(url).await;
                info!(success = result.success, complete = result.complete, "session finished");
                let _ = outcome.set(result);

                tokio::time::sleep(retention).await;
                if sessions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id)
                    .is_some()
                {
                    debug!("finished session expired");
                }
            }
            .instrument(span),
        );

        Ok(snapshot)
    }

    pub fn list(&self) -> Vec<Value> {
        let mut sessions: Vec<Session> = self.sessions().values().cloned().collect();
        sessions.sort_by_key(|s| s.started_at_ms);
        sessions.iter().map(Session::view).collect()
    }

    /// Stop a session and forget it.
    pub fn remove(&self, id: &str) -> std::result::Result<(), ControlError> {
        let session = self
            .sessions()
            .remove(id)
            .ok_or_else(|| ControlError::NotFound(id.to_string()))?;
        session.solver.stop();
        info!(session = %id, "session removed");
        Ok(())
    }

    /// Stop every session. Used on shutdown.
    pub fn stop_all(&self) {
        let sessions: Vec<Session> = self.sessions().values().cloned().collect();
        for session in sessions {
            session.solver.stop();
        }
    }

    /// `(total, running)`
    pub fn counts(&self) -> (usize, usize) {
        let sessions = self.sessions();
        let running = sessions.values().filter(|s| s.outcome.get().is_none()).count();
        (sessions.len(), running)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/models", get(list_models))
        .route("/api/models/test", post(test_model))
        .route("/api/rate-limits/clear", post(clear_rate_limit))
        .route("/api/keys", get(key_info).post(select_key))
        .route("/api/sessions", get(list_sessions).post(start_session))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/sessions/{id}/events", get(session_events))
        .route("/api/sessions/{id}/stop", post(stop_session))
        .route("/api/sessions/{id}/pause", post(pause_session))
        .route("/api/sessions/{id}/resume", post(resume_session))
        .route("/api/sessions/{id}/answer", post(set_answer))
        .route("/api/sessions/{id}/payload", post(set_payload))
        .route("/api/sessions/{id}/model", post(set_model))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// 200 while at least one API key is configured, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> Response {
    let manager = &state.sessions;
    let pool = manager.pool.health();
    let (total, running) = manager.counts();
    let status = if pool["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    json_response(
        status,
        json!({
            "status": pool["status"],
            "pool": pool,
            "sessions_total": total,
            "sessions_running": running,
            "uptime_seconds": manager.started_at.elapsed().as_secs(),
        }),
    )
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn list_models(State(state): State<AppState>) -> Response {
    let pool = &state.sessions.pool;
    let registry = pool.registry();
    let status = pool
        .rate_limits()
        .status(registry.models().iter().map(|m| m.id.as_str()));

    ok(json!({
        "models": registry.models(),
        "fallback_chain": registry.fallback_chain(),
        "default_model": registry.default_model(),
        "rate_limits": status,
    }))
}

#[derive(Deserialize)]
struct ModelBody {
    model: Option<String>,
}

/// POST /api/models/test: a tiny completion against one model.
async fn test_model(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<ModelBody>,
) -> Reply {
    let manager = &state.sessions;
    let model = required("model", body.model)?;
    manager.check_model(&model)?;

    let request = CompletionRequest::new(&model, PROBE_PROMPT).with_limits(0.0, PROBE_MAX_TOKENS);
    let started = Instant::now();
    match manager.backend.complete(request).await {
        Ok(completion) => Ok(ok(json!({
            "success": true,
            "model": model,
            "response": completion.content,
            "elapsed_ms": started.elapsed().as_millis() as u64,
        }))),
        Err(e) => {
            warn!(model = %model, error = %e, "model probe failed");
            Ok(ok(json!({
                "success": false,
                "model": model,
                "error": e.to_string(),
                "kind": e.label(),
            })))
        }
    }
}

async fn clear_rate_limit(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<ModelBody>,
) -> Reply {
    let model = required("model", body.model)?;
    state.sessions.pool.rate_limits().clear(&model);
    info!(model = %model, "rate limit cleared");
    Ok(ok(json!({ "model": model, "status": "cleared" })))
}

async fn key_info(State(state): State<AppState>) -> Response {
    ok(json!(state.sessions.pool.credentials().info()))
}

#[derive(Deserialize)]
struct KeyBody {
    index: Option<usize>,
}

async fn select_key(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<KeyBody>,
) -> Reply {
    let index = body
        .index
        .ok_or_else(|| ControlError::BadRequest("missing required field: index".into()))?;
    let info = state
        .sessions
        .pool
        .credentials()
        .set_index(index)
        .map_err(|e| ControlError::BadRequest(e.to_string()))?;
    Ok(ok(json!(info)))
}

async fn list_sessions(State(state): State<AppState>) -> Response {
    ok(json!({ "sessions": state.sessions.list() }))
}

async fn start_session(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<StartRequest>,
) -> Reply {
    let snapshot = state.sessions.start(body)?;
    Ok(ok(json!({ "session": snapshot })))
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Reply {
    Ok(ok(state.sessions.session(&id)?.view()))
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> Reply {
    state.sessions.remove(&id)?;
    Ok(ok(json!({ "id": id, "status": "removed" })))
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(default)]
    since: u64,
}

async fn session_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Reply {
    let session = state.sessions.session(&id)?;
    let records: Vec<Record> = session.events.since(query.since);
    Ok(ok(json!({
        "id": id,
        "last_seq": session.events.last_seq(),
        "records": records,
    })))
}

async fn stop_session(State(state): State<AppState>, Path(id): Path<String>) -> Reply {
    let session = state.sessions.session(&id)?;
    session.solver.stop();
    Ok(ok(json!({ "session": session.solver.snapshot() })))
}

async fn pause_session(State(state): State<AppState>, Path(id): Path<String>) -> Reply {
    let session = state.sessions.session(&id)?;
    session.solver.pause();
    Ok(ok(json!({ "session": session.solver.snapshot() })))
}

async fn resume_session(State(state): State<AppState>, Path(id): Path<String>) -> Reply {
    let session = state.sessions.session(&id)?;
    session.solver.resume();
    Ok(ok(json!({ "session": session.solver.snapshot() })))
}

#[derive(Deserialize)]
struct AnswerBody {
    answer: Option<Value>,
}

async fn set_answer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Json(body): axum::Json<AnswerBody>,
) -> Reply {
    let session = state.sessions.session(&id)?;
    let answer = body
        .answer
        .ok_or_else(|| ControlError::BadRequest("missing required field: answer".into()))?;
    session.solver.set_manual_answer(answer);
    session.solver.resume();
    Ok(ok(json!({ "session": session.solver.snapshot() })))
}

#[derive(Deserialize)]
struct PayloadBody {
    payload: Option<Value>,
}

async fn set_payload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Json(body): axum::Json<PayloadBody>,
) -> Reply {
    let session = state.sessions.session(&id)?;
    let Some(Value::Object(payload)) = body.payload else {
        return Err(ControlError::BadRequest("payload must be a JSON object".into()));
    };
    session.solver.set_manual_payload(payload);
    session.solver.resume();
    Ok(ok(json!({ "session": session.solver.snapshot() })))
}

async fn set_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Json(body): axum::Json<ModelBody>,
) -> Reply {
    let session = state.sessions.session(&id)?;
    let model = required("model", body.model)?;
    state.sessions.check_model(&model)?;
    session.solver.set_model(model);
    Ok(ok(json!({ "session": session.solver.snapshot() })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{Harness, Reply as BackendReply, eventually};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const RETENTION: Duration = Duration::from_secs(60);

    const Q1: &str = "https://x/q1";

    fn manager(h: &Harness, quiz_secret: Option<&str>) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            h.pool.clone(),
            h.backend.clone(),
            h.deps(),
            quiz_secret.map(|s| Secret::new(s.to_string())),
            RETENTION,
        ))
    }

    fn app(manager: Arc<SessionManager>) -> Router {
        let (_, prometheus) = crate::metrics::test_recorder();
        build_router(
            AppState {
                sessions: manager,
                prometheus,
            },
            16,
        )
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    fn start_body() -> Value {
        json!({"url": Q1, "email": "student@example.com", "secret": "s3cret"})
    }

    #[tokio::test]
    async fn health_reports_pool_and_sessions() {
        let h = Harness::new(&[], BackendReply::Fail);
        let app = app(manager(&h, None));

        let (status, json) = call(&app, "GET", "/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["pool"]["keys_total"], 1);
        assert_eq!(json["sessions_total"], 0);
    }

    #[tokio::test]
    async fn metrics_endpoint_is_plain_text() {
        let h = Harness::new(&[], BackendReply::Fail);
        let response = app(manager(&h, None))
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn models_list_includes_throttle_status() {
        let h = Harness::new(&[], BackendReply::Fail);
        h.pool.rate_limits().mark_limited("m2", None);
        let app = app(manager(&h, None));

        let (status, json) = call(&app, "GET", "/api/models", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["default_model"], "m1");
        assert_eq!(json["fallback_chain"], json!(["m1", "m2"]));
        assert_eq!(json["models"].as_array().unwrap().len(), 2);
        assert_eq!(json["rate_limits"]["m2"]["limited"], true);
        assert_eq!(json["rate_limits"]["m1"]["limited"], false);

        let (status, _) = call(&app, "POST", "/api/rate-limits/clear", Some(json!({"model": "m2"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!h.pool.rate_limits().is_limited("m2"));
    }

    #[tokio::test]
    async fn model_probe_reports_success_and_failure() {
        let h = Harness::new(&[], BackendReply::Content("OK", Duration::ZERO));
        h.backend.then(BackendReply::Fail);
        let app = app(manager(&h, None));

        let (status, json) = call(&app, "POST", "/api/models/test", Some(json!({"model": "m1"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], false);
        assert_eq!(json["kind"], "server_error");

        let (_, json) = call(&app, "POST", "/api/models/test", Some(json!({"model": "m1"}))).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["response"], "OK");

        let probe = h.backend.requests().pop().unwrap();
        assert_eq!(probe.prompt, PROBE_PROMPT);
        assert_eq!(probe.max_tokens, PROBE_MAX_TOKENS);

        let (status, json) = call(&app, "POST", "/api/models/test", Some(json!({"model": "nope"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["type"], "invalid_request");
    }

    #[tokio::test]
    async fn key_selection_validates_index() {
        let h = Harness::new(&[], BackendReply::Fail);
        let app = app(manager(&h, None));

        let (status, json) = call(&app, "GET", "/api/keys", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total_keys"], 1);
        assert_eq!(json["current_index"], 0);

        let (status, json) = call(&app, "POST", "/api/keys", Some(json!({"index": 3}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"]["message"].as_str().unwrap().contains('3'));

        let (status, _) = call(&app, "POST", "/api/keys", Some(json!({"index": 0}))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn start_rejects_missing_fields_and_unknown_model() {
        let h = Harness::new(&[], BackendReply::Fail);
        let app = app(manager(&h, None));

        let (status, json) = call(&app, "POST", "/api/sessions", Some(json!({"url": Q1}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["message"], "missing required field: email");

        let mut body = start_body();
        body["model"] = json!("unknown/model");
        let (status, json) = call(&app, "POST", "/api/sessions", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["message"], "unknown model: unknown/model");
    }

    #[tokio::test]
    async fn start_rejects_wrong_quiz_secret() {
        let h = Harness::new(&[(Q1, "Name the city")], BackendReply::Fail);
        let app = app(manager(&h, Some("expected")));

        let (status, json) = call(&app, "POST", "/api/sessions", Some(start_body())).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"]["type"], "forbidden");
        assert!(h.pages.fetched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let h = Harness::new(&[], BackendReply::Fail);
        let app = app(manager(&h, None));

        for (method, uri) in [
            ("GET", "/api/sessions/missing"),
            ("GET", "/api/sessions/missing/events"),
            ("POST", "/api/sessions/missing/stop"),
            ("DELETE", "/api/sessions/missing"),
        ] {
            let (status, json) = call(&app, method, uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
            assert_eq!(json["error"]["type"], "not_found");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn session_runs_to_completion_and_replays_events() {
        let h = Harness::new(&[(Q1, "Name the city")], BackendReply::Content("Paris", Duration::ZERO));
        let manager = manager(&h, Some("s3cret"));
        let app = app(manager.clone());

        let (status, json) = call(&app, "POST", "/api/sessions", Some(start_body())).await;
        assert_eq!(status, StatusCode::OK);
        let id = json["session"]["id"].as_str().unwrap().to_string();
        assert!(json["session"].get("secret").is_none());

        eventually(|| manager.counts().1 == 0).await;

        let (status, json) = call(&app, "GET", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["running"], false);
        assert_eq!(json["outcome"]["complete"], true);

        let (_, json) = call(&app, "GET", &format!("/api/sessions/{id}/events"), None).await;
        let records = json["records"].as_array().unwrap();
        assert!(records.iter().any(|r| r["event"]["type"] == "session_finished"));
        assert!(!json.to_string().contains("s3cret"));

        let last = json["last_seq"].as_u64().unwrap();
        let (_, json) = call(&app, "GET", &format!("/api/sessions/{id}/events?since={last}"), None).await;
        assert!(json["records"].as_array().unwrap().is_empty());

        assert_eq!(h.submitter.answers(), vec![json!("Paris")]);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_session_is_dropped_after_retention() {
        let h = Harness::new(&[(Q1, "Name the city")], BackendReply::Content("Paris", Duration::ZERO));
        let manager = manager(&h, None);
        let app = app(manager.clone());

        let (_, json) = call(&app, "POST", "/api/sessions", Some(start_body())).await;
        let id = json["session"]["id"].as_str().unwrap().to_string();
        eventually(|| manager.counts().1 == 0).await;

        let (status, _) = call(&app, "GET", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);

        tokio::time::sleep(RETENTION + Duration::from_secs(1)).await;

        assert_eq!(manager.counts(), (0, 0));
        let (_, json) = call(&app, "GET", "/api/sessions", None).await;
        assert!(json["sessions"].as_array().unwrap().is_empty());
        let (status, _) = call(&app, "GET", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn control_endpoints_update_session_state() {
        // No page: the session fails fast and then sits idle.
        let h = Harness::new(&[], BackendReply::Fail);
        let manager = manager(&h, None);
        let app = app(manager.clone());

        let (_, json) = call(&app, "POST", "/api/sessions", Some(start_body())).await;
        let id = json["session"]["id"].as_str().unwrap().to_string();
        eventually(|| manager.counts().1 == 0).await;

        let (status, json) = call(&app, "POST", &format!("/api/sessions/{id}/pause"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["session"]["state"], "paused");

        let (_, json) = call(
            &app,
            "POST",
            &format!("/api/sessions/{id}/answer"),
            Some(json!({"answer": [1, 2]})),
        )
        .await;
        assert_eq!(json["session"]["manual_answer_pending"], true);
        assert_eq!(json["session"]["state"], "processing");

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/sessions/{id}/payload"),
            Some(json!({"payload": "not an object"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, json) = call(
            &app,
            "POST",
            &format!("/api/sessions/{id}/payload"),
            Some(json!({"payload": {"answer": 3}})),
        )
        .await;
        assert_eq!(json["session"]["manual_payload_pending"], true);

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/sessions/{id}/model"),
            Some(json!({"model": "nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, json) = call(
            &app,
            "POST",
            &format!("/api/sessions/{id}/model"),
            Some(json!({"model": "m2"})),
        )
        .await;
        assert_eq!(json["session"]["model"], "m2");

        let (_, json) = call(&app, "POST", &format!("/api/sessions/{id}/stop"), None).await;
        assert_eq!(json["session"]["state"], "stopped");

        let (_, json) = call(&app, "GET", "/api/sessions", None).await;
        assert_eq!(json["sessions"].as_array().unwrap().len(), 1);

        let (status, _) = call(&app, "DELETE", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "GET", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
