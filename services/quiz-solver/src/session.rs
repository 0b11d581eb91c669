//! Quiz-solving state machine
//!
//! One [`QuizSolver`] drives one question chain. The chain is an explicit loop
//! over the current URL; each question runs a retry loop that takes answers
//! from a manual override or from automatic dispatch, submits them, and
//! decides whether to retry, advance, or stop.
//!
//! Control methods (`stop`, `pause`, `resume`, `set_manual_answer`, ...) only
//! flip shared state and bump a watch signal. The loop observes them at its
//! yield points: loop top, manual waits, the dispatch select, and delays.
//! In-flight calls are never aborted; a dispatch task whose result is no
//! longer wanted is detached and its result dropped.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use common::Secret;
use orchestrator::{DispatchError, DispatchObserver, HybridDispatcher};
use provider::CompletionRequest;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, warn};

use crate::answer::{
    AnswerType, CODE_SYSTEM_PROMPT, DIRECT_SYSTEM_PROMPT, code_prompt, direct_prompt,
    parse_answer, parse_code_output, should_use_code,
};
use crate::config::{SandboxConfig, SolverConfig};
use crate::error::{Error, Result};
use crate::events::{EventSink, LogEntry, LogLevel, SolverEvent};
use crate::files::{self, FileProcessor, FileType, ProcessedFile};
use crate::metrics;
use crate::page::{PageFetcher, QuizPage};
use crate::sandbox::{CodeExecutor, extract_code, validate_code};
use crate::submit::{SubmissionPayload, SubmissionResult, Submitter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Processing,
    Paused,
    /// Terminal.
    Stopped,
}

/// One-shot override channel between the driver and the retry loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Mailbox {
    Pending,
    /// Authoritative answer for the next attempt.
    ManualOverride(Value),
    /// Resumed without an answer: the next attempt dispatches automatically.
    ResumeAutomatic,
}

#[derive(Debug, Clone)]
pub struct SolverSettings {
    pub retry_budget: Duration,
    pub retry_delay: Duration,
    pub poll_interval: Duration,
    pub exhausted_poll_interval: Duration,
    pub advance_delay: Duration,
    pub max_page_images: usize,
    pub max_prompt_images: usize,
    pub code_enabled: bool,
    pub download_dir: PathBuf,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self::from_config(&SolverConfig::default(), &SandboxConfig::default())
    }
}

impl SolverSettings {
    pub fn from_config(solver: &SolverConfig, sandbox: &SandboxConfig) -> Self {
        Self {
            retry_budget: Duration::from_secs(solver.retry_budget_secs),
            retry_delay: Duration::from_millis(solver.retry_delay_ms),
            poll_interval: Duration::from_millis(solver.poll_interval_ms),
            exhausted_poll_interval: Duration::from_millis(solver.exhausted_poll_interval_ms),
            advance_delay: Duration::from_millis(solver.advance_delay_ms),
            max_page_images: solver.max_page_images,
            max_prompt_images: solver.max_prompt_images,
            code_enabled: sandbox.enabled,
            download_dir: solver.download_dir.clone(),
        }
    }
}

/// Everything a solver needs besides its own session parameters.
#[derive(Clone)]
pub struct SolverDeps {
    pub dispatcher: HybridDispatcher,
    pub pages: Arc<dyn PageFetcher>,
    pub files: Arc<dyn FileProcessor>,
    pub executor: Arc<dyn CodeExecutor>,
    pub submitter: Arc<dyn Submitter>,
    pub settings: SolverSettings,
}

/// Final result of [`QuizSolver::run`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SolveOutcome {
    pub success: bool,
    pub complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SolveOutcome {
    fn complete() -> Self {
        Self {
            success: true,
            complete: true,
            error: None,
        }
    }

    fn stopped() -> Self {
        Self {
            success: false,
            complete: false,
            error: Some("solver stopped".to_string()),
        }
    }

    fn failed(error: String) -> Self {
        Self {
            success: false,
            complete: false,
            error: Some(error),
        }
    }

    /// Label for `quiz_sessions_total`.
    fn label(&self) -> &'static str {
        if self.complete {
            "complete"
        } else if self.error.as_deref() == Some("solver stopped") {
            "stopped"
        } else {
            "error"
        }
    }
}

/// Public view of a solver, never containing the secret.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub email: String,
    pub model: String,
    pub state: RunState,
    pub all_models_limited: bool,
    pub manual_answer_pending: bool,
    pub manual_payload_pending: bool,
    pub current_url: Option<String>,
    pub attempt: u32,
    pub questions: u32,
}

struct Shared {
    run_state: RunState,
    mailbox: Mailbox,
    manual_payload: Option<Map<String, Value>>,
    model: String,
    all_models_limited: bool,
    current_url: Option<String>,
    attempt: u32,
    questions: u32,
}

struct Inner {
    id: String,
    email: String,
    secret: Secret<String>,
    deps: SolverDeps,
    sink: Arc<dyn EventSink>,
    shared: Mutex<Shared>,
    signal: watch::Sender<u64>,
}

/// Transient per-question retry state.
#[derive(Debug, Default)]
struct RetryContext {
    attempts: u32,
    /// Deduplicated, insertion order.
    reasons: Vec<String>,
    next_hint: Option<String>,
}

impl RetryContext {
    fn record(&mut self, result: &SubmissionResult) {
        if let Some(reason) = &result.reason
            && !self.reasons.contains(reason)
        {
            self.reasons.push(reason.clone());
        }
        if let Some(url) = result.url.as_ref().filter(|u| !u.is_empty()) {
            self.next_hint = Some(url.clone());
        }
    }
}

enum Step {
    Next(String),
    Complete,
    Stopped,
}

enum Acquired {
    Answer(Value),
    Stopped,
}

/// Material gathered for one question, owned so a detached dispatch task can
/// keep it.
#[derive(Clone)]
struct Question {
    page: QuizPage,
    files: Vec<ProcessedFile>,
    images: Vec<String>,
    /// Page images written to the download dir; removed with `files`.
    image_paths: Vec<PathBuf>,
}

impl Question {
    fn downloaded_paths(&self) -> Vec<&Path> {
        self.files
            .iter()
            .map(|f| f.local_path.as_path())
            .chain(self.image_paths.iter().map(PathBuf::as_path))
            .collect()
    }
}

#[derive(Clone)]
pub struct QuizSolver {
    inner: Arc<Inner>,
}

impl QuizSolver {
    pub fn new(
        id: impl Into<String>,
        email: impl Into<String>,
        secret: Secret<String>,
        model: impl Into<String>,
        deps: SolverDeps,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let (signal, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                id: id.into(),
                email: email.into(),
                secret,
                deps,
                sink,
                shared: Mutex::new(Shared {
                    run_state: RunState::Processing,
                    mailbox: Mailbox::Pending,
                    manual_payload: None,
                    model: model.into(),
                    all_models_limited: false,
                    current_url: None,
                    attempt: 0,
                    questions: 0,
                }),
                signal,
            }),
        }
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate shared state and wake every waiter.
    fn update<T>(&self, f: impl FnOnce(&mut Shared) -> T) -> T {
        let result = f(&mut self.shared());
        self.inner.signal.send_modify(|v| *v = v.wrapping_add(1));
        result
    }

    fn settings(&self) -> &SolverSettings {
        &self.inner.deps.settings
    }

    // ---- driver control surface ----

    pub fn stop(&self) {
        self.update(|s| s.run_state = RunState::Stopped);
        self.log(LogLevel::Info, "Quiz solving stopped", None);
    }

    pub fn pause(&self) {
        let paused = self.update(|s| {
            if s.run_state == RunState::Processing {
                s.run_state = RunState::Paused;
                true
            } else {
                false
            }
        });
        if paused {
            self.log(LogLevel::Info, "Quiz solving paused, waiting for manual input", None);
        }
    }

    pub fn resume(&self) {
        let resumed = self.update(|s| {
            if s.run_state != RunState::Paused {
                return false;
            }
            s.run_state = RunState::Processing;
            if s.mailbox == Mailbox::Pending {
                s.mailbox = Mailbox::ResumeAutomatic;
            }
            true
        });
        if resumed {
            self.log(LogLevel::Info, "Quiz solving resumed", None);
        }
    }

    pub fn set_manual_answer(&self, answer: Value) {
        let preview = truncate(&answer.to_string(), 200);
        self.update(|s| s.mailbox = Mailbox::ManualOverride(answer));
        self.log(LogLevel::Info, format!("Manual answer set: {preview}"), None);
    }

    pub fn set_manual_payload(&self, payload: Map<String, Value>) {
        self.update(|s| s.manual_payload = Some(payload));
        self.log(LogLevel::Info, "Manual payload set", None);
    }

    pub fn set_model(&self, model: impl Into<String>) {
        let model = model.into();
        self.log(LogLevel::Info, format!("Model changed to: {model}"), None);
        self.update(|s| {
            s.model = model;
            s.all_models_limited = false;
        });
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let s = self.shared();
        SessionSnapshot {
            id: self.inner.id.clone(),
            email: self.inner.email.clone(),
            model: s.model.clone(),
            state: s.run_state,
            all_models_limited: s.all_models_limited,
            manual_answer_pending: matches!(s.mailbox, Mailbox::ManualOverride(_)),
            manual_payload_pending: s.manual_payload.is_some(),
            current_url: s.current_url.clone(),
            attempt: s.attempt,
            questions: s.questions,
        }
    }

    fn is_stopped(&self) -> bool {
        self.shared().run_state == RunState::Stopped
    }

    fn is_paused(&self) -> bool {
        self.shared().run_state == RunState::Paused
    }

    fn model(&self) -> String {
        self.shared().model.clone()
    }

    /// Consume the mailbox. Only a manual override yields a value.
    fn take_manual(&self) -> Option<Value> {
        let mut s = self.shared();
        match std::mem::replace(&mut s.mailbox, Mailbox::Pending) {
            Mailbox::ManualOverride(value) => Some(value),
            Mailbox::Pending | Mailbox::ResumeAutomatic => None,
        }
    }

    fn has_manual(&self) -> bool {
        matches!(self.shared().mailbox, Mailbox::ManualOverride(_))
    }

    // ---- observability ----

    fn log(&self, level: LogLevel, message: impl Into<String>, data: Option<Value>) {
        let message = message.into();
        let session = self.inner.id.as_str();
        match level {
            LogLevel::Debug => debug!(session, "{message}"),
            LogLevel::Info | LogLevel::Success => info!(session, "{message}"),
            LogLevel::Warning => warn!(session, "{message}"),
            LogLevel::Error => error!(session, "{message}"),
        }
        self.inner.sink.on_log(LogEntry::new(level, message, data));
    }

    fn emit(&self, event: SolverEvent) {
        self.inner.sink.on_update(event);
    }

    // ---- waiting ----

    /// Block until `done` holds, re-checking on every state change and at
    /// least every `interval`.
    async fn wait_until(&self, interval: Duration, done: impl Fn(&Shared) -> bool) {
        let mut rx = self.inner.signal.subscribe();
        loop {
            if done(&self.shared()) {
                return;
            }
            let _ = tokio::time::timeout(interval, rx.changed()).await;
        }
    }

    /// Sleep for `duration`, cut short by `stop()`.
    async fn delay(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut rx = self.inner.signal.subscribe();
        while !self.is_stopped() {
            if tokio::time::timeout_at(deadline, rx.changed()).await.is_err() {
                return;
            }
        }
    }

    /// Wait while paused until a manual answer arrives, the solver resumes,
    /// or it stops.
    async fn wait_for_manual(&self) {
        self.wait_until(self.settings().poll_interval, |s| {
            s.run_state != RunState::Paused || s.mailbox != Mailbox::Pending
        })
        .await;
    }

    // ---- main loop ----

    /// Solve the chain starting at `url` until it completes, fails or stops.
    pub async fn run(&self, url: String) -> SolveOutcome {
        let mut current = url;
        let outcome = loop {
            if self.is_stopped() {
                self.log(LogLevel::Error, "Solver is stopped", None);
                break SolveOutcome::stopped();
            }
            match self.solve_question(&current).await {
                Ok(Step::Next(next)) => {
                    self.log(LogLevel::Info, format!("Next quiz: {next}"), None);
                    self.delay(self.settings().advance_delay).await;
                    current = next;
                }
                Ok(Step::Complete) => {
                    self.log(LogLevel::Success, "Quiz chain complete!", None);
                    break SolveOutcome::complete();
                }
                Ok(Step::Stopped) => break SolveOutcome::stopped(),
                Err(e) => {
                    let message = e.to_string();
                    self.log(
                        LogLevel::Error,
                        format!("Quiz solving error: {message}"),
                        Some(json!({"url": current})),
                    );
                    self.emit(SolverEvent::Error {
                        error: message.clone(),
                    });
                    break SolveOutcome::failed(message);
                }
            }
        };

        metrics::record_session(outcome.label());
        self.emit(SolverEvent::SessionFinished {
            success: outcome.success,
            complete: outcome.complete,
            error: outcome.error.clone(),
        });
        outcome
    }

    async fn solve_question(&self, url: &str) -> Result<Step> {
        self.update(|s| {
            s.current_url = Some(url.to_string());
            s.attempt = 0;
            s.questions += 1;
        });
        metrics::record_question();
        self.emit(SolverEvent::QuizStarted {
            url: url.to_string(),
        });
        self.log(LogLevel::Info, format!("Fetching quiz page: {url}"), None);

        let page = self.inner.deps.pages.fetch(url).await?;
        let retry_start = Instant::now();
        self.log(
            LogLevel::Info,
            "Quiz content extracted",
            Some(json!({
                "text_length": page.text.len(),
                "submit_url": page.submit_url,
                "file_links": page.file_links.len(),
                "image_urls": page.image_urls.len(),
            })),
        );
        self.emit(SolverEvent::QuestionParsed {
            question: page.text.clone(),
            submit_url: page.submit_url.clone(),
            file_links: page.file_links.clone(),
        });

        let question = self.gather(page).await;
        let step = self.retry_loop(url, &question, retry_start).await;

        let paths = question.downloaded_paths();
        if !paths.is_empty() {
            files::cleanup(&paths).await;
        }
        step
    }

    /// Download linked files and a bounded number of page images. Failures
    /// are logged and skipped.
    async fn gather(&self, page: QuizPage) -> Question {
        let mut downloaded = Vec::new();
        let mut images = Vec::new();
        let mut image_paths = Vec::new();

        for link in &page.file_links {
            if self.is_stopped() {
                break;
            }
            match self.inner.deps.files.process(link).await {
                Ok(file) => {
                    self.emit(SolverEvent::FileDownloaded {
                        filename: file.filename.clone(),
                        path: file.local_path.display().to_string(),
                        file_type: file.file_type.as_str().to_string(),
                        url: link.clone(),
                    });
                    if file.file_type == FileType::Image
                        && let Some(b64) = &file.content.base64
                    {
                        images.push(b64.clone());
                    }
                    downloaded.push(file);
                }
                Err(e) => self.log(
                    LogLevel::Warning,
                    format!("Failed to process: {link}"),
                    Some(json!({"error": e.to_string()})),
                ),
            }
        }

        for image_url in page.image_urls.iter().take(self.settings().max_page_images) {
            if self.is_stopped() {
                break;
            }
            match self.inner.deps.files.process(image_url).await {
                Ok(file) => {
                    if file.file_type == FileType::Image
                        && let Some(b64) = file.content.base64
                    {
                        images.push(b64);
                    }
                    image_paths.push(file.local_path);
                }
                Err(e) => debug!(url = %image_url, error = %e, "skipping page image"),
            }
        }

        Question {
            page,
            files: downloaded,
            images,
            image_paths,
        }
    }

    async fn retry_loop(&self, url: &str, question: &Question, retry_start: Instant) -> Result<Step> {
        let settings = self.settings().clone();

        if self.is_paused() {
            self.log(LogLevel::Info, "Waiting for manual answer...", None);
            self.emit(SolverEvent::WaitingManual {
                question: question.page.text.clone(),
            });
            self.wait_for_manual().await;
        }

        let mut ctx = RetryContext::default();
        while !self.is_stopped() {
            ctx.attempts += 1;
            let attempt = ctx.attempts;
            self.update(|s| s.attempt = attempt);
            let remaining = settings.retry_budget.saturating_sub(retry_start.elapsed());
            self.log(
                LogLevel::Info,
                format!("Attempt {attempt} ({}s remaining)", remaining.as_secs()),
                None,
            );

            let answer = if let Some(answer) = self.take_manual() {
                self.log(LogLevel::Info, format!("Using manual answer: {answer}"), None);
                answer
            } else if self.is_paused() {
                self.log(LogLevel::Info, "Paused, waiting for manual answer...", None);
                self.wait_for_manual().await;
                match self.take_manual() {
                    Some(answer) => {
                        self.log(LogLevel::Info, format!("Using manual answer: {answer}"), None);
                        answer
                    }
                    None => continue,
                }
            } else {
                match self.acquire_answer(question, &ctx.reasons).await {
                    Ok(Acquired::Answer(answer)) => answer,
                    Ok(Acquired::Stopped) => break,
                    Err(Error::Dispatch(DispatchError::AllModelsExhausted)) => {
                        self.log(
                            LogLevel::Error,
                            "All models are rate limited. Please select a model manually.",
                            None,
                        );
                        self.emit(SolverEvent::AllModelsRateLimited);
                        self.wait_until(settings.exhausted_poll_interval, |s| {
                            s.run_state == RunState::Stopped
                                || !s.all_models_limited
                                || matches!(s.mailbox, Mailbox::ManualOverride(_))
                        })
                        .await;
                        match self.take_manual() {
                            Some(answer) => answer,
                            None => continue,
                        }
                    }
                    Err(e) => return Err(e),
                }
            };

            self.log(
                LogLevel::Info,
                format!("Answer: {}", truncate(&answer.to_string(), 200)),
                None,
            );
            self.emit(SolverEvent::AnswerReady {
                answer: answer.clone(),
            });

            let mut payload =
                SubmissionPayload::new(&self.inner.email, self.inner.secret.expose(), url, answer);
            self.emit(SolverEvent::PayloadReady {
                payload: payload.redacted(),
                submit_url: question.page.submit_url.clone(),
            });

            // Paused here means the operator is reviewing the payload.
            if self.is_paused() {
                self.wait_until(settings.poll_interval, |s| {
                    s.run_state != RunState::Paused || matches!(s.mailbox, Mailbox::ManualOverride(_))
                })
                .await;
            }
            if self.is_stopped() {
                break;
            }
            if self.has_manual()
                && let Some(answer) = self.take_manual()
            {
                self.log(LogLevel::Info, format!("Using manual answer: {answer}"), None);
                payload.answer = answer;
            }
            if let Some(edit) = self.update(|s| s.manual_payload.take()) {
                payload.apply(edit);
                self.log(LogLevel::Info, "Using manually edited payload", None);
            }

            let result = self.submit(&question.page.submit_url, &payload).await;

            if result.correct {
                self.log(LogLevel::Success, "Answer was correct!", None);
                return Ok(match result.url.filter(|u| !u.is_empty()) {
                    Some(next) => Step::Next(next),
                    None => Step::Complete,
                });
            }

            self.log(
                LogLevel::Error,
                format!(
                    "Wrong answer: {}",
                    result.reason.as_deref().unwrap_or("No reason given")
                ),
                None,
            );
            ctx.record(&result);

            if retry_start.elapsed() >= settings.retry_budget {
                self.log(
                    LogLevel::Warning,
                    format!("Retry budget of {}s reached", settings.retry_budget.as_secs()),
                    None,
                );
                match &ctx.next_hint {
                    Some(next) => {
                        self.log(LogLevel::Info, format!("Moving to next question: {next}"), None);
                        return Ok(Step::Next(next.clone()));
                    }
                    None => self.log(
                        LogLevel::Warning,
                        "No next URL available, continuing to retry...",
                        None,
                    ),
                }
            }

            self.delay(settings.retry_delay).await;
        }

        Ok(Step::Stopped)
    }

    async fn submit(&self, submit_url: &str, payload: &SubmissionPayload) -> SubmissionResult {
        self.log(LogLevel::Info, format!("Submitting to {submit_url}"), None);
        self.emit(SolverEvent::Submitting {
            submit_url: submit_url.to_string(),
            payload: payload.redacted(),
        });

        let result = match self.inner.deps.submitter.submit(submit_url, payload).await {
            Ok(result) => result,
            Err(e) => {
                self.log(LogLevel::Error, format!("Submission error: {e}"), None);
                SubmissionResult {
                    correct: false,
                    reason: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        metrics::record_submission(result.correct);
        self.emit(SolverEvent::Response {
            result: serde_json::to_value(&result).unwrap_or(Value::Null),
        });
        result
    }

    /// Run automatic acquisition on a detached task and race it against a
    /// manual override or stop.
    async fn acquire_answer(&self, question: &Question, reasons: &[String]) -> Result<Acquired> {
        let solver = self.clone();
        let question = question.clone();
        let reasons = reasons.to_vec();
        let mut rx = self.inner.signal.subscribe();
        let live = Arc::new(AtomicBool::new(true));
        let observer: Arc<dyn DispatchObserver> = Arc::new(AttemptObserver {
            solver: self.clone(),
            live: live.clone(),
        });
        let mut attempt = Attempt {
            task: tokio::spawn(
                async move { solver.automatic_answer(&question, &reasons, observer).await }
                    .in_current_span(),
            ),
            live,
        };

        loop {
            if self.is_stopped() {
                return Ok(Acquired::Stopped);
            }
            if self.has_manual()
                && let Some(answer) = self.take_manual()
            {
                self.log(
                    LogLevel::Info,
                    format!("Using manual answer: {answer} (automatic result will be discarded)"),
                    None,
                );
                return Ok(Acquired::Answer(answer));
            }
            tokio::select! {
                joined = &mut attempt.task => {
                    let answer = joined
                        .map_err(|e| Error::Dispatch(DispatchError::TaskFailed(e.to_string())))??;
                    return Ok(Acquired::Answer(answer));
                }
                _ = rx.changed() => {}
            }
        }
    }

    /// Code path first when it applies, then the direct hybrid dispatch.
    async fn automatic_answer(
        &self,
        question: &Question,
        reasons: &[String],
        observer: Arc<dyn DispatchObserver>,
    ) -> Result<Value> {
        let model = self.model();

        if self.settings().code_enabled && should_use_code(&question.page.text, &question.files) {
            self.log(LogLevel::Info, "Using generated code for this question", None);
            match self.answer_with_code(question, reasons, &model, observer.clone()).await {
                Ok(answer) => return Ok(answer),
                Err(e) => {
                    self.log(LogLevel::Error, format!("Code path failed: {e}"), None);
                    self.log(LogLevel::Warning, "Falling back to direct LLM answer", None);
                }
            }
        }

        let prompt = direct_prompt(&question.page, &self.inner.email, &question.files, reasons);
        let answer_type = AnswerType::detect(&question.page.text);
        let images: Vec<String> = question
            .images
            .iter()
            .take(self.settings().max_prompt_images)
            .cloned()
            .collect();

        self.log(
            LogLevel::Info,
            "Calling LLM...",
            Some(json!({
                "prompt_length": prompt.len(),
                "model": model,
                "has_images": !images.is_empty(),
                "previous_reasons": reasons.len(),
            })),
        );
        self.emit(SolverEvent::LlmCalled {
            model: model.clone(),
        });
        self.update(|s| s.all_models_limited = false);

        let request = CompletionRequest::new(model, prompt)
            .with_system_prompt(DIRECT_SYSTEM_PROMPT)
            .with_images(images);
        let completion = self
            .inner
            .deps
            .dispatcher
            .dispatch(request, observer)
            .await?;

        self.log(
            LogLevel::Info,
            "LLM response received",
            Some(json!({
                "content_preview": truncate(&completion.content, 200),
                "model": completion.model,
            })),
        );
        Ok(parse_answer(&completion.content, answer_type))
    }

    async fn answer_with_code(
        &self,
        question: &Question,
        reasons: &[String],
        model: &str,
        observer: Arc<dyn DispatchObserver>,
    ) -> Result<Value> {
        let prompt = code_prompt(&question.page, &self.inner.email, &question.files, reasons);
        self.log(
            LogLevel::Info,
            "Requesting analysis code from LLM...",
            Some(json!({"prompt_length": prompt.len()})),
        );
        let request = CompletionRequest::new(model, prompt).with_system_prompt(CODE_SYSTEM_PROMPT);
        let completion = self
            .inner
            .deps
            .dispatcher
            .fallback()
            .dispatch(request, observer)
            .await?;

        let code = extract_code(&completion.content);
        if let Some(pattern) = validate_code(&code) {
            self.log(
                LogLevel::Warning,
                format!("Code validation warning: potentially dangerous pattern {pattern}"),
                None,
            );
        }

        let working_dir = question
            .files
            .first()
            .and_then(|f| f.local_path.parent())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.settings().download_dir.clone());
        let output = self
            .inner
            .deps
            .executor
            .execute(&code, &working_dir)
            .await?;

        let answer = parse_code_output(&output);
        self.log(
            LogLevel::Success,
            format!("Generated answer from code: {}", truncate(&answer.to_string(), 200)),
            None,
        );
        Ok(answer)
    }
}

/// One automatic answer attempt. Dropping it aborts the task and silences
/// its observer, so a discarded attempt cannot touch session state.
struct Attempt {
    task: JoinHandle<Result<Value>>,
    live: Arc<AtomicBool>,
}

impl Drop for Attempt {
    fn drop(&mut self) {
        self.live.store(false, Ordering::Release);
        self.task.abort();
    }
}

/// Forwards dispatch notifications while its attempt is still wanted. The
/// hybrid primary runs on its own task and can outlive an aborted attempt.
struct AttemptObserver {
    solver: QuizSolver,
    live: Arc<AtomicBool>,
}

impl DispatchObserver for AttemptObserver {
    fn on_model_switch(&self, from: &str, to: &str) {
        if self.live.load(Ordering::Acquire) {
            self.solver.on_model_switch(from, to);
        }
    }

    fn on_all_exhausted(&self) {
        if self.live.load(Ordering::Acquire) {
            self.solver.on_all_exhausted();
        }
    }
}

impl DispatchObserver for QuizSolver {
    fn on_model_switch(&self, from: &str, to: &str) {
        self.log(
            LogLevel::Warning,
            format!("Switching model: {from} failed, answered by {to}"),
            None,
        );
        metrics::record_model_switch();
        self.emit(SolverEvent::ModelSwitched {
            from: from.to_string(),
            model: to.to_string(),
        });
    }

    fn on_all_exhausted(&self) {
        self.update(|s| s.all_models_limited = true);
    }
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fake collaborators and a scripted model backend for solver tests.

    use super::*;
    use crate::files::ExtractedContent;
    use model_pool::{ModelDescriptor, ModelPool, Registry};
    use orchestrator::{FallbackOrchestrator, HybridSettings, RaceOrchestrator};
    use provider::{BoxFuture, CallError, Completion, ModelBackend};
    use std::collections::{HashMap, VecDeque};

    #[derive(Clone)]
    pub enum Reply {
        Content(&'static str, Duration),
        Fail,
    }

    pub struct ScriptedBackend {
        script: Mutex<VecDeque<Reply>>,
        default: Reply,
        pub requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedBackend {
        pub fn new(default: Reply) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                default,
                requests: Mutex::new(Vec::new()),
            })
        }

        pub fn then(&self, reply: Reply) {
            self.script.lock().unwrap().push_back(reply);
        }

        pub fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl ModelBackend for ScriptedBackend {
        fn id(&self) -> &str {
            "scripted"
        }

        fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, provider::Result<Completion>> {
            Box::pin(async move {
                self.requests.lock().unwrap().push(request.clone());
                let reply = self
                    .script
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| self.default.clone());
                match reply {
                    Reply::Content(content, delay) => {
                        tokio::time::sleep(delay).await;
                        Ok(Completion {
                            content: content.to_string(),
                            model: request.model,
                            usage: None,
                            elapsed: delay,
                        })
                    }
                    Reply::Fail => Err(CallError::ServerError {
                        model: request.model,
                        status: 503,
                    }),
                }
            })
        }
    }

    #[derive(Default)]
    pub struct FakePages {
        pub pages: Mutex<HashMap<String, QuizPage>>,
        pub fetched: Mutex<Vec<String>>,
    }

    impl FakePages {
        pub fn with(pages: &[(&str, &str)]) -> Arc<Self> {
            let fake = Self::default();
            for (url, text) in pages {
                fake.pages.lock().unwrap().insert(
                    url.to_string(),
                    QuizPage {
                        url: url.to_string(),
                        text: text.to_string(),
                        submit_url: "https://x/submit".to_string(),
                        file_links: vec![],
                        image_urls: vec![],
                    },
                );
            }
            Arc::new(fake)
        }

        pub fn add_file_link(&self, url: &str, link: &str) {
            if let Some(page) = self.pages.lock().unwrap().get_mut(url) {
                page.file_links.push(link.to_string());
            }
        }

        pub fn add_image(&self, url: &str, image: &str) {
            if let Some(page) = self.pages.lock().unwrap().get_mut(url) {
                page.image_urls.push(image.to_string());
            }
        }
    }

    impl PageFetcher for FakePages {
        fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<QuizPage>> {
            Box::pin(async move {
                self.fetched.lock().unwrap().push(url.to_string());
                self.pages
                    .lock()
                    .unwrap()
                    .get(url)
                    .cloned()
                    .ok_or_else(|| Error::PageFetch(format!("{url}: HTTP 404")))
            })
        }
    }

    /// Serves every URL as a small CSV file that exists nowhere on disk.
    pub struct FakeFiles;

    impl FileProcessor for FakeFiles {
        fn process<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ProcessedFile>> {
            Box::pin(async move {
                let filename = crate::files::filename_from_url(url);
                Ok(ProcessedFile {
                    url: url.to_string(),
                    file_type: FileType::from_name(&filename),
                    local_path: PathBuf::from("/nonexistent/quiz-test").join(&filename),
                    filename,
                    content: ExtractedContent {
                        text: Some("a,b\n1,2\n".to_string()),
                        ..Default::default()
                    },
                })
            })
        }
    }

    pub struct FakeExecutor {
        pub output: Option<&'static str>,
        pub runs: Mutex<Vec<String>>,
    }

    impl CodeExecutor for FakeExecutor {
        fn execute<'a>(&'a self, code: &'a str, _working_dir: &'a Path) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move {
                self.runs.lock().unwrap().push(code.to_string());
                self.output
                    .map(str::to_string)
                    .ok_or_else(|| Error::CodeExecution("Traceback: NameError".into()))
            })
        }
    }

    /// Replies per quiz URL from a queue, falling back to the last reply.
    #[derive(Default)]
    pub struct FakeSubmitter {
        pub replies: Mutex<HashMap<String, VecDeque<Result<SubmissionResult>>>>,
        pub received: Mutex<Vec<SubmissionPayload>>,
    }

    impl FakeSubmitter {
        pub fn reply(&self, quiz_url: &str, result: Result<SubmissionResult>) {
            self.replies
                .lock()
                .unwrap()
                .entry(quiz_url.to_string())
                .or_default()
                .push_back(result);
        }

        pub fn answers(&self) -> Vec<Value> {
            self.received
                .lock()
                .unwrap()
                .iter()
                .map(|p| p.answer.clone())
                .collect()
        }
    }

    impl Submitter for FakeSubmitter {
        fn submit<'a>(
            &'a self,
            _submit_url: &'a str,
            payload: &'a SubmissionPayload,
        ) -> BoxFuture<'a, Result<SubmissionResult>> {
            Box::pin(async move {
                self.received.lock().unwrap().push(payload.clone());
                let mut replies = self.replies.lock().unwrap();
                let queue = replies.entry(payload.url.clone()).or_default();
                let next = if queue.len() > 1 { queue.pop_front() } else { None };
                match next {
                    Some(result) => result,
                    None => match queue.front() {
                        Some(Ok(result)) => Ok(result.clone()),
                        Some(Err(e)) => Err(Error::Submission(e.to_string())),
                        None => Ok(SubmissionResult {
                            correct: true,
                            ..Default::default()
                        }),
                    },
                }
            })
        }
    }

    pub fn correct(next: Option<&str>) -> Result<SubmissionResult> {
        Ok(SubmissionResult {
            correct: true,
            url: next.map(str::to_string),
            ..Default::default()
        })
    }

    pub fn wrong(reason: &str, next: Option<&str>) -> Result<SubmissionResult> {
        Ok(SubmissionResult {
            correct: false,
            reason: Some(reason.to_string()),
            url: next.map(str::to_string),
            delay: None,
        })
    }

    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<SolverEvent>>,
        pub logs: Mutex<Vec<LogEntry>>,
    }

    impl RecordingSink {
        pub fn saw(&self, pred: impl Fn(&SolverEvent) -> bool) -> bool {
            self.events.lock().unwrap().iter().any(pred)
        }
    }

    impl EventSink for RecordingSink {
        fn on_log(&self, entry: LogEntry) {
            self.logs.lock().unwrap().push(entry);
        }

        fn on_update(&self, event: SolverEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    pub fn test_pool(models: &[&str]) -> Arc<ModelPool> {
        let descriptors = models
            .iter()
            .enumerate()
            .map(|(i, id)| ModelDescriptor {
                id: id.to_string(),
                name: id.to_string(),
                provider: "test".to_string(),
                is_default: i == 0,
            })
            .collect();
        Arc::new(ModelPool::new(
            Registry::new(descriptors, models.iter().map(|m| m.to_string()).collect()),
            vec![Secret::new("sk-test".to_string())],
        ))
    }

    pub struct Harness {
        pub backend: Arc<ScriptedBackend>,
        pub pages: Arc<FakePages>,
        pub files: Arc<dyn FileProcessor>,
        pub submitter: Arc<FakeSubmitter>,
        pub executor: Arc<FakeExecutor>,
        pub sink: Arc<RecordingSink>,
        pub settings: SolverSettings,
        pub pool: Arc<ModelPool>,
    }

    impl Harness {
        pub fn new(pages: &[(&str, &str)], default: Reply) -> Self {
            Self {
                backend: ScriptedBackend::new(default),
                pages: FakePages::with(pages),
                files: Arc::new(FakeFiles),
                submitter: Arc::new(FakeSubmitter::default()),
                executor: Arc::new(FakeExecutor {
                    output: None,
                    runs: Mutex::new(Vec::new()),
                }),
                sink: Arc::new(RecordingSink::default()),
                settings: SolverSettings::default(),
                pool: test_pool(&["m1", "m2"]),
            }
        }

        pub fn deps(&self) -> SolverDeps {
            let backend: Arc<dyn ModelBackend> = self.backend.clone();
            SolverDeps {
                dispatcher: HybridDispatcher::new(
                    FallbackOrchestrator::new(self.pool.clone(), backend.clone()),
                    RaceOrchestrator::new(self.pool.clone(), backend),
                    HybridSettings::default(),
                ),
                pages: self.pages.clone(),
                files: self.files.clone(),
                executor: self.executor.clone(),
                submitter: self.submitter.clone(),
                settings: self.settings.clone(),
            }
        }

        pub fn solver(&self) -> QuizSolver {
            QuizSolver::new(
                "session-1",
                "student@example.com",
                Secret::new("s3cret".to_string()),
                "m1",
                self.deps(),
                self.sink.clone(),
            )
        }
    }

    /// Poll `cond` on the paused clock.
    pub async fn eventually(cond: impl Fn() -> bool) {
        for _ in 0..100_000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }
}
