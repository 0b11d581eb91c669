//! Solver observability: log entries, update events and the per-session buffer
//!
//! A solver reports through an [`EventSink`]. The session manager installs an
//! [`EventLog`] so the HTTP surface can replay what happened with
//! `GET /api/sessions/{id}/events?since=N`.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

/// Entries kept per session before the oldest are dropped.
pub const EVENT_LOG_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Success,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp_ms: u64,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            level,
            message: message.into(),
            data,
            timestamp_ms: now_ms(),
        }
    }
}

/// Progress notifications. Payloads never carry the quiz secret.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SolverEvent {
    QuizStarted {
        url: String,
    },
    QuestionParsed {
        question: String,
        submit_url: String,
        file_links: Vec<String>,
    },
    FileDownloaded {
        filename: String,
        path: String,
        file_type: String,
        url: String,
    },
    WaitingManual {
        question: String,
    },
    LlmCalled {
        model: String,
    },
    AnswerReady {
        answer: Value,
    },
    PayloadReady {
        payload: Value,
        submit_url: String,
    },
    Submitting {
        submit_url: String,
        payload: Value,
    },
    Response {
        result: Value,
    },
    AllModelsRateLimited,
    ModelSwitched {
        from: String,
        model: String,
    },
    Error {
        error: String,
    },
    SessionFinished {
        success: bool,
        complete: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Where a solver sends its log entries and update events.
pub trait EventSink: Send + Sync {
    fn on_log(&self, entry: LogEntry);
    fn on_update(&self, event: SolverEvent);
}

/// One buffered record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Log { seq: u64, entry: LogEntry },
    Update { seq: u64, event: SolverEvent },
}

impl Record {
    pub fn seq(&self) -> u64 {
        match self {
            Record::Log { seq, .. } | Record::Update { seq, .. } => *seq,
        }
    }
}

struct Buffer {
    next_seq: u64,
    records: VecDeque<Record>,
}

/// Bounded in-memory ring of records with monotonically increasing sequence
/// numbers starting at 1.
pub struct EventLog {
    capacity: usize,
    inner: Mutex<Buffer>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(EVENT_LOG_CAPACITY)
    }
}

impl EventLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Buffer {
                next_seq: 1,
                records: VecDeque::new(),
            }),
        }
    }

    fn push(&self, make: impl FnOnce(u64) -> Record) {
        let mut buffer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = buffer.next_seq;
        buffer.next_seq += 1;
        if buffer.records.len() == self.capacity {
            buffer.records.pop_front();
        }
        buffer.records.push_back(make(seq));
    }

    /// Records with a sequence number greater than `after`.
    pub fn since(&self, after: u64) -> Vec<Record> {
        let buffer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        buffer
            .records
            .iter()
            .filter(|r| r.seq() > after)
            .cloned()
            .collect()
    }

    /// Sequence number of the newest record, 0 when empty.
    pub fn last_seq(&self) -> u64 {
        let buffer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.next_seq - 1
    }
}

impl EventSink for EventLog {
    fn on_log(&self, entry: LogEntry) {
        self.push(|seq| Record::Log { seq, entry });
    }

    fn on_update(&self, event: SolverEvent) {
        self.push(|seq| Record::Update { seq, event });
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
