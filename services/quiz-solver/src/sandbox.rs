//! Generated analysis code execution
//!
//! Not a security boundary: `validate_code` only reports suspicious patterns
//! and execution proceeds regardless. The process is bounded by a timeout and
//! killed if the future is dropped.

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use provider::BoxFuture;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};

static DANGEROUS_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)import\s+os",
        r"(?i)import\s+subprocess",
        r"(?i)import\s+sys",
        r"(?i)__import__",
        r"(?i)exec\s*\(",
        r"(?i)eval\s*\(",
        r"(?i)open\s*\(",
        r"(?i)\.read\s*\(",
        r"(?i)\.write\s*\(",
        r"(?i)\.delete",
        r"(?i)\.remove",
        r"(?i)\.unlink",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("sandbox pattern is valid"))
    .collect()
});

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[\w+-]*[ \t]*\n?").expect("fence regex is valid"));

/// Runs generated source in a working directory and returns its stdout.
pub trait CodeExecutor: Send + Sync {
    fn execute<'a>(&'a self, code: &'a str, working_dir: &'a Path) -> BoxFuture<'a, Result<String>>;
}

pub struct ProcessExecutor {
    interpreter: String,
    timeout: Duration,
}

impl ProcessExecutor {
    pub fn new(interpreter: impl Into<String>, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout,
        }
    }

    #[instrument(skip_all, fields(interpreter = %self.interpreter, dir = %working_dir.display()))]
    async fn run(&self, code: &str, working_dir: &Path) -> Result<String> {
        tokio::fs::create_dir_all(working_dir)
            .await
            .map_err(|e| Error::CodeExecution(format!("create {}: {e}", working_dir.display())))?;

        let script = working_dir.join(format!("temp_{}.py", uuid::Uuid::new_v4().simple()));
        // The child runs inside working_dir, so a relative path would resolve twice.
        let script = std::path::absolute(&script).unwrap_or(script);
        tokio::fs::write(&script, code)
            .await
            .map_err(|e| Error::CodeExecution(format!("write {}: {e}", script.display())))?;

        let result = self.spawn(&script, working_dir).await;
        if let Err(e) = tokio::fs::remove_file(&script).await {
            debug!(path = %script.display(), error = %e, "failed to remove script");
        }
        result
    }

    async fn spawn(&self, script: &Path, working_dir: &Path) -> Result<String> {
        let child = Command::new(&self.interpreter)
            .arg(script)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::CodeExecution(format!("failed to spawn {}: {e}", self.interpreter)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::CodeExecution(format!("timed out after {}s", self.timeout.as_secs()))
            })?
            .map_err(|e| Error::CodeExecution(e.to_string()))?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            info!(output_len = stdout.len(), "generated code finished");
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(status = %output.status, "generated code failed");
            Err(Error::CodeExecution(format!("exit {}:\n{stderr}", output.status)))
        }
    }
}

impl CodeExecutor for ProcessExecutor {
    fn execute<'a>(&'a self, code: &'a str, working_dir: &'a Path) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.run(code, working_dir))
    }
}

/// First suspicious pattern found in `code`, if any.
pub fn validate_code(code: &str) -> Option<&'static str> {
    const NAMES: [&str; 12] = [
        "import os",
        "import subprocess",
        "import sys",
        "__import__",
        "exec()",
        "eval()",
        "open()",
        ".read()",
        ".write()",
        ".delete",
        ".remove",
        ".unlink",
    ];
    DANGEROUS_PATTERNS
        .iter()
        .zip(NAMES)
        .find(|(re, _)| re.is_match(code))
        .map(|(_, name)| name)
}

/// Strip markdown fences from a model reply, keeping the code.
pub fn extract_code(reply: &str) -> String {
    let trimmed = reply.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    FENCE_RE.replace_all(trimmed, "").trim().to_string()
}
