//! Execution backends.
//!
//! A backend places task executions on some compute service, reports the
//! state of placed executions, and serves their logs page by page.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream, TryStreamExt};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::types::Task;

mod http;
mod local;

pub use http::HttpBackend;
pub use local::LocalBackend;

/// Default number of execution refs per describe call.
pub const DEFAULT_DESCRIBE_BATCH_LIMIT: usize = 100;

/// State of one execution as observed on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    /// Accepted but not started yet.
    Pending,
    /// Currently executing.
    Running,
    /// Explicitly finished.
    Stopped,
    /// The backend has no record of the execution.
    Missing,
    /// Anything outside the known vocabulary, with the raw value.
    Unrecognized(String),
}

impl ExecutionState {
    /// Map a backend `lastStatus` string.
    pub fn from_status(status: &str) -> Self {
        match status {
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "STOPPED" => Self::Stopped,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    /// Map a backend describe failure reason.
    pub fn from_failure(reason: &str) -> Self {
        match reason {
            "MISSING" => Self::Missing,
            other => Self::Unrecognized(format!("failure: {other}")),
        }
    }
}

/// Describe result for a single execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub execution_ref: String,
    pub state: ExecutionState,
}

/// One log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub message: String,
}

impl LogEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            message: message.into(),
        }
    }
}

/// One page of log events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPage {
    pub events: Vec<LogEvent>,
    /// Token for the following page; `None` when there are no more pages.
    #[serde(default)]
    pub next_token: Option<String>,
}

/// A compute service that runs task executions.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Prepare backend-side definitions for `tasks`. Must not start anything.
    async fn initialize(&self, _tasks: &[Task]) -> Result<()> {
        Ok(())
    }

    /// Start an execution of `task`, returning its execution reference.
    async fn place(&self, task: &Task, environment: &HashMap<String, String>) -> Result<String>;

    /// Report the state of each execution in `execution_refs`.
    async fn describe(&self, execution_refs: &[String]) -> Result<Vec<ExecutionReport>>;

    /// Fetch one page of logs for an execution.
    async fn fetch_logs(&self, execution_ref: &str, page_token: Option<&str>) -> Result<LogPage>;

    /// Stop a running execution. Backends that cannot stop executions ignore this.
    async fn stop(&self, _execution_ref: &str) -> Result<()> {
        Ok(())
    }

    /// Maximum number of refs accepted by one `describe` call.
    fn describe_batch_limit(&self) -> usize {
        DEFAULT_DESCRIBE_BATCH_LIMIT
    }
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Lazily stream every log event of an execution.
///
/// Pages are fetched on demand until the backend returns no next token or an
/// empty page. Calling this again starts over from the first page.
pub fn log_stream<'a>(
    backend: &'a dyn ExecutionBackend,
    execution_ref: &'a str,
) -> impl Stream<Item = Result<LogEvent>> + Send + 'a {
    stream::try_unfold(Cursor::Start, move |cursor| async move {
        let token = match cursor {
            Cursor::Done => return Ok(None),
            Cursor::Start => None,
            Cursor::Next(token) => Some(token),
        };

        let page = backend.fetch_logs(execution_ref, token.as_deref()).await?;
        if page.events.is_empty() {
            return Ok(None);
        }

        let next = match page.next_token {
            Some(token) => Cursor::Next(token),
            None => Cursor::Done,
        };
        Ok::<_, SchedulerError>(Some((page.events, next)))
    })
    .map_ok(|events| stream::iter(events.into_iter().map(Ok::<_, SchedulerError>)))
    .try_flatten()
}

/// Fetch every log event of an execution into memory.
pub async fn collect_logs(
    backend: &dyn ExecutionBackend,
    execution_ref: &str,
) -> Result<Vec<LogEvent>> {
    log_stream(backend, execution_ref).try_collect().await
}

/// Join log events into newline-separated text.
pub fn render_logs<'a>(events: impl IntoIterator<Item = &'a LogEvent>) -> String {
    events
        .into_iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}
