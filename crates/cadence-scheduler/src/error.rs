//! Error types for the scheduler.

use thiserror::Error;

use crate::types::RunStatus;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Cron expression outside the supported field subset.
    #[error("unsupported schedule '{expression}': {reason}")]
    UnsupportedSchedule { expression: String, reason: String },

    /// The task already has a pending or running run.
    #[error("task already running: {0}")]
    AlreadyRunning(String),

    /// Task or run not found in storage.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The execution backend rejected or failed a request.
    #[error("execution backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The execution backend reported a status outside the known vocabulary.
    #[error("unexpected backend state for {execution_ref}: {state}")]
    UnexpectedBackendState { execution_ref: String, state: String },

    /// A run status change that the lifecycle does not allow.
    #[error("invalid run transition: {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    /// A conditional run update found the run in a different status.
    #[error("run {uuid} is {actual}, expected {expected}")]
    StatusConflict {
        uuid: String,
        expected: RunStatus,
        actual: RunStatus,
    },

    /// Invalid settings or provider configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Environment lookup failed.
    #[error("environment error: {0}")]
    Environment(String),

    /// A completion callback failed.
    #[error("callback failed: {0}")]
    Callback(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl SchedulerError {
    pub(crate) fn unsupported(expression: &str, reason: impl Into<String>) -> Self {
        Self::UnsupportedSchedule {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn task_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: "task",
            id: name.to_string(),
        }
    }

    pub(crate) fn run_not_found(uuid: &str) -> Self {
        Self::NotFound {
            kind: "run",
            id: uuid.to_string(),
        }
    }

    /// Whether this is the expected single-flight rejection.
    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning(_))
    }

    /// Whether a conditional update lost to another writer.
    pub fn is_status_conflict(&self) -> bool {
        matches!(self, Self::StatusConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
