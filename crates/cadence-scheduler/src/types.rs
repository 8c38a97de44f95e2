//! Scheduler types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// A cron schedule attached to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Five-field cron expression.
    pub cron: String,
}

/// A named, schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task name.
    pub name: String,
    /// Disabled tasks are never scheduled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Cron triggers. Only the first one is consulted.
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    /// Free-form grouping label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Container image for remote backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Command and arguments executed by the backend.
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// Soft memory reservation in megabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
    /// Name of the environment mapping injected into the execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl Task {
    /// Create an enabled task with no triggers.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            triggers: Vec::new(),
            category: None,
            image: None,
            entrypoint: Vec::new(),
            memory_mb: None,
            environment: None,
            tags: Vec::new(),
        }
    }

    /// Builder-style helper adding a cron trigger.
    pub fn with_cron(mut self, cron: impl Into<String>) -> Self {
        self.triggers.push(Trigger { cron: cron.into() });
        self
    }

    /// Builder-style helper setting the entrypoint.
    pub fn with_entrypoint<I, S>(mut self, entrypoint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = entrypoint.into_iter().map(Into::into).collect();
        self
    }

    /// The trigger used for scheduling, if any.
    pub fn primary_trigger(&self) -> Option<&Trigger> {
        self.triggers.first()
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet placed on the backend.
    #[default]
    Pending,
    /// Placed on the backend and executing.
    Running,
    /// Finished with no error signature in its logs.
    Success,
    /// Finished with an error signature in its logs.
    Error,
    /// Stopped administratively or never placed.
    Cancelled,
}

impl RunStatus {
    /// Statuses that count against the single-flight guard.
    pub const ACTIVE: [RunStatus; 2] = [RunStatus::Pending, RunStatus::Running];

    /// Pending or Running.
    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    /// Success, Error, or Cancelled.
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Success)
                | (Running, Error)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One execution instance of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Assigned by storage on insert.
    pub uuid: String,
    /// Name of the task this run executes.
    pub task_name: String,
    pub status: RunStatus,
    pub start: DateTime<Utc>,
    /// Unset while the run is pending or running.
    pub end: Option<DateTime<Utc>>,
    /// Backend identifier, empty until placement succeeds.
    #[serde(default)]
    pub execution_ref: String,
    /// Whether log classification has been attempted.
    #[serde(default)]
    pub logs_fetched: bool,
    /// Most recently fetched log text.
    #[serde(default)]
    pub logs: String,
    /// Why the run ended without log classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_note: Option<String>,
}

impl Run {
    /// A fresh pending run for `task_name`. The uuid is filled in by storage.
    pub fn pending(task_name: impl Into<String>) -> Self {
        Self {
            uuid: String::new(),
            task_name: task_name.into(),
            status: RunStatus::Pending,
            start: Utc::now(),
            end: None,
            execution_ref: String::new(),
            logs_fetched: false,
            logs: String::new(),
            exit_note: None,
        }
    }

    /// Move to `next`, stamping `end` when the new status is terminal.
    pub fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SchedulerError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.end = Some(Utc::now());
        }
        Ok(())
    }
}

impl fmt::Display for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Run({}, {}, {})", self.task_name, self.uuid, self.status)
    }
}

/// Filter for [`crate::Storage::get_runs`].
#[derive(Debug, Clone, Default)]
pub struct RunQuery {
    pub status: Option<RunStatus>,
    pub task_name: Option<String>,
}

impl RunQuery {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            task_name: None,
        }
    }

    pub fn task(task_name: impl Into<String>) -> Self {
        Self {
            status: None,
            task_name: Some(task_name.into()),
        }
    }

    pub fn matches(&self, run: &Run) -> bool {
        self.status.is_none_or(|s| s == run.status)
            && self
                .task_name
                .as_deref()
                .is_none_or(|name| name == run.task_name)
    }
}
