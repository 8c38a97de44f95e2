//! Completion callbacks.
//!
//! Callbacks fire once for each run that reconciliation moves into
//! `Success` or `Error`.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info};

use crate::error::{Result, SchedulerError};
use crate::types::{Run, RunStatus, Task};

/// Hook invoked after a run reaches a classified terminal status.
#[async_trait]
pub trait Callback: Send + Sync {
    fn name(&self) -> &str;

    /// `task` is `None` when the definition has since been removed.
    async fn on_complete(&self, run: &Run, task: Option<&Task>) -> Result<()>;
}

/// Logs every completion through `tracing`.
#[derive(Debug, Default, Clone)]
pub struct LogCallback;

#[async_trait]
impl Callback for LogCallback {
    fn name(&self) -> &str {
        "log"
    }

    async fn on_complete(&self, run: &Run, task: Option<&Task>) -> Result<()> {
        let category = task.and_then(|t| t.category.as_deref()).unwrap_or("-");
        match run.status {
            RunStatus::Error => error!(
                task = %run.task_name,
                uuid = %run.uuid,
                category,
                "run finished with errors"
            ),
            _ => info!(
                task = %run.task_name,
                uuid = %run.uuid,
                category,
                status = %run.status,
                "run finished"
            ),
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct CompletionPayload<'a> {
    task: &'a str,
    uuid: &'a str,
    status: RunStatus,
    start: chrono::DateTime<chrono::Utc>,
    end: Option<chrono::DateTime<chrono::Utc>>,
    execution_ref: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<&'a str>,
}

/// POSTs a JSON summary of each completion to a URL.
pub struct WebhookCallback {
    url: String,
    only_errors: bool,
    http: reqwest::Client,
}

impl WebhookCallback {
    pub fn new(url: impl Into<String>, only_errors: bool) -> Self {
        Self {
            url: url.into(),
            only_errors,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Callback for WebhookCallback {
    fn name(&self) -> &str {
        "webhook"
    }

    #[tracing::instrument(skip(self, run, task), fields(task = %run.task_name, uuid = %run.uuid))]
    async fn on_complete(&self, run: &Run, task: Option<&Task>) -> Result<()> {
        if self.only_errors && run.status != RunStatus::Error {
            return Ok(());
        }

        let payload = CompletionPayload {
            task: &run.task_name,
            uuid: &run.uuid,
            status: run.status,
            start: run.start,
            end: run.end,
            execution_ref: &run.execution_ref,
            category: task.and_then(|t| t.category.as_deref()),
        };

        let response = self.http.post(&self.url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SchedulerError::Callback(format!(
                "webhook {} returned {status}",
                self.url
            )));
        }
        Ok(())
    }
}
