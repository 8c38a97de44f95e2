//! Status reconciliation.
//!
//! Compares the `Running` runs in storage with what the execution backend
//! reports, classifies finished executions by scanning their logs, and fires
//! completion callbacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use futures_util::TryStreamExt;
use futures_util::future::join_all;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::backend::{ExecutionBackend, ExecutionState, collect_logs, log_stream, render_logs};
use crate::callbacks::Callback;
use crate::error::{Result, SchedulerError};
use crate::storage::{RunUpdate, Storage};
use crate::types::{Run, RunQuery, RunStatus};

fn error_signature() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"CRITICAL|Exception|Traceback").unwrap())
}

/// Whether a log line marks the run as failed.
pub fn contains_error_signature(line: &str) -> bool {
    error_signature().is_match(line)
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Runs classified as `Success`.
    pub succeeded: Vec<String>,
    /// Runs classified as `Error`.
    pub failed: Vec<String>,
    /// Runs the backend still reports as pending or running.
    pub still_active: Vec<String>,
    /// Per-run failures, keyed by run uuid.
    pub errors: Vec<(String, SchedulerError)>,
}

impl ReconcileReport {
    /// Number of runs that reached a terminal status in this pass.
    pub fn finished(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

enum Outcome {
    Succeeded,
    Failed,
    Active,
    /// Another writer already moved the run out of `Running`.
    Skipped,
}

/// Reconciles run records against an execution backend.
pub struct StatusReconciler {
    storage: Arc<dyn Storage>,
    backend: Arc<dyn ExecutionBackend>,
    callbacks: Vec<Arc<dyn Callback>>,
    /// Offset of the next batch into the `Running` runs ordered by start.
    cursor: Mutex<usize>,
}

impl StatusReconciler {
    pub fn new(
        storage: Arc<dyn Storage>,
        backend: Arc<dyn ExecutionBackend>,
        callbacks: Vec<Arc<dyn Callback>>,
    ) -> Self {
        Self {
            storage,
            backend,
            callbacks,
            cursor: Mutex::new(0),
        }
    }

    /// Reconcile one batch of `Running` runs.
    ///
    /// When more runs are running than the backend accepts per describe call,
    /// successive calls walk through them batch by batch.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_running(&self, update_logs: bool) -> Result<ReconcileReport> {
        let running = self.storage.get_runs(RunQuery::status(RunStatus::Running)).await?;
        if running.is_empty() {
            return Ok(ReconcileReport::default());
        }

        let batch = self.next_batch(running);
        self.reconcile_runs(batch, update_logs).await
    }

    fn next_batch(&self, running: Vec<Run>) -> Vec<Run> {
        let limit = self.backend.describe_batch_limit().max(1);
        let total = running.len();
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());

        if total <= limit {
            *cursor = 0;
            return running;
        }

        let start = *cursor % total;
        *cursor = (start + limit) % total;
        debug!(total, limit, start, "reconciling partial batch");
        running
            .into_iter()
            .cycle()
            .skip(start)
            .take(limit)
            .collect()
    }

    /// Reconcile the given runs with a single describe call.
    ///
    /// Fails only when the describe call itself fails; per-run problems are
    /// collected in the report.
    pub async fn reconcile_runs(&self, runs: Vec<Run>, update_logs: bool) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        if runs.is_empty() {
            return Ok(report);
        }

        let refs: Vec<String> = runs.iter().map(|r| r.execution_ref.clone()).collect();
        let states: HashMap<String, ExecutionState> = self
            .backend
            .describe(&refs)
            .await?
            .into_iter()
            .map(|r| (r.execution_ref, r.state))
            .collect();

        let outcomes = join_all(runs.into_iter().map(|run| {
            let state = states.get(&run.execution_ref).cloned();
            async move {
                let uuid = run.uuid.clone();
                (uuid, self.reconcile_one(run, state, update_logs).await)
            }
        }))
        .await;

        for (uuid, outcome) in outcomes {
            match outcome {
                Ok(Outcome::Succeeded) => report.succeeded.push(uuid),
                Ok(Outcome::Failed) => report.failed.push(uuid),
                Ok(Outcome::Active) => report.still_active.push(uuid),
                Ok(Outcome::Skipped) => {}
                Err(e) => {
                    warn!(%uuid, error = %e, "failed to reconcile run");
                    report.errors.push((uuid, e));
                }
            }
        }
        Ok(report)
    }

    async fn reconcile_one(
        &self,
        run: Run,
        state: Option<ExecutionState>,
        update_logs: bool,
    ) -> Result<Outcome> {
        match state {
            None => Err(SchedulerError::UnexpectedBackendState {
                execution_ref: run.execution_ref,
                state: "absent from describe response".to_string(),
            }),
            Some(ExecutionState::Unrecognized(state)) => {
                Err(SchedulerError::UnexpectedBackendState {
                    execution_ref: run.execution_ref,
                    state,
                })
            }
            Some(ExecutionState::Pending | ExecutionState::Running) => {
                debug!(%run, "still running");
                if update_logs {
                    self.refresh_logs(&run).await?;
                }
                Ok(Outcome::Active)
            }
            Some(ExecutionState::Stopped | ExecutionState::Missing) => self.finish(run).await,
        }
    }

    async fn refresh_logs(&self, run: &Run) -> Result<()> {
        let events = collect_logs(self.backend.as_ref(), &run.execution_ref).await?;
        let logs = render_logs(&events);
        let update: RunUpdate = Box::new(move |run| {
            run.logs = logs;
            Ok(())
        });
        match self.storage.update_run(&run.uuid, RunStatus::Running, update).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_status_conflict() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Scan logs up to the first error signature.
    async fn scan_logs(&self, execution_ref: &str) -> Result<(String, bool)> {
        let stream = log_stream(self.backend.as_ref(), execution_ref);
        let mut stream = std::pin::pin!(stream);
        let mut lines = Vec::new();

        while let Some(event) = stream.try_next().await? {
            let matched = contains_error_signature(&event.message);
            lines.push(event.message);
            if matched {
                return Ok((lines.join("\n"), true));
            }
        }
        Ok((lines.join("\n"), false))
    }

    async fn finish(&self, run: Run) -> Result<Outcome> {
        let (logs, has_error) = self.scan_logs(&run.execution_ref).await?;
        let status = if has_error {
            RunStatus::Error
        } else {
            RunStatus::Success
        };

        // Only a run still Running is finalized; a concurrent cancel or
        // earlier pass wins
        let update: RunUpdate = Box::new(move |run| {
            run.logs = logs;
            run.logs_fetched = true;
            run.transition(status)
        });
        let current = match self.storage.update_run(&run.uuid, RunStatus::Running, update).await {
            Ok(current) => current,
            Err(e) if e.is_status_conflict() => {
                debug!(%run, error = %e, "already finalized");
                return Ok(Outcome::Skipped);
            }
            Err(e) => return Err(e),
        };
        info!(run = %current, "run finished");

        let task = self.storage.get_task(&current.task_name).await.ok();
        for callback in &self.callbacks {
            if let Err(e) = callback.on_complete(&current, task.as_ref()).await {
                warn!(callback = callback.name(), run = %current, error = %e, "callback failed");
            }
        }

        Ok(if has_error {
            Outcome::Failed
        } else {
            Outcome::Succeeded
        })
    }
}
