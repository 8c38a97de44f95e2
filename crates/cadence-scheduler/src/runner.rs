//! Starting, tracking, and cancelling runs.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::ExecutionBackend;
use crate::callbacks::Callback;
use crate::environment::EnvironmentProvider;
use crate::error::{Result, SchedulerError};
use crate::reconcile::{ReconcileReport, StatusReconciler};
use crate::storage::{RunUpdate, Storage};
use crate::types::{Run, RunStatus, Task};

/// Places task executions and keeps their run records in step with the
/// execution backend.
pub struct Runner {
    storage: Arc<dyn Storage>,
    environment: Arc<dyn EnvironmentProvider>,
    backend: Arc<dyn ExecutionBackend>,
    reconciler: StatusReconciler,
}

impl Runner {
    pub fn new(
        storage: Arc<dyn Storage>,
        environment: Arc<dyn EnvironmentProvider>,
        backend: Arc<dyn ExecutionBackend>,
        callbacks: Vec<Arc<dyn Callback>>,
    ) -> Self {
        let reconciler =
            StatusReconciler::new(Arc::clone(&storage), Arc::clone(&backend), callbacks);
        Self {
            storage,
            environment,
            backend,
            reconciler,
        }
    }

    pub fn backend(&self) -> &dyn ExecutionBackend {
        self.backend.as_ref()
    }

    /// Prepare the backend for `tasks`. Safe to call repeatedly; starts nothing.
    pub async fn initialize(&self, tasks: &[Task]) -> Result<()> {
        self.backend.initialize(tasks).await?;
        info!(backend = self.backend.name(), tasks = tasks.len(), "runner initialized");
        Ok(())
    }

    /// Start a run of `task`.
    ///
    /// Fails with [`SchedulerError::AlreadyRunning`] when the task has an
    /// active run. If placement fails the run is cancelled and
    /// [`SchedulerError::BackendUnavailable`] is returned. If the run is
    /// cancelled while placement is in flight, the placed execution is
    /// stopped and [`SchedulerError::StatusConflict`] is returned.
    #[tracing::instrument(skip(self, task), fields(task = %task.name))]
    pub async fn run_task(&self, task: &Task) -> Result<Run> {
        let run = self.storage.add_run(Run::pending(&task.name)).await?;

        let execution_ref = match self.place(task).await {
            Ok(execution_ref) => execution_ref,
            Err(e) => {
                warn!(%run, error = %e, "placement failed, cancelling run");
                let note = format!("placement failed: {e}");
                let cancel: RunUpdate = Box::new(move |run| {
                    run.exit_note = Some(note);
                    run.transition(RunStatus::Cancelled)
                });
                match self.storage.update_run(&run.uuid, RunStatus::Pending, cancel).await {
                    Ok(_) => {}
                    Err(conflict) if conflict.is_status_conflict() => {
                        debug!(%run, "run already left pending");
                    }
                    Err(other) => return Err(other),
                }
                return Err(match e {
                    SchedulerError::BackendUnavailable(_) => e,
                    other => SchedulerError::BackendUnavailable(other.to_string()),
                });
            }
        };

        let placed = execution_ref.clone();
        let start: RunUpdate = Box::new(move |run| {
            run.execution_ref = placed;
            run.transition(RunStatus::Running)
        });
        match self.storage.update_run(&run.uuid, RunStatus::Pending, start).await {
            Ok(run) => {
                info!(%run, execution_ref = %run.execution_ref, "run started");
                Ok(run)
            }
            Err(e) => {
                warn!(
                    %run,
                    %execution_ref,
                    error = %e,
                    "run changed during placement, stopping execution"
                );
                if let Err(stop_err) = self.backend.stop(&execution_ref).await {
                    warn!(%execution_ref, error = %stop_err, "failed to stop orphaned execution");
                }
                Err(e)
            }
        }
    }

    async fn place(&self, task: &Task) -> Result<String> {
        let environment = match &task.environment {
            Some(name) => self.environment.get_environment(name).await?,
            None => HashMap::new(),
        };
        self.backend.place(task, &environment).await
    }

    /// Bring a single run up to date with the backend.
    ///
    /// Pending and terminal runs are returned unchanged.
    #[tracing::instrument(skip(self))]
    pub async fn update_status(&self, uuid: &str, update_logs: bool) -> Result<Run> {
        let run = self.storage.get_run(uuid).await?;
        if run.status != RunStatus::Running {
            return Ok(run);
        }

        let mut report = self.reconciler.reconcile_runs(vec![run], update_logs).await?;
        if let Some((_, e)) = report.errors.pop() {
            return Err(e);
        }
        self.storage.get_run(uuid).await
    }

    /// Reconcile the next batch of running runs.
    pub async fn reconcile(&self, update_logs: bool) -> Result<ReconcileReport> {
        self.reconciler.reconcile_running(update_logs).await
    }

    /// Administratively cancel an active run, stopping its execution.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, uuid: &str) -> Result<Run> {
        // statuses only move forward, so this settles within a few rounds
        loop {
            let run = self.storage.get_run(uuid).await?;
            if !run.status.can_transition_to(RunStatus::Cancelled) {
                return Err(SchedulerError::InvalidTransition {
                    from: run.status,
                    to: RunStatus::Cancelled,
                });
            }
            if run.status == RunStatus::Running && !run.execution_ref.is_empty() {
                self.backend.stop(&run.execution_ref).await?;
            }

            let cancel: RunUpdate = Box::new(|run| {
                run.transition(RunStatus::Cancelled)?;
                run.exit_note = Some("cancelled".to_string());
                Ok(())
            });
            match self.storage.update_run(uuid, run.status, cancel).await {
                Ok(run) => {
                    info!(%run, "run cancelled");
                    return Ok(run);
                }
                Err(e) if e.is_status_conflict() => {
                    debug!(%uuid, error = %e, "run moved while cancelling, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}
