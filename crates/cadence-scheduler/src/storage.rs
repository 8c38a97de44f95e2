//! Persistence of tasks and runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::types::{Run, RunQuery, RunStatus, Task};

/// Change applied to a run by [`Storage::update_run`].
pub type RunUpdate = Box<dyn FnOnce(&mut Run) -> Result<()> + Send>;

/// Storage for task definitions and run records.
///
/// Implementations must make [`Storage::add_run`] atomic per task name: the
/// single-flight check and the insert are one operation, so two concurrent
/// callers can never both create an active run for the same task.
/// [`Storage::update_run`] is atomic per run in the same way.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Open connections or create schema. Called once at startup.
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// All known tasks, ordered by name.
    async fn get_tasks(&self) -> Result<Vec<Task>>;

    /// A single task by name.
    async fn get_task(&self, name: &str) -> Result<Task>;

    /// Replace the stored task definitions wholesale.
    async fn set_tasks(&self, tasks: Vec<Task>) -> Result<()>;

    /// Runs matching `query`, oldest first.
    async fn get_runs(&self, query: RunQuery) -> Result<Vec<Run>>;

    /// A single run by uuid.
    async fn get_run(&self, uuid: &str) -> Result<Run>;

    /// Insert a new run, assigning its uuid.
    ///
    /// Fails with [`SchedulerError::AlreadyRunning`] when the task already has
    /// a pending or running run.
    async fn add_run(&self, run: Run) -> Result<Run>;

    /// Apply `update` to a run if its stored status is still `expected`.
    ///
    /// Fails with [`SchedulerError::StatusConflict`] when another writer has
    /// moved the run on. If `update` fails the stored run is left untouched.
    async fn update_run(&self, uuid: &str, expected: RunStatus, update: RunUpdate) -> Result<Run>;
}

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<String, Task>,
    runs: Vec<Run>,
}

/// Process-local storage.
#[derive(Default)]
pub struct InMemoryStorage {
    state: RwLock<MemoryState>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get_tasks(&self) -> Result<Vec<Task>> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tasks)
    }

    async fn get_task(&self, name: &str) -> Result<Task> {
        self.state
            .read()
            .await
            .tasks
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::task_not_found(name))
    }

    async fn set_tasks(&self, tasks: Vec<Task>) -> Result<()> {
        let mut state = self.state.write().await;
        state.tasks = tasks.into_iter().map(|t| (t.name.clone(), t)).collect();
        debug!(count = state.tasks.len(), "stored task definitions");
        Ok(())
    }

    async fn get_runs(&self, query: RunQuery) -> Result<Vec<Run>> {
        let state = self.state.read().await;
        let mut runs: Vec<Run> = state
            .runs
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.start);
        Ok(runs)
    }

    async fn get_run(&self, uuid: &str) -> Result<Run> {
        self.state
            .read()
            .await
            .runs
            .iter()
            .find(|r| r.uuid == uuid)
            .cloned()
            .ok_or_else(|| SchedulerError::run_not_found(uuid))
    }

    async fn add_run(&self, mut run: Run) -> Result<Run> {
        // Check and insert under the same write lock
        let mut state = self.state.write().await;
        if state
            .runs
            .iter()
            .any(|r| r.task_name == run.task_name && r.status.is_active())
        {
            return Err(SchedulerError::AlreadyRunning(run.task_name));
        }

        run.uuid = Uuid::new_v4().to_string();
        state.runs.push(run.clone());
        debug!(uuid = %run.uuid, task = %run.task_name, "run added");
        Ok(run)
    }

    async fn update_run(&self, uuid: &str, expected: RunStatus, update: RunUpdate) -> Result<Run> {
        let mut state = self.state.write().await;
        let slot = state
            .runs
            .iter_mut()
            .find(|r| r.uuid == uuid)
            .ok_or_else(|| SchedulerError::run_not_found(uuid))?;
        if slot.status != expected {
            return Err(SchedulerError::StatusConflict {
                uuid: uuid.to_string(),
                expected,
                actual: slot.status,
            });
        }

        let mut updated = slot.clone();
        update(&mut updated)?;
        *slot = updated.clone();
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_add_run_assigns_uuid() {
        let storage = InMemoryStorage::new();
        let run = storage.add_run(Run::pending("a")).await.unwrap();
        assert!(!run.uuid.is_empty());
        assert_eq!(storage.get_run(&run.uuid).await.unwrap(), run);
    }

    #[tokio::test]
    async fn test_add_run_rejects_second_active_run() {
        let storage = InMemoryStorage::new();
        storage.add_run(Run::pending("a")).await.unwrap();

        let err = storage.add_run(Run::pending("a")).await.unwrap_err();
        assert!(err.is_already_running());

        // other tasks are unaffected
        assert!(storage.add_run(Run::pending("b")).await.is_ok());
    }

    #[tokio::test]
    async fn test_add_run_allowed_after_terminal() {
        let storage = InMemoryStorage::new();
        let run = storage.add_run(Run::pending("a")).await.unwrap();
        storage
            .update_run(
                &run.uuid,
                RunStatus::Pending,
                Box::new(|run| run.transition(RunStatus::Cancelled)),
            )
            .await
            .unwrap();

        assert!(storage.add_run(Run::pending("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_add_run_single_winner() {
        let storage = Arc::new(InMemoryStorage::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let storage = Arc::clone(&storage);
                tokio::spawn(async move { storage.add_run(Run::pending("race")).await })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(storage.get_runs(RunQuery::task("race")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_task_not_found() {
        let storage = InMemoryStorage::new();
        let err = storage.get_task("missing").await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound { kind: "task", .. }));
    }

    #[tokio::test]
    async fn test_update_unknown_run_fails() {
        let storage = InMemoryStorage::new();
        let err = storage
            .update_run("nope", RunStatus::Pending, Box::new(|_| Ok(())))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound { kind: "run", .. }));
    }

    #[tokio::test]
    async fn test_update_run_rejects_stale_status() {
        let storage = InMemoryStorage::new();
        let run = storage.add_run(Run::pending("a")).await.unwrap();
        storage
            .update_run(
                &run.uuid,
                RunStatus::Pending,
                Box::new(|run| {
                    run.exit_note = Some("cancelled".to_string());
                    run.transition(RunStatus::Cancelled)
                }),
            )
            .await
            .unwrap();

        // a writer still holding the Pending snapshot loses
        let err = storage
            .update_run(
                &run.uuid,
                RunStatus::Pending,
                Box::new(|run| run.transition(RunStatus::Running)),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::StatusConflict {
                expected: RunStatus::Pending,
                actual: RunStatus::Cancelled,
                ..
            }
        ));

        let stored = storage.get_run(&run.uuid).await.unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert_eq!(stored.exit_note.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_failed_update_leaves_run_untouched() {
        let storage = InMemoryStorage::new();
        let run = storage.add_run(Run::pending("a")).await.unwrap();
        let err = storage
            .update_run(
                &run.uuid,
                RunStatus::Pending,
                Box::new(|run| {
                    run.logs = "partial".to_string();
                    run.transition(RunStatus::Success)
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));
        assert_eq!(storage.get_run(&run.uuid).await.unwrap(), run);
    }

    #[tokio::test]
    async fn test_set_tasks_replaces() {
        let storage = InMemoryStorage::new();
        storage
            .set_tasks(vec![Task::new("b"), Task::new("a")])
            .await
            .unwrap();
        let names: Vec<_> = storage
            .get_tasks()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        storage.set_tasks(vec![Task::new("c")]).await.unwrap();
        assert!(storage.get_task("a").await.is_err());
    }
}
