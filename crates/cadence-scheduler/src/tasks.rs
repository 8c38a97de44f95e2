//! Task providers.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::Result;
use crate::storage::Storage;
use crate::types::Task;

/// Source of task definitions.
///
/// `update_tasks` writes the current definitions into storage; the scheduler
/// reads them back from there.
#[async_trait]
pub trait TaskProvider: Send + Sync {
    /// Refresh the stored task definitions, returning how many were stored.
    async fn update_tasks(&self, storage: &dyn Storage) -> Result<usize>;
}

/// Task definitions held in memory, typically from the settings file.
#[derive(Debug, Clone, Default)]
pub struct StaticTaskProvider {
    tasks: Vec<Task>,
}

impl StaticTaskProvider {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }
}

#[async_trait]
impl TaskProvider for StaticTaskProvider {
    async fn update_tasks(&self, storage: &dyn Storage) -> Result<usize> {
        for task in &self.tasks {
            if task.triggers.len() > 1 {
                warn!(
                    task = %task.name,
                    triggers = task.triggers.len(),
                    "only the first trigger of a task is used"
                );
            }
        }
        storage.set_tasks(self.tasks.clone()).await?;
        info!(count = self.tasks.len(), "updated task definitions");
        Ok(self.tasks.len())
    }
}
