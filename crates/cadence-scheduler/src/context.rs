//! The set of providers a scheduler instance runs against.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::backend::{ExecutionBackend, HttpBackend, LocalBackend};
use crate::callbacks::{Callback, LogCallback, WebhookCallback};
use crate::config::{
    CallbackSettings, EnvironmentSettings, RunnerSettings, Settings, StorageSettings,
};
use crate::environment::{
    EnvironmentProvider, JsonFileEnvironmentProvider, StaticEnvironmentProvider,
};
use crate::error::Result;
use crate::events::EventBus;
use crate::runner::Runner;
use crate::storage::{InMemoryStorage, Storage};
use crate::tasks::{StaticTaskProvider, TaskProvider};

/// Storage, task source, and runner wired together.
pub struct Context {
    pub storage: Arc<dyn Storage>,
    pub tasks: Arc<dyn TaskProvider>,
    pub runner: Arc<Runner>,
    pub events: EventBus,
}

impl Context {
    pub fn new(
        storage: Arc<dyn Storage>,
        tasks: Arc<dyn TaskProvider>,
        environment: Arc<dyn EnvironmentProvider>,
        backend: Arc<dyn ExecutionBackend>,
        callbacks: Vec<Arc<dyn Callback>>,
    ) -> Self {
        let runner = Runner::new(Arc::clone(&storage), environment, backend, callbacks);
        Self {
            storage,
            tasks,
            runner: Arc::new(runner),
            events: EventBus::default(),
        }
    }

    /// Build every provider named in `settings`.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let storage: Arc<dyn Storage> = match settings.storage {
            StorageSettings::Memory => Arc::new(InMemoryStorage::new()),
        };

        let backend: Arc<dyn ExecutionBackend> = match &settings.runner {
            RunnerSettings::Local {
                page_size,
                retention_mins,
            } => {
                let backend = match page_size {
                    Some(size) => LocalBackend::with_page_size(*size),
                    None => LocalBackend::new(),
                };
                Arc::new(match retention_mins {
                    Some(mins) => {
                        backend.with_retention(Duration::from_secs(mins.saturating_mul(60)))
                    }
                    None => backend,
                })
            }
            RunnerSettings::Http {
                base_url,
                cluster,
                batch_limit,
            } => {
                let backend = HttpBackend::new(base_url.as_str(), cluster.as_str());
                Arc::new(match batch_limit {
                    Some(limit) => backend.with_batch_limit(*limit),
                    None => backend,
                })
            }
        };

        let environment: Arc<dyn EnvironmentProvider> = match &settings.environments {
            EnvironmentSettings::Static { environments } => {
                Arc::new(StaticEnvironmentProvider::new(environments.clone()))
            }
            EnvironmentSettings::JsonFile { path } => {
                Arc::new(JsonFileEnvironmentProvider::new(path.clone()))
            }
        };

        let callbacks = settings
            .callbacks
            .iter()
            .map(|c| -> Arc<dyn Callback> {
                match c {
                    CallbackSettings::Log => Arc::new(LogCallback),
                    CallbackSettings::Webhook { url, only_errors } => {
                        Arc::new(WebhookCallback::new(url.as_str(), *only_errors))
                    }
                }
            })
            .collect();

        let tasks = Arc::new(StaticTaskProvider::new(settings.tasks.clone()));
        Ok(Self::new(storage, tasks, environment, backend, callbacks))
    }

    /// Connect storage, load task definitions, and prepare the runner.
    pub async fn initialize(&self) -> Result<()> {
        self.storage.connect().await?;
        self.refresh_tasks().await?;
        info!(backend = self.runner.backend().name(), "context initialized");
        Ok(())
    }

    /// Reload task definitions and re-prepare the runner for them.
    pub async fn refresh_tasks(&self) -> Result<usize> {
        let count = self.tasks.update_tasks(self.storage.as_ref()).await?;
        let tasks = self.storage.get_tasks().await?;
        self.runner.initialize(&tasks).await?;
        Ok(count)
    }
}
