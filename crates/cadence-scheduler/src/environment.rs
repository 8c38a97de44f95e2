//! Environment providers.
//!
//! An environment is a named mapping of variables injected into a placed
//! execution. Values are passed through untouched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::error::{Result, SchedulerError};

/// Name → variables lookup.
pub type Environments = HashMap<String, HashMap<String, String>>;

/// Supplies environment mappings by name.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// Variables for the environment `name`.
    async fn get_environment(&self, name: &str) -> Result<HashMap<String, String>>;
}

/// Environments defined inline.
#[derive(Debug, Clone, Default)]
pub struct StaticEnvironmentProvider {
    environments: Environments,
}

impl StaticEnvironmentProvider {
    pub fn new(environments: Environments) -> Self {
        Self { environments }
    }
}

#[async_trait]
impl EnvironmentProvider for StaticEnvironmentProvider {
    async fn get_environment(&self, name: &str) -> Result<HashMap<String, String>> {
        self.environments
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::Environment(format!("unknown environment: {name}")))
    }
}

/// Environments read from a JSON file of the form
/// `{"name": {"VAR": "value"}}`.
///
/// The file is re-read on every lookup so edits are picked up without a
/// restart.
#[derive(Debug, Clone)]
pub struct JsonFileEnvironmentProvider {
    path: PathBuf,
}

impl JsonFileEnvironmentProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Environments> {
        let content = fs::read_to_string(&self.path).await.map_err(|e| {
            SchedulerError::Environment(format!("failed to read {}: {e}", self.path.display()))
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[async_trait]
impl EnvironmentProvider for JsonFileEnvironmentProvider {
    async fn get_environment(&self, name: &str) -> Result<HashMap<String, String>> {
        let mut environments = self.load().await?;
        debug!(path = %self.path.display(), count = environments.len(), "loaded environments");
        environments
            .remove(name)
            .ok_or_else(|| SchedulerError::Environment(format!("unknown environment: {name}")))
    }
}
