//! Settings file and provider selection.
//!
//! Each pluggable component is chosen by a `provider` (or `plugin`) tag in the
//! JSON settings file. Unknown kinds fail when the file is parsed.
//!
//! ```json
//! {
//!   "runner": {"provider": "http", "base_url": "http://ecs-proxy", "cluster": "scrapers"},
//!   "environments": {"provider": "json_file", "path": "/etc/cadence/environments.json"},
//!   "callbacks": [{"plugin": "log"}],
//!   "tasks": [{"name": "nightly", "triggers": [{"cron": "0 4 * * ?"}], "entrypoint": ["scrape"]}],
//!   "beat": {"tick_interval_secs": 60, "refresh_interval_mins": 120}
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::environment::Environments;
use crate::error::{Result, SchedulerError};
use crate::types::Task;

/// Top-level settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub environments: EnvironmentSettings,
    /// Task definitions served by the static task provider.
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub callbacks: Vec<CallbackSettings>,
    #[serde(default)]
    pub beat: BeatSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum StorageSettings {
    #[default]
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum RunnerSettings {
    /// Child processes on this host.
    Local {
        #[serde(default)]
        page_size: Option<usize>,
        /// Minutes a finished execution's output is kept.
        #[serde(default)]
        retention_mins: Option<u64>,
    },
    /// Remote cluster execution API.
    Http {
        base_url: String,
        cluster: String,
        #[serde(default)]
        batch_limit: Option<usize>,
    },
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::Local {
            page_size: None,
            retention_mins: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum EnvironmentSettings {
    Static {
        #[serde(default)]
        environments: Environments,
    },
    JsonFile {
        path: PathBuf,
    },
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self::Static {
            environments: Environments::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "plugin", rename_all = "snake_case")]
pub enum CallbackSettings {
    Log,
    Webhook {
        url: String,
        #[serde(default)]
        only_errors: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BeatSettings {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_refresh_interval_mins")]
    pub refresh_interval_mins: u64,
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_refresh_interval_mins() -> u64 {
    120
}

impl Default for BeatSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            refresh_interval_mins: default_refresh_interval_mins(),
        }
    }
}

impl BeatSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_mins.saturating_mul(60))
    }
}

impl Settings {
    /// Parse and validate settings from JSON text.
    pub fn from_json(content: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(content)
            .map_err(|e| SchedulerError::Config(format!("invalid settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read settings from a JSON file.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            SchedulerError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.beat.tick_interval_secs == 0 {
            return Err(SchedulerError::Config(
                "beat.tick_interval_secs must be positive".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.name.is_empty() {
                return Err(SchedulerError::Config("task with empty name".to_string()));
            }
            if !seen.insert(task.name.as_str()) {
                return Err(SchedulerError::Config(format!(
                    "duplicate task name: {}",
                    task.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_settings_use_defaults() {
        let settings = Settings::from_json("{}").unwrap();
        assert!(matches!(settings.storage, StorageSettings::Memory));
        assert!(matches!(
            settings.runner,
            RunnerSettings::Local {
                page_size: None,
                retention_mins: None
            }
        ));
        assert!(settings.tasks.is_empty());
        assert_eq!(settings.beat.tick_interval(), Duration::from_secs(60));
        assert_eq!(settings.beat.refresh_interval(), Duration::from_secs(7200));
    }

    #[test]
    fn test_full_settings() {
        let settings = Settings::from_json(
            r#"{
                "runner": {"provider": "http", "base_url": "http://proxy", "cluster": "c1", "batch_limit": 10},
                "environments": {"provider": "json_file", "path": "/tmp/env.json"},
                "callbacks": [{"plugin": "log"}, {"plugin": "webhook", "url": "http://hook", "only_errors": true}],
                "tasks": [
                    {"name": "a", "triggers": [{"cron": "0 4 * * ?"}], "entrypoint": ["run"]},
                    {"name": "b", "enabled": false}
                ],
                "beat": {"tick_interval_secs": 5}
            }"#,
        )
        .unwrap();

        assert!(matches!(
            settings.runner,
            RunnerSettings::Http { ref cluster, batch_limit: Some(10), .. } if cluster == "c1"
        ));
        assert!(matches!(settings.environments, EnvironmentSettings::JsonFile { .. }));
        assert_eq!(settings.callbacks.len(), 2);
        assert!(settings.tasks[0].enabled);
        assert!(!settings.tasks[1].enabled);
        assert_eq!(settings.beat.refresh_interval_mins, 120);
    }

    #[test]
    fn test_huge_refresh_interval_saturates() {
        let json = format!(r#"{{"beat": {{"refresh_interval_mins": {}}}}}"#, u64::MAX);
        let settings = Settings::from_json(&json).unwrap();
        assert_eq!(settings.beat.refresh_interval(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        let err = Settings::from_json(r#"{"runner": {"provider": "lambda"}}"#).unwrap_err();
        assert!(matches!(err, SchedulerError::Config(msg) if msg.contains("lambda")));
    }

    #[test]
    fn test_duplicate_task_names_rejected() {
        let err = Settings::from_json(r#"{"tasks": [{"name": "a"}, {"name": "a"}]}"#).unwrap_err();
        assert!(matches!(err, SchedulerError::Config(msg) if msg.contains("duplicate")));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        tokio::fs::write(&path, r#"{"tasks": [{"name": "a"}]}"#)
            .await
            .unwrap();

        let settings = Settings::load(&path).await.unwrap();
        assert_eq!(settings.tasks.len(), 1);

        let missing = Settings::load(&dir.path().join("missing.json")).await;
        assert!(matches!(missing, Err(SchedulerError::Config(_))));
    }
}
