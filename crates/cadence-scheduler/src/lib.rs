//! Scheduling and run-lifecycle engine for Cadence.
//!
//! This crate provides:
//! - Cron next-run computation over a supported field subset
//! - Run records with an at-most-one-active-run-per-task guarantee
//! - Pluggable execution backends (local processes, a remote HTTP cluster API)
//! - Reconciliation of running runs by polling the backend and scanning logs
//! - The beat loop that ties scheduling, reconciliation, and task refresh together

pub mod backend;
mod beat;
mod callbacks;
mod config;
mod context;
pub mod cron;
mod environment;
mod error;
mod events;
mod reconcile;
mod runner;
mod storage;
mod tasks;
mod types;

pub use backend::{
    ExecutionBackend, ExecutionReport, ExecutionState, HttpBackend, LocalBackend, LogEvent,
    LogPage, collect_logs, log_stream, render_logs,
};
pub use beat::{Beat, BeatConfig, TickSummary};
pub use callbacks::{Callback, LogCallback, WebhookCallback};
pub use config::{
    BeatSettings, CallbackSettings, EnvironmentSettings, RunnerSettings, Settings,
    StorageSettings,
};
pub use context::Context;
pub use cron::{CronSchedule, next_run_after};
pub use environment::{
    EnvironmentProvider, Environments, JsonFileEnvironmentProvider, StaticEnvironmentProvider,
};
pub use error::{Result, SchedulerError};
pub use events::EventBus;
pub use reconcile::{ReconcileReport, StatusReconciler, contains_error_signature};
pub use runner::Runner;
pub use storage::{InMemoryStorage, RunUpdate, Storage};
pub use tasks::{StaticTaskProvider, TaskProvider};
pub use types::{Run, RunQuery, RunStatus, Task, Trigger};
