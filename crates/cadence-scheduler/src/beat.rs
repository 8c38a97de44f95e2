//! The scheduler control loop.
//!
//! Every tick the beat publishes a status line, reconciles running runs,
//! refreshes task definitions when due, and starts every task whose next run
//! time has passed. Progress is reported as plain-text lines on the context's
//! [`EventBus`](crate::events::EventBus).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

use crate::config::BeatSettings;
use crate::context::Context;
use crate::cron::next_run_after;
use crate::error::{Result, SchedulerError};
use crate::reconcile::ReconcileReport;
use crate::types::{RunQuery, RunStatus};

/// Loop timing.
#[derive(Debug, Clone)]
pub struct BeatConfig {
    pub tick_interval: Duration,
    /// How often task definitions are reloaded.
    pub refresh_interval: Duration,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(120 * 60),
        }
    }
}

impl From<&BeatSettings> for BeatConfig {
    fn from(settings: &BeatSettings) -> Self {
        Self {
            tick_interval: settings.tick_interval(),
            refresh_interval: settings.refresh_interval(),
        }
    }
}

#[derive(Debug, Clone)]
struct ScheduleEntry {
    cron: String,
    next_run: DateTime<Utc>,
}

/// What happened during one tick.
#[derive(Debug, Default)]
pub struct TickSummary {
    pub pending: usize,
    pub running: usize,
    pub reconciled: ReconcileReport,
    pub refreshed: bool,
    /// Tasks started this tick.
    pub started: Vec<String>,
    /// Due tasks skipped because a run was still active.
    pub already_running: Vec<String>,
    /// Due tasks that failed to start.
    pub failed: Vec<(String, SchedulerError)>,
}

/// Drives scheduling for one [`Context`].
pub struct Beat {
    context: Arc<Context>,
    config: BeatConfig,
    schedule: HashMap<String, ScheduleEntry>,
    next_refresh: Option<DateTime<Utc>>,
}

impl Beat {
    pub fn new(context: Arc<Context>, config: BeatConfig) -> Self {
        Self {
            context,
            config,
            schedule: HashMap::new(),
            next_refresh: None,
        }
    }

    fn publish(&self, line: impl Into<String>) {
        self.context.events.publish(line);
    }

    /// Next run time currently cached for `task_name`.
    pub fn next_run(&self, task_name: &str) -> Option<DateTime<Utc>> {
        self.schedule.get(task_name).map(|e| e.next_run)
    }

    /// Initialize the context and compute the initial schedule.
    pub async fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.context.initialize().await?;
        self.load_schedule(now).await?;
        self.next_refresh = Some(now + self.refresh_interval());
        Ok(())
    }

    fn refresh_interval(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.refresh_interval)
            .unwrap_or_else(|_| chrono::Duration::days(1))
    }

    /// Rebuild the schedule from stored task definitions.
    ///
    /// Tasks whose trigger is unchanged keep their cached next run time;
    /// disabled or removed tasks are dropped.
    pub async fn load_schedule(&mut self, now: DateTime<Utc>) -> Result<()> {
        let tasks = self.context.storage.get_tasks().await?;
        let mut schedule = HashMap::new();

        for task in tasks.iter().filter(|t| t.enabled) {
            let Some(trigger) = task.primary_trigger() else {
                continue;
            };
            if task.triggers.len() > 1 {
                self.publish(format!(
                    "{}: {} triggers configured, only the first is used",
                    task.name,
                    task.triggers.len()
                ));
            }

            if let Some(entry) = self
                .schedule
                .get(&task.name)
                .filter(|e| e.cron == trigger.cron)
            {
                schedule.insert(task.name.clone(), entry.clone());
                continue;
            }

            match next_run_after(&trigger.cron, now) {
                Ok(next_run) => {
                    self.publish(format!("{} next run at {next_run}", task.name));
                    schedule.insert(
                        task.name.clone(),
                        ScheduleEntry {
                            cron: trigger.cron.clone(),
                            next_run,
                        },
                    );
                }
                Err(e) => self.publish(format!("{}: not scheduled: {e}", task.name)),
            }
        }

        self.schedule = schedule;
        Ok(())
    }

    /// Run one iteration of the loop at time `now`.
    ///
    /// Errors for individual tasks and runs are reported in the summary and
    /// on the event bus; only storage failures while counting runs abort the
    /// tick.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickSummary> {
        let mut summary = TickSummary::default();
        let storage = Arc::clone(&self.context.storage);

        summary.pending = storage.get_runs(RunQuery::status(RunStatus::Pending)).await?.len();
        summary.running = storage.get_runs(RunQuery::status(RunStatus::Running)).await?.len();
        self.publish(format!(
            "{now}: pending={} running={}",
            summary.pending, summary.running
        ));

        match self.context.runner.reconcile(true).await {
            Ok(report) => {
                for (uuid, e) in &report.errors {
                    self.publish(format!("status update failed for run {uuid}: {e}"));
                }
                summary.reconciled = report;
            }
            Err(e) => self.publish(format!("status update failed: {e}")),
        }

        if self.next_refresh.is_none_or(|at| now >= at) {
            summary.refreshed = true;
            self.refresh(now).await;
        }

        let mut due: Vec<String> = self
            .schedule
            .iter()
            .filter(|(_, entry)| entry.next_run <= now)
            .map(|(name, _)| name.clone())
            .collect();
        due.sort();

        for task_name in due {
            let next_run = self.advance(&task_name, now);
            let next = next_run.map_or_else(|| "never".to_string(), |t| t.to_string());

            let result = match storage.get_task(&task_name).await {
                Ok(task) => self.context.runner.run_task(&task).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(run) => {
                    self.publish(format!("started {task_name}: {run}.  next run at {next}"));
                    summary.started.push(task_name);
                }
                Err(e) if e.is_already_running() => {
                    self.publish(format!("{task_name}: already running.  next run at {next}"));
                    summary.already_running.push(task_name);
                }
                Err(e) => {
                    self.publish(format!("{task_name}: failed to start: {e}.  next run at {next}"));
                    summary.failed.push((task_name, e));
                }
            }
        }

        Ok(summary)
    }

    /// Move a due task's next run past `now`.
    fn advance(&mut self, task_name: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let entry = self.schedule.get_mut(task_name)?;
        match next_run_after(&entry.cron, now) {
            Ok(next_run) => {
                entry.next_run = next_run;
                Some(next_run)
            }
            Err(e) => {
                error!(task = task_name, error = %e, "dropping task from schedule");
                self.schedule.remove(task_name);
                None
            }
        }
    }

    async fn refresh(&mut self, now: DateTime<Utc>) {
        self.publish("updating config...");
        if let Err(e) = self.context.refresh_tasks().await {
            self.publish(format!("task refresh failed: {e}"));
        }
        if let Err(e) = self.load_schedule(now).await {
            self.publish(format!("schedule rebuild failed: {e}"));
        }
        let next_refresh = now + self.refresh_interval();
        self.next_refresh = Some(next_refresh);
        self.publish(format!("updated tasks, will run again at {next_refresh}"));
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("beat starting");
        self.start(Utc::now()).await?;

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("beat received shutdown signal");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "tick failed");
                    }
                }
            }
        }

        info!("beat shut down gracefully");
        Ok(())
    }
}
