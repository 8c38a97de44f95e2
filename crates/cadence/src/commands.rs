//! One-shot subcommands.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use miette::Result;
use tracing::info;

use cadence_scheduler::{Context, CronSchedule, Run, Settings, Task};

/// Lines describing the next `count` run times of each scheduled task.
pub fn preview(tasks: &[Task], count: usize, after: DateTime<Utc>) -> Vec<String> {
    let mut lines = Vec::new();
    for task in tasks.iter().filter(|t| t.enabled) {
        let Some(trigger) = task.primary_trigger() else {
            continue;
        };
        match CronSchedule::parse(&trigger.cron).and_then(|s| s.upcoming(after, count)) {
            Ok(times) => {
                lines.push(format!("{} ({}):", task.name, trigger.cron));
                lines.extend(times.iter().map(|t| format!("  {t}")));
            }
            Err(e) => lines.push(format!("{}: {e}", task.name)),
        }
    }
    lines
}

pub async fn next_runs(
    settings_path: Option<&Path>,
    cron: Option<&str>,
    count: usize,
    after: DateTime<Utc>,
) -> Result<()> {
    let tasks = match (cron, settings_path) {
        (Some(expression), _) => vec![Task::new("cron").with_cron(expression)],
        (None, Some(path)) => {
            Settings::load(path)
                .await
                .map_err(|e| miette::miette!("{}", e))?
                .tasks
        }
        (None, None) => {
            return Err(miette::miette!("either --cron or --settings is required"));
        }
    };

    for line in preview(&tasks, count, after) {
        println!("{line}");
    }
    Ok(())
}

fn summarize(run: &Run) -> String {
    let mut line = format!("{run}");
    if let Some(note) = &run.exit_note {
        line.push_str(&format!(" ({note})"));
    }
    line
}

/// Start `task_name` once, optionally waiting for it to finish.
pub async fn run_once(
    settings_path: &Path,
    task_name: &str,
    wait: bool,
    poll_interval: u64,
) -> Result<()> {
    let settings = Settings::load(settings_path)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    let context = Context::from_settings(&settings).map_err(|e| miette::miette!("{}", e))?;
    context
        .initialize()
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    let task = context
        .storage
        .get_task(task_name)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    let mut run = context
        .runner
        .run_task(&task)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("started {}", summarize(&run));

    if !wait {
        return Ok(());
    }

    let poll = Duration::from_secs(poll_interval.max(1));
    while run.status.is_active() {
        tokio::time::sleep(poll).await;
        run = context
            .runner
            .update_status(&run.uuid, false)
            .await
            .map_err(|e| miette::miette!("{}", e))?;
    }

    info!(run = %run, "run finished");
    if !run.logs.is_empty() {
        println!("{}", run.logs);
    }
    println!("finished {}", summarize(&run));
    Ok(())
}
