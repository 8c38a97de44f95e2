//! Backend that runs task entrypoints as local child processes.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ExecutionBackend, ExecutionReport, ExecutionState, LogEvent, LogPage};
use crate::error::{Result, SchedulerError};
use crate::types::Task;

/// Default number of log lines per page.
const DEFAULT_PAGE_SIZE: usize = 500;

/// How long a finished execution's state and output are kept.
const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

type LogBuffer = Arc<Mutex<Vec<LogEvent>>>;

struct LocalExecution {
    log: LogBuffer,
    /// Set once the process has exited and its output is drained.
    finished: Arc<OnceLock<Instant>>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl LocalExecution {
    fn is_finished(&self) -> bool {
        self.finished.get().is_some()
    }

    fn expired(&self, retention: Duration) -> bool {
        self.finished
            .get()
            .is_some_and(|at| at.elapsed() >= retention)
    }
}

/// Runs each execution as a child process of the scheduler.
///
/// Execution state lives in memory only, so after a restart every previously
/// placed execution is reported as missing. Finished executions are dropped
/// once they are older than the retention period and then also report as
/// missing.
pub struct LocalBackend {
    executions: Mutex<HashMap<String, LocalExecution>>,
    page_size: usize,
    retention: Duration,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            executions: Mutex::new(HashMap::new()),
            page_size: page_size.max(1),
            retention: DEFAULT_RETENTION,
        }
    }

    /// Keep finished executions for `retention` instead of a day.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

async fn pump<R>(reader: R, log: LogBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => log.lock().await.push(LogEvent {
                timestamp: Some(Utc::now()),
                message: line,
            }),
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read process output");
                break;
            }
        }
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn place(&self, task: &Task, environment: &HashMap<String, String>) -> Result<String> {
        let (program, args) = task.entrypoint.split_first().ok_or_else(|| {
            SchedulerError::BackendUnavailable(format!("task {} has no entrypoint", task.name))
        })?;

        let mut child = Command::new(program)
            .args(args)
            .envs(environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                SchedulerError::BackendUnavailable(format!("failed to spawn {program}: {e}"))
            })?;

        let execution_ref = format!("local/{}/{}", task.name, Uuid::new_v4());
        let log: LogBuffer = Arc::new(Mutex::new(Vec::new()));
        let finished = Arc::new(OnceLock::new());
        let (stop_tx, stop_rx) = oneshot::channel();

        let stdout = child.stdout.take().map(|out| tokio::spawn(pump(out, Arc::clone(&log))));
        let stderr = child.stderr.take().map(|err| tokio::spawn(pump(err, Arc::clone(&log))));

        {
            let finished = Arc::clone(&finished);
            let execution_ref = execution_ref.clone();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status.ok(),
                    _ = stop_rx => {
                        if let Err(e) = child.kill().await {
                            warn!(%execution_ref, error = %e, "failed to kill process");
                        }
                        None
                    }
                };
                // drain remaining output before reporting the execution as stopped
                for handle in [stdout, stderr].into_iter().flatten() {
                    let _ = handle.await;
                }
                let _ = finished.set(Instant::now());
                debug!(%execution_ref, ?status, "local execution finished");
            });
        }

        info!(task = %task.name, %execution_ref, "placed local execution");
        let mut executions = self.executions.lock().await;
        let before = executions.len();
        executions.retain(|_, e| !e.expired(self.retention));
        if executions.len() < before {
            debug!(evicted = before - executions.len(), "dropped expired local executions");
        }
        executions.insert(
            execution_ref.clone(),
            LocalExecution {
                log,
                finished,
                stop_tx: Some(stop_tx),
            },
        );
        Ok(execution_ref)
    }

    async fn describe(&self, execution_refs: &[String]) -> Result<Vec<ExecutionReport>> {
        let executions = self.executions.lock().await;
        Ok(execution_refs
            .iter()
            .map(|execution_ref| {
                let state = match executions.get(execution_ref) {
                    None => ExecutionState::Missing,
                    Some(e) if e.is_finished() => ExecutionState::Stopped,
                    Some(_) => ExecutionState::Running,
                };
                ExecutionReport {
                    execution_ref: execution_ref.clone(),
                    state,
                }
            })
            .collect())
    }

    async fn fetch_logs(&self, execution_ref: &str, page_token: Option<&str>) -> Result<LogPage> {
        let offset = match page_token {
            Some(token) => token.parse::<usize>().map_err(|_| {
                SchedulerError::BackendUnavailable(format!("invalid page token '{token}'"))
            })?,
            None => 0,
        };

        let log = match self.executions.lock().await.get(execution_ref) {
            Some(execution) => Arc::clone(&execution.log),
            None => return Ok(LogPage::default()),
        };

        let log = log.lock().await;
        let start = offset.min(log.len());
        let end = (start + self.page_size).min(log.len());
        Ok(LogPage {
            events: log[start..end].to_vec(),
            next_token: (end < log.len()).then(|| end.to_string()),
        })
    }

    async fn stop(&self, execution_ref: &str) -> Result<()> {
        let mut executions = self.executions.lock().await;
        if let Some(tx) = executions
            .get_mut(execution_ref)
            .and_then(|e| e.stop_tx.take())
        {
            let _ = tx.send(());
            info!(%execution_ref, "stopping local execution");
        }
        Ok(())
    }
}
