//! Shared fakes for scheduler integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use cadence_scheduler::{
    Callback, EnvironmentProvider, ExecutionBackend, ExecutionReport, ExecutionState, LogEvent,
    LogPage, Result, Run, SchedulerError, StaticEnvironmentProvider, Task,
};

#[derive(Default)]
struct Script {
    placed: usize,
    refuse: bool,
    describe_fails: bool,
    logs_fail: bool,
    /// Refs absent from this map are omitted from describe responses.
    states: HashMap<String, ExecutionState>,
    pages: HashMap<String, Vec<LogPage>>,
    describe_calls: Vec<Vec<String>>,
    log_requests: usize,
}

/// Backend whose answers are set by the test.
pub struct ScriptedBackend {
    script: Mutex<Script>,
    batch_limit: usize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::with_batch_limit(100)
    }

    pub fn with_batch_limit(batch_limit: usize) -> Self {
        Self {
            script: Mutex::new(Script::default()),
            batch_limit,
        }
    }

    pub fn refuse_placement(&self, refuse: bool) {
        self.script.lock().unwrap().refuse = refuse;
    }

    /// Make every describe call fail until switched back.
    pub fn fail_describe(&self, fail: bool) {
        self.script.lock().unwrap().describe_fails = fail;
    }

    /// Make every log fetch fail until switched back.
    pub fn fail_logs(&self, fail: bool) {
        self.script.lock().unwrap().logs_fail = fail;
    }

    pub fn set_state(&self, execution_ref: &str, state: ExecutionState) {
        self.script
            .lock()
            .unwrap()
            .states
            .insert(execution_ref.to_string(), state);
    }

    pub fn forget(&self, execution_ref: &str) {
        self.script.lock().unwrap().states.remove(execution_ref);
    }

    /// Serve `lines` as a single page of logs.
    pub fn set_logs(&self, execution_ref: &str, lines: &[&str]) {
        self.set_pages(execution_ref, vec![lines.to_vec()]);
    }

    /// Serve each inner slice as one page, chained by index tokens.
    pub fn set_pages(&self, execution_ref: &str, pages: Vec<Vec<&str>>) {
        let count = pages.len();
        let pages = pages
            .into_iter()
            .enumerate()
            .map(|(i, lines)| LogPage {
                events: lines.into_iter().map(LogEvent::new).collect(),
                next_token: (i + 1 < count).then(|| (i + 1).to_string()),
            })
            .collect();
        self.script
            .lock()
            .unwrap()
            .pages
            .insert(execution_ref.to_string(), pages);
    }

    pub fn describe_calls(&self) -> Vec<Vec<String>> {
        self.script.lock().unwrap().describe_calls.clone()
    }

    pub fn log_requests(&self) -> usize {
        self.script.lock().unwrap().log_requests
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn place(&self, task: &Task, _env: &HashMap<String, String>) -> Result<String> {
        let mut script = self.script.lock().unwrap();
        if script.refuse {
            return Err(SchedulerError::BackendUnavailable("refused".to_string()));
        }
        script.placed += 1;
        let execution_ref = format!("{}-{}", task.name, script.placed);
        script
            .states
            .insert(execution_ref.clone(), ExecutionState::Running);
        Ok(execution_ref)
    }

    async fn describe(&self, refs: &[String]) -> Result<Vec<ExecutionReport>> {
        let mut script = self.script.lock().unwrap();
        script.describe_calls.push(refs.to_vec());
        if script.describe_fails {
            return Err(SchedulerError::BackendUnavailable("describe refused".to_string()));
        }
        Ok(refs
            .iter()
            .filter_map(|r| {
                script.states.get(r).map(|state| ExecutionReport {
                    execution_ref: r.clone(),
                    state: state.clone(),
                })
            })
            .collect())
    }

    async fn fetch_logs(&self, execution_ref: &str, token: Option<&str>) -> Result<LogPage> {
        let mut script = self.script.lock().unwrap();
        script.log_requests += 1;
        if script.logs_fail {
            return Err(SchedulerError::BackendUnavailable("logs unavailable".to_string()));
        }
        let index = token.map(|t| t.parse::<usize>().unwrap()).unwrap_or(0);
        Ok(script
            .pages
            .get(execution_ref)
            .and_then(|pages| pages.get(index))
            .cloned()
            .unwrap_or_default())
    }

    fn describe_batch_limit(&self) -> usize {
        self.batch_limit
    }
}

/// Callback counting invocations per run.
#[derive(Default)]
pub struct CountingCallback {
    calls: AtomicUsize,
    seen: Mutex<Vec<Run>>,
}

impl CountingCallback {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Run> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Callback for CountingCallback {
    fn name(&self) -> &str {
        "counting"
    }

    async fn on_complete(&self, run: &Run, _task: Option<&Task>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(run.clone());
        Ok(())
    }
}

pub fn no_environments() -> Arc<dyn EnvironmentProvider> {
    Arc::new(StaticEnvironmentProvider::default())
}
