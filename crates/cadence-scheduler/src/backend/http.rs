//! Client for a remote cluster execution API spoken as JSON over HTTP.
//!
//! Endpoints:
//! - `POST {base}/executions` places an execution
//! - `POST {base}/executions/describe` reports execution states
//! - `GET {base}/executions/{ref}/logs?next_token=` pages through logs
//! - `POST {base}/executions/{ref}/stop` stops an execution

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ExecutionBackend, ExecutionReport, ExecutionState, LogPage};
use crate::error::{Result, SchedulerError};
use crate::types::Task;

/// Remote execution backend.
pub struct HttpBackend {
    base_url: String,
    cluster: String,
    http: reqwest::Client,
    batch_limit: usize,
}

#[derive(Serialize)]
struct PlaceRequest<'a> {
    cluster: &'a str,
    task: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
    entrypoint: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    memory_mb: Option<u32>,
    environment: &'a HashMap<String, String>,
}

#[derive(Deserialize)]
struct PlaceResponse {
    execution_ref: String,
}

#[derive(Serialize)]
struct DescribeRequest<'a> {
    cluster: &'a str,
    execution_refs: &'a [String],
}

#[derive(Deserialize)]
struct DescribedExecution {
    execution_ref: String,
    last_status: String,
}

#[derive(Deserialize)]
struct DescribeFailure {
    execution_ref: String,
    reason: String,
}

#[derive(Deserialize)]
struct DescribeResponse {
    #[serde(default)]
    executions: Vec<DescribedExecution>,
    #[serde(default)]
    failures: Vec<DescribeFailure>,
}

impl HttpBackend {
    /// Create a backend for `cluster` behind `base_url`.
    pub fn new(base_url: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cluster: cluster.into(),
            http: reqwest::Client::new(),
            batch_limit: super::DEFAULT_DESCRIBE_BATCH_LIMIT,
        }
    }

    /// Override the describe batch limit.
    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit.max(1);
        self
    }

    /// `{base}/{segments...}`, each segment escaped on its own.
    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|e| {
            SchedulerError::Config(format!("invalid backend url {}: {e}", self.base_url))
        })?;
        url.path_segments_mut()
            .map_err(|_| SchedulerError::Config(format!("invalid backend url {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SchedulerError::BackendUnavailable(format!(
            "{what} failed with {status}: {body}"
        )))
    }
}

fn unavailable(what: &str) -> impl FnOnce(reqwest::Error) -> SchedulerError + '_ {
    move |e| SchedulerError::BackendUnavailable(format!("{what}: {e}"))
}

#[async_trait]
impl ExecutionBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn place(&self, task: &Task, environment: &HashMap<String, String>) -> Result<String> {
        let request = PlaceRequest {
            cluster: &self.cluster,
            task: &task.name,
            image: task.image.as_deref(),
            entrypoint: &task.entrypoint,
            memory_mb: task.memory_mb,
            environment,
        };

        let response = self
            .http
            .post(self.endpoint(&["executions"])?)
            .json(&request)
            .send()
            .await
            .map_err(unavailable("place"))?;
        let placed: PlaceResponse = Self::check(response, "place")
            .await?
            .json()
            .await
            .map_err(unavailable("place"))?;

        info!(task = %task.name, execution_ref = %placed.execution_ref, "placed remote execution");
        Ok(placed.execution_ref)
    }

    async fn describe(&self, execution_refs: &[String]) -> Result<Vec<ExecutionReport>> {
        let response = self
            .http
            .post(self.endpoint(&["executions", "describe"])?)
            .json(&DescribeRequest {
                cluster: &self.cluster,
                execution_refs,
            })
            .send()
            .await
            .map_err(unavailable("describe"))?;
        let described: DescribeResponse = Self::check(response, "describe")
            .await?
            .json()
            .await
            .map_err(unavailable("describe"))?;

        debug!(
            executions = described.executions.len(),
            failures = described.failures.len(),
            "described executions"
        );

        let reports = described
            .failures
            .into_iter()
            .map(|f| ExecutionReport {
                execution_ref: f.execution_ref,
                state: ExecutionState::from_failure(&f.reason),
            })
            .chain(described.executions.into_iter().map(|e| ExecutionReport {
                execution_ref: e.execution_ref,
                state: ExecutionState::from_status(&e.last_status),
            }))
            .collect();
        Ok(reports)
    }

    async fn fetch_logs(&self, execution_ref: &str, page_token: Option<&str>) -> Result<LogPage> {
        let mut request = self.http.get(self.endpoint(&["executions", execution_ref, "logs"])?);
        if let Some(token) = page_token {
            request = request.query(&[("next_token", token)]);
        }

        let response = request.send().await.map_err(unavailable("fetch logs"))?;
        Self::check(response, "fetch logs")
            .await?
            .json()
            .await
            .map_err(unavailable("fetch logs"))
    }

    async fn stop(&self, execution_ref: &str) -> Result<()> {
        let response = self
            .http
            .post(self.endpoint(&["executions", execution_ref, "stop"])?)
            .send()
            .await
            .map_err(unavailable("stop"))?;
        Self::check(response, "stop").await?;
        Ok(())
    }

    fn describe_batch_limit(&self) -> usize {
        self.batch_limit
    }
}
