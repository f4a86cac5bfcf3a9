use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::{HttpRequest, Method};
use crate::pagination::{JsonFieldCursor, PaginatedCaller};
use crate::sensor::PollingSensor;
use crate::{Backoff, FlowError, RetryPolicy, Task, TaskGraph};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Concurrent attempts. Values below one are treated as one.
    pub workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { workers: 16 }
    }
}

impl ExecutorConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }
}

/// Settings applied to every task that does not override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DefaultArgs {
    pub retries: u32,
    pub retry_delay_seconds: f64,
    pub max_retry_delay_seconds: f64,
    pub retry_backoff: Backoff,
}

impl Default for DefaultArgs {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            retries: policy.retries,
            retry_delay_seconds: policy.interval.as_secs_f64(),
            max_retry_delay_seconds: policy.max_interval.as_secs_f64(),
            retry_backoff: policy.backoff,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKindSpec {
    #[default]
    SingleCall,
    PollingSensor,
    PaginatedCall,
}

fn default_check_status() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub id: String,
    #[serde(default)]
    pub kind: TaskKindSpec,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub poll_interval_seconds: Option<f64>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub max_failure_streak: Option<u32>,
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default)]
    pub cursor_field: Option<String>,
    #[serde(default = "default_check_status")]
    pub check_status: bool,
    #[serde(default)]
    pub upstream: Vec<String>,
}

fn seconds(field: &str, value: f64) -> Result<Duration, FlowError> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| FlowError::InvalidConfig(format!("{}: {} ({})", field, value, e)))
}

impl TaskSpec {
    pub fn into_task(self, defaults: &DefaultArgs) -> Result<(Task, Vec<String>), FlowError> {
        let retry_policy = RetryPolicy {
            retries: self.retries.unwrap_or(defaults.retries),
            interval: seconds("retryDelaySeconds", defaults.retry_delay_seconds)?,
            max_interval: seconds("maxRetryDelaySeconds", defaults.max_retry_delay_seconds)?,
            backoff: defaults.retry_backoff,
        };

        let request = HttpRequest {
            method: self.method,
            endpoint: self.endpoint,
            headers: self.headers,
            body: self.body,
        };

        let task = match self.kind {
            TaskKindSpec::SingleCall => Task::single_call(self.id, request),
            TaskKindSpec::PollingSensor => {
                let mut sensor = PollingSensor::default();
                if let Some(interval) = self.poll_interval_seconds {
                    sensor.interval = seconds("pollIntervalSeconds", interval)?;
                }
                if let Some(timeout) = self.timeout_seconds {
                    sensor.timeout = seconds("timeoutSeconds", timeout)?;
                }
                if let Some(streak) = self.max_failure_streak {
                    sensor.max_failure_streak = streak;
                }
                Task::sensor(self.id, request, sensor)
            }
            TaskKindSpec::PaginatedCall => {
                let mut caller = PaginatedCaller::default();
                if let Some(max_pages) = self.max_pages {
                    if max_pages == 0 {
                        return Err(FlowError::InvalidConfig(format!(
                            "maxPages must be at least 1 for {}",
                            self.id
                        )));
                    }
                    caller.max_pages = max_pages;
                }
                let task = Task::paginated(self.id, request, caller);
                match self.cursor_field {
                    Some(field) => task.with_cursor(JsonFieldCursor::new(field)),
                    None => task,
                }
            }
        };

        Ok((
            task.with_retry_policy(retry_policy)
                .with_check_status(self.check_status),
            self.upstream,
        ))
    }
}

/// A whole DAG as configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagSpec {
    pub dag_id: String,
    #[serde(default)]
    pub default_args: DefaultArgs,
    #[serde(default)]
    pub executor: ExecutorConfig,
    pub tasks: Vec<TaskSpec>,
}

impl DagSpec {
    pub fn from_json(input: &str) -> Result<Self, FlowError> {
        serde_json::from_str(input).map_err(|e| FlowError::InvalidConfig(e.to_string()))
    }

    /// Builds and freezes the graph. `customize` sees every task before it
    /// is added, which is where callbacks get attached.
    pub fn into_graph<F>(self, mut customize: F) -> Result<TaskGraph, FlowError>
    where
        F: FnMut(Task) -> Task,
    {
        let mut graph = TaskGraph::new();
        for spec in self.tasks {
            let (task, upstream) = spec.into_task(&self.default_args)?;
            graph.add_task(customize(task), upstream)?;
        }
        graph.freeze()?;
        Ok(graph)
    }
}
