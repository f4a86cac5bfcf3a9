pub mod config;
pub mod cycle_check;
pub mod executor;
pub mod graph;
pub mod http;
pub mod pagination;
pub mod retry;
pub mod sensor;
pub mod state;
pub mod task;

pub use config::{DagSpec, DefaultArgs, ExecutorConfig, TaskKindSpec, TaskSpec};
pub use cycle_check::creates_cycle;
pub use executor::Executor;
pub use graph::TaskGraph;
pub use http::{HttpClient, HttpRequest, HttpResponse, Method, ResponseCheck, ResponseFilter};
pub use pagination::{CursorExtractor, JsonFieldCursor, PageCursor, PageProgress, PaginatedCaller};
pub use retry::{Backoff, RetryDecision, RetryPolicy};
pub use sensor::{PokeOutcome, PollingSensor, SensorState};
pub use state::{RunState, TaskRecord, TaskStatus};
pub use task::{Task, TaskKind};

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub type TaskOutput = serde_json::Value;

#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FlowError {
    #[error("Adding task {task} would create a dependency cycle")]
    Cycle { task: String },
    #[error("Duplicate task id: {0}")]
    DuplicateId(String),
    #[error("Task {task} depends on unknown task {upstream}")]
    DanglingReference { task: String, upstream: String },
    #[error("Graph is frozen, no more tasks can be added")]
    GraphFrozen,
    #[error("Graph must be frozen before it can be run")]
    GraphNotFrozen,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("Response check failed: {0}")]
    ResponseCheck(String),
    #[error("Response decode error: {0}")]
    Decode(String),
    #[error("Sensor timed out after {0:?}")]
    SensorTimeout(Duration),
    #[error("Sensor check failed {streak} times in a row, last error: {last}")]
    SensorCheck { streak: u32, last: String },
    #[error("Pagination exceeded the limit of {max_pages} pages")]
    PaginationLimit { max_pages: usize },
    #[error("Task {task} skipped because upstream {upstream} failed")]
    UpstreamFailed { task: String, upstream: String },
    #[error("Context cancelled: {0}")]
    ContextCancelled(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Task execution failed: {0}")]
    TaskExecution(String),
}

impl FlowError {
    /// Whether a retry policy may schedule another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FlowError::Transport(_)
                | FlowError::HttpStatus { .. }
                | FlowError::ResponseCheck(_)
                | FlowError::Decode(_)
                | FlowError::TaskExecution(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_call_errors_are_retryable() {
        assert!(FlowError::Transport("reset".into()).is_retryable());
        assert!(
            FlowError::HttpStatus {
                status: 503,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(!FlowError::SensorTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!FlowError::PaginationLimit { max_pages: 2 }.is_retryable());
        assert!(!FlowError::ContextCancelled("stop".into()).is_retryable());
    }

    #[test]
    fn errors_serialize_with_kind_tag() {
        let value = serde_json::to_value(FlowError::HttpStatus {
            status: 404,
            body: "missing".into(),
        })
        .unwrap();
        assert_eq!(value["kind"], "http_status");
        assert_eq!(value["detail"]["status"], 404);
    }
}
