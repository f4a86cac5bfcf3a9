use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{FlowError, TaskOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<FlowError>,
    pub output: Option<TaskOutput>,
}

impl Default for TaskRecord {
    fn default() -> Self {
        Self {
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            output: None,
        }
    }
}

/// Per-run bookkeeping, owned by the executor while a run is in progress.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunState {
    tasks: HashMap<String, TaskRecord>,
    execution_order: Vec<String>,
}

impl RunState {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tasks: ids
                .into_iter()
                .map(|id| (id.into(), TaskRecord::default()))
                .collect(),
            execution_order: Vec::new(),
        }
    }

    pub fn record(&self, id: &str) -> Option<&TaskRecord> {
        self.tasks.get(id)
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.get(id).map(|r| r.status)
    }

    pub fn attempts(&self, id: &str) -> u32 {
        self.tasks.get(id).map_or(0, |r| r.attempts)
    }

    pub fn records(&self) -> impl Iterator<Item = (&str, &TaskRecord)> {
        self.tasks.iter().map(|(id, record)| (id.as_str(), record))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task ids in the order they first started.
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|r| r.status == status).count()
    }

    /// No task is left pending or running.
    pub fn is_finished(&self) -> bool {
        self.tasks.values().all(|r| r.status.is_terminal())
    }

    pub fn is_success(&self) -> bool {
        self.tasks
            .values()
            .all(|r| r.status == TaskStatus::Succeeded)
    }

    pub fn summary(&self) -> String {
        let mut result = String::from("\n");

        for (i, id) in self.execution_order.iter().enumerate() {
            let status = self.status(id).unwrap_or(TaskStatus::Pending);
            result.push_str(&format!("{}. {} ({:?})\n", i + 1, id, status));
        }

        result
    }

    /// Moves the task to Running and counts a new attempt.
    pub(crate) fn begin_attempt(&mut self, id: &str) {
        if let Some(record) = self.tasks.get_mut(id) {
            if record.attempts == 0 {
                self.execution_order.push(id.to_string());
            }
            record.status = TaskStatus::Running;
            record.attempts += 1;
        }
    }

    pub(crate) fn record_error(&mut self, id: &str, error: FlowError) {
        if let Some(record) = self.tasks.get_mut(id) {
            record.last_error = Some(error);
        }
    }

    pub(crate) fn succeed(&mut self, id: &str, output: TaskOutput) {
        if let Some(record) = self.tasks.get_mut(id) {
            record.status = TaskStatus::Succeeded;
            record.output = Some(output);
        }
    }

    pub(crate) fn fail(&mut self, id: &str, error: FlowError) {
        if let Some(record) = self.tasks.get_mut(id) {
            record.status = TaskStatus::Failed;
            record.last_error = Some(error);
        }
    }

    /// Skips a task that has not reached a terminal state yet. Returns
    /// whether the status changed.
    pub(crate) fn skip(&mut self, id: &str, reason: FlowError) -> bool {
        match self.tasks.get_mut(id) {
            Some(record) if !record.status.is_terminal() => {
                record.status = TaskStatus::Skipped;
                record.last_error = Some(reason);
                true
            }
            _ => false,
        }
    }

    /// Skips everything that is still pending or running.
    pub(crate) fn cancel_remaining(&mut self, reason: &str) -> usize {
        let mut skipped = 0;
        for record in self.tasks.values_mut() {
            if !record.status.is_terminal() {
                record.status = TaskStatus::Skipped;
                record.last_error = Some(FlowError::ContextCancelled(reason.to_string()));
                skipped += 1;
            }
        }
        skipped
    }
}
