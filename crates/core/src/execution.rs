//! Transient work order passed to and returned from task handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Job, Priority};

/// Status reported by a task handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    /// Fresh work order, not yet handled.
    Started,
    /// Not finished: either retry the current task or advance to `next_task`.
    InProgress,
    /// Terminal; the job is removed.
    Completed,
}

/// Work order derived from a claimed [`Job`].
///
/// Handlers return a (possibly modified) copy. On the advance path the
/// returned `job_data`, `next_task` and `next_task_start_time` are persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub job_data: serde_json::Value,
    pub next_task: String,
    pub next_task_start_time: DateTime<Utc>,
    pub execution_status: ExecutionStatus,
    pub should_retry: bool,
    pub priority: Priority,
}

impl ExecutionInfo {
    pub fn builder() -> ExecutionInfoBuilder {
        ExecutionInfoBuilder::default()
    }

    /// Work order for a claimed job, in `Started` state.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_data: job.job_data.clone(),
            next_task: job.next_task.clone(),
            next_task_start_time: job.next_task_start_time,
            execution_status: ExecutionStatus::Started,
            should_retry: false,
            priority: job.priority,
        }
    }

    /// Copy into a builder for modification.
    pub fn to_builder(&self) -> ExecutionInfoBuilder {
        ExecutionInfoBuilder {
            job_data: Some(self.job_data.clone()),
            next_task: Some(self.next_task.clone()),
            next_task_start_time: Some(self.next_task_start_time),
            execution_status: self.execution_status,
            should_retry: self.should_retry,
            priority: self.priority,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.execution_status == ExecutionStatus::Completed
    }
}

/// Builder for [`ExecutionInfo`].
///
/// Unset fields default to: empty JSON object, empty task name, `Utc::now()`,
/// `Started`, no retry, `Medium`.
#[derive(Debug, Clone)]
pub struct ExecutionInfoBuilder {
    job_data: Option<serde_json::Value>,
    next_task: Option<String>,
    next_task_start_time: Option<DateTime<Utc>>,
    execution_status: ExecutionStatus,
    should_retry: bool,
    priority: Priority,
}

impl Default for ExecutionInfoBuilder {
    fn default() -> Self {
        Self {
            job_data: None,
            next_task: None,
            next_task_start_time: None,
            execution_status: ExecutionStatus::Started,
            should_retry: false,
            priority: Priority::Medium,
        }
    }
}

impl ExecutionInfoBuilder {
    pub fn job_data(mut self, data: serde_json::Value) -> Self {
        self.job_data = Some(data);
        self
    }

    pub fn next_task(mut self, task: impl Into<String>) -> Self {
        self.next_task = Some(task.into());
        self
    }

    pub fn next_task_start_time(mut self, at: DateTime<Utc>) -> Self {
        self.next_task_start_time = Some(at);
        self
    }

    pub fn execution_status(mut self, status: ExecutionStatus) -> Self {
        self.execution_status = status;
        self
    }

    pub fn should_retry(mut self, retry: bool) -> Self {
        self.should_retry = retry;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn build(self) -> ExecutionInfo {
        ExecutionInfo {
            job_data: self
                .job_data
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            next_task: self.next_task.unwrap_or_default(),
            next_task_start_time: self.next_task_start_time.unwrap_or_else(Utc::now),
            execution_status: self.execution_status,
            should_retry: self.should_retry,
            priority: self.priority,
        }
    }
}
