//! Task registry: task name to handler and retry backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use jobstore_core::ExecutionInfo;

/// A unit of work invoked by the executor.
///
/// Runs on the blocking pool; an `Err` or a panic is reported as a handler
/// failure and nothing is persisted.
pub trait ExecutableTask: Send + Sync + 'static {
    fn execute(&self, info: ExecutionInfo) -> anyhow::Result<ExecutionInfo>;
}

impl<F> ExecutableTask for F
where
    F: Fn(ExecutionInfo) -> anyhow::Result<ExecutionInfo> + Send + Sync + 'static,
{
    fn execute(&self, info: ExecutionInfo) -> anyhow::Result<ExecutionInfo> {
        self(info)
    }
}

/// Ordered retry backoff, indexed by attempt number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    durations: Vec<Duration>,
}

impl RetryPolicy {
    /// No retries.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(durations: Vec<Duration>) -> Self {
        Self { durations }
    }

    /// Create a policy from whole-second backoffs.
    pub fn backoff_secs(secs: &[u64]) -> Self {
        Self {
            durations: secs.iter().copied().map(Duration::from_secs).collect(),
        }
    }

    /// Number of retries this policy grants a fresh task.
    pub fn attempts(&self) -> u32 {
        u32::try_from(self.durations.len()).unwrap_or(u32::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }

    /// Delay for the next retry given the attempts still remaining.
    ///
    /// The first retry (remaining == attempts) uses index 0. Returns `None`
    /// when nothing remains or `remaining` exceeds the policy length.
    pub fn delay_for_remaining(&self, remaining: u32) -> Option<Duration> {
        if remaining == 0 {
            return None;
        }
        let index = self.durations.len().checked_sub(remaining as usize)?;
        self.durations.get(index).copied()
    }
}

/// A registered task.
#[derive(Clone)]
pub struct TaskDescriptor {
    name: String,
    handler: Arc<dyn ExecutableTask>,
    retry_policy: RetryPolicy,
}

impl TaskDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> Arc<dyn ExecutableTask> {
        Arc::clone(&self.handler)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl std::fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("name", &self.name)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

/// Immutable map of task name to descriptor.
#[derive(Debug, Default, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskDescriptor>,
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&TaskDescriptor> {
        self.tasks.get(name)
    }

    /// Initial retry budget for a task; 0 when unknown or without backoff.
    pub fn retry_attempts_remaining(&self, name: &str) -> u32 {
        self.get(name).map_or(0, |t| t.retry_policy.attempts())
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[derive(Default)]
pub struct TaskRegistryBuilder {
    tasks: HashMap<String, TaskDescriptor>,
}

impl TaskRegistryBuilder {
    /// Register a handler. A second registration under the same name replaces
    /// the first.
    pub fn register<T>(mut self, name: impl Into<String>, handler: T, retry_policy: RetryPolicy) -> Self
    where
        T: ExecutableTask,
    {
        let name = name.into();
        let descriptor = TaskDescriptor {
            name: name.clone(),
            handler: Arc::new(handler),
            retry_policy,
        };
        if self.tasks.insert(name.clone(), descriptor).is_some() {
            warn!(task = %name, "task registered twice; replacing earlier handler");
        }
        self
    }

    pub fn build(self) -> TaskRegistry {
        TaskRegistry { tasks: self.tasks }
    }
}
