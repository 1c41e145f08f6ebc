//! Sample task handlers registered by the worker.

use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use jobstore_core::{ExecutionInfo, ExecutionStatus};
use jobstore_infra::jobs::{RetryPolicy, TaskRegistry};

pub const HELLO_WORLD_TASK: &str = "SAMPLE_HELLO_WORLD_TASK";
pub const RETRY_TASK: &str = "SAMPLE_RETRY_TASK";

/// Backoff for [`RETRY_TASK`], in seconds.
const RETRY_BACKOFF_SECS: [u64; 3] = [5, 10, 15];

pub fn registry() -> TaskRegistry {
    TaskRegistry::builder()
        .register(HELLO_WORLD_TASK, hello_world, RetryPolicy::none())
        .register(RETRY_TASK, flaky, RetryPolicy::backoff_secs(&RETRY_BACKOFF_SECS))
        .build()
}

/// Logs the payload and completes.
fn hello_world(info: ExecutionInfo) -> anyhow::Result<ExecutionInfo> {
    info!(task = HELLO_WORLD_TASK, job_data = %info.job_data, "hello world");
    std::thread::sleep(Duration::from_secs(1));
    Ok(info
        .to_builder()
        .execution_status(ExecutionStatus::Completed)
        .build())
}

/// Fails half the time, asking to be retried.
fn flaky(info: ExecutionInfo) -> anyhow::Result<ExecutionInfo> {
    flaky_with(info, rand::rng().random_bool(0.5))
}

fn flaky_with(info: ExecutionInfo, fail: bool) -> anyhow::Result<ExecutionInfo> {
    if fail {
        warn!(task = RETRY_TASK, job_data = %info.job_data, "sample failure; requesting retry");
        return Ok(info
            .to_builder()
            .execution_status(ExecutionStatus::InProgress)
            .should_retry(true)
            .build());
    }

    info!(task = RETRY_TASK, "sample retry task succeeded");
    Ok(info
        .to_builder()
        .execution_status(ExecutionStatus::Completed)
        .build())
}
