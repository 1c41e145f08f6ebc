//! Job executor: runs one claimed job and persists the resulting transition.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use jobstore_core::{ExecutionInfo, ExecutionStatus, Job, JobId, WorkerId};

use super::service::JobService;
use super::store::{JobStore, JobStoreError};

/// Why a job execution did not reach a persisted transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("task not registered: {0}")]
    TaskNotRegistered(String),
    /// The handler returned an error or panicked.
    #[error("task {task} failed: {message}")]
    HandlerFailure { task: String, message: String },
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Terminal state of one execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Handler finished the job; the row was deleted.
    Completed,
    /// Same task rescheduled after a backoff.
    RetryScheduled {
        next_start: DateTime<Utc>,
        retries_remaining: u32,
    },
    /// Moved on to `next_task` with a fresh retry budget.
    Advanced {
        next_task: String,
        next_start: DateTime<Utc>,
        retries_remaining: u32,
    },
    /// Claimed before its start time; released untouched.
    NotDue,
    /// No handler for the task; released untouched.
    MissingTask(String),
    /// The claim expired and another worker holds the job now; nothing was
    /// written.
    ClaimLost,
    Failed(ExecutionError),
}

impl ExecutionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed => "completed",
            ExecutionOutcome::RetryScheduled { .. } => "retry_scheduled",
            ExecutionOutcome::Advanced { .. } => "advanced",
            ExecutionOutcome::NotDue => "not_due",
            ExecutionOutcome::MissingTask(_) => "missing_task",
            ExecutionOutcome::ClaimLost => "claim_lost",
            ExecutionOutcome::Failed(_) => "failed",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ExecutionOutcome::Failed(_) | ExecutionOutcome::MissingTask(_)
        )
    }
}

/// Store writes for one transition, applied in a single transaction.
enum Transition {
    Release,
    Complete,
    Retry {
        start: DateTime<Utc>,
        remaining: u32,
    },
    Advance(ExecutionInfo),
}

/// Executes claimed jobs against the task registry.
pub struct JobExecutor<S: JobStore> {
    service: JobService<S>,
}

impl<S: JobStore> JobExecutor<S> {
    pub fn new(service: JobService<S>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &JobService<S> {
        &self.service
    }

    /// Run `job.next_task` and persist the outcome.
    ///
    /// The handler runs on the blocking pool before any transaction opens.
    /// Every write is conditional on `job.worker_id` still holding the row.
    /// Errors are reported in the outcome, never returned.
    #[instrument(skip(self, job), fields(job_id = %job.job_id, task = %job.next_task))]
    pub async fn execute(&self, job: Job) -> ExecutionOutcome {
        let Some(owner) = job.worker_id else {
            warn!(job_id = %job.job_id, "job is not claimed; skipping");
            return ExecutionOutcome::ClaimLost;
        };

        let Some(descriptor) = self.service.registry().get(&job.next_task) else {
            let err = ExecutionError::TaskNotRegistered(job.next_task.clone());
            error!(job_id = %job.job_id, error = %err, "releasing job with unknown task");
            return match self.persist(job.job_id, owner, Transition::Release).await {
                Ok(_) => ExecutionOutcome::MissingTask(job.next_task),
                Err(e) => self.store_failure(job.job_id, e),
            };
        };

        if !job.is_due(self.service.now()) {
            debug!(job_id = %job.job_id, due = %job.next_task_start_time, "job not due; releasing");
            return match self.persist(job.job_id, owner, Transition::Release).await {
                Ok(_) => ExecutionOutcome::NotDue,
                Err(e) => self.store_failure(job.job_id, e),
            };
        }

        let handler = descriptor.handler();
        let input = ExecutionInfo::from_job(&job);
        let output = match tokio::task::spawn_blocking(move || handler.execute(input)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return self.handler_failure(&job, format!("{e:#}")),
            Err(join) if join.is_panic() => {
                return self.handler_failure(&job, "handler panicked".to_string());
            }
            Err(join) => return self.handler_failure(&job, join.to_string()),
        };

        if output.is_completed() {
            return match self.persist(job.job_id, owner, Transition::Complete).await {
                Ok(_) => {
                    info!(job_id = %job.job_id, "job completed");
                    ExecutionOutcome::Completed
                }
                Err(e) => self.store_failure(job.job_id, e),
            };
        }

        // Only INPROGRESS retries; an untouched STARTED order advances.
        let wants_retry =
            output.execution_status == ExecutionStatus::InProgress && output.should_retry;
        let remaining = job.retry_attempts_remaining;
        let backoff = if wants_retry {
            descriptor.retry_policy().delay_for_remaining(remaining)
        } else {
            None
        };

        match backoff {
            Some(delay) => {
                let next_start = self.service.now()
                    + chrono::Duration::from_std(delay).unwrap_or_default();
                let transition = Transition::Retry {
                    start: next_start,
                    remaining: remaining - 1,
                };
                match self.persist(job.job_id, owner, transition).await {
                    Ok(_) => {
                        info!(
                            job_id = %job.job_id,
                            next_start = %next_start,
                            retries_remaining = remaining - 1,
                            "retry scheduled"
                        );
                        ExecutionOutcome::RetryScheduled {
                            next_start,
                            retries_remaining: remaining - 1,
                        }
                    }
                    Err(e) => self.store_failure(job.job_id, e),
                }
            }
            None => {
                if wants_retry {
                    warn!(job_id = %job.job_id, "retries exhausted; advancing");
                }
                let next_task = output.next_task.clone();
                let next_start = output.next_task_start_time;
                match self.persist(job.job_id, owner, Transition::Advance(output)).await {
                    Ok(retries_remaining) => {
                        info!(
                            job_id = %job.job_id,
                            next_task = %next_task,
                            next_start = %next_start,
                            "job advanced"
                        );
                        ExecutionOutcome::Advanced {
                            next_task,
                            next_start,
                            retries_remaining,
                        }
                    }
                    Err(e) => self.store_failure(job.job_id, e),
                }
            }
        }
    }

    /// Apply `transition` in its own transaction. Returns the retry budget
    /// written by an advance, 0 otherwise.
    async fn persist(
        &self,
        job_id: JobId,
        owner: WorkerId,
        transition: Transition,
    ) -> Result<u32, JobStoreError> {
        let mut tx = self.service.begin().await?;
        let applied = match &transition {
            Transition::Release => self.service.release(&mut tx, job_id, owner).await.map(|_| 0),
            Transition::Complete => self.service.complete(&mut tx, job_id, owner).await.map(|_| 0),
            Transition::Retry { start, remaining } => self
                .service
                .schedule_retry(&mut tx, job_id, owner, *start, *remaining)
                .await
                .map(|_| 0),
            Transition::Advance(info) => self.service.advance(&mut tx, job_id, owner, info).await,
        };

        match applied {
            Ok(retries) => {
                self.service.commit(tx).await?;
                Ok(retries)
            }
            Err(e) => {
                if let Err(rb) = self.service.rollback(tx).await {
                    warn!(job_id = %job_id, error = %rb, "rollback failed");
                }
                Err(e)
            }
        }
    }

    fn handler_failure(&self, job: &Job, message: String) -> ExecutionOutcome {
        let err = ExecutionError::HandlerFailure {
            task: job.next_task.clone(),
            message,
        };
        error!(job_id = %job.job_id, error = %err, "task handler failed; job stays claimed");
        ExecutionOutcome::Failed(err)
    }

    fn store_failure(&self, job_id: JobId, err: JobStoreError) -> ExecutionOutcome {
        if let JobStoreError::ClaimLost { owner, .. } = err {
            warn!(job_id = %job_id, worker_id = %owner, "claim lost to another worker; result discarded");
            return ExecutionOutcome::ClaimLost;
        }
        error!(job_id = %job_id, error = %err, "failed to persist job transition");
        ExecutionOutcome::Failed(ExecutionError::Store(err))
    }
}
