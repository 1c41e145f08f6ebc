//! Job service: the scheduler's and executor's view of the store.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, instrument};

use jobstore_core::{Clock, ExecutionInfo, Job, JobId, Priority, WorkerId};

use super::registry::TaskRegistry;
use super::store::{ClaimRequest, JobStore, JobStoreError};

/// Thin façade over a [`JobStore`].
///
/// Operations other than [`JobService::submit`] run in a caller-owned
/// transaction; errors are returned unchanged and the caller decides whether
/// to roll back.
pub struct JobService<S: JobStore> {
    store: S,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    claim_lease: Option<Duration>,
}

impl<S: JobStore + Clone> Clone for JobService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: Arc::clone(&self.registry),
            clock: Arc::clone(&self.clock),
            claim_lease: self.claim_lease,
        }
    }
}

impl<S: JobStore> JobService<S> {
    pub fn new(store: S, registry: Arc<TaskRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            registry,
            clock,
            claim_lease: None,
        }
    }

    /// Claims older than `lease` become claimable again. `None` disables it.
    pub fn with_claim_lease(mut self, lease: Option<Duration>) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Persist a new unclaimed job in its own transaction.
    ///
    /// The retry budget is taken from the registered task; unknown tasks get 0.
    #[instrument(skip(self, info), fields(task = %info.next_task, priority = %info.priority), err)]
    pub async fn submit(&self, info: ExecutionInfo) -> Result<JobId, JobStoreError> {
        let job_id = JobId::new();
        let retries = self.registry.retry_attempts_remaining(&info.next_task);
        let job = Job::new(
            job_id,
            info.job_data,
            info.next_task,
            info.next_task_start_time,
            retries,
            info.priority,
        );

        let mut tx = self.store.begin().await?;
        if let Err(e) = self.store.insert(&mut tx, &job).await {
            // Best effort; the insert error is the one the submitter needs.
            let _ = self.store.rollback(tx).await;
            return Err(e);
        }
        self.store.commit(tx).await?;

        debug!(job_id = %job_id, retries, "job submitted");
        Ok(job_id)
    }

    pub async fn begin(&self) -> Result<S::Tx, JobStoreError> {
        self.store.begin().await
    }

    pub async fn commit(&self, tx: S::Tx) -> Result<(), JobStoreError> {
        self.store.commit(tx).await
    }

    pub async fn rollback(&self, tx: S::Tx) -> Result<(), JobStoreError> {
        self.store.rollback(tx).await
    }

    /// Claim due jobs for `worker_id`, tier by tier.
    pub async fn fetch_due_jobs(
        &self,
        tx: &mut S::Tx,
        worker_id: WorkerId,
        priorities: &[Priority],
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let now = self.clock.now();
        let request = ClaimRequest {
            worker_id,
            priorities: priorities.to_vec(),
            limit,
            now,
            lease_cutoff: self.claim_lease.map(|lease| now - lease),
        };
        self.store.claim_unassigned(tx, &request).await
    }

    /// Persist the handler's output, move to its `next_task` with a fresh
    /// retry budget, then release. Returns the new budget.
    pub async fn advance(
        &self,
        tx: &mut S::Tx,
        job_id: JobId,
        owner: WorkerId,
        info: &ExecutionInfo,
    ) -> Result<u32, JobStoreError> {
        let retries = self.registry.retry_attempts_remaining(&info.next_task);
        self.store
            .update_task_data(tx, job_id, owner, &info.job_data)
            .await?;
        self.store
            .update_next_task(
                tx,
                job_id,
                owner,
                &info.next_task,
                info.next_task_start_time,
                retries,
            )
            .await?;
        self.store.release(tx, job_id, owner).await?;
        Ok(retries)
    }

    /// Reschedule the current task at `start_time`, then release.
    pub async fn schedule_retry(
        &self,
        tx: &mut S::Tx,
        job_id: JobId,
        owner: WorkerId,
        start_time: DateTime<Utc>,
        retry_attempts_remaining: u32,
    ) -> Result<(), JobStoreError> {
        self.store
            .update_retry_details(tx, job_id, owner, start_time, retry_attempts_remaining)
            .await?;
        self.store.release(tx, job_id, owner).await
    }

    pub async fn release(
        &self,
        tx: &mut S::Tx,
        job_id: JobId,
        owner: WorkerId,
    ) -> Result<(), JobStoreError> {
        self.store.release(tx, job_id, owner).await
    }

    /// Remove a finished job.
    pub async fn complete(
        &self,
        tx: &mut S::Tx,
        job_id: JobId,
        owner: WorkerId,
    ) -> Result<(), JobStoreError> {
        self.store.delete(tx, job_id, owner).await
    }

    pub async fn find(&self, tx: &mut S::Tx, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.store.find(tx, job_id).await
    }
}
