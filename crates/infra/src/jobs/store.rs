//! Job persistence port and the in-memory implementation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobstore_core::{Job, JobId, Priority, WorkerId};

/// Parameters of one atomic claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Tag written to every claimed row.
    pub worker_id: WorkerId,
    /// Tier order; a tier is drained before the next is read.
    pub priorities: Vec<Priority>,
    /// Maximum number of jobs to claim across all tiers.
    pub limit: usize,
    /// Due-time reference and the `start_time` stamped on claimed rows.
    pub now: DateTime<Utc>,
    /// Claims started before this instant are treated as orphaned and may be
    /// taken again. `None` never reclaims.
    pub lease_cutoff: Option<DateTime<Utc>>,
}

/// Job store abstraction.
///
/// Every operation runs inside a caller-owned transaction (`Tx`). Writes
/// after a claim take the claiming `owner` and only apply while the row is
/// still held by it; otherwise they fail with [`JobStoreError::ClaimLost`]
/// and change nothing.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    type Tx: Send + 'static;

    async fn begin(&self) -> Result<Self::Tx, JobStoreError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), JobStoreError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), JobStoreError>;

    /// Insert a new unclaimed job. Fails with `DuplicateId` if the id exists.
    async fn insert(&self, tx: &mut Self::Tx, job: &Job) -> Result<(), JobStoreError>;

    /// Atomically claim due, unclaimed jobs.
    ///
    /// Results are ordered tier by tier as in `request.priorities`, then by
    /// `next_task_start_time` ascending, then by `job_id`. Two concurrent
    /// callers never receive the same job.
    async fn claim_unassigned(
        &self,
        tx: &mut Self::Tx,
        request: &ClaimRequest,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Clear `worker_id` and `start_time`.
    async fn release(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        owner: WorkerId,
    ) -> Result<(), JobStoreError>;

    async fn update_task_data(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        owner: WorkerId,
        data: &serde_json::Value,
    ) -> Result<(), JobStoreError>;

    async fn update_next_task(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        owner: WorkerId,
        next_task: &str,
        start_time: DateTime<Utc>,
        retry_attempts_remaining: u32,
    ) -> Result<(), JobStoreError>;

    async fn update_retry_details(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        owner: WorkerId,
        start_time: DateTime<Utc>,
        retry_attempts_remaining: u32,
    ) -> Result<(), JobStoreError>;

    async fn delete(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        owner: WorkerId,
    ) -> Result<(), JobStoreError>;

    /// Read a job without locking it.
    async fn find(&self, tx: &mut Self::Tx, job_id: JobId) -> Result<Option<Job>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    /// Connectivity lost; retried only at the next scheduler tick.
    #[error("job store unavailable: {0}")]
    Unavailable(String),
    #[error("job already exists: {0}")]
    DuplicateId(JobId),
    /// Begin/commit/rollback itself failed.
    #[error("transaction failure: {0}")]
    Transaction(String),
    #[error("storage error: {0}")]
    Storage(String),
    /// The row is gone or no longer held by the writing worker.
    #[error("job {job_id} is no longer held by worker {owner}")]
    ClaimLost { job_id: JobId, owner: WorkerId },
}

impl JobStoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, JobStoreError::Unavailable(_))
    }

    pub fn is_claim_lost(&self) -> bool {
        matches!(self, JobStoreError::ClaimLost { .. })
    }
}

/// In-memory job store for tests/dev.
///
/// Writes apply immediately under a single lock (so claims are atomic) and
/// record the prior row image in the transaction; rollback restores those
/// images in reverse order. Uncommitted writes are visible to other
/// transactions.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: Mutex<BTreeMap<JobId, Job>>,
    available: AtomicBool,
}

/// Undo log of an in-memory transaction.
#[derive(Debug, Default)]
pub struct InMemoryTx {
    undo: Vec<(JobId, Option<Job>)>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate losing (or regaining) connectivity.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Snapshot of a row outside any transaction.
    pub fn get(&self, job_id: JobId) -> Option<Job> {
        self.lock().get(&job_id).cloned()
    }

    /// Snapshot of all rows, ordered by id.
    pub fn all(&self) -> Vec<Job> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<JobId, Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), JobStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(JobStoreError::Unavailable("in-memory store offline".to_string()))
        }
    }

    fn undo(&self, tx: InMemoryTx) {
        let mut jobs = self.lock();
        for (job_id, prior) in tx.undo.into_iter().rev() {
            match prior {
                Some(job) => jobs.insert(job_id, job),
                None => jobs.remove(&job_id),
            };
        }
    }

    /// Apply `f` to a row held by `owner`, recording its prior image.
    fn modify<F>(
        &self,
        tx: &mut InMemoryTx,
        job_id: JobId,
        owner: WorkerId,
        f: F,
    ) -> Result<(), JobStoreError>
    where
        F: FnOnce(&mut Job),
    {
        self.check_available()?;
        let mut jobs = self.lock();
        match jobs.get_mut(&job_id) {
            Some(job) if job.worker_id == Some(owner) => {
                tx.undo.push((job_id, Some(job.clone())));
                f(job);
                Ok(())
            }
            _ => Err(JobStoreError::ClaimLost { job_id, owner }),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx, JobStoreError> {
        self.check_available()?;
        Ok(InMemoryTx::default())
    }

    async fn commit(&self, tx: InMemoryTx) -> Result<(), JobStoreError> {
        if let Err(e) = self.check_available() {
            // A lost connection aborts the transaction server-side.
            self.undo(tx);
            return Err(JobStoreError::Transaction(format!("commit failed: {e}")));
        }
        Ok(())
    }

    async fn rollback(&self, tx: InMemoryTx) -> Result<(), JobStoreError> {
        let result = self
            .check_available()
            .map_err(|e| JobStoreError::Transaction(format!("rollback failed: {e}")));
        self.undo(tx);
        result
    }

    async fn insert(&self, tx: &mut InMemoryTx, job: &Job) -> Result<(), JobStoreError> {
        self.check_available()?;
        let mut jobs = self.lock();
        if jobs.contains_key(&job.job_id) {
            return Err(JobStoreError::DuplicateId(job.job_id));
        }
        tx.undo.push((job.job_id, None));
        jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn claim_unassigned(
        &self,
        tx: &mut InMemoryTx,
        request: &ClaimRequest,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.check_available()?;
        let mut jobs = self.lock();
        let mut claimed = Vec::new();

        for priority in &request.priorities {
            let remaining = request.limit.saturating_sub(claimed.len());
            if remaining == 0 {
                break;
            }

            let mut candidates: Vec<&Job> = jobs
                .values()
                .filter(|j| {
                    j.priority == *priority && j.is_claimable(request.now, request.lease_cutoff)
                })
                .collect();
            candidates.sort_by(|a, b| {
                a.next_task_start_time
                    .cmp(&b.next_task_start_time)
                    .then_with(|| a.job_id.cmp(&b.job_id))
            });
            let ids: Vec<JobId> = candidates
                .into_iter()
                .take(remaining)
                .map(|j| j.job_id)
                .collect();

            for job_id in ids {
                if let Some(job) = jobs.get_mut(&job_id) {
                    tx.undo.push((job_id, Some(job.clone())));
                    job.claim(request.worker_id, request.now);
                    claimed.push(job.clone());
                }
            }
        }

        Ok(claimed)
    }

    async fn release(
        &self,
        tx: &mut InMemoryTx,
        job_id: JobId,
        owner: WorkerId,
    ) -> Result<(), JobStoreError> {
        self.modify(tx, job_id, owner, Job::release)
    }

    async fn update_task_data(
        &self,
        tx: &mut InMemoryTx,
        job_id: JobId,
        owner: WorkerId,
        data: &serde_json::Value,
    ) -> Result<(), JobStoreError> {
        self.modify(tx, job_id, owner, |job| job.job_data = data.clone())
    }

    async fn update_next_task(
        &self,
        tx: &mut InMemoryTx,
        job_id: JobId,
        owner: WorkerId,
        next_task: &str,
        start_time: DateTime<Utc>,
        retry_attempts_remaining: u32,
    ) -> Result<(), JobStoreError> {
        self.modify(tx, job_id, owner, |job| {
            job.next_task = next_task.to_string();
            job.next_task_start_time = start_time;
            job.retry_attempts_remaining = retry_attempts_remaining;
        })
    }

    async fn update_retry_details(
        &self,
        tx: &mut InMemoryTx,
        job_id: JobId,
        owner: WorkerId,
        start_time: DateTime<Utc>,
        retry_attempts_remaining: u32,
    ) -> Result<(), JobStoreError> {
        self.modify(tx, job_id, owner, |job| {
            job.next_task_start_time = start_time;
            job.retry_attempts_remaining = retry_attempts_remaining;
        })
    }

    async fn delete(
        &self,
        tx: &mut InMemoryTx,
        job_id: JobId,
        owner: WorkerId,
    ) -> Result<(), JobStoreError> {
        self.check_available()?;
        let mut jobs = self.lock();
        match jobs.get(&job_id) {
            Some(job) if job.worker_id == Some(owner) => {
                let prior = jobs.remove(&job_id);
                tx.undo.push((job_id, prior));
                Ok(())
            }
            _ => Err(JobStoreError::ClaimLost { job_id, owner }),
        }
    }

    async fn find(&self, _tx: &mut InMemoryTx, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.check_available()?;
        Ok(self.get(job_id))
    }
}

#[async_trait]
impl<S: JobStore> JobStore for Arc<S> {
    type Tx = S::Tx;

    async fn begin(&self) -> Result<Self::Tx, JobStoreError> {
        (**self).begin().await
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), JobStoreError> {
        (**self).commit(tx).await
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), JobStoreError> {
        (**self).rollback(tx).await
    }

    async fn insert(&self, tx: &mut Self::Tx, job: &Job) -> Result<(), JobStoreError> {
        (**self).insert(tx, job).await
    }

    async fn claim_unassigned(
        &self,
        tx: &mut Self::Tx,
        request: &ClaimRequest,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).claim_unassigned(tx, request).await
    }

    async fn release(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        owner: WorkerId,
    ) -> Result<(), JobStoreError> {
        (**self).release(tx, job_id, owner).await
    }

    async fn update_task_data(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        owner: WorkerId,
        data: &serde_json::Value,
    ) -> Result<(), JobStoreError> {
        (**self).update_task_data(tx, job_id, owner, data).await
    }

    async fn update_next_task(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        owner: WorkerId,
        next_task: &str,
        start_time: DateTime<Utc>,
        retry_attempts_remaining: u32,
    ) -> Result<(), JobStoreError> {
        (**self)
            .update_next_task(tx, job_id, owner, next_task, start_time, retry_attempts_remaining)
            .await
    }

    async fn update_retry_details(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        owner: WorkerId,
        start_time: DateTime<Utc>,
        retry_attempts_remaining: u32,
    ) -> Result<(), JobStoreError> {
        (**self)
            .update_retry_details(tx, job_id, owner, start_time, retry_attempts_remaining)
            .await
    }

    async fn delete(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        owner: WorkerId,
    ) -> Result<(), JobStoreError> {
        (**self).delete(tx, job_id, owner).await
    }

    async fn find(&self, tx: &mut Self::Tx, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).find(tx, job_id).await
    }
}
