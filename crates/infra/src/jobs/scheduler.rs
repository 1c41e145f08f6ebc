//! Timer-driven claim loop feeding a bounded worker pool.
//!
//! Each tick claims due jobs in one short transaction, commits, then hands
//! every claimed job to its own tokio task holding a pool permit. The loop
//! never waits for executions before the next tick.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobstore_core::{Job, WorkerId};

use super::executor::{ExecutionOutcome, JobExecutor};
use super::priority::{PercentageSource, PrioritySelector, RandomPercentage};
use super::store::{JobStore, JobStoreError};

/// Scheduler timing and capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Name used in logs.
    pub module_name: String,
    pub initial_delay: Duration,
    pub interval: Duration,
    /// Maximum jobs claimed per tick.
    pub worker_job_count: usize,
    /// Maximum concurrent executions.
    pub worker_pool_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            module_name: "jobstore".to_string(),
            initial_delay: Duration::from_secs(20),
            interval: Duration::from_secs(20),
            worker_job_count: 10,
            worker_pool_size: 10,
        }
    }
}

/// Scheduler runtime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub claim_failures: u64,
    pub jobs_dispatched: u64,
    pub jobs_completed: u64,
    pub retries_scheduled: u64,
    pub jobs_advanced: u64,
    pub jobs_not_due: u64,
    pub missing_tasks: u64,
    /// Results discarded because the claim had been taken over.
    pub claims_lost: u64,
    pub jobs_failed: u64,
    /// Executions holding a pool permit when the snapshot was taken.
    pub in_flight: usize,
}

impl SchedulerStats {
    fn record(&mut self, outcome: &ExecutionOutcome) {
        match outcome {
            ExecutionOutcome::Completed => self.jobs_completed += 1,
            ExecutionOutcome::RetryScheduled { .. } => self.retries_scheduled += 1,
            ExecutionOutcome::Advanced { .. } => self.jobs_advanced += 1,
            ExecutionOutcome::NotDue => self.jobs_not_due += 1,
            ExecutionOutcome::MissingTask(_) => self.missing_tasks += 1,
            ExecutionOutcome::ClaimLost => self.claims_lost += 1,
            ExecutionOutcome::Failed(_) => self.jobs_failed += 1,
        }
    }
}

fn lock_stats(stats: &Mutex<SchedulerStats>) -> std::sync::MutexGuard<'_, SchedulerStats> {
    stats.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle to control a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<SchedulerStats>>,
    pool: Arc<Semaphore>,
    pool_size: usize,
}

impl SchedulerHandle {
    /// Stop ticking and wait for in-flight executions to finish. Returns the
    /// final counters.
    pub async fn shutdown(mut self) -> SchedulerStats {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "scheduler loop panicked");
            }
        }
        drain(&self.pool, self.pool_size).await;
        self.stats()
    }

    pub fn stats(&self) -> SchedulerStats {
        snapshot(&self.stats, &self.pool, self.pool_size)
    }
}

fn snapshot(stats: &Mutex<SchedulerStats>, pool: &Semaphore, pool_size: usize) -> SchedulerStats {
    let mut s = lock_stats(stats).clone();
    s.in_flight = pool_size.saturating_sub(pool.available_permits());
    s
}

/// Wait until every pool permit is free.
async fn drain(pool: &Semaphore, pool_size: usize) {
    let permits = u32::try_from(pool_size).unwrap_or(u32::MAX);
    if let Ok(all) = pool.acquire_many(permits).await {
        drop(all);
    }
}

/// Periodically claims due jobs and dispatches them to the executor.
pub struct JobScheduler<S: JobStore, R: PercentageSource = RandomPercentage> {
    executor: Arc<JobExecutor<S>>,
    selector: PrioritySelector<R>,
    config: SchedulerConfig,
    pool: Arc<Semaphore>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl<S: JobStore, R: PercentageSource + 'static> JobScheduler<S, R> {
    pub fn new(executor: JobExecutor<S>, selector: PrioritySelector<R>, config: SchedulerConfig) -> Self {
        let pool = Arc::new(Semaphore::new(config.worker_pool_size));
        Self {
            executor: Arc::new(executor),
            selector,
            config,
            pool,
            stats: Arc::new(Mutex::new(SchedulerStats::default())),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        snapshot(&self.stats, &self.pool, self.config.worker_pool_size)
    }

    /// Wait for all dispatched executions to finish.
    pub async fn wait_idle(&self) {
        drain(&self.pool, self.config.worker_pool_size).await;
    }

    /// Run one claim-and-dispatch cycle. Returns the number of jobs dispatched.
    ///
    /// A claim failure rolls the claim back and dispatches nothing.
    pub async fn tick(&self) -> Result<usize, JobStoreError> {
        lock_stats(&self.stats).ticks += 1;

        let worker_id = WorkerId::new();
        let priorities = self.selector.select_ordered_priorities();
        let limit = self
            .config
            .worker_job_count
            .min(self.pool.available_permits());
        if limit == 0 {
            debug!(module = %self.config.module_name, "no free workers; skipping claim");
            return Ok(0);
        }

        let jobs = match self.claim(worker_id, &priorities, limit).await {
            Ok(jobs) => jobs,
            Err(e) => {
                lock_stats(&self.stats).claim_failures += 1;
                return Err(e);
            }
        };

        let count = jobs.len();
        if count > 0 {
            info!(
                module = %self.config.module_name,
                worker_id = %worker_id,
                claimed = count,
                first_tier = %priorities[0],
                "claimed jobs"
            );
        }
        for job in jobs {
            self.dispatch(job).await;
        }
        Ok(count)
    }

    async fn claim(
        &self,
        worker_id: WorkerId,
        priorities: &[jobstore_core::Priority],
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let service = self.executor.service();
        let mut tx = service.begin().await?;
        match service.fetch_due_jobs(&mut tx, worker_id, priorities, limit).await {
            Ok(jobs) => {
                service.commit(tx).await?;
                Ok(jobs)
            }
            Err(e) => {
                if let Err(rb) = service.rollback(tx).await {
                    warn!(error = %rb, "claim rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn dispatch(&self, job: Job) {
        let permit = match Arc::clone(&self.pool).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(job_id = %job.job_id, "worker pool closed; job left for lease recovery");
                return;
            }
        };

        lock_stats(&self.stats).jobs_dispatched += 1;
        let executor = Arc::clone(&self.executor);
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = executor.execute(job).await;
            lock_stats(&stats).record(&outcome);
        });
    }

    /// Tick after the initial delay and then every interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            module = %self.config.module_name,
            initial_delay_ms = self.config.initial_delay.as_millis() as u64,
            interval_ms = self.config.interval.as_millis() as u64,
            worker_job_count = self.config.worker_job_count,
            worker_pool_size = self.config.worker_pool_size,
            "job scheduler started"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                info!(module = %self.config.module_name, "job scheduler stopped");
                return;
            }
            _ = tokio::time::sleep(self.config.initial_delay) => {}
        }

        let mut ticker = tokio::time::interval(self.config.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(module = %self.config.module_name, error = %e, "claim cycle failed");
                    }
                }
            }
        }

        info!(module = %self.config.module_name, "job scheduler stopped");
    }

    /// Run the loop on a background task.
    pub fn spawn(self) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let stats = Arc::clone(&self.stats);
        let pool = Arc::clone(&self.pool);
        let pool_size = self.config.worker_pool_size;
        let token = cancel.clone();
        let join = tokio::spawn(async move { self.run(token).await });

        SchedulerHandle {
            cancel,
            join: Some(join),
            stats,
            pool,
            pool_size,
        }
    }
}
