//! Integration tests for the full scheduling pipeline.
//!
//! Tests: submit → JobStore → JobScheduler tick → JobExecutor → JobStore
//!
//! Verifies:
//! - Completed jobs are removed and unregistered tasks are released untouched
//! - Retry backoff offsets and the advance after exhaustion
//! - A failed claim cycle does not stop later cycles
//! - A failing or panicking handler does not affect jobs in the same batch

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use chrono::{Duration, Utc};
    use serde_json::json;

    use jobstore_core::{Clock, ExecutionInfo, ExecutionStatus, JobId, ManualClock, Priority};

    use crate::jobs::{
        FixedPercentage, InMemoryJobStore, JobExecutor, JobScheduler, JobService, PrioritySelector,
        RetryPolicy, SchedulerConfig, TaskRegistry,
    };

    type Scheduler = JobScheduler<Arc<InMemoryJobStore>, FixedPercentage>;

    struct Harness {
        store: Arc<InMemoryJobStore>,
        clock: Arc<ManualClock>,
        scheduler: Scheduler,
        service: JobService<Arc<InMemoryJobStore>>,
    }

    fn harness(registry: TaskRegistry, p_high: u32, p_low: u32, draw: u32) -> Harness {
        let store = InMemoryJobStore::arc();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let service = JobService::new(store.clone(), Arc::new(registry), clock.clone())
            .with_claim_lease(Some(Duration::seconds(600)));
        let selector = PrioritySelector::new(p_high, p_low, FixedPercentage(draw)).unwrap();
        let config = SchedulerConfig {
            module_name: "integration".to_string(),
            initial_delay: StdDuration::ZERO,
            interval: StdDuration::from_millis(10),
            worker_job_count: 10,
            worker_pool_size: 4,
        };
        let scheduler = JobScheduler::new(JobExecutor::new(service.clone()), selector, config);
        Harness {
            store,
            clock,
            scheduler,
            service,
        }
    }

    impl Harness {
        async fn submit(&self, task: &str, priority: Priority) -> JobId {
            self.service
                .submit(
                    ExecutionInfo::builder()
                        .job_data(json!({"task": task}))
                        .next_task(task)
                        .next_task_start_time(self.clock.now())
                        .priority(priority)
                        .build(),
                )
                .await
                .unwrap()
        }

        async fn tick(&self) -> usize {
            let n = self.scheduler.tick().await.unwrap();
            self.scheduler.wait_idle().await;
            n
        }
    }

    fn completes(info: ExecutionInfo) -> anyhow::Result<ExecutionInfo> {
        Ok(info
            .to_builder()
            .execution_status(ExecutionStatus::Completed)
            .build())
    }

    fn always_retry(info: ExecutionInfo) -> anyhow::Result<ExecutionInfo> {
        Ok(info
            .to_builder()
            .execution_status(ExecutionStatus::InProgress)
            .should_retry(true)
            .build())
    }

    #[tokio::test]
    async fn high_priority_job_completes_and_is_deleted() {
        let h = harness(
            TaskRegistry::builder().register("A", completes, RetryPolicy::none()).build(),
            100,
            0,
            42,
        );
        let job_id = h.submit("A", Priority::High).await;

        assert_eq!(h.tick().await, 1);

        assert!(h.store.get(job_id).is_none());
        let stats = h.scheduler.stats();
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.missing_tasks, 0);
    }

    #[tokio::test]
    async fn unregistered_task_is_released_unchanged() {
        let h = harness(TaskRegistry::default(), 70, 10, 75);
        let job_id = h.submit("B", Priority::Low).await;
        let before = h.store.get(job_id).unwrap();

        assert_eq!(h.tick().await, 1);

        let after = h.store.get(job_id).unwrap();
        assert!(!after.is_claimed());
        assert_eq!(after.next_task, "B");
        assert_eq!(after, before);
        assert_eq!(h.scheduler.stats().missing_tasks, 1);

        // Still claimable on the next cycle.
        assert_eq!(h.tick().await, 1);
        assert_eq!(h.scheduler.stats().missing_tasks, 2);
    }

    #[tokio::test]
    async fn retry_offsets_follow_backoff_then_advance() {
        let h = harness(
            TaskRegistry::builder()
                .register("R", always_retry, RetryPolicy::backoff_secs(&[5, 10, 15]))
                .build(),
            0,
            0,
            0,
        );
        let job_id = h.submit("R", Priority::Medium).await;

        for (offset, remaining) in [(5, 2u32), (10, 1), (15, 0)] {
            let ran_at = h.clock.now();
            assert_eq!(h.tick().await, 1);
            let job = h.store.get(job_id).unwrap();
            assert_eq!(job.next_task_start_time, ran_at + Duration::seconds(offset));
            assert_eq!(job.retry_attempts_remaining, remaining);

            // Not due until the backoff elapses.
            assert_eq!(h.tick().await, 0);
            h.clock.set(job.next_task_start_time);
        }

        assert_eq!(h.tick().await, 1);
        let job = h.store.get(job_id).unwrap();
        assert_eq!(job.retry_attempts_remaining, 3);
        let stats = h.scheduler.stats();
        assert_eq!(stats.retries_scheduled, 3);
        assert_eq!(stats.jobs_advanced, 1);
    }

    #[tokio::test]
    async fn multi_step_job_advances_through_tasks() {
        let h = harness(
            TaskRegistry::builder()
                .register(
                    "extract",
                    |info: ExecutionInfo| -> anyhow::Result<ExecutionInfo> {
                        Ok(info
                            .to_builder()
                            .job_data(json!({"rows": 3}))
                            .next_task("load")
                            .execution_status(ExecutionStatus::InProgress)
                            .build())
                    },
                    RetryPolicy::none(),
                )
                .register("load", completes, RetryPolicy::backoff_secs(&[30, 60]))
                .build(),
            70,
            10,
            90,
        );
        let job_id = h.submit("extract", Priority::Medium).await;

        assert_eq!(h.tick().await, 1);
        let job = h.store.get(job_id).unwrap();
        assert_eq!(job.next_task, "load");
        assert_eq!(job.job_data, json!({"rows": 3}));
        assert_eq!(job.retry_attempts_remaining, 2);

        assert_eq!(h.tick().await, 1);
        assert!(h.store.get(job_id).is_none());
    }

    #[tokio::test]
    async fn leading_tier_is_drained_first() {
        let registry = TaskRegistry::builder().register("A", completes, RetryPolicy::none()).build();
        let h = harness(registry, 70, 10, 75);
        let low = h.submit("A", Priority::Low).await;
        let high = h.submit("A", Priority::High).await;
        let medium = h.submit("A", Priority::Medium).await;

        let mut tx = h.service.begin().await.unwrap();
        let order = PrioritySelector::new(70, 10, FixedPercentage(75))
            .unwrap()
            .select_ordered_priorities();
        let claimed = h
            .service
            .fetch_due_jobs(&mut tx, jobstore_core::WorkerId::new(), &order, 10)
            .await
            .unwrap();
        h.service.commit(tx).await.unwrap();

        let ids: Vec<JobId> = claimed.iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec![low, high, medium]);
    }

    #[tokio::test]
    async fn failed_claim_cycle_is_followed_by_a_good_one() {
        let h = harness(
            TaskRegistry::builder().register("A", completes, RetryPolicy::none()).build(),
            70,
            10,
            0,
        );
        let job_id = h.submit("A", Priority::High).await;

        h.store.set_available(false);
        assert!(h.scheduler.tick().await.is_err());
        h.store.set_available(true);
        assert!(!h.store.get(job_id).unwrap().is_claimed());

        assert_eq!(h.tick().await, 1);
        assert!(h.store.get(job_id).is_none());
        assert_eq!(h.scheduler.stats().claim_failures, 1);
    }

    #[tokio::test]
    async fn failed_handler_is_recovered_after_lease() {
        let h = harness(
            TaskRegistry::builder()
                .register(
                    "flaky",
                    |_: ExecutionInfo| -> anyhow::Result<ExecutionInfo> { anyhow::bail!("down") },
                    RetryPolicy::none(),
                )
                .build(),
            70,
            10,
            0,
        );
        let job_id = h.submit("flaky", Priority::High).await;

        assert_eq!(h.tick().await, 1);
        assert!(h.store.get(job_id).unwrap().is_claimed());
        assert_eq!(h.tick().await, 0);

        h.clock.advance(Duration::seconds(601));
        assert_eq!(h.tick().await, 1);
        assert_eq!(h.scheduler.stats().jobs_failed, 2);
    }

    #[tokio::test]
    async fn failures_in_a_batch_leave_siblings_untouched() {
        let h = harness(
            TaskRegistry::builder()
                .register("ok", completes, RetryPolicy::none())
                .register(
                    "fails",
                    |_: ExecutionInfo| -> anyhow::Result<ExecutionInfo> { anyhow::bail!("rejected") },
                    RetryPolicy::none(),
                )
                .register(
                    "panics",
                    |_: ExecutionInfo| -> anyhow::Result<ExecutionInfo> { panic!("handler bug") },
                    RetryPolicy::none(),
                )
                .build(),
            70,
            10,
            0,
        );
        let fails = h.submit("fails", Priority::High).await;
        let panics = h.submit("panics", Priority::High).await;
        let ok = h.submit("ok", Priority::High).await;

        assert_eq!(h.tick().await, 3);

        assert!(h.store.get(ok).is_none());
        assert!(h.store.get(fails).unwrap().is_claimed());
        assert!(h.store.get(panics).unwrap().is_claimed());
        let stats = h.scheduler.stats();
        assert_eq!(stats.jobs_dispatched, 3);
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.jobs_failed, 2);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn spawned_scheduler_drains_queue_and_stops() {
        let h = harness(
            TaskRegistry::builder().register("A", completes, RetryPolicy::none()).build(),
            70,
            10,
            50,
        );
        for priority in Priority::ALL {
            h.submit("A", priority).await;
        }

        let handle = h.scheduler.spawn();
        for _ in 0..200 {
            if h.store.is_empty() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert!(h.store.is_empty());
    }
}
