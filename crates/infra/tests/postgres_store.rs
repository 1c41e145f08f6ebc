//! PostgreSQL adapter tests.
//!
//! Require a live database: `DATABASE_URL=postgres://... cargo test -- --ignored`.
//! Tests share the `job` table, so they serialize on a lock and clear it first.

use std::sync::Mutex;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;

use jobstore_core::{Job, JobId, Priority, WorkerId};
use jobstore_infra::jobs::{ClaimRequest, JobStore, JobStoreError, PostgresJobStore};

static TABLE_LOCK: Mutex<()> = Mutex::new(());

async fn store() -> PostgresJobStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("connect");
    let store = PostgresJobStore::new(pool);
    store.ensure_schema().await.expect("schema");

    let mut tx = store.begin().await.unwrap();
    for job in claim_all(&store, &mut tx).await {
        let owner = job.worker_id.expect("claimed");
        store.delete(&mut tx, job.job_id, owner).await.unwrap();
    }
    store.commit(tx).await.unwrap();
    store
}

async fn claim_all(store: &PostgresJobStore, tx: &mut <PostgresJobStore as JobStore>::Tx) -> Vec<Job> {
    store
        .claim_unassigned(
            tx,
            &ClaimRequest {
                worker_id: WorkerId::new(),
                priorities: Priority::ALL.to_vec(),
                limit: 100_000,
                now: Utc::now() + Duration::days(365 * 100),
                lease_cutoff: Some(Utc::now() + Duration::days(365 * 100)),
            },
        )
        .await
        .unwrap()
}

/// Postgres keeps microseconds.
fn now() -> DateTime<Utc> {
    Utc::now().duration_trunc(Duration::microseconds(1)).unwrap()
}

fn job(priority: Priority, due: DateTime<Utc>) -> Job {
    Job::new(JobId::new(), json!({"source": "pg"}), "A", due, 2, priority)
}

fn request(now: DateTime<Utc>, limit: usize) -> ClaimRequest {
    ClaimRequest {
        worker_id: WorkerId::new(),
        priorities: vec![Priority::High, Priority::Medium, Priority::Low],
        limit,
        now,
        lease_cutoff: None,
    }
}

#[tokio::test]
#[ignore]
async fn insert_claim_release_round_trip() {
    let _guard = TABLE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let store = store().await;
    let now = now();
    let j = job(Priority::High, now);

    let mut tx = store.begin().await.unwrap();
    store.insert(&mut tx, &j).await.unwrap();
    store.commit(tx).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let req = request(now, 10);
    let claimed = store.claim_unassigned(&mut tx, &req).await.unwrap();
    let again = store.claim_unassigned(&mut tx, &request(now, 10)).await.unwrap();
    store.commit(tx).await.unwrap();

    assert_eq!(claimed.len(), 1);
    assert!(again.is_empty());
    assert_eq!(claimed[0].job_id, j.job_id);
    assert_eq!(claimed[0].worker_id, Some(req.worker_id));
    assert_eq!(claimed[0].start_time, Some(now));
    assert_eq!(claimed[0].job_data, j.job_data);

    let mut tx = store.begin().await.unwrap();
    store.release(&mut tx, j.job_id, req.worker_id).await.unwrap();
    let err = store.release(&mut tx, j.job_id, req.worker_id).await.unwrap_err();
    assert_eq!(err, JobStoreError::ClaimLost { job_id: j.job_id, owner: req.worker_id });
    let row = store.find(&mut tx, j.job_id).await.unwrap().unwrap();
    store.commit(tx).await.unwrap();
    assert_eq!(row, j);
}

#[tokio::test]
#[ignore]
async fn duplicate_insert_is_reported() {
    let _guard = TABLE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let store = store().await;
    let j = job(Priority::Low, now());

    let mut tx = store.begin().await.unwrap();
    store.insert(&mut tx, &j).await.unwrap();
    store.commit(tx).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let err = store.insert(&mut tx, &j).await.unwrap_err();
    store.rollback(tx).await.unwrap();
    assert_eq!(err, JobStoreError::DuplicateId(j.job_id));
}

#[tokio::test]
#[ignore]
async fn future_jobs_are_not_claimed() {
    let _guard = TABLE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let store = store().await;
    let now = now();

    let mut tx = store.begin().await.unwrap();
    store.insert(&mut tx, &job(Priority::High, now + Duration::minutes(5))).await.unwrap();
    let claimed = store.claim_unassigned(&mut tx, &request(now, 10)).await.unwrap();
    store.commit(tx).await.unwrap();

    assert!(claimed.is_empty());
}

#[tokio::test]
#[ignore]
async fn tiers_drain_in_requested_order() {
    let _guard = TABLE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let store = store().await;
    let now = now();
    let low = job(Priority::Low, now - Duration::seconds(30));
    let high = job(Priority::High, now);
    let medium = job(Priority::Medium, now - Duration::seconds(60));

    let mut tx = store.begin().await.unwrap();
    for j in [&low, &high, &medium] {
        store.insert(&mut tx, j).await.unwrap();
    }
    let mut req = request(now, 2);
    req.priorities = vec![Priority::Low, Priority::High, Priority::Medium];
    let claimed = store.claim_unassigned(&mut tx, &req).await.unwrap();
    store.commit(tx).await.unwrap();

    let ids: Vec<JobId> = claimed.iter().map(|j| j.job_id).collect();
    assert_eq!(ids, vec![low.job_id, high.job_id]);
}

#[tokio::test]
#[ignore]
async fn concurrent_transactions_skip_locked_rows() {
    let _guard = TABLE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let store = store().await;
    let now = now();

    let mut tx = store.begin().await.unwrap();
    store.insert(&mut tx, &job(Priority::Medium, now)).await.unwrap();
    store.insert(&mut tx, &job(Priority::Medium, now)).await.unwrap();
    store.commit(tx).await.unwrap();

    let mut first = store.begin().await.unwrap();
    let mut second = store.begin().await.unwrap();
    let a = store.claim_unassigned(&mut first, &request(now, 1)).await.unwrap();
    let b = store.claim_unassigned(&mut second, &request(now, 1)).await.unwrap();
    store.commit(first).await.unwrap();
    store.commit(second).await.unwrap();

    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);
    assert_ne!(a[0].job_id, b[0].job_id);
}

#[tokio::test]
#[ignore]
async fn rollback_discards_claim_and_updates() {
    let _guard = TABLE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let store = store().await;
    let now = now();
    let j = job(Priority::High, now);

    let mut tx = store.begin().await.unwrap();
    store.insert(&mut tx, &j).await.unwrap();
    store.commit(tx).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let req = request(now, 1);
    store.claim_unassigned(&mut tx, &req).await.unwrap();
    store
        .update_next_task(&mut tx, j.job_id, req.worker_id, "B", now + Duration::hours(1), 0)
        .await
        .unwrap();
    store.rollback(tx).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let row = store.find(&mut tx, j.job_id).await.unwrap().unwrap();
    store.commit(tx).await.unwrap();
    assert_eq!(row, j);
}

#[tokio::test]
#[ignore]
async fn field_updates_and_delete_apply() {
    let _guard = TABLE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let store = store().await;
    let now = now();
    let j = job(Priority::Medium, now);
    let later = now + Duration::seconds(10);

    let mut tx = store.begin().await.unwrap();
    store.insert(&mut tx, &j).await.unwrap();
    let owner = request(now, 1).worker_id;
    assert!(store
        .update_task_data(&mut tx, j.job_id, owner, &json!({"step": 2}))
        .await
        .unwrap_err()
        .is_claim_lost());
    let req = request(now, 1);
    let owner = req.worker_id;
    store.claim_unassigned(&mut tx, &req).await.unwrap();
    store.update_task_data(&mut tx, j.job_id, owner, &json!({"step": 2})).await.unwrap();
    store.update_retry_details(&mut tx, j.job_id, owner, later, 1).await.unwrap();
    let row = store.find(&mut tx, j.job_id).await.unwrap().unwrap();
    assert_eq!(row.job_data, json!({"step": 2}));
    assert_eq!(row.next_task_start_time, later);
    assert_eq!(row.retry_attempts_remaining, 1);

    store.update_next_task(&mut tx, j.job_id, owner, "B", now, 3).await.unwrap();
    let row = store.find(&mut tx, j.job_id).await.unwrap().unwrap();
    assert_eq!(row.next_task, "B");
    assert_eq!(row.retry_attempts_remaining, 3);

    store.delete(&mut tx, j.job_id, owner).await.unwrap();
    assert!(store.find(&mut tx, j.job_id).await.unwrap().is_none());
    store.commit(tx).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn lease_expired_claims_are_reclaimed() {
    let _guard = TABLE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let store = store().await;
    let now = now();

    let j = job(Priority::High, now);
    let first = request(now, 1);
    let mut tx = store.begin().await.unwrap();
    store.insert(&mut tx, &j).await.unwrap();
    assert_eq!(store.claim_unassigned(&mut tx, &first).await.unwrap().len(), 1);
    store.commit(tx).await.unwrap();

    let later = now + Duration::minutes(11);
    let mut tx = store.begin().await.unwrap();
    assert!(store.claim_unassigned(&mut tx, &request(later, 1)).await.unwrap().is_empty());
    let mut leased = request(later, 1);
    leased.lease_cutoff = Some(later - Duration::minutes(10));
    assert_eq!(store.claim_unassigned(&mut tx, &leased).await.unwrap().len(), 1);
    store.commit(tx).await.unwrap();

    // The previous holder can no longer write.
    let mut tx = store.begin().await.unwrap();
    let err = store.delete(&mut tx, j.job_id, first.worker_id).await.unwrap_err();
    let row = store.find(&mut tx, j.job_id).await.unwrap().unwrap();
    store.rollback(tx).await.unwrap();
    assert!(err.is_claim_lost());
    assert_eq!(row.worker_id, Some(leased.worker_id));
}
