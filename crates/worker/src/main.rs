use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;

use jobstore_core::UtcClock;
use jobstore_infra::config::JobStoreConfig;
use jobstore_infra::jobs::{JobExecutor, JobScheduler, JobService, PostgresJobStore, PrioritySelector};

mod tasks;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    jobstore_observability::init();

    let config = JobStoreConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(config.require_database_url()?)
        .await?;
    let store = PostgresJobStore::new(pool);
    store.ensure_schema().await?;

    let registry = Arc::new(tasks::registry());
    tracing::info!(
        module = %config.module_name,
        tasks = ?registry.task_names().collect::<Vec<_>>(),
        "task registry built"
    );

    let service = JobService::new(store, registry, Arc::new(UtcClock))
        .with_claim_lease(config.claim_lease_chrono());
    let selector =
        PrioritySelector::random(config.priority_percentage_high, config.priority_percentage_low)?;
    let scheduler = JobScheduler::new(JobExecutor::new(service), selector, config.scheduler());
    let handle = scheduler.spawn();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    let stats = handle.shutdown().await;
    tracing::info!(
        module = %config.module_name,
        ticks = stats.ticks,
        dispatched = stats.jobs_dispatched,
        completed = stats.jobs_completed,
        failed = stats.jobs_failed,
        "worker stopped"
    );
    Ok(())
}
