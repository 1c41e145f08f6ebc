//! Persistent job scheduling and task execution.
//!
//! ## Components
//!
//! - `JobStore`: transactional persistence port (in-memory and PostgreSQL)
//! - `PrioritySelector`: weighted tier order per poll cycle
//! - `TaskRegistry`: task name to handler and retry backoff
//! - `JobService`: submission and store façade
//! - `JobExecutor`: runs one job and persists the transition
//! - `JobScheduler`: timer loop claiming jobs into a bounded worker pool

pub mod executor;
pub mod postgres;
pub mod priority;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod store;

pub use executor::{ExecutionError, ExecutionOutcome, JobExecutor};
pub use postgres::PostgresJobStore;
pub use priority::{FixedPercentage, PercentageSource, PrioritySelector, RandomPercentage};
pub use registry::{ExecutableTask, RetryPolicy, TaskDescriptor, TaskRegistry, TaskRegistryBuilder};
pub use scheduler::{JobScheduler, SchedulerConfig, SchedulerHandle, SchedulerStats};
pub use service::JobService;
pub use store::{ClaimRequest, InMemoryJobStore, InMemoryTx, JobStore, JobStoreError};
