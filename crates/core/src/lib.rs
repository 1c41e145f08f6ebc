//! `jobstore-core` — job model building blocks.
//!
//! This crate contains **pure data** (no persistence or runtime concerns): the
//! persisted [`Job`], the transient [`ExecutionInfo`] work order handed to
//! task handlers, and the [`Clock`] collaborator used for due-time checks.

pub mod clock;
pub mod error;
pub mod execution;
pub mod id;
pub mod job;

pub use clock::{Clock, ManualClock, UtcClock};
pub use error::{DomainError, DomainResult};
pub use execution::{ExecutionInfo, ExecutionInfoBuilder, ExecutionStatus};
pub use id::{JobId, WorkerId};
pub use job::{Job, Priority};
