//! Persisted job entity and priority tiers.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{JobId, WorkerId};

/// Priority tier. Biases claim order per poll cycle; immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    /// Stored/displayed representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl core::fmt::Display for Priority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HIGH" => Ok(Priority::High),
            "MEDIUM" => Ok(Priority::Medium),
            "LOW" => Ok(Priority::Low),
            other => Err(DomainError::validation(format!(
                "priority must be one of HIGH, MEDIUM, LOW (got '{other}')"
            ))),
        }
    }
}

/// A persisted unit of work progressing through a sequence of named tasks.
///
/// `worker_id` and `start_time` are set together when a scheduler tick claims
/// the job and cleared together on release. A job with `worker_id` set is in
/// flight and hidden from other claimers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    /// Opaque payload handed to task handlers.
    pub job_data: serde_json::Value,
    /// Name of the task to run next.
    pub next_task: String,
    /// Earliest time `next_task` may run.
    pub next_task_start_time: DateTime<Utc>,
    /// Set when claimed.
    pub start_time: Option<DateTime<Utc>>,
    /// Claiming worker; `None` = unclaimed.
    pub worker_id: Option<WorkerId>,
    /// Retries left for the current task.
    pub retry_attempts_remaining: u32,
    pub priority: Priority,
}

impl Job {
    /// Create a new, unclaimed job.
    pub fn new(
        job_id: JobId,
        job_data: serde_json::Value,
        next_task: impl Into<String>,
        next_task_start_time: DateTime<Utc>,
        retry_attempts_remaining: u32,
        priority: Priority,
    ) -> Self {
        Self {
            job_id,
            job_data,
            next_task: next_task.into(),
            next_task_start_time,
            start_time: None,
            worker_id: None,
            retry_attempts_remaining,
            priority,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.worker_id.is_some()
    }

    /// `next_task_start_time <= now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_task_start_time <= now
    }

    /// Whether a claim at `now` may take this job.
    ///
    /// Unclaimed due jobs are always claimable. A claimed job is claimable
    /// again only when `lease_cutoff` is given and its claim started before it.
    pub fn is_claimable(&self, now: DateTime<Utc>, lease_cutoff: Option<DateTime<Utc>>) -> bool {
        if !self.is_due(now) {
            return false;
        }
        match (self.worker_id, self.start_time, lease_cutoff) {
            (None, _, _) => true,
            (Some(_), Some(claimed_at), Some(cutoff)) => claimed_at < cutoff,
            _ => false,
        }
    }

    /// Mark the job as claimed by `worker_id`.
    pub fn claim(&mut self, worker_id: WorkerId, now: DateTime<Utc>) {
        self.worker_id = Some(worker_id);
        self.start_time = Some(now);
    }

    /// Clear the claim. No-op on an unclaimed job.
    pub fn release(&mut self) {
        self.worker_id = None;
        self.start_time = None;
    }
}
