//! Delivery job model.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue-side state of a job.
///
/// A queued job whose not-before time is still in the future counts as
/// "delayed" in stats; one that is due counts as "waiting".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    /// Claimed by exactly one worker.
    Active,
    Completed,
    /// Retry budget exhausted.
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// One scheduled delivery. References its message record by id; the
/// payload is a snapshot taken at enqueue time, so later record edits do
/// not propagate into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub id: i64,
    pub record_id: Uuid,
    pub payload: String,
    pub state: JobState,
    /// Earliest instant a worker may run this job, epoch milliseconds.
    pub not_before_ms: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_ms: i64,
    pub last_error: Option<String>,
    pub created_at_ms: i64,
}

/// Counts by job state, as exposed by the stats surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}
