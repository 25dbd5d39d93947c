//! Persistent delivery queue with delayed scheduling and bounded retry.
//!
//! Claiming flips the oldest due row from queued to active in a single
//! UPDATE, so a job is visible to at most one worker at a time; the same
//! goes for rescheduling, which is atomic with the visibility change.

use std::sync::Arc;
use std::time::Duration;

use libsql::params;
use uuid::Uuid;

use crate::error::StoreError;
use crate::queue::job::{DeliveryJob, JobState, QueueStats};
use crate::store::db::Storage;

const JOB_COLUMNS: &str =
    "id, record_id, payload, status, not_before, attempts, max_attempts, backoff_ms, last_error, created_at";

fn str_to_state(s: &str) -> JobState {
    match s {
        "active" => JobState::Active,
        "completed" => JobState::Completed,
        "failed" => JobState::Failed,
        _ => JobState::Queued,
    }
}

/// Map a libsql Row to a DeliveryJob. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<DeliveryJob, libsql::Error> {
    let record_id_str: String = row.get(1)?;
    let status_str: String = row.get(3)?;

    Ok(DeliveryJob {
        id: row.get(0)?,
        record_id: Uuid::parse_str(&record_id_str).unwrap_or_else(|_| Uuid::nil()),
        payload: row.get(2)?,
        state: str_to_state(&status_str),
        not_before_ms: row.get(4)?,
        attempts: row.get::<i64>(5)? as u32,
        max_attempts: row.get::<i64>(6)? as u32,
        backoff_ms: row.get(7)?,
        last_error: row.get(8).ok(),
        created_at_ms: row.get(9)?,
    })
}

/// The job store. All scheduling state lives in the `delivery_jobs`
/// table, so queued work survives a restart.
pub struct DeliveryQueue {
    storage: Arc<Storage>,
    initial_delay: Duration,
    max_attempts: u32,
    backoff: Duration,
}

impl DeliveryQueue {
    pub fn new(
        storage: Arc<Storage>,
        initial_delay: Duration,
        max_attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            storage,
            initial_delay,
            max_attempts,
            backoff,
        }
    }

    /// Enqueue a delivery for `record_id`, due after the initial delay.
    pub async fn enqueue(
        &self,
        record_id: Uuid,
        payload: &str,
        now_ms: i64,
    ) -> Result<DeliveryJob, StoreError> {
        let not_before_ms = now_ms + self.initial_delay.as_millis() as i64;
        let backoff_ms = self.backoff.as_millis() as i64;

        let mut rows = self
            .storage
            .conn()
            .query(
                "INSERT INTO delivery_jobs (record_id, payload, status, not_before, attempts, max_attempts, backoff_ms, created_at) \
                 VALUES (?1, ?2, 'queued', ?3, 0, ?4, ?5, ?6) RETURNING id",
                params![
                    record_id.to_string(),
                    payload,
                    not_before_ms,
                    self.max_attempts as i64,
                    backoff_ms,
                    now_ms,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("enqueue job: {e}")))?;

        let id: i64 = match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| StoreError::Query(format!("enqueue job id: {e}")))?,
            Ok(None) => return Err(StoreError::Query("enqueue job: no id returned".to_string())),
            Err(e) => return Err(StoreError::Query(format!("enqueue job: {e}"))),
        };

        Ok(DeliveryJob {
            id,
            record_id,
            payload: payload.to_string(),
            state: JobState::Queued,
            not_before_ms,
            attempts: 0,
            max_attempts: self.max_attempts,
            backoff_ms,
            last_error: None,
            created_at_ms: now_ms,
        })
    }

    /// Claim the oldest due job, if any. The single UPDATE guarantees no
    /// two workers ever hold the same job.
    pub async fn claim_due(&self, now_ms: i64) -> Result<Option<DeliveryJob>, StoreError> {
        let mut rows = self
            .storage
            .conn()
            .query(
                &format!(
                    "UPDATE delivery_jobs SET status = 'active' \
                     WHERE id = (SELECT id FROM delivery_jobs \
                                 WHERE status = 'queued' AND not_before <= ?1 \
                                 ORDER BY not_before ASC, id ASC LIMIT 1) \
                     RETURNING {JOB_COLUMNS}"
                ),
                params![now_ms],
            )
            .await
            .map_err(|e| StoreError::Query(format!("claim job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let job = row_to_job(&row)
                    .map_err(|e| StoreError::Query(format!("claim job row parse: {e}")))?;
                Ok(Some(job))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("claim job: {e}"))),
        }
    }

    /// Push a claimed job back to queued, due at `until_ms`. Used for
    /// cooldown pauses; the attempt counter is untouched.
    pub async fn reschedule(&self, job_id: i64, until_ms: i64) -> Result<(), StoreError> {
        let affected = self
            .storage
            .conn()
            .execute(
                "UPDATE delivery_jobs SET status = 'queued', not_before = ?1 WHERE id = ?2",
                params![until_ms, job_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("reschedule job: {e}")))?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "delivery job".to_string(),
                id: job_id.to_string(),
            });
        }
        Ok(())
    }

    /// Terminal success for the job itself.
    pub async fn complete(&self, job_id: i64) -> Result<(), StoreError> {
        let affected = self
            .storage
            .conn()
            .execute(
                "UPDATE delivery_jobs SET status = 'completed' WHERE id = ?1",
                params![job_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("complete job: {e}")))?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "delivery job".to_string(),
                id: job_id.to_string(),
            });
        }
        Ok(())
    }

    /// Consume one retry attempt after a delivery fault. The job goes
    /// back to queued with the backoff applied until its budget is spent,
    /// then fails terminally. Returns the resulting state and attempt
    /// count.
    pub async fn record_failure(
        &self,
        job_id: i64,
        error: &str,
        now_ms: i64,
    ) -> Result<(JobState, u32), StoreError> {
        let mut rows = self
            .storage
            .conn()
            .query(
                "UPDATE delivery_jobs SET \
                     attempts = attempts + 1, \
                     status = CASE WHEN attempts + 1 >= max_attempts THEN 'failed' ELSE 'queued' END, \
                     not_before = CASE WHEN attempts + 1 >= max_attempts THEN not_before ELSE ?1 + backoff_ms END, \
                     last_error = ?2 \
                 WHERE id = ?3 \
                 RETURNING status, attempts",
                params![now_ms, error, job_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("record job failure: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let status: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("job failure row parse: {e}")))?;
                let attempts: i64 = row
                    .get(1)
                    .map_err(|e| StoreError::Query(format!("job failure row parse: {e}")))?;
                Ok((str_to_state(&status), attempts as u32))
            }
            Ok(None) => Err(StoreError::NotFound {
                entity: "delivery job".to_string(),
                id: job_id.to_string(),
            }),
            Err(e) => Err(StoreError::Query(format!("record job failure: {e}"))),
        }
    }

    pub async fn get(&self, job_id: i64) -> Result<Option<DeliveryJob>, StoreError> {
        let mut rows = self
            .storage
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM delivery_jobs WHERE id = ?1"),
                params![job_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let job = row_to_job(&row)
                    .map_err(|e| StoreError::Query(format!("get job row parse: {e}")))?;
                Ok(Some(job))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get job: {e}"))),
        }
    }

    /// Counts by state. Queued jobs split into waiting (due) and delayed
    /// (not yet due) at `now_ms`.
    pub async fn stats(&self, now_ms: i64) -> Result<QueueStats, StoreError> {
        let mut rows = self
            .storage
            .conn()
            .query(
                "SELECT \
                     COUNT(CASE WHEN status = 'queued' AND not_before <= ?1 THEN 1 END), \
                     COUNT(CASE WHEN status = 'active' THEN 1 END), \
                     COUNT(CASE WHEN status = 'completed' THEN 1 END), \
                     COUNT(CASE WHEN status = 'failed' THEN 1 END), \
                     COUNT(CASE WHEN status = 'queued' AND not_before > ?1 THEN 1 END) \
                 FROM delivery_jobs",
                params![now_ms],
            )
            .await
            .map_err(|e| StoreError::Query(format!("queue stats: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let get = |i: i32| -> Result<u64, StoreError> {
                    row.get::<i64>(i)
                        .map(|n| n as u64)
                        .map_err(|e| StoreError::Query(format!("queue stats parse: {e}")))
                };
                Ok(QueueStats {
                    waiting: get(0)?,
                    active: get(1)?,
                    completed: get(2)?,
                    failed: get(3)?,
                    delayed: get(4)?,
                })
            }
            Ok(None) => Ok(QueueStats::default()),
            Err(e) => Err(StoreError::Query(format!("queue stats: {e}"))),
        }
    }

    /// Delete completed/failed jobs created before `cutoff_ms`. Returns
    /// the number of deleted rows.
    pub async fn prune_terminal_before(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        self.storage
            .conn()
            .execute(
                "DELETE FROM delivery_jobs WHERE created_at < ?1 AND status IN ('completed', 'failed')",
                params![cutoff_ms],
            )
            .await
            .map_err(|e| StoreError::Query(format!("prune jobs: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A fixed origin keeps the schedule arithmetic readable.
    const T0: i64 = 1_700_000_000_000;

    async fn test_queue() -> DeliveryQueue {
        let storage = Arc::new(Storage::open_memory().await.unwrap());
        DeliveryQueue::new(
            storage,
            Duration::from_secs(2),
            3,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn enqueue_applies_the_initial_delay() {
        let queue = test_queue().await;
        let job = queue.enqueue(Uuid::new_v4(), "hello", T0).await.unwrap();

        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.not_before_ms, T0 + 2_000);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);

        let stats = queue.stats(T0).await.unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.waiting, 0);

        let stats = queue.stats(T0 + 2_000).await.unwrap();
        assert_eq!(stats.delayed, 0);
        assert_eq!(stats.waiting, 1);
    }

    #[tokio::test]
    async fn claim_respects_the_not_before_time() {
        let queue = test_queue().await;
        queue.enqueue(Uuid::new_v4(), "later", T0).await.unwrap();

        assert!(queue.claim_due(T0).await.unwrap().is_none());
        assert!(queue.claim_due(T0 + 1_999).await.unwrap().is_none());
        assert!(queue.claim_due(T0 + 2_000).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn a_claimed_job_is_invisible_to_other_claims() {
        let queue = test_queue().await;
        queue.enqueue(Uuid::new_v4(), "solo", T0).await.unwrap();

        let due = T0 + 2_000;
        let first = queue.claim_due(due).await.unwrap().unwrap();
        assert_eq!(first.state, JobState::Active);
        assert!(queue.claim_due(due).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claims_come_back_oldest_due_first() {
        let queue = test_queue().await;
        let a = queue.enqueue(Uuid::new_v4(), "a", T0).await.unwrap();
        let b = queue.enqueue(Uuid::new_v4(), "b", T0).await.unwrap();

        let due = T0 + 2_000;
        assert_eq!(queue.claim_due(due).await.unwrap().unwrap().id, a.id);
        assert_eq!(queue.claim_due(due).await.unwrap().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn reschedule_keeps_the_attempt_counter() {
        let queue = test_queue().await;
        let job = queue.enqueue(Uuid::new_v4(), "paused", T0).await.unwrap();

        let due = T0 + 2_000;
        queue.claim_due(due).await.unwrap().unwrap();
        let until = due + 30_000;
        queue.reschedule(job.id, until).await.unwrap();

        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);
        assert_eq!(stored.not_before_ms, until);
        assert_eq!(stored.attempts, 0);

        assert!(queue.claim_due(until - 1).await.unwrap().is_none());
        assert!(queue.claim_due(until).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn complete_is_terminal() {
        let queue = test_queue().await;
        let job = queue.enqueue(Uuid::new_v4(), "done", T0).await.unwrap();

        let due = T0 + 2_000;
        queue.claim_due(due).await.unwrap().unwrap();
        queue.complete(job.id).await.unwrap();

        let stats = queue.stats(due).await.unwrap();
        assert_eq!(stats.completed, 1);
        assert!(queue.claim_due(due + 60_000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn three_failures_exhaust_the_budget() {
        let queue = test_queue().await;
        let job = queue.enqueue(Uuid::new_v4(), "doomed", T0).await.unwrap();

        let mut now = T0 + 2_000;
        queue.claim_due(now).await.unwrap().unwrap();
        let (state, attempts) = queue.record_failure(job.id, "boom 1", now).await.unwrap();
        assert_eq!((state, attempts), (JobState::Queued, 1));

        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.not_before_ms, now + 5_000);
        assert_eq!(stored.last_error.as_deref(), Some("boom 1"));

        now += 5_000;
        queue.claim_due(now).await.unwrap().unwrap();
        let (state, attempts) = queue.record_failure(job.id, "boom 2", now).await.unwrap();
        assert_eq!((state, attempts), (JobState::Queued, 2));

        now += 5_000;
        queue.claim_due(now).await.unwrap().unwrap();
        let (state, attempts) = queue.record_failure(job.id, "boom 3", now).await.unwrap();
        assert_eq!((state, attempts), (JobState::Failed, 3));
        assert!(state.is_terminal());

        // No fourth attempt: nothing is claimable any more.
        assert!(queue.claim_due(now + 60_000).await.unwrap().is_none());
        let stats = queue.stats(now).await.unwrap();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn prune_drops_only_old_terminal_jobs() {
        let queue = test_queue().await;
        let done = queue.enqueue(Uuid::new_v4(), "done", T0).await.unwrap();
        let pending = queue.enqueue(Uuid::new_v4(), "pending", T0).await.unwrap();

        queue.claim_due(T0 + 2_000).await.unwrap().unwrap();
        queue.complete(done.id).await.unwrap();

        let deleted = queue.prune_terminal_before(T0 + 10_000).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(queue.get(done.id).await.unwrap().is_none());
        assert!(queue.get(pending.id).await.unwrap().is_some());
    }
}
