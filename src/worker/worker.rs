//! Delivery worker.
//!
//! Each worker polls the queue for due jobs and walks every claimed job
//! through the same sequence: cooldown check, record update, delivery,
//! outcome handling. The cooldown marker is shared by all workers, so a
//! single rate-limit signal pauses the whole fleet.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::Transport;
use crate::clock::Clock;
use crate::error::DeliveryError;
use crate::queue::{DeliveryJob, DeliveryQueue, JobState};
use crate::store::destinations::DestinationStore;
use crate::store::records::RecordStore;
use crate::worker::cooldown::CooldownGate;

/// Shared dependencies for delivery workers.
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: Arc<DeliveryQueue>,
    pub records: Arc<RecordStore>,
    pub destinations: Arc<DestinationStore>,
    pub cooldown: Arc<dyn CooldownGate>,
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
    /// How long an idle worker sleeps between queue polls.
    pub poll_interval: Duration,
    /// Cooldown length when a rate-limit signal carries no hint.
    pub default_retry_after: Duration,
}

/// What processing one claimed job amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Delivered; record and job are terminal.
    Sent,
    /// This delivery hit the throttle: cooldown written, job pushed past
    /// it, no attempt consumed, record left as-is.
    RateLimited { retry_after: Duration },
    /// Delivery fault; record marked failed, one attempt consumed.
    Failed { detail: String },
    /// A cooldown was already active; job moved to its end, untouched.
    Rescheduled { until_ms: i64 },
}

/// Worker that processes delivery jobs until its task is aborted.
pub struct DeliveryWorker {
    id: usize,
    deps: WorkerDeps,
}

impl DeliveryWorker {
    pub fn new(id: usize, deps: WorkerDeps) -> Self {
        Self { id, deps }
    }

    /// Poll loop: claim a due job, or sleep one interval when idle.
    pub async fn run(&self) {
        info!(worker = self.id, "Delivery worker started");
        loop {
            let now_ms = self.deps.clock.now_ms();
            match self.deps.queue.claim_due(now_ms).await {
                Ok(Some(job)) => {
                    let outcome = self.process_job(&job).await;
                    debug!(worker = self.id, job = job.id, ?outcome, "Job processed");
                }
                Ok(None) => tokio::time::sleep(self.deps.poll_interval).await,
                Err(e) => {
                    error!(worker = self.id, "Claiming from the queue failed: {e}");
                    tokio::time::sleep(self.deps.poll_interval).await;
                }
            }
        }
    }

    /// Walk one claimed job through the delivery sequence.
    pub async fn process_job(&self, job: &DeliveryJob) -> JobOutcome {
        let now_ms = self.deps.clock.now_ms();
        match self.deps.cooldown.current().await {
            Ok(Some(until_ms)) if now_ms < until_ms => {
                // Paused. Move the job past the marker without consuming
                // an attempt or touching the record.
                return self.push_past_cooldown(job, until_ms).await;
            }
            Ok(_) => {}
            Err(e) => {
                // Fail open: an unreachable gate must not halt delivery.
                warn!("Cooldown gate unavailable, proceeding: {e}");
            }
        }

        if let Err(e) = self.deps.records.mark_processing(job.record_id).await {
            return self
                .fail_attempt(job, &format!("record unavailable: {e}"))
                .await;
        }

        match self.deliver(job).await {
            Ok(()) => self.complete(job).await,
            Err(DeliveryError::RateLimited { retry_after }) => {
                self.start_cooldown(job, retry_after).await
            }
            Err(e) => self.fail_attempt(job, &e.to_string()).await,
        }
    }

    /// Resolve the destination and hand the payload to the transport.
    async fn deliver(&self, job: &DeliveryJob) -> Result<(), DeliveryError> {
        let destination = self
            .deps
            .destinations
            .active()
            .await
            .map_err(|e| DeliveryError::Api(format!("destination lookup: {e}")))?
            .ok_or(DeliveryError::NoDestination)?;

        if !destination.bot_is_admin {
            return Err(DeliveryError::NotAdmin {
                chat_id: destination.chat_id,
            });
        }

        self.deps
            .transport
            .deliver(&destination.chat_id, &job.payload)
            .await
    }

    async fn complete(&self, job: &DeliveryJob) -> JobOutcome {
        let now = self.deps.clock.now();
        if let Err(e) = self.deps.records.mark_sent(job.record_id, now).await {
            warn!(job = job.id, "Could not mark record sent: {e}");
        }
        if let Err(e) = self.deps.queue.complete(job.id).await {
            error!(job = job.id, "Could not complete job: {e}");
        }
        info!(job = job.id, record = %job.record_id, "Message delivered");
        JobOutcome::Sent
    }

    /// Write the shared cooldown marker and push this job past it. The
    /// record keeps whatever status it had; no attempt is consumed.
    async fn start_cooldown(
        &self,
        job: &DeliveryJob,
        retry_after: Option<Duration>,
    ) -> JobOutcome {
        let retry_after = retry_after.unwrap_or(self.deps.default_retry_after);
        let until_ms = self.deps.clock.now_ms() + retry_after.as_millis() as i64;

        if let Err(e) = self.deps.cooldown.set_until(until_ms, retry_after).await {
            warn!("Could not persist cooldown marker: {e}");
        }
        if let Err(e) = self.deps.queue.reschedule(job.id, until_ms).await {
            error!(job = job.id, "Could not reschedule rate-limited job: {e}");
        }
        info!(
            job = job.id,
            retry_after_secs = retry_after.as_secs(),
            "Rate limited, delivery paused"
        );
        JobOutcome::RateLimited { retry_after }
    }

    async fn push_past_cooldown(&self, job: &DeliveryJob, until_ms: i64) -> JobOutcome {
        if let Err(e) = self.deps.queue.reschedule(job.id, until_ms).await {
            error!(job = job.id, "Could not reschedule job to cooldown end: {e}");
        }
        debug!(job = job.id, until_ms, "Cooldown active, job rescheduled");
        JobOutcome::Rescheduled { until_ms }
    }

    /// A genuine delivery fault: the record reflects it immediately, and
    /// the queue's bounded retry decides whether the job runs again.
    async fn fail_attempt(&self, job: &DeliveryJob, detail: &str) -> JobOutcome {
        if let Err(e) = self.deps.records.mark_failed(job.record_id, detail).await {
            warn!(job = job.id, "Could not mark record failed: {e}");
        }

        let now_ms = self.deps.clock.now_ms();
        match self.deps.queue.record_failure(job.id, detail, now_ms).await {
            Ok((JobState::Failed, attempts)) => {
                warn!(job = job.id, attempts, "Job failed terminally: {detail}");
            }
            Ok((_, attempts)) => {
                debug!(job = job.id, attempts, "Job will be retried: {detail}");
            }
            Err(e) => error!(job = job.id, "Could not record job failure: {e}"),
        }
        JobOutcome::Failed {
            detail: detail.to_string(),
        }
    }
}

/// Spawn `count` workers onto the runtime.
pub fn spawn_workers(count: usize, deps: WorkerDeps) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| {
            let worker = DeliveryWorker::new(id, deps.clone());
            tokio::spawn(async move { worker.run().await })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::clock::ManualClock;
    use crate::queue::JobState;
    use crate::store::db::Storage;
    use crate::store::records::{MessageRecord, RecordStatus};
    use crate::worker::cooldown::InMemoryCooldown;

    const T0: i64 = 1_700_000_000_000;

    /// Transport that replays scripted outcomes, then succeeds.
    struct FakeTransport {
        outcomes: Mutex<VecDeque<Result<(), DeliveryError>>>,
        deliveries: Mutex<Vec<(String, String)>>,
    }

    impl FakeTransport {
        fn new(outcomes: Vec<Result<(), DeliveryError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                deliveries: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn deliver(&self, chat_id: &str, text: &str) -> Result<(), DeliveryError> {
            self.deliveries
                .lock()
                .await
                .push((chat_id.to_string(), text.to_string()));
            self.outcomes.lock().await.pop_front().unwrap_or(Ok(()))
        }
    }

    async fn make_deps(
        transport: Arc<FakeTransport>,
        clock: Arc<ManualClock>,
    ) -> WorkerDeps {
        let storage = Arc::new(Storage::open_memory().await.unwrap());
        WorkerDeps {
            queue: Arc::new(DeliveryQueue::new(
                storage.clone(),
                Duration::from_secs(2),
                3,
                Duration::from_secs(5),
            )),
            records: Arc::new(RecordStore::new(storage.clone())),
            destinations: Arc::new(DestinationStore::new(storage)),
            cooldown: Arc::new(InMemoryCooldown::new(clock.clone())),
            transport,
            clock,
            poll_interval: Duration::from_millis(10),
            default_retry_after: Duration::from_secs(30),
        }
    }

    async fn add_destination(deps: &WorkerDeps, bot_is_admin: bool) {
        deps.destinations
            .upsert("-100", Some("target"), bot_is_admin, deps.clock.now())
            .await
            .unwrap();
    }

    async fn submit(deps: &WorkerDeps, text: &str) -> DeliveryJob {
        let record = MessageRecord::new(
            text.to_string(),
            text.to_string(),
            "tester".to_string(),
            deps.clock.now(),
        );
        deps.records.insert(&record).await.unwrap();
        deps.queue
            .enqueue(record.id, text, deps.clock.now_ms())
            .await
            .unwrap()
    }

    /// Advance past the initial delay and claim the due job.
    async fn claim(deps: &WorkerDeps, clock: &ManualClock) -> DeliveryJob {
        clock.advance_ms(2_000);
        deps.queue
            .claim_due(deps.clock.now_ms())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn successful_delivery_is_terminal_for_job_and_record() {
        let clock = Arc::new(ManualClock::new(T0));
        let transport = FakeTransport::new(vec![]);
        let deps = make_deps(transport.clone(), clock.clone()).await;
        add_destination(&deps, true).await;
        let worker = DeliveryWorker::new(0, deps.clone());

        let job = submit(&deps, "hello world").await;
        let claimed = claim(&deps, &clock).await;
        assert_eq!(worker.process_job(&claimed).await, JobOutcome::Sent);

        let record = deps.records.get(job.record_id).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Sent);
        assert_eq!(record.sent_at, Some(deps.clock.now()));

        let stored = deps.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);

        let deliveries = transport.deliveries.lock().await;
        assert_eq!(deliveries.as_slice(), &[("-100".to_string(), "hello world".to_string())]);
    }

    #[tokio::test]
    async fn active_cooldown_reschedules_without_consuming_anything() {
        let clock = Arc::new(ManualClock::new(T0));
        let transport = FakeTransport::new(vec![]);
        let deps = make_deps(transport.clone(), clock.clone()).await;
        add_destination(&deps, true).await;
        let worker = DeliveryWorker::new(0, deps.clone());

        let job = submit(&deps, "held back").await;
        let claimed = claim(&deps, &clock).await;

        let until_ms = deps.clock.now_ms() + 20_000;
        deps.cooldown
            .set_until(until_ms, Duration::from_secs(20))
            .await
            .unwrap();

        assert_eq!(
            worker.process_job(&claimed).await,
            JobOutcome::Rescheduled { until_ms }
        );

        // Nothing ran: no delivery, record untouched, attempt intact.
        assert!(transport.deliveries.lock().await.is_empty());
        let record = deps.records.get(job.record_id).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Queued);
        let stored = deps.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);
        assert_eq!(stored.not_before_ms, until_ms);
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn rate_limit_signal_pauses_globally_without_failing_the_record() {
        let clock = Arc::new(ManualClock::new(T0));
        let transport = FakeTransport::new(vec![Err(DeliveryError::RateLimited {
            retry_after: Some(Duration::from_secs(10)),
        })]);
        let deps = make_deps(transport, clock.clone()).await;
        add_destination(&deps, true).await;
        let worker = DeliveryWorker::new(0, deps.clone());

        let job = submit(&deps, "throttled").await;
        let claimed = claim(&deps, &clock).await;
        let outcome = worker.process_job(&claimed).await;
        assert_eq!(
            outcome,
            JobOutcome::RateLimited {
                retry_after: Duration::from_secs(10)
            }
        );

        let until_ms = deps.clock.now_ms() + 10_000;
        assert_eq!(deps.cooldown.current().await.unwrap(), Some(until_ms));

        // The record saw processing but not failed; the attempt budget is
        // untouched and the job waits out the cooldown.
        let record = deps.records.get(job.record_id).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Processing);
        assert_eq!(record.error_detail, None);
        let stored = deps.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);
        assert_eq!(stored.not_before_ms, until_ms);
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn rate_limit_without_hint_uses_the_default() {
        let clock = Arc::new(ManualClock::new(T0));
        let transport =
            FakeTransport::new(vec![Err(DeliveryError::RateLimited { retry_after: None })]);
        let deps = make_deps(transport, clock.clone()).await;
        add_destination(&deps, true).await;
        let worker = DeliveryWorker::new(0, deps.clone());

        submit(&deps, "throttled").await;
        let claimed = claim(&deps, &clock).await;
        assert_eq!(
            worker.process_job(&claimed).await,
            JobOutcome::RateLimited {
                retry_after: Duration::from_secs(30)
            }
        );
        assert_eq!(
            deps.cooldown.current().await.unwrap(),
            Some(deps.clock.now_ms() + 30_000)
        );
    }

    #[tokio::test]
    async fn delivery_fault_fails_the_record_and_consumes_an_attempt() {
        let clock = Arc::new(ManualClock::new(T0));
        let transport = FakeTransport::new(vec![Err(DeliveryError::Http(
            "connection reset".to_string(),
        ))]);
        let deps = make_deps(transport, clock.clone()).await;
        add_destination(&deps, true).await;
        let worker = DeliveryWorker::new(0, deps.clone());

        let job = submit(&deps, "unlucky").await;
        let claimed = claim(&deps, &clock).await;
        let outcome = worker.process_job(&claimed).await;
        assert!(matches!(outcome, JobOutcome::Failed { .. }));

        let record = deps.records.get(job.record_id).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert!(
            record
                .error_detail
                .as_deref()
                .is_some_and(|d| d.contains("connection reset"))
        );

        let stored = deps.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.not_before_ms, deps.clock.now_ms() + 5_000);
    }

    #[tokio::test]
    async fn a_retry_can_still_succeed_after_a_fault() {
        let clock = Arc::new(ManualClock::new(T0));
        let transport = FakeTransport::new(vec![Err(DeliveryError::Http("blip".to_string()))]);
        let deps = make_deps(transport, clock.clone()).await;
        add_destination(&deps, true).await;
        let worker = DeliveryWorker::new(0, deps.clone());

        let job = submit(&deps, "second try").await;
        let claimed = claim(&deps, &clock).await;
        assert!(matches!(
            worker.process_job(&claimed).await,
            JobOutcome::Failed { .. }
        ));

        clock.advance_ms(5_000);
        let retried = deps
            .queue
            .claim_due(deps.clock.now_ms())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(worker.process_job(&retried).await, JobOutcome::Sent);

        // The ledger reflects the latest outcome.
        let record = deps.records.get(job.record_id).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Sent);
    }

    #[tokio::test]
    async fn missing_destination_is_a_delivery_fault() {
        let clock = Arc::new(ManualClock::new(T0));
        let transport = FakeTransport::new(vec![]);
        let deps = make_deps(transport.clone(), clock.clone()).await;
        let worker = DeliveryWorker::new(0, deps.clone());

        let job = submit(&deps, "nowhere to go").await;
        let claimed = claim(&deps, &clock).await;
        assert!(matches!(
            worker.process_job(&claimed).await,
            JobOutcome::Failed { .. }
        ));

        assert!(transport.deliveries.lock().await.is_empty());
        let record = deps.records.get(job.record_id).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
    }

    #[tokio::test]
    async fn destination_without_posting_rights_is_refused() {
        let clock = Arc::new(ManualClock::new(T0));
        let transport = FakeTransport::new(vec![]);
        let deps = make_deps(transport.clone(), clock.clone()).await;
        add_destination(&deps, false).await;
        let worker = DeliveryWorker::new(0, deps.clone());

        submit(&deps, "blocked").await;
        let claimed = claim(&deps, &clock).await;
        let outcome = worker.process_job(&claimed).await;
        match outcome {
            JobOutcome::Failed { detail } => assert!(detail.contains("not an admin")),
            other => panic!("expected a failure, got {other:?}"),
        }
        assert!(transport.deliveries.lock().await.is_empty());
    }
}
