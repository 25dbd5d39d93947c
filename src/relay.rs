//! The relay facade: submission path, stats/query surface, admin
//! mutations and the cleanup janitor.
//!
//! Every mutation of filters or settings is followed by an explicit
//! registry reload here; the registry itself never refreshes on its own.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::Result;
use crate::filter::{self, FilterRegistry, FilterRule, NewFilter, Settings};
use crate::queue::{DeliveryQueue, QueueStats};
use crate::store::{
    Destination, DestinationStore, FilterStore, MessageRecord, RecordStore, SettingsStore,
};

pub struct Relay {
    records: Arc<RecordStore>,
    queue: Arc<DeliveryQueue>,
    registry: Arc<FilterRegistry>,
    filters: Arc<FilterStore>,
    settings: Arc<SettingsStore>,
    destinations: Arc<DestinationStore>,
    clock: Arc<dyn Clock>,
}

impl Relay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        records: Arc<RecordStore>,
        queue: Arc<DeliveryQueue>,
        registry: Arc<FilterRegistry>,
        filters: Arc<FilterStore>,
        settings: Arc<SettingsStore>,
        destinations: Arc<DestinationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            records,
            queue,
            registry,
            filters,
            settings,
            destinations,
            clock,
        }
    }

    // ── Submission path ─────────────────────────────────────────────

    /// Filter, persist, enqueue — in that order. The record exists
    /// before the job does; if enqueueing then fails, the queued record
    /// stays behind as a visible degraded state.
    pub async fn submit(&self, original: &str, submitter_id: &str) -> Result<MessageRecord> {
        let settings = self.registry.settings().await.unwrap_or_default();
        let rules = self.registry.active_filters().await;
        let processed = filter::apply(original, &settings, &rules);

        let record = MessageRecord::new(
            original.to_string(),
            processed.clone(),
            submitter_id.to_string(),
            self.clock.now(),
        );
        self.records.insert(&record).await?;

        let job = self
            .queue
            .enqueue(record.id, &processed, self.clock.now_ms())
            .await?;
        debug!(record_id = %record.id, job_id = job.id, "Message submitted");
        Ok(record)
    }

    // ── Stats / query surface ───────────────────────────────────────

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(self.queue.stats(self.clock.now_ms()).await?)
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<MessageRecord>> {
        Ok(self.records.list_recent(limit).await?)
    }

    /// Delete sent/failed records older than `days`, and prune terminal
    /// job rows from the same window. Returns the record count only.
    pub async fn cleanup(&self, days: u32) -> Result<u64> {
        let cutoff = self.clock.now() - ChronoDuration::days(days as i64);
        let deleted = self.records.delete_terminal_before(cutoff).await?;
        let pruned_jobs = self
            .queue
            .prune_terminal_before(cutoff.timestamp_millis())
            .await?;
        info!(deleted, pruned_jobs, "Cleanup sweep finished");
        Ok(deleted)
    }

    // ── Filter administration ───────────────────────────────────────

    pub async fn create_filter(&self, new: &NewFilter) -> Result<FilterRule> {
        new.validate()?;
        let rule = self.filters.create(new, self.clock.now()).await?;
        self.registry.reload().await?;
        info!(filter_id = %rule.id, name = %rule.name, "Filter created");
        Ok(rule)
    }

    pub async fn update_filter(&self, id: Uuid, new: &NewFilter) -> Result<FilterRule> {
        new.validate()?;
        let rule = self.filters.update(id, new).await?;
        self.registry.reload().await?;
        Ok(rule)
    }

    pub async fn delete_filter(&self, id: Uuid) -> Result<()> {
        self.filters.delete(id).await?;
        self.registry.reload().await?;
        Ok(())
    }

    pub async fn set_filter_active(&self, id: Uuid, active: bool) -> Result<()> {
        self.filters.set_active(id, active).await?;
        self.registry.reload().await?;
        Ok(())
    }

    pub async fn list_filters(&self) -> Result<Vec<FilterRule>> {
        Ok(self.filters.list_all().await?)
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<()> {
        self.settings.upsert(settings, self.clock.now()).await?;
        self.registry.reload().await?;
        Ok(())
    }

    // ── Destination administration ──────────────────────────────────

    pub async fn set_destination(
        &self,
        chat_id: &str,
        title: Option<&str>,
        bot_is_admin: bool,
    ) -> Result<Destination> {
        Ok(self
            .destinations
            .upsert(chat_id, title, bot_is_admin, self.clock.now())
            .await?)
    }

    pub async fn active_destination(&self) -> Result<Option<Destination>> {
        Ok(self.destinations.active().await?)
    }

    /// Administrative stop: no destination, empty registry. Queued jobs
    /// remain in the store but deliveries will fail the eligibility gate.
    pub async fn stop(&self) -> Result<()> {
        self.destinations.deactivate_all().await?;
        self.registry.clear().await;
        info!("Relay stopped: destination deactivated, registry cleared");
        Ok(())
    }

    pub async fn reload(&self) -> Result<()> {
        Ok(self.registry.reload().await?)
    }
}

/// Periodic cleanup sweep over old terminal records and jobs.
pub fn spawn_janitor(
    relay: Arc<Relay>,
    interval: Duration,
    retention_days: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            match relay.cleanup(retention_days).await {
                Ok(deleted) => debug!(deleted, "Janitor sweep done"),
                Err(e) => error!("Janitor sweep failed: {e}"),
            }
        }
    })
}
