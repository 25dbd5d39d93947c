use std::path::Path;
use std::sync::Arc;

use channel_relay::channels::{TelegramApi, TelegramBot, TelegramTransport, telegram};
use channel_relay::clock::{Clock, SystemClock};
use channel_relay::config::RelayConfig;
use channel_relay::filter::FilterRegistry;
use channel_relay::queue::DeliveryQueue;
use channel_relay::relay::{Relay, spawn_janitor};
use channel_relay::store::{DestinationStore, FilterStore, RecordStore, SettingsStore, Storage};
use channel_relay::worker::{InMemoryCooldown, WorkerDeps, spawn_workers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RelayConfig::from_env()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // ── Storage ─────────────────────────────────────────────────────
    let storage = Arc::new(Storage::open(Path::new(&config.db_path)).await?);
    let records = Arc::new(RecordStore::new(storage.clone()));
    let filters = Arc::new(FilterStore::new(storage.clone()));
    let settings = Arc::new(SettingsStore::new(storage.clone()));
    let destinations = Arc::new(DestinationStore::new(storage.clone()));
    let queue = Arc::new(DeliveryQueue::new(
        storage,
        config.submit_delay,
        config.max_attempts,
        config.retry_backoff,
    ));

    // ── Registry ────────────────────────────────────────────────────
    let registry = Arc::new(FilterRegistry::new(filters.clone(), settings.clone()));
    registry.reload().await?;

    // ── Relay facade ────────────────────────────────────────────────
    let relay = Arc::new(Relay::new(
        records.clone(),
        queue.clone(),
        registry,
        filters,
        settings,
        destinations.clone(),
        clock.clone(),
    ));

    // ── Transport and destination verification ──────────────────────
    let api = Arc::new(TelegramApi::new(config.bot_token.clone()));
    if let Some(chat_id) = config.destination_chat.as_deref() {
        telegram::verify_destination(&api, &relay, chat_id).await?;
    } else if relay.active_destination().await?.is_none() {
        tracing::warn!("No destination configured; submissions will be refused until one is set");
    }

    // ── Workers ─────────────────────────────────────────────────────
    let deps = WorkerDeps {
        queue,
        records,
        destinations,
        cooldown: Arc::new(InMemoryCooldown::new(clock.clone())),
        transport: Arc::new(TelegramTransport::new(api.clone())),
        clock,
        poll_interval: config.poll_interval,
        default_retry_after: config.default_retry_after,
    };
    let _worker_handles = spawn_workers(config.workers, deps);

    let _janitor_handle = spawn_janitor(
        relay.clone(),
        config.janitor_interval,
        config.retention_days,
    );

    // ── Inbound bot ─────────────────────────────────────────────────
    let bot = TelegramBot::new(api, relay, config.allowed_users.clone());
    bot.run().await;

    Ok(())
}
