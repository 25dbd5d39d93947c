//! Shared rate-limit cooldown marker.
//!
//! A single value for the whole relay: the epoch-ms instant before which
//! no delivery attempt may run, held together with a TTL. Last writer
//! wins; a stale overwrite only shortens the window, which self-heals on
//! the next rate-limit signal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::error::CooldownError;

/// Access to the shared cooldown marker.
///
/// Implementations return [`CooldownError`] only when the backing store
/// is unreachable. The worker treats that as "no cooldown" and proceeds,
/// so a control-plane outage cannot halt delivery.
#[async_trait]
pub trait CooldownGate: Send + Sync {
    /// The active marker, or None when unset or expired.
    async fn current(&self) -> Result<Option<i64>, CooldownError>;

    /// Set the marker to `until_ms`, valid for `ttl` from now.
    async fn set_until(&self, until_ms: i64, ttl: Duration) -> Result<(), CooldownError>;
}

#[derive(Debug, Clone, Copy)]
struct Marker {
    until_ms: i64,
    valid_until_ms: i64,
}

/// In-process gate. Value and TTL live behind one lock, so a reader
/// never observes a marker without its expiry.
pub struct InMemoryCooldown {
    clock: Arc<dyn Clock>,
    marker: RwLock<Option<Marker>>,
}

impl InMemoryCooldown {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            marker: RwLock::new(None),
        }
    }
}

#[async_trait]
impl CooldownGate for InMemoryCooldown {
    async fn current(&self) -> Result<Option<i64>, CooldownError> {
        let now_ms = self.clock.now_ms();
        let marker = self.marker.read().await;
        Ok(marker
            .filter(|m| m.valid_until_ms > now_ms)
            .map(|m| m.until_ms))
    }

    async fn set_until(&self, until_ms: i64, ttl: Duration) -> Result<(), CooldownError> {
        let valid_until_ms = self.clock.now_ms() + ttl.as_millis() as i64;
        let mut marker = self.marker.write().await;
        *marker = Some(Marker {
            until_ms,
            valid_until_ms,
        });
        Ok(())
    }
}
