//! Outbound delivery transports and the inbound bot surface.

use async_trait::async_trait;

use crate::error::DeliveryError;

pub mod telegram;

pub use telegram::{TelegramApi, TelegramBot, TelegramTransport};

/// Something the relay can push text to.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `text` to `chat_id`.
    ///
    /// A throttle response surfaces as [`DeliveryError::RateLimited`] so
    /// the worker can pause globally; every other error is an ordinary
    /// delivery fault charged against the job's retry budget.
    async fn deliver(&self, chat_id: &str, text: &str) -> Result<(), DeliveryError>;
}
