//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Relay configuration.
///
/// The timing values mirror the queue defaults: every submission is
/// delayed 2s, a failing job is retried up to 3 times with a 5s backoff,
/// and a rate-limit signal without a hint pauses delivery for 30s.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Telegram bot token.
    pub bot_token: String,
    /// Chat id of the delivery destination. Optional; without it (or a
    /// destination row created at runtime) submissions are refused.
    pub destination_chat: Option<String>,
    /// Senders allowed to talk to the bot ("*" allows everyone).
    pub allowed_users: Vec<String>,
    /// Path of the local database file.
    pub db_path: String,
    /// Number of delivery workers.
    pub workers: usize,
    /// How often an idle worker polls the queue for due jobs.
    pub poll_interval: Duration,
    /// Initial delay applied to every enqueued job (burst smoothing).
    pub submit_delay: Duration,
    /// Delivery attempts per job before it fails terminally.
    pub max_attempts: u32,
    /// Backoff between delivery attempts of the same job.
    pub retry_backoff: Duration,
    /// Cooldown used when a rate-limit signal carries no retry-after hint.
    pub default_retry_after: Duration,
    /// Age in days after which sent/failed records are removed.
    pub retention_days: u32,
    /// How often the janitor sweep runs.
    pub janitor_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            destination_chat: None,
            allowed_users: vec!["*".to_string()],
            db_path: "./data/channel-relay.db".to_string(),
            workers: 2,
            poll_interval: Duration::from_millis(500),
            submit_delay: Duration::from_secs(2),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(5),
            default_retry_after: Duration::from_secs(30),
            retention_days: 7,
            janitor_interval: Duration::from_secs(3600), // 1 hour
        }
    }
}

impl RelayConfig {
    /// Build a config from the environment.
    ///
    /// `TELEGRAM_BOT_TOKEN` is required. Everything else falls back to the
    /// defaults above: `RELAY_DESTINATION_CHAT`, `TELEGRAM_ALLOWED_USERS`
    /// (comma-separated), `RELAY_DB_PATH`, `RELAY_WORKERS`,
    /// `RELAY_RETENTION_DAYS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".to_string()))?;

        config.destination_chat = std::env::var("RELAY_DESTINATION_CHAT").ok();

        if let Ok(users) = std::env::var("TELEGRAM_ALLOWED_USERS") {
            config.allowed_users = users
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(path) = std::env::var("RELAY_DB_PATH") {
            config.db_path = path;
        }

        if let Ok(raw) = std::env::var("RELAY_WORKERS") {
            config.workers = positive_usize("RELAY_WORKERS", &raw)?;
        }

        if let Ok(raw) = std::env::var("RELAY_RETENTION_DAYS") {
            config.retention_days = raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "RELAY_RETENTION_DAYS".to_string(),
                message: format!("expected a number of days, got {raw:?}"),
            })?;
        }

        Ok(config)
    }
}

/// Parse a strictly positive count. Zero is rejected: a relay with zero
/// workers would accept submissions that nothing ever delivers.
fn positive_usize(key: &str, raw: &str) -> Result<usize, ConfigError> {
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a positive integer, got {raw:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_must_be_positive() {
        assert_eq!(positive_usize("RELAY_WORKERS", "3").unwrap(), 3);

        for raw in ["0", "-1", "abc", ""] {
            let err = positive_usize("RELAY_WORKERS", raw).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "RELAY_WORKERS"),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn defaults_are_sane() {
        let config = RelayConfig::default();
        assert!(config.workers > 0);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.submit_delay.as_secs(), 2);
        assert_eq!(config.retry_backoff.as_secs(), 5);
        assert_eq!(config.default_retry_after.as_secs(), 30);
    }
}
