//! Error types for channel-relay.

use std::time::Duration;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Cooldown error: {0}")]
    Cooldown(#[from] CooldownError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Storage-related errors. Covers the record ledger, the job queue table
/// and the filter/settings/destination catalogs.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },
}

/// Filter definition validation errors. These reject a rule at creation
/// time; a rule that passes validation can still degrade to a no-op at
/// apply time if its pattern fails to compile.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("Filter name must not be empty")]
    EmptyName,

    #[error("Filter pattern must not be empty")]
    EmptyPattern,

    #[error("Action {action} requires a non-empty replacement")]
    MissingReplacement { action: String },

    #[error("Unknown filter action: {0}")]
    UnknownAction(String),
}

/// Delivery transport errors.
///
/// `RateLimited` is special-cased by the worker: it pauses all delivery
/// globally instead of failing the record or consuming a retry attempt.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Destination rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("No active destination configured")]
    NoDestination,

    #[error("Bot is not an administrator of destination {chat_id}")]
    NotAdmin { chat_id: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Destination API error: {0}")]
    Api(String),
}

/// Cooldown gate errors. The worker treats these as "no cooldown in
/// effect" (fail open) so a control-plane outage does not halt delivery.
#[derive(Debug, thiserror::Error)]
pub enum CooldownError {
    #[error("Cooldown store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
