//! channel-relay — filtered message delivery pipeline.

pub mod channels;
pub mod clock;
pub mod config;
pub mod error;
pub mod filter;
pub mod queue;
pub mod relay;
pub mod store;
pub mod worker;
