//! Persistent delivery queue: job model and the scheduling store.

pub mod job;
pub mod queue;

pub use job::{DeliveryJob, JobState, QueueStats};
pub use queue::DeliveryQueue;
