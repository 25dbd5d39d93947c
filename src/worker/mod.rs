//! Delivery workers and the shared rate-limit cooldown.
//!
//! Core components:
//! - `cooldown` — the single marker all workers consult before delivering
//! - `worker` — the poll/claim/deliver loop and its outcome handling

pub mod cooldown;
pub mod worker;

pub use cooldown::{CooldownGate, InMemoryCooldown};
pub use worker::{DeliveryWorker, JobOutcome, WorkerDeps, spawn_workers};
