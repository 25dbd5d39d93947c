//! Persistence layer: libSQL-backed stores for the message ledger,
//! filter rules, settings, and destinations.

pub mod db;
pub mod destinations;
pub mod filters;
pub mod migrations;
pub mod records;
pub mod settings;

pub use db::Storage;
pub use destinations::{Destination, DestinationStore};
pub use filters::FilterStore;
pub use records::{MessageRecord, RecordStatus, RecordStore};
pub use settings::SettingsStore;
