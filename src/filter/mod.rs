//! Text filtering: rule model, transformation engine, cached registry.

pub mod engine;
pub mod model;
pub mod registry;

pub use engine::apply;
pub use model::{FilterAction, FilterRule, NewFilter, Settings};
pub use registry::FilterRegistry;
