//! Repository layer - entity-scoped database operations.

mod patient;
mod prediction;

pub use patient::*;
pub use prediction::*;
