//! Storage abstraction: contracts plus the in-memory reference backend.

pub mod memory;
pub mod traits;

pub use memory::{InMemoryOutcomeStore, InMemoryPatternStore, InMemoryPolicyStore};
pub use traits::{
    EventFilter, OutcomeStore, PatternStore, PolicyStore, StoreError, Versioned,
};
