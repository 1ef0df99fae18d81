pub mod extractor;
pub mod memory;
pub mod transaction;
pub mod types;

#[cfg(test)]
mod extractor_tests;

pub use extractor::ChangeEventExtractor;
pub use memory::MemoryGraph;
pub use transaction::{EntityId, GraphSnapshot, Mutation, NodeState, RelationshipState, Transaction};
pub use types::*;
