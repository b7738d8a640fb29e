//! Storage collaborator for reconciled entities.
//!
//! The merge engine talks to storage only through `EntityStore`. The
//! in-memory backend serves embedded use and tests.

mod memory;
mod traits;

pub use memory::InMemoryEntityStore;
pub use traits::{CreateOutcome, EntityStore, StorageError};
