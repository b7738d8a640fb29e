//! Abstract storage traits for scrapesync.
//!
//! The core never owns durable storage. It needs a key-based find-or-create
//! and per-entity read/write, which backends provide through `EntityStore`.

use thiserror::Error;

use crate::entity::{EntityId, FieldValues, StoredEntity};
use crate::filter::IdentityFilter;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Entity not found.
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// The entity changed since it was read.
    #[error("Version conflict on {id}: expected {expected}, found {found}")]
    VersionConflict {
        /// Entity id.
        id: EntityId,
        /// Version the writer read.
        expected: u64,
        /// Version currently stored.
        found: u64,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Backend temporarily unreachable.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Result of an atomic find-or-create.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// No entity matched; this one was created.
    Created(StoredEntity),
    /// An entity matching the filter already existed (possibly created by a
    /// concurrent writer).
    Existing(StoredEntity),
}

impl CreateOutcome {
    #[must_use]
    pub fn into_parts(self) -> (StoredEntity, bool) {
        match self {
            Self::Created(e) => (e, true),
            Self::Existing(e) => (e, false),
        }
    }
}

/// Storage contract for reconciled entities.
///
/// # Concurrency
/// - `create_unique` must be atomic per identity filter: two racing callers
///   with the same filter get one `Created` and one `Existing`.
/// - `save` must reject a stale entity with `VersionConflict` rather than
///   overwrite a concurrent write.
pub trait EntityStore: Send + Sync {
    /// Get an entity by ID.
    fn get(&self, id: EntityId) -> Result<Option<StoredEntity>, StorageError>;

    /// Find the oldest entity of `schema` matching `filter`.
    fn find_one(&self, schema: &str, filter: &IdentityFilter) -> Result<Option<StoredEntity>, StorageError>;

    /// Create a new entity unconditionally.
    fn create(&self, schema: &str, initial: FieldValues) -> Result<StoredEntity, StorageError>;

    /// Atomically return the entity matching `filter`, or create one from
    /// `initial` if none matches.
    fn create_unique(
        &self,
        schema: &str,
        filter: &IdentityFilter,
        initial: FieldValues,
    ) -> Result<CreateOutcome, StorageError>;

    /// Write an entity back. Returns the stored copy with its new version.
    fn save(&self, entity: &StoredEntity) -> Result<StoredEntity, StorageError>;

    /// All entities of `schema`, oldest first.
    fn list(&self, schema: &str) -> Result<Vec<StoredEntity>, StorageError>;

    /// Every recorded version of an entity, ascending.
    fn list_versions(&self, id: EntityId) -> Result<Vec<StoredEntity>, StorageError>;
}
