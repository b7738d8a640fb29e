//! In-memory storage backend.
//!
//! Thread-safe in-memory implementation of `EntityStore`. It is intended
//! for embedded usage, tests, and as a reference implementation of the
//! find-or-create and versioning contract.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::Utc;

use crate::entity::{EntityId, FieldValues, StoredEntity};
use crate::filter::IdentityFilter;
use crate::storage::traits::{CreateOutcome, EntityStore, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
struct EntityState {
    by_id: HashMap<EntityId, StoredEntity>,
    by_schema: HashMap<String, Vec<EntityId>>,
    versions: HashMap<EntityId, BTreeMap<u64, StoredEntity>>,
}

impl EntityState {
    fn find(&self, schema: &str, filter: &IdentityFilter) -> Option<&StoredEntity> {
        if filter.is_empty() {
            return None;
        }
        self.by_schema
            .get(schema)?
            .iter()
            .filter_map(|id| self.by_id.get(id))
            .find(|e| filter.matches(e))
    }

    fn insert_new(&mut self, schema: &str, initial: FieldValues) -> Result<StoredEntity, StorageError> {
        let mut entity = StoredEntity::new(schema, initial);
        entity.version = 1;
        if self.by_id.contains_key(&entity.id) {
            return Err(StorageError::DuplicateKey(entity.id.to_string()));
        }
        self.record_version(&entity, "entity.create")?;
        self.by_schema
            .entry(schema.to_string())
            .or_default()
            .push(entity.id);
        self.by_id.insert(entity.id, entity.clone());
        Ok(entity)
    }

    fn record_version(&mut self, entity: &StoredEntity, context: &'static str) -> Result<(), StorageError> {
        let versions = self.versions.entry(entity.id).or_default();
        if versions.contains_key(&entity.version) {
            return Err(StorageError::BackendError(format!(
                "duplicate entity version ({context}): id={} version={}",
                entity.id, entity.version
            )));
        }
        versions.insert(entity.version, entity.clone());
        Ok(())
    }
}

/// Thread-safe in-memory entity store.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    state: RwLock<EntityState>,
}

impl InMemoryEntityStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entities of `schema`.
    pub fn count(&self, schema: &str) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.count"))?;
        Ok(state.by_schema.get(schema).map_or(0, Vec::len))
    }
}

impl EntityStore for InMemoryEntityStore {
    fn get(&self, id: EntityId) -> Result<Option<StoredEntity>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.get"))?;
        Ok(state.by_id.get(&id).cloned())
    }

    fn find_one(&self, schema: &str, filter: &IdentityFilter) -> Result<Option<StoredEntity>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.find_one"))?;
        Ok(state.find(schema, filter).cloned())
    }

    fn create(&self, schema: &str, initial: FieldValues) -> Result<StoredEntity, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("entity.create"))?;
        state.insert_new(schema, initial)
    }

    fn create_unique(
        &self,
        schema: &str,
        filter: &IdentityFilter,
        initial: FieldValues,
    ) -> Result<CreateOutcome, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("entity.create_unique"))?;
        if let Some(existing) = state.find(schema, filter) {
            return Ok(CreateOutcome::Existing(existing.clone()));
        }
        state.insert_new(schema, initial).map(CreateOutcome::Created)
    }

    fn save(&self, entity: &StoredEntity) -> Result<StoredEntity, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("entity.save"))?;
        let prev_version = state
            .by_id
            .get(&entity.id)
            .map(|e| e.version)
            .ok_or(StorageError::EntityNotFound(entity.id))?;

        if entity.version != prev_version {
            return Err(StorageError::VersionConflict {
                id: entity.id,
                expected: entity.version,
                found: prev_version,
            });
        }

        let mut stored = entity.clone();
        stored.version = prev_version + 1;
        stored.updated_at = Utc::now();
        state.record_version(&stored, "entity.save")?;
        state.by_id.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn list(&self, schema: &str) -> Result<Vec<StoredEntity>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.list"))?;
        Ok(state
            .by_schema
            .get(schema)
            .map(|ids| ids.iter().filter_map(|id| state.by_id.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    fn list_versions(&self, id: EntityId) -> Result<Vec<StoredEntity>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.list_versions"))?;
        Ok(state
            .versions
            .get(&id)
            .map(|v| v.values().cloned().collect())
            .unwrap_or_default())
    }
}
