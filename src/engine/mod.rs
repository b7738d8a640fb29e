//! Merge/upsert engine.
//!
//! Given a record whose relations have all resolved, the engine normalizes
//! its values, finds or creates the matching stored entity, merges the
//! values under the provenance policy and persists the result. Publishing
//! the entity handle back to the relation resolver is left to the pipeline.

mod locks;
mod write_path;

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::config::MergeConfig;
use crate::entity::{EntityHandle, EntityId, FieldValues};
use crate::error::RecordError;
use crate::filter::IdentityFilter;
use crate::record::{Identifier, ScrapedRecord};
use crate::relation::{Resolution, ResolutionFailure, ResolvedRelations};
use crate::resolvers::{FileStore, InPlaceFileStore, ResolverSet};
use crate::schema::{FieldSpec, RecordSchema, SchemaRegistry};
use crate::storage::{EntityStore, StorageError};
use crate::value::Value;

use locks::StripedLocks;

/// Result of merging one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The entity the record was merged into.
    pub entity: EntityHandle,
    /// True if this record created the entity.
    pub created: bool,
    /// Fields whose value changed.
    pub changed_fields: Vec<String>,
    /// Fields left untouched because a reviewer validated them.
    pub skipped_locked: Vec<String>,
    /// True if the entity as a whole was validated and nothing was written.
    pub short_circuited: bool,
}

/// Reconciles resolved records into the entity store.
pub struct MergeEngine {
    schemas: Arc<SchemaRegistry>,
    store: Arc<dyn EntityStore>,
    resolvers: Arc<ResolverSet>,
    files: Arc<dyn FileStore>,
    config: MergeConfig,
    locks: StripedLocks,
}

impl std::fmt::Debug for MergeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeEngine")
            .field("schemas", &self.schemas.len())
            .field("resolvers", &self.resolvers)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MergeEngine {
    /// Creates an engine with default resolvers and in-place file storage.
    pub fn new(schemas: Arc<SchemaRegistry>, store: Arc<dyn EntityStore>) -> Self {
        let config = MergeConfig::default();
        Self {
            schemas,
            store,
            resolvers: Arc::new(ResolverSet::default()),
            files: Arc::new(InPlaceFileStore),
            locks: StripedLocks::new(config.lock_stripes),
            config,
        }
    }

    #[must_use]
    pub fn with_resolvers(mut self, resolvers: ResolverSet) -> Self {
        self.resolvers = Arc::new(resolvers);
        self
    }

    #[must_use]
    pub fn with_file_store(mut self, files: Arc<dyn FileStore>) -> Self {
        self.files = files;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: MergeConfig) -> Self {
        self.locks = StripedLocks::new(config.lock_stripes);
        self.config = config;
        self
    }

    #[must_use]
    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    #[must_use]
    pub fn entity_store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    fn schema_for(&self, record: &ScrapedRecord) -> Result<Arc<RecordSchema>, RecordError> {
        self.schemas
            .get(&record.schema)
            .cloned()
            .ok_or_else(|| RecordError::UnknownSchema(record.schema.clone()))
    }

    /// Identifiers referenced by the record's relation fields, in field
    /// order and without duplicates. Single relations contribute only their
    /// first identifier. Also rejects fields the schema lacks.
    pub fn relation_identifiers(&self, record: &ScrapedRecord) -> Result<Vec<Identifier>, RecordError> {
        let schema = self.schema_for(record)?;
        if let Some(unknown) = record.fields.keys().find(|name| schema.field(name).is_none()) {
            return Err(RecordError::UnknownField {
                schema: schema.name().to_string(),
                field: unknown.clone(),
            });
        }

        let mut ids = Vec::new();
        for spec in schema.relation_fields() {
            let mut referenced = record.get(&spec.name).map(|raw| raw.identifiers()).unwrap_or_default();
            // A single relation only ever uses its first identifier.
            if !spec.is_multi_valued() {
                referenced.truncate(1);
            }
            for id in referenced {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    /// Merges `record` using the resolutions of its relation identifiers.
    ///
    /// # Errors
    ///
    /// Any per-record failure: a field that cannot be resolved, a relation
    /// that resolved to a failure, a missing required field on creation, or
    /// a storage failure.
    pub fn merge(&self, record: &ScrapedRecord, relations: &ResolvedRelations) -> Result<MergeOutcome, RecordError> {
        let schema = self.schema_for(record)?;
        let values = self.normalize(&schema, record, relations)?;
        let filter = IdentityFilter::build(&schema, &values);

        let (id, created) = self.find_or_create(&schema, &filter, &values)?;

        let _guard = self.locks.lock(id);
        let mut entity = self.store.get(id)?.ok_or(StorageError::EntityNotFound(id))?;
        let handle = entity.handle();

        if self.config.honor_entity_validation && entity.validated {
            debug!(record = %record.label(), entity = %handle, "entity validated; record accepted without writes");
            return Ok(MergeOutcome {
                entity: handle,
                created,
                changed_fields: Vec::new(),
                skipped_locked: Vec::new(),
                short_circuited: true,
            });
        }

        let merge = write_path::merge_fields(
            &schema,
            &mut entity,
            &values,
            &record.source,
            record.scraped_at,
            self.files.as_ref(),
        )?;

        if merge.is_dirty() {
            self.store.save(&entity)?;
        }

        debug!(
            record = %record.label(),
            entity = %handle,
            created,
            changed = merge.changed_fields.len(),
            locked = merge.skipped_locked.len(),
            "record merged"
        );

        Ok(MergeOutcome {
            entity: handle,
            created,
            changed_fields: merge.changed_fields,
            skipped_locked: merge.skipped_locked,
            short_circuited: false,
        })
    }

    fn normalize(
        &self,
        schema: &RecordSchema,
        record: &ScrapedRecord,
        relations: &ResolvedRelations,
    ) -> Result<FieldValues, RecordError> {
        let mut values = FieldValues::new();
        for spec in schema.fields() {
            let Some(raw) = record.get(&spec.name) else {
                continue;
            };
            let value = if spec.is_relation() {
                let ids = substitute_relations(spec, &raw.identifiers(), relations)?;
                match ids.first().copied() {
                    None => None,
                    Some(first) if !spec.is_multi_valued() => Some(Value::Entity(first)),
                    Some(_) => Some(Value::Entities(ids)),
                }
            } else {
                self.resolvers.resolve(schema.name(), spec, raw)?
            };
            if let Some(value) = value {
                values.insert(spec.name.clone(), value);
            }
        }
        Ok(values)
    }

    fn find_or_create(
        &self,
        schema: &RecordSchema,
        filter: &IdentityFilter,
        values: &FieldValues,
    ) -> Result<(EntityId, bool), RecordError> {
        if !filter.is_empty() {
            if let Some(existing) = self.store.find_one(schema.name(), filter)? {
                return Ok((existing.id, false));
            }
        }

        if let Some(missing) = schema
            .fields()
            .iter()
            .find(|f| f.required && !values.contains_key(&f.name))
        {
            return Err(RecordError::MissingRequiredField {
                schema: schema.name().to_string(),
                field: missing.name.clone(),
            });
        }

        let initial = initial_values(schema, filter, values);
        if filter.is_empty() {
            let entity = self.store.create(schema.name(), initial)?;
            return Ok((entity.id, true));
        }

        let (entity, created) = self.store.create_unique(schema.name(), filter, initial)?.into_parts();
        if !created {
            debug!(schema = schema.name(), entity = %entity.id, "lost creation race; merging as update");
        }
        Ok((entity.id, created))
    }
}

/// Swaps relation identifiers for entity ids. A failed resolution fails the
/// record; cancellation and expiry keep their own error kinds.
fn substitute_relations(
    spec: &FieldSpec,
    ids: &[Identifier],
    relations: &ResolvedRelations,
) -> Result<Vec<EntityId>, RecordError> {
    let mut out: Vec<EntityId> = Vec::with_capacity(ids.len());
    let mut seen = BTreeSet::new();
    for id in ids {
        let entity = match relations.get(id) {
            Some(Resolution::Entity(handle)) => handle.id,
            Some(Resolution::Failed(ResolutionFailure::Cancelled)) => return Err(RecordError::Cancelled),
            Some(Resolution::Failed(ResolutionFailure::TimedOut)) => {
                return Err(RecordError::TimedOut { identifier: id.clone() });
            }
            Some(Resolution::Failed(ResolutionFailure::RecordFailed { reason })) => {
                return Err(RecordError::InvalidRelation {
                    field: spec.name.clone(),
                    identifier: id.clone(),
                    reason: reason.clone(),
                });
            }
            None => {
                return Err(RecordError::InvalidRelation {
                    field: spec.name.clone(),
                    identifier: id.clone(),
                    reason: "identifier was never resolved".to_string(),
                });
            }
        };
        if seen.insert(entity) {
            out.push(entity);
        }
        if !spec.is_multi_valued() {
            break;
        }
    }
    Ok(out)
}

/// Values a new entity is created with: everything the identity filter pins
/// plus the required fields. Files are attached later by the field merge.
fn initial_values(schema: &RecordSchema, filter: &IdentityFilter, values: &FieldValues) -> FieldValues {
    let mut initial: FieldValues = filter
        .pinned_values()
        .map(|(field, value)| (field.to_string(), value))
        .collect();
    for spec in schema.fields().iter().filter(|f| f.required && !f.kind.is_file()) {
        if let Some(value) = values.get(&spec.name) {
            initial.insert(spec.name.clone(), value.clone());
        }
    }
    initial
}
