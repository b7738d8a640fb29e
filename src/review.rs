//! Review surface.
//!
//! Reviewers see every field of an entity next to its provenance, flattened
//! to the persisted shadow-field names, and lock values they have checked.
//! The merge engine only ever reads the locks written here.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::entity::{EntityHandle, EntityId, StoredEntity};
use crate::error::{SchemaError, SyncError, SyncResult};
use crate::provenance::SourceLocator;
use crate::schema::{RecordSchema, SchemaRegistry, ShadowRole};
use crate::storage::{EntityStore, StorageError};
use crate::value::Value;

const SAVE_ATTEMPTS: usize = 3;

/// One field as shown to a reviewer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewRow {
    pub field: String,
    pub value: Option<Value>,
    pub valid: bool,
    pub source: Option<SourceLocator>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Provenance of one entity, in schema field order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvenanceReport {
    pub entity: EntityHandle,
    pub validated: bool,
    pub rows: Vec<ReviewRow>,
    #[serde(skip)]
    shadow: Map<String, JsonValue>,
}

impl ProvenanceReport {
    /// Builds the report for `entity`. Only fields with provenance appear.
    #[must_use]
    pub fn build(schema: &RecordSchema, entity: &StoredEntity) -> Self {
        let rows: Vec<ReviewRow> = schema
            .tracked_fields()
            .iter()
            .map(|field| {
                let state = entity.provenance(field).cloned().unwrap_or_default();
                ReviewRow {
                    field: field.clone(),
                    value: entity.get(field).cloned(),
                    valid: state.valid,
                    source: state.source,
                    timestamp: state.timestamp,
                }
            })
            .collect();

        let mut shadow = Map::new();
        for spec in schema.shadow_fields() {
            let Some(row) = rows.iter().find(|r| r.field == spec.field) else {
                continue;
            };
            let value = match spec.role {
                ShadowRole::Valid => JsonValue::Bool(row.valid),
                ShadowRole::Source => row
                    .source
                    .as_ref()
                    .map_or(JsonValue::Null, |s| JsonValue::String(s.to_string())),
                ShadowRole::Timestamp => row
                    .timestamp
                    .map_or(JsonValue::Null, |t| JsonValue::String(t.to_rfc3339())),
            };
            shadow.insert(spec.name.clone(), value);
        }

        Self {
            entity: entity.handle(),
            validated: entity.validated,
            rows,
            shadow,
        }
    }

    /// Provenance under the shadow-field naming contract, e.g.
    /// `name_valid`, `name_source`, `name_timestamp`.
    #[must_use]
    pub const fn shadow_fields(&self) -> &Map<String, JsonValue> {
        &self.shadow
    }

    #[must_use]
    pub fn row(&self, field: &str) -> Option<&ReviewRow> {
        self.rows.iter().find(|r| r.field == field)
    }
}

/// Loads an entity and builds its provenance report.
pub fn load_report(store: &dyn EntityStore, schemas: &SchemaRegistry, id: EntityId) -> SyncResult<ProvenanceReport> {
    let entity = store.get(id)?.ok_or(StorageError::EntityNotFound(id))?;
    let schema = schemas
        .get(&entity.schema)
        .ok_or_else(|| SyncError::internal(format!("entity {id} has unregistered schema '{}'", entity.schema)))?;
    Ok(ProvenanceReport::build(schema, &entity))
}

/// Read-modify-save with a bounded retry on concurrent writes.
fn update_entity<F>(store: &dyn EntityStore, id: EntityId, mut edit: F) -> SyncResult<StoredEntity>
where
    F: FnMut(&mut StoredEntity),
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut entity = store.get(id)?.ok_or(StorageError::EntityNotFound(id))?;
        edit(&mut entity);
        match store.save(&entity) {
            Ok(saved) => return Ok(saved),
            Err(StorageError::VersionConflict { .. }) if attempt < SAVE_ATTEMPTS => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// Locks (or unlocks) one field of an entity against merge overwrites.
///
/// # Errors
///
/// `SchemaError::UnknownField` if `field` carries no provenance in `schema`.
pub fn mark_field_valid(
    store: &dyn EntityStore,
    schema: &RecordSchema,
    id: EntityId,
    field: &str,
    valid: bool,
) -> SyncResult<StoredEntity> {
    if !schema.tracks(field) {
        return Err(SchemaError::UnknownField {
            schema: schema.name().to_string(),
            field: field.to_string(),
            context: "review",
        }
        .into());
    }
    update_entity(store, id, |entity| entity.provenance_mut(field).valid = valid)
}

/// Sets the whole-entity validation flag.
pub fn mark_entity_validated(store: &dyn EntityStore, id: EntityId, validated: bool) -> SyncResult<StoredEntity> {
    update_entity(store, id, |entity| entity.validated = validated)
}
