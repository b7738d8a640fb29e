//! Stored entities and their identity.
//!
//! A `StoredEntity` is the persisted result of reconciling one or more
//! scraped records. The storage collaborator owns it; the core reads it by
//! key and writes it back through `EntityStore`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provenance::{ProvenanceMap, ProvenanceState};
use crate::value::Value;

/// Field name → value.
pub type FieldValues = BTreeMap<String, Value>;

/// Globally unique, stable entity identifier.
///
/// # Examples
///
/// ```
/// use scrapesync::EntityId;
///
/// let id = EntityId::new();
/// assert!(!id.is_nil());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Creates a new random entity ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an entity ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns true if this is a nil (all zeros) UUID.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EntityId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Lightweight reference to a stored entity, published to dependents once a
/// record has been merged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityHandle {
    /// Id of the stored entity.
    pub id: EntityId,
    /// Schema the entity belongs to.
    pub schema: String,
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.schema, self.id)
    }
}

/// A persisted, reconciled entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntity {
    pub id: EntityId,

    pub schema: String,

    #[serde(default)]
    pub fields: FieldValues,

    #[serde(default)]
    pub provenance: ProvenanceMap,

    /// Whole-entity review flag. A validated entity accepts records without
    /// applying any of their values.
    #[serde(default)]
    pub validated: bool,

    /// Incremented by the store on every save.
    pub version: u64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl StoredEntity {
    /// Creates a new, unsaved entity with the given initial values.
    #[must_use]
    pub fn new(schema: impl Into<String>, fields: FieldValues) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new(),
            schema: schema.into(),
            fields,
            provenance: ProvenanceMap::new(),
            validated: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the handle dependents receive.
    #[must_use]
    pub fn handle(&self) -> EntityHandle {
        EntityHandle {
            id: self.id,
            schema: self.schema.clone(),
        }
    }

    /// Current value of `field`, ignoring empty values.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).filter(|v| !v.is_empty())
    }

    /// Sets `field` to `value`.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    /// Provenance of `field`, if it has been tracked.
    #[must_use]
    pub fn provenance(&self, field: &str) -> Option<&ProvenanceState> {
        self.provenance.get(field)
    }

    /// Mutable provenance of `field`, created empty on first access.
    pub fn provenance_mut(&mut self, field: &str) -> &mut ProvenanceState {
        self.provenance.entry(field.to_string()).or_default()
    }

    /// Returns true if a reviewer locked `field`.
    #[must_use]
    pub fn is_field_valid(&self, field: &str) -> bool {
        self.provenance.get(field).is_some_and(|p| p.valid)
    }
}
