//! Field values held by records and stored entities.
//!
//! Values cover the field kinds a schema can declare: primitives, dates,
//! relation handles, attached files and structured JSON (for resolvers such
//! as a geocoder that produce composite values).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::EntityId;

/// A file attached to an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRef {
    /// Base file name, used for identity matching.
    pub name: String,
    /// Location of the file (download path before materialization, storage
    /// path after).
    pub path: PathBuf,
    /// Hex blake3 digest of the content, once materialized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl FileRef {
    /// Builds a reference to a not-yet-materialized file at `path`.
    #[must_use]
    pub fn candidate(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = file_name_of(&path);
        Self {
            name,
            path,
            digest: None,
        }
    }

    /// Returns true once the file has been copied into storage.
    #[must_use]
    pub const fn is_materialized(&self) -> bool {
        self.digest.is_some()
    }
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Possible values of a field.
///
/// # Examples
///
/// ```
/// use scrapesync::Value;
///
/// let name = Value::from("Joe's Bar");
/// assert!(name.is_text());
/// assert!(!name.is_empty());
/// assert!(Value::from("").is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    Entity(EntityId),
    Entities(Vec<EntityId>),
    File(FileRef),
    Structured(serde_json::Value),
    #[default]
    Null,
}

impl Value {
    /// Returns true for values the merge treats as "no value": null, empty
    /// text and empty relation sets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(s) => s.is_empty(),
            Self::Entities(ids) => ids.is_empty(),
            Self::Structured(v) => v.is_null(),
            _ => false,
        }
    }

    pub const fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub const fn as_entity(&self) -> Option<EntityId> {
        match self {
            Self::Entity(v) => Some(*v),
            _ => None,
        }
    }

    /// Entity ids referenced by this value (single or multi relation).
    #[must_use]
    pub fn entity_ids(&self) -> Vec<EntityId> {
        match self {
            Self::Entity(id) => vec![*id],
            Self::Entities(ids) => ids.clone(),
            _ => Vec::new(),
        }
    }

    pub const fn as_file(&self) -> Option<&FileRef> {
        match self {
            Self::File(f) => Some(f),
            _ => None,
        }
    }

    /// Union of two relation sets, keeping the order of `self` and appending
    /// unseen ids of `other`. Returns the merged value and whether anything
    /// was added.
    #[must_use]
    pub fn union_entities(&self, other: &[EntityId]) -> (Self, bool) {
        let mut merged = self.entity_ids();
        let mut seen: BTreeSet<EntityId> = merged.iter().copied().collect();
        let mut added = false;
        for id in other {
            if seen.insert(*id) {
                merged.push(*id);
                added = true;
            }
        }
        (Self::Entities(merged), added)
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Date(_) => "date",
            Self::DateTime(_) => "date_time",
            Self::Entity(_) => "entity",
            Self::Entities(_) => "entities",
            Self::File(_) => "file",
            Self::Structured(_) => "structured",
            Self::Null => "null",
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
            Self::Date(v) => write!(f, "{v}"),
            Self::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            Self::Entity(v) => write!(f, "entity:{v}"),
            Self::Entities(v) => write!(f, "entities[{}]", v.len()),
            Self::File(v) => write!(f, "file:{}", v.name),
            Self::Structured(v) => write!(f, "{v}"),
            Self::Null => write!(f, "null"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTime(v)
    }
}

impl From<EntityId> for Value {
    fn from(v: EntityId) -> Self {
        Self::Entity(v)
    }
}

impl From<FileRef> for Value {
    fn from(v: FileRef) -> Self {
        Self::File(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Structured(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_values() {
        assert!(Value::Null.is_empty());
        assert!(Value::from("").is_empty());
        assert!(Value::Entities(Vec::new()).is_empty());
        assert!(!Value::from(" ").is_empty());
        assert!(!Value::Bool(false).is_empty());
        assert!(!Value::Int(0).is_empty());
    }

    #[test]
    fn test_union_entities_keeps_existing_order() {
        let a = EntityId::new();
        let b = EntityId::new();
        let c = EntityId::new();
        let current = Value::Entities(vec![a, b]);

        let (merged, added) = current.union_entities(&[b, c]);
        assert!(added);
        assert_eq!(merged, Value::Entities(vec![a, b, c]));

        let (again, added) = merged.union_entities(&[a, c]);
        assert!(!added);
        assert_eq!(again, merged);
    }

    #[test]
    fn test_union_from_null() {
        let a = EntityId::new();
        let (merged, added) = Value::Null.union_entities(&[a, a]);
        assert!(added);
        assert_eq!(merged, Value::Entities(vec![a]));
    }

    #[test]
    fn test_file_candidate_name() {
        let f = FileRef::candidate("/tmp/downloads/full/abc123.jpg");
        assert_eq!(f.name, "abc123.jpg");
        assert!(!f.is_materialized());
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::from("hi").to_string(), "\"hi\"");
        assert_eq!(Value::Int(4).to_string(), "4");
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::Entities(vec![EntityId::new()]).to_string(), "entities[1]");
    }

    #[test]
    fn test_value_serialization() {
        let val = Value::Date(NaiveDate::from_ymd_opt(2011, 3, 4).unwrap());
        let json = serde_json::to_string(&val).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(val, back);
    }
}
