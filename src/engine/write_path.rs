//! Field-level merge policy.
//!
//! Applies resolved values to a stored entity:
//! - a field a reviewer locked is never touched;
//! - multi-valued relations are unioned and never shrink;
//! - files attach only while the field is empty;
//! - everything else is overwritten.
//!
//! Provenance of tracked fields is stamped on every modification and
//! backfilled when empty.

use chrono::{DateTime, Utc};

use crate::entity::{FieldValues, StoredEntity};
use crate::error::RecordError;
use crate::provenance::SourceLocator;
use crate::resolvers::FileStore;
use crate::schema::{FieldKind, RecordSchema};
use crate::value::Value;

/// What a field merge did to an entity.
#[derive(Debug, Default)]
pub(crate) struct FieldMerge {
    pub(crate) changed_fields: Vec<String>,
    pub(crate) skipped_locked: Vec<String>,
    pub(crate) provenance_touched: bool,
}

impl FieldMerge {
    pub(crate) fn is_dirty(&self) -> bool {
        !self.changed_fields.is_empty() || self.provenance_touched
    }
}

pub(crate) fn merge_fields(
    schema: &RecordSchema,
    entity: &mut StoredEntity,
    values: &FieldValues,
    source: &SourceLocator,
    at: DateTime<Utc>,
    files: &dyn FileStore,
) -> Result<FieldMerge, RecordError> {
    let mut out = FieldMerge::default();

    for spec in schema.fields() {
        let Some(incoming) = values.get(&spec.name).filter(|v| !v.is_empty()) else {
            continue;
        };
        let name = spec.name.as_str();
        let tracked = schema.tracks(name);
        let locked = tracked && entity.is_field_valid(name);

        let modified = match &spec.kind {
            FieldKind::RelationMulti { .. } => {
                if locked {
                    out.skipped_locked.push(name.to_string());
                    continue;
                }
                let (merged, added) = entity
                    .fields
                    .get(name)
                    .unwrap_or(&Value::Null)
                    .union_entities(&incoming.entity_ids());
                if added {
                    entity.set(name, merged);
                }
                added
            }
            FieldKind::File => {
                if entity.get(name).is_some() {
                    continue;
                }
                if locked {
                    out.skipped_locked.push(name.to_string());
                    continue;
                }
                let Some(candidate) = incoming.as_file() else {
                    return Err(RecordError::field(name, format!("expected a file, got {}", incoming.type_name())));
                };
                let stored = files.materialize(name, candidate)?;
                entity.set(name, Value::File(stored));
                true
            }
            _ => {
                if locked {
                    out.skipped_locked.push(name.to_string());
                    continue;
                }
                let modified = entity.get(name) != Some(incoming);
                if modified {
                    entity.set(name, incoming.clone());
                }
                modified
            }
        };

        if modified {
            out.changed_fields.push(name.to_string());
        }
        if tracked && entity.provenance_mut(name).record_write(modified, source, at) {
            out.provenance_touched = true;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    use crate::entity::EntityId;
    use crate::resolvers::InPlaceFileStore;
    use crate::schema::FieldSpec;
    use crate::value::FileRef;

    fn schema() -> RecordSchema {
        RecordSchema::builder("venue")
            .field(FieldSpec::text("name").required())
            .field(FieldSpec::integer("capacity"))
            .field(FieldSpec::relation_many("genres", "genre"))
            .field(FieldSpec::file("poster"))
            .untracked(["capacity"])
            .build()
            .unwrap()
    }

    fn values(pairs: &[(&str, Value)]) -> FieldValues {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2011, 3, 4, hour, 0, 0).unwrap()
    }

    #[test]
    fn overwrite_stamps_provenance() {
        let mut e = StoredEntity::new("venue", FieldValues::new());
        let src = SourceLocator::new("http://a");
        let out = merge_fields(&schema(), &mut e, &values(&[("name", Value::from("Joe's"))]), &src, at(1), &InPlaceFileStore).unwrap();
        assert_eq!(out.changed_fields, vec!["name".to_string()]);
        let p = e.provenance("name").unwrap();
        assert_eq!(p.source.as_ref(), Some(&src));
        assert_eq!(p.timestamp, Some(at(1)));
    }

    #[test]
    fn identical_value_backfills_only_empty_provenance() {
        let mut e = StoredEntity::new("venue", values(&[("name", Value::from("Joe's"))]));
        let first = SourceLocator::new("http://a");
        let out = merge_fields(&schema(), &mut e, &values(&[("name", Value::from("Joe's"))]), &first, at(1), &InPlaceFileStore).unwrap();
        assert!(out.changed_fields.is_empty());
        assert!(out.provenance_touched);

        let second = SourceLocator::new("http://b");
        let out = merge_fields(&schema(), &mut e, &values(&[("name", Value::from("Joe's"))]), &second, at(2), &InPlaceFileStore).unwrap();
        assert!(!out.is_dirty());
        assert_eq!(e.provenance("name").unwrap().source.as_ref(), Some(&first));
    }

    #[test]
    fn locked_field_is_skipped() {
        let mut e = StoredEntity::new("venue", values(&[("name", Value::from("Joe's Bar"))]));
        e.provenance_mut("name").valid = true;
        let out = merge_fields(&schema(), &mut e, &values(&[("name", Value::from("JOES"))]), &SourceLocator::new("http://a"), at(1), &InPlaceFileStore).unwrap();
        assert_eq!(out.skipped_locked, vec!["name".to_string()]);
        assert_eq!(e.get("name"), Some(&Value::from("Joe's Bar")));
        assert!(!out.is_dirty());
    }

    #[test]
    fn untracked_field_never_locks_or_stamps() {
        let mut e = StoredEntity::new("venue", FieldValues::new());
        merge_fields(&schema(), &mut e, &values(&[("capacity", Value::Int(80))]), &SourceLocator::new("http://a"), at(1), &InPlaceFileStore).unwrap();
        assert_eq!(e.get("capacity"), Some(&Value::Int(80)));
        assert!(e.provenance("capacity").is_none());
    }

    #[test]
    fn multi_relation_union_is_monotonic() {
        let (a, b, c) = (EntityId::new(), EntityId::new(), EntityId::new());
        let mut e = StoredEntity::new("venue", values(&[("genres", Value::Entities(vec![a, b]))]));

        let out = merge_fields(&schema(), &mut e, &values(&[("genres", Value::Entities(vec![c]))]), &SourceLocator::new("http://a"), at(1), &InPlaceFileStore).unwrap();
        assert_eq!(out.changed_fields, vec!["genres".to_string()]);
        assert_eq!(e.get("genres"), Some(&Value::Entities(vec![a, b, c])));

        let out = merge_fields(&schema(), &mut e, &values(&[("genres", Value::Entities(vec![a]))]), &SourceLocator::new("http://a"), at(1), &InPlaceFileStore).unwrap();
        assert!(out.changed_fields.is_empty());
        assert_eq!(e.get("genres"), Some(&Value::Entities(vec![a, b, c])));
    }

    #[test]
    fn locked_multi_relation_keeps_its_members() {
        let (a, b) = (EntityId::new(), EntityId::new());
        let mut e = StoredEntity::new("venue", values(&[("genres", Value::Entities(vec![a]))]));
        e.provenance_mut("genres").valid = true;
        let before = e.provenance("genres").cloned();

        let out = merge_fields(&schema(), &mut e, &values(&[("genres", Value::Entities(vec![b]))]), &SourceLocator::new("http://a"), at(1), &InPlaceFileStore).unwrap();
        assert_eq!(out.skipped_locked, vec!["genres".to_string()]);
        assert!(!out.is_dirty());
        assert_eq!(e.get("genres"), Some(&Value::Entities(vec![a])));
        assert_eq!(e.provenance("genres").cloned(), before);
    }

    #[test]
    fn file_attaches_only_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("poster.jpg");
        let second = dir.path().join("other.jpg");
        std::fs::write(&first, b"one").unwrap();
        std::fs::write(&second, b"two").unwrap();

        let mut e = StoredEntity::new("venue", FieldValues::new());
        let src = SourceLocator::new("http://a");
        merge_fields(&schema(), &mut e, &values(&[("poster", Value::File(FileRef::candidate(&first)))]), &src, at(1), &InPlaceFileStore).unwrap();
        let out = merge_fields(&schema(), &mut e, &values(&[("poster", Value::File(FileRef::candidate(&second)))]), &src, at(2), &InPlaceFileStore).unwrap();

        assert!(!out.is_dirty());
        let attached = e.get("poster").and_then(Value::as_file).unwrap();
        assert_eq!(attached.name, "poster.jpg");
        assert!(attached.is_materialized());
    }
}
