//! Identity filters.
//!
//! An `IdentityFilter` is the predicate the merge uses to find the stored
//! entity a record describes. It is built from the record's resolved values
//! and the schema's unique fields and unique-together groups.

use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, FieldValues, StoredEntity};
use crate::schema::{FieldKind, FieldSpec, RecordSchema};
use crate::value::Value;

/// One conjunct of an identity filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// Field equals the value.
    Equals { field: String, value: Value },
    /// Field has no value. Used for absent optional identity fields.
    IsEmpty { field: String },
    /// Multi-valued relation contains every listed entity.
    ContainsAll { field: String, ids: Vec<EntityId> },
    /// Attached file name contains `name`.
    FileNamed { field: String, name: String },
}

impl Predicate {
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::Equals { field, .. }
            | Self::IsEmpty { field }
            | Self::ContainsAll { field, .. }
            | Self::FileNamed { field, .. } => field,
        }
    }

    /// Evaluates the predicate against a stored entity.
    #[must_use]
    pub fn matches(&self, entity: &StoredEntity) -> bool {
        match self {
            Self::Equals { field, value } => entity.get(field) == Some(value),
            Self::IsEmpty { field } => entity.get(field).is_none(),
            Self::ContainsAll { field, ids } => {
                let current = entity.get(field).map(Value::entity_ids).unwrap_or_default();
                ids.iter().all(|id| current.contains(id))
            }
            Self::FileNamed { field, name } => entity
                .get(field)
                .and_then(Value::as_file)
                .is_some_and(|f| f.name.contains(name.as_str())),
        }
    }

    fn for_value(spec: &FieldSpec, value: &Value) -> Self {
        let field = spec.name.clone();
        match (&spec.kind, value) {
            (FieldKind::RelationMulti { .. }, _) => Self::ContainsAll {
                field,
                ids: value.entity_ids(),
            },
            (FieldKind::File, Value::File(f)) => Self::FileNamed {
                field,
                name: f.name.clone(),
            },
            _ => Self::Equals {
                field,
                value: value.clone(),
            },
        }
    }

    const fn is_sentinel(&self) -> bool {
        matches!(self, Self::IsEmpty { .. })
    }
}

/// Conjunction of predicates identifying one stored entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityFilter {
    predicates: Vec<Predicate>,
}

impl IdentityFilter {
    /// Builds the filter for `values` under `schema`.
    ///
    /// Unique fields contribute a predicate when they have a value, or an
    /// is-empty sentinel when they are optional and absent. A unique-together
    /// group contributes only when every member has a value. A filter made of
    /// sentinels alone cannot identify anything and is returned empty.
    #[must_use]
    pub fn build(schema: &RecordSchema, values: &FieldValues) -> Self {
        let mut filter = Self::default();
        let present = |name: &str| values.get(name).filter(|v| !v.is_empty());

        for spec in schema.fields().iter().filter(|f| f.unique) {
            match present(spec.name.as_str()) {
                Some(value) => filter.push(Predicate::for_value(spec, value)),
                None if !spec.required => filter.push(Predicate::IsEmpty {
                    field: spec.name.clone(),
                }),
                None => {}
            }
        }

        for group in schema.unique_together() {
            let members: Option<Vec<Predicate>> = group
                .iter()
                .map(|name| {
                    let spec = schema.field(name)?;
                    present(name.as_str()).map(|value| Predicate::for_value(spec, value))
                })
                .collect();
            for predicate in members.unwrap_or_default() {
                filter.push(predicate);
            }
        }

        if filter.predicates.iter().all(Predicate::is_sentinel) {
            return Self::default();
        }
        filter
    }

    fn push(&mut self, predicate: Predicate) {
        if !self.predicates.contains(&predicate) {
            self.predicates.push(predicate);
        }
    }

    /// Returns true if the filter cannot identify an entity.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    #[must_use]
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Values the filter pins by equality; a newly created entity must carry
    /// them so concurrent lookups see it.
    pub fn pinned_values(&self) -> impl Iterator<Item = (&str, Value)> {
        self.predicates.iter().filter_map(|p| match p {
            Predicate::Equals { field, value } => Some((field.as_str(), value.clone())),
            Predicate::ContainsAll { field, ids } => Some((field.as_str(), Value::Entities(ids.clone()))),
            Predicate::IsEmpty { .. } | Predicate::FileNamed { .. } => None,
        })
    }

    /// Evaluates every predicate against `entity`.
    #[must_use]
    pub fn matches(&self, entity: &StoredEntity) -> bool {
        !self.is_empty() && self.predicates.iter().all(|p| p.matches(entity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::value::FileRef;

    fn schema() -> RecordSchema {
        RecordSchema::builder("venue")
            .field(FieldSpec::text("name").required())
            .field(FieldSpec::text("website").unique())
            .field(FieldSpec::text("city"))
            .field(FieldSpec::relation_many("genres", "genre"))
            .unique_together(["name", "city"])
            .build()
            .unwrap()
    }

    fn values(pairs: &[(&str, Value)]) -> FieldValues {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn test_unique_field_equality() {
        let f = IdentityFilter::build(&schema(), &values(&[("website", Value::from("joes.com"))]));
        assert_eq!(
            f.predicates(),
            &[Predicate::Equals {
                field: "website".to_string(),
                value: Value::from("joes.com")
            }]
        );
    }

    #[test]
    fn test_sentinel_only_filter_is_empty() {
        let f = IdentityFilter::build(&schema(), &values(&[("name", Value::from("Joe's"))]));
        assert!(f.is_empty());
    }

    #[test]
    fn test_group_with_absent_member_is_dropped() {
        let f = IdentityFilter::build(
            &schema(),
            &values(&[("name", Value::from("Joe's")), ("city", Value::from(""))]),
        );
        assert!(f.is_empty());

        let f = IdentityFilter::build(
            &schema(),
            &values(&[("name", Value::from("Joe's")), ("city", Value::from("Austin"))]),
        );
        assert_eq!(f.predicates().len(), 3);
        assert!(f.predicates().contains(&Predicate::IsEmpty {
            field: "website".to_string()
        }));
    }

    #[test]
    fn test_matches_entity() {
        let s = schema();
        let f = IdentityFilter::build(
            &s,
            &values(&[("name", Value::from("Joe's")), ("city", Value::from("Austin"))]),
        );
        let mut e = StoredEntity::new("venue", values(&[("name", Value::from("Joe's")), ("city", Value::from("Austin"))]));
        assert!(f.matches(&e));
        e.set("website", Value::from("joes.com"));
        assert!(!f.matches(&e));
    }

    #[test]
    fn test_contains_all_and_file_name() {
        let a = EntityId::new();
        let b = EntityId::new();
        let mut e = StoredEntity::new("venue", FieldValues::new());
        e.set("genres", Value::Entities(vec![a, b]));
        e.set("poster", Value::File(FileRef::candidate("/media/0123abcd-poster.jpg")));

        assert!(Predicate::ContainsAll { field: "genres".into(), ids: vec![b] }.matches(&e));
        assert!(!Predicate::ContainsAll { field: "genres".into(), ids: vec![EntityId::new()] }.matches(&e));
        assert!(Predicate::FileNamed { field: "poster".into(), name: "poster.jpg".into() }.matches(&e));
    }

    #[test]
    fn test_pinned_values() {
        let f = IdentityFilter::build(&schema(), &values(&[("website", Value::from("joes.com"))]));
        let pinned: Vec<_> = f.pinned_values().collect();
        assert_eq!(pinned, vec![("website", Value::from("joes.com"))]);
    }
}
