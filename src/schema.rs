//! Record schemas.
//!
//! A `RecordSchema` describes one target entity type: its ordered fields,
//! which of them identify an entity, which are relations, and which carry
//! shadow provenance fields. Schemas are validated and frozen at start-up;
//! the shadow field specs are derived once in `SchemaBuilder::build`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::provenance::shadow_names;

/// Coercion target of a scalar field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    #[default]
    Text,
    Integer,
    Float,
}

/// Precision of a date field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatePrecision {
    #[default]
    Date,
    DateTime,
}

/// Kind of a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    Scalar {
        #[serde(default)]
        scalar: ScalarType,
    },
    Date {
        #[serde(default)]
        precision: DatePrecision,
    },
    Boolean,
    File,
    RelationSingle {
        target: String,
    },
    RelationMulti {
        target: String,
    },
}

impl FieldKind {
    /// Schema name a relation field points at.
    #[must_use]
    pub fn relation_target(&self) -> Option<&str> {
        match self {
            Self::RelationSingle { target } | Self::RelationMulti { target } => Some(target),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_relation(&self) -> bool {
        matches!(self, Self::RelationSingle { .. } | Self::RelationMulti { .. })
    }

    #[must_use]
    pub const fn is_multi_valued(&self) -> bool {
        matches!(self, Self::RelationMulti { .. })
    }

    #[must_use]
    pub const fn is_file(&self) -> bool {
        matches!(self, Self::File)
    }
}

/// Description of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,

    #[serde(flatten)]
    pub kind: FieldKind,

    /// The field must hold a value before an entity can be created.
    #[serde(default)]
    pub required: bool,

    /// The field alone identifies an entity.
    #[serde(default)]
    pub unique: bool,
}

impl FieldSpec {
    /// Creates a field of the given kind.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            unique: false,
        }
    }

    /// A text scalar field.
    #[must_use]
    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Scalar { scalar: ScalarType::Text })
    }

    /// An integer scalar field.
    #[must_use]
    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Scalar { scalar: ScalarType::Integer })
    }

    /// A float scalar field.
    #[must_use]
    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Scalar { scalar: ScalarType::Float })
    }

    /// A calendar date field.
    #[must_use]
    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Date { precision: DatePrecision::Date })
    }

    /// A date-and-time field.
    #[must_use]
    pub fn date_time(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Date { precision: DatePrecision::DateTime })
    }

    /// A boolean field.
    #[must_use]
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    /// A file attachment field.
    #[must_use]
    pub fn file(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::File)
    }

    /// A single-valued relation to `target`.
    #[must_use]
    pub fn relation(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, FieldKind::RelationSingle { target: target.into() })
    }

    /// A multi-valued relation to `target`.
    #[must_use]
    pub fn relation_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, FieldKind::RelationMulti { target: target.into() })
    }

    /// Marks the field as required.
    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Marks the field as identifying.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    #[must_use]
    pub const fn is_relation(&self) -> bool {
        self.kind.is_relation()
    }

    #[must_use]
    pub const fn is_multi_valued(&self) -> bool {
        self.kind.is_multi_valued()
    }
}

/// Role of a derived shadow field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadowRole {
    Valid,
    Source,
    Timestamp,
}

/// A shadow provenance field derived from a tracked field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowFieldSpec {
    /// Persisted name, e.g. `name_valid`.
    pub name: String,
    /// The tracked field.
    pub field: String,
    pub role: ShadowRole,
}

/// Which fields get shadow provenance fields.
///
/// An empty `include` list means every field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceScope {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl ProvenanceScope {
    fn tracks(&self, field: &str) -> bool {
        !(self.exclude.iter().any(|f| f == field)
            || (!self.include.is_empty() && !self.include.iter().any(|f| f == field)))
    }
}

/// Serializable schema definition, turned into a `RecordSchema` by `build`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDef {
    pub name: String,
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub unique_together: Vec<Vec<String>>,
    #[serde(default)]
    pub provenance: ProvenanceScope,
}

impl SchemaDef {
    /// Validates the definition and derives the shadow fields.
    pub fn build(self) -> Result<RecordSchema, SchemaError> {
        let mut builder = RecordSchema::builder(self.name);
        for field in self.fields {
            builder = builder.field(field);
        }
        for group in self.unique_together {
            builder = builder.unique_together(group);
        }
        builder.provenance = self.provenance;
        builder.build()
    }
}

/// Builder for `RecordSchema`.
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    name: String,
    fields: Vec<FieldSpec>,
    unique_together: Vec<Vec<String>>,
    provenance: ProvenanceScope,
}

impl SchemaBuilder {
    /// Appends a field.
    #[must_use]
    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    /// Adds a group of fields that jointly identify an entity.
    #[must_use]
    pub fn unique_together<I, S>(mut self, group: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_together.push(group.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts provenance tracking to the named fields.
    #[must_use]
    pub fn track_only<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.provenance.include = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Excludes the named fields from provenance tracking.
    #[must_use]
    pub fn untracked<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.provenance.exclude = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Validates the schema and derives its shadow provenance fields.
    pub fn build(self) -> Result<RecordSchema, SchemaError> {
        let schema = self.name.trim().to_string();
        if schema.is_empty() {
            return Err(SchemaError::EmptySchemaName);
        }
        if self.fields.is_empty() {
            return Err(SchemaError::NoFields { schema });
        }

        let mut declared = BTreeSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(SchemaError::EmptyFieldName { schema });
            }
            if !declared.insert(field.name.clone()) {
                return Err(SchemaError::DuplicateField {
                    schema,
                    field: field.name.clone(),
                });
            }
            if let Some(target) = field.kind.relation_target() {
                if target.trim().is_empty() {
                    return Err(SchemaError::MissingRelationTarget {
                        schema,
                        field: field.name.clone(),
                    });
                }
            }
        }

        let check_known = |names: &[String], context: &'static str| {
            names.iter().find(|n| !declared.contains(*n)).map(|n| SchemaError::UnknownField {
                schema: schema.clone(),
                field: n.clone(),
                context,
            })
        };
        for group in &self.unique_together {
            if let Some(err) = check_known(group, "unique_together") {
                return Err(err);
            }
        }
        if let Some(err) = check_known(&self.provenance.include, "provenance include") {
            return Err(err);
        }
        if let Some(err) = check_known(&self.provenance.exclude, "provenance exclude") {
            return Err(err);
        }

        let mut tracked = Vec::new();
        let mut shadow_fields = Vec::new();
        for field in &self.fields {
            if !self.provenance.tracks(&field.name) {
                continue;
            }
            let roles = [ShadowRole::Valid, ShadowRole::Source, ShadowRole::Timestamp];
            for (name, role) in shadow_names(&field.name).into_iter().zip(roles) {
                if declared.contains(&name) {
                    return Err(SchemaError::ShadowFieldCollision { schema, shadow: name });
                }
                shadow_fields.push(ShadowFieldSpec {
                    name,
                    field: field.name.clone(),
                    role,
                });
            }
            tracked.push(field.name.clone());
        }

        let index = self
            .fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();

        Ok(RecordSchema {
            name: schema,
            fields: self.fields,
            index,
            unique_together: self.unique_together,
            tracked,
            shadow_fields,
        })
    }
}

/// Immutable description of one target entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    name: String,
    fields: Vec<FieldSpec>,
    index: HashMap<String, usize>,
    unique_together: Vec<Vec<String>>,
    tracked: Vec<String>,
    shadow_fields: Vec<ShadowFieldSpec>,
}

impl RecordSchema {
    /// Starts building a schema.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            fields: Vec::new(),
            unique_together: Vec::new(),
            provenance: ProvenanceScope::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    pub fn relation_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.is_relation())
    }

    #[must_use]
    pub fn unique_together(&self) -> &[Vec<String>] {
        &self.unique_together
    }

    /// Returns true if `field` carries shadow provenance fields.
    #[must_use]
    pub fn tracks(&self, field: &str) -> bool {
        self.tracked.iter().any(|f| f == field)
    }

    /// Fields that carry provenance, in declaration order.
    #[must_use]
    pub fn tracked_fields(&self) -> &[String] {
        &self.tracked
    }

    /// Derived shadow fields, three per tracked field.
    #[must_use]
    pub fn shadow_fields(&self) -> &[ShadowFieldSpec] {
        &self.shadow_fields
    }
}

/// All schemas of a processing session.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<RecordSchema>>,
}

impl SchemaRegistry {
    /// Registers every schema and checks that relation targets exist.
    pub fn new(schemas: impl IntoIterator<Item = RecordSchema>) -> Result<Self, SchemaError> {
        let mut map = HashMap::new();
        for schema in schemas {
            let name = schema.name().to_string();
            if map.insert(name.clone(), Arc::new(schema)).is_some() {
                return Err(SchemaError::DuplicateSchema(name));
            }
        }

        for schema in map.values() {
            for field in schema.relation_fields() {
                let Some(target) = field.kind.relation_target() else {
                    continue;
                };
                if !map.contains_key(target) {
                    return Err(SchemaError::UnknownRelationTarget {
                        schema: schema.name().to_string(),
                        field: field.name.clone(),
                        target: target.to_string(),
                    });
                }
            }
        }

        Ok(Self { schemas: map })
    }

    /// Parses a JSON array of schema definitions.
    pub fn from_json_str(json: &str) -> Result<Self, SchemaError> {
        let defs: Vec<SchemaDef> = serde_json::from_str(json).map_err(|e| {
            SchemaError::InvalidDefinition {
                reason: e.to_string(),
            }
        })?;
        let schemas = defs
            .into_iter()
            .map(SchemaDef::build)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(schemas)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<RecordSchema>> {
        self.schemas.get(name)
    }

    /// Names of the registered schemas, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn venue() -> SchemaBuilder {
        RecordSchema::builder("venue")
            .field(FieldSpec::text("name").required())
            .field(FieldSpec::text("website").unique())
            .field(FieldSpec::relation("address", "address"))
    }

    #[test]
    fn test_build_derives_shadow_fields_in_order() {
        let schema = venue().build().unwrap();
        let names: Vec<_> = schema.shadow_fields().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "name_valid",
                "name_source",
                "name_timestamp",
                "website_valid",
                "website_source",
                "website_timestamp",
                "address_valid",
                "address_source",
                "address_timestamp",
            ]
        );
        assert_eq!(schema.shadow_fields()[1].role, ShadowRole::Source);
    }

    #[test]
    fn test_exclude_and_include() {
        let schema = venue().untracked(["website"]).build().unwrap();
        assert!(schema.tracks("name"));
        assert!(!schema.tracks("website"));
        assert_eq!(schema.shadow_fields().len(), 6);

        let schema = venue().track_only(["address"]).build().unwrap();
        assert_eq!(schema.tracked_fields(), &["address".to_string()]);
        assert_eq!(schema.shadow_fields().len(), 3);
    }

    #[test]
    fn test_shadow_collision_rejected() {
        let err = RecordSchema::builder("venue")
            .field(FieldSpec::text("name"))
            .field(FieldSpec::boolean("name_valid"))
            .untracked(["name_valid"])
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::ShadowFieldCollision { shadow, .. } if shadow == "name_valid"));
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let err = RecordSchema::builder("venue")
            .field(FieldSpec::text("name"))
            .field(FieldSpec::integer("name"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateField { .. }));
    }

    #[test]
    fn test_unknown_unique_together_field() {
        let err = venue().unique_together(["name", "city"]).build().unwrap_err();
        assert!(matches!(
            err,
            SchemaError::UnknownField { field, context: "unique_together", .. } if field == "city"
        ));
    }

    #[test]
    fn test_empty_schema_rejected() {
        assert!(matches!(
            RecordSchema::builder(" ").build().unwrap_err(),
            SchemaError::EmptySchemaName
        ));
        assert!(matches!(
            RecordSchema::builder("x").build().unwrap_err(),
            SchemaError::NoFields { .. }
        ));
    }

    #[test]
    fn test_registry_checks_relation_targets() {
        let err = SchemaRegistry::new([venue().build().unwrap()]).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownRelationTarget { target, .. } if target == "address"));

        let address = RecordSchema::builder("address")
            .field(FieldSpec::text("city"))
            .build()
            .unwrap();
        let registry = SchemaRegistry::new([venue().build().unwrap(), address]).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get("venue").is_some());
    }

    #[test]
    fn test_registry_from_json() {
        let json = r#"[
            {"name": "address", "fields": [{"name": "city", "kind": "scalar", "required": true}]},
            {"name": "venue",
             "fields": [
                {"name": "name", "kind": "scalar", "unique": true},
                {"name": "opened", "kind": "date", "precision": "date"},
                {"name": "address", "kind": "relation_single", "target": "address"}
             ],
             "provenance": {"exclude": ["opened"]}}
        ]"#;
        let registry = SchemaRegistry::from_json_str(json).unwrap();
        let venue = registry.get("venue").unwrap();
        assert!(venue.field("address").unwrap().is_relation());
        assert!(!venue.tracks("opened"));
        assert!(venue.field("name").unwrap().unique);
    }
}
