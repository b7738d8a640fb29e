//! Scraped records.
//!
//! A `ScrapedRecord` is one unit of extracted data destined for a single
//! stored entity. Relation fields hold identifiers of other records; the
//! pipeline swaps them for entity handles once those records are merged.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provenance::SourceLocator;
use crate::value::Value;

/// External correlation key of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(v: &str) -> Self {
        Self::new(v)
    }
}

impl From<String> for Identifier {
    fn from(v: String) -> Self {
        Self(v)
    }
}

/// Raw extracted value(s) of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Many(Vec<Value>),
    One(Value),
}

impl RawValue {
    /// All values, in extraction order.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        match self {
            Self::One(v) => std::slice::from_ref(v),
            Self::Many(vs) => vs,
        }
    }

    /// First non-empty value.
    #[must_use]
    pub fn first(&self) -> Option<&Value> {
        self.values().iter().find(|v| !v.is_empty())
    }

    /// Returns true when no value is non-empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first().is_none()
    }

    /// Identifiers named by a relation field. Non-text values are ignored.
    #[must_use]
    pub fn identifiers(&self) -> Vec<Identifier> {
        self.values()
            .iter()
            .filter_map(Value::as_text)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Identifier::new)
            .collect()
    }
}

impl From<Value> for RawValue {
    fn from(v: Value) -> Self {
        Self::One(v)
    }
}

impl From<&str> for RawValue {
    fn from(v: &str) -> Self {
        Self::One(Value::from(v))
    }
}

impl From<Vec<Value>> for RawValue {
    fn from(v: Vec<Value>) -> Self {
        Self::Many(v)
    }
}

/// One unit of extracted data.
///
/// # Examples
///
/// ```
/// use scrapesync::ScrapedRecord;
///
/// let record = ScrapedRecord::new("venue", "http://example.com/venues/1")
///     .with_identifier("v1")
///     .with_field("name", "Joe's Bar")
///     .with_field("address", "a1");
/// assert_eq!(record.identifier.as_ref().map(|i| i.as_str()), Some("v1"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedRecord {
    /// Lets other records reference this one. Absent for leaf records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<Identifier>,

    /// Name of the target schema.
    pub schema: String,

    /// Extracted values; fields the extractor could not determine are omitted.
    #[serde(default)]
    pub fields: BTreeMap<String, RawValue>,

    /// Origin of the record.
    pub source: SourceLocator,

    /// When the record was extracted; stamped into provenance on write.
    #[serde(default = "Utc::now")]
    pub scraped_at: DateTime<Utc>,
}

impl ScrapedRecord {
    /// Creates an empty record for `schema`.
    #[must_use]
    pub fn new(schema: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            identifier: None,
            schema: schema.into(),
            fields: BTreeMap::new(),
            source: SourceLocator::new(source),
            scraped_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_identifier(mut self, identifier: impl Into<Identifier>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<RawValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Sets a multi-valued field from identifiers or text values.
    #[must_use]
    pub fn with_values<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.fields.insert(
            name.into(),
            RawValue::Many(values.into_iter().map(Into::into).collect()),
        );
        self
    }

    #[must_use]
    pub const fn with_scraped_at(mut self, at: DateTime<Utc>) -> Self {
        self.scraped_at = at;
        self
    }

    /// Raw value of `field`, if supplied and non-empty.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&RawValue> {
        self.fields.get(field).filter(|v| !v.is_empty())
    }

    /// Label used in logs.
    #[must_use]
    pub fn label(&self) -> String {
        match &self.identifier {
            Some(id) => format!("{}[{id}]", self.schema),
            None => format!("{}@{}", self.schema, self.source),
        }
    }
}
