//! Field value resolvers.
//!
//! Each non-relation field passes through a resolver before it can take
//! part in identity matching or merging. The default resolver coerces by
//! field kind; callers override single fields with their own collaborator
//! (a geocoder for an address field, say). File fields resolve to a
//! candidate `FileRef`; the bytes are only materialized through a
//! `FileStore` when the merge decides to attach them.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::RecordError;
use crate::processors::{self, TextPipeline};
use crate::record::RawValue;
use crate::schema::{DatePrecision, FieldKind, FieldSpec, ScalarType};
use crate::value::{file_name_of, FileRef, Value};

/// Turns a raw extracted value into a field value.
///
/// Returning `Ok(None)` means the raw value carried nothing usable (for
/// example only whitespace) and the field is treated as absent.
pub trait FieldResolver: Send + Sync {
    fn resolve(&self, field: &FieldSpec, raw: &RawValue) -> Result<Option<Value>, RecordError>;
}

impl<F> FieldResolver for F
where
    F: Fn(&FieldSpec, &RawValue) -> Result<Option<Value>, RecordError> + Send + Sync,
{
    fn resolve(&self, field: &FieldSpec, raw: &RawValue) -> Result<Option<Value>, RecordError> {
        self(field, raw)
    }
}

/// Kind-driven coercion used when no per-field resolver is configured.
#[derive(Debug, Clone)]
pub struct DefaultResolver {
    text: TextPipeline,
}

impl Default for DefaultResolver {
    fn default() -> Self {
        Self {
            text: TextPipeline::clean(),
        }
    }
}

impl DefaultResolver {
    /// Uses `text` instead of the default cleaning for text values.
    #[must_use]
    pub const fn with_text_pipeline(text: TextPipeline) -> Self {
        Self { text }
    }

    fn first_text(&self, raw: &RawValue) -> Option<String> {
        let texts = raw
            .values()
            .iter()
            .filter_map(Value::as_text)
            .map(str::to_string)
            .collect();
        processors::take_first(self.text.apply(texts))
    }

    fn resolve_scalar(&self, field: &FieldSpec, scalar: ScalarType, raw: &RawValue) -> Result<Option<Value>, RecordError> {
        let Some(first) = raw.first() else {
            return Ok(None);
        };
        let fail = |reason: String| RecordError::field(&field.name, reason);
        match (scalar, first) {
            (ScalarType::Text, Value::Text(_)) => Ok(self.first_text(raw).map(Value::Text)),
            (ScalarType::Integer, Value::Text(s)) => processors::to_int(s).map(|v| Some(Value::Int(v))).map_err(fail),
            (ScalarType::Float, Value::Text(s)) => processors::to_float(s).map(|v| Some(Value::Float(v))).map_err(fail),
            (ScalarType::Float, Value::Int(i)) => Ok(Some(Value::Float(*i as f64))),
            (ScalarType::Integer, Value::Int(_))
            | (ScalarType::Float, Value::Float(_))
            | (ScalarType::Text, Value::Structured(_)) => Ok(Some(first.clone())),
            (ScalarType::Text, other) => Ok(Some(Value::Text(other.to_string()))),
            (_, other) => Err(fail(format!("cannot coerce {} to {scalar:?}", other.type_name()))),
        }
    }

    fn resolve_date(field: &FieldSpec, precision: DatePrecision, raw: &RawValue) -> Result<Option<Value>, RecordError> {
        let Some(first) = raw.first() else {
            return Ok(None);
        };
        let fail = |reason: String| RecordError::field(&field.name, reason);
        let value = match (precision, first) {
            (DatePrecision::Date, Value::Text(s)) => Value::Date(processors::to_date(s).map_err(fail)?),
            (DatePrecision::DateTime, Value::Text(s)) => Value::DateTime(processors::to_date_time(s).map_err(fail)?),
            (DatePrecision::Date, Value::DateTime(dt)) => Value::Date(dt.date_naive()),
            (DatePrecision::DateTime, Value::Date(d)) => match d.and_hms_opt(0, 0, 0) {
                Some(naive) => Value::DateTime(naive.and_utc()),
                None => return Err(fail(format!("invalid date {d}"))),
            },
            (DatePrecision::Date, Value::Date(_)) | (DatePrecision::DateTime, Value::DateTime(_)) => first.clone(),
            (_, other) => return Err(fail(format!("cannot read a date from {}", other.type_name()))),
        };
        Ok(Some(value))
    }

    fn resolve_bool(field: &FieldSpec, raw: &RawValue) -> Result<Option<Value>, RecordError> {
        match raw.first() {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(Value::Bool(*b))),
            Some(Value::Text(s)) => Ok(Some(Value::Bool(processors::to_bool(s)))),
            Some(Value::Int(i)) => Ok(Some(Value::Bool(*i != 0))),
            Some(other) => Err(RecordError::field(
                &field.name,
                format!("cannot read a boolean from {}", other.type_name()),
            )),
        }
    }

    fn resolve_file(field: &FieldSpec, raw: &RawValue) -> Result<Option<Value>, RecordError> {
        match raw.first() {
            None => Ok(None),
            Some(Value::File(f)) => Ok(Some(Value::File(f.clone()))),
            Some(Value::Text(path)) => Ok(Some(Value::File(FileRef::candidate(path.trim())))),
            Some(other) => Err(RecordError::field(
                &field.name,
                format!("cannot read a file path from {}", other.type_name()),
            )),
        }
    }
}

impl FieldResolver for DefaultResolver {
    fn resolve(&self, field: &FieldSpec, raw: &RawValue) -> Result<Option<Value>, RecordError> {
        match &field.kind {
            FieldKind::Scalar { scalar } => self.resolve_scalar(field, *scalar, raw),
            FieldKind::Date { precision } => Self::resolve_date(field, *precision, raw),
            FieldKind::Boolean => Self::resolve_bool(field, raw),
            FieldKind::File => Self::resolve_file(field, raw),
            FieldKind::RelationSingle { .. } | FieldKind::RelationMulti { .. } => Err(RecordError::field(
                &field.name,
                "relation fields are resolved through the relation resolver",
            )),
        }
    }
}

/// Per-field resolver overrides on top of the default resolver.
#[derive(Clone, Default)]
pub struct ResolverSet {
    default: DefaultResolver,
    overrides: HashMap<(String, String), Arc<dyn FieldResolver>>,
}

impl std::fmt::Debug for ResolverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverSet")
            .field("default", &self.default)
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResolverSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the default resolver.
    #[must_use]
    pub fn with_default(mut self, default: DefaultResolver) -> Self {
        self.default = default;
        self
    }

    /// Routes `schema.field` through `resolver`.
    #[must_use]
    pub fn with_field(
        mut self,
        schema: impl Into<String>,
        field: impl Into<String>,
        resolver: Arc<dyn FieldResolver>,
    ) -> Self {
        self.overrides.insert((schema.into(), field.into()), resolver);
        self
    }

    /// Resolves one field of a record of `schema`.
    pub fn resolve(&self, schema: &str, field: &FieldSpec, raw: &RawValue) -> Result<Option<Value>, RecordError> {
        let resolved = match self.overrides.get(&(schema.to_string(), field.name.clone())) {
            Some(resolver) => resolver.resolve(field, raw)?,
            None => self.default.resolve(field, raw)?,
        };
        Ok(resolved.filter(|v| !v.is_empty()))
    }
}

/// Materializes downloaded files into storage.
pub trait FileStore: Send + Sync {
    /// Stores the candidate and returns its final reference.
    fn materialize(&self, field: &str, candidate: &FileRef) -> Result<FileRef, RecordError>;
}

fn read_and_digest(field: &str, candidate: &FileRef) -> Result<(Vec<u8>, String), RecordError> {
    let bytes = fs::read(&candidate.path).map_err(|e| {
        RecordError::field(field, format!("cannot read {}: {e}", candidate.path.display()))
    })?;
    let digest = blake3::hash(&bytes).to_hex().to_string();
    Ok((bytes, digest))
}

/// Leaves files where the download pipeline put them, only recording their
/// digest.
#[derive(Debug, Clone, Copy, Default)]
pub struct InPlaceFileStore;

impl FileStore for InPlaceFileStore {
    fn materialize(&self, field: &str, candidate: &FileRef) -> Result<FileRef, RecordError> {
        let (_, digest) = read_and_digest(field, candidate)?;
        Ok(FileRef {
            name: candidate.name.clone(),
            path: candidate.path.clone(),
            digest: Some(digest),
        })
    }
}

/// Copies files into a storage root directory.
///
/// A name clash with different content gets the digest prefixed to the file
/// name; identical content is reused.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileStore for LocalFileStore {
    fn materialize(&self, field: &str, candidate: &FileRef) -> Result<FileRef, RecordError> {
        let (bytes, digest) = read_and_digest(field, candidate)?;
        let io_err = |e: std::io::Error| RecordError::field(field, format!("cannot store file: {e}"));
        fs::create_dir_all(&self.root).map_err(io_err)?;

        let mut target = self.root.join(&candidate.name);
        if target.exists() {
            let existing = fs::read(&target).map_err(io_err)?;
            if blake3::hash(&existing).to_hex().as_str() != digest {
                target = self.root.join(format!("{}-{}", &digest[..12], candidate.name));
            }
        }
        if !target.exists() {
            fs::write(&target, &bytes).map_err(io_err)?;
        }

        Ok(FileRef {
            name: file_name_of(&target),
            path: target,
            digest: Some(digest),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::NaiveDate;

    fn raw(text: &str) -> RawValue {
        RawValue::from(text)
    }

    #[test]
    fn test_text_is_cleaned() {
        let r = DefaultResolver::default();
        let v = r.resolve(&FieldSpec::text("name"), &raw("  Joe&#39;s Bar ")).unwrap();
        assert_eq!(v, Some(Value::from("Joe's Bar")));
    }

    #[test]
    fn test_integer_failure_names_field() {
        let r = DefaultResolver::default();
        let err = r.resolve(&FieldSpec::integer("capacity"), &raw("lots")).unwrap_err();
        assert!(matches!(err, RecordError::FieldResolution { ref field, .. } if field == "capacity"));
    }

    #[test]
    fn test_float_from_int() {
        let r = DefaultResolver::default();
        let v = r.resolve(&FieldSpec::float("price"), &RawValue::from(Value::Int(5))).unwrap();
        assert_eq!(v, Some(Value::Float(5.0)));
    }

    #[test]
    fn test_date_and_bool() {
        let r = DefaultResolver::default();
        let v = r.resolve(&FieldSpec::date("opened"), &raw("2011-03-04")).unwrap();
        assert_eq!(v, Some(Value::Date(NaiveDate::from_ymd_opt(2011, 3, 4).unwrap())));
        let v = r.resolve(&FieldSpec::boolean("all_ages"), &raw("True")).unwrap();
        assert_eq!(v, Some(Value::Bool(true)));
    }

    #[test]
    fn test_blank_text_is_absent() {
        let set = ResolverSet::new();
        let v = set.resolve("venue", &FieldSpec::text("name"), &raw("   ")).unwrap();
        assert!(v.is_none());
    }

    #[test]
    fn test_override_is_used_for_its_field_only() {
        let geocoder: Arc<dyn FieldResolver> = Arc::new(|field: &FieldSpec, _raw: &RawValue| {
            Err(RecordError::field(&field.name, "geocoding failed"))
        });
        let set = ResolverSet::new().with_field("venue", "street", geocoder);

        let err = set.resolve("venue", &FieldSpec::text("street"), &raw("1 Main St")).unwrap_err();
        assert!(err.to_string().contains("geocoding failed"));

        assert!(set.resolve("other", &FieldSpec::text("street"), &raw("1 Main St")).is_ok());
    }

    #[test]
    fn test_file_candidate_and_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("poster.jpg");
        fs::write(&src, b"jpeg bytes").unwrap();

        let r = DefaultResolver::default();
        let v = r
            .resolve(&FieldSpec::file("poster"), &raw(src.to_str().unwrap()))
            .unwrap()
            .unwrap();
        let candidate = v.as_file().unwrap().clone();
        assert_eq!(candidate.name, "poster.jpg");

        let store = LocalFileStore::new(dir.path().join("media"));
        let stored = store.materialize("poster", &candidate).unwrap();
        assert!(stored.is_materialized());
        assert_eq!(fs::read(&stored.path).unwrap(), b"jpeg bytes");

        // Same name, different content: stored under a digest-prefixed name.
        fs::write(&src, b"other bytes").unwrap();
        let second = store.materialize("poster", &candidate).unwrap();
        assert_ne!(second.path, stored.path);
        assert!(second.name.ends_with("-poster.jpg"));
    }

    #[test]
    fn test_missing_file_fails() {
        let err = InPlaceFileStore
            .materialize("poster", &FileRef::candidate("/definitely/not/here.jpg"))
            .unwrap_err();
        assert!(matches!(err, RecordError::FieldResolution { ref field, .. } if field == "poster"));
    }
}
