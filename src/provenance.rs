//! Per-field provenance.
//!
//! Every scraped attribute of a stored entity carries a shadow
//! `ProvenanceState`: whether a reviewer validated the value, where the
//! value came from and when it was written. The persisted naming contract is
//! `<field>_valid`, `<field>_source` and `<field>_timestamp`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Suffix of the shadow validity flag.
pub const VALID_SUFFIX: &str = "_valid";
/// Suffix of the shadow source locator.
pub const SOURCE_SUFFIX: &str = "_source";
/// Suffix of the shadow write timestamp.
pub const TIMESTAMP_SUFFIX: &str = "_timestamp";

/// Where a record was extracted from (usually the origin URL).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceLocator(String);

impl SourceLocator {
    /// Creates a locator.
    #[must_use]
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    /// Returns the locator text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceLocator {
    fn from(v: &str) -> Self {
        Self::new(v)
    }
}

/// Shadow provenance of one field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceState {
    /// Set by a reviewer; once true the merge never overwrites the field.
    #[serde(default)]
    pub valid: bool,
    /// Locator of the record that last wrote the value.
    #[serde(default)]
    pub source: Option<SourceLocator>,
    /// When the value was last written.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ProvenanceState {
    /// A provenance state already marked as validated.
    #[must_use]
    pub fn validated() -> Self {
        Self {
            valid: true,
            ..Self::default()
        }
    }

    /// Records a write. When `modified` is false, only empty source or
    /// timestamp slots are backfilled. Returns true if anything changed.
    pub fn record_write(
        &mut self,
        modified: bool,
        source: &SourceLocator,
        at: DateTime<Utc>,
    ) -> bool {
        let mut changed = false;
        if (modified || self.source.is_none()) && self.source.as_ref() != Some(source) {
            self.source = Some(source.clone());
            changed = true;
        }
        if (modified || self.timestamp.is_none()) && self.timestamp != Some(at) {
            self.timestamp = Some(at);
            changed = true;
        }
        changed
    }
}

/// Provenance of every tracked field of an entity, keyed by field name.
pub type ProvenanceMap = BTreeMap<String, ProvenanceState>;

/// Names of the three shadow fields derived from `field`.
#[must_use]
pub fn shadow_names(field: &str) -> [String; 3] {
    [
        format!("{field}{VALID_SUFFIX}"),
        format!("{field}{SOURCE_SUFFIX}"),
        format!("{field}{TIMESTAMP_SUFFIX}"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Duration;

    #[test]
    fn test_shadow_names() {
        let [valid, source, ts] = shadow_names("name");
        assert_eq!(valid, "name_valid");
        assert_eq!(source, "name_source");
        assert_eq!(ts, "name_timestamp");
    }

    #[test]
    fn test_record_write_modified_overwrites() {
        let t0 = Utc::now();
        let mut p = ProvenanceState {
            valid: false,
            source: Some(SourceLocator::new("http://a")),
            timestamp: Some(t0),
        };
        let t1 = t0 + Duration::seconds(5);
        assert!(p.record_write(true, &SourceLocator::new("http://b"), t1));
        assert_eq!(p.source.as_ref().map(SourceLocator::as_str), Some("http://b"));
        assert_eq!(p.timestamp, Some(t1));
    }

    #[test]
    fn test_record_write_unmodified_only_backfills() {
        let t0 = Utc::now();
        let mut p = ProvenanceState {
            valid: false,
            source: Some(SourceLocator::new("http://a")),
            timestamp: None,
        };
        let t1 = t0 + Duration::seconds(5);
        assert!(p.record_write(false, &SourceLocator::new("http://b"), t1));
        assert_eq!(p.source.as_ref().map(SourceLocator::as_str), Some("http://a"));
        assert_eq!(p.timestamp, Some(t1));

        // Both slots filled: nothing to backfill.
        assert!(!p.record_write(false, &SourceLocator::new("http://c"), t0));
    }

    #[test]
    fn test_validated_default() {
        let p = ProvenanceState::validated();
        assert!(p.valid);
        assert!(p.source.is_none());
    }
}
