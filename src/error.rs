//! Error types for scrapesync.
//!
//! All errors are strongly typed using thiserror. Per-record failures
//! (`RecordError`) terminate a single record and are propagated to every
//! record awaiting its identifier; they never abort the pipeline.

use thiserror::Error;

use crate::record::Identifier;
use crate::storage::StorageError;

/// Errors raised while building a `RecordSchema`.
///
/// These are configuration defects detected at process start.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Schema name cannot be empty")]
    EmptySchemaName,

    #[error("Schema '{schema}' has no fields")]
    NoFields {
        schema: String,
    },

    #[error("Field name cannot be empty in schema '{schema}'")]
    EmptyFieldName {
        schema: String,
    },

    #[error("Field '{field}' is declared twice in schema '{schema}'")]
    DuplicateField {
        schema: String,
        field: String,
    },

    #[error("Shadow field '{shadow}' collides with a declared field in schema '{schema}'")]
    ShadowFieldCollision {
        schema: String,
        shadow: String,
    },

    #[error("Field '{field}' referenced by {context} does not exist in schema '{schema}'")]
    UnknownField {
        schema: String,
        field: String,
        context: &'static str,
    },

    #[error("Relation field '{field}' in schema '{schema}' has no target schema")]
    MissingRelationTarget {
        schema: String,
        field: String,
    },

    #[error("Relation field '{field}' in schema '{schema}' targets unknown schema '{target}'")]
    UnknownRelationTarget {
        schema: String,
        field: String,
        target: String,
    },

    #[error("Schema '{0}' is registered twice")]
    DuplicateSchema(String),

    #[error("Invalid schema definition: {reason}")]
    InvalidDefinition {
        reason: String,
    },
}

/// Per-record failures.
///
/// Each variant terminates processing of the offending record only. The
/// pipeline reports it to the record's caller and resolves the record's own
/// identifier with a failure marker.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Field '{field}' could not be resolved: {reason}")]
    FieldResolution {
        field: String,
        reason: String,
    },

    #[error("Required field '{field}' of schema '{schema}' has no value")]
    MissingRequiredField {
        schema: String,
        field: String,
    },

    #[error("Relation field '{field}' points at '{identifier}', which failed: {reason}")]
    InvalidRelation {
        field: String,
        identifier: Identifier,
        reason: String,
    },

    #[error("Identifier '{identifier}' transitively awaits itself via {}", format_chain(.chain))]
    CyclicDependency {
        identifier: Identifier,
        chain: Vec<Identifier>,
    },

    #[error("Identifier '{identifier}' was resolved twice")]
    DoubleResolution {
        identifier: Identifier,
    },

    #[error("Persisting the entity failed: {0}")]
    Persistence(#[from] StorageError),

    #[error("Record names field '{field}' which schema '{schema}' does not declare")]
    UnknownField {
        schema: String,
        field: String,
    },

    #[error("Record references unknown schema '{0}'")]
    UnknownSchema(String),

    #[error("Session was cancelled before the record completed")]
    Cancelled,

    #[error("Gave up waiting for identifier '{identifier}'")]
    TimedOut {
        identifier: Identifier,
    },
}

fn format_chain(chain: &[Identifier]) -> String {
    chain
        .iter()
        .map(Identifier::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl RecordError {
    /// Creates a field resolution error.
    #[must_use]
    pub fn field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FieldResolution {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this failure points at a programming or schema
    /// configuration defect rather than bad crawled data.
    #[must_use]
    pub const fn is_defect(&self) -> bool {
        matches!(
            self,
            Self::CyclicDependency { .. } | Self::DoubleResolution { .. }
        )
    }

    /// Short machine-friendly name of the failure kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::FieldResolution { .. } => "field_resolution",
            Self::MissingRequiredField { .. } => "missing_required_field",
            Self::InvalidRelation { .. } => "invalid_relation",
            Self::CyclicDependency { .. } => "cyclic_dependency",
            Self::DoubleResolution { .. } => "double_resolution",
            Self::Persistence(_) => "persistence",
            Self::UnknownField { .. } => "unknown_field",
            Self::UnknownSchema(_) => "unknown_schema",
            Self::Cancelled => "cancelled",
            Self::TimedOut { .. } => "timed_out",
        }
    }
}

/// Runtime errors for submitting work to a session.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Record queue is full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Session is closed")]
    Closed,

    #[error("Worker disconnected before replying")]
    Disconnected,

    #[error("Timed out after {duration_ms}ms waiting for the record outcome")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Top-level error type for scrapesync.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl SyncError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this wraps a per-record failure.
    #[must_use]
    pub const fn is_record_failure(&self) -> bool {
        matches!(self, Self::Record(_))
    }

    /// Returns true if this is a schema error.
    #[must_use]
    pub const fn is_schema(&self) -> bool {
        matches!(self, Self::Schema(_))
    }

    /// Returns true if this error indicates a defect that should be surfaced
    /// as a process-level diagnostic.
    #[must_use]
    pub const fn is_defect(&self) -> bool {
        match self {
            Self::Record(e) => e.is_defect(),
            Self::Schema(_) | Self::Internal { .. } => true,
            Self::Storage(_) | Self::Runtime(_) => false,
        }
    }
}

/// Result type alias for scrapesync operations.
pub type SyncResult<T> = Result<T, SyncError>;
