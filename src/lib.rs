//! # scrapesync - reconciliation engine for scraped records
//!
//! scrapesync ingests records produced by a crawler and reconciles them into
//! a persistent entity store. Records may reference other records that have
//! not been processed yet; those references are resolved out of order
//! without blocking the pipeline. Every scraped field keeps shadow
//! provenance (source, timestamp and a reviewer lock).
//!
//! ## Core Concepts
//!
//! - **RecordSchema**: typed fields, identity (unique fields and unique-together groups) and relations
//! - **ScrapedRecord**: one unit of extracted data, optionally carrying an external identifier
//! - **RelationResolver**: per identifier, a pending or resolved handle to the stored entity
//! - **MergeEngine**: find-or-create plus the provenance-aware field merge
//! - **Session**: worker pool driving records through suspend, merge and publish
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use scrapesync::{
//!     FieldSpec, InMemoryEntityStore, MergeEngine, PipelineConfig, RecordSchema,
//!     SchemaRegistry, ScrapedRecord, Session,
//! };
//!
//! let venue = RecordSchema::builder("venue")
//!     .field(FieldSpec::text("name").required().unique())
//!     .field(FieldSpec::relation("address", "address"))
//!     .build()?;
//! let address = RecordSchema::builder("address")
//!     .field(FieldSpec::text("street").required().unique())
//!     .build()?;
//!
//! let engine = MergeEngine::new(
//!     Arc::new(SchemaRegistry::new([venue, address])?),
//!     Arc::new(InMemoryEntityStore::new()),
//! );
//! let session = Session::new(engine, PipelineConfig::default())?;
//!
//! // The venue arrives first and waits for its address.
//! let v1 = session.submit(
//!     ScrapedRecord::new("venue", "http://example.com/v1")
//!         .with_identifier("v1")
//!         .with_field("name", "Joe's Bar")
//!         .with_field("address", "a1"),
//! )?;
//! session.submit(
//!     ScrapedRecord::new("address", "http://example.com/a1")
//!         .with_identifier("a1")
//!         .with_field("street", "1 Main St"),
//! )?;
//! assert!(v1.join()?.is_completed());
//! let report = session.finish();
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Record model
pub mod entity;
pub mod error;
pub mod filter;
pub mod processors;
pub mod provenance;
pub mod record;
pub mod resolvers;
pub mod schema;
pub mod value;

// Reconciliation
pub mod config;
pub mod engine;
pub mod pipeline;
pub mod relation;
pub mod review;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use config::{MergeConfig, PipelineConfig};
pub use engine::{MergeEngine, MergeOutcome};
pub use entity::{EntityHandle, EntityId, FieldValues, StoredEntity};
pub use error::{RecordError, RuntimeError, SchemaError, SyncError, SyncResult};
pub use filter::{IdentityFilter, Predicate};
pub use pipeline::{FailureEntry, RecordHandle, RecordOutcome, RecordState, Session, SessionReport};
pub use processors::{TextPipeline, TextStep};
pub use provenance::{ProvenanceState, SourceLocator};
pub use record::{Identifier, RawValue, ScrapedRecord};
pub use relation::{AwaitOutcome, RelationHandle, RelationResolver, Resolution, ResolutionFailure, ResolvedRelations};
pub use resolvers::{DefaultResolver, FieldResolver, FileStore, InPlaceFileStore, LocalFileStore, ResolverSet};
pub use review::{ProvenanceReport, ReviewRow};
pub use schema::{FieldKind, FieldSpec, RecordSchema, SchemaDef, SchemaRegistry};
pub use storage::{CreateOutcome, EntityStore, InMemoryEntityStore, StorageError};
pub use value::{FileRef, Value};
