use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use scrapesync::{
    CreateOutcome, EntityId, EntityStore, FieldValues, IdentityFilter, InMemoryEntityStore, MergeEngine,
    PipelineConfig, RecordError, RuntimeError, SchemaRegistry, ScrapedRecord, Session, StorageError,
    StoredEntity, Value,
};

const WAIT: Duration = Duration::from_secs(5);

const SCHEMAS: &str = r#"[
  {
    "name": "person",
    "fields": [
      {"name": "name", "kind": "scalar", "scalar": "text", "required": true, "unique": true},
      {"name": "friend", "kind": "relation_single", "target": "person"}
    ]
  },
  {
    "name": "venue",
    "fields": [
      {"name": "name", "kind": "scalar", "required": true},
      {"name": "city", "kind": "scalar"},
      {"name": "opened", "kind": "date", "precision": "date"},
      {"name": "address", "kind": "relation_single", "target": "address"}
    ],
    "unique_together": [["name", "city"]]
  },
  {
    "name": "address",
    "fields": [
      {"name": "street", "kind": "scalar", "required": true, "unique": true}
    ]
  }
]"#;

fn registry() -> Arc<SchemaRegistry> {
    Arc::new(SchemaRegistry::from_json_str(SCHEMAS).unwrap())
}

fn session_over(store: Arc<dyn EntityStore>, workers: usize) -> Session {
    let engine = MergeEngine::new(registry(), store);
    Session::new(
        engine,
        PipelineConfig {
            workers,
            ..PipelineConfig::default()
        },
    )
    .unwrap()
}

fn person(id: &str, friend: &str) -> ScrapedRecord {
    ScrapedRecord::new("person", format!("http://example.com/people/{id}"))
        .with_identifier(id)
        .with_field("name", id)
        .with_field("friend", friend)
}

#[test]
fn schemas_load_from_json() {
    let registry = registry();
    assert_eq!(registry.len(), 3);

    let venue = registry.get("venue").unwrap();
    assert_eq!(venue.unique_together(), &[vec!["name".to_string(), "city".to_string()]]);
    assert_eq!(venue.field("address").unwrap().kind.relation_target(), Some("address"));
    assert!(venue.tracks("opened"));
}

#[test]
fn concurrent_duplicates_create_one_entity() {
    let store = Arc::new(InMemoryEntityStore::new());
    let session = session_over(store.clone(), 8);

    let handles: Vec<_> = (0..32)
        .map(|n| {
            let record = ScrapedRecord::new("venue", format!("http://mirror-{n}.example.com/joes"))
                .with_field("name", "Joe's Bar")
                .with_field("city", "Austin");
            session.submit(record).unwrap()
        })
        .collect();

    let mut created = 0;
    for handle in handles {
        let outcome = handle.join_timeout(WAIT).unwrap();
        if outcome.merge().unwrap().created {
            created += 1;
        }
    }

    assert_eq!(created, 1);
    assert_eq!(store.count("venue").unwrap(), 1);
    let report = session.finish();
    assert_eq!(report.submitted, 32);
    assert_eq!(report.completed, 32);
    assert_eq!(report.created, 1);
}

#[test]
fn many_dependents_wait_on_one_address() {
    let store = Arc::new(InMemoryEntityStore::new());
    let session = session_over(store.clone(), 4);

    let venues: Vec<_> = (0..20)
        .map(|n| {
            let record = ScrapedRecord::new("venue", format!("http://example.com/venues/{n}"))
                .with_identifier(format!("v{n}"))
                .with_field("name", format!("Venue {n}").as_str())
                .with_field("address", "a1");
            session.submit(record).unwrap()
        })
        .collect();
    let address = session
        .submit(
            ScrapedRecord::new("address", "http://example.com/addresses/a1")
                .with_identifier("a1")
                .with_field("street", "1 Main St"),
        )
        .unwrap();

    let address_id = address.join_timeout(WAIT).unwrap().merge().unwrap().entity.id;
    for handle in venues {
        let outcome = handle.join_timeout(WAIT).unwrap();
        let id = outcome.merge().unwrap().entity.id;
        let stored = store.get(id).unwrap().unwrap();
        assert_eq!(stored.get("address"), Some(&Value::Entity(address_id)));
    }
    assert_eq!(session.finish().failed, 0);
}

#[test]
fn self_reference_is_a_cycle() {
    let session = session_over(Arc::new(InMemoryEntityStore::new()), 2);
    let p1 = session.submit(person("p1", "p1")).unwrap();

    let outcome = p1.join_timeout(WAIT).unwrap();
    assert!(matches!(outcome.error(), Some(RecordError::CyclicDependency { .. })));
    drop(session.finish());
}

#[test]
fn mutual_references_fail_both_records() {
    let session = session_over(Arc::new(InMemoryEntityStore::new()), 4);
    let p1 = session.submit(person("p1", "p2")).unwrap();
    let p2 = session.submit(person("p2", "p1")).unwrap();

    let kinds: Vec<_> = [p1, p2]
        .into_iter()
        .map(|h| h.join_timeout(WAIT).unwrap().error().map(RecordError::kind))
        .collect();
    assert!(kinds.iter().all(Option::is_some));
    assert!(kinds.contains(&Some("cyclic_dependency")));

    let report = session.finish();
    assert_eq!(report.failed, 2);
    assert_eq!(report.cancelled, 0);
}

#[test]
fn empty_session_finishes_cleanly() {
    let session = session_over(Arc::new(InMemoryEntityStore::new()), 2);
    assert_eq!(session.resolver().pending_count(), 0);
    let report = session.finish();
    assert_eq!(report.submitted, 0);
    assert!(report.failures.is_empty());
}

#[test]
fn queue_capacity_bounds_intake() {
    let store = Arc::new(InMemoryEntityStore::new());
    let engine = MergeEngine::new(registry(), store);
    let session = Session::new(
        engine,
        PipelineConfig {
            workers: 1,
            queue_capacity: 2,
            ..PipelineConfig::default()
        },
    )
    .unwrap();

    // Both park on an address that never arrives, so they stay in flight.
    for n in 0..2 {
        let record = ScrapedRecord::new("venue", "http://example.com")
            .with_identifier(format!("v{n}"))
            .with_field("name", "x")
            .with_field("address", "missing");
        session.submit(record).unwrap();
    }
    let err = session
        .submit(ScrapedRecord::new("address", "http://example.com").with_field("street", "2 Side St"))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::QueueFull { capacity: 2 }));

    let report = session.finish();
    assert_eq!(report.cancelled, 2);
}

/// Store whose saves fail while `broken` is set.
struct FlakyStore {
    inner: InMemoryEntityStore,
    broken: AtomicBool,
}

impl EntityStore for FlakyStore {
    fn get(&self, id: EntityId) -> Result<Option<StoredEntity>, StorageError> {
        self.inner.get(id)
    }

    fn find_one(&self, schema: &str, filter: &IdentityFilter) -> Result<Option<StoredEntity>, StorageError> {
        self.inner.find_one(schema, filter)
    }

    fn create(&self, schema: &str, initial: FieldValues) -> Result<StoredEntity, StorageError> {
        self.inner.create(schema, initial)
    }

    fn create_unique(
        &self,
        schema: &str,
        filter: &IdentityFilter,
        initial: FieldValues,
    ) -> Result<CreateOutcome, StorageError> {
        self.inner.create_unique(schema, filter, initial)
    }

    fn save(&self, entity: &StoredEntity) -> Result<StoredEntity, StorageError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("disk full".to_string()));
        }
        self.inner.save(entity)
    }

    fn list(&self, schema: &str) -> Result<Vec<StoredEntity>, StorageError> {
        self.inner.list(schema)
    }

    fn list_versions(&self, id: EntityId) -> Result<Vec<StoredEntity>, StorageError> {
        self.inner.list_versions(id)
    }
}

#[test]
fn persistence_failure_propagates_to_dependents() {
    let store = Arc::new(FlakyStore {
        inner: InMemoryEntityStore::new(),
        broken: AtomicBool::new(true),
    });
    let session = session_over(store.clone(), 2);

    let venue = session
        .submit(
            ScrapedRecord::new("venue", "http://example.com/venues/v1")
                .with_identifier("v1")
                .with_field("name", "Joe's Bar")
                .with_field("address", "a1"),
        )
        .unwrap();
    let address = session
        .submit(
            ScrapedRecord::new("address", "http://example.com/addresses/a1")
                .with_identifier("a1")
                .with_field("street", "1 Main St"),
        )
        .unwrap();

    let address = address.join_timeout(WAIT).unwrap();
    assert!(matches!(address.error(), Some(RecordError::Persistence(StorageError::Unavailable(_)))));
    let venue = venue.join_timeout(WAIT).unwrap();
    assert_eq!(venue.error().map(RecordError::kind), Some("invalid_relation"));

    // Recovery: later records reconcile against whatever was created.
    store.broken.store(false, Ordering::SeqCst);
    let retry = session
        .submit(ScrapedRecord::new("address", "http://example.com/addresses/a1").with_field("street", "1 Main St"))
        .unwrap();
    assert!(retry.join_timeout(WAIT).unwrap().is_completed());
    assert_eq!(store.inner.count("address").unwrap(), 1);

    let report = session.finish();
    assert_eq!(report.failed, 2);
}

#[test]
fn submitting_from_many_threads() {
    let store = Arc::new(InMemoryEntityStore::new());
    let session = Arc::new(session_over(store.clone(), 4));

    let producers: Vec<_> = (0..4)
        .map(|t| {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                (0..10)
                    .map(|n| {
                        let record = ScrapedRecord::new("address", format!("http://example.com/{t}/{n}"))
                            .with_field("street", format!("{n} Main St").as_str());
                        session.submit(record).unwrap().join_timeout(WAIT).unwrap().is_completed()
                    })
                    .all(|ok| ok)
            })
        })
        .collect();

    for producer in producers {
        assert!(producer.join().unwrap());
    }
    assert_eq!(store.count("address").unwrap(), 10);

    let session = Arc::try_unwrap(session).unwrap();
    assert_eq!(session.finish().submitted, 40);
}

#[test]
fn reused_identifier_fails_without_writing() {
    let store = Arc::new(InMemoryEntityStore::new());
    let session = session_over(store.clone(), 2);

    let first = session
        .submit(
            ScrapedRecord::new("address", "http://example.com/addresses/a1")
                .with_identifier("a1")
                .with_field("street", "1 Main St"),
        )
        .unwrap();
    let first = first.join_timeout(WAIT).unwrap();
    let original = store.get(first.merge().unwrap().entity.id).unwrap().unwrap();

    let second = session
        .submit(
            ScrapedRecord::new("address", "http://example.com/addresses/a1-again")
                .with_identifier("a1")
                .with_field("street", "2 Side St"),
        )
        .unwrap();
    let second = second.join_timeout(WAIT).unwrap();
    assert!(matches!(
        second.error(),
        Some(RecordError::DoubleResolution { identifier }) if identifier.as_str() == "a1"
    ));

    let addresses = store.list("address").unwrap();
    assert_eq!(addresses, vec![original]);

    let report = session.finish();
    assert_eq!(report.completed, 1);
    assert_eq!(report.failure_for("a1").unwrap().kind, "double_resolution");
}
