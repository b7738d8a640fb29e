//! Pipeline controller.
//!
//! A `Session` owns a relation resolver and a pool of merge workers. Records
//! are submitted one by one. A record whose relations are still pending is
//! parked on the resolver and re-enqueued by whichever worker resolves its
//! last dependency, so workers never block on relations.
//!
//! Intake is bounded by the number of records in flight (queued, suspended
//! or merging). Resumptions bypass the bound: they come from records that
//! were already admitted.

mod lifecycle;
mod report;

pub use lifecycle::RecordState;
pub use report::{FailureEntry, RecordHandle, RecordOutcome, SessionReport};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, SendError, Sender};
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::engine::MergeEngine;
use crate::error::{RecordError, RuntimeError};
use crate::record::{Identifier, ScrapedRecord};
use crate::relation::{
    AwaitOutcome, RelationHandle, RelationResolver, Resolution, ResolutionFailure, ResolvedRelations,
};

use lifecycle::Lifecycle;

/// A submitted record travelling through the workers.
#[derive(Clone)]
struct Tracked {
    record: ScrapedRecord,
    reply: Sender<RecordOutcome>,
    lifecycle: Lifecycle,
}

enum Job {
    Process(Tracked),
    Resume(Tracked, ResolvedRelations),
    Stop,
}

#[derive(Debug, Default)]
struct Counters {
    /// Admitted records that have not completed or failed.
    in_flight: usize,
    /// Jobs queued or executing.
    runnable: usize,
}

struct Shared {
    engine: MergeEngine,
    resolver: RelationResolver,
    jobs: Sender<Job>,
    counters: Mutex<Counters>,
    changed: Condvar,
    closed: AtomicBool,
    report: Mutex<SessionReport>,
    capacity: usize,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Shared {
    fn update_counters(&self, f: impl FnOnce(&mut Counters)) {
        let mut counters = relock(&self.counters);
        f(&mut counters);
        drop(counters);
        self.changed.notify_all();
    }

    fn wait_until(&self, done: impl Fn(&Counters) -> bool) {
        let mut counters = relock(&self.counters);
        while !done(&counters) {
            counters = match self.changed.wait(counters) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn admit(&self) -> Result<(), RuntimeError> {
        let mut counters = relock(&self.counters);
        if self.closed.load(Ordering::SeqCst) {
            return Err(RuntimeError::Closed);
        }
        if counters.in_flight >= self.capacity {
            return Err(RuntimeError::QueueFull {
                capacity: self.capacity,
            });
        }
        counters.in_flight += 1;
        counters.runnable += 1;
        Ok(())
    }

    /// Re-enqueues a record whose relations resolved.
    fn enqueue_resume(self: &Arc<Self>, tracked: Tracked, resolved: ResolvedRelations) {
        self.update_counters(|c| c.runnable += 1);
        if let Err(SendError(job)) = self.jobs.send(Job::Resume(tracked, resolved)) {
            self.update_counters(|c| c.runnable -= 1);
            if let Job::Resume(tracked, _) = job {
                self.fail(tracked, RecordError::Cancelled);
            }
        }
    }

    fn run(self: &Arc<Self>, job: Job) {
        match job {
            Job::Process(tracked) => self.process(tracked),
            Job::Resume(mut tracked, resolved) => {
                debug!(record = %tracked.record.label(), "resuming record");
                self.merge(&mut tracked, &resolved);
            }
            Job::Stop => {}
        }
    }

    fn process(self: &Arc<Self>, mut tracked: Tracked) {
        let own = tracked.record.identifier.clone();
        if let Some(own) = &own {
            self.resolver.register(own);
        }

        let ids = match self.engine.relation_identifiers(&tracked.record) {
            Ok(ids) => ids,
            Err(err) => return self.fail(tracked, err),
        };
        if ids.is_empty() {
            return self.merge(&mut tracked, &ResolvedRelations::new());
        }

        let mut parked = tracked.clone();
        parked.lifecycle.advance(RecordState::Suspended);
        let shared = Arc::clone(self);
        let outcome = self.resolver.await_all(own.as_ref(), &ids, move |resolved| {
            shared.enqueue_resume(parked, resolved);
        });

        match outcome {
            Ok(AwaitOutcome::Ready(resolved)) => self.merge(&mut tracked, &resolved),
            Ok(AwaitOutcome::Suspended) => {}
            Err(err) => self.fail(tracked, err),
        }
    }

    fn merge(&self, tracked: &mut Tracked, resolved: &ResolvedRelations) {
        tracked.lifecycle.advance(RecordState::Merging);
        let own = tracked.record.identifier.clone();

        if let Some(own) = &own {
            match self.resolver.peek(own) {
                Some(RelationHandle::Resolved(Resolution::Failed(ResolutionFailure::Cancelled))) => {
                    return self.fail(tracked.clone(), RecordError::Cancelled);
                }
                Some(RelationHandle::Resolved(Resolution::Failed(ResolutionFailure::TimedOut))) => {
                    return self.fail(tracked.clone(), RecordError::TimedOut { identifier: own.clone() });
                }
                // Another record already published this identifier.
                Some(RelationHandle::Resolved(_)) => {
                    error!(identifier = %own, record = %tracked.record.label(), "identifier resolved twice");
                    return self.fail(tracked.clone(), RecordError::DoubleResolution { identifier: own.clone() });
                }
                Some(RelationHandle::Pending) | None => {}
            }
        }

        let merge = match self.engine.merge(&tracked.record, resolved) {
            Ok(merge) => merge,
            Err(err) => return self.fail(tracked.clone(), err),
        };

        if let Some(own) = &own {
            if let Err(err) = self.resolver.resolve(own, Resolution::Entity(merge.entity.clone())) {
                return self.fail(tracked.clone(), err);
            }
        }

        tracked.lifecycle.advance(RecordState::Completed);
        relock(&self.report).record_completed(&merge);
        let _ = tracked.reply.send(RecordOutcome::Completed {
            identifier: own,
            merge,
            suspensions: tracked.lifecycle.suspensions(),
        });
        self.update_counters(|c| c.in_flight -= 1);
    }

    fn fail(&self, mut tracked: Tracked, error: RecordError) {
        let from = tracked.lifecycle.state();
        tracked.lifecycle.advance(RecordState::Failed);
        let label = tracked.record.label();
        warn!(record = %label, state = %from, kind = error.kind(), error = %error, "record failed");

        let own = tracked.record.identifier.clone();
        if let Some(own) = &own {
            let already_resolved = matches!(self.resolver.peek(own), Some(RelationHandle::Resolved(_)));
            if !already_resolved {
                // Fails only if a record with the same identifier published
                // in between; the resolver logs that itself.
                let _ = self.resolver.propagate_failure(own, error.to_string());
            }
        }

        relock(&self.report).record_failed(label, own.clone(), &error);
        let _ = tracked.reply.send(RecordOutcome::Failed { identifier: own, error });
        self.update_counters(|c| c.in_flight -= 1);
    }
}

/// A processing session: one relation resolver plus a merge worker pool.
pub struct Session {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    config: PipelineConfig,
}

impl Session {
    /// Starts the worker pool.
    pub fn new(engine: MergeEngine, config: PipelineConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let engine = engine.with_config(config.merge.clone());
        let (tx, rx) = unbounded::<Job>();

        let shared = Arc::new(Shared {
            engine,
            resolver: RelationResolver::new(),
            jobs: tx,
            counters: Mutex::new(Counters::default()),
            changed: Condvar::new(),
            closed: AtomicBool::new(false),
            report: Mutex::new(SessionReport::default()),
            capacity: config.queue_capacity,
        });

        let mut workers = Vec::with_capacity(config.workers);
        for idx in 0..config.workers {
            let rx: Receiver<Job> = rx.clone();
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("scrapesync-merge-{idx}"))
                .spawn(move || loop {
                    match rx.recv() {
                        Ok(Job::Stop) | Err(_) => break,
                        Ok(job) => {
                            shared.run(job);
                            shared.update_counters(|c| c.runnable -= 1);
                        }
                    }
                })
                .expect("failed to spawn scrapesync worker");
            workers.push(handle);
        }

        info!(workers = config.workers, capacity = config.queue_capacity, "session started");
        Ok(Self {
            shared,
            workers,
            config,
        })
    }

    /// Submits a record for processing.
    ///
    /// # Errors
    ///
    /// `QueueFull` when `queue_capacity` records are in flight, `Closed` once
    /// the session is finishing.
    pub fn submit(&self, record: ScrapedRecord) -> Result<RecordHandle, RuntimeError> {
        self.shared.admit()?;
        let (reply, rx) = bounded::<RecordOutcome>(1);
        let label = record.label();
        let tracked = Tracked {
            record,
            reply,
            lifecycle: Lifecycle::new(),
        };
        if self.shared.jobs.send(Job::Process(tracked)).is_err() {
            self.shared.update_counters(|c| {
                c.in_flight -= 1;
                c.runnable -= 1;
            });
            return Err(RuntimeError::Disconnected);
        }
        relock(&self.shared.report).submitted += 1;
        Ok(RecordHandle::new(label, rx))
    }

    /// The session's relation resolver.
    #[must_use]
    pub fn resolver(&self) -> &RelationResolver {
        &self.shared.resolver
    }

    #[must_use]
    pub fn engine(&self) -> &MergeEngine {
        &self.shared.engine
    }

    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Records admitted but not yet completed or failed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        relock(&self.shared.counters).in_flight
    }

    /// Fails identifiers pending longer than `pending_timeout_ms`. Does
    /// nothing when no timeout is configured.
    pub fn expire_stale(&self) -> Vec<Identifier> {
        self.config
            .pending_timeout_ms
            .map(|ms| self.expire_older_than(Duration::from_millis(ms)))
            .unwrap_or_default()
    }

    /// Fails identifiers pending longer than `max_age`.
    pub fn expire_older_than(&self, max_age: Duration) -> Vec<Identifier> {
        let expired = self.shared.resolver.expire_stale(max_age);
        if !expired.is_empty() {
            warn!(count = expired.len(), "expired stale identifiers");
        }
        expired
    }

    /// Drains runnable work, cancels every identifier still pending, waits
    /// for the woken records to fail and stops the workers.
    #[must_use]
    pub fn finish(mut self) -> SessionReport {
        self.shutdown()
    }

    fn shutdown(&mut self) -> SessionReport {
        if self.workers.is_empty() {
            return relock(&self.shared.report).clone();
        }

        {
            // Taking the counters lock orders the flag against `admit`.
            let _counters = relock(&self.shared.counters);
            self.shared.closed.store(true, Ordering::SeqCst);
        }
        self.shared.wait_until(|c| c.runnable == 0);

        let cancelled = self.shared.resolver.cancel_all();
        self.shared.wait_until(|c| c.in_flight == 0);

        for _ in 0..self.workers.len() {
            let _ = self.shared.jobs.send(Job::Stop);
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }

        let report = relock(&self.shared.report).clone();
        info!(
            completed = report.completed,
            created = report.created,
            failed = report.failed,
            cancelled_identifiers = cancelled.len(),
            "session finished"
        );
        report
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("workers", &self.workers.len())
            .field("resolver", &self.shared.resolver)
            .finish_non_exhaustive()
    }
}
