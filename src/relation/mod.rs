//! Relation resolver.
//!
//! Maps every external identifier seen during a session to either a pending
//! single-assignment cell or its resolved value. A record that references
//! identifiers whose records have not merged yet registers a waiter on their
//! cells and is resumed through a callback once all of them resolve. Nothing
//! blocks while waiting.
//!
//! Cells live in a fixed set of shards so that disjoint identifiers never
//! contend on the same lock. When a cell resolves it is replaced by the
//! resolved value and its subscribers are woken outside the shard lock.

mod graph;

use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::{debug, error};

use crate::entity::EntityHandle;
use crate::error::{RecordError, RuntimeError};
use crate::record::Identifier;

use graph::WaitGraph;

const SHARDS: usize = 16;

/// Terminal failure marker stored in a cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionFailure {
    /// The record owning the identifier failed.
    RecordFailed { reason: String },
    /// The session ended before the identifier resolved.
    Cancelled,
    /// A caller-driven expiry gave up on the identifier.
    TimedOut,
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RecordFailed { reason } => write!(f, "record failed: {reason}"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::TimedOut => f.write_str("timed out"),
        }
    }
}

/// Value a cell resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Entity(EntityHandle),
    Failed(ResolutionFailure),
}

impl Resolution {
    #[must_use]
    pub const fn entity(&self) -> Option<&EntityHandle> {
        match self {
            Self::Entity(handle) => Some(handle),
            Self::Failed(_) => None,
        }
    }

    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// State of an identifier as seen by `register`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationHandle {
    Pending,
    Resolved(Resolution),
}

/// Resolutions handed to a record once every awaited identifier resolved.
pub type ResolvedRelations = HashMap<Identifier, Resolution>;

/// Result of `await_all`.
#[derive(Debug)]
pub enum AwaitOutcome {
    /// Everything was already resolved; the callback was not retained.
    Ready(ResolvedRelations),
    /// The callback fires on whichever thread resolves the last identifier.
    Suspended,
}

type Callback = Box<dyn FnOnce(ResolvedRelations) + Send>;

struct WaiterState {
    remaining: usize,
    collected: ResolvedRelations,
    callback: Option<Callback>,
}

struct Waiter {
    owner: Option<Identifier>,
    state: Mutex<WaiterState>,
}

impl Waiter {
    /// Records one resolution. Returns the callback and the collected
    /// resolutions once nothing remains outstanding.
    fn deliver(&self, delivered: Option<(Identifier, Resolution)>) -> Option<(Option<Callback>, ResolvedRelations)> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.remaining == 0 {
            return None;
        }
        if let Some((id, resolution)) = delivered {
            state.collected.insert(id, resolution);
        }
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining > 0 {
            return None;
        }
        let callback = state.callback.take();
        Some((callback, std::mem::take(&mut state.collected)))
    }
}

enum Slot {
    Pending {
        subscribers: Vec<Arc<Waiter>>,
        created: Instant,
    },
    Resolved(Resolution),
}

impl Slot {
    fn pending() -> Self {
        Self::Pending {
            subscribers: Vec::new(),
            created: Instant::now(),
        }
    }
}

type Shard = Mutex<HashMap<Identifier, Slot>>;

/// Session-scoped registry of pending and resolved identifiers.
pub struct RelationResolver {
    shards: Vec<Shard>,
    graph: Mutex<WaitGraph>,
    closed: AtomicBool,
}

impl fmt::Debug for RelationResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationResolver")
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Default for RelationResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl RelationResolver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            graph: Mutex::new(WaitGraph::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn shard(&self, id: &Identifier) -> MutexGuard<'_, HashMap<Identifier, Slot>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let idx = (hasher.finish() % SHARDS as u64) as usize;
        relock(&self.shards[idx])
    }

    fn fresh_slot(&self) -> Slot {
        if self.is_closed() {
            Slot::Resolved(Resolution::Failed(ResolutionFailure::Cancelled))
        } else {
            Slot::pending()
        }
    }

    /// Returns true once `cancel_all` ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the current state of `id`, allocating a pending cell if the
    /// identifier has not been seen.
    pub fn register(&self, id: &Identifier) -> RelationHandle {
        let mut shard = self.shard(id);
        let slot = shard.entry(id.clone()).or_insert_with(|| self.fresh_slot());
        match slot {
            Slot::Pending { .. } => RelationHandle::Pending,
            Slot::Resolved(resolution) => RelationHandle::Resolved(resolution.clone()),
        }
    }

    /// Returns the current state of `id` without allocating.
    #[must_use]
    pub fn peek(&self, id: &Identifier) -> Option<RelationHandle> {
        let shard = self.shard(id);
        shard.get(id).map(|slot| match slot {
            Slot::Pending { .. } => RelationHandle::Pending,
            Slot::Resolved(resolution) => RelationHandle::Resolved(resolution.clone()),
        })
    }

    /// Waits for every identifier in `ids` to resolve.
    ///
    /// `owner` is the identifier of the waiting record, used for cycle
    /// detection. When everything is already resolved the resolutions are
    /// returned directly and `on_ready` is dropped; otherwise `on_ready` runs
    /// exactly once, on the thread that resolves the last identifier.
    ///
    /// # Errors
    ///
    /// `CyclicDependency` if awaiting `ids` would make `owner` transitively
    /// await itself. Nothing is registered in that case.
    pub fn await_all<F>(
        &self,
        owner: Option<&Identifier>,
        ids: &[Identifier],
        on_ready: F,
    ) -> Result<AwaitOutcome, RecordError>
    where
        F: FnOnce(ResolvedRelations) + Send + 'static,
    {
        let mut unique: Vec<Identifier> = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(id) {
                unique.push(id.clone());
            }
        }

        let waiter = Arc::new(Waiter {
            owner: owner.cloned(),
            state: Mutex::new(WaiterState {
                remaining: unique.len() + 1,
                collected: ResolvedRelations::with_capacity(unique.len()),
                callback: Some(Box::new(on_ready)),
            }),
        });

        let mut graph = owner.map(|_| relock(&self.graph));
        if let (Some(owner), Some(graph)) = (owner, graph.as_deref()) {
            let pending: Vec<Identifier> = unique
                .iter()
                .filter(|id| matches!(self.register(id), RelationHandle::Pending))
                .cloned()
                .collect();
            if let Some(chain) = graph.cycle_through(owner, &pending) {
                error!(identifier = %owner, chain = ?chain, "cyclic relation dependency");
                return Err(RecordError::CyclicDependency {
                    identifier: owner.clone(),
                    chain,
                });
            }
        }

        let mut ready = Vec::new();
        let mut suspended_on = Vec::new();
        for id in &unique {
            let mut shard = self.shard(id);
            let slot = shard.entry(id.clone()).or_insert_with(|| self.fresh_slot());
            match slot {
                Slot::Pending { subscribers, .. } => {
                    subscribers.push(Arc::clone(&waiter));
                    suspended_on.push(id.clone());
                }
                Slot::Resolved(resolution) => ready.push((id.clone(), resolution.clone())),
            }
        }

        if let (Some(owner), Some(graph)) = (owner, graph.as_deref_mut()) {
            if !suspended_on.is_empty() {
                graph.add(owner.clone(), suspended_on.iter().cloned());
            }
        }
        drop(graph);

        let mut fired = None;
        for resolved in ready {
            if let Some(done) = waiter.deliver(Some(resolved)) {
                fired = Some(done);
            }
        }
        if let Some(done) = waiter.deliver(None) {
            fired = Some(done);
        }

        match fired {
            Some((_, resolutions)) => {
                self.forget_waiter(&waiter);
                Ok(AwaitOutcome::Ready(resolutions))
            }
            None => {
                debug!(owner = ?owner, awaiting = ?suspended_on, "record suspended on relations");
                Ok(AwaitOutcome::Suspended)
            }
        }
    }

    fn forget_waiter(&self, waiter: &Waiter) {
        if let Some(owner) = &waiter.owner {
            relock(&self.graph).remove(owner);
        }
    }

    fn notify(&self, id: &Identifier, resolution: &Resolution, subscribers: Vec<Arc<Waiter>>) {
        for waiter in subscribers {
            if let Some((callback, resolutions)) = waiter.deliver(Some((id.clone(), resolution.clone()))) {
                self.forget_waiter(&waiter);
                if let Some(callback) = callback {
                    debug!(owner = ?waiter.owner, "relations resolved; resuming record");
                    callback(resolutions);
                }
            }
        }
    }

    /// Completes the cell for `id`.
    ///
    /// # Errors
    ///
    /// `DoubleResolution` if `id` was already resolved.
    pub fn resolve(&self, id: &Identifier, resolution: Resolution) -> Result<(), RecordError> {
        let subscribers = {
            let mut shard = self.shard(id);
            match shard.entry(id.clone()) {
                Entry::Occupied(mut occupied) => {
                    if matches!(occupied.get(), Slot::Resolved(_)) {
                        error!(identifier = %id, "identifier resolved twice");
                        return Err(RecordError::DoubleResolution { identifier: id.clone() });
                    }
                    match std::mem::replace(occupied.get_mut(), Slot::Resolved(resolution.clone())) {
                        Slot::Pending { subscribers, .. } => subscribers,
                        Slot::Resolved(_) => Vec::new(),
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(Slot::Resolved(resolution.clone()));
                    Vec::new()
                }
            }
        };

        debug!(identifier = %id, waiters = subscribers.len(), failed = resolution.is_failure(), "identifier resolved");
        self.notify(id, &resolution, subscribers);
        Ok(())
    }

    /// Resolves `id` with a terminal failure so every waiter fails.
    ///
    /// # Errors
    ///
    /// `DoubleResolution` if `id` was already resolved.
    pub fn propagate_failure(&self, id: &Identifier, reason: impl Into<String>) -> Result<(), RecordError> {
        self.resolve(
            id,
            Resolution::Failed(ResolutionFailure::RecordFailed { reason: reason.into() }),
        )
    }

    fn fail_pending<P>(&self, failure: &ResolutionFailure, mut select: P) -> Vec<Identifier>
    where
        P: FnMut(Instant) -> bool,
    {
        let resolution = Resolution::Failed(failure.clone());
        let mut woken = Vec::new();
        for shard in &self.shards {
            let mut shard = relock(shard);
            for (id, slot) in shard.iter_mut() {
                let Slot::Pending { created, .. } = slot else {
                    continue;
                };
                if !select(*created) {
                    continue;
                }
                if let Slot::Pending { subscribers, .. } = std::mem::replace(slot, Slot::Resolved(resolution.clone())) {
                    woken.push((id.clone(), subscribers));
                }
            }
        }

        let ids = woken.iter().map(|(id, _)| id.clone()).collect();
        for (id, subscribers) in woken {
            self.notify(&id, &resolution, subscribers);
        }
        ids
    }

    /// Closes the resolver and resolves every outstanding cell as cancelled.
    /// Cells created afterwards start out cancelled.
    pub fn cancel_all(&self) -> Vec<Identifier> {
        self.closed.store(true, Ordering::SeqCst);
        let cancelled = self.fail_pending(&ResolutionFailure::Cancelled, |_| true);
        if !cancelled.is_empty() {
            debug!(count = cancelled.len(), "cancelled outstanding identifiers");
        }
        cancelled
    }

    /// Resolves every cell pending for longer than `max_age` as timed out.
    pub fn expire_stale(&self, max_age: Duration) -> Vec<Identifier> {
        let now = Instant::now();
        self.fail_pending(&ResolutionFailure::TimedOut, |created| now.duration_since(created) >= max_age)
    }

    /// Number of identifiers still pending.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| relock(s).values().filter(|slot| matches!(slot, Slot::Pending { .. })).count())
            .sum()
    }

    /// Blocks the calling thread until every identifier resolves.
    ///
    /// # Errors
    ///
    /// `Timeout` if `timeout` elapses first.
    pub fn wait_all_blocking(&self, ids: &[Identifier], timeout: Duration) -> Result<ResolvedRelations, RuntimeError> {
        let (tx, rx) = bounded::<ResolvedRelations>(1);
        let outcome = self
            .await_all(None, ids, move |resolved| {
                let _ = tx.send(resolved);
            })
            .map_err(|_| RuntimeError::Disconnected)?;
        match outcome {
            AwaitOutcome::Ready(resolved) => Ok(resolved),
            AwaitOutcome::Suspended => rx.recv_timeout(timeout).map_err(|err| match err {
                RecvTimeoutError::Timeout => RuntimeError::Timeout {
                    duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
                },
                RecvTimeoutError::Disconnected => RuntimeError::Disconnected,
            }),
        }
    }
}
