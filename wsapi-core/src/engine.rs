//! Server cache engine
//!
//! The engine owns every live query. Each distinct `(name, args)` pair maps
//! to one [`QueryKey`] and at most one cache entry, no matter how many
//! sessions subscribe to it. Entries move through
//!
//! ```text
//! Uninitialized → Computing → Ready ⇄ Stale → (collected by a sweep)
//!                     ↘ Failed
//! ```
//!
//! `Stale` only happens while nobody is subscribed: invalidating a watched
//! entry recomputes it right away, invalidating an unwatched one defers the
//! work until the next subscriber shows up.
//!
//! All shared state (entry arena, tag index, sweep queue) lives behind a
//! single lock. User functions run on spawned tasks without the lock held;
//! their results are applied under the lock, so a given entry sees its
//! pushes in completion order.

use crate::definition::{Definition, GetFunction, GetReturn};
use crate::error::{EngineError, FunctionKind, Result};
use crate::key::QueryKey;
use crate::metrics::{EngineMetrics, EngineStats};
use crate::session::{Outbox, Session};
use crate::tags::TagIndex;
use anyhow::anyhow;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wsapi_types::{CorrelationId, ServerMessage, SessionId};

/// Default time between two sweeps of prefetched entries
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often [`CacheEngine::spawn_sweeper`] collects orphaned entries
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Lifecycle state of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Created, computation not started yet
    Uninitialized,
    /// A computation is in flight
    Computing,
    /// Value is current
    Ready,
    /// Value is out of date and nobody is watching
    Stale,
    /// The first computation failed; the next subscriber retries
    Failed,
}

/// One (session, correlation id) pair attached to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscriber {
    pub session: SessionId,
    pub id: CorrelationId,
}

struct CacheEntry {
    /// Distinguishes this entry from a later one created under the same key
    serial: u64,
    name: String,
    args: Vec<Value>,
    value: Option<Value>,
    state: EntryState,
    /// Bumped on every invalidation
    epoch: u64,
    /// Epoch of the most recently started computation
    started: u64,
    tags: Vec<String>,
    subscribers: HashMap<Subscriber, Outbox>,
}

impl CacheEntry {
    fn new(serial: u64, name: &str, args: Vec<Value>) -> Self {
        Self {
            serial,
            name: name.to_string(),
            args,
            value: None,
            state: EntryState::Uninitialized,
            epoch: 0,
            started: 0,
            tags: Vec::new(),
            subscribers: HashMap::new(),
        }
    }

    /// Mark the entry as computing and describe the work to run
    fn begin(&mut self, key: &QueryKey) -> Job {
        self.state = EntryState::Computing;
        self.started = self.epoch;
        Job {
            key: key.clone(),
            serial: self.serial,
            epoch: self.epoch,
            name: self.name.clone(),
            args: self.args.clone(),
        }
    }

    fn push(&self, value: &Value) {
        for (sub, outbox) in &self.subscribers {
            // A closed outbox belongs to a session that is shutting down and
            // will detach itself.
            let _ = outbox.send(ServerMessage::value(sub.id, value.clone()));
        }
    }

    fn push_error(&self, message: &str) {
        for (sub, outbox) in &self.subscribers {
            let _ = outbox.send(ServerMessage::error(sub.id, message));
        }
    }
}

/// A computation to run outside the lock
struct Job {
    key: QueryKey,
    serial: u64,
    epoch: u64,
    name: String,
    args: Vec<Value>,
}

#[derive(Default)]
struct EngineState {
    entries: HashMap<QueryKey, CacheEntry>,
    tags: TagIndex,
    sweep_queue: HashSet<QueryKey>,
    next_serial: u64,
}

struct EngineInner {
    definition: Definition,
    config: EngineConfig,
    state: Mutex<EngineState>,
    metrics: EngineMetrics,
    next_session: AtomicU64,
}

/// Snapshot of one cache entry, for introspection
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
    pub state: EntryState,
    pub value: Option<Value>,
    pub subscribers: usize,
    pub tags: Vec<String>,
    pub queued_for_sweep: bool,
}

/// The live-query cache shared by every connection
///
/// Cloning is cheap; all clones share one cache. Operations that start a
/// computation spawn a tokio task and must run inside a tokio runtime.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("definition", &self.inner.definition)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl CacheEngine {
    /// Create an engine with the default configuration
    pub fn new(definition: Definition) -> Self {
        Self::with_config(definition, EngineConfig::default())
    }

    pub fn with_config(definition: Definition, config: EngineConfig) -> Self {
        CacheEngine {
            inner: Arc::new(EngineInner {
                definition,
                config,
                state: Mutex::new(EngineState::default()),
                metrics: EngineMetrics::new(),
                next_session: AtomicU64::new(0),
            }),
        }
    }

    pub fn definition(&self) -> &Definition {
        &self.inner.definition
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.inner.metrics
    }

    /// Open a session whose replies are delivered to `outbox`
    pub fn open_session(&self, outbox: Outbox) -> Session {
        let id = SessionId(self.inner.next_session.fetch_add(1, Ordering::Relaxed));
        Session::new(self.clone(), id, outbox)
    }

    /// Attach `subscriber` to the entry for `(name, args)`, creating it if needed
    ///
    /// The current value, if any, is pushed to `outbox` right away; later
    /// values follow as computations complete.
    pub fn subscribe(
        &self,
        subscriber: Subscriber,
        outbox: &Outbox,
        name: &str,
        args: Vec<Value>,
    ) -> Result<QueryKey> {
        if self.inner.definition.get_fn(name).is_none() {
            return Err(EngineError::UnknownFunction {
                kind: FunctionKind::Get,
                name: name.to_string(),
            });
        }

        let key = QueryKey::encode(name, &args);
        let job = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            let mut created = false;
            let next_serial = &mut state.next_serial;
            let entry = state.entries.entry(key.clone()).or_insert_with(|| {
                created = true;
                *next_serial += 1;
                CacheEntry::new(*next_serial, name, args)
            });

            let was_unwatched = entry.subscribers.is_empty();
            entry.subscribers.insert(subscriber, outbox.clone());

            if let Some(value) = &entry.value {
                let _ = outbox.send(ServerMessage::value(subscriber.id, value.clone()));
            }

            if created {
                self.inner.metrics.record_miss();
                debug!(key = %key.fingerprint(), %name, "created cache entry");
            } else {
                self.inner.metrics.record_hit();
            }

            let needs_compute = match entry.state {
                EntryState::Uninitialized | EntryState::Failed => true,
                EntryState::Stale => was_unwatched,
                EntryState::Computing | EntryState::Ready => false,
            };
            needs_compute.then(|| entry.begin(&key))
        };

        if let Some(job) = job {
            self.spawn_job(job);
        }
        Ok(key)
    }

    /// Detach `subscriber` from the entry under `key`
    ///
    /// An entry left without subscribers stays cached until a sweep sees it,
    /// so a quick resubscription does not recompute.
    pub fn unsubscribe(&self, key: &QueryKey, subscriber: Subscriber) -> bool {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        let Some(entry) = state.entries.get_mut(key) else {
            return false;
        };
        let removed = entry.subscribers.remove(&subscriber).is_some();
        if removed && entry.subscribers.is_empty() {
            state.sweep_queue.insert(key.clone());
        }
        removed
    }

    /// Run the `set` function `name`, reply on `outbox`, then invalidate
    ///
    /// Exactly one reply is sent for `id`, whether the call succeeds or not.
    pub async fn set(
        &self,
        id: CorrelationId,
        outbox: &Outbox,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let Some(function) = self.inner.definition.set_fn(name) else {
            let err = EngineError::UnknownFunction {
                kind: FunctionKind::Set,
                name: name.to_string(),
            };
            let _ = outbox.send(ServerMessage::error(id, err.to_string()));
            return Err(err);
        };

        let result = AssertUnwindSafe(function.call(args))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow!("function panicked")));

        match result {
            Ok(ret) => {
                let _ = outbox.send(ServerMessage::value(id, ret.value.clone()));
                self.invalidate(&ret.invalidates);
                Ok(ret.value)
            }
            Err(err) => {
                self.inner.metrics.record_failure();
                warn!(%name, %id, error = %err, "set function failed");
                let err = EngineError::FunctionFailed {
                    kind: FunctionKind::Set,
                    name: name.to_string(),
                    message: format!("{err:#}"),
                };
                let _ = outbox.send(ServerMessage::error(id, err.to_string()));
                Err(err)
            }
        }
    }

    /// Recompute or mark stale every entry registered under any of `tags`
    pub fn invalidate(&self, tags: &[String]) {
        if tags.is_empty() {
            return;
        }

        let jobs: Vec<Job> = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            let mut jobs = Vec::new();
            for key in state.tags.entries_for_any(tags) {
                let Some(entry) = state.entries.get_mut(&key) else {
                    continue;
                };
                entry.epoch += 1;
                if entry.subscribers.is_empty() {
                    entry.state = EntryState::Stale;
                    self.inner.metrics.record_stale();
                } else {
                    self.inner.metrics.record_recompute();
                    jobs.push(entry.begin(&key));
                }
            }
            jobs
        };

        info!(?tags, recomputing = jobs.len(), "invalidated tags");
        for job in jobs {
            self.spawn_job(job);
        }
    }

    /// Collect queued entries that have no subscribers
    ///
    /// Returns the number of entries destroyed.
    pub fn sweep(&self) -> usize {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        let queued = std::mem::take(&mut state.sweep_queue);
        let mut removed = 0;
        for key in queued {
            let orphaned = state
                .entries
                .get(&key)
                .is_some_and(|entry| entry.subscribers.is_empty());
            if !orphaned {
                continue;
            }
            if let Some(entry) = state.entries.remove(&key) {
                state.tags.unregister(&key, &entry.tags);
                removed += 1;
            }
        }

        self.inner.metrics.record_swept(removed);
        if removed > 0 {
            info!(removed, remaining = state.entries.len(), "swept cache entries");
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until the engine is dropped
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                CacheEngine { inner }.sweep();
            }
        })
    }

    /// Inspect the entry for `(name, args)`
    pub fn inspect(&self, name: &str, args: &[Value]) -> Option<EntryInfo> {
        let key = QueryKey::encode(name, args);
        let state = self.inner.state.lock();
        state.entries.get(&key).map(|entry| EntryInfo {
            state: entry.state,
            value: entry.value.clone(),
            subscribers: entry.subscribers.len(),
            tags: entry.tags.clone(),
            queued_for_sweep: state.sweep_queue.contains(&key),
        })
    }

    /// Number of live cache entries
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> EngineStats {
        let state = self.inner.state.lock();
        let subscribed_entries = state
            .entries
            .values()
            .filter(|e| !e.subscribers.is_empty())
            .count();
        let subscriptions: usize = state.entries.values().map(|e| e.subscribers.len()).sum();

        EngineStats {
            entries: state.entries.len(),
            subscribed_entries,
            subscriptions,
            tags: state.tags.tag_count(),
            sweep_queue: state.sweep_queue.len(),
            metrics: self.inner.metrics.snapshot(),
        }
    }

    fn spawn_job(&self, job: Job) {
        let Some(function) = self.inner.definition.get_fn(&job.name) else {
            return;
        };
        let engine = self.clone();
        tokio::spawn(async move { engine.run_job(job, function).await });
    }

    async fn run_job(self, job: Job, function: Arc<dyn GetFunction>) {
        let started = Instant::now();
        let result = AssertUnwindSafe(function.call(job.args.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow!("function panicked")));
        self.finish_job(job, started.elapsed(), result);
    }

    /// Apply a finished computation to its entry
    fn finish_job(&self, job: Job, elapsed: Duration, result: anyhow::Result<GetReturn>) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        let Some(entry) = state
            .entries
            .get_mut(&job.key)
            .filter(|entry| entry.serial == job.serial)
        else {
            debug!(key = %job.key.fingerprint(), "entry collected before its computation finished");
            return;
        };

        // A newer computation owns the entry; only its result may land.
        if entry.started > job.epoch {
            debug!(
                key = %job.key.fingerprint(),
                epoch = job.epoch,
                newest = entry.started,
                "dropped superseded computation"
            );
            return;
        }

        // An invalidation that arrived mid-flight without starting a newer
        // computation found the entry unwatched.
        let superseded = entry.epoch != job.epoch;
        let settled = if superseded {
            EntryState::Stale
        } else {
            EntryState::Ready
        };

        let ret = match result {
            Ok(ret) => ret,
            Err(err) => {
                self.inner.metrics.record_failure();
                warn!(
                    key = %job.key.fingerprint(),
                    name = %job.name,
                    error = %err,
                    "get function failed"
                );
                if entry.value.is_some() {
                    // Keep serving the last good value.
                    entry.state = settled;
                } else {
                    entry.state = EntryState::Failed;
                    entry.push_error(&format!("get function `{}` failed: {err:#}", job.name));
                }
                return;
            }
        };

        self.inner.metrics.record_computation(elapsed);
        entry.state = settled;
        entry.value = Some(ret.value.clone());
        entry.push(&ret.value);
        let old_tags = std::mem::replace(&mut entry.tags, ret.tags.clone());
        state.tags.replace(&job.key, &old_tags, &ret.tags);

        debug!(
            key = %job.key.fingerprint(),
            subscribers = entry.subscribers.len(),
            ?elapsed,
            "computed cache entry"
        );

        let mut jobs = Vec::new();
        for prepared in ret.prepare {
            let name = prepared.name.as_deref().unwrap_or(&job.name);
            if let Some(job) = self.prepare_entry(state, name, prepared.args) {
                jobs.push(job);
            }
        }
        drop(guard);

        for job in jobs {
            self.spawn_job(job);
        }
    }

    /// Create a speculative entry if none exists and queue it for sweeping
    fn prepare_entry(&self, state: &mut EngineState, name: &str, args: Vec<Value>) -> Option<Job> {
        if self.inner.definition.get_fn(name).is_none() {
            warn!(%name, "prepare names an unknown get function");
            return None;
        }

        let key = QueryKey::encode(name, &args);
        if state.entries.contains_key(&key) {
            return None;
        }

        state.next_serial += 1;
        let mut entry = CacheEntry::new(state.next_serial, name, args);
        let job = entry.begin(&key);
        state.entries.insert(key.clone(), entry);
        state.sweep_queue.insert(key.clone());
        self.inner.metrics.record_prepared();
        debug!(key = %key.fingerprint(), %name, "prepared cache entry");
        Some(job)
    }
}
