//! # Dynamic Extension
//!
//! The top-level dynamized index: a mutable buffer absorbing inserts, a
//! shard hierarchy absorbing flushes, and an epoch chain giving every
//! in-flight operation a consistent snapshot of both.
//!
//! ## Write path
//!
//! Inserts append to the active buffer. Crossing the low watermark
//! schedules a flush; reaching the high watermark makes appends fail
//! until the flush drains the buffer ([`DynamicExtension::insert`]
//! retries internally, [`DynamicExtension::try_insert`] surfaces the
//! failure). While a full buffer drains, a fresh buffer is attached to
//! the epoch so inserts keep landing.
//!
//! ## Flush pipeline
//!
//! A flush job (1) freezes a view of the oldest buffer, (2) plans the
//! reconstructions L0 needs against a scratch state, (3) executes them
//! on a private clone of the structure, (4) flushes the view into L0,
//! (5) repairs any tombstone-density violations with follow-up
//! compaction plans, (6) advances the buffer head past the flushed
//! prefix, and (7) installs the result as the successor epoch. The
//! predecessor retires once its last job finishes.
//!
//! ## Read path
//!
//! Queries are scheduled jobs pinned to the epoch current at submission.
//! They fan out over the epoch's buffers (newest first) and every shard
//! (levels shallow to deep, newest shard first within a level), filter
//! deleted records unless the query opts out, combine per-source
//! results, and resolve a completion channel the caller holds as a
//! [`QueryHandle`].

#[cfg(test)]
mod tests;

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};

use crossbeam::channel::{Receiver, bounded};
use crossbeam::utils::Backoff;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::buffer::{BufferView, MutableBuffer};
use crate::config::{ConfigError, DeletePolicy, ExtensionConfig};
use crate::epoch::Epoch;
use crate::query::{LocalResult, Query};
use crate::scheduler::{FifoScheduler, JobKind, Scheduler, StatsSnapshot};
use crate::shard::Shard;
use crate::structure::{ExtensionStructure, ShardId};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the extension's public API.
#[derive(Debug, Error)]
pub enum ExtensionError {
    /// Rejected configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// A scheduled query failed to produce a result (its worker died or the
/// scheduler shut down before it ran).
#[derive(Debug, Error)]
#[error("query aborted before completion")]
pub struct QueryError;

// ------------------------------------------------------------------------------------------------
// Query handle
// ------------------------------------------------------------------------------------------------

/// The caller's side of a scheduled query: a completion channel that
/// resolves once the query job finishes.
pub struct QueryHandle<T> {
    receiver: Receiver<Vec<T>>,
}

impl<T> QueryHandle<T> {
    /// Blocks until the query resolves.
    pub fn get(self) -> Result<Vec<T>, QueryError> {
        self.receiver.recv().map_err(|_| QueryError)
    }

    /// Returns the result if the query has already resolved.
    pub fn try_get(&self) -> Option<Vec<T>> {
        self.receiver.try_recv().ok()
    }
}

// ------------------------------------------------------------------------------------------------
// DynamicExtension
// ------------------------------------------------------------------------------------------------

/// A dynamized index over shard type `S`, queried by `Q`, scheduled by
/// `SCHED`.
///
/// Cloning produces another handle to the same index.
pub struct DynamicExtension<S, Q, SCHED = FifoScheduler>
where
    S: Shard,
    Q: Query<S>,
    SCHED: Scheduler,
{
    inner: Arc<ExtensionInner<S, SCHED>>,
    _query: PhantomData<fn(Q)>,
}

impl<S, Q, SCHED> Clone for DynamicExtension<S, Q, SCHED>
where
    S: Shard,
    Q: Query<S>,
    SCHED: Scheduler,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _query: PhantomData,
        }
    }
}

struct ExtensionInner<S: Shard, SCHED> {
    config: ExtensionConfig,
    scheduler: SCHED,

    /// The active epoch. Installation swaps the pointer under the write
    /// lock; readers clone the `Arc` under the read lock.
    current: RwLock<Arc<Epoch<S>>>,

    /// Latest installed epoch number, paired with the condition variable
    /// so `await_next_epoch` never misses an installation.
    epoch_number: Mutex<usize>,
    epoch_installed: Condvar,

    /// At most one flush may be planned or running at a time.
    flush_in_flight: AtomicBool,
}

impl<S, Q, SCHED> DynamicExtension<S, Q, SCHED>
where
    S: Shard,
    Q: Query<S>,
    SCHED: Scheduler,
{
    /// Builds an empty index from a validated configuration.
    pub fn new(config: ExtensionConfig) -> Result<Self, ExtensionError> {
        config.validate()?;

        let buffer = Arc::new(MutableBuffer::new(config.buffer_lwm, config.buffer_hwm));
        let structure = Arc::new(ExtensionStructure::new(
            config.layout_policy,
            config.buffer_hwm,
            config.scale_factor,
            config.max_delete_proportion,
        ));
        let epoch = Arc::new(Epoch::new(0, structure, vec![buffer]));

        let scheduler = SCHED::new(config.memory_budget, config.worker_threads);

        info!(
            lwm = config.buffer_lwm,
            hwm = config.buffer_hwm,
            scale = config.scale_factor,
            layout = ?config.layout_policy,
            deletes = ?config.delete_policy,
            "opened dynamic extension"
        );

        Ok(Self {
            inner: Arc::new(ExtensionInner {
                config,
                scheduler,
                current: RwLock::new(epoch),
                epoch_number: Mutex::new(0),
                epoch_installed: Condvar::new(),
                flush_in_flight: AtomicBool::new(false),
            }),
            _query: PhantomData,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Inserts a record, retrying internally while the buffer is full
    /// and a flush drains it. Returns `true` once the record is in the
    /// active buffer.
    pub fn insert(&self, rec: S::Record) -> bool {
        self.append_retrying(&rec, false)
    }

    /// A single append attempt: `false` when the buffer is at its high
    /// watermark. A flush is scheduled either way; callers own the
    /// retry.
    pub fn try_insert(&self, rec: S::Record) -> bool {
        self.inner.try_append(&rec, false)
    }

    /// Erases a record. Under tagging, finds the record and sets its
    /// deleted bit, returning whether a match was found; under
    /// tombstones, appends a tombstone record and returns `true`.
    pub fn erase(&self, rec: S::Record) -> bool {
        match self.inner.config.delete_policy {
            DeletePolicy::Tagging => {
                let epoch = self.inner.current_epoch();
                let _job = epoch.start_job();

                // Hold views over every buffer while the structure is
                // searched, so a concurrent flush cannot move the record
                // out from under the walk.
                let views = epoch.buffer_views_newest_first();

                if epoch.structure().tagged_delete(&rec) {
                    return true;
                }
                views.iter().any(|view| view.delete_record(&rec))
            }
            DeletePolicy::Tombstone => self.append_retrying(&rec, true),
        }
    }

    fn append_retrying(&self, rec: &S::Record, tombstone: bool) -> bool {
        let backoff = Backoff::new();
        while !self.inner.try_append(rec, tombstone) {
            backoff.snooze();
        }
        true
    }

    // --------------------------------------------------------------------------------------------
    // Queries
    // --------------------------------------------------------------------------------------------

    /// Schedules a query against the current epoch and returns a handle
    /// that resolves when the job completes.
    pub fn query(&self, parms: Q::Parameters) -> QueryHandle<Q::Result> {
        let epoch = self.inner.current_epoch();
        let job = epoch.start_job();
        let policy = self.inner.config.delete_policy;

        let (sender, receiver) = bounded(1);
        self.inner.scheduler.schedule(
            Box::new(move || {
                let result = run_query::<S, Q>(job.epoch(), &parms, policy);
                let _ = sender.send(result);
                drop(job);
            }),
            0,
            JobKind::Query,
        );

        QueryHandle { receiver }
    }

    // --------------------------------------------------------------------------------------------
    // Epoch control
    // --------------------------------------------------------------------------------------------

    /// Blocks until the work currently buffered or scheduled has
    /// produced a new active epoch. Returns immediately when there is
    /// neither a flush in flight nor anything buffered to flush.
    pub fn await_next_epoch(&self) {
        let start = *self.inner.lock_epoch_number();

        if !self.inner.flush_in_flight.load(Ordering::Acquire) {
            if self.inner.current_epoch().buffer_record_count() == 0 {
                return;
            }
            self.inner.schedule_flush();
        }

        let mut number = self.inner.lock_epoch_number();
        while *number <= start {
            number = self
                .inner
                .epoch_installed
                .wait(number)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Flattens the current epoch — every level plus the buffered
    /// records — into a single shard.
    pub fn create_static_structure(&self) -> S {
        let epoch = self.inner.current_epoch();
        let _job = epoch.start_job();

        // Deepest level first, so older runs precede newer ones the
        // same way they do in any reconstruction merge.
        let mut shards: Vec<S> = Vec::new();
        for level in epoch.structure().levels().iter().rev() {
            if let Some(shard) = level.combined_shard() {
                shards.push(shard);
            }
        }
        for view in epoch.buffer_views_oldest_first() {
            if view.record_count() > 0 {
                shards.push(S::from_buffer_view(&view));
            }
        }

        let refs: Vec<&S> = shards.iter().collect();
        S::from_shards(&refs)
    }

    // --------------------------------------------------------------------------------------------
    // Introspection
    // --------------------------------------------------------------------------------------------

    /// Records reachable through the current epoch, tombstones included.
    pub fn record_count(&self) -> usize {
        let epoch = self.inner.current_epoch();
        epoch.buffer_record_count() + epoch.structure().record_count()
    }

    /// Tombstones reachable through the current epoch.
    pub fn tombstone_count(&self) -> usize {
        let epoch = self.inner.current_epoch();
        let buffered: usize = epoch
            .buffer_views_oldest_first()
            .iter()
            .map(|v| v.tombstone_count())
            .sum();
        buffered + epoch.structure().tombstone_count()
    }

    /// Number of levels in the current structure.
    pub fn height(&self) -> usize {
        self.inner.current_epoch().structure().height()
    }

    /// Bytes held by shard data and buffer slots.
    pub fn memory_usage(&self) -> usize {
        let epoch = self.inner.current_epoch();
        let buffers: usize = epoch.buffers().iter().map(|b| b.memory_usage()).sum();
        buffers + epoch.structure().memory_usage()
    }

    /// Bytes held by auxiliary structures (filters, separator indexes).
    pub fn aux_memory_usage(&self) -> usize {
        let epoch = self.inner.current_epoch();
        let buffers: usize = epoch.buffers().iter().map(|b| b.aux_memory_usage()).sum();
        buffers + epoch.structure().aux_memory_usage()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.inner.config.buffer_hwm
    }

    /// Whether every level of the current structure satisfies the
    /// tombstone-density bound. Exposed for verification.
    pub fn validate_tombstone_proportion(&self) -> bool {
        self.inner
            .current_epoch()
            .structure()
            .validate_tombstone_proportion()
    }

    /// Scheduler statistics for the index.
    pub fn scheduler_stats(&self) -> StatsSnapshot {
        self.inner.scheduler.stats()
    }

    /// The scheduler itself, for diagnostics.
    pub fn scheduler(&self) -> &SCHED {
        &self.inner.scheduler
    }

    /// Drains outstanding work and stops the worker pool. Queries
    /// submitted afterwards resolve with [`QueryError`].
    pub fn shutdown(&self) {
        self.inner.scheduler.shutdown();
        info!("dynamic extension shut down");
    }
}

// ------------------------------------------------------------------------------------------------
// Inner: insert path and the flush pipeline
// ------------------------------------------------------------------------------------------------

impl<S, SCHED> ExtensionInner<S, SCHED>
where
    S: Shard,
    SCHED: Scheduler,
{
    fn current_epoch(&self) -> Arc<Epoch<S>> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn lock_epoch_number(&self) -> std::sync::MutexGuard<'_, usize> {
        self.epoch_number
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn try_append(self: &Arc<Self>, rec: &S::Record, tombstone: bool) -> bool {
        let epoch = self.current_epoch();
        let buffer = epoch.active_buffer();

        if buffer.append(rec.clone(), tombstone) {
            if buffer.is_at_low_watermark() {
                self.schedule_flush();
            }
            return true;
        }

        // Full buffer: make sure a flush is coming, and keep absorbing
        // into a fresh buffer while the full one drains.
        self.schedule_flush();

        if self.flush_in_flight.load(Ordering::Acquire) {
            let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
            current.add_buffer_if_full(Arc::new(MutableBuffer::new(
                self.config.buffer_lwm,
                self.config.buffer_hwm,
            )));
        }

        false
    }

    /// Schedules a flush unless one is already planned or running.
    fn schedule_flush(self: &Arc<Self>) {
        if self.flush_in_flight.swap(true, Ordering::AcqRel) {
            return;
        }

        let estimated = self
            .current_epoch()
            .buffers()
            .first()
            .map(|b| b.record_count())
            .unwrap_or(0);

        let inner = Arc::clone(self);
        self.scheduler.schedule(
            Box::new(move || Self::run_flush(&inner)),
            estimated,
            JobKind::Reconstruction,
        );
    }

    /// The flush job: drain the oldest buffer into a privately rebuilt
    /// structure and install the result as the successor epoch.
    fn run_flush(self: &Arc<Self>) {
        let predecessor = self.current_epoch();
        let job = predecessor.start_job();

        let buffers = predecessor.buffers();
        debug_assert!(!buffers.is_empty());
        let buffer = Arc::clone(&buffers[0]);

        let view = buffer.view();
        let frozen_tail = view.tail();
        let flushed = view.record_count();

        let successor_structure = if flushed == 0 {
            // Nothing to drain; the successor shares the structure.
            drop(view);
            Arc::clone(predecessor.structure())
        } else {
            let mut structure = (**predecessor.structure()).clone();
            let mut scratch = structure.state().clone();

            let plan = structure.plan_flush(flushed, &mut scratch);
            for task in plan {
                structure.execute_task(&task);
            }
            structure.flush_buffer(&view);
            drop(view);

            // Repair any tombstone-density violations before the new
            // version becomes visible.
            while !structure.validate_tombstone_proportion() {
                let plan = structure.plan_compactions();
                if plan.is_empty() {
                    break;
                }
                debug!(tasks = plan.len(), "running follow-up compaction");
                for task in plan {
                    structure.execute_task(&task);
                }
            }

            // Release the drained prefix. Refused while views from the
            // previous epoch remain; they drain as those queries finish.
            let backoff = Backoff::new();
            while !buffer.advance_head(frozen_tail) {
                backoff.snooze();
            }

            Arc::new(structure)
        };

        // Install the successor. Buffer attachment takes the same lock,
        // so the snapshot cannot miss a concurrently attached buffer.
        let number;
        {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            number = predecessor.number() + 1;

            let mut successor_buffers = predecessor.buffers();
            if successor_buffers.len() > 1 {
                // Drained and emptied buffers are dropped; the newest
                // stays regardless, as the insert target.
                let last = successor_buffers.len() - 1;
                let mut index = 0;
                successor_buffers.retain(|b| {
                    let keep = index == last || b.record_count() > 0;
                    index += 1;
                    keep
                });
            }

            let successor = Arc::new(Epoch::new(number, successor_structure, successor_buffers));
            *current = successor;
        }

        trace!(epoch = number, flushed, "installed successor epoch");

        {
            let mut installed = self.lock_epoch_number();
            *installed = number;
            self.flush_in_flight.store(false, Ordering::Release);
            self.epoch_installed.notify_all();
        }

        drop(job);
    }
}

// ------------------------------------------------------------------------------------------------
// Query execution
// ------------------------------------------------------------------------------------------------

/// Runs one query against an epoch snapshot: fan out, filter, combine,
/// and optionally repeat.
fn run_query<S, Q>(epoch: &Arc<Epoch<S>>, parms: &Q::Parameters, policy: DeletePolicy) -> Vec<Q::Result>
where
    S: Shard,
    Q: Query<S>,
{
    let views = epoch.buffer_views_newest_first();
    let structure: &ExtensionStructure<S> = epoch.structure().as_ref();

    // Probe order is newest data first: levels shallow to deep, and
    // within a level the newest shard first. A tombstone never sits
    // deeper than the record it cancels, so an early-aborting query
    // always meets an uncancelled tombstone before the record it
    // shadows.
    let mut shards: Vec<(ShardId, &S)> = Vec::new();
    for (level_idx, level) in structure.levels().iter().enumerate() {
        for (shard_idx, shard) in level.shards().iter().enumerate().rev() {
            shards.push((
                ShardId {
                    level: level_idx,
                    shard: shard_idx,
                },
                shard.as_ref(),
            ));
        }
    }

    let mut local_queries: Vec<Q::LocalQuery> = shards
        .iter()
        .map(|(_, shard)| Q::local_preproc(shard, parms))
        .collect();
    let mut buffer_queries: Vec<Q::LocalBufferQuery> = views
        .iter()
        .map(|view| Q::local_preproc_buffer(view, parms))
        .collect();

    Q::distribute_query(parms, &mut local_queries, &mut buffer_queries);

    let mut output = Vec::new();
    loop {
        let mut all_results: Vec<Vec<Q::LocalResult>> =
            Vec::with_capacity(views.len() + shards.len());
        let mut aborted = false;

        // Buffers first, newest first: the freshest version of a record
        // is seen before any stale one.
        for (view, local) in views.iter().zip(buffer_queries.iter()) {
            let mut results = Q::local_query_buffer(view, local);
            if !Q::SKIP_DELETE_FILTER {
                filter_deletes::<S, Q>(&mut results, None, &views, structure, policy);
            }
            let hit = !results.is_empty();
            all_results.push(results);
            if Q::EARLY_ABORT && hit {
                aborted = true;
                break;
            }
        }

        if !aborted {
            for ((shard_id, shard), local) in shards.iter().zip(local_queries.iter()) {
                let mut results = Q::local_query(shard, local);
                if !Q::SKIP_DELETE_FILTER {
                    filter_deletes::<S, Q>(&mut results, Some(*shard_id), &views, structure, policy);
                }
                let hit = !results.is_empty();
                all_results.push(results);
                if Q::EARLY_ABORT && hit {
                    break;
                }
            }
        }

        Q::combine(all_results, parms, &mut output);

        if !Q::repeat(parms, &mut output, &mut local_queries, &mut buffer_queries) {
            break;
        }
    }

    output
}

/// Framework-level delete filtering of one source's local results.
///
/// Tagging reduces to the deleted bit. Tombstone filtering searches for
/// a matching tombstone wherever one could legally sit: any buffer, any
/// level above the source, or a newer shard on the source's own level.
/// Buffer-sourced results only consult the buffers, since a tombstone
/// never sits deeper than the record it cancels.
fn filter_deletes<S, Q>(
    results: &mut Vec<Q::LocalResult>,
    source: Option<ShardId>,
    views: &[BufferView<S::Record>],
    structure: &ExtensionStructure<S>,
    policy: DeletePolicy,
) where
    S: Shard,
    Q: Query<S>,
{
    if policy == DeletePolicy::Tagging {
        results.retain(|r| !r.is_deleted());
        return;
    }

    let levels = structure.levels();
    results.retain(|result| {
        if result.is_tombstone() {
            return false;
        }
        let Some(rec) = result.record() else {
            return true;
        };

        if views.iter().any(|view| view.check_tombstone(rec)) {
            return false;
        }

        if let Some(id) = source {
            for level in &levels[..id.level] {
                if level.check_tombstone(0, rec) {
                    return false;
                }
            }
            if levels[id.level].check_tombstone(id.shard + 1, rec) {
                return false;
            }
        }

        true
    });
}
