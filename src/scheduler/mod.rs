//! # Scheduling
//!
//! Reconstructions and queries run as jobs handed to a scheduler. Two
//! implementations share one contract:
//!
//! - [`FifoScheduler`] — a worker pool draining a FIFO queue; jobs run
//!   concurrently, in submission order, bounded by the pool size.
//! - [`SerialScheduler`] — runs every job inline on the caller's
//!   thread; deterministic, for single-threaded operation and tests.
//!
//! Both record per-kind statistics (job counts, cumulative and maximum
//! latencies) that feed scheduling diagnostics.

#[cfg(test)]
mod tests;

pub mod fifo;
pub mod serial;

pub use fifo::FifoScheduler;
pub use serial::SerialScheduler;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// ------------------------------------------------------------------------------------------------
// Jobs and tasks
// ------------------------------------------------------------------------------------------------

/// A unit of scheduled work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// What a job does, for statistics and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Query,
    Reconstruction,
}

/// A job queued with its submission timestamp and an estimate of the
/// data volume it will touch (advisory, for memory budgeting).
pub struct Task {
    pub seq: u64,
    pub kind: JobKind,
    pub estimated_size: usize,
    pub job: Job,
}

impl Task {
    /// Runs the job, recording its latency into `stats`.
    pub(crate) fn run(self, stats: &SchedulerStats) {
        let start = std::time::Instant::now();
        (self.job)();
        stats.record(self.kind, start.elapsed());
    }
}

// ------------------------------------------------------------------------------------------------
// Scheduler contract
// ------------------------------------------------------------------------------------------------

/// The scheduler contract: accept jobs, execute them, report stats.
pub trait Scheduler: Send + Sync + 'static {
    /// Creates a scheduler. `memory_budget` is advisory (`0` =
    /// unlimited); `worker_count` of `0` selects the implementation's
    /// default.
    fn new(memory_budget: usize, worker_count: usize) -> Self;

    /// Enqueues a job. Jobs of either kind share one queue and run in
    /// submission order as workers free up.
    fn schedule(&self, job: Job, estimated_size: usize, kind: JobKind);

    /// Drains the queue and stops the workers. Idempotent. Jobs
    /// submitted after shutdown are dropped.
    fn shutdown(&self);

    /// Snapshot of accumulated statistics.
    fn stats(&self) -> StatsSnapshot;
}

// ------------------------------------------------------------------------------------------------
// Statistics
// ------------------------------------------------------------------------------------------------

/// Lock-free accumulators for per-kind job statistics.
#[derive(Default)]
pub struct SchedulerStats {
    query_count: AtomicU64,
    query_total_ns: AtomicU64,
    query_max_ns: AtomicU64,

    reconstruction_count: AtomicU64,
    reconstruction_total_ns: AtomicU64,
    reconstruction_max_ns: AtomicU64,
}

impl SchedulerStats {
    pub fn record(&self, kind: JobKind, elapsed: Duration) {
        let ns = elapsed.as_nanos() as u64;
        let (count, total, max) = match kind {
            JobKind::Query => (&self.query_count, &self.query_total_ns, &self.query_max_ns),
            JobKind::Reconstruction => (
                &self.reconstruction_count,
                &self.reconstruction_total_ns,
                &self.reconstruction_max_ns,
            ),
        };

        count.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(ns, Ordering::Relaxed);
        max.fetch_max(ns, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            query_count: self.query_count.load(Ordering::Relaxed),
            query_total: Duration::from_nanos(self.query_total_ns.load(Ordering::Relaxed)),
            query_max: Duration::from_nanos(self.query_max_ns.load(Ordering::Relaxed)),
            reconstruction_count: self.reconstruction_count.load(Ordering::Relaxed),
            reconstruction_total: Duration::from_nanos(
                self.reconstruction_total_ns.load(Ordering::Relaxed),
            ),
            reconstruction_max: Duration::from_nanos(
                self.reconstruction_max_ns.load(Ordering::Relaxed),
            ),
        }
    }
}

/// A point-in-time copy of scheduler statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub query_count: u64,
    pub query_total: Duration,
    pub query_max: Duration,
    pub reconstruction_count: u64,
    pub reconstruction_total: Duration,
    pub reconstruction_max: Duration,
}

impl StatsSnapshot {
    pub fn query_avg(&self) -> Duration {
        if self.query_count == 0 {
            Duration::ZERO
        } else {
            self.query_total / self.query_count as u32
        }
    }

    pub fn reconstruction_avg(&self) -> Duration {
        if self.reconstruction_count == 0 {
            Duration::ZERO
        } else {
            self.reconstruction_total / self.reconstruction_count as u32
        }
    }
}
