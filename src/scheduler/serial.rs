//! The serial scheduler shim.
//!
//! Runs every job inline on the caller's thread, blocking until it
//! completes. Strictly for single-threaded operation and deterministic
//! tests; never use it where callers submit jobs concurrently.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::scheduler::{Job, JobKind, Scheduler, SchedulerStats, StatsSnapshot, Task};

pub struct SerialScheduler {
    seq: AtomicU64,
    stats: SchedulerStats,
}

impl Scheduler for SerialScheduler {
    fn new(_memory_budget: usize, _worker_count: usize) -> Self {
        Self {
            seq: AtomicU64::new(0),
            stats: SchedulerStats::default(),
        }
    }

    fn schedule(&self, job: Job, estimated_size: usize, kind: JobKind) {
        let task = Task {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            kind,
            estimated_size,
            job,
        };
        task.run(&self.stats);
    }

    fn shutdown(&self) {}

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
