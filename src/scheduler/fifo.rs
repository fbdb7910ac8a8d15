//! The pooled FIFO scheduler.
//!
//! Jobs land on one queue in submission order; a fixed pool of workers
//! drains it. Excess jobs wait in the queue until a worker frees up.
//! Shutdown lets every queued job finish before the workers exit.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender, unbounded};
use tracing::{debug, warn};

use crate::scheduler::{Job, JobKind, Scheduler, SchedulerStats, StatsSnapshot, Task};

const DEFAULT_WORKERS: usize = 8;

enum Message {
    Run(Task),
    Shutdown,
}

pub struct FifoScheduler {
    sender: Sender<Message>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    memory_budget: usize,
    seq: AtomicU64,
    stats: Arc<SchedulerStats>,
    shutdown: AtomicBool,
}

impl FifoScheduler {
    /// The advisory memory budget this scheduler was configured with.
    /// `0` means unlimited; the budget does not currently gate
    /// admission.
    pub fn memory_budget(&self) -> usize {
        self.memory_budget
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    fn worker_loop(receiver: Receiver<Message>, stats: Arc<SchedulerStats>) {
        while let Ok(message) = receiver.recv() {
            match message {
                Message::Run(task) => task.run(&stats),
                Message::Shutdown => break,
            }
        }
    }
}

impl Scheduler for FifoScheduler {
    fn new(memory_budget: usize, worker_count: usize) -> Self {
        let worker_count = if worker_count == 0 {
            DEFAULT_WORKERS
        } else {
            worker_count
        };

        let (sender, receiver) = unbounded();
        let stats = Arc::new(SchedulerStats::default());

        let workers = (0..worker_count)
            .map(|i| {
                let receiver = receiver.clone();
                let stats = Arc::clone(&stats);
                std::thread::Builder::new()
                    .name(format!("dynamis-worker-{i}"))
                    .spawn(move || Self::worker_loop(receiver, stats))
                    .expect("spawning scheduler worker")
            })
            .collect();

        debug!(worker_count, memory_budget, "started FIFO scheduler");

        Self {
            sender,
            workers: Mutex::new(workers),
            worker_count,
            memory_budget,
            seq: AtomicU64::new(0),
            stats,
            shutdown: AtomicBool::new(false),
        }
    }

    fn schedule(&self, job: Job, estimated_size: usize, kind: JobKind) {
        if self.shutdown.load(Ordering::Acquire) {
            warn!(?kind, "job submitted after shutdown; dropping");
            return;
        }

        let task = Task {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            kind,
            estimated_size,
            job,
        };

        if self.sender.send(Message::Run(task)).is_err() {
            warn!(?kind, "scheduler queue closed; dropping job");
        }
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        // Shutdown messages queue behind all pending work, so the queue
        // drains before the workers exit.
        for _ in 0..self.worker_count {
            let _ = self.sender.send(Message::Shutdown);
        }

        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for worker in workers.drain(..) {
            if worker.join().is_err() {
                warn!("scheduler worker panicked");
            }
        }

        debug!("FIFO scheduler stopped");
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for FifoScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
