//! # Epochs
//!
//! An epoch binds one structure version to the set of buffers that were
//! live when the version was installed, forming the consistent snapshot
//! that every in-flight operation works against.
//!
//! ## Lifecycle
//!
//! - *Active*: the current epoch; new jobs register against it.
//! - *Draining*: a successor has been installed; already-started jobs
//!   keep running against this epoch until they finish.
//! - *Retired*: the job counter reached zero and the last handle was
//!   dropped; the epoch releases its buffer pins and structure
//!   reference.
//!
//! ## Buffer pinning
//!
//! On construction an epoch takes one [`BufferView`] per buffer and
//! holds it for its whole lifetime. The pin anchors the buffer head the
//! epoch's snapshot corresponds to: the buffer refuses to advance its
//! head a second time while the pinned old head is still referenced, so
//! no slot reachable from this epoch is recycled until the epoch is
//! retired. Queries take their own fresh views *at the pinned head* so
//! they observe records appended after the epoch was created.


use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::Backoff;
use tracing::trace;

use crate::buffer::{BufferView, MutableBuffer};
use crate::record::Record;
use crate::shard::Shard;
use crate::structure::ExtensionStructure;

/// One buffer attached to an epoch, together with the pinned view that
/// anchors the epoch's snapshot of it.
struct PinnedBuffer<R: Record> {
    buffer: Arc<MutableBuffer<R>>,
    pin: BufferView<R>,
}

/// A consistent `(structure, buffers)` snapshot.
pub struct Epoch<S: Shard> {
    number: usize,
    structure: Arc<ExtensionStructure<S>>,
    buffers: std::sync::RwLock<Vec<PinnedBuffer<S::Record>>>,
    active_jobs: AtomicUsize,
}

impl<S: Shard> Epoch<S> {
    /// Creates an epoch over `structure` and `buffers`, pinning each
    /// buffer at its current head.
    pub fn new(
        number: usize,
        structure: Arc<ExtensionStructure<S>>,
        buffers: Vec<Arc<MutableBuffer<S::Record>>>,
    ) -> Self {
        let pinned = buffers
            .into_iter()
            .map(|buffer| {
                let pin = buffer.view();
                PinnedBuffer { buffer, pin }
            })
            .collect();

        Self {
            number,
            structure,
            buffers: std::sync::RwLock::new(pinned),
            active_jobs: AtomicUsize::new(0),
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn structure(&self) -> &Arc<ExtensionStructure<S>> {
        &self.structure
    }

    /// Registers a job against this epoch; the guard deregisters it on
    /// drop. An epoch is only retired once every guard is gone.
    pub fn start_job(self: &Arc<Self>) -> JobGuard<S> {
        self.active_jobs.fetch_add(1, Ordering::AcqRel);
        JobGuard {
            epoch: Arc::clone(self),
        }
    }

    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::Acquire)
    }

    /// Snapshot of the attached buffers, oldest first.
    pub fn buffers(&self) -> Vec<Arc<MutableBuffer<S::Record>>> {
        self.read_buffers()
            .iter()
            .map(|p| Arc::clone(&p.buffer))
            .collect()
    }

    /// The buffer new appends go to: the most recently attached.
    pub fn active_buffer(&self) -> Arc<MutableBuffer<S::Record>> {
        let buffers = self.read_buffers();
        debug_assert!(!buffers.is_empty());
        Arc::clone(&buffers[buffers.len() - 1].buffer)
    }

    /// Attaches an additional buffer, pinned at its current head. Used
    /// when the draining buffer fills before its flush completes.
    pub fn add_buffer(&self, buffer: Arc<MutableBuffer<S::Record>>) {
        let pin = buffer.view();
        self.write_buffers().push(PinnedBuffer { buffer, pin });
        trace!(epoch = self.number, "attached overflow buffer");
    }

    /// Attaches `buffer` only if the currently active buffer is full.
    /// The check runs under the buffer-list lock, so racing inserters
    /// attach at most one overflow buffer between them.
    pub fn add_buffer_if_full(&self, buffer: Arc<MutableBuffer<S::Record>>) -> bool {
        let mut buffers = self.write_buffers();
        let full = buffers
            .last()
            .is_some_and(|last| last.buffer.is_full());
        if full {
            let pin = buffer.view();
            buffers.push(PinnedBuffer { buffer, pin });
            trace!(epoch = self.number, "attached overflow buffer");
        }
        full
    }

    /// A fresh view over the newest buffer, at this epoch's pinned head.
    pub fn buffer_view(&self) -> BufferView<S::Record> {
        let buffers = self.read_buffers();
        debug_assert!(!buffers.is_empty());
        let pinned = &buffers[buffers.len() - 1];
        Self::view_at_pin(pinned)
    }

    /// Fresh views over every attached buffer, oldest buffer first.
    pub fn buffer_views_oldest_first(&self) -> Vec<BufferView<S::Record>> {
        self.read_buffers().iter().map(Self::view_at_pin).collect()
    }

    /// Fresh views over every attached buffer, newest buffer first.
    pub fn buffer_views_newest_first(&self) -> Vec<BufferView<S::Record>> {
        self.read_buffers()
            .iter()
            .rev()
            .map(Self::view_at_pin)
            .collect()
    }

    /// Total records visible through this epoch's buffers.
    pub fn buffer_record_count(&self) -> usize {
        self.buffer_views_oldest_first()
            .iter()
            .map(|v| v.record_count())
            .sum()
    }

    fn view_at_pin(pinned: &PinnedBuffer<S::Record>) -> BufferView<S::Record> {
        // The pin keeps its head acquirable for the epoch's lifetime.
        // Acquisition can still miss transiently in the middle of a
        // head advancement, between the head swap and the old-head
        // store; retry until the pinned head is reachable again.
        let backoff = Backoff::new();
        loop {
            if let Some(view) = pinned.buffer.view_at(pinned.pin.head()) {
                return view;
            }
            backoff.spin();
        }
    }

    fn read_buffers(&self) -> std::sync::RwLockReadGuard<'_, Vec<PinnedBuffer<S::Record>>> {
        self.buffers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_buffers(&self) -> std::sync::RwLockWriteGuard<'_, Vec<PinnedBuffer<S::Record>>> {
        self.buffers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<S: Shard> Drop for Epoch<S> {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.active_jobs.load(Ordering::Acquire),
            0,
            "epoch dropped with active jobs"
        );
        trace!(epoch = self.number, "epoch retired");
    }
}

/// Keeps an epoch's job counter raised for the duration of one query or
/// reconstruction.
pub struct JobGuard<S: Shard> {
    epoch: Arc<Epoch<S>>,
}

impl<S: Shard> JobGuard<S> {
    pub fn epoch(&self) -> &Arc<Epoch<S>> {
        &self.epoch
    }
}

impl<S: Shard> Drop for JobGuard<S> {
    fn drop(&mut self) {
        self.epoch.active_jobs.fetch_sub(1, Ordering::AcqRel);
    }
}
