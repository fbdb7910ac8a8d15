//! # Mutable Buffer
//!
//! A bounded, lock-free append buffer that absorbs inserts ahead of the
//! shard hierarchy, plus reference-counted snapshot views over it.
//!
//! ## Layout
//!
//! The buffer is a circular array of `2 * HWM` slots indexed by unbounded
//! counters modulo the capacity. Three atomics define the live window:
//!
//! - `tail` — next append position; fetch-incremented by writers.
//! - `head` — `{index, refcount}` pair: start of the live window and the
//!   number of views pinned to it.
//! - `old_head` — the previous head, still carrying the views that were
//!   pinned when the head last advanced.
//!
//! ## Design Invariants
//!
//! - `old_head.idx <= head.idx <= tail` once the head has advanced at
//!   least once (`old_head` starts at a sentinel index that matches no
//!   real view target).
//! - `tail - head.idx <= HWM`: appends fail rather than overrun.
//! - Each head advancement moves the window forward by at most `HWM`
//!   records, so `tail - old_head.idx <= 2 * HWM = capacity` and a slot is
//!   never rewritten while any view can still reach it.
//! - The head advances at most once per reconstruction, and never while
//!   `old_head` still has a nonzero refcount.
//! - A slot's record is published by a release store of its `visible`
//!   header bit; readers check the bit with acquire ordering before
//!   touching the record.

#[cfg(test)]
mod tests;

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bloomfilter::Bloom;
use crossbeam::utils::Backoff;
use tracing::trace;

use crate::record::{DELETED, Record, TIMESTAMP_MASK, TIMESTAMP_SHIFT, TOMBSTONE, VISIBLE, Wrapped};

/// A slot is published for logical index `idx` once its visible bit is
/// set *and* its timestamp matches `idx`: the timestamp check rejects the
/// stale header left over from the previous pass of the window across
/// the slot.
#[inline]
fn slot_published(header: u32, idx: usize) -> bool {
    header & VISIBLE != 0 && (header >> TIMESTAMP_SHIFT) == (idx as u32 & TIMESTAMP_MASK)
}

/// False-positive rate for the tombstone prefilter.
const TOMBSTONE_FILTER_FPR: f64 = 0.01;

// ------------------------------------------------------------------------------------------------
// Packed {index, refcount} head representation
// ------------------------------------------------------------------------------------------------

/// Low 16 bits: refcount. High 48 bits: index.
const REFCNT_BITS: u32 = 16;
const REFCNT_MASK: u64 = (1 << REFCNT_BITS) - 1;

#[inline]
fn pack(idx: usize, refcnt: u64) -> u64 {
    debug_assert!(refcnt <= REFCNT_MASK);
    ((idx as u64) << REFCNT_BITS) | refcnt
}

#[inline]
fn unpack(raw: u64) -> (usize, u64) {
    ((raw >> REFCNT_BITS) as usize, raw & REFCNT_MASK)
}

// ------------------------------------------------------------------------------------------------
// Slots
// ------------------------------------------------------------------------------------------------

/// One circular-array cell: an atomic header and the record payload.
///
/// The payload is written exactly once per pass of the window over the
/// slot, strictly before the release store that sets `visible` in the
/// header; readers load the header with acquire ordering first.
struct Slot<R> {
    header: std::sync::atomic::AtomicU32,
    rec: UnsafeCell<Option<R>>,
}

impl<R> Slot<R> {
    fn empty() -> Self {
        Self {
            header: std::sync::atomic::AtomicU32::new(0),
            rec: UnsafeCell::new(None),
        }
    }
}

// SAFETY: the record cell is only written by the single appender that won
// the slot via the tail CAS, before the visible bit is published, and only
// read after an acquire load observes the visible bit. Window discipline
// (`tail - old_head.idx <= capacity`) guarantees no writer reuses a slot
// while a view can still index it.
unsafe impl<R: Send + Sync> Sync for Slot<R> {}

// ------------------------------------------------------------------------------------------------
// MutableBuffer
// ------------------------------------------------------------------------------------------------

/// The lock-free append buffer.
///
/// # Concurrency
///
/// - Appends are wait-free on the success path: one CAS on `tail`, one
///   slot write, one header store.
/// - Views pin the head they were created against via the packed
///   refcount; destruction releases the pin.
/// - Head advancement is exclusive (an in-progress flag) and refuses to
///   run while the previous head still has pinned views.
pub struct MutableBuffer<R: Record> {
    lwm: usize,
    hwm: usize,
    cap: usize,

    tail: AtomicUsize,
    head: AtomicU64,
    old_head: AtomicU64,

    slots: Box<[Slot<R>]>,

    tombstone_filter: Mutex<Option<Bloom<R>>>,
    tombstone_cnt: AtomicUsize,

    advance_in_progress: AtomicBool,
}

impl<R: Record> MutableBuffer<R> {
    /// Creates a buffer with the given watermarks and a physical capacity
    /// of `2 * high_watermark`.
    ///
    /// # Panics
    ///
    /// If `low_watermark >= high_watermark` or `high_watermark == 0`;
    /// these are checked once by configuration validation.
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        assert!(high_watermark > 0);
        assert!(low_watermark < high_watermark);

        let cap = 2 * high_watermark;
        let slots = (0..cap).map(|_| Slot::empty()).collect::<Vec<_>>();

        // `old_head` starts at an index no view can target before the
        // first advancement (real targets start at 0), so acquisition
        // never pins the not-yet-meaningful old head.
        Self {
            lwm: low_watermark,
            hwm: high_watermark,
            cap,
            tail: AtomicUsize::new(0),
            head: AtomicU64::new(pack(0, 0)),
            old_head: AtomicU64::new(pack(high_watermark, 0)),
            slots: slots.into_boxed_slice(),
            tombstone_filter: Mutex::new(
                Bloom::new_for_fp_rate(high_watermark, TOMBSTONE_FILTER_FPR).ok(),
            ),
            tombstone_cnt: AtomicUsize::new(0),
            advance_in_progress: AtomicBool::new(false),
        }
    }

    /// Appends a record, optionally as a tombstone.
    ///
    /// Returns `false` without blocking when the buffer is at its high
    /// watermark; the caller is expected to retry after a flush drains
    /// the buffer. On success the record is visible to every view whose
    /// frozen tail lies past its slot.
    pub fn append(&self, rec: R, tombstone: bool) -> bool {
        let Some(tail) = self.try_advance_tail() else {
            return false;
        };

        if tombstone {
            self.tombstone_cnt.fetch_add(1, Ordering::Relaxed);
            let mut filter = self
                .tombstone_filter
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(filter) = filter.as_mut() {
                filter.set(&rec);
            }
        }

        let slot = &self.slots[tail % self.cap];

        // SAFETY: winning the tail CAS grants exclusive write access to
        // this slot until the window laps it, which the capacity invariant
        // rules out while any reader can reach index `tail`.
        unsafe {
            *slot.rec.get() = Some(rec);
        }

        let mut header = (tail as u32) << TIMESTAMP_SHIFT;
        if tombstone {
            header |= TOMBSTONE;
        }

        // Publish: the release store pairs with readers' acquire loads.
        slot.header.store(header | VISIBLE, Ordering::Release);

        true
    }

    /// Claims the next append position, or `None` when the occupied
    /// window has reached the high watermark.
    fn try_advance_tail(&self) -> Option<usize> {
        let backoff = Backoff::new();

        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            let (head_idx, _) = unpack(self.head.load(Ordering::Acquire));

            // The two loads are not a single snapshot; a concurrent head
            // advancement can make `head_idx` pass the stale `tail`, in
            // which case the CAS below fails and we reload.
            if tail.saturating_sub(head_idx) >= self.hwm {
                return None;
            }

            match self
                .tail
                .compare_exchange_weak(tail, tail + 1, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Some(tail),
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Takes a view pinned to the current head. Retries internally if the
    /// head moves between the load and the pin.
    pub fn view(self: &Arc<Self>) -> BufferView<R> {
        loop {
            let (target, _) = unpack(self.head.load(Ordering::Acquire));
            if let Some(view) = self.view_at(target) {
                return view;
            }
        }
    }

    /// Takes a view pinned to `target_head`, which must be the index held
    /// by either `head` or `old_head`. Returns `None` when neither
    /// matches; callers then retry against the current head.
    pub fn view_at(self: &Arc<Self>, target_head: usize) -> Option<BufferView<R>> {
        let head = self.acquire_head(target_head)?;

        Some(BufferView {
            buffer: Arc::clone(self),
            head,
            tail: self.tail.load(Ordering::Acquire),
            approx_tombstones: self.tombstone_cnt.load(Ordering::Relaxed),
        })
    }

    /// Increments the refcount of whichever head currently holds
    /// `target`, preferring `old_head` as the original advancement
    /// machinery does.
    fn acquire_head(&self, target: usize) -> Option<usize> {
        let backoff = Backoff::new();

        loop {
            let old = self.old_head.load(Ordering::Acquire);
            let (old_idx, old_refs) = unpack(old);
            if old_idx == target {
                if self
                    .old_head
                    .compare_exchange(old, pack(old_idx, old_refs + 1), Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return Some(old_idx);
                }
                backoff.spin();
                continue;
            }

            let cur = self.head.load(Ordering::Acquire);
            let (idx, refs) = unpack(cur);
            if idx == target {
                if self
                    .head
                    .compare_exchange(cur, pack(idx, refs + 1), Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return Some(idx);
                }
                backoff.spin();
                continue;
            }

            return None;
        }
    }

    /// Releases one reference on the head a view was pinned to. The pin
    /// may have migrated from `head` into `old_head` via an advancement
    /// in the meantime; the index match finds it either way.
    fn release_head(&self, head: usize) {
        let backoff = Backoff::new();

        loop {
            let old = self.old_head.load(Ordering::Acquire);
            let (old_idx, old_refs) = unpack(old);
            if old_idx == head {
                if old_refs == 0 {
                    // Mid-advancement: the pin is being carried over.
                    backoff.spin();
                    continue;
                }
                if self
                    .old_head
                    .compare_exchange(old, pack(old_idx, old_refs - 1), Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            } else {
                let cur = self.head.load(Ordering::Acquire);
                let (idx, refs) = unpack(cur);
                if refs == 0 {
                    backoff.spin();
                    continue;
                }
                if self
                    .head
                    .compare_exchange(cur, pack(idx, refs - 1), Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            }
            backoff.spin();
        }
    }

    /// Advances the head to `new_head` after a reconstruction has
    /// consumed the prefix `[head, new_head)`.
    ///
    /// The current head (with whatever pins it carries) becomes
    /// `old_head`. Refuses and returns `false` while the previous
    /// `old_head` still has pinned views, or while another advancement is
    /// in flight; the flush path retries.
    pub fn advance_head(&self, new_head: usize) -> bool {
        let (cur_idx, _) = unpack(self.head.load(Ordering::Acquire));
        debug_assert!(new_head <= self.tail.load(Ordering::Acquire));

        if new_head == cur_idx {
            return true;
        }
        debug_assert!(new_head > cur_idx);

        let (_, old_refs) = unpack(self.old_head.load(Ordering::Acquire));
        if old_refs > 0 {
            trace!(new_head, old_refs, "refusing head advance: old head still referenced");
            return false;
        }

        if self.advance_in_progress.swap(true, Ordering::AcqRel) {
            return false;
        }

        let replacement = pack(new_head, 0);
        let mut cur = self.head.load(Ordering::Acquire);
        loop {
            match self
                .head
                .compare_exchange(cur, replacement, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(previous) => {
                    // Carry the demoted head, pins and all, into old_head.
                    self.old_head.store(previous, Ordering::Release);
                    break;
                }
                Err(current) => cur = current,
            }
        }

        self.advance_in_progress.store(false, Ordering::Release);
        true
    }

    // --------------------------------------------------------------------------------------------
    // Occupancy and statistics
    // --------------------------------------------------------------------------------------------

    /// Number of records in the live window `[head, tail)`.
    pub fn record_count(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let (head, _) = unpack(self.head.load(Ordering::Acquire));
        tail.saturating_sub(head)
    }

    pub fn is_full(&self) -> bool {
        self.record_count() >= self.hwm
    }

    pub fn is_at_low_watermark(&self) -> bool {
        self.record_count() >= self.lwm
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstone_cnt.load(Ordering::Relaxed)
    }

    pub fn low_watermark(&self) -> usize {
        self.lwm
    }

    pub fn high_watermark(&self) -> usize {
        self.hwm
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn tail(&self) -> usize {
        self.tail.load(Ordering::Acquire)
    }

    pub fn head(&self) -> usize {
        unpack(self.head.load(Ordering::Acquire)).0
    }

    /// Physical slots not currently occupied. Counts from `old_head` when
    /// it is still referenced, since those slots cannot be reused yet.
    pub fn available_capacity(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let (old_idx, old_refs) = unpack(self.old_head.load(Ordering::Acquire));
        if old_refs == 0 {
            let (head, _) = unpack(self.head.load(Ordering::Acquire));
            self.cap - tail.saturating_sub(head)
        } else {
            self.cap - tail.saturating_sub(old_idx)
        }
    }

    /// Bytes used by the slot array.
    pub fn memory_usage(&self) -> usize {
        self.cap * std::mem::size_of::<Slot<R>>()
    }

    /// Bytes used by the tombstone filter.
    pub fn aux_memory_usage(&self) -> usize {
        self.tombstone_filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|f| f.as_slice().len())
            .unwrap_or(0)
    }

    /// Tags the first record in the live window matching `rec` as
    /// deleted. Convenience wrapper over a transient view.
    pub fn delete_record(self: &Arc<Self>, rec: &R) -> bool {
        self.view().delete_record(rec)
    }

    /// Checks whether a tombstone for `rec` exists in the live window.
    pub fn check_tombstone(self: &Arc<Self>, rec: &R) -> bool {
        self.view().check_tombstone(rec)
    }

    fn filter_maybe_contains(&self, rec: &R) -> bool {
        self.tombstone_filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|f| f.check(rec))
            .unwrap_or(true)
    }
}

// ------------------------------------------------------------------------------------------------
// BufferView
// ------------------------------------------------------------------------------------------------

/// An immutable window onto a buffer's range `[head, tail)`, with `tail`
/// frozen at creation.
///
/// Holds one pinned reference on the buffer head it was created against;
/// the reference is released on drop. While any view is pinned to
/// `old_head`, the buffer refuses further head advancement, so every slot
/// a view can reach stays intact for the view's lifetime.
pub struct BufferView<R: Record> {
    buffer: Arc<MutableBuffer<R>>,
    head: usize,
    tail: usize,
    approx_tombstones: usize,
}

impl<R: Record> BufferView<R> {
    /// Number of records visible through this view.
    pub fn record_count(&self) -> usize {
        self.tail - self.head
    }

    /// Upper bound on the number of tombstones in the view; the count and
    /// the tail are fetched separately at creation.
    pub fn tombstone_count(&self) -> usize {
        self.approx_tombstones
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Returns a snapshot of the record at offset `i` from the view head.
    ///
    /// Appends between the tail fetch-increment and the visibility store
    /// are momentarily pre-visible; this spins out the nanoseconds until
    /// the publishing store lands rather than exposing a torn slot.
    ///
    /// # Panics
    ///
    /// If `i >= record_count()`.
    pub fn get(&self, i: usize) -> Wrapped<R> {
        assert!(i < self.record_count());
        let idx = self.head + i;
        let slot = &self.buffer.slots[idx % self.buffer.cap];

        let backoff = Backoff::new();
        loop {
            let header = slot.header.load(Ordering::Acquire);
            if slot_published(header, idx) {
                // SAFETY: the acquire load of the visible bit orders this
                // read after the appender's slot write; pinned views keep
                // the slot from being recycled underneath us.
                if let Some(rec) = unsafe { (*slot.rec.get()).clone() } {
                    return Wrapped::with_header(rec, header);
                }
            }
            backoff.snooze();
        }
    }

    /// Iterates snapshots of every record in the view, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = Wrapped<R>> + '_ {
        (0..self.record_count()).map(|i| self.get(i))
    }

    /// Tags the first record matching `rec` as deleted. Returns whether a
    /// match was found.
    pub fn delete_record(&self, rec: &R) -> bool {
        for i in 0..self.record_count() {
            let idx = self.head + i;
            let slot = &self.buffer.slots[idx % self.buffer.cap];
            let header = slot.header.load(Ordering::Acquire);
            if !slot_published(header, idx) {
                continue;
            }
            // SAFETY: visible bit observed with acquire ordering; see get().
            let matches = unsafe { (*slot.rec.get()).as_ref() == Some(rec) };
            if matches {
                slot.header.fetch_or(DELETED, Ordering::AcqRel);
                return true;
            }
        }

        false
    }

    /// Checks for a tombstone matching `rec`: Bloom prefilter first, then
    /// a linear scan of the view.
    pub fn check_tombstone(&self, rec: &R) -> bool {
        if !self.buffer.filter_maybe_contains(rec) {
            return false;
        }

        for i in 0..self.record_count() {
            let idx = self.head + i;
            let slot = &self.buffer.slots[idx % self.buffer.cap];
            let header = slot.header.load(Ordering::Acquire);
            if !slot_published(header, idx) || header & TOMBSTONE == 0 {
                continue;
            }
            // SAFETY: visible bit observed with acquire ordering; see get().
            if unsafe { (*slot.rec.get()).as_ref() == Some(rec) } {
                return true;
            }
        }

        false
    }
}

impl<R: Record> Drop for BufferView<R> {
    fn drop(&mut self) {
        self.buffer.release_head(self.head);
    }
}
