//! # Shards
//!
//! A shard is an immutable data structure bulk-built from a sorted run of
//! records. The framework only ever constructs shards — from a buffer
//! view at flush time, or from sibling shards during a reconstruction —
//! and asks them for point lookups and statistics; everything else about
//! their internals is up to the implementation.
//!
//! [`IsamShard`] is the reference implementation: a sorted array with a
//! sparse separator index and a tombstone Bloom filter.


pub mod isam;

pub use isam::IsamShard;

use std::cmp::Ordering;

use crate::buffer::BufferView;
use crate::record::{Record, Wrapped};

// ------------------------------------------------------------------------------------------------
// Shard contract
// ------------------------------------------------------------------------------------------------

/// The contract every shard type must satisfy.
///
/// Shards are immutable once built, with one exception: the deleted bit
/// in a record's header may be set in place through the reference
/// returned by [`point_lookup`](Shard::point_lookup), which is how tag
/// deletes reach records that have already left the buffer.
pub trait Shard: Send + Sync + Sized + 'static {
    type Record: Record;

    /// Builds a shard from the records of a buffer view (flush to L0).
    fn from_buffer_view(view: &BufferView<Self::Record>) -> Self;

    /// Builds a shard combining several sibling shards (reconstruction).
    fn from_shards(shards: &[&Self]) -> Self;

    /// Looks up a record equal to `rec`. With `filter_hint` set, the
    /// shard may consult its tombstone filter first and return `None`
    /// without searching.
    fn point_lookup(&self, rec: &Self::Record, filter_hint: bool) -> Option<&Wrapped<Self::Record>>;

    /// Number of records stored, tombstones included.
    fn record_count(&self) -> usize;

    /// Number of tombstones stored. `0` if tombstones are not in use.
    fn tombstone_count(&self) -> usize;

    /// Bytes used by the primary structure and raw data.
    fn memory_usage(&self) -> usize;

    /// Bytes used by auxiliary structures (filters, indexes).
    fn aux_memory_usage(&self) -> usize;
}

/// Shards whose records are accessible in sorted order by position.
pub trait SortedShard: Shard {
    /// The record at position `idx`, or `None` past the end.
    fn record_at(&self, idx: usize) -> Option<&Wrapped<Self::Record>>;

    /// Position of the first record for which `pred` returns `false`.
    /// `pred` must partition the shard: `true` for a prefix, `false` for
    /// the remainder.
    fn partition_point<F>(&self, pred: F) -> usize
    where
        F: Fn(&Self::Record) -> bool,
    {
        let mut lo = 0;
        let mut hi = self.record_count();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.record_at(mid) {
                Some(w) if pred(w.record()) => lo = mid + 1,
                _ => hi = mid,
            }
        }
        lo
    }

    /// Position of the first record ordered `>= rec`.
    fn lower_bound(&self, rec: &Self::Record) -> usize {
        self.partition_point(|r| r.cmp(rec) == Ordering::Less)
    }

    /// Position of the first record ordered `> rec`.
    fn upper_bound(&self, rec: &Self::Record) -> usize {
        self.partition_point(|r| r.cmp(rec) != Ordering::Greater)
    }
}
