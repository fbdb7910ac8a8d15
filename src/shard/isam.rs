//! A sorted-array shard with a sparse separator index, in the style of a
//! static ISAM tree.
//!
//! Records are stored in one contiguous sorted run. A separator vector
//! holds the first record of every block of [`BLOCK_FANOUT`] records;
//! lookups binary-search the separators to find the block, then
//! binary-search within it. Tombstones are additionally summarized in a
//! Bloom filter so that delete checks can skip shards that definitely
//! hold no matching tombstone.

use bloomfilter::Bloom;

use crate::buffer::BufferView;
use crate::merge::{sorted_merge, sorted_run_from_view};
use crate::record::{Record, Wrapped};
use crate::shard::{Shard, SortedShard};

/// Records per separator block.
const BLOCK_FANOUT: usize = 128;

/// False-positive rate for the per-shard tombstone filter.
const TOMBSTONE_FILTER_FPR: f64 = 0.01;

pub struct IsamShard<R: Record> {
    data: Vec<Wrapped<R>>,
    separators: Vec<R>,
    tombstone_filter: Option<Bloom<R>>,
    tombstone_cnt: usize,
}

impl<R: Record> IsamShard<R> {
    fn build(data: Vec<Wrapped<R>>, tombstone_filter: Option<Bloom<R>>, tombstone_cnt: usize) -> Self {
        let separators = data
            .chunks(BLOCK_FANOUT)
            .map(|block| block[0].record().clone())
            .collect();

        Self {
            data,
            separators,
            tombstone_filter,
            tombstone_cnt,
        }
    }

    fn tombstone_filter_for(expected_tombstones: usize) -> Option<Bloom<R>> {
        Bloom::new_for_fp_rate(expected_tombstones.max(1), TOMBSTONE_FILTER_FPR).ok()
    }

    /// The underlying sorted run. Exposed for sibling merges and query
    /// implementations that walk ranges directly.
    pub fn records(&self) -> &[Wrapped<R>] {
        &self.data
    }

    /// Index of the first record whose block may contain `rec`.
    fn block_start(&self, rec: &R) -> usize {
        // First separator > rec, minus one block: rec cannot sort before
        // the first record of the preceding block.
        let block = self.separators.partition_point(|sep| sep <= rec);
        block.saturating_sub(1) * BLOCK_FANOUT
    }
}

impl<R: Record> Shard for IsamShard<R> {
    type Record = R;

    fn from_buffer_view(view: &BufferView<R>) -> Self {
        let mut filter = Self::tombstone_filter_for(view.tombstone_count());
        let (data, stats) = sorted_run_from_view(view, filter.as_mut());

        Self::build(data, filter, stats.tombstone_count)
    }

    fn from_shards(shards: &[&Self]) -> Self {
        let expected: usize = shards.iter().map(|s| s.tombstone_count()).sum();
        let mut filter = Self::tombstone_filter_for(expected);

        let runs: Vec<&[Wrapped<R>]> = shards.iter().map(|s| s.records()).collect();
        let (data, stats) = sorted_merge(&runs, filter.as_mut());

        Self::build(data, filter, stats.tombstone_count)
    }

    fn point_lookup(&self, rec: &R, filter_hint: bool) -> Option<&Wrapped<R>> {
        if filter_hint {
            if let Some(filter) = &self.tombstone_filter {
                if !filter.check(rec) {
                    return None;
                }
            }
        }

        let start = self.block_start(rec);
        let offset = self.data[start..].partition_point(|w| w.record() < rec);
        let candidate = self.data.get(start + offset)?;

        (candidate.record() == rec).then_some(candidate)
    }

    fn record_count(&self) -> usize {
        self.data.len()
    }

    fn tombstone_count(&self) -> usize {
        self.tombstone_cnt
    }

    fn memory_usage(&self) -> usize {
        self.data.capacity() * std::mem::size_of::<Wrapped<R>>()
    }

    fn aux_memory_usage(&self) -> usize {
        let filter_bytes = self
            .tombstone_filter
            .as_ref()
            .map(|f| f.as_slice().len())
            .unwrap_or(0);
        filter_bytes + self.separators.capacity() * std::mem::size_of::<R>()
    }
}

impl<R: Record> SortedShard for IsamShard<R> {
    fn record_at(&self, idx: usize) -> Option<&Wrapped<R>> {
        self.data.get(idx)
    }

    fn partition_point<F>(&self, pred: F) -> usize
    where
        F: Fn(&R) -> bool,
    {
        self.data.partition_point(|w| pred(w.record()))
    }
}
