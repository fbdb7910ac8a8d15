//! Range count over an inclusive key range.
//!
//! Each source reports how many live records and how many tombstones it
//! holds in the range; the combined count is `records - tombstones`,
//! relying on every tombstone in the range cancelling exactly one record
//! in the range. The query reconciles deletes itself, so it opts out of
//! the framework's per-record delete filter.

use std::marker::PhantomData;

use crate::buffer::BufferView;
use crate::query::{LocalResult, Query, RangeParams};
use crate::record::{KeyValueRecord, Record};
use crate::shard::SortedShard;

/// Counts from one source.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountResult {
    pub records: u64,
    pub tombstones: u64,
}

impl<R: Record> LocalResult<R> for CountResult {
    fn is_deleted(&self) -> bool {
        false
    }

    fn is_tombstone(&self) -> bool {
        false
    }

    fn record(&self) -> Option<&R> {
        None
    }
}

/// Per-shard state: scan bounds resolved during preprocessing.
pub struct CountShardQuery<K> {
    start: usize,
    upper: K,
}

/// Per-buffer state: the range to scan for.
pub struct CountBufferQuery<K> {
    lower: K,
    upper: K,
}

pub struct RangeCount<S> {
    _shard: PhantomData<fn(S)>,
}

impl<S> Query<S> for RangeCount<S>
where
    S: SortedShard,
    S::Record: KeyValueRecord,
{
    type Parameters = RangeParams<<S::Record as KeyValueRecord>::Key>;
    type LocalQuery = CountShardQuery<<S::Record as KeyValueRecord>::Key>;
    type LocalBufferQuery = CountBufferQuery<<S::Record as KeyValueRecord>::Key>;
    type LocalResult = CountResult;
    type Result = u64;

    const SKIP_DELETE_FILTER: bool = true;

    fn local_preproc(shard: &S, parms: &Self::Parameters) -> Self::LocalQuery {
        CountShardQuery {
            start: shard.partition_point(|r| r.key() < &parms.lower),
            upper: parms.upper.clone(),
        }
    }

    fn local_preproc_buffer(
        _view: &BufferView<S::Record>,
        parms: &Self::Parameters,
    ) -> Self::LocalBufferQuery {
        CountBufferQuery {
            lower: parms.lower.clone(),
            upper: parms.upper.clone(),
        }
    }

    fn local_query(shard: &S, local: &Self::LocalQuery) -> Vec<CountResult> {
        let mut counts = CountResult::default();

        let mut idx = local.start;
        while let Some(w) = shard.record_at(idx) {
            if *w.record().key() > local.upper {
                break;
            }
            if !w.is_deleted() {
                if w.is_tombstone() {
                    counts.tombstones += 1;
                } else {
                    counts.records += 1;
                }
            }
            idx += 1;
        }

        vec![counts]
    }

    fn local_query_buffer(
        view: &BufferView<S::Record>,
        local: &Self::LocalBufferQuery,
    ) -> Vec<CountResult> {
        let mut counts = CountResult::default();

        for i in 0..view.record_count() {
            let w = view.get(i);
            let key = w.record().key();
            if *key < local.lower || *key > local.upper || w.is_deleted() {
                continue;
            }
            if w.is_tombstone() {
                counts.tombstones += 1;
            } else {
                counts.records += 1;
            }
        }

        vec![counts]
    }

    fn combine(
        local_results: Vec<Vec<CountResult>>,
        _parms: &Self::Parameters,
        output: &mut Vec<u64>,
    ) {
        let mut records = 0u64;
        let mut tombstones = 0u64;
        for source in local_results.iter().flatten() {
            records += source.records;
            tombstones += source.tombstones;
        }

        output.push(records.saturating_sub(tombstones));
    }
}
