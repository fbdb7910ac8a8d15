//! Point lookup by key, for indexes with unique keys.
//!
//! Runs with `EARLY_ABORT`: sources are probed newest-first and the
//! first source holding any version of the key settles the answer.
//! Within a buffer the scan also runs newest-first, so of several
//! versions of a key the most recent append wins. The query reconciles
//! deletes itself in `combine` — a tombstone or tagged hit resolves to
//! an empty result — and opts out of the framework's delete filter,
//! whose content-only tombstone match cannot tell a reinserted record
//! apart from an already-cancelled one carrying the same key and value.

use std::marker::PhantomData;

use crate::buffer::BufferView;
use crate::query::Query;
use crate::record::{KeyValueRecord, Wrapped};
use crate::shard::SortedShard;

/// The key to look up.
#[derive(Debug, Clone)]
pub struct PointParams<K> {
    pub key: K,
}

/// Per-shard state: the position of the first record with the key.
pub struct PointShardQuery<K> {
    start: usize,
    key: K,
}

/// Per-buffer state: just the key to scan for.
pub struct PointBufferQuery<K> {
    key: K,
}

pub struct PointLookup<S> {
    _shard: PhantomData<fn(S)>,
}

impl<S> Query<S> for PointLookup<S>
where
    S: SortedShard,
    S::Record: KeyValueRecord,
{
    type Parameters = PointParams<<S::Record as KeyValueRecord>::Key>;
    type LocalQuery = PointShardQuery<<S::Record as KeyValueRecord>::Key>;
    type LocalBufferQuery = PointBufferQuery<<S::Record as KeyValueRecord>::Key>;
    type LocalResult = Wrapped<S::Record>;
    type Result = S::Record;

    const EARLY_ABORT: bool = true;
    const SKIP_DELETE_FILTER: bool = true;

    fn local_preproc(shard: &S, parms: &Self::Parameters) -> Self::LocalQuery {
        PointShardQuery {
            start: shard.partition_point(|r| r.key() < &parms.key),
            key: parms.key.clone(),
        }
    }

    fn local_preproc_buffer(
        _view: &BufferView<S::Record>,
        parms: &Self::Parameters,
    ) -> Self::LocalBufferQuery {
        PointBufferQuery {
            key: parms.key.clone(),
        }
    }

    fn local_query(shard: &S, local: &Self::LocalQuery) -> Vec<Wrapped<S::Record>> {
        match shard.record_at(local.start) {
            Some(w) if *w.record().key() == local.key => vec![w.clone()],
            _ => Vec::new(),
        }
    }

    fn local_query_buffer(
        view: &BufferView<S::Record>,
        local: &Self::LocalBufferQuery,
    ) -> Vec<Wrapped<S::Record>> {
        // Newest-first: the buffer may hold several versions of the key
        // (a record, its tombstone, a reinsert), and the latest append
        // is the authoritative one.
        for i in (0..view.record_count()).rev() {
            let w = view.get(i);
            if *w.record().key() == local.key {
                return vec![w];
            }
        }

        Vec::new()
    }

    fn combine(
        local_results: Vec<Vec<Wrapped<S::Record>>>,
        _parms: &Self::Parameters,
        output: &mut Vec<S::Record>,
    ) {
        for results in local_results {
            if let Some(first) = results.into_iter().next() {
                if !first.is_deleted() && !first.is_tombstone() {
                    output.push(first.into_record());
                }
                return;
            }
        }
    }
}
