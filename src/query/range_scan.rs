//! Range scan: returns the live records in an inclusive key range.
//!
//! Each source contributes its matching records; the framework filters
//! out tombstoned and tagged records before `combine` sorts the
//! survivors into one run.

use std::marker::PhantomData;

use crate::buffer::BufferView;
use crate::query::{Query, RangeParams};
use crate::record::{KeyValueRecord, Wrapped};
use crate::shard::SortedShard;

/// Per-shard state: scan bounds resolved during preprocessing.
pub struct ScanShardQuery<K> {
    start: usize,
    upper: K,
}

/// Per-buffer state: the range to scan for.
pub struct ScanBufferQuery<K> {
    lower: K,
    upper: K,
}

pub struct RangeScan<S> {
    _shard: PhantomData<fn(S)>,
}

impl<S> Query<S> for RangeScan<S>
where
    S: SortedShard,
    S::Record: KeyValueRecord,
{
    type Parameters = RangeParams<<S::Record as KeyValueRecord>::Key>;
    type LocalQuery = ScanShardQuery<<S::Record as KeyValueRecord>::Key>;
    type LocalBufferQuery = ScanBufferQuery<<S::Record as KeyValueRecord>::Key>;
    type LocalResult = Wrapped<S::Record>;
    type Result = S::Record;

    fn local_preproc(shard: &S, parms: &Self::Parameters) -> Self::LocalQuery {
        ScanShardQuery {
            start: shard.partition_point(|r| r.key() < &parms.lower),
            upper: parms.upper.clone(),
        }
    }

    fn local_preproc_buffer(
        _view: &BufferView<S::Record>,
        parms: &Self::Parameters,
    ) -> Self::LocalBufferQuery {
        ScanBufferQuery {
            lower: parms.lower.clone(),
            upper: parms.upper.clone(),
        }
    }

    fn local_query(shard: &S, local: &Self::LocalQuery) -> Vec<Wrapped<S::Record>> {
        let mut results = Vec::new();

        let mut idx = local.start;
        while let Some(w) = shard.record_at(idx) {
            if *w.record().key() > local.upper {
                break;
            }
            results.push(w.clone());
            idx += 1;
        }

        results
    }

    fn local_query_buffer(
        view: &BufferView<S::Record>,
        local: &Self::LocalBufferQuery,
    ) -> Vec<Wrapped<S::Record>> {
        let mut results = Vec::new();

        for i in 0..view.record_count() {
            let w = view.get(i);
            let key = w.record().key();
            if *key >= local.lower && *key <= local.upper {
                results.push(w);
            }
        }

        results
    }

    fn combine(
        local_results: Vec<Vec<Wrapped<S::Record>>>,
        _parms: &Self::Parameters,
        output: &mut Vec<S::Record>,
    ) {
        let mut survivors: Vec<S::Record> = local_results
            .into_iter()
            .flatten()
            .map(Wrapped::into_record)
            .collect();
        survivors.sort();

        output.append(&mut survivors);
    }
}
