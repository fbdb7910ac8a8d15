//! # Queries
//!
//! A query type describes how one logical query fans out over the pieces
//! of an epoch — every shard in the structure plus the buffer views — and
//! how the per-source results combine into a final answer.
//!
//! ## Execution shape
//!
//! 1. `local_preproc` / `local_preproc_buffer` build per-source state.
//! 2. `distribute_query` adjusts the local queries in place with global
//!    knowledge (e.g. apportioning a sample budget across shards).
//! 3. `local_query` / `local_query_buffer` run per source.
//! 4. The framework optionally filters deleted records out of the local
//!    results (skipped when [`Query::SKIP_DELETE_FILTER`] is set).
//! 5. `combine` folds all local results into the output.
//! 6. `repeat` may adjust the local queries and request another pass.
//!
//! With [`Query::EARLY_ABORT`] set, execution stops at the first source
//! whose (filtered) local result is non-empty — the point-lookup
//! optimization.

#[cfg(test)]
mod tests;

pub mod point_lookup;
pub mod range_count;
pub mod range_scan;

pub use point_lookup::{PointLookup, PointParams};
pub use range_count::{CountResult, RangeCount};
pub use range_scan::RangeScan;

use crate::buffer::BufferView;
use crate::record::{Record, Wrapped};
use crate::shard::Shard;

// ------------------------------------------------------------------------------------------------
// Local results
// ------------------------------------------------------------------------------------------------

/// Capabilities the framework needs from a per-source result entry.
///
/// `record` exposes the record a result refers to, when there is one;
/// aggregate results (counts, sums) return `None` and must opt out of
/// framework delete filtering, which needs the record to search for
/// matching tombstones.
pub trait LocalResult<R: Record>: Send {
    fn is_deleted(&self) -> bool;
    fn is_tombstone(&self) -> bool;
    fn record(&self) -> Option<&R>;
}

impl<R: Record> LocalResult<R> for Wrapped<R> {
    fn is_deleted(&self) -> bool {
        Wrapped::is_deleted(self)
    }

    fn is_tombstone(&self) -> bool {
        Wrapped::is_tombstone(self)
    }

    fn record(&self) -> Option<&R> {
        Some(Wrapped::record(self))
    }
}

// ------------------------------------------------------------------------------------------------
// Query contract
// ------------------------------------------------------------------------------------------------

/// The query contract over a shard type `S`.
///
/// All hooks are associated functions: a query type carries no state of
/// its own, and per-execution state lives in the local query objects.
pub trait Query<S: Shard>: Send + Sync + 'static {
    /// Caller-supplied parameters for one query execution.
    type Parameters: Send + 'static;

    /// Per-shard local state.
    type LocalQuery: Send;

    /// Per-buffer-view local state.
    type LocalBufferQuery: Send;

    /// One entry of a per-source result.
    type LocalResult: LocalResult<S::Record>;

    /// One entry of the final result.
    type Result: Send + 'static;

    /// Stop at the first source with a non-empty (filtered) result.
    const EARLY_ABORT: bool = false;

    /// The query reconciles deletes itself; the framework must not
    /// filter its local results.
    const SKIP_DELETE_FILTER: bool = false;

    /// Builds the local query for one shard.
    fn local_preproc(shard: &S, parms: &Self::Parameters) -> Self::LocalQuery;

    /// Builds the local query for one buffer view. The view passed here
    /// is the same one later handed to
    /// [`local_query_buffer`](Query::local_query_buffer).
    fn local_preproc_buffer(view: &BufferView<S::Record>, parms: &Self::Parameters)
    -> Self::LocalBufferQuery;

    /// Adjusts the local queries in place with global knowledge. The
    /// default does nothing.
    fn distribute_query(
        parms: &Self::Parameters,
        local_queries: &mut [Self::LocalQuery],
        buffer_queries: &mut [Self::LocalBufferQuery],
    ) {
        let _ = (parms, local_queries, buffer_queries);
    }

    /// Answers the local query against one shard.
    fn local_query(shard: &S, local: &Self::LocalQuery) -> Vec<Self::LocalResult>;

    /// Answers the local query against one buffer view.
    fn local_query_buffer(
        view: &BufferView<S::Record>,
        local: &Self::LocalBufferQuery,
    ) -> Vec<Self::LocalResult>;

    /// Folds all per-source results into the output vector, in place.
    fn combine(
        local_results: Vec<Vec<Self::LocalResult>>,
        parms: &Self::Parameters,
        output: &mut Vec<Self::Result>,
    );

    /// Inspects the combined result and decides whether to run another
    /// pass with adjusted local queries. The default never repeats.
    fn repeat(
        parms: &Self::Parameters,
        output: &mut Vec<Self::Result>,
        local_queries: &mut [Self::LocalQuery],
        buffer_queries: &mut [Self::LocalBufferQuery],
    ) -> bool {
        let _ = (parms, output, local_queries, buffer_queries);
        false
    }
}

// ------------------------------------------------------------------------------------------------
// Shared parameter types
// ------------------------------------------------------------------------------------------------

/// Inclusive key range, shared by the range queries.
#[derive(Debug, Clone)]
pub struct RangeParams<K> {
    pub lower: K,
    pub upper: K,
}
