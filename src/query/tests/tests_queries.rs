//! Direct tests of the query hooks against shards and buffer views,
//! outside the full fan-out machinery.

use std::sync::Arc;

use crate::buffer::MutableBuffer;
use crate::query::{PointLookup, PointParams, Query, RangeCount, RangeParams, RangeScan};
use crate::record::KvPair;
use crate::shard::{IsamShard, Shard};

type Rec = KvPair<u64, u64>;
type TestShard = IsamShard<Rec>;

fn rec(key: u64) -> Rec {
    KvPair { key, value: key }
}

fn shard_from_keys(keys: &[u64]) -> TestShard {
    let buf = Arc::new(MutableBuffer::<Rec>::new(1, keys.len().max(2)));
    for &key in keys {
        assert!(buf.append(rec(key), false));
    }
    IsamShard::from_buffer_view(&buf.view())
}

// ------------------------------------------------------------------------------------------------
// Point lookup
// ------------------------------------------------------------------------------------------------

#[test]
fn point_lookup_hits_shard() {
    let shard = shard_from_keys(&[10, 20, 30]);
    let parms = PointParams { key: 20u64 };

    let local = <PointLookup<TestShard> as Query<TestShard>>::local_preproc(&shard, &parms);
    let results = <PointLookup<TestShard> as Query<TestShard>>::local_query(&shard, &local);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].record().key, 20);
}

#[test]
fn point_lookup_misses_cleanly() {
    let shard = shard_from_keys(&[10, 20, 30]);
    let parms = PointParams { key: 25u64 };

    let local = <PointLookup<TestShard> as Query<TestShard>>::local_preproc(&shard, &parms);
    let results = <PointLookup<TestShard> as Query<TestShard>>::local_query(&shard, &local);
    assert!(results.is_empty());
}

#[test]
fn point_lookup_scans_buffer() {
    let buf = Arc::new(MutableBuffer::<Rec>::new(1, 8));
    buf.append(rec(7), false);
    let view = buf.view();

    let parms = PointParams { key: 7u64 };
    let local =
        <PointLookup<TestShard> as Query<TestShard>>::local_preproc_buffer(&view, &parms);
    let results =
        <PointLookup<TestShard> as Query<TestShard>>::local_query_buffer(&view, &local);
    assert_eq!(results.len(), 1);
}

#[test]
fn point_lookup_combine_respects_status_bits() {
    let shard = shard_from_keys(&[5]);
    let parms = PointParams { key: 5u64 };
    let local = <PointLookup<TestShard> as Query<TestShard>>::local_preproc(&shard, &parms);
    let results = <PointLookup<TestShard> as Query<TestShard>>::local_query(&shard, &local);

    // A tagged hit yields an empty combined result.
    results[0].set_delete();
    let mut output = Vec::new();
    <PointLookup<TestShard> as Query<TestShard>>::combine(vec![results], &parms, &mut output);
    assert!(output.is_empty());
}

// ------------------------------------------------------------------------------------------------
// Range count
// ------------------------------------------------------------------------------------------------

#[test]
fn range_count_counts_shard_range() {
    let shard = shard_from_keys(&(0..100).collect::<Vec<_>>());
    let parms = RangeParams { lower: 10u64, upper: 19 };

    let local = <RangeCount<TestShard> as Query<TestShard>>::local_preproc(&shard, &parms);
    let results = <RangeCount<TestShard> as Query<TestShard>>::local_query(&shard, &local);
    assert_eq!(results[0].records, 10);
    assert_eq!(results[0].tombstones, 0);
}

#[test]
fn range_count_subtracts_tombstones_in_combine() {
    let buf = Arc::new(MutableBuffer::<Rec>::new(1, 16));
    for key in 0..8 {
        buf.append(rec(key), false);
    }
    // Tombstones for keys that live in some deeper source.
    buf.append(rec(2), true);
    buf.append(rec(5), true);
    let view = buf.view();

    let parms = RangeParams { lower: 0u64, upper: 7 };
    let local =
        <RangeCount<TestShard> as Query<TestShard>>::local_preproc_buffer(&view, &parms);
    let results =
        <RangeCount<TestShard> as Query<TestShard>>::local_query_buffer(&view, &local);

    let mut output = Vec::new();
    <RangeCount<TestShard> as Query<TestShard>>::combine(vec![results], &parms, &mut output);
    assert_eq!(output, vec![6]); // 8 records - 2 tombstones
}

#[test]
fn range_count_skips_tagged_records() {
    let shard = shard_from_keys(&[1, 2, 3]);
    shard.point_lookup(&rec(2), false).unwrap().set_delete();

    let parms = RangeParams { lower: 1u64, upper: 3 };
    let local = <RangeCount<TestShard> as Query<TestShard>>::local_preproc(&shard, &parms);
    let results = <RangeCount<TestShard> as Query<TestShard>>::local_query(&shard, &local);
    assert_eq!(results[0].records, 2);
}

#[test]
fn range_count_empty_range() {
    let shard = shard_from_keys(&[1, 2, 3]);
    let parms = RangeParams { lower: 50u64, upper: 60 };

    let local = <RangeCount<TestShard> as Query<TestShard>>::local_preproc(&shard, &parms);
    let results = <RangeCount<TestShard> as Query<TestShard>>::local_query(&shard, &local);
    assert_eq!(results[0].records, 0);
}

// ------------------------------------------------------------------------------------------------
// Range scan
// ------------------------------------------------------------------------------------------------

#[test]
fn range_scan_returns_bounds_inclusive() {
    let shard = shard_from_keys(&(0..50).collect::<Vec<_>>());
    let parms = RangeParams { lower: 10u64, upper: 15 };

    let local = <RangeScan<TestShard> as Query<TestShard>>::local_preproc(&shard, &parms);
    let results = <RangeScan<TestShard> as Query<TestShard>>::local_query(&shard, &local);
    let keys: Vec<u64> = results.iter().map(|w| w.record().key).collect();
    assert_eq!(keys, vec![10, 11, 12, 13, 14, 15]);
}

#[test]
fn range_scan_combine_sorts_across_sources() {
    let a = shard_from_keys(&[1, 5, 9]);
    let b = shard_from_keys(&[2, 6]);
    let parms = RangeParams { lower: 0u64, upper: 10 };

    let ra = <RangeScan<TestShard> as Query<TestShard>>::local_query(
        &a,
        &<RangeScan<TestShard> as Query<TestShard>>::local_preproc(&a, &parms),
    );
    let rb = <RangeScan<TestShard> as Query<TestShard>>::local_query(
        &b,
        &<RangeScan<TestShard> as Query<TestShard>>::local_preproc(&b, &parms),
    );

    let mut output = Vec::new();
    <RangeScan<TestShard> as Query<TestShard>>::combine(vec![ra, rb], &parms, &mut output);
    let keys: Vec<u64> = output.iter().map(|r| r.key).collect();
    assert_eq!(keys, vec![1, 2, 5, 6, 9]);
}
