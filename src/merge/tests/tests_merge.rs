//! Sorted-merge semantics: ordering, cancellation, delete filtering,
//! filter population.

use std::sync::Arc;

use bloomfilter::Bloom;

use crate::buffer::MutableBuffer;
use crate::merge::{MergeIterator, sorted_merge, sorted_run_from_view};
use crate::record::{KvPair, TIMESTAMP_SHIFT, TOMBSTONE, VISIBLE, Wrapped};

type Rec = KvPair<u64, u64>;

fn rec(key: u64) -> Rec {
    KvPair { key, value: key }
}

fn live(key: u64, ts: u32) -> Wrapped<Rec> {
    Wrapped::with_header(rec(key), (ts << TIMESTAMP_SHIFT) | VISIBLE)
}

fn tombstone(key: u64, ts: u32) -> Wrapped<Rec> {
    Wrapped::with_header(rec(key), (ts << TIMESTAMP_SHIFT) | VISIBLE | TOMBSTONE)
}

#[test]
fn merge_iterator_is_globally_sorted() {
    let a = vec![live(1, 0), live(4, 1), live(7, 2)];
    let b = vec![live(2, 3), live(4, 4), live(9, 5)];
    let c = vec![live(0, 6)];

    let keys: Vec<u64> = MergeIterator::new(&[&a, &b, &c])
        .map(|w| w.record().key)
        .collect();
    assert_eq!(keys, vec![0, 1, 2, 4, 4, 7, 9]);
}

#[test]
fn output_is_non_decreasing() {
    let a = vec![live(3, 0), live(5, 1), tombstone(8, 2)];
    let b = vec![live(1, 3), live(5, 4), live(12, 5)];

    let (merged, _) = sorted_merge(&[&a, &b], None);
    for pair in merged.windows(2) {
        assert!(pair[0] <= pair[1], "merge output must be sorted");
    }
}

#[test]
fn matched_pair_cancels() {
    // Record inserted at t=1 and erased at t=2, in separate runs.
    let a = vec![live(5, 1)];
    let b = vec![tombstone(5, 2)];

    let (merged, stats) = sorted_merge(&[&a, &b], None);
    assert!(merged.is_empty(), "pair must annihilate, got {merged:?}");
    assert_eq!(stats.record_count, 0);
    assert_eq!(stats.tombstone_count, 0);
}

#[test]
fn unmatched_tombstone_survives() {
    // The tombstone's record lives deeper in the structure, outside this
    // merge; the tombstone must be carried through.
    let a = vec![tombstone(5, 2)];
    let b = vec![live(6, 3)];

    let (merged, stats) = sorted_merge(&[&a, &b], None);
    assert_eq!(merged.len(), 2);
    assert!(merged[0].is_tombstone());
    assert_eq!(stats.tombstone_count, 1);
}

#[test]
fn earlier_tombstone_does_not_cancel_later_record() {
    // Erase before insert: the re-inserted record must survive.
    let run = vec![tombstone(5, 1), live(5, 2)];

    let (merged, _) = sorted_merge(&[&run], None);
    assert_eq!(merged.len(), 2, "both the stale tombstone and the record remain");
}

#[test]
fn duplicate_records_cancel_one_for_one() {
    // Two identical inserts, one erase: one copy survives.
    let run = vec![live(5, 1), live(5, 2), tombstone(5, 3)];

    let (merged, stats) = sorted_merge(&[&run], None);
    assert_eq!(merged.len(), 1);
    assert!(!merged[0].is_tombstone());
    assert_eq!(stats.tombstone_count, 0);
}

#[test]
fn tagged_records_are_dropped() {
    let a = vec![live(1, 0), live(2, 1), live(3, 2)];
    a[1].set_delete();

    let (merged, stats) = sorted_merge(&[&a], None);
    assert_eq!(stats.record_count, 2);
    let keys: Vec<u64> = merged.iter().map(|w| w.record().key).collect();
    assert_eq!(keys, vec![1, 3]);
}

#[test]
fn surviving_tombstones_populate_filter() {
    let a = vec![tombstone(3, 0), live(9, 1)];
    let mut filter = Bloom::new_for_fp_rate(16, 0.01).expect("filter");

    let (_, stats) = sorted_merge(&[&a], Some(&mut filter));
    assert_eq!(stats.tombstone_count, 1);
    assert!(filter.check(&rec(3)));
}

#[test]
fn merged_headers_are_normalized() {
    let a = vec![live(1, 77), tombstone(2, 78)];

    let (merged, _) = sorted_merge(&[&a], None);
    assert_eq!(merged[0].timestamp(), 0);
    assert!(!merged[0].is_visible());
    assert!(merged[1].is_tombstone());
}

#[test]
fn empty_inputs_produce_empty_output() {
    let empty: Vec<Wrapped<Rec>> = Vec::new();
    let (merged, stats) = sorted_merge(&[&empty, &empty], None);
    assert!(merged.is_empty());
    assert_eq!(stats, Default::default());

    let (merged, _) = sorted_merge::<Rec>(&[], None);
    assert!(merged.is_empty());
}

#[test]
fn run_from_view_sorts_and_cancels() {
    let buf = Arc::new(MutableBuffer::<Rec>::new(2, 32));
    buf.append(rec(4), false);
    buf.append(rec(1), false);
    buf.append(rec(4), true); // erases the key-4 insert
    buf.append(rec(9), false);

    let view = buf.view();
    let (run, stats) = sorted_run_from_view(&view, None);

    let keys: Vec<u64> = run.iter().map(|w| w.record().key).collect();
    assert_eq!(keys, vec![1, 9]);
    assert_eq!(stats.record_count, 2);
    assert_eq!(stats.tombstone_count, 0);
}

#[test]
fn run_from_view_keeps_unmatched_tombstones() {
    let buf = Arc::new(MutableBuffer::<Rec>::new(2, 32));
    buf.append(rec(1), false);
    buf.append(rec(2), true); // tombstone for a record outside the buffer

    let view = buf.view();
    let (run, stats) = sorted_run_from_view(&view, None);

    assert_eq!(run.len(), 2);
    assert_eq!(stats.tombstone_count, 1);
    assert!(run[1].is_tombstone());
}
