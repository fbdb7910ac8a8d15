//! Static flattening of a live index.

use rand::Rng;

use super::{LookupIndex, ScanIndex, kv, rec, test_config};
use crate::shard::Shard;

/// # Scenario
/// Flatten an index holding N records with D of them tombstone-erased.
///
/// # Expected behavior
/// One shard with N − D records, sorted, and zero tombstones: every
/// tombstone meets its record in the flattening merge.
#[test]
fn flatten_cancels_all_tombstones() {
    let index = ScanIndex::new(test_config()).unwrap();

    let n = 5_000u64;
    for key in 0..n {
        index.insert(rec(key));
    }

    let mut rng = rand::rng();
    let mut erased = std::collections::BTreeSet::new();
    while erased.len() < 500 {
        let key = rng.random_range(0..n);
        if erased.insert(key) {
            index.erase(rec(key));
        }
    }

    let shard = index.create_static_structure();
    assert_eq!(shard.record_count(), (n as usize) - erased.len());
    assert_eq!(shard.tombstone_count(), 0);

    let records = shard.records();
    for pair in records.windows(2) {
        assert!(pair[0] <= pair[1], "flattened run must be sorted");
    }
    for w in records {
        assert!(!erased.contains(&w.record().key));
    }
    index.shutdown();
}

#[test]
fn flatten_includes_unflushed_buffer_records() {
    let index = ScanIndex::new(test_config()).unwrap();
    for key in 0..3_000 {
        index.insert(rec(key));
    }
    // No awaiting: part of the data still sits in the buffer.

    let shard = index.create_static_structure();
    assert_eq!(shard.record_count(), 3_000);
    index.shutdown();
}

#[test]
fn flatten_empty_index_yields_empty_shard() {
    let index = LookupIndex::new(test_config()).unwrap();
    let shard = index.create_static_structure();
    assert_eq!(shard.record_count(), 0);
    index.shutdown();
}

#[test]
fn flatten_respects_duplicate_cancellation() {
    let index = ScanIndex::new(test_config()).unwrap();
    index.insert(kv(1, 1));
    index.insert(kv(1, 1));
    index.erase(kv(1, 1));

    let shard = index.create_static_structure();
    assert_eq!(shard.record_count(), 1, "one duplicate survives");
    assert_eq!(shard.tombstone_count(), 0);
    index.shutdown();
}
