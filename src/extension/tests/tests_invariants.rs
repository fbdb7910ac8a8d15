//! Long-running invariant checks under randomized workloads.

use rand::Rng;

use super::{CountIndex, kv, test_config};
use crate::config::ExtensionConfig;
use crate::query::RangeParams;

/// # Scenario
/// Random inserts with ~5% interleaved tombstone erases.
///
/// # Expected behavior
/// The tombstone proportion of every level stays within the configured
/// bound at every observation point (the serial scheduler completes
/// each flush, and its follow-up compactions, before the insert that
/// triggered it returns).
#[test]
fn tombstone_proportion_bounded_under_random_erases() {
    let config = ExtensionConfig {
        buffer_lwm: 800,
        buffer_hwm: 1000,
        ..test_config()
    };
    let index = CountIndex::new(config).unwrap();

    let mut rng = rand::rng();
    let mut live: Vec<(u64, u64)> = Vec::new();
    let mut erased = 0usize;

    for i in 0..100_000u64 {
        let key = rng.random_range(0..1_000_000);
        index.insert(kv(key, i));
        live.push((key, i));

        if rng.random_bool(0.05) {
            let pick = rng.random_range(0..live.len());
            let (key, value) = live.swap_remove(pick);
            assert!(index.erase(kv(key, value)));
            erased += 1;
        }

        if i % 1_000 == 999 {
            assert!(
                index.validate_tombstone_proportion(),
                "tombstone invariant violated after {} operations",
                i + 1
            );
        }
    }

    assert!(erased > 0);
    assert!(index.validate_tombstone_proportion());

    // Every cancelled (record, tombstone) pair removes two entries from
    // the raw total; everything else is still counted.
    let count = index.record_count();
    assert!(count <= 100_000 + erased);
    assert!(count >= 100_000 - erased);
    index.shutdown();
}

#[test]
fn capacity_invariants_after_heavy_insert_load() {
    let index = CountIndex::new(test_config()).unwrap();
    for key in 0..50_000u64 {
        index.insert(kv(key, key));
    }
    index.await_next_epoch();

    assert_eq!(index.record_count(), 50_000);
    assert!(index.height() >= 3, "50k records must build several levels");
    assert!(index.validate_tombstone_proportion());

    let counts = index
        .query(RangeParams {
            lower: 0,
            upper: 49_999,
        })
        .get()
        .unwrap();
    assert_eq!(counts, vec![50_000]);
    index.shutdown();
}
