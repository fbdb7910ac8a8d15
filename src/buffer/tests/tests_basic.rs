//! Append, watermark, and head-advancement tests.

use std::sync::Arc;

use crate::buffer::MutableBuffer;
use crate::record::KvPair;

type Rec = KvPair<u64, u64>;

fn rec(key: u64) -> Rec {
    KvPair { key, value: key }
}

fn buffer(lwm: usize, hwm: usize) -> Arc<MutableBuffer<Rec>> {
    Arc::new(MutableBuffer::new(lwm, hwm))
}

#[test]
fn appends_until_high_watermark() {
    let buf = buffer(10, 100);

    for i in 0..100 {
        assert!(buf.append(rec(i), false), "append {i} should succeed");
    }
    assert!(buf.is_full());
    assert!(!buf.append(rec(100), false), "append at HWM must fail");
    assert_eq!(buf.record_count(), 100);
}

#[test]
fn append_at_boundary_succeeds_then_fails() {
    // The slot at tail == head + HWM - 1 is the last admissible one.
    let buf = buffer(2, 8);
    for i in 0..7 {
        assert!(buf.append(rec(i), false));
    }
    assert!(buf.append(rec(7), false), "append of record HWM-1 succeeds");
    assert!(!buf.append(rec(8), false), "the next append fails");
}

#[test]
fn watermark_predicates() {
    let buf = buffer(3, 10);
    assert!(!buf.is_at_low_watermark());

    for i in 0..3 {
        buf.append(rec(i), false);
    }
    assert!(buf.is_at_low_watermark());
    assert!(!buf.is_full());
}

#[test]
fn tombstone_append_updates_count_and_filter() {
    let buf = buffer(2, 16);
    buf.append(rec(1), false);
    buf.append(rec(2), true);
    buf.append(rec(3), true);

    assert_eq!(buf.tombstone_count(), 2);
    assert!(buf.check_tombstone(&rec(2)));
    assert!(buf.check_tombstone(&rec(3)));
    assert!(!buf.check_tombstone(&rec(1)));
}

#[test]
fn head_advancement_frees_capacity() {
    let buf = buffer(2, 10);
    for i in 0..10 {
        buf.append(rec(i), false);
    }
    assert!(!buf.append(rec(10), false));

    assert!(buf.advance_head(10), "advance to tail must succeed");
    assert_eq!(buf.record_count(), 0);

    for i in 10..20 {
        assert!(buf.append(rec(i), false), "append {i} after advance");
    }
}

#[test]
fn advance_to_tail_empties_buffer() {
    let buf = buffer(2, 10);
    for i in 0..5 {
        buf.append(rec(i), false);
    }
    assert!(buf.advance_head(5));
    assert_eq!(buf.record_count(), 0);
    assert!(!buf.is_at_low_watermark());
}

#[test]
fn advance_refused_while_old_head_referenced() {
    let buf = buffer(2, 10);
    for i in 0..4 {
        buf.append(rec(i), false);
    }

    // Pin the current head, then advance: the pin migrates to old_head.
    let view = buf.view();
    assert!(buf.advance_head(4));

    for i in 4..8 {
        buf.append(rec(i), false);
    }

    // A second advance must be refused while the old head is pinned.
    assert!(!buf.advance_head(8));
    drop(view);
    assert!(buf.advance_head(8));
}

#[test]
fn advance_to_current_head_is_a_noop() {
    let buf = buffer(2, 10);
    for i in 0..4 {
        buf.append(rec(i), false);
    }
    buf.advance_head(4);
    assert!(buf.advance_head(4));
    assert_eq!(buf.record_count(), 0);
}

#[test]
fn wraparound_reuses_slots() {
    let buf = buffer(2, 4); // capacity 8
    let mut next = 0u64;

    for _ in 0..5 {
        for _ in 0..4 {
            assert!(buf.append(rec(next), false));
            next += 1;
        }
        let tail = buf.tail();
        assert!(buf.advance_head(tail));
    }

    assert_eq!(buf.record_count(), 0);
    assert_eq!(buf.tail(), 20);
}

#[test]
fn available_capacity_counts_physical_slots() {
    let buf = buffer(2, 10); // capacity 20
    assert_eq!(buf.available_capacity(), 20);

    for i in 0..10 {
        buf.append(rec(i), false);
    }
    assert_eq!(buf.available_capacity(), 10);

    buf.advance_head(10);
    assert_eq!(buf.available_capacity(), 20);
}
