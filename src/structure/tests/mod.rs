
use std::sync::Arc;

use crate::buffer::{BufferView, MutableBuffer};
use crate::record::KvPair;

pub(crate) type Rec = KvPair<u64, u64>;

pub(crate) fn rec(key: u64) -> Rec {
    KvPair { key, value: key }
}

/// A view over a fresh buffer holding the given live keys.
pub(crate) fn view_of(keys: &[u64]) -> (Arc<MutableBuffer<Rec>>, BufferView<Rec>) {
    view_with_tombstones(keys, &[])
}

/// A view over a fresh buffer holding live keys and tombstone keys.
pub(crate) fn view_with_tombstones(
    keys: &[u64],
    tombstones: &[u64],
) -> (Arc<MutableBuffer<Rec>>, BufferView<Rec>) {
    let cap = (keys.len() + tombstones.len()).max(2);
    let buf = Arc::new(MutableBuffer::new(1, cap));
    for &key in keys {
        assert!(buf.append(rec(key), false));
    }
    for &key in tombstones {
        assert!(buf.append(rec(key), true));
    }
    let view = buf.view();
    (buf, view)
}
