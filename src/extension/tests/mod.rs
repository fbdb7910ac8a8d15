mod tests_invariants;
mod tests_static;

use crate::config::{DeletePolicy, ExtensionConfig, LayoutPolicy};
use crate::extension::DynamicExtension;
use crate::query::{PointLookup, RangeCount, RangeScan};
use crate::record::KvPair;
use crate::scheduler::{FifoScheduler, SerialScheduler};
use crate::shard::IsamShard;

pub(crate) type Rec = KvPair<u64, u64>;
pub(crate) type TestShard = IsamShard<Rec>;

pub(crate) type ScanIndex = DynamicExtension<TestShard, RangeScan<TestShard>, SerialScheduler>;
pub(crate) type CountIndex = DynamicExtension<TestShard, RangeCount<TestShard>, SerialScheduler>;
pub(crate) type LookupIndex = DynamicExtension<TestShard, PointLookup<TestShard>, SerialScheduler>;

pub(crate) type ConcurrentCountIndex =
    DynamicExtension<TestShard, RangeCount<TestShard>, FifoScheduler>;
pub(crate) type ConcurrentLookupIndex =
    DynamicExtension<TestShard, PointLookup<TestShard>, FifoScheduler>;

pub(crate) fn rec(key: u64) -> Rec {
    KvPair { key, value: key }
}

pub(crate) fn kv(key: u64, value: u64) -> Rec {
    KvPair { key, value }
}

pub(crate) fn test_config() -> ExtensionConfig {
    init_tracing();
    ExtensionConfig {
        buffer_lwm: 100,
        buffer_hwm: 1000,
        scale_factor: 2,
        max_delete_proportion: 0.05,
        memory_budget: 0,
        worker_threads: 0,
        layout_policy: LayoutPolicy::Tiering,
        delete_policy: DeletePolicy::Tombstone,
    }
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
