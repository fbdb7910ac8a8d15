//! # Dynamis
//!
//! An embeddable framework that turns **static, bulk-built data structures**
//! ("shards") into concurrent, updatable indexes with bounded amortized
//! update cost. Bring a shard type that can be built from a sorted run of
//! records and a query algorithm over it; the framework supplies inserts,
//! deletes, and snapshot-consistent queries under multiple readers and
//! writers.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                     DynamicExtension                       │
//! │  ┌────────────┐   ┌──────────────────────────────────────┐ │
//! │  │  Mutable    │   │        Extension structure          │ │
//! │  │  buffer     │   │  L0 [shard][shard]                  │ │
//! │  │  (lock-free │   │  L1 [   shard    ][   shard    ]    │ │
//! │  │   append)   │   │  L2 [          shard           ]    │ │
//! │  └─────┬───────┘   └───────────────┬─────────────────────┘ │
//! │        │  flush / reconstruction   │                       │
//! │        └──────────►  planner  ◄────┘                       │
//! │                        │                                   │
//! │  ┌─────────────────────▼─────────────────────────────────┐ │
//! │  │   Scheduler (worker pool) — reconstructions, queries  │ │
//! │  └───────────────────────────────────────────────────────┘ │
//! │                                                            │
//! │  Epochs bind (structure version, buffers) into snapshots   │
//! │  that in-flight operations hold until they drain.          │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Construction-time configuration and layout/delete policies |
//! | [`record`] | Record traits and the header-bearing record envelope |
//! | [`buffer`] | Lock-free append buffer with versioned head and snapshot views |
//! | [`merge`] | Sorted k-way merge with tombstone cancellation |
//! | [`shard`] | Shard contracts and a sorted-array reference shard |
//! | [`query`] | Query contract and point/range query implementations |
//! | [`structure`] | Tiered/leveled shard hierarchy and reconstruction planning |
//! | [`epoch`] | Consistent `(structure, buffers)` snapshots for readers |
//! | [`scheduler`] | FIFO worker-pool and serial schedulers |
//! | [`extension`] | The top-level dynamized index |
//!
//! ## Key properties
//!
//! - **Wait-free appends** — inserts land in a bounded circular buffer via
//!   atomic tail advancement and never block behind reconstructions.
//! - **Snapshot reads** — every query pins an epoch and sees either the
//!   predecessor or the successor structure, never a mix.
//! - **Off-path reconstruction** — merges are planned against a simulated
//!   state vector and executed on a worker pool, on a private copy of the
//!   structure.
//! - **Two delete models** — tombstone records or in-place delete tagging,
//!   with a tombstone-density invariant enforced by follow-up compaction.
//!
//! ## Quick start
//!
//! ```rust
//! use dynamis::config::ExtensionConfig;
//! use dynamis::extension::DynamicExtension;
//! use dynamis::query::RangeScan;
//! use dynamis::record::KvPair;
//! use dynamis::scheduler::SerialScheduler;
//! use dynamis::shard::IsamShard;
//!
//! type Index = DynamicExtension<
//!     IsamShard<KvPair<u64, u64>>,
//!     RangeScan<IsamShard<KvPair<u64, u64>>>,
//!     SerialScheduler,
//! >;
//!
//! let index = Index::new(ExtensionConfig::default()).unwrap();
//!
//! for key in 0..1000u64 {
//!     index.insert(KvPair { key, value: key * 2 });
//! }
//! index.erase(KvPair { key: 17, value: 34 });
//!
//! let results = index
//!     .query(dynamis::query::RangeParams { lower: 10, upper: 20 })
//!     .get()
//!     .unwrap();
//! assert_eq!(results.len(), 10); // key 17 is gone
//! index.shutdown();
//! ```

pub mod buffer;
pub mod config;
pub mod epoch;
pub mod extension;
pub mod merge;
pub mod query;
pub mod record;
pub mod scheduler;
pub mod shard;
pub mod structure;
