//! One level of the extension structure: an ordered list of up to
//! `shard_cap` shards, plus a pending-shard slot used when a
//! reconstruction must replace every current shard at once.

use std::sync::Arc;

use crate::buffer::BufferView;
use crate::shard::Shard;

/// A container of shards at one depth of the structure.
///
/// Levels are shared between structure versions by cloning: a clone has
/// its own shard list but shares the immutable shards themselves, so a
/// new version can be restructured without disturbing readers of the
/// old one. Tag deletes write through the shared shards and are visible
/// to every version holding them.
pub struct InternalLevel<S: Shard> {
    level_no: usize,
    shard_cap: usize,
    shards: Vec<Arc<S>>,
    pending: Option<Arc<S>>,
}

impl<S: Shard> Clone for InternalLevel<S> {
    fn clone(&self) -> Self {
        // The pending slot is private to an in-flight reconstruction and
        // never travels to another version.
        Self {
            level_no: self.level_no,
            shard_cap: self.shard_cap,
            shards: self.shards.clone(),
            pending: None,
        }
    }
}

impl<S: Shard> InternalLevel<S> {
    pub fn new(level_no: usize, shard_cap: usize) -> Self {
        Self {
            level_no,
            shard_cap,
            shards: Vec::with_capacity(shard_cap),
            pending: None,
        }
    }

    pub fn level_no(&self) -> usize {
        self.level_no
    }

    pub fn shards(&self) -> &[Arc<S>] {
        &self.shards
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Builds a shard from a buffer view and appends it. When the level
    /// is already at capacity the shard lands in the pending slot and
    /// replaces everything on [`finalize`](Self::finalize).
    pub fn append_buffer(&mut self, view: &BufferView<S::Record>) {
        let shard = Arc::new(S::from_buffer_view(view));
        if self.shards.len() == self.shard_cap {
            debug_assert!(self.pending.is_none());
            self.pending = Some(shard);
        } else {
            self.shards.push(shard);
        }
    }

    /// Builds one shard combining all of `source`'s shards and appends
    /// it here. Used by reconstructions under tiering.
    pub fn append_level(&mut self, source: &InternalLevel<S>) {
        let refs: Vec<&S> = source.shards.iter().map(Arc::as_ref).collect();
        let combined = Arc::new(S::from_shards(&refs));

        if self.shards.len() == self.shard_cap {
            debug_assert!(self.pending.is_none());
            self.pending = Some(combined);
        } else {
            self.shards.push(combined);
        }
    }

    /// Installs the pending shard, if any, as the level's only shard.
    pub fn finalize(&mut self) {
        if let Some(shard) = self.pending.take() {
            self.shards.clear();
            self.shards.push(shard);
        }
    }

    /// Builds a new single-shard level combining the shards of `base`
    /// and `incoming`. Neither input is modified. Used by
    /// reconstructions under leveling.
    pub fn merged(base: &InternalLevel<S>, incoming: &InternalLevel<S>) -> InternalLevel<S> {
        let refs: Vec<&S> = base
            .shards
            .iter()
            .chain(incoming.shards.iter())
            .map(Arc::as_ref)
            .collect();

        let mut level = InternalLevel::new(base.level_no, 1);
        level.shards.push(Arc::new(S::from_shards(&refs)));
        level
    }

    /// Builds a new single-shard level flattening every shard of every
    /// source level. Used by Bentley–Saxe reconstructions.
    pub fn flattened(sources: &[&InternalLevel<S>], level_no: usize) -> InternalLevel<S> {
        let refs: Vec<&S> = sources
            .iter()
            .flat_map(|level| level.shards.iter())
            .map(Arc::as_ref)
            .collect();

        let mut level = InternalLevel::new(level_no, 1);
        level.shards.push(Arc::new(S::from_shards(&refs)));
        level
    }

    /// A new shard combining every shard on this level, or `None` when
    /// the level is empty. The level itself is unchanged.
    pub fn combined_shard(&self) -> Option<S> {
        if self.shards.is_empty() {
            return None;
        }

        let refs: Vec<&S> = self.shards.iter().map(Arc::as_ref).collect();
        Some(S::from_shards(&refs))
    }

    /// Tags the first record matching `rec` as deleted, walking shards
    /// in order. Returns whether a match was tagged.
    pub fn delete_record(&self, rec: &S::Record) -> bool {
        for shard in &self.shards {
            if let Some(found) = shard.point_lookup(rec, false) {
                found.set_delete();
                return true;
            }
        }

        false
    }

    /// Checks shards `shard_start..` (newest first) for a tombstone
    /// matching `rec`.
    pub fn check_tombstone(&self, shard_start: usize, rec: &S::Record) -> bool {
        if self.shards.len() <= shard_start {
            return false;
        }

        self.shards[shard_start..].iter().rev().any(|shard| {
            shard
                .point_lookup(rec, true)
                .is_some_and(|found| found.is_tombstone())
        })
    }

    pub fn record_count(&self) -> usize {
        self.shards.iter().map(|s| s.record_count()).sum()
    }

    pub fn tombstone_count(&self) -> usize {
        self.shards.iter().map(|s| s.tombstone_count()).sum()
    }

    pub fn memory_usage(&self) -> usize {
        self.shards.iter().map(|s| s.memory_usage()).sum()
    }

    pub fn aux_memory_usage(&self) -> usize {
        self.shards.iter().map(|s| s.aux_memory_usage()).sum()
    }
}
