//! # Extension Structure
//!
//! The tiered/leveled hierarchy of immutable shards, together with the
//! planner that decides what reconstruction work a flush requires and
//! the executor that applies it.
//!
//! ## Planning model
//!
//! Plans are pure: the planner simulates its own tasks against a scratch
//! **state vector** (per-level record and shard counts and capacities)
//! and never touches the real levels. The scratch state doubles as a
//! one-step lookahead — after planning, it reflects the structure as it
//! will stand once the flush lands, so the next flush can be checked
//! against it.
//!
//! ## Design Invariants
//!
//! - Level `i` has record capacity `buffer_hwm * scale_factor^(i + 1)`.
//! - Under leveling, a non-empty level's record count never exceeds its
//!   record capacity; under tiering, its shard count never exceeds the
//!   scale factor.
//! - Per level, `tombstones / record_capacity <= max_delete_proportion`;
//!   violations are repaired by follow-up compaction plans.
//! - Reconstructions merge contiguous levels only, preserving the
//!   tombstone ordering invariant (a tombstone never sits deeper than
//!   the record it cancels).

#[cfg(test)]
mod tests;

pub mod level;

pub use level::InternalLevel;

use tracing::{debug, trace};

use crate::buffer::BufferView;
use crate::config::LayoutPolicy;
use crate::shard::Shard;

// ------------------------------------------------------------------------------------------------
// Identifiers and state vectors
// ------------------------------------------------------------------------------------------------

/// Position of a shard within a structure: level index, then shard index
/// within the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardId {
    pub level: usize,
    pub shard: usize,
}

/// Simulated per-level occupancy used by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelState {
    pub record_count: usize,
    pub record_capacity: usize,
    pub shard_count: usize,
    pub shard_capacity: usize,
}

/// One state entry per level, shallowest first.
pub type StateVector = Vec<LevelState>;

// ------------------------------------------------------------------------------------------------
// Reconstruction tasks
// ------------------------------------------------------------------------------------------------

/// One unit of reconstruction work: merge `sources` into `target`.
///
/// Non-flattening layouts always carry a single source; Bentley–Saxe
/// tasks list every level being collapsed, deepest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconstructionTask {
    pub sources: Vec<usize>,
    pub target: usize,
    pub expected_records: usize,
}

/// An ordered list of reconstruction tasks, executed front to back.
#[derive(Debug, Clone, Default)]
pub struct ReconstructionVector {
    tasks: Vec<ReconstructionTask>,
    total_records: usize,
}

impl ReconstructionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: ReconstructionTask) {
        self.total_records += task.expected_records;
        self.tasks.push(task);
    }

    pub fn push_merge(&mut self, source: usize, target: usize, expected_records: usize) {
        self.push(ReconstructionTask {
            sources: vec![source],
            target,
            expected_records,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn total_records(&self) -> usize {
        self.total_records
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReconstructionTask> {
        self.tasks.iter()
    }
}

impl IntoIterator for ReconstructionVector {
    type Item = ReconstructionTask;
    type IntoIter = std::vec::IntoIter<ReconstructionTask>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.into_iter()
    }
}

// ------------------------------------------------------------------------------------------------
// ExtensionStructure
// ------------------------------------------------------------------------------------------------

/// An ordered collection of internal levels governed by a layout policy.
///
/// Structures are immutable once installed into an epoch: all mutation
/// happens on a private clone held by the reconstruction job, which is
/// then published wholesale. Cloning is shallow — levels copy their
/// shard lists but share the shards.
pub struct ExtensionStructure<S: Shard> {
    layout: LayoutPolicy,
    buffer_hwm: usize,
    scale_factor: usize,
    max_delete_proportion: f64,

    levels: Vec<InternalLevel<S>>,
    state: StateVector,
}

impl<S: Shard> Clone for ExtensionStructure<S> {
    fn clone(&self) -> Self {
        Self {
            layout: self.layout,
            buffer_hwm: self.buffer_hwm,
            scale_factor: self.scale_factor,
            max_delete_proportion: self.max_delete_proportion,
            levels: self.levels.clone(),
            state: self.state.clone(),
        }
    }
}

impl<S: Shard> ExtensionStructure<S> {
    pub fn new(
        layout: LayoutPolicy,
        buffer_hwm: usize,
        scale_factor: usize,
        max_delete_proportion: f64,
    ) -> Self {
        Self {
            layout,
            buffer_hwm,
            scale_factor,
            max_delete_proportion,
            levels: Vec::new(),
            state: Vec::new(),
        }
    }

    pub fn layout(&self) -> LayoutPolicy {
        self.layout
    }

    pub fn levels(&self) -> &[InternalLevel<S>] {
        &self.levels
    }

    pub fn state(&self) -> &StateVector {
        &self.state
    }

    /// Number of levels, populated or not.
    pub fn height(&self) -> usize {
        self.levels.len()
    }

    pub fn record_count(&self) -> usize {
        self.levels.iter().map(|l| l.record_count()).sum()
    }

    pub fn tombstone_count(&self) -> usize {
        self.levels.iter().map(|l| l.tombstone_count()).sum()
    }

    pub fn memory_usage(&self) -> usize {
        self.levels.iter().map(|l| l.memory_usage()).sum()
    }

    pub fn aux_memory_usage(&self) -> usize {
        self.levels.iter().map(|l| l.aux_memory_usage()).sum()
    }

    /// Record capacity of level `idx`: `buffer_hwm * scale_factor^(idx+1)`.
    pub fn record_capacity(&self, idx: usize) -> usize {
        self.buffer_hwm
            .saturating_mul(self.scale_factor.saturating_pow(idx as u32 + 1))
    }

    fn shard_capacity(&self) -> usize {
        match self.layout {
            LayoutPolicy::Leveling => 1,
            LayoutPolicy::Tiering | LayoutPolicy::BentleySaxe => self.scale_factor,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Tombstone-density invariant
    // --------------------------------------------------------------------------------------------

    /// Whether every level satisfies the tombstone-density bound.
    pub fn validate_tombstone_proportion(&self) -> bool {
        (0..self.levels.len()).all(|i| self.validate_level_tombstones(i))
    }

    /// Whether level `idx` satisfies the tombstone-density bound.
    pub fn validate_level_tombstones(&self, idx: usize) -> bool {
        let proportion =
            self.levels[idx].tombstone_count() as f64 / self.record_capacity(idx) as f64;
        proportion <= self.max_delete_proportion
    }

    // --------------------------------------------------------------------------------------------
    // Tag deletes
    // --------------------------------------------------------------------------------------------

    /// Searches the levels shallowest-first for a record matching `rec`
    /// and sets its deleted bit. Stops at the first match; duplicate
    /// records are deleted one per call.
    pub fn tagged_delete(&self, rec: &S::Record) -> bool {
        self.levels.iter().any(|level| level.delete_record(rec))
    }

    // --------------------------------------------------------------------------------------------
    // Planning
    // --------------------------------------------------------------------------------------------

    /// Plans the reconstructions required before a buffer of
    /// `buffer_records` records can flush into L0.
    ///
    /// `scratch` must reflect the structure the plan will execute
    /// against (normally a copy of [`state`](Self::state), possibly
    /// carried over from a previous plan for lookahead). On return it
    /// additionally reflects the simulated flush itself.
    pub fn plan_flush(&self, buffer_records: usize, scratch: &mut StateVector) -> ReconstructionVector {
        if scratch.is_empty() {
            self.grow(scratch);
        }

        let mut plan = ReconstructionVector::new();
        if !self.can_absorb(0, buffer_records, scratch) {
            plan = self.plan_from_level(0, scratch);
        }

        // Simulate the flush for lookahead.
        scratch[0].record_count += buffer_records;
        if self.layout != LayoutPolicy::Leveling || scratch[0].shard_count == 0 {
            scratch[0].shard_count += 1;
        }

        if !plan.is_empty() {
            debug!(
                tasks = plan.len(),
                moved_records = plan.total_records(),
                "planned flush reconstructions"
            );
        }

        plan
    }

    /// Plans the cascade that frees `source` by moving its records one
    /// level at a time into the first level able to absorb them,
    /// growing the structure when none can. Under Bentley–Saxe this is
    /// a single flattening task instead.
    pub fn plan_from_level(&self, source: usize, scratch: &mut StateVector) -> ReconstructionVector {
        let mut plan = ReconstructionVector::new();

        let base = self
            .find_reconstruction_target(source, scratch)
            .unwrap_or_else(|| self.grow(scratch));

        if self.layout == LayoutPolicy::BentleySaxe {
            // Flatten every level in [source, base) into base.
            let mut task = ReconstructionTask {
                sources: Vec::with_capacity(base - source),
                target: base,
                expected_records: 0,
            };

            let mut moved = 0;
            for i in (source..base).rev() {
                moved += scratch[i].record_count;
                task.sources.push(i);
                scratch[i].record_count = 0;
                scratch[i].shard_count = 0;
            }
            task.expected_records = moved;
            plan.push(task);

            scratch[base].record_count += moved;
            scratch[base].shard_count = 1;

            return plan;
        }

        for i in ((source + 1)..=base).rev() {
            let moving = scratch[i - 1].record_count;
            let mut expected = moving;

            // Under leveling a reconstruction into an occupied target
            // rewrites the target's records as well.
            if self.layout == LayoutPolicy::Leveling && scratch[i].record_count > 0 {
                expected += scratch[i].record_count;
            }
            plan.push_merge(i - 1, i, expected);

            scratch[i - 1].record_count = 0;
            scratch[i - 1].shard_count = 0;

            scratch[i].record_count += moving;
            if self.layout != LayoutPolicy::Leveling || scratch[i].shard_count == 0 {
                scratch[i].shard_count += 1;
            }
        }

        plan
    }

    /// Plans the cascade that repairs the shallowest level violating
    /// the tombstone-density invariant, or returns an empty plan when
    /// the invariant holds.
    ///
    /// Tombstones migrate toward the records they cancel, so pushing
    /// the violating level deeper both dilutes the proportion (against
    /// a larger capacity) and gives pairs the chance to annihilate.
    pub fn plan_compactions(&self) -> ReconstructionVector {
        let violating = (0..self.levels.len()).find(|&i| !self.validate_level_tombstones(i));

        let Some(violating) = violating else {
            return ReconstructionVector::new();
        };

        debug!(level = violating, "tombstone proportion exceeded; planning compaction");
        let mut scratch = self.state.clone();
        self.plan_from_level(violating, &mut scratch)
    }

    /// Finds the first level below `idx` that can absorb the records
    /// cascading into it, assuming each intermediate level is emptied
    /// by the cascade before receiving its predecessor.
    fn find_reconstruction_target(&self, idx: usize, state: &StateVector) -> Option<usize> {
        ((idx + 1)..state.len())
            .find(|&i| self.can_absorb(i, state[i - 1].record_count, state))
    }

    /// Appends a new empty level to the scratch state, returning its
    /// index. Only the simulation grows here; real levels are created
    /// by the executor when a task targets them.
    fn grow(&self, scratch: &mut StateVector) -> usize {
        let idx = scratch.len();
        scratch.push(LevelState {
            record_count: 0,
            record_capacity: self.record_capacity(idx),
            shard_count: 0,
            shard_capacity: self.shard_capacity(),
        });

        trace!(level = idx, "grew simulated structure");
        idx
    }

    /// Whether level `idx` can absorb `incoming` more records under the
    /// layout policy.
    fn can_absorb(&self, idx: usize, incoming: usize, state: &StateVector) -> bool {
        let Some(level) = state.get(idx) else {
            return false;
        };

        match self.layout {
            LayoutPolicy::Leveling => level.record_count + incoming <= level.record_capacity,
            LayoutPolicy::Tiering => level.shard_count < level.shard_capacity,
            LayoutPolicy::BentleySaxe => level.record_count == 0,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Execution
    // --------------------------------------------------------------------------------------------

    /// Applies one planned task to the real levels.
    pub fn execute_task(&mut self, task: &ReconstructionTask) {
        trace!(?task, "executing reconstruction task");

        if self.layout == LayoutPolicy::BentleySaxe {
            self.execute_flatten(task);
            return;
        }

        for &source in &task.sources {
            self.reconstruct(task.target, source);
        }
    }

    /// Merges `incoming` into `base` (sequential levels only) and
    /// leaves a fresh empty level in `incoming`'s place.
    fn reconstruct(&mut self, base: usize, incoming: usize) {
        let shard_cap = self.shard_capacity();

        if base >= self.levels.len() {
            self.levels.push(InternalLevel::new(base, shard_cap));
            self.state.push(LevelState {
                record_count: 0,
                record_capacity: self.record_capacity(base),
                shard_count: 0,
                shard_capacity: shard_cap,
            });
        }

        if self.levels[incoming].is_empty() {
            return;
        }

        let incoming_level = std::mem::replace(
            &mut self.levels[incoming],
            InternalLevel::new(incoming, shard_cap),
        );

        match self.layout {
            LayoutPolicy::Leveling => {
                if self.levels[base].is_empty() {
                    // Nothing to merge with; the incoming level moves
                    // down as-is.
                    self.levels[base] = incoming_level;
                } else {
                    self.levels[base] = InternalLevel::merged(&self.levels[base], &incoming_level);
                }
            }
            _ => {
                self.levels[base].append_level(&incoming_level);
                self.levels[base].finalize();
            }
        }

        self.state[base] = LevelState {
            record_count: self.levels[base].record_count(),
            record_capacity: self.record_capacity(base),
            shard_count: self.levels[base].shard_count(),
            shard_capacity: shard_cap,
        };
        self.state[incoming] = LevelState {
            record_count: 0,
            record_capacity: self.record_capacity(incoming),
            shard_count: 0,
            shard_capacity: shard_cap,
        };
    }

    /// Applies a Bentley–Saxe flattening task: every source level is
    /// collapsed into a single shard at the target.
    fn execute_flatten(&mut self, task: &ReconstructionTask) {
        let sources: Vec<&InternalLevel<S>> =
            task.sources.iter().map(|&i| &self.levels[i]).collect();
        let new_level = InternalLevel::flattened(&sources, task.target);
        let record_count = new_level.record_count();

        if task.target >= self.levels.len() {
            self.levels.push(new_level);
            self.state.push(LevelState {
                record_count,
                record_capacity: self.record_capacity(task.target),
                shard_count: 1,
                shard_capacity: 1,
            });
        } else {
            self.levels[task.target] = new_level;
            self.state[task.target] = LevelState {
                record_count,
                record_capacity: self.record_capacity(task.target),
                shard_count: 1,
                shard_capacity: 1,
            };
        }

        for &source in &task.sources {
            self.levels[source] = InternalLevel::new(source, 1);
            self.state[source] = LevelState {
                record_count: 0,
                record_capacity: self.record_capacity(source),
                shard_count: 0,
                shard_capacity: 1,
            };
        }
    }

    /// Flushes a buffer view into level 0. The planner must already
    /// have made room; under leveling the new shard merges with L0's
    /// existing shard, otherwise it is appended.
    pub fn flush_buffer(&mut self, view: &BufferView<S::Record>) {
        let shard_cap = self.shard_capacity();

        if self.levels.is_empty() {
            self.levels.push(InternalLevel::new(0, shard_cap));
            self.state.push(LevelState {
                record_count: 0,
                record_capacity: self.record_capacity(0),
                shard_count: 0,
                shard_capacity: shard_cap,
            });
        }

        if self.layout == LayoutPolicy::Leveling {
            let mut incoming = InternalLevel::new(0, 1);
            incoming.append_buffer(view);

            if self.levels[0].is_empty() {
                self.levels[0] = incoming;
            } else {
                self.levels[0] = InternalLevel::merged(&self.levels[0], &incoming);
            }
        } else {
            self.levels[0].append_buffer(view);
        }

        self.state[0].record_count = self.levels[0].record_count();
        self.state[0].shard_count = self.levels[0].shard_count();

        debug!(
            flushed = view.record_count(),
            l0_records = self.state[0].record_count,
            l0_shards = self.state[0].shard_count,
            "flushed buffer into L0"
        );
    }
}
