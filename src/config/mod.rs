//! # Configuration
//!
//! Construction-time settings for a [`DynamicExtension`](crate::extension::DynamicExtension):
//! buffer watermarks, the growth factor of the shard hierarchy, the
//! tombstone-density bound, and the layout / delete policies.
//!
//! All settings are validated once, up front, by [`ExtensionConfig::validate`];
//! the extension refuses to start with an inconsistent configuration rather
//! than failing somewhere deep inside a reconstruction.

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Rejected configuration, reported at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Buffer watermarks must satisfy `0 < LWM < HWM`.
    #[error("invalid buffer watermarks: lwm={lwm}, hwm={hwm} (require 0 < lwm < hwm)")]
    InvalidWatermarks { lwm: usize, hwm: usize },

    /// The scale factor controls level growth and must be at least 2.
    #[error("invalid scale factor: {0} (require >= 2)")]
    InvalidScaleFactor(usize),

    /// The maximum delete proportion must lie strictly between 0 and 1.
    #[error("invalid max delete proportion: {0} (require 0 < p < 1)")]
    InvalidDeleteProportion(f64),

    /// The requested policy combination is not supported.
    #[error("unsupported policy combination: {0}")]
    UnsupportedPolicy(&'static str),
}

// ------------------------------------------------------------------------------------------------
// Policies
// ------------------------------------------------------------------------------------------------

/// How levels in the extension structure absorb new data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutPolicy {
    /// Each level holds up to `scale_factor` shards; flushing a level merges
    /// all of its shards into one shard appended to the next level.
    Tiering,

    /// Each level holds a single shard; flushing merges the source shard
    /// with the target's shard to produce a new single shard.
    Leveling,

    /// Bentley–Saxe: a flush to level `L` flattens every source level in
    /// `0..L` into one shard at `L`, emptying the sources.
    BentleySaxe,
}

/// How logical deletion is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    /// `erase` appends a tombstone record; the tombstone and its match
    /// cancel during a later reconstruction.
    Tombstone,

    /// `erase` locates the record in place and sets its deleted header bit.
    Tagging,
}

// ------------------------------------------------------------------------------------------------
// ExtensionConfig
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`DynamicExtension`](crate::extension::DynamicExtension) instance.
///
/// # Example
///
/// ```rust
/// use dynamis::config::{ExtensionConfig, LayoutPolicy};
///
/// let config = ExtensionConfig {
///     buffer_lwm: 500,
///     buffer_hwm: 2000,
///     layout_policy: LayoutPolicy::Leveling,
///     ..ExtensionConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ExtensionConfig {
    /// Buffer occupancy at which a flush is scheduled.
    pub buffer_lwm: usize,

    /// Buffer occupancy at which further appends fail until a flush drains
    /// the buffer. The buffer's physical capacity is `2 * buffer_hwm`.
    pub buffer_hwm: usize,

    /// Growth factor between levels. Level `i` has a record capacity of
    /// `buffer_hwm * scale_factor^(i + 1)`.
    pub scale_factor: usize,

    /// Maximum tolerated tombstone proportion per level, relative to the
    /// level's record capacity. Exceeding it triggers compaction.
    pub max_delete_proportion: f64,

    /// Advisory memory budget for the scheduler, in bytes. `0` = unlimited.
    pub memory_budget: usize,

    /// Worker threads for the pooled scheduler. `0` = scheduler default.
    pub worker_threads: usize,

    /// Level layout policy.
    pub layout_policy: LayoutPolicy,

    /// Delete policy.
    pub delete_policy: DeletePolicy,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            buffer_lwm: 1024,
            buffer_hwm: 4096,
            scale_factor: 8,
            max_delete_proportion: 0.05,
            memory_budget: 0,
            worker_threads: 0,
            layout_policy: LayoutPolicy::Tiering,
            delete_policy: DeletePolicy::Tombstone,
        }
    }
}

impl ExtensionConfig {
    /// Checks the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// - `InvalidWatermarks` unless `0 < buffer_lwm < buffer_hwm`.
    /// - `InvalidScaleFactor` unless `scale_factor >= 2`.
    /// - `InvalidDeleteProportion` unless `0 < max_delete_proportion < 1`.
    /// - `UnsupportedPolicy` for `(BentleySaxe, Tagging)`: flattening
    ///   rebuilds arbitrary level ranges, which tag walks do not follow.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_lwm == 0 || self.buffer_lwm >= self.buffer_hwm {
            return Err(ConfigError::InvalidWatermarks {
                lwm: self.buffer_lwm,
                hwm: self.buffer_hwm,
            });
        }

        if self.scale_factor < 2 {
            return Err(ConfigError::InvalidScaleFactor(self.scale_factor));
        }

        if !(self.max_delete_proportion > 0.0 && self.max_delete_proportion < 1.0) {
            return Err(ConfigError::InvalidDeleteProportion(
                self.max_delete_proportion,
            ));
        }

        if self.layout_policy == LayoutPolicy::BentleySaxe
            && self.delete_policy == DeletePolicy::Tagging
        {
            return Err(ConfigError::UnsupportedPolicy(
                "Bentley-Saxe layout with tagged deletes",
            ));
        }

        Ok(())
    }
}
