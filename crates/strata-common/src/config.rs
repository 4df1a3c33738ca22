//! Configuration structures for Strata.

use crate::error::{Result, StrataError};
use serde::{Deserialize, Serialize};

/// Smallest capacity that still lets a full tier split into two non-empty halves.
pub const MIN_CAPACITY: usize = 2;

/// Tree shape and write batching configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrataConfig {
    /// Maximum number of branches in an inner tier.
    pub inner_capacity: usize,
    /// Maximum number of buckets in a leaf tier.
    pub leaf_capacity: usize,
    /// Dirty tiers a query may accumulate before it flushes on its own.
    pub max_dirty_tiers: usize,
    /// Cache extracted fields in each bucket instead of re-extracting them.
    pub cache_fields: bool,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            inner_capacity: 64,
            leaf_capacity: 64,
            max_dirty_tiers: 256,
            cache_fields: true,
        }
    }
}

impl StrataConfig {
    /// Returns a configuration with both capacities set to `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner_capacity: capacity,
            leaf_capacity: capacity,
            ..Default::default()
        }
    }

    /// Checks the configuration for values the tree cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.inner_capacity < MIN_CAPACITY {
            return Err(StrataError::InvalidParameter {
                name: "inner_capacity".to_string(),
                value: self.inner_capacity.to_string(),
            });
        }
        if self.leaf_capacity < MIN_CAPACITY {
            return Err(StrataError::InvalidParameter {
                name: "leaf_capacity".to_string(),
                value: self.leaf_capacity.to_string(),
            });
        }
        if self.max_dirty_tiers == 0 {
            return Err(StrataError::InvalidParameter {
                name: "max_dirty_tiers".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration for the tier cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of decoded tiers kept resident.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

impl CacheConfig {
    /// Checks the configuration for values the cache cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(StrataError::InvalidParameter {
                name: "capacity".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}
