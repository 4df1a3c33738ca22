//! Tier caching for Strata.
//!
//! This crate provides bounded caching of decoded tiers with:
//! - Address to slot mapping with a free slot list
//! - Clock eviction policy for cache management
//! - Pinning through shared references, so locked tiers stay resident

mod cache;
mod replacer;

pub use cache::{CacheStats, TierCache};
pub use replacer::{ClockReplacer, FrameId, Replacer};
