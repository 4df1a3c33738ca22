//! Tier cache manager.

use crate::replacer::{ClockReplacer, FrameId, Replacer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_common::{Address, CacheConfig, Result};
use tracing::{debug, warn};

/// Hit and miss counters for a tier cache.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

struct Slot<V> {
    address: Address,
    value: Arc<V>,
}

struct CacheInner<V> {
    /// Slot storage, indexed by frame ID.
    slots: Vec<Option<Slot<V>>>,
    /// Address to frame ID mapping.
    table: HashMap<Address, FrameId>,
    /// Frames holding no tier.
    free_list: Vec<FrameId>,
}

/// Bounded cache of decoded tiers keyed by address.
///
/// Manages a pool of slots with:
/// - Address to slot mapping
/// - Free slot list for new tiers
/// - Clock replacement for eviction
/// - Pinning through the `Arc` reference count
///
/// A tier is pinned while anything outside the cache holds a clone of its
/// `Arc`, so a tier that is locked, dirty, or referenced by a cursor is never
/// evicted. When every slot is pinned the cache grows past its configured
/// capacity instead of failing.
pub struct TierCache<V> {
    config: CacheConfig,
    inner: Mutex<CacheInner<V>>,
    replacer: ClockReplacer,
    stats: CacheStats,
}

impl<V> TierCache<V> {
    /// Creates an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        let capacity = config.capacity;

        // All slots start in the free list, lowest frame popped first
        let free_list: Vec<_> = (0..capacity).rev().map(|i| FrameId(i as u32)).collect();
        let slots = (0..capacity).map(|_| None).collect();

        Self {
            config,
            inner: Mutex::new(CacheInner {
                slots,
                table: HashMap::with_capacity(capacity),
                free_list,
            }),
            replacer: ClockReplacer::new(capacity),
            stats: CacheStats::default(),
        }
    }

    /// Returns the configured number of slots.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Returns the number of resident tiers.
    pub fn len(&self) -> usize {
        self.inner.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks if a tier is resident.
    pub fn contains(&self, address: Address) -> bool {
        self.inner.lock().table.contains_key(&address)
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Returns the resident tier at `address`, if any.
    pub fn get(&self, address: Address) -> Option<Arc<V>> {
        let inner = self.inner.lock();
        let frame_id = *inner.table.get(&address)?;
        self.replacer.record_access(frame_id);
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        inner.slots[frame_id.0 as usize]
            .as_ref()
            .map(|slot| Arc::clone(&slot.value))
    }

    /// Returns the resident tier at `address`, loading it on a miss.
    ///
    /// The loader runs under the cache lock, so two callers missing on the
    /// same address share one decoded tier.
    pub fn get_or_load<F>(&self, address: Address, load: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        let mut inner = self.inner.lock();
        if let Some(&frame_id) = inner.table.get(&address) {
            if let Some(slot) = inner.slots[frame_id.0 as usize].as_ref() {
                self.replacer.record_access(frame_id);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(&slot.value));
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let value = Arc::new(load()?);
        self.admit(&mut inner, address, Arc::clone(&value));
        Ok(value)
    }

    /// Inserts a tier, replacing any tier already resident at `address`.
    pub fn insert(&self, address: Address, value: Arc<V>) {
        let mut inner = self.inner.lock();
        if let Some(&frame_id) = inner.table.get(&address) {
            inner.slots[frame_id.0 as usize] = Some(Slot { address, value });
            self.replacer.record_access(frame_id);
            return;
        }
        self.admit(&mut inner, address, value);
    }

    /// Drops the tier at `address` from the cache.
    ///
    /// Returns the dropped tier so callers can tell whether it was resident.
    pub fn invalidate(&self, address: Address) -> Option<Arc<V>> {
        let mut inner = self.inner.lock();
        let frame_id = inner.table.remove(&address)?;
        self.replacer.remove(frame_id);
        let slot = inner.slots[frame_id.0 as usize].take();
        inner.free_list.push(frame_id);
        slot.map(|slot| slot.value)
    }

    /// Returns the number of resident tiers referenced outside the cache.
    pub fn pinned_count(&self) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .flatten()
            .filter(|slot| Arc::strong_count(&slot.value) > 1)
            .count()
    }

    /// Places a tier in a free, evicted, or newly grown slot.
    fn admit(&self, inner: &mut CacheInner<V>, address: Address, value: Arc<V>) {
        let frame_id = match inner.free_list.pop() {
            Some(frame_id) => frame_id,
            None => self.allocate_frame(inner),
        };
        inner.slots[frame_id.0 as usize] = Some(Slot { address, value });
        inner.table.insert(address, frame_id);
        self.replacer.admit(frame_id);
    }

    /// Evicts an unpinned tier, or grows the slot array when all are pinned.
    fn allocate_frame(&self, inner: &mut CacheInner<V>) -> FrameId {
        let victim = {
            let slots = &inner.slots;
            self.replacer.evict(&|fid: FrameId| {
                slots[fid.0 as usize]
                    .as_ref()
                    .is_some_and(|slot| Arc::strong_count(&slot.value) == 1)
            })
        };

        if let Some(frame_id) = victim {
            if let Some(slot) = inner.slots[frame_id.0 as usize].take() {
                debug!(address = %slot.address, frame = %frame_id, "evicted tier");
                inner.table.remove(&slot.address);
            }
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            return frame_id;
        }

        let frame_id = FrameId(inner.slots.len() as u32);
        warn!(
            capacity = self.config.capacity,
            resident = inner.slots.len(),
            "every cached tier is pinned, growing tier cache"
        );
        inner.slots.push(None);
        self.replacer.grow(1);
        frame_id
    }
}
