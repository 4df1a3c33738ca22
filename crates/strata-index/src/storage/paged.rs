//! Paged tier storage with a bounded tier cache.

use super::codec::{decode_tier, encode_tier, Record};
use super::Storage;
use crate::tier::{ChildType, Tier, TierRef};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_buffer::TierCache;
use strata_common::{Address, CacheConfig, Result, StrataError};
use tracing::{debug, trace};

/// Tier storage over encoded pages.
///
/// Every written tier is encoded into a page. Decoded tiers live in a
/// [`TierCache`]; a tier evicted from the cache is decoded again from its
/// page on the next load. Tiers held by a lock, a cursor or a dirty set are
/// pinned and stay resident, so in-memory edits are never lost to eviction.
pub struct PagedStorage<T> {
    pages: Mutex<HashMap<Address, Bytes>>,
    cache: TierCache<RwLock<Tier<T>>>,
    next_address: AtomicU64,
    commits: AtomicU64,
}

impl<T: Record> PagedStorage<T> {
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pages: Mutex::new(HashMap::new()),
            cache: TierCache::new(config),
            next_address: AtomicU64::new(0),
            commits: AtomicU64::new(0),
        })
    }

    /// Returns the tier cache.
    pub fn cache(&self) -> &TierCache<RwLock<Tier<T>>> {
        &self.cache
    }

    /// Returns the number of written pages.
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Returns the encoded page for `address`, if one was written.
    pub fn page(&self, address: Address) -> Option<Bytes> {
        self.pages.lock().get(&address).cloned()
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    fn allocate(&self, tier: impl FnOnce(Address) -> Tier<T>) -> TierRef<T> {
        let address = Address(self.next_address.fetch_add(1, Ordering::Relaxed));
        let tier = Arc::new(RwLock::new(tier(address)));
        self.cache.insert(address, Arc::clone(&tier));
        trace!(%address, "allocated tier");
        tier
    }
}

impl<T: Record + Send + Sync> Storage<T> for PagedStorage<T> {
    fn new_inner_tier(&self, child_type: ChildType) -> Result<TierRef<T>> {
        Ok(self.allocate(|address| Tier::new_inner(address, child_type)))
    }

    fn new_leaf_tier(&self) -> Result<TierRef<T>> {
        Ok(self.allocate(Tier::new_leaf))
    }

    fn load(&self, address: Address) -> Result<TierRef<T>> {
        self.cache.get_or_load(address, || {
            let page = self
                .pages
                .lock()
                .get(&address)
                .cloned()
                .ok_or(StrataError::TierNotFound {
                    address: address.as_u64(),
                })?;
            trace!(%address, "decoding tier page");
            Ok(RwLock::new(decode_tier(address, page)?))
        })
    }

    fn write(&self, tier: &Tier<T>) -> Result<()> {
        let page = encode_tier(tier);
        trace!(address = %tier.address(), bytes = page.len(), "wrote tier page");
        self.pages.lock().insert(tier.address(), page);
        Ok(())
    }

    fn free(&self, address: Address) -> Result<()> {
        let page = self.pages.lock().remove(&address);
        let cached = self.cache.invalidate(address);
        if page.is_none() && cached.is_none() {
            return Err(StrataError::TierNotFound {
                address: address.as_u64(),
            });
        }
        trace!(%address, "freed tier");
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let commits = self.commits.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            commits,
            pages = self.page_count(),
            resident = self.cache.len(),
            "committed tier pages"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::Bucket;
    use strata_common::FieldVector;

    fn storage(capacity: usize) -> PagedStorage<i64> {
        PagedStorage::new(CacheConfig { capacity }).unwrap()
    }

    #[test]
    fn test_rejects_invalid_cache_config() {
        assert!(PagedStorage::<i64>::new(CacheConfig { capacity: 0 }).is_err());
    }

    #[test]
    fn test_load_after_eviction_decodes_page() {
        let storage = storage(1);
        let address = {
            let leaf = storage.new_leaf_tier().unwrap();
            let mut guard = leaf.write();
            guard.as_leaf_mut().unwrap().buckets.push(Bucket {
                fields: Some(FieldVector::of(11i64)),
                object: 11,
            });
            storage.write(&guard).unwrap();
            guard.address()
        };

        // Allocating a second tier evicts the first, which is now unpinned.
        let other = storage.new_leaf_tier().unwrap();
        assert!(!storage.cache().contains(address));

        let reloaded = storage.load(address).unwrap();
        let guard = reloaded.read();
        assert_eq!(guard.as_leaf().unwrap().buckets[0].object, 11);
        drop(other);
    }

    #[test]
    fn test_pinned_tier_is_not_evicted() {
        let storage = storage(1);
        let pinned = storage.new_leaf_tier().unwrap();
        let address = pinned.read().address();

        let _second = storage.new_leaf_tier().unwrap();
        assert!(storage.cache().contains(address));
        assert!(Arc::ptr_eq(&storage.load(address).unwrap(), &pinned));
    }

    #[test]
    fn test_free_invalidates() {
        let storage = storage(4);
        let leaf = storage.new_leaf_tier().unwrap();
        let address = leaf.read().address();
        storage.write(&leaf.read()).unwrap();
        assert_eq!(storage.page_count(), 1);

        storage.free(address).unwrap();
        assert_eq!(storage.page_count(), 0);
        assert!(!storage.cache().contains(address));
        assert!(matches!(
            storage.load(address),
            Err(StrataError::TierNotFound { .. })
        ));
        assert!(storage.free(address).is_err());
    }

    #[test]
    fn test_corrupted_page() {
        let storage = storage(1);
        let address = Address(77);
        storage
            .pages
            .lock()
            .insert(address, Bytes::from_static(&[1, 0, 0]));
        assert!(matches!(
            storage.load(address),
            Err(StrataError::TierCorrupted { address: 77, .. })
        ));
    }
}
