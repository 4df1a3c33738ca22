//! In-memory tier storage.

use super::Storage;
use crate::tier::{ChildType, Tier, TierRef};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_common::{Address, Result, StrataError};
use tracing::trace;

/// In-memory tier storage.
///
/// Live tiers are kept in a map keyed by address. Addresses are handed out
/// in increasing order and never reused, so a stale address always fails to
/// load instead of aliasing a newer tier. `write` and `commit` only count
/// calls.
pub struct InMemoryStorage<T> {
    tiers: Mutex<HashMap<Address, TierRef<T>>>,
    next_address: AtomicU64,
    writes: AtomicU64,
    commits: AtomicU64,
}

impl<T> InMemoryStorage<T> {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self {
            tiers: Mutex::new(HashMap::new()),
            next_address: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            commits: AtomicU64::new(0),
        }
    }

    /// Returns the number of live tiers.
    pub fn tier_count(&self) -> usize {
        self.tiers.lock().len()
    }

    /// Returns the number of `write` calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Returns the number of `commit` calls so far.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    fn allocate(&self, tier: impl FnOnce(Address) -> Tier<T>) -> TierRef<T> {
        let address = Address(self.next_address.fetch_add(1, Ordering::Relaxed));
        let tier = Arc::new(RwLock::new(tier(address)));
        self.tiers.lock().insert(address, Arc::clone(&tier));
        trace!(%address, "allocated tier");
        tier
    }
}

impl<T> Default for InMemoryStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync> Storage<T> for InMemoryStorage<T> {
    fn new_inner_tier(&self, child_type: ChildType) -> Result<TierRef<T>> {
        Ok(self.allocate(|address| Tier::new_inner(address, child_type)))
    }

    fn new_leaf_tier(&self) -> Result<TierRef<T>> {
        Ok(self.allocate(Tier::new_leaf))
    }

    fn load(&self, address: Address) -> Result<TierRef<T>> {
        self.tiers
            .lock()
            .get(&address)
            .cloned()
            .ok_or(StrataError::TierNotFound {
                address: address.as_u64(),
            })
    }

    fn write(&self, tier: &Tier<T>) -> Result<()> {
        if !self.tiers.lock().contains_key(&tier.address()) {
            return Err(StrataError::TierNotFound {
                address: tier.address().as_u64(),
            });
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn free(&self, address: Address) -> Result<()> {
        match self.tiers.lock().remove(&address) {
            Some(_) => {
                trace!(%address, "freed tier");
                Ok(())
            }
            None => Err(StrataError::TierNotFound {
                address: address.as_u64(),
            }),
        }
    }

    fn commit(&self) -> Result<()> {
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
