//! Per-depth lock bookkeeping for a mutation.
//!
//! A level holds the tiers locked at one depth of a descent, in the order
//! they were locked, and the structural operations queued against them. A
//! level is either shared (every tier read-locked) or exclusive (every tier
//! write-locked). Upgrading is not atomic: all guards are released and
//! write guards are taken again in left-to-right order, so callers must
//! re-test whatever they decided under the read locks.

use crate::operation::Operation;
use crate::tier::{Tier, TierReadGuard, TierRef, TierWriteGuard};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;
use strata_common::{Address, Result, StrataError};

/// Tiers modified by a mutation, keyed by address.
pub type DirtySet<T> = HashMap<Address, TierRef<T>>;

/// A tier held under a read or write guard.
pub enum Held<T> {
    Read(TierReadGuard<T>),
    Write(TierWriteGuard<T>),
}

impl<T> Held<T> {
    pub fn tier(&self) -> &Tier<T> {
        match self {
            Held::Read(guard) => guard,
            Held::Write(guard) => guard,
        }
    }

    pub fn address(&self) -> Address {
        self.tier().address()
    }

    /// Returns the shared handle of the held tier.
    pub fn tier_ref(&self) -> TierRef<T> {
        match self {
            Held::Read(guard) => Arc::clone(ArcRwLockReadGuard::rwlock(guard)),
            Held::Write(guard) => Arc::clone(ArcRwLockWriteGuard::rwlock(guard)),
        }
    }
}

/// Locked tiers and queued operations at one depth.
pub struct Level<T> {
    exclusive: bool,
    held: Vec<Held<T>>,
    /// Address of the tier on the descent path.
    path: Option<Address>,
    pub operations: Vec<Operation>,
}

impl<T> Level<T> {
    pub fn new(exclusive: bool) -> Self {
        Self {
            exclusive,
            held: Vec::new(),
            path: None,
            operations: Vec::new(),
        }
    }

    #[inline]
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn set_path(&mut self, address: Address) {
        self.path = Some(address);
    }

    fn lock(&self, tier: &TierRef<T>) -> Held<T> {
        if self.exclusive {
            Held::Write(tier.write_arc())
        } else {
            Held::Read(tier.read_arc())
        }
    }

    /// Locks `tier` in the level's mode and appends it.
    ///
    /// Does nothing if the tier is already held.
    pub fn lock_and_add(&mut self, tier: &TierRef<T>) {
        if self.holds_ref(tier) {
            return;
        }
        let held = self.lock(tier);
        self.held.push(held);
    }

    /// Locks `tier` and inserts it at `index`, keeping left-to-right order.
    pub fn lock_and_insert(&mut self, index: usize, tier: &TierRef<T>) {
        if self.holds_ref(tier) {
            return;
        }
        let held = self.lock(tier);
        let index = index.min(self.held.len());
        self.held.insert(index, held);
    }

    fn holds_ref(&self, tier: &TierRef<T>) -> bool {
        self.held.iter().any(|held| match held {
            Held::Read(guard) => Arc::ptr_eq(ArcRwLockReadGuard::rwlock(guard), tier),
            Held::Write(guard) => Arc::ptr_eq(ArcRwLockWriteGuard::rwlock(guard), tier),
        })
    }

    pub fn holds(&self, address: Address) -> bool {
        self.position(address).is_some()
    }

    pub fn position(&self, address: Address) -> Option<usize> {
        self.held.iter().position(|held| held.address() == address)
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.held.iter().map(Held::address).collect()
    }

    pub fn tiers(&self) -> impl Iterator<Item = &Tier<T>> {
        self.held.iter().map(Held::tier)
    }

    /// Returns the held tier at `address`.
    pub fn tier(&self, address: Address) -> Result<&Tier<T>> {
        self.held
            .iter()
            .find(|held| held.address() == address)
            .map(Held::tier)
            .ok_or_else(|| StrataError::internal(format!("{} is not held at this level", address)))
    }

    /// Returns the held tier at `address` for writing and marks it dirty.
    pub fn tier_mut(&mut self, address: Address, dirty: &mut DirtySet<T>) -> Result<&mut Tier<T>> {
        let held = self
            .held
            .iter_mut()
            .find(|held| held.address() == address)
            .ok_or_else(|| StrataError::internal(format!("{} is not held at this level", address)))?;
        match held {
            Held::Write(guard) => {
                dirty
                    .entry(address)
                    .or_insert_with(|| Arc::clone(ArcRwLockWriteGuard::rwlock(guard)));
                Ok(&mut **guard)
            }
            Held::Read(_) => Err(StrataError::internal(format!(
                "{} is only read-locked",
                address
            ))),
        }
    }

    /// Releases the guard on `address`. Returns true if it was held.
    pub fn unlock(&mut self, address: Address) -> bool {
        match self.position(address) {
            Some(index) => {
                self.held.remove(index);
                true
            }
            None => false,
        }
    }

    /// Releases every guard except the one on the path tier.
    pub fn retain_path(&mut self) {
        if let Some(path) = self.path {
            self.held.retain(|held| held.address() == path);
        }
    }

    /// Releases every guard, returning the handles in lock order.
    pub fn release(&mut self) -> Vec<TierRef<T>> {
        self.held.drain(..).map(|held| held.tier_ref()).collect()
    }

    /// Re-locks `tiers` in order in the level's mode.
    pub fn relock(&mut self, tiers: &[TierRef<T>]) {
        for tier in tiers {
            self.lock_and_add(tier);
        }
    }

    /// Converts the level to write locks.
    ///
    /// Returns false if the level was already exclusive.
    pub fn upgrade(&mut self) -> bool {
        if self.exclusive {
            return false;
        }
        let tiers = self.release();
        self.exclusive = true;
        self.relock(&tiers);
        true
    }

    /// Upgrades this level and the child level below it.
    ///
    /// The child's guards are released first so that write locks are
    /// always taken parent before child. Returns whether either level
    /// changed mode.
    pub fn upgrade_with(&mut self, child: &mut Level<T>) -> bool {
        if self.exclusive && child.exclusive {
            return false;
        }
        let child_tiers = child.release();
        self.upgrade();
        child.exclusive = true;
        child.relock(&child_tiers);
        true
    }

    /// Converts held write locks back to read locks without releasing them.
    pub fn downgrade(&mut self) {
        if !self.exclusive {
            return;
        }
        self.held = self
            .held
            .drain(..)
            .map(|held| match held {
                Held::Write(guard) => Held::Read(ArcRwLockWriteGuard::downgrade(guard)),
                read => read,
            })
            .collect();
        self.exclusive = false;
    }

    /// Drops cancellable operations. Returns true if any operation remains.
    pub fn rewind(&mut self) -> bool {
        self.operations.retain(|operation| !operation.is_cancellable());
        !self.operations.is_empty()
    }
}
