//! Tiers: the inner and leaf nodes of the tree.
//!
//! A tier is addressed by its storage [`Address`] and shared behind an
//! `Arc<RwLock<..>>`. Inner tiers hold [`Branch`]es, leaf tiers hold
//! [`Bucket`]s and a link to the next leaf in key order.

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::sync::Arc;
use strata_common::{Address, FieldVector, Result, StrataError};

/// Shared handle to a locked tier.
pub type TierRef<T> = Arc<RwLock<Tier<T>>>;

/// Owned read guard over a tier, held by levels and cursors.
pub type TierReadGuard<T> = ArcRwLockReadGuard<RawRwLock, Tier<T>>;

/// Owned write guard over a tier.
pub type TierWriteGuard<T> = ArcRwLockWriteGuard<RawRwLock, Tier<T>>;

/// Kind of the children of an inner tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildType {
    Inner,
    Leaf,
}

impl ChildType {
    pub fn tag(&self) -> u8 {
        match self {
            ChildType::Inner => 0,
            ChildType::Leaf => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ChildType::Inner),
            1 => Some(ChildType::Leaf),
            _ => None,
        }
    }
}

/// Inner tier entry: a child address and the smallest key of its subtree.
///
/// The pivot is `None` only for branch 0, which covers every key below the
/// first real pivot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub address: Address,
    pub pivot: Option<FieldVector>,
}

impl Branch {
    pub fn new(address: Address, pivot: FieldVector) -> Self {
        Self {
            address,
            pivot: Some(pivot),
        }
    }

    /// Creates the leftmost branch of a tier.
    pub fn minimal(address: Address) -> Self {
        Self {
            address,
            pivot: None,
        }
    }
}

/// Inner tier contents.
#[derive(Debug, Clone)]
pub struct InnerTier {
    pub child_type: ChildType,
    pub branches: Vec<Branch>,
}

impl InnerTier {
    pub fn new(child_type: ChildType) -> Self {
        Self {
            child_type,
            branches: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.branches.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Returns the index of the branch whose subtree covers `fields`.
    ///
    /// That is the last branch whose pivot is less than or equal to
    /// `fields`, or branch 0 if every pivot is greater.
    pub fn find(&self, fields: &FieldVector) -> usize {
        if self.branches.len() <= 1 {
            return 0;
        }
        // Pivots of branches 1..n strictly increase
        self.branches[1..].partition_point(|branch| {
            branch
                .pivot
                .as_ref()
                .is_some_and(|pivot| pivot <= fields)
        })
    }

    /// Returns the index of the branch pointing at `address`.
    pub fn position(&self, address: Address) -> Option<usize> {
        self.branches
            .iter()
            .position(|branch| branch.address == address)
    }

    /// Returns the index of the branch pointing at `address`, or a corruption error.
    pub fn expect_position(&self, address: Address) -> Result<usize> {
        self.position(address).ok_or_else(|| {
            StrataError::Corrupt(format!("no branch references {}", address))
        })
    }

    /// Removes the branch at `index`.
    ///
    /// When branch 0 is removed the new branch 0 gives up its pivot, which
    /// is returned: it is the new smallest key of the tier's subtree.
    pub fn remove_branch(&mut self, index: usize) -> Option<FieldVector> {
        self.branches.remove(index);
        if index == 0 {
            self.branches
                .first_mut()
                .and_then(|branch| branch.pivot.take())
        } else {
            None
        }
    }
}

/// Leaf entry: the stored object and, when field caching is on, its fields.
#[derive(Debug, Clone)]
pub struct Bucket<T> {
    pub fields: Option<FieldVector>,
    pub object: T,
}

/// Leaf tier contents.
#[derive(Debug, Clone)]
pub struct LeafTier<T> {
    pub buckets: Vec<Bucket<T>>,
    pub next: Address,
}

impl<T> LeafTier<T> {
    pub fn new() -> Self {
        Self {
            buckets: Vec::new(),
            next: Address::NULL,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl<T> Default for LeafTier<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Body of a tier.
#[derive(Debug, Clone)]
pub enum TierBody<T> {
    Inner(InnerTier),
    Leaf(LeafTier<T>),
}

/// A node of the tree.
#[derive(Debug, Clone)]
pub struct Tier<T> {
    address: Address,
    body: TierBody<T>,
}

impl<T> Tier<T> {
    /// Creates an empty inner tier.
    pub fn new_inner(address: Address, child_type: ChildType) -> Self {
        Self {
            address,
            body: TierBody::Inner(InnerTier::new(child_type)),
        }
    }

    /// Creates an empty leaf tier.
    pub fn new_leaf(address: Address) -> Self {
        Self {
            address,
            body: TierBody::Leaf(LeafTier::new()),
        }
    }

    pub fn from_body(address: Address, body: TierBody<T>) -> Self {
        Self { address, body }
    }

    #[inline]
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn body(&self) -> &TierBody<T> {
        &self.body
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self.body, TierBody::Leaf(_))
    }

    /// Returns the number of branches or buckets.
    pub fn len(&self) -> usize {
        match &self.body {
            TierBody::Inner(inner) => inner.len(),
            TierBody::Leaf(leaf) => leaf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_inner(&self) -> Result<&InnerTier> {
        match &self.body {
            TierBody::Inner(inner) => Ok(inner),
            TierBody::Leaf(_) => Err(self.wrong_kind("inner")),
        }
    }

    pub fn as_inner_mut(&mut self) -> Result<&mut InnerTier> {
        match &mut self.body {
            TierBody::Inner(inner) => Ok(inner),
            TierBody::Leaf(_) => Err(StrataError::Corrupt(format!(
                "{} is a leaf, expected an inner tier",
                self.address
            ))),
        }
    }

    pub fn as_leaf(&self) -> Result<&LeafTier<T>> {
        match &self.body {
            TierBody::Leaf(leaf) => Ok(leaf),
            TierBody::Inner(_) => Err(self.wrong_kind("leaf")),
        }
    }

    pub fn as_leaf_mut(&mut self) -> Result<&mut LeafTier<T>> {
        match &mut self.body {
            TierBody::Leaf(leaf) => Ok(leaf),
            TierBody::Inner(_) => Err(StrataError::Corrupt(format!(
                "{} is an inner tier, expected a leaf",
                self.address
            ))),
        }
    }

    fn wrong_kind(&self, expected: &str) -> StrataError {
        StrataError::Corrupt(format!(
            "{} is not a {} tier",
            self.address, expected
        ))
    }
}
