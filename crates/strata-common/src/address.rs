//! Tier addresses.

use serde::{Deserialize, Serialize};

/// Stable identity of a tier within its storage.
///
/// Addresses are opaque to the tree: an in-memory slot number for the
/// memory store, a page number for the paged store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub u64);

impl Address {
    /// Sentinel for "no tier", e.g. the `next` link of the last leaf.
    pub const NULL: Address = Address(u64::MAX);

    /// Returns true if this is the null sentinel.
    #[inline]
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "tier:null")
        } else {
            write!(f, "tier:{}", self.0)
        }
    }
}
