//! Tier storage.
//!
//! The tree never owns its tiers. It asks a [`Storage`] to allocate, load,
//! write and free them by address, so the same engine runs over a plain
//! in-memory map or over encoded pages behind a bounded cache.

mod codec;
mod memory;
mod paged;

pub use codec::{decode_tier, encode_tier, Record};
pub use memory::InMemoryStorage;
pub use paged::PagedStorage;

use crate::tier::{ChildType, Tier, TierRef};
use strata_common::{Address, Result};

/// Backing store for the tiers of one or more trees.
///
/// Implementations must be safe to call while the caller holds tier locks.
pub trait Storage<T>: Send + Sync {
    /// Allocates an empty inner tier whose children are of `child_type`.
    fn new_inner_tier(&self, child_type: ChildType) -> Result<TierRef<T>>;

    /// Allocates an empty leaf tier.
    fn new_leaf_tier(&self) -> Result<TierRef<T>>;

    /// Returns the tier at `address`.
    fn load(&self, address: Address) -> Result<TierRef<T>>;

    /// Persists a dirty tier.
    fn write(&self, tier: &Tier<T>) -> Result<()>;

    /// Releases the tier at `address`.
    fn free(&self, address: Address) -> Result<()>;

    /// Finalizes a batch of writes.
    fn commit(&self) -> Result<()>;

    fn null_address(&self) -> Address {
        Address::NULL
    }

    fn is_null(&self, address: Address) -> bool {
        address == self.null_address()
    }
}
