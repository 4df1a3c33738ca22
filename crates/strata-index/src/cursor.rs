//! Forward iteration over leaf entries.

use crate::schema::Schema;
use crate::storage::Storage;
use crate::tier::TierReadGuard;
use std::sync::Arc;
use strata_common::{FieldVector, Result};

/// Iterator over entries in key order, starting at a found position.
///
/// A cursor holds a read lock on its current leaf. Moving to the next leaf
/// locks it before the current one is released, so a cursor never observes
/// a leaf between a split and the update of its predecessor's link.
///
/// A cursor must be dropped before the same thread mutates the tree.
pub struct Cursor<T> {
    storage: Arc<dyn Storage<T>>,
    schema: Schema<T>,
    leaf: Option<TierReadGuard<T>>,
    index: usize,
    /// Stop at the first entry whose fields differ.
    bound: Option<FieldVector>,
}

impl<T> Cursor<T> {
    pub(crate) fn new(
        storage: Arc<dyn Storage<T>>,
        schema: Schema<T>,
        leaf: TierReadGuard<T>,
        index: usize,
        bound: Option<FieldVector>,
    ) -> Self {
        Self {
            storage,
            schema,
            leaf: Some(leaf),
            index,
            bound,
        }
    }

    /// Returns true once the cursor has released its last leaf.
    pub fn is_exhausted(&self) -> bool {
        self.leaf.is_none()
    }
}

impl<T: Clone> Iterator for Cursor<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let guard = self.leaf.as_ref()?;
            let leaf = match guard.as_leaf() {
                Ok(leaf) => leaf,
                Err(e) => {
                    self.leaf = None;
                    return Some(Err(e));
                }
            };

            if let Some(bucket) = leaf.buckets.get(self.index) {
                if let Some(bound) = &self.bound {
                    if *self.schema.fields(bucket) != *bound {
                        self.leaf = None;
                        return None;
                    }
                }
                self.index += 1;
                return Some(Ok(bucket.object.clone()));
            }

            let next = leaf.next;
            if self.storage.is_null(next) {
                self.leaf = None;
                return None;
            }
            match self.storage.load(next) {
                Ok(tier) => {
                    // Lock the successor before the current leaf is released
                    let successor = tier.read_arc();
                    self.leaf = Some(successor);
                    self.index = 0;
                }
                Err(e) => {
                    self.leaf = None;
                    return Some(Err(e));
                }
            }
        }
    }
}
