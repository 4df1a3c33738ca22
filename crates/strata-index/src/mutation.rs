//! State of a single insert or remove.
//!
//! A mutation owns the lock levels of its descent, the leaf action chosen
//! at the bottom and the scratch state threaded through structural edits.
//! Dropping a mutation releases every lock it holds.

use crate::decision::Decision;
use crate::level::{DirtySet, Level};
use crate::operation::{LeafOperation, Operation, Selection};
use crate::schema::Schema;
use crate::storage::Storage;
use crate::tier::{Branch, Bucket, TierWriteGuard};
use strata_common::{Address, FieldVector, Result, StrataConfig};
use tracing::trace;

/// Borrowed tree context shared by every step of a mutation.
pub(crate) struct Env<'a, T> {
    pub storage: &'a dyn Storage<T>,
    pub schema: &'a Schema<T>,
    pub config: &'a StrataConfig,
    pub root: Address,
}

impl<T> Clone for Env<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Env<'_, T> {}

pub(crate) enum MutationKind<'a, T> {
    /// The bucket to insert, taken when the leaf action runs.
    Insert(Option<Bucket<T>>),
    /// Accepts the entries to remove among those with equal fields.
    Remove(&'a dyn Fn(&T) -> bool),
}

/// Values carried between the descent and the structural edits.
pub(crate) struct Scratch<T> {
    pub dirty: DirtySet<T>,
    /// Tiers unlinked from the tree, freed when the query finishes.
    pub freed: Vec<Address>,
    /// The removed object.
    pub result: Option<T>,
    /// Entries the planned remove takes out of the target leaf.
    pub selection: Option<Selection>,
    /// Successor key for a pivot equal to the removed key.
    pub replacement: Option<FieldVector>,
    /// Write guard on the last leaf before the subtree being descended.
    pub left_leaf: Option<TierWriteGuard<T>>,
    /// Branch for a leaf created after a duplicate run.
    pub pending_branch: Option<Branch>,
    /// Set while descending through inner tiers that are about to empty.
    pub deleting: bool,
    /// Set while the removed key may still be a pivot further down.
    pub search: bool,
    /// Set when the remove must be restarted.
    pub retry: bool,
    /// Set while every branch taken so far was the first of its tier.
    pub leftmost: bool,
}

impl<T> Scratch<T> {
    fn new() -> Self {
        Self {
            dirty: DirtySet::new(),
            freed: Vec::new(),
            result: None,
            selection: None,
            replacement: None,
            left_leaf: None,
            pending_branch: None,
            deleting: false,
            search: false,
            retry: false,
            leftmost: true,
        }
    }
}

pub(crate) struct Mutation<'a, T> {
    pub env: Env<'a, T>,
    pub fields: FieldVector,
    pub kind: MutationKind<'a, T>,
    pub levels: Vec<Level<T>>,
    pub leaf_operation: Option<LeafOperation>,
    pub scratch: Scratch<T>,
}

impl<'a, T> Mutation<'a, T> {
    pub fn new(env: Env<'a, T>, fields: FieldVector, kind: MutationKind<'a, T>) -> Self {
        Self {
            env,
            fields,
            kind,
            levels: Vec::new(),
            leaf_operation: None,
            scratch: Scratch::new(),
        }
    }

    /// Cancels queued operations on every level above the bottom `keep`
    /// levels and downgrades levels that no longer need write locks.
    ///
    /// A level stays exclusive while it has operations of its own or while
    /// the level above has operations that edit it.
    pub fn rewind(&mut self, keep: usize) {
        let end = self.levels.len().saturating_sub(keep);
        for level in &mut self.levels[..end] {
            level.rewind();
        }
        for index in 0..end {
            let edited_from_above = index > 0
                && self.levels[index - 1]
                    .operations
                    .iter()
                    .any(Operation::locks_child);
            let level = &mut self.levels[index];
            if level.operations.is_empty() && !edited_from_above {
                level.downgrade();
                level.retain_path();
            }
        }
        self.scratch.deleting = false;
    }

    /// Releases leading levels that carry no operations, keeping at least
    /// three. Returns how many levels were removed.
    pub fn shift(&mut self) -> usize {
        let mut removed = 0;
        while self.levels.len() > 3 && self.levels[0].operations.is_empty() {
            self.levels.remove(0);
            removed += 1;
        }
        removed
    }

    /// Tests `decision`, upgrading the locks it needs and testing again.
    pub fn decide(&mut self, decision: Decision, p: usize, parent: Address) -> Result<bool> {
        if !decision.test(self.env, &self.fields, &self.levels, p, parent)? {
            return Ok(false);
        }
        let upgraded = if decision.locks_child() {
            let (upper, lower) = self.levels.split_at_mut(p + 1);
            upper[p].upgrade_with(&mut lower[0])
        } else {
            self.levels[p].upgrade()
        };
        if !upgraded {
            return Ok(true);
        }
        trace!(?decision, %parent, "re-testing after upgrade");
        decision.test(self.env, &self.fields, &self.levels, p, parent)
    }

    /// Queues `operation` on level `p` unless it is already queued there.
    pub fn queue(&mut self, p: usize, operation: Operation) {
        let operations = &mut self.levels[p].operations;
        if !operations.contains(&operation) {
            operations.push(operation);
        }
    }

    /// Runs the leaf action and, if it changed the leaf, every queued
    /// operation from the bottom level up. Releases all locks.
    pub fn apply(&mut self) -> Result<()> {
        let result = self.apply_locked();
        self.release();
        result
    }

    fn apply_locked(&mut self) -> Result<()> {
        let Some(leaf_operation) = self.leaf_operation.take() else {
            return Ok(());
        };
        let Some(leaf_level) = self.levels.last_mut() else {
            return Ok(());
        };
        let applied = leaf_operation.apply(
            self.env,
            &self.fields,
            &mut self.kind,
            &mut self.scratch,
            leaf_level,
        )?;
        if !applied {
            return Ok(());
        }

        for p in (0..self.levels.len()).rev() {
            let mut operations = std::mem::take(&mut self.levels[p].operations);
            if operations.is_empty() {
                continue;
            }
            operations.sort_by_key(Operation::phase);
            let (upper, lower) = self.levels.split_at_mut(p + 1);
            let level = &mut upper[p];
            let mut child = lower.first_mut();
            for operation in &operations {
                trace!(?operation, "applying");
                operation.apply(
                    self.env,
                    &self.fields,
                    &mut self.scratch,
                    level,
                    child.as_deref_mut(),
                )?;
            }
        }
        Ok(())
    }

    /// Releases every lock, bottom level first.
    pub fn release(&mut self) {
        self.scratch.left_leaf = None;
        while self.levels.pop().is_some() {}
    }

    /// Releases every lock and returns the scratch state.
    pub fn into_scratch(mut self) -> Scratch<T> {
        self.release();
        self.scratch
    }
}
