//! Structural edits and terminal leaf actions.
//!
//! Operations are queued on the level of the tier they edit while the
//! descent runs, and applied bottom-up once the leaf action succeeds. Each
//! operation re-checks the actual tier sizes when it is applied: a split
//! queued for a full tier does nothing if the tier did not overflow, and a
//! merge queued for a candidate does nothing if the merge no longer fits.

use crate::level::{DirtySet, Level};
use crate::mutation::{Env, MutationKind, Scratch};
use crate::schema::Schema;
use crate::tier::{Branch, Bucket, ChildType};
use std::mem;
use std::sync::Arc;
use strata_common::{Address, FieldVector, Result, StrataError};
use tracing::debug;

/// A structural edit queued at the level of the tier it edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Split an overfull root into two new children; the tree grows by one.
    SplitRoot,
    /// Split an overfull inner child, adding a branch to its parent.
    SplitInner { parent: Address, child: Address },
    /// Split an overfull leaf on a key boundary.
    SplitLeaf { parent: Address, leaf: Address },
    /// Add the branch for a leaf created after a duplicate run.
    AppendLeaf { parent: Address, after: Address },
    /// Fold the root's children into the root; the tree shrinks by one.
    DeleteRoot,
    /// Delete an empty inner child or merge it with a held sibling.
    MergeInner { parent: Address, child: Address },
    /// Unlink an empty leaf or merge it with a held sibling.
    MergeLeaf { parent: Address, leaf: Address },
    /// Replace the pivot equal to the removed key with its successor.
    SwapKey { tier: Address },
}

impl Operation {
    /// Returns false for operations that must run even when the locked
    /// region is rewound.
    pub fn is_cancellable(&self) -> bool {
        !matches!(self, Operation::SwapKey { .. } | Operation::DeleteRoot)
    }

    /// Returns true if the operation edits tiers held by the level below.
    pub fn locks_child(&self) -> bool {
        !matches!(self, Operation::SwapKey { .. } | Operation::SplitRoot)
    }

    /// Order of application within one level.
    ///
    /// Pivot swaps run before edits that may delete the swapped branch, and
    /// root edits run after the child edits that resize the root.
    pub fn phase(&self) -> u8 {
        match self {
            Operation::SwapKey { .. } => 0,
            Operation::SplitRoot | Operation::DeleteRoot => 2,
            _ => 1,
        }
    }

    /// Applies the operation to the tiers held at `level` and `child`.
    pub(crate) fn apply<T>(
        &self,
        env: Env<'_, T>,
        fields: &FieldVector,
        scratch: &mut Scratch<T>,
        level: &mut Level<T>,
        child: Option<&mut Level<T>>,
    ) -> Result<()> {
        match self {
            Operation::SplitRoot => split_root(env, scratch, level),
            Operation::SwapKey { tier } => swap_key(fields, scratch, level, *tier),
            Operation::AppendLeaf { parent, after } => append_leaf(scratch, level, *parent, *after),
            _ => {
                let child = child.ok_or_else(|| {
                    StrataError::internal(format!("{:?} queued without a child level", self))
                })?;
                match self {
                    Operation::SplitInner { parent, child: inner } => {
                        split_inner(env, scratch, level, child, *parent, *inner)
                    }
                    Operation::SplitLeaf { parent, leaf } => {
                        split_leaf(env, scratch, level, child, *parent, *leaf)
                    }
                    Operation::DeleteRoot => delete_root(env, scratch, level, child),
                    Operation::MergeInner { parent, child: inner } => {
                        merge_inner(env, scratch, level, child, *parent, *inner)
                    }
                    Operation::MergeLeaf { parent, leaf } => {
                        merge_leaf(env, scratch, level, child, *parent, *leaf)
                    }
                    Operation::SplitRoot
                    | Operation::SwapKey { .. }
                    | Operation::AppendLeaf { .. } => Ok(()),
                }
            }
        }
    }
}

/// The terminal action performed on the target leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafOperation {
    /// Insert in sorted position, after any equal entries.
    Insert { leaf: Address },
    /// Append to the last leaf of the duplicate run starting at `leaf`.
    ExtendChain { leaf: Address },
    /// Start a new leaf after the duplicate run starting at `leaf`.
    InsertAfterChain { leaf: Address },
    /// Remove every matching, deletable entry of the leaf and its run.
    Remove { leaf: Address },
}

impl LeafOperation {
    /// Applies the action. Returns false if there was nothing to do, in
    /// which case queued operations must not run.
    pub(crate) fn apply<T>(
        &self,
        env: Env<'_, T>,
        fields: &FieldVector,
        kind: &mut MutationKind<'_, T>,
        scratch: &mut Scratch<T>,
        level: &mut Level<T>,
    ) -> Result<bool> {
        match (self, kind) {
            (LeafOperation::Insert { leaf }, MutationKind::Insert(bucket)) => {
                let bucket = take_bucket(bucket)?;
                let tier = level.tier_mut(*leaf, &mut scratch.dirty)?.as_leaf_mut()?;
                let index = env.schema.upper_bound(&tier.buckets, fields);
                tier.buckets.insert(index, bucket);
                Ok(true)
            }
            (LeafOperation::ExtendChain { .. }, MutationKind::Insert(bucket)) => {
                let bucket = take_bucket(bucket)?;
                let end = run_end(level)?;
                let tier = level.tier_mut(end, &mut scratch.dirty)?.as_leaf_mut()?;
                if tier.len() < env.config.leaf_capacity {
                    tier.buckets.push(bucket);
                } else {
                    let overflow = allocate_leaf(env, &mut scratch.dirty, vec![bucket], tier.next)?;
                    tier.next = overflow;
                    debug!(run_end = %end, %overflow, "extended duplicate run");
                }
                Ok(true)
            }
            (LeafOperation::InsertAfterChain { .. }, MutationKind::Insert(bucket)) => {
                let bucket = take_bucket(bucket)?;
                let end = run_end(level)?;
                let tier = level.tier_mut(end, &mut scratch.dirty)?.as_leaf_mut()?;
                let created = allocate_leaf(env, &mut scratch.dirty, vec![bucket], tier.next)?;
                tier.next = created;
                scratch.pending_branch = Some(Branch::new(created, fields.clone()));
                Ok(true)
            }
            (LeafOperation::Remove { leaf }, MutationKind::Remove(_)) => {
                let selection = scratch
                    .selection
                    .take()
                    .filter(|selection| selection.run.first() == Some(leaf))
                    .ok_or_else(|| StrataError::internal(format!("no selection for {}", leaf)))?;
                let removed = if selection.is_chained() {
                    remove_from_run(env, scratch, level, &selection)?
                } else {
                    remove_from_leaf(env, fields, scratch, level, &selection)?
                };
                debug_assert_eq!(removed.len(), selection.matches.len());
                scratch.result = removed.into_iter().next().map(|bucket| bucket.object);
                Ok(true)
            }
            (operation, _) => Err(StrataError::internal(format!(
                "{:?} does not match the mutation kind",
                operation
            ))),
        }
    }
}

/// Entries accepted for removal from a leaf and its duplicate run.
pub(crate) struct Selection {
    /// The target leaf followed by the overflow leaves of its duplicate run.
    pub run: Vec<Address>,
    /// Positions of the accepted entries, in key order.
    pub matches: Vec<(Address, usize)>,
    /// Entries left in the run once the matches are gone.
    pub remaining: usize,
}

impl Selection {
    pub fn is_chained(&self) -> bool {
        self.run.len() > 1
    }
}

/// Collects every entry equal to `fields` accepted by `deletable`,
/// scanning from `leaf` across the held leaves of its duplicate run.
/// Returns `None` if nothing was accepted.
pub(crate) fn select<T>(
    schema: &Schema<T>,
    fields: &FieldVector,
    deletable: &dyn Fn(&T) -> bool,
    level: &Level<T>,
    leaf: Address,
) -> Result<Option<Selection>> {
    let addresses = level.addresses();
    let start = level
        .position(leaf)
        .ok_or_else(|| StrataError::internal(format!("{} is not held", leaf)))?;

    let mut run = vec![leaf];
    for pair in addresses[start..].windows(2) {
        let current = level.tier(pair[0])?.as_leaf()?;
        let next = level.tier(pair[1])?.as_leaf()?;
        if current.next != pair[1] || !schema.continues_run(current, next) {
            break;
        }
        run.push(pair[1]);
    }

    let mut matches = Vec::new();
    let mut total = 0;
    for (n, &address) in run.iter().enumerate() {
        let tier = level.tier(address)?.as_leaf()?;
        total += tier.len();
        let from = if n == 0 {
            schema.lower_bound(&tier.buckets, fields)
        } else {
            0
        };
        for (index, bucket) in tier.buckets.iter().enumerate().skip(from) {
            if *schema.fields(bucket) != *fields {
                break;
            }
            if deletable(&bucket.object) {
                matches.push((address, index));
            }
        }
    }
    if matches.is_empty() {
        return Ok(None);
    }
    Ok(Some(Selection {
        remaining: total - matches.len(),
        run,
        matches,
    }))
}

/// Removes the selected entries from a single leaf. Records the leaf's new
/// first key as the replacement pivot if the removed key led the leaf.
fn remove_from_leaf<T>(
    env: Env<'_, T>,
    fields: &FieldVector,
    scratch: &mut Scratch<T>,
    level: &mut Level<T>,
    selection: &Selection,
) -> Result<Vec<Bucket<T>>> {
    let tier = level.tier_mut(selection.run[0], &mut scratch.dirty)?.as_leaf_mut()?;
    let mut removed: Vec<_> = selection
        .matches
        .iter()
        .rev()
        .map(|&(_, index)| tier.buckets.remove(index))
        .collect();
    removed.reverse();

    if selection.matches.first().is_some_and(|&(_, index)| index == 0) {
        if let Some(first) = env.schema.first(tier) {
            if *first != *fields {
                scratch.replacement = Some(first.into_owned());
            }
        }
    }
    Ok(removed)
}

/// Removes the selected entries from a duplicate run and packs the rest
/// toward the head so every leaf but the last stays full. Overflow leaves
/// left empty are unlinked and released.
fn remove_from_run<T>(
    env: Env<'_, T>,
    scratch: &mut Scratch<T>,
    level: &mut Level<T>,
    selection: &Selection,
) -> Result<Vec<Bucket<T>>> {
    let mut kept = Vec::with_capacity(selection.remaining);
    let mut removed = Vec::with_capacity(selection.matches.len());
    let mut matches = selection.matches.iter().peekable();
    let mut end_next = Address::NULL;
    for &address in &selection.run {
        let tier = level.tier_mut(address, &mut scratch.dirty)?.as_leaf_mut()?;
        end_next = tier.next;
        for (index, bucket) in mem::take(&mut tier.buckets).into_iter().enumerate() {
            if matches
                .next_if(|&&(at, selected)| at == address && selected == index)
                .is_some()
            {
                removed.push(bucket);
            } else {
                kept.push(bucket);
            }
        }
    }

    let mut kept = kept.into_iter();
    let mut end = selection.run[0];
    for (n, &address) in selection.run.iter().enumerate() {
        let tier = level.tier_mut(address, &mut scratch.dirty)?.as_leaf_mut()?;
        tier.buckets.extend(kept.by_ref().take(env.config.leaf_capacity));
        if n == 0 || !tier.buckets.is_empty() {
            end = address;
        } else {
            scratch.freed.push(address);
            debug!(overflow = %address, "released empty overflow leaf");
        }
    }
    level.tier_mut(end, &mut scratch.dirty)?.as_leaf_mut()?.next = end_next;
    Ok(removed)
}

fn take_bucket<T>(bucket: &mut Option<Bucket<T>>) -> Result<Bucket<T>> {
    bucket
        .take()
        .ok_or_else(|| StrataError::internal("insert bucket already consumed"))
}

/// Returns the last held leaf, which is the end of the locked run.
fn run_end<T>(level: &Level<T>) -> Result<Address> {
    level
        .addresses()
        .last()
        .copied()
        .ok_or_else(|| StrataError::internal("leaf level holds no tiers"))
}

fn allocate_leaf<T>(
    env: Env<'_, T>,
    dirty: &mut DirtySet<T>,
    buckets: Vec<Bucket<T>>,
    next: Address,
) -> Result<Address> {
    let tier = env.storage.new_leaf_tier()?;
    let address = {
        let mut guard = tier.write();
        let leaf = guard.as_leaf_mut()?;
        leaf.buckets = buckets;
        leaf.next = next;
        guard.address()
    };
    dirty.insert(address, tier);
    Ok(address)
}

fn allocate_inner<T>(
    env: Env<'_, T>,
    dirty: &mut DirtySet<T>,
    child_type: ChildType,
    branches: Vec<Branch>,
) -> Result<Address> {
    let tier = env.storage.new_inner_tier(child_type)?;
    let address = {
        let mut guard = tier.write();
        guard.as_inner_mut()?.branches = branches;
        guard.address()
    };
    dirty.insert(address, Arc::clone(&tier));
    Ok(address)
}

/// Takes the pivot of the first branch of a split-off half.
fn promote(branches: &mut [Branch], address: Address) -> Result<FieldVector> {
    branches
        .first_mut()
        .and_then(|branch| branch.pivot.take())
        .ok_or_else(|| StrataError::Corrupt(format!("split of {} produced no pivot", address)))
}

/// Picks the key boundary nearest the middle of an overfull leaf.
fn split_point<T>(schema: &Schema<T>, buckets: &[Bucket<T>]) -> Option<usize> {
    let middle = buckets.len() / 2;
    let fields: Vec<_> = buckets.iter().map(|bucket| schema.fields(bucket)).collect();
    (1..fields.len())
        .filter(|&index| fields[index - 1] != fields[index])
        .min_by_key(|&index| index.abs_diff(middle))
}

fn split_root<T>(env: Env<'_, T>, scratch: &mut Scratch<T>, level: &mut Level<T>) -> Result<()> {
    let root = level.tier_mut(env.root, &mut scratch.dirty)?.as_inner_mut()?;
    if root.len() <= env.config.inner_capacity {
        return Ok(());
    }
    let child_type = root.child_type;
    let middle = root.len() / 2;
    let mut right_branches = root.branches.split_off(middle);
    let left_branches = mem::take(&mut root.branches);
    let pivot = promote(&mut right_branches, env.root)?;

    let left = allocate_inner(env, &mut scratch.dirty, child_type, left_branches)?;
    let right = allocate_inner(env, &mut scratch.dirty, child_type, right_branches)?;
    root.branches = vec![Branch::minimal(left), Branch::new(right, pivot)];
    root.child_type = ChildType::Inner;
    debug!(%left, %right, "split root");
    Ok(())
}

fn split_inner<T>(
    env: Env<'_, T>,
    scratch: &mut Scratch<T>,
    level: &mut Level<T>,
    child_level: &mut Level<T>,
    parent: Address,
    child: Address,
) -> Result<()> {
    let tier = child_level.tier_mut(child, &mut scratch.dirty)?.as_inner_mut()?;
    if tier.len() <= env.config.inner_capacity {
        return Ok(());
    }
    let middle = tier.len() / 2;
    let mut moved = tier.branches.split_off(middle);
    let child_type = tier.child_type;
    let pivot = promote(&mut moved, child)?;
    let sibling = allocate_inner(env, &mut scratch.dirty, child_type, moved)?;

    let parent_tier = level.tier_mut(parent, &mut scratch.dirty)?.as_inner_mut()?;
    let index = parent_tier.expect_position(child)?;
    parent_tier
        .branches
        .insert(index + 1, Branch::new(sibling, pivot));
    debug!(%child, %sibling, "split inner tier");
    Ok(())
}

fn split_leaf<T>(
    env: Env<'_, T>,
    scratch: &mut Scratch<T>,
    level: &mut Level<T>,
    leaf_level: &mut Level<T>,
    parent: Address,
    leaf: Address,
) -> Result<()> {
    let tier = leaf_level.tier_mut(leaf, &mut scratch.dirty)?.as_leaf_mut()?;
    if tier.len() <= env.config.leaf_capacity {
        return Ok(());
    }
    let at = split_point(env.schema, &tier.buckets).ok_or_else(|| {
        StrataError::Corrupt(format!("{} overflowed with a single key", leaf))
    })?;
    let moved = tier.buckets.split_off(at);
    let pivot = env.schema.fields(&moved[0]).into_owned();
    let sibling = allocate_leaf(env, &mut scratch.dirty, moved, tier.next)?;
    tier.next = sibling;

    let parent_tier = level.tier_mut(parent, &mut scratch.dirty)?.as_inner_mut()?;
    let index = parent_tier.expect_position(leaf)?;
    parent_tier
        .branches
        .insert(index + 1, Branch::new(sibling, pivot));
    debug!(%leaf, %sibling, at, "split leaf");
    Ok(())
}

fn append_leaf<T>(
    scratch: &mut Scratch<T>,
    level: &mut Level<T>,
    parent: Address,
    after: Address,
) -> Result<()> {
    let branch = scratch
        .pending_branch
        .take()
        .ok_or_else(|| StrataError::internal("no pending branch to append"))?;
    let parent_tier = level.tier_mut(parent, &mut scratch.dirty)?.as_inner_mut()?;
    let index = parent_tier.expect_position(after)?;
    debug!(leaf = %branch.address, "appended leaf after duplicate run");
    parent_tier.branches.insert(index + 1, branch);
    Ok(())
}

fn swap_key<T>(
    fields: &FieldVector,
    scratch: &mut Scratch<T>,
    level: &mut Level<T>,
    address: Address,
) -> Result<()> {
    let Some(replacement) = scratch.replacement.clone() else {
        return Ok(());
    };
    let tier = level.tier_mut(address, &mut scratch.dirty)?.as_inner_mut()?;
    if let Some(branch) = tier
        .branches
        .iter_mut()
        .find(|branch| branch.pivot.as_ref() == Some(fields))
    {
        debug!(tier = %address, pivot = %replacement, "swapped pivot");
        branch.pivot = Some(replacement);
    }
    Ok(())
}

/// Records a pivot promoted by deleting branch 0 as the replacement key.
fn promote_replacement<T>(scratch: &mut Scratch<T>, promoted: Option<FieldVector>) {
    if scratch.replacement.is_none() {
        scratch.replacement = promoted;
    }
}

fn merge_leaf<T>(
    env: Env<'_, T>,
    scratch: &mut Scratch<T>,
    level: &mut Level<T>,
    leaf_level: &mut Level<T>,
    parent: Address,
    leaf: Address,
) -> Result<()> {
    let capacity = env.config.leaf_capacity;
    let (len, next) = {
        let tier = leaf_level.tier(leaf)?.as_leaf()?;
        (tier.len(), tier.next)
    };
    let (index, left, right) = {
        let parent_tier = level.tier(parent)?.as_inner()?;
        let index = parent_tier.expect_position(leaf)?;
        let left = index
            .checked_sub(1)
            .map(|i| parent_tier.branches[i].address);
        let right = parent_tier.branches.get(index + 1).map(|b| b.address);
        (index, left, right)
    };

    if len == 0 {
        unlink(scratch, leaf_level, leaf, next)?;
        let parent_tier = level.tier_mut(parent, &mut scratch.dirty)?.as_inner_mut()?;
        let promoted = parent_tier.remove_branch(index);
        promote_replacement(scratch, promoted);
        scratch.freed.push(leaf);
        debug!(%leaf, "deleted empty leaf");
        return Ok(());
    }

    if let Some(right) = right.filter(|address| leaf_level.holds(*address)) {
        if len + leaf_level.tier(right)?.len() <= capacity {
            let right_tier = leaf_level.tier_mut(right, &mut scratch.dirty)?.as_leaf_mut()?;
            let buckets = mem::take(&mut right_tier.buckets);
            let right_next = right_tier.next;
            let tier = leaf_level.tier_mut(leaf, &mut scratch.dirty)?.as_leaf_mut()?;
            tier.buckets.extend(buckets);
            tier.next = right_next;
            level
                .tier_mut(parent, &mut scratch.dirty)?
                .as_inner_mut()?
                .remove_branch(index + 1);
            scratch.freed.push(right);
            debug!(%leaf, absorbed = %right, "merged leaf with right sibling");
            return Ok(());
        }
    }

    if let Some(left) = left.filter(|address| leaf_level.holds(*address)) {
        let fits = {
            let left_tier = leaf_level.tier(left)?.as_leaf()?;
            left_tier.next == leaf && left_tier.len() + len <= capacity
        };
        if fits {
            let tier = leaf_level.tier_mut(leaf, &mut scratch.dirty)?.as_leaf_mut()?;
            let buckets = mem::take(&mut tier.buckets);
            let left_tier = leaf_level.tier_mut(left, &mut scratch.dirty)?.as_leaf_mut()?;
            left_tier.buckets.extend(buckets);
            left_tier.next = next;
            level
                .tier_mut(parent, &mut scratch.dirty)?
                .as_inner_mut()?
                .remove_branch(index);
            scratch.freed.push(leaf);
            debug!(%leaf, into = %left, "merged leaf into left sibling");
        }
    }
    Ok(())
}

/// Points the predecessor of an empty leaf at the leaf's successor.
fn unlink<T>(
    scratch: &mut Scratch<T>,
    leaf_level: &mut Level<T>,
    leaf: Address,
    next: Address,
) -> Result<()> {
    let predecessor = leaf_level
        .tiers()
        .find(|tier| tier.as_leaf().is_ok_and(|l| l.next == leaf))
        .map(|tier| tier.address());
    if let Some(predecessor) = predecessor {
        leaf_level
            .tier_mut(predecessor, &mut scratch.dirty)?
            .as_leaf_mut()?
            .next = next;
        return Ok(());
    }

    if let Some(guard) = scratch.left_leaf.as_mut() {
        let address = guard.address();
        let left = guard.as_leaf_mut()?;
        if left.next == leaf {
            left.next = next;
            let tier = Arc::clone(parking_lot::lock_api::ArcRwLockWriteGuard::rwlock(guard));
            scratch.dirty.insert(address, tier);
            return Ok(());
        }
    }

    if scratch.leftmost {
        // The first leaf of the tree has no predecessor
        return Ok(());
    }
    Err(StrataError::internal(format!(
        "predecessor of {} is not held",
        leaf
    )))
}

fn merge_inner<T>(
    env: Env<'_, T>,
    scratch: &mut Scratch<T>,
    level: &mut Level<T>,
    child_level: &mut Level<T>,
    parent: Address,
    child: Address,
) -> Result<()> {
    let capacity = env.config.inner_capacity;
    let len = child_level.tier(child)?.len();
    let (index, left, right, child_pivot, right_pivot) = {
        let parent_tier = level.tier(parent)?.as_inner()?;
        let index = parent_tier.expect_position(child)?;
        let left = index
            .checked_sub(1)
            .map(|i| parent_tier.branches[i].address);
        let right = parent_tier.branches.get(index + 1).cloned();
        let child_pivot = parent_tier.branches[index].pivot.clone();
        (
            index,
            left,
            right.as_ref().map(|b| b.address),
            child_pivot,
            right.and_then(|b| b.pivot),
        )
    };

    if len == 0 {
        let parent_tier = level.tier_mut(parent, &mut scratch.dirty)?.as_inner_mut()?;
        let promoted = parent_tier.remove_branch(index);
        promote_replacement(scratch, promoted);
        scratch.freed.push(child);
        debug!(%child, "deleted empty inner tier");
        return Ok(());
    }

    if let Some(left) = left.filter(|address| child_level.holds(*address)) {
        if child_level.tier(left)?.len() + len <= capacity {
            let tier = child_level.tier_mut(child, &mut scratch.dirty)?.as_inner_mut()?;
            let mut moved = mem::take(&mut tier.branches);
            moved[0].pivot = child_pivot;
            child_level
                .tier_mut(left, &mut scratch.dirty)?
                .as_inner_mut()?
                .branches
                .extend(moved);
            level
                .tier_mut(parent, &mut scratch.dirty)?
                .as_inner_mut()?
                .remove_branch(index);
            scratch.freed.push(child);
            debug!(%child, into = %left, "merged inner tier into left sibling");
            return Ok(());
        }
    }

    if let Some(right) = right.filter(|address| child_level.holds(*address)) {
        if len + child_level.tier(right)?.len() <= capacity {
            let right_tier = child_level.tier_mut(right, &mut scratch.dirty)?.as_inner_mut()?;
            let mut moved = mem::take(&mut right_tier.branches);
            if let Some(first) = moved.first_mut() {
                first.pivot = right_pivot;
            }
            child_level
                .tier_mut(child, &mut scratch.dirty)?
                .as_inner_mut()?
                .branches
                .extend(moved);
            level
                .tier_mut(parent, &mut scratch.dirty)?
                .as_inner_mut()?
                .remove_branch(index + 1);
            scratch.freed.push(right);
            debug!(%child, absorbed = %right, "merged inner tier with right sibling");
        }
    }
    Ok(())
}

fn delete_root<T>(
    env: Env<'_, T>,
    scratch: &mut Scratch<T>,
    level: &mut Level<T>,
    child_level: &mut Level<T>,
) -> Result<()> {
    let (len, child_type, branches) = {
        let root = level.tier(env.root)?.as_inner()?;
        (root.len(), root.child_type, root.branches.clone())
    };

    match len {
        0 => {
            let leaf = allocate_leaf(env, &mut scratch.dirty, Vec::new(), Address::NULL)?;
            let root = level.tier_mut(env.root, &mut scratch.dirty)?.as_inner_mut()?;
            root.branches = vec![Branch::minimal(leaf)];
            root.child_type = ChildType::Leaf;
            debug!(%leaf, "root emptied, reset to a single leaf");
        }
        1 if child_type == ChildType::Inner => {
            let only = branches[0].address;
            if !child_level.holds(only) {
                return Ok(());
            }
            let child = child_level.tier_mut(only, &mut scratch.dirty)?.as_inner_mut()?;
            let absorbed = mem::take(&mut child.branches);
            let grandchild_type = child.child_type;
            let root = level.tier_mut(env.root, &mut scratch.dirty)?.as_inner_mut()?;
            root.branches = absorbed;
            root.child_type = grandchild_type;
            scratch.freed.push(only);
            debug!(absorbed = %only, "collapsed root onto its only child");
        }
        2 if child_type == ChildType::Inner => {
            let (left, right) = (branches[0].address, branches[1].address);
            if !child_level.holds(left) || !child_level.holds(right) {
                return Ok(());
            }
            if child_level.tier(left)?.len() + child_level.tier(right)?.len()
                > env.config.inner_capacity
            {
                return Ok(());
            }
            let left_tier = child_level.tier_mut(left, &mut scratch.dirty)?.as_inner_mut()?;
            let mut absorbed = mem::take(&mut left_tier.branches);
            let grandchild_type = left_tier.child_type;
            let right_tier = child_level.tier_mut(right, &mut scratch.dirty)?.as_inner_mut()?;
            let mut right_branches = mem::take(&mut right_tier.branches);
            if let Some(first) = right_branches.first_mut() {
                first.pivot = branches[1].pivot.clone();
            }
            absorbed.extend(right_branches);
            let root = level.tier_mut(env.root, &mut scratch.dirty)?.as_inner_mut()?;
            root.branches = absorbed;
            root.child_type = grandchild_type;
            scratch.freed.push(left);
            scratch.freed.push(right);
            debug!(%left, %right, "merged root children into the root");
        }
        _ => {}
    }
    Ok(())
}
