//! Descent planning for inserts and removes.
//!
//! Both descents walk from the root to the target leaf holding read locks,
//! one level at a time. At each inner tier the descent asks whether the
//! step below could change the tier's shape. If it could, the affected
//! levels are upgraded and an operation is queued; if it cannot, every
//! level above is rewound and its write locks are downgraded. Levels with
//! nothing queued fall off the top of the stack as the descent moves on.

use crate::decision::Decision;
use crate::level::Level;
use crate::mutation::{Mutation, MutationKind};
use crate::operation::{select, LeafOperation, Operation, Selection};
use crate::tier::{ChildType, Tier, TierReadGuard, TierRef};
use std::cmp::Ordering;
use strata_common::{Address, Result, StrataError};
use tracing::trace;

/// The branch taken out of an inner tier.
struct Step {
    index: usize,
    child: Address,
    child_type: ChildType,
    /// Number of branches in the parent.
    len: usize,
    left: Option<Address>,
    right: Option<Address>,
}

enum RemovePlan {
    NotFound,
    Retry,
    Remove(Selection, Option<Operation>),
}

impl<T> Mutation<'_, T> {
    fn load(&self, address: Address) -> Result<TierRef<T>> {
        self.env.storage.load(address)
    }

    fn lock_root(&mut self) -> Result<()> {
        let root = self.load(self.env.root)?;
        let mut level = Level::new(false);
        level.lock_and_add(&root);
        level.set_path(self.env.root);
        self.levels.push(level);
        Ok(())
    }

    fn step(&self, p: usize, parent: Address) -> Result<Step> {
        let tier = self.levels[p].tier(parent)?.as_inner()?;
        if tier.is_empty() {
            return Err(StrataError::Corrupt(format!("inner tier {} is empty", parent)));
        }
        let index = tier.find(&self.fields);
        Ok(Step {
            index,
            child: tier.branches[index].address,
            child_type: tier.child_type,
            len: tier.len(),
            left: index.checked_sub(1).map(|i| tier.branches[i].address),
            right: tier.branches.get(index + 1).map(|branch| branch.address),
        })
    }

    /// Locks `child` on the level below `p`, creating the level if needed.
    fn descend_to(&mut self, p: usize, child: Address, exclusive: bool) -> Result<()> {
        if p + 1 == self.levels.len() {
            self.levels.push(Level::new(exclusive));
        }
        let tier = self.load(child)?;
        let level = &mut self.levels[p + 1];
        level.lock_and_add(&tier);
        level.set_path(child);
        Ok(())
    }

    /// Locks the overflow leaves that continue the duplicate run of `from`
    /// on level `k`.
    fn lock_run(&mut self, k: usize, from: Address) -> Result<()> {
        let capacity = self.env.config.leaf_capacity;
        let mut current = from;
        loop {
            let next = {
                let leaf = self.levels[k].tier(current)?.as_leaf()?;
                if leaf.len() < capacity
                    || self.env.storage.is_null(leaf.next)
                    || self.env.schema.uniform_key(leaf).is_none()
                {
                    return Ok(());
                }
                leaf.next
            };
            let newly_locked = !self.levels[k].holds(next);
            if newly_locked {
                let tier = self.load(next)?;
                self.levels[k].lock_and_add(&tier);
            }
            let continues = {
                let level = &self.levels[k];
                self.env
                    .schema
                    .continues_run(level.tier(current)?.as_leaf()?, level.tier(next)?.as_leaf()?)
            };
            if !continues {
                if newly_locked {
                    self.levels[k].unlock(next);
                }
                return Ok(());
            }
            current = next;
        }
    }

    // ========================================================================
    // Insert
    // ========================================================================

    /// Plans and applies an insert of the mutation's bucket.
    pub fn insert(&mut self) -> Result<()> {
        let root = self.env.root;
        self.lock_root()?;
        if self.decide(Decision::SplitRoot, 0, root)? {
            self.queue(0, Operation::SplitRoot);
        }

        let mut p = 0;
        let mut parent = root;
        loop {
            let step = self.step(p, parent)?;
            if step.child_type == ChildType::Leaf {
                self.plan_insert_leaf(p, parent, step.child)?;
                break;
            }
            self.descend_to(p, step.child, false)?;
            if self.decide(Decision::SplitInner, p, parent)? {
                self.queue(
                    p,
                    Operation::SplitInner {
                        parent,
                        child: step.child,
                    },
                );
            } else {
                self.rewind(1);
            }
            parent = step.child;
            p += 1;
            p -= self.shift();
        }
        self.apply()
    }

    fn plan_insert_leaf(&mut self, p: usize, parent: Address, leaf: Address) -> Result<()> {
        self.descend_to(p, leaf, true)?;
        loop {
            let (operation, structural) = self.insert_plan(p, parent, leaf)?;
            if structural.is_some() && !self.levels[p].is_exclusive() {
                let (upper, lower) = self.levels.split_at_mut(p + 1);
                upper[p].upgrade_with(&mut lower[0]);
                continue;
            }
            trace!(?operation, ?structural, "planned insert");
            self.leaf_operation = Some(operation);
            match structural {
                Some(structural) => self.queue(p, structural),
                None => self.rewind(1),
            }
            return Ok(());
        }
    }

    fn insert_plan(
        &mut self,
        p: usize,
        parent: Address,
        leaf: Address,
    ) -> Result<(LeafOperation, Option<Operation>)> {
        let key = {
            let tier = self.levels[p + 1].tier(leaf)?.as_leaf()?;
            if tier.len() < self.env.config.leaf_capacity {
                return Ok((LeafOperation::Insert { leaf }, None));
            }
            self.env.schema.uniform_key(tier)
        };
        let split = Some(Operation::SplitLeaf { parent, leaf });
        let Some(key) = key else {
            return Ok((LeafOperation::Insert { leaf }, split));
        };
        match self.fields.cmp(&key) {
            Ordering::Less => Ok((LeafOperation::Insert { leaf }, split)),
            Ordering::Equal => {
                self.lock_run(p + 1, leaf)?;
                Ok((LeafOperation::ExtendChain { leaf }, None))
            }
            Ordering::Greater => {
                self.lock_run(p + 1, leaf)?;
                Ok((
                    LeafOperation::InsertAfterChain { leaf },
                    Some(Operation::AppendLeaf {
                        parent,
                        after: leaf,
                    }),
                ))
            }
        }
    }

    // ========================================================================
    // Remove
    // ========================================================================

    /// Plans and applies a remove. Sets `scratch.retry` if the descent has
    /// to be restarted, and leaves `scratch.result` empty if nothing
    /// matched.
    ///
    /// With `scratch.search` set, the descent write-locks the predecessor
    /// leaf of every subtree it enters from the left, so an emptied leaf
    /// can always be unlinked.
    pub fn remove(&mut self) -> Result<()> {
        let root = self.env.root;
        self.lock_root()?;
        if self.decide(Decision::DeleteRoot, 0, root)? {
            let children: Vec<Address> = self.levels[0]
                .tier(root)?
                .as_inner()?
                .branches
                .iter()
                .map(|branch| branch.address)
                .collect();
            let mut level = Level::new(true);
            for child in children {
                level.lock_and_add(&self.load(child)?);
            }
            self.levels.push(level);
            self.queue(0, Operation::DeleteRoot);
        }

        let mut p = 0;
        let mut parent = root;
        loop {
            let step = self.step(p, parent)?;
            if self.decide(Decision::SwapKey, p, parent)? {
                self.queue(p, Operation::SwapKey { tier: parent });
            }
            if step.child_type == ChildType::Leaf {
                if step.index > 0 {
                    self.scratch.left_leaf = None;
                }
                self.scratch.leftmost &= step.index == 0;
                self.plan_remove_leaf(p, parent, &step)?;
                break;
            }

            self.descend_to(p, step.child, false)?;
            let siblings = self.lock_siblings(p, &step)?;
            if self.decide(Decision::MergeInner, p, parent)? {
                self.scratch.deleting = self.levels[p + 1].tier(step.child)?.len() == 1;
                self.queue(
                    p,
                    Operation::MergeInner {
                        parent,
                        child: step.child,
                    },
                );
            } else {
                for sibling in siblings {
                    self.levels[p + 1].unlock(sibling);
                }
                self.rewind(1);
            }

            if self.scratch.search && step.index > 0 {
                self.locate_predecessor(p, step.index, parent)?;
            }
            self.scratch.leftmost &= step.index == 0;
            parent = step.child;
            p += 1;
            p -= self.shift();
        }
        self.apply()
    }

    /// Read-locks the inner siblings adjacent to the path child, in
    /// left-to-right order. Returns the siblings locked by this call.
    fn lock_siblings(&mut self, p: usize, step: &Step) -> Result<Vec<Address>> {
        let mut locked = Vec::new();
        if let Some(left) = step.left {
            if !self.levels[p + 1].holds(left) {
                let tier = self.load(left)?;
                let at = self.levels[p + 1].position(step.child).unwrap_or(0);
                self.levels[p + 1].lock_and_insert(at, &tier);
                locked.push(left);
            }
        }
        if let Some(right) = step.right {
            if !self.levels[p + 1].holds(right) {
                let tier = self.load(right)?;
                let at = self.levels[p + 1]
                    .position(step.child)
                    .map_or(0, |index| index + 1);
                self.levels[p + 1].lock_and_insert(at, &tier);
                locked.push(right);
            }
        }
        Ok(locked)
    }

    /// Write-locks the last leaf of the subtree left of the branch taken at
    /// `index`, following its duplicate run to the end.
    fn locate_predecessor(&mut self, p: usize, index: usize, parent: Address) -> Result<()> {
        self.scratch.left_leaf = None;
        let start = self.levels[p].tier(parent)?.as_inner()?.branches[index - 1].address;

        let mut coupled: Option<TierReadGuard<T>> = None;
        let mut address = start;
        let leaf = loop {
            let next = match self.levels[p + 1].tier(address) {
                Ok(tier) => rightmost(tier)?,
                Err(_) => {
                    let guard = self.load(address)?.read_arc();
                    let next = rightmost(&guard)?;
                    coupled = Some(guard);
                    next
                }
            };
            match next {
                Some(next) => address = next,
                None => break address,
            }
        };
        drop(coupled);

        let capacity = self.env.config.leaf_capacity;
        let mut guard = self.load(leaf)?.write_arc();
        loop {
            let next = {
                let tier = guard.as_leaf()?;
                if tier.len() < capacity
                    || self.env.storage.is_null(tier.next)
                    || self.env.schema.uniform_key(tier).is_none()
                {
                    break;
                }
                tier.next
            };
            let next_guard = self.load(next)?.write_arc();
            if !self
                .env
                .schema
                .continues_run(guard.as_leaf()?, next_guard.as_leaf()?)
            {
                break;
            }
            guard = next_guard;
        }
        trace!(leaf = %guard.address(), "located predecessor leaf");
        self.scratch.left_leaf = Some(guard);
        Ok(())
    }

    fn plan_remove_leaf(&mut self, p: usize, parent: Address, step: &Step) -> Result<()> {
        self.descend_to(p, step.child, true)?;
        loop {
            match self.remove_plan(p, parent, step)? {
                RemovePlan::NotFound => {
                    trace!(fields = %self.fields, "no removable entry");
                    return Ok(());
                }
                RemovePlan::Retry => {
                    trace!(leaf = %step.child, "predecessor not held, retrying");
                    self.scratch.retry = true;
                    return Ok(());
                }
                RemovePlan::Remove(selection, structural) => {
                    if structural.is_some() && !self.levels[p].is_exclusive() {
                        let (upper, lower) = self.levels.split_at_mut(p + 1);
                        upper[p].upgrade_with(&mut lower[0]);
                        continue;
                    }
                    trace!(
                        ?structural,
                        entries = selection.matches.len(),
                        deleting = self.scratch.deleting,
                        "planned remove"
                    );
                    self.scratch.selection = Some(selection);
                    self.leaf_operation = Some(LeafOperation::Remove { leaf: step.child });
                    match structural {
                        Some(structural) => self.queue(p, structural),
                        None => self.rewind(1),
                    }
                    return Ok(());
                }
            }
        }
    }

    fn remove_plan(&mut self, p: usize, parent: Address, step: &Step) -> Result<RemovePlan> {
        let k = p + 1;
        let leaf = step.child;
        let capacity = self.env.config.leaf_capacity;
        self.lock_run(k, leaf)?;

        let MutationKind::Remove(deletable) = &self.kind else {
            return Err(StrataError::internal("remove planned for an insert"));
        };
        let Some(selection) =
            select(self.env.schema, &self.fields, *deletable, &self.levels[k], leaf)?
        else {
            return Ok(RemovePlan::NotFound);
        };

        let merge = Some(Operation::MergeLeaf { parent, leaf });
        // A run packs toward its head, so the head keeps whatever remains
        let remaining = selection.remaining;
        if remaining > capacity {
            return Ok(RemovePlan::Remove(selection, None));
        }
        if remaining > 0 {
            if let Some(right) = step.right {
                let newly_locked = !self.levels[k].holds(right);
                if newly_locked {
                    let tier = self.load(right)?;
                    self.levels[k].lock_and_add(&tier);
                }
                if remaining + self.levels[k].tier(right)?.len() <= capacity {
                    return Ok(RemovePlan::Remove(selection, merge));
                }
                if newly_locked {
                    self.levels[k].unlock(right);
                }
            }
            if let Some(left) = step.left {
                let left_len = match self.levels[k].tier(left) {
                    Ok(tier) => tier.len(),
                    Err(_) => self.load(left)?.read().len(),
                };
                if left_len + remaining <= capacity {
                    self.relock_left(k, left)?;
                    return Ok(RemovePlan::Remove(selection, merge));
                }
            }
            return Ok(RemovePlan::Remove(selection, None));
        }

        if parent == self.env.root && step.len == 1 {
            // The sole leaf of the tree stays even when empty
            return Ok(RemovePlan::Remove(selection, None));
        }
        if let Some(left) = step.left {
            self.relock_left(k, left)?;
            return Ok(RemovePlan::Remove(selection, merge));
        }
        if self.scratch.leftmost || self.scratch.left_leaf.is_some() {
            return Ok(RemovePlan::Remove(selection, merge));
        }
        Ok(RemovePlan::Retry)
    }

    /// Locks the left sibling leaf and its duplicate run ahead of the tiers
    /// already held on level `k`, releasing and re-taking them to keep
    /// left-to-right order.
    fn relock_left(&mut self, k: usize, left: Address) -> Result<()> {
        if self.levels[k].holds(left) {
            return Ok(());
        }
        let held = self.levels[k].release();
        let tier = self.load(left)?;
        self.levels[k].lock_and_add(&tier);
        self.lock_run(k, left)?;
        self.levels[k].relock(&held);
        Ok(())
    }
}

/// Returns the last child of an inner tier, or None for a leaf.
fn rightmost<T>(tier: &Tier<T>) -> Result<Option<Address>> {
    if tier.is_leaf() {
        return Ok(None);
    }
    tier.as_inner()?
        .branches
        .last()
        .map(|branch| Some(branch.address))
        .ok_or_else(|| StrataError::Corrupt(format!("inner tier {} is empty", tier.address())))
}
