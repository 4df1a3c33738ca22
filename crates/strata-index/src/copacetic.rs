//! Whole-tree consistency check.
//!
//! Walks every inner tier from the root under read locks, then walks the
//! leaf chain from the first leaf. Any violation is reported as
//! [`StrataError::Corrupt`]. The check assumes no writer is active.

use crate::schema::Schema;
use crate::storage::Storage;
use crate::tier::ChildType;
use std::collections::{BTreeSet, HashSet};
use strata_common::{Address, FieldVector, Result, StrataConfig, StrataError};
use tracing::debug;

fn corrupt(message: String) -> StrataError {
    StrataError::Corrupt(message)
}

struct Checker<'a, T> {
    storage: &'a dyn Storage<T>,
    schema: &'a Schema<T>,
    config: &'a StrataConfig,
    pivots: BTreeSet<FieldVector>,
    /// Leaves referenced by branches, in key order.
    leaves: Vec<Address>,
    leaf_depth: Option<usize>,
}

/// Checks every structural invariant of the tree rooted at `root`.
pub(crate) fn check<T>(
    storage: &dyn Storage<T>,
    schema: &Schema<T>,
    config: &StrataConfig,
    root: Address,
) -> Result<()> {
    let mut checker = Checker {
        storage,
        schema,
        config,
        pivots: BTreeSet::new(),
        leaves: Vec::new(),
        leaf_depth: None,
    };
    checker.inner(root, 0, None, None, true)?;
    checker.leaf_chain()?;
    debug!(
        leaves = checker.leaves.len(),
        pivots = checker.pivots.len(),
        "tree is copacetic"
    );
    Ok(())
}

impl<T> Checker<'_, T> {
    /// Checks the subtree at `address`, returning its smallest key.
    fn inner(
        &mut self,
        address: Address,
        depth: usize,
        lower: Option<&FieldVector>,
        upper: Option<&FieldVector>,
        is_root: bool,
    ) -> Result<Option<FieldVector>> {
        let guard = self.storage.load(address)?.read_arc();
        let tier = guard.as_inner()?;
        if tier.is_empty() {
            return Err(corrupt(format!("inner tier {} is empty", address)));
        }
        if tier.len() > self.config.inner_capacity {
            return Err(corrupt(format!(
                "inner tier {} holds {} branches, over capacity",
                address,
                tier.len()
            )));
        }
        if tier.branches[0].pivot.is_some() {
            return Err(corrupt(format!("first branch of {} has a pivot", address)));
        }

        let mut pivots = Vec::with_capacity(tier.len());
        for branch in &tier.branches[1..] {
            let pivot = branch.pivot.as_ref().ok_or_else(|| {
                corrupt(format!("branch {} of {} has no pivot", branch.address, address))
            })?;
            if let Some(previous) = pivots.last() {
                if *previous >= pivot {
                    return Err(corrupt(format!("pivots of {} are not increasing", address)));
                }
            }
            if lower.is_some_and(|lower| pivot <= lower) || upper.is_some_and(|upper| pivot >= upper) {
                return Err(corrupt(format!("pivot {} of {} is out of bounds", pivot, address)));
            }
            if !self.pivots.insert(pivot.clone()) {
                return Err(corrupt(format!("pivot {} appears more than once", pivot)));
            }
            pivots.push(pivot);
        }

        let sole = is_root && tier.len() == 1;
        let mut minimum = None;
        for (index, branch) in tier.branches.iter().enumerate() {
            let child_lower = if index == 0 { lower } else { Some(pivots[index - 1]) };
            let child_upper = pivots.get(index).copied().or(upper);
            let child_minimum = match tier.child_type {
                ChildType::Inner => {
                    self.inner(branch.address, depth + 1, child_lower, child_upper, false)?
                }
                ChildType::Leaf => {
                    self.leaf(branch.address, depth + 1, child_lower, child_upper, sole)?
                }
            };
            if index == 0 {
                minimum = child_minimum;
            } else if child_minimum.as_ref() != Some(pivots[index - 1]) {
                return Err(corrupt(format!(
                    "pivot {} of {} is not the minimum of {}",
                    pivots[index - 1],
                    address,
                    branch.address
                )));
            }
        }
        Ok(minimum)
    }

    fn leaf(
        &mut self,
        address: Address,
        depth: usize,
        lower: Option<&FieldVector>,
        upper: Option<&FieldVector>,
        sole: bool,
    ) -> Result<Option<FieldVector>> {
        match self.leaf_depth {
            Some(expected) if expected != depth => {
                return Err(corrupt(format!(
                    "leaf {} at depth {}, expected {}",
                    address, depth, expected
                )));
            }
            _ => self.leaf_depth = Some(depth),
        }

        let guard = self.storage.load(address)?.read_arc();
        let leaf = guard.as_leaf()?;
        if leaf.len() > self.config.leaf_capacity {
            return Err(corrupt(format!("leaf {} is over capacity", address)));
        }
        if leaf.is_empty() && !sole {
            return Err(corrupt(format!("leaf {} is empty", address)));
        }
        let fields: Vec<_> = leaf
            .buckets
            .iter()
            .map(|bucket| self.schema.fields(bucket))
            .collect();
        if fields.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(corrupt(format!("leaf {} is not sorted", address)));
        }
        if let (Some(first), Some(lower)) = (fields.first(), lower) {
            if **first < *lower {
                return Err(corrupt(format!("leaf {} starts below its pivot", address)));
            }
        }
        if let (Some(last), Some(upper)) = (fields.last(), upper) {
            if **last >= *upper {
                return Err(corrupt(format!("leaf {} reaches its right pivot", address)));
            }
        }
        self.leaves.push(address);
        Ok(fields.first().map(|first| first.clone().into_owned()))
    }

    /// Walks the linked leaves, checking order across leaves and that
    /// unreferenced leaves only continue a full duplicate run.
    fn leaf_chain(&self) -> Result<()> {
        let Some(&first) = self.leaves.first() else {
            return Err(corrupt("tree references no leaves".to_string()));
        };
        let capacity = self.config.leaf_capacity;
        let mut expected = self.leaves.iter().peekable();
        let mut visited = HashSet::new();
        let mut previous_last: Option<FieldVector> = None;
        let mut run_key: Option<FieldVector> = None;
        let mut current = first;

        while !self.storage.is_null(current) {
            if !visited.insert(current) {
                return Err(corrupt(format!("leaf chain cycles at {}", current)));
            }
            let guard = self.storage.load(current)?.read_arc();
            let leaf = guard.as_leaf()?;

            if expected.peek() == Some(&&current) {
                expected.next();
            } else {
                let Some(key) = run_key.as_ref() else {
                    return Err(corrupt(format!(
                        "leaf {} is unreferenced and follows no full run",
                        current
                    )));
                };
                if leaf.is_empty()
                    || leaf
                        .buckets
                        .iter()
                        .any(|bucket| *self.schema.fields(bucket) != *key)
                {
                    return Err(corrupt(format!(
                        "overflow leaf {} holds keys other than {}",
                        current, key
                    )));
                }
            }

            if let (Some(last), Some(first)) = (previous_last.as_ref(), self.schema.first(leaf)) {
                if *last > *first {
                    return Err(corrupt(format!("leaf {} is out of order", current)));
                }
            }
            if let Some(last) = self.schema.last(leaf) {
                previous_last = Some(last.into_owned());
            }
            run_key = if leaf.len() >= capacity {
                self.schema.uniform_key(leaf)
            } else {
                None
            };
            current = leaf.next;
        }

        if let Some(missing) = expected.next() {
            return Err(corrupt(format!("leaf {} is not reached in order", missing)));
        }
        Ok(())
    }
}
