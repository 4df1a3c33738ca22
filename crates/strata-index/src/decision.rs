//! Structural decisions taken during a descent.
//!
//! A decision is first tested under whatever locks the level holds. If it
//! holds, the level (and, for child edits, the level below) is upgraded to
//! write locks and the decision is tested again, since upgrading releases
//! the read locks for a moment.

use crate::level::Level;
use crate::mutation::Env;
use crate::tier::ChildType;
use strata_common::{Address, FieldVector, Result};

/// A question asked of the parent tier at level `p` during a descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The root is full and an insert might overflow it.
    SplitRoot,
    /// The inner child on the path is full.
    SplitInner,
    /// The root has few enough inner children to be folded away.
    DeleteRoot,
    /// The inner child on the path may empty or fit into a sibling.
    MergeInner,
    /// The path tier carries the removed key as a pivot.
    SwapKey,
}

impl Decision {
    /// Returns true if acting on the decision needs the child level
    /// write-locked too.
    pub fn locks_child(&self) -> bool {
        matches!(self, Decision::SplitInner | Decision::MergeInner)
    }

    /// Tests the decision against the tiers currently held.
    pub(crate) fn test<T>(
        &self,
        env: Env<'_, T>,
        fields: &FieldVector,
        levels: &[Level<T>],
        p: usize,
        parent: Address,
    ) -> Result<bool> {
        let tier = levels[p].tier(parent)?.as_inner()?;
        let index = tier.find(fields);
        match self {
            Decision::SplitRoot => Ok(tier.len() >= env.config.inner_capacity),
            Decision::DeleteRoot => Ok(tier.child_type == ChildType::Inner && tier.len() <= 2),
            Decision::SwapKey => Ok(tier
                .branches
                .get(index)
                .and_then(|branch| branch.pivot.as_ref())
                == Some(fields)),
            Decision::SplitInner => {
                let child = &levels[p + 1];
                let len = child.tier(tier.branches[index].address)?.len();
                Ok(len >= env.config.inner_capacity)
            }
            Decision::MergeInner => {
                let child = &levels[p + 1];
                let len = child.tier(tier.branches[index].address)?.len();
                if len <= 1 {
                    return Ok(true);
                }
                let siblings = [index.checked_sub(1), Some(index + 1)];
                for sibling in siblings.into_iter().flatten() {
                    let Some(branch) = tier.branches.get(sibling) else {
                        continue;
                    };
                    if let Ok(held) = child.tier(branch.address) {
                        if len - 1 + held.len() <= env.config.inner_capacity {
                            return Ok(true);
                        }
                    }
                }
                Ok(false)
            }
        }
    }
}
