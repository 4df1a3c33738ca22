//! The tree handle and its query surface.

use crate::copacetic;
use crate::cursor::Cursor;
use crate::level::DirtySet;
use crate::mutation::{Env, Mutation, MutationKind, Scratch};
use crate::schema::{FieldExtractor, Schema};
use crate::storage::Storage;
use crate::tier::{Branch, ChildType, TierBody};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::sync::Arc;
use strata_common::{Address, FieldVector, Result, StrataConfig, StrataError};
use tracing::{debug, error, trace};

/// Attempts made by a remove before giving up. The second attempt always
/// locates the predecessor leaf, so a third is only needed if the tree
/// changed shape in between.
const MAX_REMOVE_ATTEMPTS: usize = 3;

struct Shared<T> {
    storage: Arc<dyn Storage<T>>,
    schema: Schema<T>,
    config: StrataConfig,
    root: Address,
    /// Serializes mutations. Held by a query from its first unflushed
    /// change until flush.
    gate: Arc<Mutex<()>>,
}

/// Handle to one tree. Cheap to clone and share between threads.
///
/// Every operation goes through a [`Query`] created with
/// [`Strata::query`]. Queries on different threads may read concurrently
/// with one writer.
pub struct Strata<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Strata<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Strata<T> {
    /// Creates an empty tree: a root over a single empty leaf.
    pub fn create<E>(storage: Arc<dyn Storage<T>>, extractor: E, config: StrataConfig) -> Result<Self>
    where
        E: FieldExtractor<T> + 'static,
    {
        config.validate()?;
        let root = storage.new_inner_tier(ChildType::Leaf)?;
        let leaf = storage.new_leaf_tier()?;

        let leaf_guard = leaf.read();
        let mut root_guard = root.write();
        root_guard
            .as_inner_mut()?
            .branches
            .push(Branch::minimal(leaf_guard.address()));
        storage.write(&leaf_guard)?;
        storage.write(&root_guard)?;
        storage.commit()?;

        let address = root_guard.address();
        debug!(root = %address, leaf = %leaf_guard.address(), "created tree");
        drop(root_guard);
        drop(leaf_guard);
        Ok(Self::assemble(storage, extractor, config, address))
    }

    /// Attaches to a tree previously created in `storage` at `root`.
    pub fn open<E>(
        storage: Arc<dyn Storage<T>>,
        extractor: E,
        config: StrataConfig,
        root: Address,
    ) -> Result<Self>
    where
        E: FieldExtractor<T> + 'static,
    {
        config.validate()?;
        let tier = storage.load(root)?;
        if tier.read().as_inner()?.is_empty() {
            return Err(StrataError::Corrupt(format!("root {} has no branches", root)));
        }
        debug!(%root, "opened tree");
        Ok(Self::assemble(storage, extractor, config, root))
    }

    fn assemble<E>(
        storage: Arc<dyn Storage<T>>,
        extractor: E,
        config: StrataConfig,
        root: Address,
    ) -> Self
    where
        E: FieldExtractor<T> + 'static,
    {
        let schema = Schema::new(Arc::new(extractor), config.cache_fields);
        Self {
            shared: Arc::new(Shared {
                storage,
                schema,
                config,
                root,
                gate: Arc::new(Mutex::new(())),
            }),
        }
    }

    /// Returns the address of the root tier, which never changes.
    pub fn root_address(&self) -> Address {
        self.shared.root
    }

    pub fn config(&self) -> &StrataConfig {
        &self.shared.config
    }

    pub fn schema(&self) -> &Schema<T> {
        &self.shared.schema
    }

    /// Starts a new query against the tree.
    pub fn query(&self) -> Query<T> {
        Query {
            strata: self.clone(),
            dirty: DirtySet::new(),
            gate: None,
        }
    }
}

fn env<T>(shared: &Shared<T>) -> Env<'_, T> {
    Env {
        storage: shared.storage.as_ref(),
        schema: &shared.schema,
        config: &shared.config,
        root: shared.root,
    }
}

/// A sequence of operations against one tree.
///
/// A query collects the tiers its mutations dirty and writes them on
/// [`flush`](Query::flush), or automatically once more than
/// `max_dirty_tiers` are pending. From its first mutation until that flush
/// it holds the tree's write gate, so other queries' mutations wait.
///
/// Dropping a query flushes it. Cursors returned by `find` and `first` must
/// be dropped before the same thread mutates the tree.
pub struct Query<T> {
    strata: Strata<T>,
    dirty: DirtySet<T>,
    gate: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl<T: Clone + Send + Sync + 'static> Query<T> {
    fn enter(&mut self) {
        if self.gate.is_none() {
            self.gate = Some(self.strata.shared.gate.lock_arc());
            trace!(root = %self.strata.shared.root, "acquired write gate");
        }
    }

    /// Inserts `object`. Objects with equal fields are kept in insertion
    /// order.
    pub fn insert(&mut self, object: T) -> Result<()> {
        self.enter();
        let shared = Arc::clone(&self.strata.shared);
        let fields = shared.schema.extract(&object);
        let bucket = shared.schema.bucket(object, fields.clone());

        let mut mutation = Mutation::new(env(&shared), fields, MutationKind::Insert(Some(bucket)));
        let result = mutation.insert();
        let scratch = mutation.into_scratch();
        self.absorb(scratch)?;
        result
    }

    /// Removes every entry with `fields` accepted by `deletable`, scanning
    /// across the whole duplicate run. Returns the first entry removed, or
    /// `None` if no entry matched.
    ///
    /// `deletable` may be called more than once for the same entry.
    pub fn remove(
        &mut self,
        fields: &FieldVector,
        deletable: &dyn Fn(&T) -> bool,
    ) -> Result<Option<T>> {
        let shared = Arc::clone(&self.strata.shared);
        let mut search = false;
        for attempt in 1..=MAX_REMOVE_ATTEMPTS {
            self.enter();
            let mut mutation =
                Mutation::new(env(&shared), fields.clone(), MutationKind::Remove(deletable));
            mutation.scratch.search = search;
            let result = mutation.remove();
            let mut scratch = mutation.into_scratch();
            let retry = scratch.retry;
            let removed = scratch.result.take();
            self.absorb(scratch)?;
            result?;

            if !retry {
                return Ok(removed);
            }
            trace!(attempt, %fields, "retrying remove with predecessor search");
            search = true;
        }
        Err(StrataError::RetryExhausted {
            attempts: MAX_REMOVE_ATTEMPTS,
        })
    }

    /// Removes every entry equal to `object`.
    pub fn remove_object(&mut self, object: &T) -> Result<Option<T>>
    where
        T: PartialEq,
    {
        let fields = self.strata.shared.schema.extract(object);
        self.remove(&fields, &|candidate: &T| candidate == object)
    }

    /// Returns a cursor over the entries whose fields equal `fields`.
    pub fn find(&self, fields: &FieldVector) -> Result<Cursor<T>> {
        let shared = &self.strata.shared;
        let mut guard = shared.storage.load(shared.root)?.read_arc();
        loop {
            let next = match guard.body() {
                TierBody::Inner(inner) => inner
                    .branches
                    .get(inner.find(fields))
                    .map(|branch| branch.address)
                    .ok_or_else(|| {
                        StrataError::Corrupt(format!("inner tier {} is empty", guard.address()))
                    })?,
                TierBody::Leaf(leaf) => {
                    let index = shared.schema.lower_bound(&leaf.buckets, fields);
                    return Ok(Cursor::new(
                        Arc::clone(&shared.storage),
                        shared.schema.clone(),
                        guard,
                        index,
                        Some(fields.clone()),
                    ));
                }
            };
            guard = shared.storage.load(next)?.read_arc();
        }
    }

    /// Returns a cursor over every entry, in key order.
    pub fn first(&self) -> Result<Cursor<T>> {
        let shared = &self.strata.shared;
        let mut guard = shared.storage.load(shared.root)?.read_arc();
        loop {
            let next = match guard.body() {
                TierBody::Inner(inner) => inner
                    .branches
                    .first()
                    .map(|branch| branch.address)
                    .ok_or_else(|| {
                        StrataError::Corrupt(format!("inner tier {} is empty", guard.address()))
                    })?,
                TierBody::Leaf(_) => {
                    return Ok(Cursor::new(
                        Arc::clone(&shared.storage),
                        shared.schema.clone(),
                        guard,
                        0,
                        None,
                    ));
                }
            };
            guard = shared.storage.load(next)?.read_arc();
        }
    }

    /// Returns every entry whose fields equal `fields`, in insertion order.
    pub fn find_all(&self, fields: &FieldVector) -> Result<Vec<T>> {
        self.find(fields)?.collect()
    }

    /// Checks every structural invariant of the tree.
    pub fn copacetic(&self) -> Result<()> {
        let shared = &self.strata.shared;
        let _gate = self.gate.is_none().then(|| shared.gate.lock());
        copacetic::check(
            shared.storage.as_ref(),
            &shared.schema,
            &shared.config,
            shared.root,
        )
    }

    /// Number of tiers changed since the last flush.
    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    /// Writes every dirty tier, commits, and releases the write gate.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty.is_empty() {
            let tiers = self.write_dirty()?;
            debug!(tiers, "flushed dirty tiers");
            self.dirty.clear();
        }
        self.gate = None;
        Ok(())
    }

    /// Frees every tier of the tree, including the root.
    ///
    /// The tree handle must not be used afterwards.
    pub fn destroy(mut self) -> Result<()> {
        self.enter();
        self.dirty.clear();
        let shared = Arc::clone(&self.strata.shared);
        let storage = shared.storage.as_ref();

        let mut tiers = Vec::new();
        let mut pending = vec![shared.root];
        let mut first_leaf = None;
        while let Some(address) = pending.pop() {
            let tier = storage.load(address)?;
            let guard = tier.read();
            if let TierBody::Inner(inner) = guard.body() {
                if inner.child_type == ChildType::Leaf {
                    if first_leaf.is_none() {
                        first_leaf = inner.branches.first().map(|branch| branch.address);
                    }
                } else {
                    pending.extend(inner.branches.iter().rev().map(|branch| branch.address));
                }
            }
            tiers.push(address);
        }

        // Leaves, including overflow leaves, are reached through the chain
        let mut current = first_leaf.unwrap_or(Address::NULL);
        while !storage.is_null(current) {
            let next = storage.load(current)?.read().as_leaf()?.next;
            tiers.push(current);
            current = next;
        }

        for address in &tiers {
            storage.free(*address)?;
        }
        storage.commit()?;
        debug!(tiers = tiers.len(), root = %shared.root, "destroyed tree");
        self.gate = None;
        Ok(())
    }

    /// Folds a finished mutation into the query: frees unlinked tiers,
    /// records dirty ones and flushes past the threshold.
    fn absorb(&mut self, scratch: Scratch<T>) -> Result<()> {
        let Scratch {
            mut dirty, freed, ..
        } = scratch;
        let storage = &self.strata.shared.storage;
        for address in freed {
            dirty.remove(&address);
            self.dirty.remove(&address);
            storage.free(address)?;
        }
        self.dirty.extend(dirty);

        if self.dirty.len() > self.strata.shared.config.max_dirty_tiers {
            self.flush()?;
        }
        if self.dirty.is_empty() {
            self.gate = None;
        }
        Ok(())
    }
}

impl<T> Query<T> {
    /// Writes the dirty tiers in address order and commits.
    fn write_dirty(&self) -> Result<usize> {
        let storage = &self.strata.shared.storage;
        let mut addresses: Vec<Address> = self.dirty.keys().copied().collect();
        addresses.sort();
        for address in &addresses {
            storage.write(&self.dirty[address].read())?;
        }
        storage.commit()?;
        Ok(addresses.len())
    }
}

impl<T> Drop for Query<T> {
    fn drop(&mut self) {
        if self.dirty.is_empty() {
            return;
        }
        if let Err(e) = self.write_dirty() {
            error!(error = %e, "failed to flush query on drop");
        }
        self.dirty.clear();
    }
}
