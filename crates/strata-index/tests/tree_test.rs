//! Single-threaded tree behaviour over both storage implementations.

use parking_lot::Mutex;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;

use strata_common::{
    Address, CacheConfig, FieldVector, Result as StrataResult, StrataConfig, StrataError,
};
use strata_index::{
    ChildType, InMemoryStorage, PagedStorage, Query, Storage, Strata, Tier, TierRef,
};

// =============================================================================
// Helpers
// =============================================================================

fn key(value: i64) -> FieldVector {
    FieldVector::of(value)
}

fn memory_tree(capacity: usize) -> (Arc<InMemoryStorage<i64>>, Strata<i64>) {
    let storage = Arc::new(InMemoryStorage::new());
    let strata = Strata::create(
        Arc::clone(&storage) as Arc<dyn Storage<i64>>,
        |value: &i64| FieldVector::of(*value),
        StrataConfig::with_capacity(capacity),
    )
    .unwrap();
    (storage, strata)
}

fn contents(query: &Query<i64>) -> Vec<i64> {
    query
        .first()
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

fn remove_key(query: &mut Query<i64>, value: i64) -> Option<i64> {
    query.remove(&key(value), &|_: &i64| true).unwrap()
}

fn pair_tree() -> Strata<(i64, u32)> {
    let storage: Arc<dyn Storage<(i64, u32)>> = Arc::new(InMemoryStorage::new());
    Strata::create(
        storage,
        |entry: &(i64, u32)| FieldVector::of(entry.0),
        StrataConfig::with_capacity(4),
    )
    .unwrap()
}

/// Storage that records the address of every tier written.
#[derive(Default)]
struct RecordingStorage {
    inner: InMemoryStorage<i64>,
    written: Mutex<Vec<Address>>,
}

impl Storage<i64> for RecordingStorage {
    fn new_inner_tier(&self, child_type: ChildType) -> StrataResult<TierRef<i64>> {
        self.inner.new_inner_tier(child_type)
    }

    fn new_leaf_tier(&self) -> StrataResult<TierRef<i64>> {
        self.inner.new_leaf_tier()
    }

    fn load(&self, address: Address) -> StrataResult<TierRef<i64>> {
        self.inner.load(address)
    }

    fn write(&self, tier: &Tier<i64>) -> StrataResult<()> {
        self.written.lock().push(tier.address());
        self.inner.write(tier)
    }

    fn free(&self, address: Address) -> StrataResult<()> {
        self.inner.free(address)
    }

    fn commit(&self) -> StrataResult<()> {
        self.inner.commit()
    }
}

// =============================================================================
// Basic operations
// =============================================================================

#[test]
fn test_empty_tree() {
    let (storage, strata) = memory_tree(4);
    let mut query = strata.query();

    assert!(contents(&query).is_empty());
    assert!(query.find_all(&key(1)).unwrap().is_empty());
    assert_eq!(remove_key(&mut query, 1), None);
    assert_eq!(query.dirty_len(), 0);
    query.copacetic().unwrap();
    assert_eq!(storage.tier_count(), 2);
}

#[test]
fn test_insert_find_remove_thousand() {
    let (_, strata) = memory_tree(8);
    let mut query = strata.query();

    for value in 1..=1000 {
        query.insert(value).unwrap();
    }
    query.flush().unwrap();
    query.copacetic().unwrap();

    for value in 1..=1000 {
        assert_eq!(query.find_all(&key(value)).unwrap(), vec![value]);
    }
    assert!(query.find_all(&key(0)).unwrap().is_empty());
    assert!(query.find_all(&key(1001)).unwrap().is_empty());

    assert_eq!(remove_key(&mut query, 500), Some(500));
    assert!(query.find_all(&key(500)).unwrap().is_empty());
    assert_eq!(remove_key(&mut query, 500), None);
    query.flush().unwrap();
    query.copacetic().unwrap();

    let expected: Vec<i64> = (1..=1000).filter(|value| *value != 500).collect();
    assert_eq!(contents(&query), expected);
}

#[test]
fn test_duplicate_run_then_greater_key() {
    let (_, strata) = memory_tree(4);
    let mut query = strata.query();

    for _ in 0..5 {
        query.insert(2).unwrap();
    }
    query.copacetic().unwrap();
    query.insert(3).unwrap();
    query.copacetic().unwrap();
    assert_eq!(contents(&query), vec![2, 2, 2, 2, 2, 3]);
    assert_eq!(query.find_all(&key(2)).unwrap().len(), 5);

    assert_eq!(remove_key(&mut query, 2), Some(2));
    query.copacetic().unwrap();
    assert!(query.find_all(&key(2)).unwrap().is_empty());
    assert_eq!(contents(&query), vec![3]);
    assert_eq!(remove_key(&mut query, 2), None);
}

#[test]
fn test_capacity_five_remove_last_key() {
    let (_, strata) = memory_tree(5);
    let mut query = strata.query();

    for value in 1..=46 {
        query.insert(value).unwrap();
        query.copacetic().unwrap();
    }
    assert_eq!(remove_key(&mut query, 46), Some(46));
    query.copacetic().unwrap();
    assert_eq!(contents(&query), (1..=45).collect::<Vec<_>>());
}

#[test]
fn test_twenty_duplicates() {
    let strata = pair_tree();
    let mut query = strata.query();

    for value in 1..=10 {
        if value != 7 {
            query.insert((value, 0)).unwrap();
        }
    }
    for copy in 0..20 {
        query.insert((7, copy)).unwrap();
        query.copacetic().unwrap();
    }
    let sevens = query.find_all(&key(7)).unwrap();
    assert_eq!(sevens, (0..20).map(|copy| (7, copy)).collect::<Vec<_>>());

    assert_eq!(query.remove_object(&(7, 5)).unwrap(), Some((7, 5)));
    assert_eq!(query.remove_object(&(7, 5)).unwrap(), None);
    query.copacetic().unwrap();
    let copies: Vec<u32> = query
        .find_all(&key(7))
        .unwrap()
        .into_iter()
        .map(|(_, copy)| copy)
        .collect();
    assert_eq!(copies, (0..20).filter(|copy| *copy != 5).collect::<Vec<_>>());

    let everything = |_: &(i64, u32)| true;
    assert_eq!(query.remove(&key(7), &everything).unwrap(), Some((7, 0)));
    query.copacetic().unwrap();
    assert!(query.find_all(&key(7)).unwrap().is_empty());
    assert_eq!(query.remove(&key(7), &everything).unwrap(), None);
    assert_eq!(query.find_all(&key(6)).unwrap(), vec![(6, 0)]);
    assert_eq!(query.find_all(&key(8)).unwrap(), vec![(8, 0)]);
}

#[test]
fn test_deletable_predicate_selects_entry() {
    let strata = pair_tree();
    let mut query = strata.query();
    for copy in 0..3 {
        query.insert((1, copy)).unwrap();
    }

    let removed = query
        .remove(&key(1), &|entry: &(i64, u32)| entry.1 == 2)
        .unwrap();
    assert_eq!(removed, Some((1, 2)));
    let none = query
        .remove(&key(1), &|entry: &(i64, u32)| entry.1 == 9)
        .unwrap();
    assert_eq!(none, None);
    assert_eq!(query.find_all(&key(1)).unwrap(), vec![(1, 0), (1, 1)]);
}

// =============================================================================
// Duplicate runs
// =============================================================================

fn chained_run(query: &mut Query<(i64, u32)>, copies: u32) {
    for value in [1, 2, 4, 5] {
        query.insert((value, 0)).unwrap();
    }
    for copy in 0..copies {
        query.insert((3, copy)).unwrap();
    }
    query.copacetic().unwrap();
    assert_eq!(query.find_all(&key(3)).unwrap().len(), copies as usize);
}

#[test]
fn test_remove_empties_chained_run_in_one_call() {
    let strata = pair_tree();
    let mut query = strata.query();
    chained_run(&mut query, 12);

    let removed = query.remove(&key(3), &|_: &(i64, u32)| true).unwrap();
    assert_eq!(removed, Some((3, 0)));
    query.copacetic().unwrap();
    assert!(query.find_all(&key(3)).unwrap().is_empty());
    let keys: Vec<i64> = query
        .first()
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();
    assert_eq!(keys, vec![1, 2, 4, 5]);
}

#[test]
fn test_remove_selected_entries_across_run() {
    let strata = pair_tree();
    let mut query = strata.query();
    chained_run(&mut query, 12);

    let removed = query
        .remove(&key(3), &|entry: &(i64, u32)| entry.1 % 2 == 0)
        .unwrap();
    assert_eq!(removed, Some((3, 0)));
    query.copacetic().unwrap();
    let odd: Vec<(i64, u32)> = (0..12)
        .filter(|copy| copy % 2 == 1)
        .map(|copy| (3, copy))
        .collect();
    assert_eq!(query.find_all(&key(3)).unwrap(), odd);

    // Survivors keep their order and the run still accepts new copies
    query.insert((3, 12)).unwrap();
    query.copacetic().unwrap();
    assert_eq!(query.find_all(&key(3)).unwrap().last(), Some(&(3, 12)));
    assert_eq!(query.find_all(&key(4)).unwrap(), vec![(4, 0)]);
}

#[test]
fn test_remove_run_leaves_other_runs_alone() {
    let strata = pair_tree();
    let mut query = strata.query();
    for copy in 0..9 {
        query.insert((1, copy)).unwrap();
        query.insert((2, copy)).unwrap();
    }
    query.copacetic().unwrap();

    let everything = |_: &(i64, u32)| true;
    assert_eq!(query.remove(&key(1), &everything).unwrap(), Some((1, 0)));
    query.copacetic().unwrap();
    assert!(query.find_all(&key(1)).unwrap().is_empty());
    assert_eq!(query.find_all(&key(2)).unwrap().len(), 9);

    assert_eq!(query.remove(&key(2), &everything).unwrap(), Some((2, 0)));
    query.copacetic().unwrap();
    assert!(query.first().unwrap().next().is_none());
}

#[test]
fn test_round_trip_to_empty_tree() {
    let (storage, strata) = memory_tree(4);
    let mut query = strata.query();
    let mut rng = StdRng::seed_from_u64(7);

    let mut values: Vec<i64> = (0..200).collect();
    values.shuffle(&mut rng);
    for value in &values {
        query.insert(*value).unwrap();
    }
    query.copacetic().unwrap();

    values.shuffle(&mut rng);
    for value in &values {
        assert_eq!(remove_key(&mut query, *value), Some(*value));
        query.copacetic().unwrap();
    }
    query.flush().unwrap();

    assert!(contents(&query).is_empty());
    // Only the root and its single empty leaf remain
    assert_eq!(storage.tier_count(), 2);
}

#[test]
fn test_random_operations_stay_copacetic() {
    let (_, strata) = memory_tree(4);
    let mut query = strata.query();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut model: BTreeMap<i64, usize> = BTreeMap::new();

    for _ in 0..1000 {
        let value = rng.gen_range(0..60);
        if rng.gen_bool(0.6) {
            query.insert(value).unwrap();
            *model.entry(value).or_default() += 1;
        } else {
            let removed = remove_key(&mut query, value);
            match model.remove(&value) {
                Some(_) => assert_eq!(removed, Some(value)),
                None => assert_eq!(removed, None),
            }
        }
        query.copacetic().unwrap();
    }

    let expected: Vec<i64> = model
        .iter()
        .flat_map(|(value, count)| std::iter::repeat(*value).take(*count))
        .collect();
    assert_eq!(contents(&query), expected);
}

#[test]
fn test_uncached_fields() {
    let storage: Arc<dyn Storage<i64>> = Arc::new(InMemoryStorage::new());
    let config = StrataConfig {
        cache_fields: false,
        ..StrataConfig::with_capacity(4)
    };
    let strata = Strata::create(storage, |value: &i64| FieldVector::of(-*value), config).unwrap();
    let mut query = strata.query();
    for value in 0..50 {
        query.insert(value).unwrap();
    }
    query.copacetic().unwrap();
    assert_eq!(contents(&query), (0..50).rev().collect::<Vec<_>>());
    assert_eq!(query.find_all(&key(-10)).unwrap(), vec![10]);
}

// =============================================================================
// Queries and storage
// =============================================================================

#[test]
fn test_flush_writes_and_releases() {
    let (storage, strata) = memory_tree(4);
    let mut query = strata.query();
    for value in 0..20 {
        query.insert(value).unwrap();
    }
    assert!(query.dirty_len() > 0);
    let commits = storage.commit_count();

    query.flush().unwrap();
    assert_eq!(query.dirty_len(), 0);
    assert_eq!(storage.commit_count(), commits + 1);

    // A second query can mutate once the first has flushed
    let mut other = strata.query();
    other.insert(100).unwrap();
    other.flush().unwrap();
    assert_eq!(contents(&query).len(), 21);
}

#[test]
fn test_dirty_threshold_flushes() {
    let storage = Arc::new(InMemoryStorage::new());
    let config = StrataConfig {
        max_dirty_tiers: 2,
        ..StrataConfig::with_capacity(4)
    };
    let strata = Strata::create(
        Arc::clone(&storage) as Arc<dyn Storage<i64>>,
        |value: &i64| FieldVector::of(*value),
        config,
    )
    .unwrap();
    let mut query = strata.query();
    for value in 0..100 {
        query.insert(value).unwrap();
        assert!(query.dirty_len() <= 2);
    }
    assert!(storage.commit_count() > 1);
}

#[test]
fn test_drop_flushes() {
    let (storage, strata) = memory_tree(4);
    let writes = storage.write_count();
    {
        let mut query = strata.query();
        query.insert(1).unwrap();
    }
    assert!(storage.write_count() > writes);
    // The gate was released with the query
    let mut query = strata.query();
    query.insert(2).unwrap();
    assert_eq!(contents(&query), vec![1, 2]);
}

#[test]
fn test_drop_writes_in_address_order() {
    let storage = Arc::new(RecordingStorage::default());
    let strata = Strata::create(
        Arc::clone(&storage) as Arc<dyn Storage<i64>>,
        |value: &i64| FieldVector::of(*value),
        StrataConfig::with_capacity(4),
    )
    .unwrap();
    storage.written.lock().clear();
    {
        let mut query = strata.query();
        for value in (0..60).rev() {
            query.insert(value).unwrap();
        }
        assert!(query.dirty_len() > 1);
    }

    let written = storage.written.lock().clone();
    assert!(written.len() > 1);
    assert!(written.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn test_find_reports_empty_inner_tier() {
    let (storage, strata) = memory_tree(4);
    let root = storage.load(strata.root_address()).unwrap();
    root.write().as_inner_mut().unwrap().branches.clear();

    let query = strata.query();
    assert!(matches!(query.find(&key(1)), Err(StrataError::Corrupt(_))));
    assert!(matches!(query.first(), Err(StrataError::Corrupt(_))));
}

#[test]
fn test_open_existing_tree() {
    let (storage, strata) = memory_tree(4);
    let mut query = strata.query();
    for value in 0..40 {
        query.insert(value).unwrap();
    }
    query.flush().unwrap();

    let reopened = Strata::open(
        Arc::clone(&storage) as Arc<dyn Storage<i64>>,
        |value: &i64| FieldVector::of(*value),
        StrataConfig::with_capacity(4),
        strata.root_address(),
    )
    .unwrap();
    let query = reopened.query();
    assert_eq!(query.find_all(&key(17)).unwrap(), vec![17]);
    query.copacetic().unwrap();
}

#[test]
fn test_invalid_config_rejected() {
    let storage: Arc<dyn Storage<i64>> = Arc::new(InMemoryStorage::new());
    let result = Strata::create(
        storage,
        |value: &i64| FieldVector::of(*value),
        StrataConfig::with_capacity(1),
    );
    assert!(matches!(result, Err(StrataError::InvalidParameter { .. })));
}

#[test]
fn test_destroy_frees_every_tier() {
    let (storage, strata) = memory_tree(4);
    let mut query = strata.query();
    for value in 0..100 {
        query.insert(value % 30).unwrap();
    }
    query.flush().unwrap();
    assert!(storage.tier_count() > 2);

    query.destroy().unwrap();
    assert_eq!(storage.tier_count(), 0);
}

#[test]
fn test_paged_storage_with_small_cache() {
    let storage = Arc::new(PagedStorage::new(CacheConfig { capacity: 8 }).unwrap());
    let config = StrataConfig {
        max_dirty_tiers: 4,
        ..StrataConfig::with_capacity(4)
    };
    let strata = Strata::create(
        Arc::clone(&storage) as Arc<dyn Storage<i64>>,
        |value: &i64| FieldVector::of(*value),
        config,
    )
    .unwrap();
    let mut query = strata.query();

    for value in 0..300 {
        query.insert(value).unwrap();
    }
    query.flush().unwrap();
    query.copacetic().unwrap();
    assert!(storage.cache().stats().evictions() > 0);

    for value in (0..300).step_by(3) {
        assert_eq!(remove_key(&mut query, value), Some(value));
    }
    query.flush().unwrap();
    query.copacetic().unwrap();

    let expected: Vec<i64> = (0..300).filter(|value| value % 3 != 0).collect();
    assert_eq!(contents(&query), expected);
    assert_eq!(query.find_all(&key(151)).unwrap(), vec![151]);
    assert_eq!(storage.cache().pinned_count(), 0);
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_entries_come_back_sorted(values in proptest::collection::vec(-50i64..50, 0..150)) {
        let (_, strata) = memory_tree(4);
        let mut query = strata.query();
        for value in &values {
            query.insert(*value).unwrap();
        }
        query.copacetic().unwrap();

        let mut sorted = values.clone();
        sorted.sort();
        prop_assert_eq!(contents(&query), sorted);
    }
}
