//! Readers and writers sharing one tree across threads.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use strata_common::{FieldVector, StrataConfig};
use strata_index::{InMemoryStorage, Storage, Strata};

const STABLE_KEYS: std::ops::Range<i64> = 10_000..10_200;

fn tree(capacity: usize) -> Strata<i64> {
    let storage: Arc<dyn Storage<i64>> = Arc::new(InMemoryStorage::new());
    Strata::create(
        storage,
        |value: &i64| FieldVector::of(*value),
        StrataConfig::with_capacity(capacity),
    )
    .unwrap()
}

#[test]
fn test_readers_see_stable_keys_during_writes() {
    let strata = tree(4);
    {
        let mut query = strata.query();
        for value in STABLE_KEYS {
            query.insert(value).unwrap();
        }
        query.flush().unwrap();
    }

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|reader| {
            let strata = strata.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(reader);
                let query = strata.query();
                let mut checks = 0u64;
                while !done.load(Ordering::Acquire) || checks < 100 {
                    let value = rng.gen_range(STABLE_KEYS);
                    let found = query.find_all(&FieldVector::of(value)).unwrap();
                    assert_eq!(found, vec![value]);
                    checks += 1;
                }
                checks
            })
        })
        .collect();

    let writer = {
        let strata = strata.clone();
        thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(99);
            let mut query = strata.query();
            for round in 0..2000 {
                let value = rng.gen_range(0..500);
                if rng.gen_bool(0.7) {
                    query.insert(value).unwrap();
                } else {
                    query.remove(&FieldVector::of(value), &|_: &i64| true).unwrap();
                }
                if round % 50 == 0 {
                    query.flush().unwrap();
                }
            }
            query.flush().unwrap();
        })
    };

    writer.join().unwrap();
    done.store(true, Ordering::Release);
    for reader in readers {
        assert!(reader.join().unwrap() >= 100);
    }

    let query = strata.query();
    query.copacetic().unwrap();
    let stable: Vec<i64> = query
        .first()
        .unwrap()
        .map(Result::unwrap)
        .filter(|value| *value >= STABLE_KEYS.start)
        .collect();
    assert_eq!(stable, STABLE_KEYS.collect::<Vec<_>>());
}

#[test]
fn test_writers_serialize_through_gate() {
    let strata = tree(4);
    let writers: Vec<_> = (0..4i64)
        .map(|writer| {
            let strata = strata.clone();
            thread::spawn(move || {
                let mut query = strata.query();
                for value in 0..250 {
                    query.insert(value * 4 + writer).unwrap();
                    if value % 10 == 0 {
                        query.flush().unwrap();
                    }
                }
                query.flush().unwrap();
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let query = strata.query();
    query.copacetic().unwrap();
    let all: Vec<i64> = query.first().unwrap().map(Result::unwrap).collect();
    assert_eq!(all, (0..1000).collect::<Vec<_>>());
}

#[test]
fn test_cursor_walks_while_writer_splits() {
    let strata = tree(4);
    {
        let mut query = strata.query();
        for value in (0..400).step_by(2) {
            query.insert(value).unwrap();
        }
        query.flush().unwrap();
    }

    let reader = {
        let strata = strata.clone();
        thread::spawn(move || {
            for _ in 0..20 {
                let query = strata.query();
                let values: Vec<i64> = query.first().unwrap().map(Result::unwrap).collect();
                assert!(values.windows(2).all(|pair| pair[0] <= pair[1]));
                // Even keys are never removed
                let evens = values.iter().filter(|value| *value % 2 == 0).count();
                assert_eq!(evens, 200);
            }
        })
    };

    let mut query = strata.query();
    for value in (1..400).step_by(2) {
        query.insert(value).unwrap();
        query.flush().unwrap();
    }
    reader.join().unwrap();
    query.copacetic().unwrap();
}
