use std::sync::Arc;
use std::thread;

use {CuckooMap, ExpandError, InsertError, Key, Val, BUCKET_SLOTS};

/// An arbitrary but fixed value derived from a key.
///
/// Readers use this to detect torn values: any observed value that isn't `val_of` of its key
/// was never written and means a broken read protocol.
fn val_of(key: Key) -> Val {
    key.wrapping_mul(31).wrapping_add(7)
}

/// Count the slots across the whole table holding `key`.
fn occurrences(map: &CuckooMap, key: Key) -> usize {
    let table = map.table.read();
    let mut n = 0;

    for i in 0..table.buckets() {
        for j in 0..BUCKET_SLOTS {
            if table.bucket(i).key(j) == key {
                n += 1;
            }
        }
    }

    n
}

#[test]
fn insert_find_roundtrip() {
    let map = CuckooMap::with_hashpower(4);

    assert_eq!(map.find(1), None);
    map.insert(1, 100).unwrap();
    assert_eq!(map.find(1), Some(100));
    assert_eq!(map.len(), 1);
}

#[test]
fn duplicate_keeps_first_value() {
    let map = CuckooMap::with_hashpower(4);

    map.insert(5, 50).unwrap();
    assert_eq!(map.insert(5, 51), Err(InsertError::Duplicate));
    assert_eq!(map.find(5), Some(50));
    assert_eq!(map.len(), 1);
}

#[test]
fn delete_roundtrip() {
    let map = CuckooMap::with_hashpower(4);

    map.insert(9, 90).unwrap();
    assert_eq!(map.delete(9), Some(90));
    assert_eq!(map.find(9), None);
    assert_eq!(map.delete(9), None);
    assert_eq!(map.len(), 0);
    assert!(map.is_empty());

    // The slot is reusable.
    map.insert(9, 91).unwrap();
    assert_eq!(map.find(9), Some(91));
}

#[test]
#[should_panic]
fn sentinel_key_is_rejected() {
    let map = CuckooMap::with_hashpower(4);
    let _ = map.insert(0, 1);
}

#[test]
fn sentinel_key_is_never_found() {
    let map = CuckooMap::with_hashpower(4);

    for key in 1..20 {
        map.insert(key, key).unwrap();
    }

    assert_eq!(map.find(0), None);
    assert_eq!(map.delete(0), None);
    assert_eq!(map.len(), 19);
}

#[test]
#[should_panic]
fn zero_hashpower_is_rejected() {
    CuckooMap::with_hashpower(0);
}

#[test]
fn accessors() {
    let map = CuckooMap::with_hashpower(5);

    assert_eq!(map.buckets(), 32);
    assert_eq!(map.capacity(), 32 * BUCKET_SLOTS);
    assert_eq!(map.load_factor(), 0.0);

    map.insert(1, 1).unwrap();
    assert_eq!(map.load_factor(), 1.0 / map.capacity() as f64);

    // Logging goes to a discard drain here; this just exercises the path.
    map.report();
}

#[test]
fn fill_small_table() {
    // 16 buckets of 4 slots, offered exactly as many keys as it has slots. Relocations have
    // to carry the tail end of this; direct placement alone stalls far earlier.
    let map = CuckooMap::with_hashpower(4);
    let mut placed = Vec::new();

    for key in 1..65 {
        if map.insert(key, 2 * key - 1).is_ok() {
            placed.push(key);
        }
    }

    assert!(
        placed.len() >= 56,
        "only {} of 64 slots filled",
        placed.len()
    );
    assert_eq!(map.len(), placed.len());

    for &key in &placed {
        assert_eq!(map.find(key), Some(2 * key - 1));
        assert_eq!(occurrences(&map, key), 1);
    }
}

#[test]
fn delete_odd_keys() {
    let map = CuckooMap::with_hashpower(4);
    let mut placed = Vec::new();

    for key in 1..51 {
        if map.insert(key, key + 1).is_ok() {
            placed.push(key);
        }
    }

    // The first handful of insertions into an empty table cannot fail.
    assert!(placed.contains(&2) && placed.contains(&3));

    for &key in &placed {
        if key % 2 == 1 {
            assert_eq!(map.delete(key), Some(key + 1));
        }
    }

    assert_eq!(map.find(2), Some(3));
    assert_eq!(map.find(3), None);

    for &key in &placed {
        if key % 2 == 0 {
            assert_eq!(map.find(key), Some(key + 1));
        } else {
            assert_eq!(map.find(key), None);
        }
    }
}

#[test]
fn fill_to_high_load() {
    // A table large enough for the fill statistics to concentrate: by the time no relocation
    // path exists, at least nine of every ten slots must be taken.
    let map = CuckooMap::with_hashpower(8);
    let mut key = 1;

    loop {
        match map.insert(key, val_of(key)) {
            Ok(()) => key += 1,
            Err(InsertError::Full) => break,
            Err(err) => panic!("unexpected status: {:?}", err),
        }

        assert!(key < 2000, "never reported full");
    }

    assert!(
        map.load_factor() >= 0.9,
        "full at load factor {}",
        map.load_factor()
    );
}

#[test]
fn expand_after_full() {
    let map = CuckooMap::with_hashpower(3);
    let mut placed = Vec::new();
    let mut key = 1;

    loop {
        match map.insert(key, 100 + key) {
            Ok(()) => placed.push(key),
            Err(InsertError::Full) => break,
            Err(err) => panic!("unexpected status: {:?}", err),
        }

        key += 1;
        assert!(key < 1000, "never reported full");
    }

    let before = map.load_factor();
    map.expand().unwrap();

    // Same entries, twice the slots.
    assert_eq!(map.load_factor(), before / 2.0);
    for &key in &placed {
        assert_eq!(map.find(key), Some(100 + key));
    }

    // The doubled table must absorb a healthy batch of fresh keys; the first of them also
    // drives the stale-slot cleanup over the whole (small) table.
    let target = 2 * map.capacity() / 5;
    let mut fresh = 0;

    for key in 10_000..10_200 {
        if map.insert(key, 100 + key).is_ok() {
            fresh += 1;
        }
        if fresh == target {
            break;
        }
    }
    assert_eq!(fresh, target, "doubling didn't free enough space");

    // Cleanup has run by now, so every key must be stored exactly once.
    for &key in &placed {
        assert_eq!(map.find(key), Some(100 + key));
        assert_eq!(occurrences(&map, key), 1);
    }
}

#[test]
fn expansion_cleanup_reenables_expand() {
    let map = CuckooMap::with_hashpower(3);

    for key in 1..10 {
        map.insert(key, val_of(key)).unwrap();
    }

    map.expand().unwrap();
    assert_eq!(map.expand(), Err(ExpandError::UnderExpansion));

    // Any write scrubs this whole table in one quantum, finishing the expansion.
    map.insert(100, val_of(100)).unwrap();

    map.expand().unwrap();
    assert_eq!(map.buckets(), 32);
}

#[test]
fn clone_is_a_snapshot() {
    let map = CuckooMap::with_hashpower(4);

    for key in 1..10 {
        map.insert(key, val_of(key)).unwrap();
    }

    let copy = map.clone();
    map.delete(1).unwrap();
    map.insert(100, 1).unwrap();

    assert_eq!(copy.len(), 9);
    assert_eq!(copy.find(1), Some(val_of(1)));
    assert_eq!(copy.find(100), None);
}

#[test]
fn spam_insert_disjoint() {
    let map = Arc::new(CuckooMap::with_hashpower(13));
    let mut joins = Vec::new();

    for t in 0..8 {
        let map = map.clone();
        joins.push(thread::spawn(move || {
            let base = t as Key * 1000;
            for key in base + 1..base + 1001 {
                map.insert(key, !key).unwrap();
            }
        }));
    }

    for j in joins {
        j.join().unwrap();
    }

    // No lost updates: every insertion of the disjoint ranges must be accounted for.
    assert_eq!(map.len(), 8000);
    for key in 1..8001 {
        assert_eq!(map.find(key), Some(!key));
    }
}

#[test]
fn spam_insert_delete() {
    let map = Arc::new(CuckooMap::with_hashpower(10));
    let mut joins = Vec::new();

    for t in 0..4 {
        let map = map.clone();
        joins.push(thread::spawn(move || {
            let base = t as Key * 500;

            for key in base + 1..base + 501 {
                map.insert(key, val_of(key)).unwrap();
            }
            // Drop the odd keys again, then resurrect them with fresh values.
            for key in base + 1..base + 501 {
                if key % 2 == 1 {
                    assert_eq!(map.delete(key), Some(val_of(key)));
                }
            }
            for key in base + 1..base + 501 {
                if key % 2 == 1 {
                    map.insert(key, val_of(key) + 1).unwrap();
                }
            }
        }));
    }

    for j in joins {
        j.join().unwrap();
    }

    assert_eq!(map.len(), 2000);
    for key in 1..2001 {
        let expected = if key % 2 == 1 {
            val_of(key) + 1
        } else {
            val_of(key)
        };
        assert_eq!(map.find(key), Some(expected));
    }
}

#[test]
fn spam_reads_never_tear() {
    let map = Arc::new(CuckooMap::with_hashpower(10));
    let mut joins = Vec::new();

    // Writers push the table towards a load factor where relocations are routine.
    for t in 0..4 {
        let map = map.clone();
        joins.push(thread::spawn(move || {
            let base = t as Key * 750;
            for key in base + 1..base + 751 {
                map.insert(key, val_of(key)).unwrap();
            }
        }));
    }

    // Readers hammer the same keyspace; a value inconsistent with its key is a torn read.
    for t in 0..4u64 {
        let map = map.clone();
        joins.push(thread::spawn(move || {
            let mut x = t + 1;

            for _ in 0..100_000 {
                x = x
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                let key = ((x >> 33) % 3000 + 1) as Key;

                if let Some(val) = map.find(key) {
                    assert_eq!(val, val_of(key), "torn value for key {}", key);
                }
            }
        }));
    }

    for j in joins {
        j.join().unwrap();
    }

    for key in 1..3001 {
        assert_eq!(map.find(key), Some(val_of(key)));
    }
}

#[test]
fn concurrent_duplicate_has_one_winner() {
    for _ in 0..50 {
        let map = Arc::new(CuckooMap::with_hashpower(4));

        let a = {
            let map = map.clone();
            thread::spawn(move || map.insert(42, 2))
        };
        let b = {
            let map = map.clone();
            thread::spawn(move || map.insert(42, 3))
        };

        let a = a.join().unwrap();
        let b = b.join().unwrap();

        // Exactly one of the two racing insertions may win.
        match (a, b) {
            (Ok(()), Err(InsertError::Duplicate)) => assert_eq!(map.find(42), Some(2)),
            (Err(InsertError::Duplicate), Ok(())) => assert_eq!(map.find(42), Some(3)),
            other => panic!("impossible outcome: {:?}", other),
        }

        assert_eq!(map.len(), 1);
        assert_eq!(occurrences(&map, 42), 1);
    }
}

#[test]
fn expand_under_concurrent_reads() {
    let map = Arc::new(CuckooMap::with_hashpower(6));

    for key in 1..151 {
        map.insert(key, val_of(key)).unwrap();
    }

    let mut joins = Vec::new();
    for _ in 0..4 {
        let map = map.clone();
        joins.push(thread::spawn(move || {
            for i in 0..50_000 {
                let key = (i % 150 + 1) as Key;
                assert_eq!(map.find(key), Some(val_of(key)));
            }
        }));
    }

    // Double the table under the readers' feet, then write enough to drive the cleanup to
    // completion while they are still running.
    map.expand().unwrap();
    for key in 10_000..10_050 {
        map.insert(key, val_of(key)).unwrap();
    }

    for j in joins {
        j.join().unwrap();
    }

    for key in 1..151 {
        assert_eq!(map.find(key), Some(val_of(key)));
        assert_eq!(occurrences(&map, key), 1);
    }
}
