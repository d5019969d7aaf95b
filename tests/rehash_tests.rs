// Rehash tests
// These tests rebuild the hashtable at different capacities and check that
// live keys keep their values while removed keys stay removed.

use revkv::{Error, Options, Store, Value, LATEST};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tempfile::TempDir;

fn hash_of(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

fn key(i: u32) -> String {
    format!("key_{:05}", i)
}

fn value(i: u32) -> String {
    format!("value_{:05}", i)
}

/// Writes 256 keys at revision 1 and removes every fourth at revision 2.
fn populate(store: &Store) {
    let mut acc = store.accessor().unwrap();
    for i in 0..256 {
        let k = key(i);
        let hash = hash_of(k.as_bytes());
        store.put(&mut acc, k.as_bytes(), hash, Some(value(i).as_bytes()), 1).unwrap();
    }
    for i in (0..256).step_by(4) {
        let k = key(i);
        store.remove(&mut acc, k.as_bytes(), hash_of(k.as_bytes()), 2).unwrap();
    }
}

fn verify(store: &Store) {
    let mut acc = store.accessor().unwrap();
    for i in 0..256 {
        let k = key(i);
        let found = store.get(&mut acc, k.as_bytes(), hash_of(k.as_bytes()), LATEST).unwrap();
        if i % 4 == 0 {
            assert_eq!(found, None, "{} should stay removed", k);
        } else {
            assert_eq!(found, Some(Value::from(value(i).as_str())), "{} lost its value", k);
        }
    }
    assert_eq!(store.len(&mut acc).unwrap(), 192);
}

#[test]
fn test_rehash_grows_table() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), Options::default().initial_capacity(16)).unwrap();
    populate(&store);

    let mut acc = store.accessor().unwrap();
    store.rehash(&mut acc, 40).unwrap();
    let stats = store.stats(&mut acc).unwrap();
    assert_eq!(stats.hashtable_capacity, 64);
    assert_eq!(stats.hashtable_id, 1);
    drop(acc);

    verify(&store);
}

#[test]
fn test_rehash_rounds_to_power_of_two() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), Options::default().initial_capacity(16)).unwrap();
    populate(&store);

    let mut acc = store.accessor().unwrap();
    store.rehash(&mut acc, 12345).unwrap();
    assert_eq!(store.stats(&mut acc).unwrap().hashtable_capacity, 16384);
    drop(acc);
    verify(&store);
}

#[test]
fn test_rehash_shrinks_table() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), Options::default().initial_capacity(1024)).unwrap();
    populate(&store);

    let mut acc = store.accessor().unwrap();
    store.rehash(&mut acc, 4).unwrap();
    assert_eq!(store.stats(&mut acc).unwrap().hashtable_capacity, 4);
    drop(acc);
    verify(&store);
}

#[test]
fn test_repeated_rehash_advances_generation() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), Options::default().initial_capacity(16)).unwrap();
    populate(&store);

    let mut acc = store.accessor().unwrap();
    let mut last_start = acc.metadata().unwrap().hash_codes_generation_start;
    for (generation, capacity) in [(1u32, 64u32), (2, 8), (3, 256)] {
        store.rehash(&mut acc, capacity).unwrap();
        let meta = acc.metadata().unwrap();
        assert_eq!(meta.hashtable_id, generation);
        assert!(meta.hash_codes_generation_start > last_start);
        assert!(meta.current_hash_codes >= meta.hash_codes_generation_start);
        last_start = meta.hash_codes_generation_start;
    }
    drop(acc);
    verify(&store);
}

#[test]
fn test_writes_after_rehash() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), Options::default().initial_capacity(16)).unwrap();
    populate(&store);

    let mut acc = store.accessor().unwrap();
    store.rehash(&mut acc, 512).unwrap();

    // Update a live key, revive a removed one, add a new one
    let (live, removed, fresh) = (key(1), key(4), key(1000));
    store.put(&mut acc, live.as_bytes(), hash_of(live.as_bytes()), Some(b"updated"), 3).unwrap();
    store.put(&mut acc, removed.as_bytes(), hash_of(removed.as_bytes()), Some(b"back"), 3).unwrap();
    store.put(&mut acc, fresh.as_bytes(), hash_of(fresh.as_bytes()), Some(b"new"), 3).unwrap();

    for (k, expected) in [(&live, "updated"), (&removed, "back"), (&fresh, "new")] {
        let found = store.get(&mut acc, k.as_bytes(), hash_of(k.as_bytes()), LATEST).unwrap();
        assert_eq!(found, Some(Value::from(expected)));
    }
    assert_eq!(store.len(&mut acc).unwrap(), 194);
}

#[test]
fn test_rehash_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = Store::open(dir.path(), Options::default().initial_capacity(16)).unwrap();
        populate(&store);
        store.with_accessor(|acc| store.rehash(acc, 128)).unwrap();
        store.close().unwrap();
    }

    let store = Store::open(dir.path(), Options::default().initial_capacity(16)).unwrap();
    let mut acc = store.accessor().unwrap();
    // The persisted table wins over the configured initial capacity
    assert_eq!(store.stats(&mut acc).unwrap().hashtable_capacity, 128);
    drop(acc);
    verify(&store);
}

#[test]
fn test_other_accessor_follows_rehash() {
    let dir = TempDir::new().unwrap();
    let options = Options::default().initial_capacity(16).accessor_pool(4, 4);
    let store = Store::open(dir.path(), options).unwrap();
    populate(&store);

    let mut reader = store.accessor().unwrap();
    let k = key(3);
    let before = store.get(&mut reader, k.as_bytes(), hash_of(k.as_bytes()), LATEST).unwrap();

    let mut writer = store.accessor().unwrap();
    store.rehash(&mut writer, 64).unwrap();

    let after = store.get(&mut reader, k.as_bytes(), hash_of(k.as_bytes()), LATEST).unwrap();
    assert_eq!(before, after);
    assert_eq!(reader.hashtable().unwrap().capacity(), 64);
}

#[test]
fn test_rehash_rejects_oversized_resolution() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), Options::default()).unwrap();
    let mut acc = store.accessor().unwrap();
    assert!(matches!(store.rehash(&mut acc, u32::MAX), Err(Error::InvalidArgument(_))));
    assert_eq!(store.stats(&mut acc).unwrap().hashtable_id, 0);
}
