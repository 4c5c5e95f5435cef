use skiptable_rs::{HashTable, Ordered, Unordered, TRANSFORM_LIMIT};
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};

// Custom hasher for testing
#[derive(Default, Clone)]
struct TestHasher {
    value: u64,
}

impl Hasher for TestHasher {
    fn finish(&self) -> u64 {
        self.value
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.value = self.value.wrapping_mul(31).wrapping_add(byte as u64);
        }
    }
}

#[derive(Default, Clone)]
struct TestBuildHasher;

impl BuildHasher for TestBuildHasher {
    type Hasher = TestHasher;

    fn build_hasher(&self) -> Self::Hasher {
        TestHasher::default()
    }
}

/// Every key hashes to the same value.
#[derive(Default, Clone)]
struct ConstantHasher;

impl Hasher for ConstantHasher {
    fn finish(&self) -> u64 {
        42
    }

    fn write(&mut self, _bytes: &[u8]) {}
}

#[derive(Default, Clone)]
struct ConstantBuildHasher;

impl BuildHasher for ConstantBuildHasher {
    type Hasher = ConstantHasher;

    fn build_hasher(&self) -> Self::Hasher {
        ConstantHasher
    }
}

#[test]
fn test_with_hasher() {
    let map: HashTable<String, i32, Ordered, TestBuildHasher> =
        HashTable::with_hasher(TestBuildHasher);

    map.put("key1".to_string(), 100).unwrap();
    map.put("key2".to_string(), 200).unwrap();

    assert_eq!(map.get(&"key1".to_string()), Some(100));
    assert_eq!(map.get(&"key2".to_string()), Some(200));
    assert_eq!(map.len(), 2);
}

#[test]
fn test_with_capacity_and_hasher() {
    let map: HashTable<String, i32, Ordered, TestBuildHasher> =
        HashTable::with_capacity_and_hasher(100, TestBuildHasher);

    map.put("test".to_string(), 42).unwrap();
    assert_eq!(map.get(&"test".to_string()), Some(42));
    assert_eq!(map.capacity(), 256);
}

#[test]
fn test_contains_key_with_custom_hasher() {
    let map: HashTable<String, i32, Ordered, TestBuildHasher> =
        HashTable::with_hasher(TestBuildHasher);

    map.put("exists".to_string(), 1).unwrap();

    assert!(map.contains_key(&"exists".to_string()));
    assert!(!map.contains_key(&"not_exists".to_string()));
}

#[test]
fn test_keys_and_values_with_custom_hasher() {
    let map: HashTable<String, i32, Ordered, TestBuildHasher> =
        HashTable::with_hasher(TestBuildHasher);

    map.put("a".to_string(), 10).unwrap();
    map.put("b".to_string(), 20).unwrap();
    map.put("c".to_string(), 30).unwrap();

    let mut keys: Vec<String> = map.keys().collect();
    keys.sort();
    assert_eq!(keys, vec!["a", "b", "c"]);

    let mut values: Vec<i32> = map.values().collect();
    values.sort();
    assert_eq!(values, vec![10, 20, 30]);
}

#[test]
fn test_default_trait() {
    let map1: HashTable<String, i32> = HashTable::default();
    map1.put("test".to_string(), 42).unwrap();
    assert_eq!(map1.get(&"test".to_string()), Some(42));

    let map2: HashTable<String, i32, Ordered, TestBuildHasher> = HashTable::default();
    map2.put("test".to_string(), 42).unwrap();
    assert_eq!(map2.get(&"test".to_string()), Some(42));
}

#[test]
fn test_into_iterator() {
    let map: HashTable<String, i32, Ordered, TestBuildHasher> =
        HashTable::with_hasher(TestBuildHasher);

    map.put("a".to_string(), 1).unwrap();
    map.put("b".to_string(), 2).unwrap();
    map.put("c".to_string(), 3).unwrap();

    let mut items: Vec<(String, i32)> = (&map).into_iter().collect();
    items.sort();
    assert_eq!(
        items,
        vec![
            ("a".to_string(), 1),
            ("b".to_string(), 2),
            ("c".to_string(), 3)
        ]
    );
}

#[test]
fn test_std_random_state_compatibility() {
    let map: HashTable<String, i32, Ordered, RandomState> =
        HashTable::with_hasher(RandomState::new());
    map.put("test".to_string(), 42).unwrap();
    assert_eq!(map.get(&"test".to_string()), Some(42));
}

#[test]
fn test_one_bucket_past_transform_limit() {
    let map: HashTable<u32, String, Ordered, ConstantBuildHasher> =
        HashTable::with_hasher(ConstantBuildHasher);

    let n = TRANSFORM_LIMIT as u32 + 1;
    for k in 0..n {
        assert_eq!(map.put(k, format!("v{}", k)).unwrap(), None);
    }
    assert_eq!(map.len(), n as usize);
    for k in 0..n {
        assert_eq!(map.get(&k), Some(format!("v{}", k)));
    }
    assert_eq!(map.get(&n), None);
}

#[test]
fn test_constant_hash_remove_and_reinsert() {
    let map: HashTable<u32, u32, Ordered, ConstantBuildHasher> =
        HashTable::with_hasher(ConstantBuildHasher);

    for k in 0..50 {
        map.put(k, k).unwrap();
    }
    for k in (0..50).step_by(2) {
        assert_eq!(map.remove(&k).unwrap(), Some(k));
        assert_eq!(map.remove(&k).unwrap(), None);
    }
    assert_eq!(map.len(), 25);
    for k in 0..50 {
        let expected = if k % 2 == 0 { None } else { Some(k) };
        assert_eq!(map.get(&k), expected);
    }
    assert_eq!(map.iter().count(), 25);

    // Removed keys come back as fresh inserts.
    for k in (0..50).step_by(2) {
        assert_eq!(map.put(k, k + 1000).unwrap(), None);
    }
    assert_eq!(map.len(), 50);
    assert_eq!(map.get(&10), Some(1010));
}

#[test]
fn test_constant_hash_grows_past_min_capacity() {
    let map: HashTable<u32, u32, Ordered, ConstantBuildHasher> =
        HashTable::with_hasher(ConstantBuildHasher);

    // One bucket absorbs everything, but the load factor still doubles the table.
    for k in 0..300 {
        map.put(k, k * 2).unwrap();
    }
    assert_eq!(map.capacity(), 512);
    for k in 0..300 {
        assert_eq!(map.get(&k), Some(k * 2));
    }
}

#[test]
fn test_unordered_keys_with_constant_hash() {
    // Keys without `Ord` stay in plain chains.
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Opaque(u32);

    let map: HashTable<Opaque, u32, Unordered, ConstantBuildHasher> =
        HashTable::with_hasher(ConstantBuildHasher);
    for k in 0..30 {
        map.put(Opaque(k), k).unwrap();
    }
    assert_eq!(map.put(Opaque(3), 33).unwrap(), Some(3));
    assert_eq!(map.remove(&Opaque(4)).unwrap(), Some(4));
    assert_eq!(map.len(), 29);
    assert_eq!(map.get(&Opaque(3)), Some(33));
    assert_eq!(map.get(&Opaque(4)), None);
    assert_eq!(map.get(&Opaque(29)), Some(29));
}

#[test]
fn test_concurrent_operations() {
    use std::sync::Arc;
    use std::thread;

    let map: Arc<HashTable<i32, String, Ordered, TestBuildHasher>> =
        Arc::new(HashTable::with_hasher(TestBuildHasher));

    let mut handles = vec![];
    for i in 0..10 {
        let map_clone = Arc::clone(&map);
        let handle = thread::spawn(move || {
            for j in 0..10 {
                let key = i * 10 + j;
                map_clone.put(key, format!("value_{}", key)).unwrap();
            }
        });
        handles.push(handle);
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(map.len(), 100);
    for i in 0..100 {
        assert_eq!(map.get(&i), Some(format!("value_{}", i)));
    }
}
