//! Lazy, per-bucket iteration.
//!
//! Each step pins the epoch, reads the table that is current at that moment
//! and clones the live pairs of the next non-empty bucket. There is no
//! snapshot across buckets: a resize or concurrent writes during iteration may
//! cause pairs to be seen twice or missed. At quiescence every live pair is
//! yielded exactly once.

use std::hash::{BuildHasher, Hash};
use std::vec;

use crossbeam_epoch as epoch;

use crate::order::KeyOrder;
use crate::HashTable;

// Unified per-bucket collector used by Iter/Keys/Values.
fn collect_next_bucket<K, V, O, S, T, F>(
    map: &HashTable<K, V, O, S>,
    bucket_index: &mut usize,
    make: &mut F,
) -> Option<Vec<T>>
where
    K: Hash + Eq + Send + 'static,
    V: Clone + Send + 'static,
    O: KeyOrder<K>,
    S: BuildHasher,
    F: FnMut(&K, &V) -> T,
{
    let guard = epoch::pin();
    let table = map.current(&guard);
    while *bucket_index < table.capacity() {
        let collected: Vec<T> = table
            .bucket(*bucket_index)
            .live(&guard)
            .map(|(k, v)| make(k, v))
            .collect();
        *bucket_index += 1;
        if !collected.is_empty() {
            return Some(collected);
        }
    }
    None
}

struct Cursor<'a, K, V, O, S, T> {
    map: &'a HashTable<K, V, O, S>,
    bucket_index: usize,
    pending: vec::IntoIter<T>,
}

impl<'a, K, V, O, S, T> Cursor<'a, K, V, O, S, T>
where
    K: Hash + Eq + Send + 'static,
    V: Clone + Send + 'static,
    O: KeyOrder<K>,
    S: BuildHasher,
{
    fn new(map: &'a HashTable<K, V, O, S>) -> Self {
        Self {
            map,
            bucket_index: 0,
            pending: Vec::new().into_iter(),
        }
    }

    fn next_with<F: FnMut(&K, &V) -> T>(&mut self, mut make: F) -> Option<T> {
        loop {
            if let Some(item) = self.pending.next() {
                return Some(item);
            }
            let batch = collect_next_bucket(self.map, &mut self.bucket_index, &mut make)?;
            self.pending = batch.into_iter();
        }
    }
}

/// Iterator over cloned `(key, value)` pairs of a [`HashTable`].
pub struct Iter<'a, K, V, O, S> {
    cursor: Cursor<'a, K, V, O, S, (K, V)>,
}

impl<'a, K, V, O, S> Iter<'a, K, V, O, S>
where
    K: Hash + Eq + Send + 'static,
    V: Clone + Send + 'static,
    O: KeyOrder<K>,
    S: BuildHasher,
{
    pub(crate) fn new(map: &'a HashTable<K, V, O, S>) -> Self {
        Self {
            cursor: Cursor::new(map),
        }
    }
}

impl<'a, K, V, O, S> Iterator for Iter<'a, K, V, O, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
    O: KeyOrder<K>,
    S: BuildHasher,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.next_with(|k, v| (k.clone(), v.clone()))
    }
}

/// Iterator over cloned keys of a [`HashTable`].
pub struct Keys<'a, K, V, O, S> {
    cursor: Cursor<'a, K, V, O, S, K>,
}

impl<'a, K, V, O, S> Keys<'a, K, V, O, S>
where
    K: Hash + Eq + Send + 'static,
    V: Clone + Send + 'static,
    O: KeyOrder<K>,
    S: BuildHasher,
{
    pub(crate) fn new(map: &'a HashTable<K, V, O, S>) -> Self {
        Self {
            cursor: Cursor::new(map),
        }
    }
}

impl<'a, K, V, O, S> Iterator for Keys<'a, K, V, O, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
    O: KeyOrder<K>,
    S: BuildHasher,
{
    type Item = K;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.next_with(|k, _| k.clone())
    }
}

/// Iterator over cloned values of a [`HashTable`].
pub struct Values<'a, K, V, O, S> {
    cursor: Cursor<'a, K, V, O, S, V>,
}

impl<'a, K, V, O, S> Values<'a, K, V, O, S>
where
    K: Hash + Eq + Send + 'static,
    V: Clone + Send + 'static,
    O: KeyOrder<K>,
    S: BuildHasher,
{
    pub(crate) fn new(map: &'a HashTable<K, V, O, S>) -> Self {
        Self {
            cursor: Cursor::new(map),
        }
    }
}

impl<'a, K, V, O, S> Iterator for Values<'a, K, V, O, S>
where
    K: Hash + Eq + Send + 'static,
    V: Clone + Send + 'static,
    O: KeyOrder<K>,
    S: BuildHasher,
{
    type Item = V;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.next_with(|_, v| v.clone())
    }
}
