//! Buckets: the unit of locking and of chain / skip-list storage.
//!
//! Readers load the published [`Store`] without locking. Writers take the
//! bucket lock, build a replacement store (or swap a value slot in place) and
//! publish it; the old store is retired through the epoch.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};

use crate::{delay, TRANSFORM_LIMIT};
use crate::entry::{Chain, ChainIter, Entry, Slot};
use crate::order::KeyOrder;
use crate::skiplist::{LayerIter, SkipList};

/// Lock bit: a writer owns the bucket
const LOCKED: u8 = 0b01;

/// Set by split/clear; the bucket belongs to a table that is being replaced
const RETIRED: u8 = 0b10;

pub(crate) enum Store<K, V> {
    Chain(Chain<K, V>),
    Skip(SkipList<K, V>),
}

impl<K, V> Store<K, V> {
    fn from_entries<O: KeyOrder<K>>(entries: Vec<Arc<Entry<K, V>>>) -> Self {
        if O::TOTAL && entries.len() >= TRANSFORM_LIMIT {
            Store::Skip(SkipList::build::<O>(entries))
        } else {
            Store::Chain(Chain::from_entries(entries))
        }
    }

    fn entries(&self) -> Entries<'_, K, V> {
        match self {
            Store::Chain(chain) => Entries::Chain(chain.iter()),
            Store::Skip(list) => Entries::Skip(list.iter()),
        }
    }
}

/// Every entry of a store, tombstones included.
enum Entries<'a, K, V> {
    Chain(ChainIter<'a, K, V>),
    Skip(LayerIter<'a, K, V>),
}

impl<'a, K, V> Iterator for Entries<'a, K, V> {
    type Item = &'a Arc<Entry<K, V>>;

    #[inline(always)]
    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Entries::Chain(it) => it.next(),
            Entries::Skip(it) => it.next(),
        }
    }
}

pub(crate) struct Bucket<K, V> {
    state: AtomicU8,
    store: Atomic<Store<K, V>>,
}

/// Outcome of [`Bucket::lock`].
pub(crate) enum Locking<'a, K, V> {
    Held(BucketGuard<'a, K, V>),
    /// A resize split this bucket; retry against the current table.
    Retired,
    TimedOut,
}

impl<K, V> Bucket<K, V> {
    pub(crate) fn new() -> Self {
        Self::with_store(Store::Chain(Chain::new()))
    }

    fn with_store(store: Store<K, V>) -> Self {
        Self {
            state: AtomicU8::new(0),
            store: Atomic::new(store),
        }
    }

    fn from_entries<O: KeyOrder<K>>(entries: Vec<Arc<Entry<K, V>>>) -> Self {
        Self::with_store(Store::from_entries::<O>(entries))
    }

    #[inline(always)]
    fn store<'g>(&self, guard: &'g Guard) -> &'g Store<K, V> {
        // SAFETY: the store pointer is never null and replaced stores are retired
        // through the epoch, so the reference is valid for the guard's lifetime.
        unsafe { self.store.load(Ordering::Acquire, guard).deref() }
    }

    /// Lock-free lookup of a live value.
    pub(crate) fn get<'g, O: KeyOrder<K>>(&self, key: &K, guard: &'g Guard) -> Option<&'g V>
    where
        K: Eq,
    {
        let entry = match self.store(guard) {
            Store::Chain(chain) => chain.find(key),
            Store::Skip(list) => list.find::<O>(key),
        }?;
        entry.value(guard)
    }

    /// Live pairs as currently published.
    pub(crate) fn live<'g>(&self, guard: &'g Guard) -> impl Iterator<Item = (&'g K, &'g V)> + 'g
    where
        K: 'g,
        V: 'g,
    {
        self.store(guard)
            .entries()
            .filter_map(move |e| e.value(guard).map(|v| (e.key(), v)))
    }

    #[cfg(test)]
    pub(crate) fn is_transformed(&self, guard: &Guard) -> bool {
        matches!(self.store(guard), Store::Skip(_))
    }

    /// Acquire the bucket lock, spinning until `deadline`.
    pub(crate) fn lock(&self, deadline: Instant) -> Locking<'_, K, V> {
        let mut spins = 0;
        loop {
            let cur = self.state.load(Ordering::Relaxed);
            if cur & RETIRED != 0 {
                return Locking::Retired;
            }
            if cur & LOCKED == 0 {
                if self
                    .state
                    .compare_exchange_weak(cur, cur | LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return Locking::Held(BucketGuard { bucket: self });
                }
                continue;
            }
            if !delay(&mut spins, deadline) {
                return Locking::TimedOut;
            }
        }
    }

    /// Undo a retirement after an abandoned resize.
    pub(crate) fn reinstate(&self) {
        self.state.fetch_and(!RETIRED, Ordering::Release);
    }
}

impl<K, V> Drop for Bucket<K, V> {
    fn drop(&mut self) {
        // SAFETY: buckets are dropped with their table, after every reader of that
        // table has unpinned (or with exclusive access in the map's own Drop).
        unsafe {
            let store = self.store.load(Ordering::Relaxed, epoch::unprotected());
            if !store.is_null() {
                drop(store.into_owned());
            }
        }
    }
}

// ================================================================================================
// LOCKED OPERATIONS
// ================================================================================================

/// Exclusive access to one bucket; unlocks on drop.
pub(crate) struct BucketGuard<'a, K, V> {
    bucket: &'a Bucket<K, V>,
}

impl<'a, K, V> BucketGuard<'a, K, V> {
    fn install(&self, store: Store<K, V>, guard: &Guard) {
        let old = self
            .bucket
            .store
            .swap(Owned::new(store), Ordering::AcqRel, guard);
        // SAFETY: `old` is no longer reachable from the bucket.
        unsafe { guard.defer_destroy(old) };
    }

    /// Mark the bucket retired and release it.
    pub(crate) fn retire(self) {
        self.bucket.state.fetch_or(RETIRED, Ordering::Release);
    }

    /// Insert or update. Returns the previous live value; `None` means the key
    /// is new to the map (including a key whose entry was tombstoned).
    pub(crate) fn put<O: KeyOrder<K>>(&self, hash: u32, key: K, value: V, guard: &Guard) -> Option<V>
    where
        K: Eq,
        V: Clone,
    {
        match self.bucket.store(guard) {
            Store::Chain(chain) => {
                if let Some(entry) = chain.find(&key) {
                    return entry.replace(Slot::Live(value), guard);
                }
                let grown = chain.prepend(Arc::new(Entry::new(hash, key, value)));
                let next = if O::TOTAL && grown.len() >= TRANSFORM_LIMIT {
                    Store::Skip(SkipList::build::<O>(grown.iter().cloned().collect()))
                } else {
                    Store::Chain(grown)
                };
                self.install(next, guard);
                None
            }
            Store::Skip(list) => {
                if let Some(entry) = list.find::<O>(&key) {
                    return entry.replace(Slot::Live(value), guard);
                }
                let rebuilt = list.with_inserted::<O>(Arc::new(Entry::new(hash, key, value)), guard);
                self.install(Store::Skip(rebuilt), guard);
                None
            }
        }
    }

    /// Remove `key`. Chains drop the node at once; skip lists leave a tombstone
    /// that the next structural insert purges.
    pub(crate) fn remove<O: KeyOrder<K>>(&self, key: &K, guard: &Guard) -> Option<V>
    where
        K: Eq,
        V: Clone,
    {
        match self.bucket.store(guard) {
            Store::Chain(chain) => {
                let (rest, removed) = chain.without(key)?;
                let value = removed.value(guard).cloned();
                self.install(Store::Chain(rest), guard);
                value
            }
            Store::Skip(list) => {
                let entry = list.find::<O>(key)?;
                if !entry.is_live(guard) {
                    return None;
                }
                entry.replace(Slot::Tombstone, guard)
            }
        }
    }

    /// Partition live entries by the bit `new_capacity / 2`.
    ///
    /// Entries that still map to `index` land in the first bucket, the rest in
    /// the second (index `index + new_capacity / 2`). The source bucket is left
    /// intact for readers and retired for writers.
    pub(crate) fn split<O: KeyOrder<K>>(
        self,
        index: usize,
        new_capacity: usize,
        guard: &Guard,
    ) -> (Bucket<K, V>, Bucket<K, V>) {
        let mask = new_capacity - 1;
        let mut smaller = Vec::new();
        let mut bigger = Vec::new();
        for entry in self.bucket.store(guard).entries() {
            if !entry.is_live(guard) {
                continue;
            }
            if entry.hash() as usize & mask == index {
                smaller.push(entry.clone());
            } else {
                bigger.push(entry.clone());
            }
        }
        self.retire();
        (
            Bucket::from_entries::<O>(smaller),
            Bucket::from_entries::<O>(bigger),
        )
    }
}

impl<'a, K, V> Drop for BucketGuard<'a, K, V> {
    fn drop(&mut self) {
        self.bucket.state.fetch_and(!LOCKED, Ordering::Release);
    }
}
