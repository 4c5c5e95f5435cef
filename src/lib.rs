//! skiptable_rs: a concurrent, auto-growing hash table with per-bucket locks.
//!
//! Readers never block: they walk immutable, epoch-protected snapshots of a
//! bucket. Writers serialize per bucket through a bounded spin lock. The table
//! doubles when the load factor reaches 0.75, splitting each bucket in two by
//! one extra hash bit. When keys are totally ordered, a bucket whose collision
//! chain reaches [`TRANSFORM_LIMIT`] entries turns into a skip list so lookups
//! stay logarithmic under heavy collision.
//!
//! ```
//! use skiptable_rs::HashTable;
//!
//! let map: HashTable<String, u32> = HashTable::new();
//! assert_eq!(map.put("a".to_string(), 1).unwrap(), None);
//! assert_eq!(map.get(&"a".to_string()), Some(1));
//! assert_eq!(map.remove(&"a".to_string()).unwrap(), Some(1));
//! assert!(map.is_empty());
//! ```

mod bucket;
mod entry;
mod error;
mod iter;
mod order;
mod skiplist;

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use ahash::RandomState;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};

use crate::bucket::{Bucket, Locking};

pub use crate::error::{MapError, Result};
pub use crate::iter::{Iter, Keys, Values};
pub use crate::order::{KeyOrder, Ordered, Unordered};

// ================================================================================================
// CONSTANTS
// ================================================================================================

/// Smallest bucket count; also the capacity after [`HashTable::clear`].
pub const MIN_CAPACITY: usize = 1 << 8;

/// Largest bucket count. Past it buckets absorb the load.
pub const MAX_CAPACITY: usize = 1 << 16;

/// Chain length at which an ordered bucket turns into a skip list.
pub const TRANSFORM_LIMIT: usize = 8;

/// How long a writer may wait on a bucket lock or a resize by default.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Usable bits of a spread hash
const HASH_BITS: u32 = 0x7fff_ffff;

/// pure CPU hints before any yield
const SPIN_BEFORE_YIELD: i32 = 128;

// ================================================================================================
// TABLE
// ================================================================================================

/// One generation of the bucket array.
struct Table<K, V> {
    buckets: Box<[Bucket<K, V>]>,
}

impl<K, V> Table<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            buckets: (0..capacity).map(|_| Bucket::new()).collect(),
        }
    }

    fn from_buckets(buckets: Vec<Bucket<K, V>>) -> Self {
        Self {
            buckets: buckets.into_boxed_slice(),
        }
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> usize {
        self.buckets.len()
    }

    #[inline(always)]
    fn index(&self, hash: u32) -> usize {
        hash as usize & (self.buckets.len() - 1)
    }

    #[inline(always)]
    pub(crate) fn bucket(&self, index: usize) -> &Bucket<K, V> {
        &self.buckets[index]
    }
}

// ================================================================================================
// HASH TABLE
// ================================================================================================

/// Concurrent hash table with lock-free reads and per-bucket writers.
///
/// `O` selects whether keys are totally ordered ([`Ordered`], the default) or
/// not ([`Unordered`]). Only ordered maps turn hot buckets into skip lists.
///
/// Mutating calls return [`Result`] because every wait is bounded by the lock
/// timeout; a [`MapError`] means the call had no effect and can be retried.
pub struct HashTable<K, V, O = Ordered, S = RandomState> {
    table: Atomic<Table<K, V>>,
    size: AtomicUsize,
    resizing: AtomicBool,
    hasher: S,
    lock_timeout: Duration,
    _order: PhantomData<fn() -> O>,
}

impl<K, V, O> HashTable<K, V, O, RandomState>
where
    K: Hash + Eq + Send + 'static,
    V: Clone + Send + 'static,
    O: KeyOrder<K>,
{
    /// Create a table with [`MIN_CAPACITY`] buckets.
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    /// Create a table sized from `capacity`, clamped into
    /// `[MIN_CAPACITY, MAX_CAPACITY]` and rounded up to a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, V, O, S> HashTable<K, V, O, S>
where
    K: Hash + Eq + Send + 'static,
    V: Clone + Send + 'static,
    O: KeyOrder<K>,
    S: BuildHasher,
{
    /// Create a table using the provided hasher.
    ///
    /// Changing the hasher of a populated table is not supported because it
    /// would invalidate bucket placement.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(MIN_CAPACITY, hasher)
    }

    /// Create a table with the given capacity hint and hasher.
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        Self {
            table: Atomic::new(Table::new(calc_capacity(capacity))),
            size: AtomicUsize::new(0),
            resizing: AtomicBool::new(false),
            hasher,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            _order: PhantomData,
        }
    }

    /// Bound every lock or resize wait by `timeout` instead of
    /// [`DEFAULT_LOCK_TIMEOUT`].
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Upper bound on any single wait inside [`put`](Self::put),
    /// [`remove`](Self::remove) or [`clear`](Self::clear).
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    // ============================================================================================
    // PUBLIC API METHODS
    // ============================================================================================

    /// Current number of buckets.
    pub fn capacity(&self) -> usize {
        let guard = epoch::pin();
        self.current(&guard).capacity()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a clone of the value stored for `key`.
    ///
    /// Never blocks. While a resize is in flight the lookup reads whichever
    /// table is current at that instant.
    pub fn get(&self, key: &K) -> Option<V> {
        let hash = self.spread_hash(key);
        let guard = epoch::pin();
        let table = self.current(&guard);
        table
            .bucket(table.index(hash))
            .get::<O>(key, &guard)
            .cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let hash = self.spread_hash(key);
        let guard = epoch::pin();
        let table = self.current(&guard);
        table
            .bucket(table.index(hash))
            .get::<O>(key, &guard)
            .is_some()
    }

    /// Full scan for a live entry holding `value`.
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        let guard = epoch::pin();
        let table = self.current(&guard);
        table
            .buckets
            .iter()
            .any(|b| b.live(&guard).any(|(_, v)| v == value))
    }

    /// Insert or update `key`, returning the previous value.
    ///
    /// Waits for a running resize, then locks the key's bucket. A new key may
    /// trigger a resize once the load factor reaches 0.75.
    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        let deadline = Instant::now() + self.lock_timeout;
        self.wait_for_resize(deadline)?;
        self.put_after_wait(key, value, deadline)
    }

    /// Insert every pair, stopping at the first failure.
    pub fn put_all<I>(&self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in pairs {
            self.put(key, value)?;
        }
        Ok(())
    }

    /// Remove `key`, returning its value.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let hash = self.spread_hash(key);
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            self.wait_for_resize(deadline)?;

            let guard = epoch::pin();
            let table = self.current(&guard);
            let index = table.index(hash);
            let bucket = table.bucket(index);
            if bucket.get::<O>(key, &guard).is_none() {
                return Ok(None);
            }
            let locked = match bucket.lock(deadline) {
                Locking::Held(locked) => locked,
                Locking::Retired => continue,
                Locking::TimedOut => return Err(self.lock_timed_out(index)),
            };

            let removed = locked.remove::<O>(key, &guard);
            if removed.is_some() {
                self.size.fetch_sub(1, Ordering::AcqRel);
            }
            return Ok(removed);
        }
    }

    /// Drop every entry and shrink back to [`MIN_CAPACITY`].
    pub fn clear(&self) -> Result<()> {
        self.clear_with(|| ())
    }

    /// Lazy iterator over cloned `(key, value)` pairs.
    pub fn iter(&self) -> Iter<'_, K, V, O, S>
    where
        K: Clone,
    {
        Iter::new(self)
    }

    pub fn keys(&self) -> Keys<'_, K, V, O, S>
    where
        K: Clone,
    {
        Keys::new(self)
    }

    pub fn values(&self) -> Values<'_, K, V, O, S> {
        Values::new(self)
    }

    // ============================================================================================
    // PRIVATE HELPER METHODS
    // ============================================================================================

    #[inline(always)]
    fn spread_hash(&self, key: &K) -> u32 {
        spread(self.hasher.hash_one(key))
    }

    #[inline(always)]
    pub(crate) fn current<'g>(&self, guard: &'g Guard) -> &'g Table<K, V> {
        // SAFETY: the table pointer is never null; swapped-out tables are retired
        // through the epoch and outlive every guard that loaded them.
        unsafe { self.table.load(Ordering::Acquire, guard).deref() }
    }

    /// Insert path once the resize flag was seen clear. A retired bucket sends
    /// the writer back to wait for the table that replaced it.
    fn put_after_wait(&self, key: K, value: V, deadline: Instant) -> Result<Option<V>> {
        let hash = self.spread_hash(&key);
        let mut retired = false;
        loop {
            if retired {
                self.wait_for_resize(deadline)?;
            }

            let guard = epoch::pin();
            let table = self.current(&guard);
            let index = table.index(hash);
            let locked = match table.bucket(index).lock(deadline) {
                Locking::Held(locked) => locked,
                // Split under our feet; pick up the new table.
                Locking::Retired => {
                    retired = true;
                    continue;
                }
                Locking::TimedOut => return Err(self.lock_timed_out(index)),
            };

            let prior = locked.put::<O>(hash, key, value, &guard);
            if prior.is_none() {
                self.size.fetch_add(1, Ordering::AcqRel);
            }
            drop(locked);

            if prior.is_none() && overloaded(self.len(), table.capacity()) {
                self.resize();
            }
            return Ok(prior);
        }
    }

    /// Body of [`clear`](Self::clear); `installed` runs right after the fresh
    /// table is published, while the resize flag is still held.
    fn clear_with<F: FnOnce()>(&self, installed: F) -> Result<()> {
        let deadline = Instant::now() + self.lock_timeout;
        let mut spins = 0;
        while self
            .resizing
            .compare_exchange_weak(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            if !delay(&mut spins, deadline) {
                return Err(MapError::ResizeTimeout {
                    waited: self.lock_timeout,
                });
            }
        }

        let guard = epoch::pin();
        let old = self.current(&guard);
        for (index, bucket) in old.buckets.iter().enumerate() {
            match bucket.lock(deadline) {
                Locking::Held(locked) => locked.retire(),
                Locking::Retired | Locking::TimedOut => {
                    self.abandon(old, index);
                    return Err(self.lock_timed_out(index));
                }
            }
        }

        // Old-table writers are all shut out here. Writers that reach the fresh
        // table count on top of the reset.
        self.size.store(0, Ordering::Release);
        let previous = self.table.swap(
            Owned::new(Table::new(MIN_CAPACITY)),
            Ordering::AcqRel,
            &guard,
        );
        installed();
        // SAFETY: the old table is unreachable for new readers.
        unsafe { guard.defer_destroy(previous) };
        self.resizing.store(false, Ordering::Release);
        Ok(())
    }

    fn wait_for_resize(&self, deadline: Instant) -> Result<()> {
        let mut spins = 0;
        while self.resizing.load(Ordering::Acquire) {
            if !delay(&mut spins, deadline) {
                return Err(MapError::ResizeTimeout {
                    waited: self.lock_timeout,
                });
            }
        }
        Ok(())
    }

    fn lock_timed_out(&self, index: usize) -> MapError {
        MapError::LockTimeout {
            index,
            waited: self.lock_timeout,
        }
    }

    /// Double the bucket array if the load factor still calls for it.
    ///
    /// Only one resize runs at a time; a caller that loses the race returns
    /// immediately. If a bucket cannot be locked in time the resize is
    /// abandoned and a later insert tries again.
    fn resize(&self) {
        if self
            .resizing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let guard = epoch::pin();
        let old = self.current(&guard);
        let old_capacity = old.capacity();
        if old_capacity >= MAX_CAPACITY || !overloaded(self.len(), old_capacity) {
            self.resizing.store(false, Ordering::Release);
            return;
        }

        let new_capacity = old_capacity << 1;
        let deadline = Instant::now() + self.lock_timeout;
        let mut lower = Vec::with_capacity(new_capacity);
        let mut upper = Vec::with_capacity(old_capacity);
        for (index, bucket) in old.buckets.iter().enumerate() {
            match bucket.lock(deadline) {
                Locking::Held(locked) => {
                    let (smaller, bigger) = locked.split::<O>(index, new_capacity, &guard);
                    lower.push(smaller);
                    upper.push(bigger);
                }
                Locking::Retired | Locking::TimedOut => {
                    self.abandon(old, index);
                    return;
                }
            }
        }
        lower.append(&mut upper);

        let previous = self.table.swap(
            Owned::new(Table::from_buckets(lower)),
            Ordering::AcqRel,
            &guard,
        );
        // SAFETY: the old table is unreachable for new readers.
        unsafe { guard.defer_destroy(previous) };
        self.resizing.store(false, Ordering::Release);
    }

    /// Reinstate the first `retired` buckets of `table` and drop the resize flag.
    fn abandon(&self, table: &Table<K, V>, retired: usize) {
        for bucket in &table.buckets[..retired] {
            bucket.reinstate();
        }
        self.resizing.store(false, Ordering::Release);
    }

    #[cfg(test)]
    fn is_transformed(&self, key: &K) -> bool {
        let guard = epoch::pin();
        let table = self.current(&guard);
        table
            .bucket(table.index(self.spread_hash(key)))
            .is_transformed(&guard)
    }
}

// ================================================================================================
// DROP AND STANDARD TRAIT IMPLEMENTATIONS
// ================================================================================================

impl<K, V, O, S> Drop for HashTable<K, V, O, S> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out concurrent readers of the current table.
        unsafe {
            let table = self.table.load(Ordering::Relaxed, epoch::unprotected());
            if !table.is_null() {
                drop(table.into_owned());
            }
        }
    }
}

impl<K, V, O, S> Default for HashTable<K, V, O, S>
where
    K: Hash + Eq + Send + 'static,
    V: Clone + Send + 'static,
    O: KeyOrder<K>,
    S: BuildHasher + Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<'a, K, V, O, S> IntoIterator for &'a HashTable<K, V, O, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
    O: KeyOrder<K>,
    S: BuildHasher,
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V, O, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K, V, O, S> fmt::Debug for HashTable<K, V, O, S>
where
    K: fmt::Debug + Hash + Eq + Clone + Send + 'static,
    V: fmt::Debug + Clone + Send + 'static,
    O: KeyOrder<K>,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

// ================================================================================================
// UTILITY FUNCTIONS
// ================================================================================================

/// Fold the high half of the hash into the low half.
///
/// Power-of-two masking ignores high bits; keys differing only there would
/// otherwise always collide.
#[inline(always)]
fn spread(hash: u64) -> u32 {
    let h = hash as u32;
    (h ^ (h >> 16)) & HASH_BITS
}

fn calc_capacity(hint: usize) -> usize {
    hint.clamp(MIN_CAPACITY, MAX_CAPACITY).next_power_of_two()
}

/// Load factor 0.75.
#[inline(always)]
fn overloaded(size: usize, capacity: usize) -> bool {
    size >= capacity - capacity / 4
}

#[inline(always)]
fn try_spin(spins: &mut i32) -> bool {
    if *spins < SPIN_BEFORE_YIELD {
        *spins += *spins + 1;
        std::hint::spin_loop();
        true
    } else {
        false
    }
}

/// Back off once. Returns `false` when `deadline` has passed.
#[inline(always)]
pub(crate) fn delay(spins: &mut i32, deadline: Instant) -> bool {
    if !try_spin(spins) {
        *spins = 0;
        if Instant::now() >= deadline {
            return false;
        }
        thread::yield_now();
    }
    true
}
