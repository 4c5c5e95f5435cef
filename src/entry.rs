//! Entries, value slots and the persistent collision chain.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};

/// State of an entry's value.
///
/// `Tombstone` only ever appears inside skip-list buckets, where removal is
/// lazy. It is never handed out through the public API.
pub(crate) enum Slot<V> {
    Live(V),
    Tombstone,
}

/// Key, cached spread hash and an atomically swappable value slot.
///
/// The slot is replaced only under the owning bucket's lock; readers load it
/// without locking and see either the old or the new value.
pub(crate) struct Entry<K, V> {
    hash: u32,
    key: K,
    slot: Atomic<Slot<V>>,
}

impl<K, V> Entry<K, V> {
    pub(crate) fn new(hash: u32, key: K, value: V) -> Self {
        Self {
            hash,
            key,
            slot: Atomic::new(Slot::Live(value)),
        }
    }

    #[inline(always)]
    pub(crate) fn hash(&self) -> u32 {
        self.hash
    }

    #[inline(always)]
    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    /// Current live value, `None` if tombstoned.
    #[inline(always)]
    pub(crate) fn value<'g>(&self, guard: &'g Guard) -> Option<&'g V> {
        // SAFETY: the slot is never null, and replaced slots are retired through
        // the epoch so they outlive every guard that could have loaded them.
        match unsafe { self.slot.load(Ordering::Acquire, guard).as_ref() } {
            Some(Slot::Live(v)) => Some(v),
            _ => None,
        }
    }

    #[inline(always)]
    pub(crate) fn is_live(&self, guard: &Guard) -> bool {
        self.value(guard).is_some()
    }

    /// Swap in a new slot and return the previous live value.
    ///
    /// Caller must hold the lock of the bucket publishing this entry.
    pub(crate) fn replace(&self, slot: Slot<V>, guard: &Guard) -> Option<V>
    where
        V: Clone,
    {
        let old = self.slot.swap(Owned::new(slot), Ordering::AcqRel, guard);
        // SAFETY: `old` was published by this entry and is now unreachable for new
        // readers; existing readers are covered by the deferred destruction.
        unsafe {
            let prior = match old.as_ref() {
                Some(Slot::Live(v)) => Some(v.clone()),
                _ => None,
            };
            guard.defer_destroy(old);
            prior
        }
    }
}

impl<K, V> Drop for Entry<K, V> {
    fn drop(&mut self) {
        // SAFETY: the last owner is going away, so no reader can reach the slot.
        unsafe {
            let slot = self.slot.load(Ordering::Relaxed, epoch::unprotected());
            if !slot.is_null() {
                drop(slot.into_owned());
            }
        }
    }
}

// ================================================================================================
// PERSISTENT CHAIN
// ================================================================================================

/// Immutable chain cell. Chains share their tails.
pub(crate) struct Node<K, V> {
    entry: Arc<Entry<K, V>>,
    next: Option<Arc<Node<K, V>>>,
}

impl<K, V> Drop for Node<K, V> {
    fn drop(&mut self) {
        // Unlink iteratively so long chains don't recurse once per node.
        let mut next = self.next.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = node.next.take(),
                Err(_) => break,
            }
        }
    }
}

/// Head of a collision chain plus its entry count.
pub(crate) struct Chain<K, V> {
    head: Option<Arc<Node<K, V>>>,
    len: usize,
}

impl<K, V> Chain<K, V> {
    pub(crate) fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Build a chain that yields `entries` in the given order.
    pub(crate) fn from_entries(entries: Vec<Arc<Entry<K, V>>>) -> Self {
        let len = entries.len();
        let mut head = None;
        for entry in entries.into_iter().rev() {
            head = Some(Arc::new(Node { entry, next: head }));
        }
        Self { head, len }
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn iter(&self) -> ChainIter<'_, K, V> {
        ChainIter {
            next: self.head.as_deref(),
        }
    }

    /// New chain with `entry` in front and this chain as its tail.
    pub(crate) fn prepend(&self, entry: Arc<Entry<K, V>>) -> Self {
        Self {
            head: Some(Arc::new(Node {
                entry,
                next: self.head.clone(),
            })),
            len: self.len + 1,
        }
    }
}

impl<K: Eq, V> Chain<K, V> {
    pub(crate) fn find(&self, key: &K) -> Option<&Arc<Entry<K, V>>> {
        self.iter().find(|e| e.key() == key)
    }

    /// Chain without `key`, plus the removed entry.
    ///
    /// Nodes ahead of the match are rebuilt; everything after it is shared.
    pub(crate) fn without(&self, key: &K) -> Option<(Self, Arc<Entry<K, V>>)> {
        let mut prefix = Vec::new();
        let mut cur = self.head.as_deref();
        while let Some(node) = cur {
            if node.entry.key() == key {
                let mut head = node.next.clone();
                for entry in prefix.into_iter().rev() {
                    head = Some(Arc::new(Node { entry, next: head }));
                }
                let chain = Self {
                    head,
                    len: self.len - 1,
                };
                return Some((chain, node.entry.clone()));
            }
            prefix.push(node.entry.clone());
            cur = node.next.as_deref();
        }
        None
    }
}

pub(crate) struct ChainIter<'a, K, V> {
    next: Option<&'a Node<K, V>>,
}

impl<'a, K, V> Iterator for ChainIter<'a, K, V> {
    type Item = &'a Arc<Entry<K, V>>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        self.next = node.next.as_deref();
        Some(&node.entry)
    }
}
