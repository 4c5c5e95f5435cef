//! Deterministically leveled skip list used by hot buckets with ordered keys.
//!
//! Layer 0 links every entry of the bucket in key order, tombstones included.
//! Layer `i` links the entries whose layer-0 position is a multiple of `2^i`,
//! and each node points `down` at the node for the same entry one layer below.
//! The list is immutable once built; any structural insert rebuilds it.

use std::cmp::Ordering;
use std::sync::Arc;

use crossbeam_epoch::Guard;

use crate::entry::Entry;
use crate::order::KeyOrder;

struct SkipNode<K, V> {
    entry: Arc<Entry<K, V>>,
    next: Option<Arc<SkipNode<K, V>>>,
    down: Option<Arc<SkipNode<K, V>>>,
}

impl<K, V> Drop for SkipNode<K, V> {
    fn drop(&mut self) {
        // Layers are long, towers are short: unlink along `next` iteratively.
        let mut next = self.next.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = node.next.take(),
                Err(_) => break,
            }
        }
    }
}

pub(crate) struct SkipList<K, V> {
    /// `heads[i]` is the first node of layer `i`; all heads carry the smallest key.
    heads: Vec<Arc<SkipNode<K, V>>>,
    len: usize,
}

impl<K, V> SkipList<K, V> {
    /// Sort `entries` by key and lay them out.
    pub(crate) fn build<O: KeyOrder<K>>(mut entries: Vec<Arc<Entry<K, V>>>) -> Self {
        entries.sort_by(|a, b| O::compare(a.key(), b.key()));
        Self::from_sorted(entries)
    }

    /// Lay out entries that are already in key order.
    fn from_sorted(entries: Vec<Arc<Entry<K, V>>>) -> Self {
        let len = entries.len();
        let layers = layer_count(len);
        let mut heads = Vec::with_capacity(layers);
        let mut below: Vec<Option<Arc<SkipNode<K, V>>>> = vec![None; len];

        for layer in 0..layers {
            let mut head: Option<Arc<SkipNode<K, V>>> = None;
            for j in (0..=((len - 1) >> layer)).rev() {
                let idx = j << layer;
                let node = Arc::new(SkipNode {
                    entry: entries[idx].clone(),
                    next: head.take(),
                    down: below[idx].take(),
                });
                below[idx] = Some(node.clone());
                head = Some(node);
            }
            if let Some(head) = head {
                heads.push(head);
            }
        }

        Self { heads, len }
    }

    /// Entries in layer 0, live and tombstoned.
    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub(crate) fn layers(&self) -> usize {
        self.heads.len()
    }

    /// Layer 0 in key order.
    pub(crate) fn iter(&self) -> LayerIter<'_, K, V> {
        LayerIter {
            next: self.heads.first().map(|h| &**h),
        }
    }

    /// Descend from the top layer looking for `key`.
    pub(crate) fn find<O: KeyOrder<K>>(&self, key: &K) -> Option<&Arc<Entry<K, V>>> {
        let mut cur: &SkipNode<K, V> = self.heads.last()?;
        match O::compare(cur.entry.key(), key) {
            Ordering::Equal => return Some(&cur.entry),
            Ordering::Greater => return None,
            Ordering::Less => {}
        }
        loop {
            if let Some(next) = cur.next.as_deref() {
                match O::compare(next.entry.key(), key) {
                    Ordering::Less => {
                        cur = next;
                        continue;
                    }
                    Ordering::Equal => return Some(&next.entry),
                    Ordering::Greater => {}
                }
            }
            cur = cur.down.as_deref()?;
        }
    }

    /// Rebuilt list holding every live entry plus `entry`, tombstones purged.
    pub(crate) fn with_inserted<O: KeyOrder<K>>(
        &self,
        entry: Arc<Entry<K, V>>,
        guard: &Guard,
    ) -> Self {
        let mut kept = Vec::with_capacity(self.len() + 1);
        kept.extend(self.iter().filter(|e| e.is_live(guard)).cloned());
        let at = kept.partition_point(|e| O::compare(e.key(), entry.key()) == Ordering::Less);
        kept.insert(at, entry);
        Self::from_sorted(kept)
    }
}

pub(crate) struct LayerIter<'a, K, V> {
    next: Option<&'a SkipNode<K, V>>,
}

impl<'a, K, V> Iterator for LayerIter<'a, K, V> {
    type Item = &'a Arc<Entry<K, V>>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        self.next = node.next.as_deref();
        Some(&node.entry)
    }
}

/// Smallest `L` such that `2^L > n`.
#[inline(always)]
fn layer_count(n: usize) -> usize {
    (usize::BITS - n.leading_zeros()) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Slot;
    use crate::order::Ordered;
    use crossbeam_epoch as epoch;

    fn entries(keys: &[u64]) -> Vec<Arc<Entry<u64, u64>>> {
        keys.iter()
            .map(|&k| Arc::new(Entry::new(k as u32, k, k * 10)))
            .collect()
    }

    fn layer_keys(list: &SkipList<u64, u64>, layer: usize) -> Vec<u64> {
        let mut out = Vec::new();
        let mut cur = Some(&*list.heads[layer]);
        while let Some(node) = cur {
            out.push(*node.entry.key());
            cur = node.next.as_deref();
        }
        out
    }

    #[test]
    fn layer_count_matches_power_of_two_bound() {
        assert_eq!(layer_count(0), 0);
        assert_eq!(layer_count(1), 1);
        assert_eq!(layer_count(7), 3);
        assert_eq!(layer_count(8), 4);
        assert_eq!(layer_count(9), 4);
        assert_eq!(layer_count(16), 5);
    }

    #[test]
    fn build_sorts_and_strides_layers() {
        let list = SkipList::build::<Ordered>(entries(&[50, 10, 90, 30, 70, 20, 80, 40, 60]));
        assert_eq!(list.len(), 9);
        assert_eq!(list.layers(), 4);
        assert_eq!(layer_keys(&list, 0), vec![10, 20, 30, 40, 50, 60, 70, 80, 90]);
        assert_eq!(layer_keys(&list, 1), vec![10, 30, 50, 70, 90]);
        assert_eq!(layer_keys(&list, 2), vec![10, 50, 90]);
        assert_eq!(layer_keys(&list, 3), vec![10, 90]);
    }

    #[test]
    fn find_hits_every_key_and_misses_gaps() {
        let keys: Vec<u64> = (1..=33).map(|k| k * 2).collect();
        let list = SkipList::build::<Ordered>(entries(&keys));
        for k in &keys {
            let e = list.find::<Ordered>(k).expect("present");
            assert_eq!(e.key(), k);
        }
        for miss in [0u64, 1, 3, 33, 65, 67, 1000] {
            assert!(list.find::<Ordered>(&miss).is_none(), "unexpected hit for {}", miss);
        }
    }

    #[test]
    fn insert_rebuild_purges_tombstones() {
        let guard = epoch::pin();
        let list = SkipList::build::<Ordered>(entries(&[1, 2, 3, 4, 5, 6, 7, 8]));
        list.find::<Ordered>(&3).unwrap().replace(Slot::Tombstone, &guard);
        list.find::<Ordered>(&6).unwrap().replace(Slot::Tombstone, &guard);

        // Tombstones stay in layer 0 until the next structural insert.
        assert_eq!(list.len(), 8);
        assert!(list.find::<Ordered>(&3).is_some());

        let rebuilt = list.with_inserted::<Ordered>(entries(&[0])[0].clone(), &guard);
        assert_eq!(rebuilt.len(), 7);
        assert_eq!(rebuilt.layers(), 3);
        assert_eq!(layer_keys(&rebuilt, 0), vec![0, 1, 2, 4, 5, 7, 8]);
        assert!(rebuilt.find::<Ordered>(&3).is_none());
        assert!(rebuilt.find::<Ordered>(&0).is_some());
    }

    #[test]
    fn empty_list_finds_nothing() {
        let list: SkipList<u64, u64> = SkipList::build::<Ordered>(Vec::new());
        assert_eq!(list.layers(), 0);
        assert!(list.find::<Ordered>(&1).is_none());
        assert_eq!(list.iter().count(), 0);
    }
}
