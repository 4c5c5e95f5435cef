//! Key ordering capability.
//!
//! A map is instantiated either with [`Ordered`], which lets hot buckets turn
//! into skip lists, or with [`Unordered`], which keeps every bucket a chain.

use std::cmp::Ordering;

/// Compile-time capability describing whether keys can be totally ordered.
pub trait KeyOrder<K: ?Sized> {
    /// `true` when [`compare`](KeyOrder::compare) is a total order.
    const TOTAL: bool;

    /// Compare two keys. Only consulted when `TOTAL` is `true`.
    fn compare(a: &K, b: &K) -> Ordering;
}

/// Keys implement [`Ord`]; collision chains may transform into skip lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ordered;

impl<K: Ord + ?Sized> KeyOrder<K> for Ordered {
    const TOTAL: bool = true;

    #[inline(always)]
    fn compare(a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Keys have no usable order; buckets stay chains however long they get.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unordered;

impl<K: ?Sized> KeyOrder<K> for Unordered {
    const TOTAL: bool = false;

    #[inline(always)]
    fn compare(_: &K, _: &K) -> Ordering {
        Ordering::Equal
    }
}
