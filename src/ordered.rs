//! The ordered container behind the primary key index, every non-spatial
//! secondary index, and the expiry tracker. A thin wrapper around a
//! `BTreeSet` whose entries carry their comparator, so one entry type can
//! serve key order, user value order, and expiry order.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::Arc;

use crate::index::LessFn;
use crate::item::Item;

/// How an `OrderedSet` orders its items.
#[derive(Clone, Copy)]
pub(crate) enum Comparator {
    /// Lexicographic byte order on keys. The primary index.
    Keys,
    /// A user comparator over values, with key order breaking ties.
    Values(LessFn),
    /// Expiry deadline order, with key order breaking ties so items with
    /// equal deadlines coexist.
    Expiry,
}

impl Comparator {
    fn compare(&self, a: &Entry, b: &Entry) -> Ordering {
        match self {
            Comparator::Keys => a.item.key.cmp(&b.item.key),
            Comparator::Values(less) => {
                if less(&a.item.value, &b.item.value) {
                    return Ordering::Less;
                }
                if less(&b.item.value, &a.item.value) {
                    return Ordering::Greater;
                }
                // Equal under the user comparator. A keyless pivot sorts
                // after every real entry with the same value, which gives
                // descending scans an inclusive upper bound.
                match (a.keyless, b.keyless) {
                    (true, false) => Ordering::Greater,
                    (false, true) => Ordering::Less,
                    _ => a.item.key.cmp(&b.item.key),
                }
            }
            Comparator::Expiry => a
                .item
                .expires_at
                .cmp(&b.item.expires_at)
                .then_with(|| a.item.key.cmp(&b.item.key)),
        }
    }
}

/// A set element: the shared item plus the comparator of the set holding it.
#[derive(Clone)]
pub(crate) struct Entry {
    item: Arc<Item>,
    comparator: Comparator,
    keyless: bool,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.comparator.compare(self, other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.comparator.compare(self, other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.comparator.compare(self, other)
    }
}

/// A visitor receives items in traversal order and returns whether to
/// continue.
pub(crate) type Visitor<'a> = &'a mut dyn FnMut(&Arc<Item>) -> bool;

/// A balanced ordered set of shared items with directional pivot
/// traversals. Point operations are O(log n), range scans O(log n + k).
pub(crate) struct OrderedSet {
    comparator: Comparator,
    entries: BTreeSet<Entry>,
}

impl OrderedSet {
    pub fn new(comparator: Comparator) -> Self {
        Self {
            comparator,
            entries: BTreeSet::new(),
        }
    }

    fn entry(&self, item: Arc<Item>) -> Entry {
        Entry {
            item,
            comparator: self.comparator,
            keyless: false,
        }
    }

    /// Builds a synthetic pivot entry for range traversals. A keyless pivot
    /// sorts after every real entry that compares equal to it.
    pub fn pivot(&self, item: Arc<Item>, keyless: bool) -> Entry {
        Entry {
            item,
            comparator: self.comparator,
            keyless,
        }
    }

    /// Inserts an item, replacing and returning any existing item that
    /// compares equal.
    pub fn insert(&mut self, item: Arc<Item>) -> Option<Arc<Item>> {
        self.entries.replace(self.entry(item)).map(|e| e.item)
    }

    /// Removes the item comparing equal to `item`, returning it.
    pub fn remove(&mut self, item: &Arc<Item>) -> Option<Arc<Item>> {
        self.entries.take(&self.entry(item.clone())).map(|e| e.item)
    }

    /// Returns the stored item comparing equal to `item`.
    pub fn get(&self, item: &Arc<Item>) -> Option<&Arc<Item>> {
        self.entries.get(&self.entry(item.clone())).map(|e| &e.item)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn visit<'a>(iter: impl Iterator<Item = &'a Entry>, f: Visitor) {
        for entry in iter {
            if !f(&entry.item) {
                break;
            }
        }
    }

    /// Visits every item in ascending order.
    pub fn ascend(&self, f: Visitor) {
        Self::visit(self.entries.iter(), f);
    }

    /// Visits items >= pivot in ascending order.
    pub fn ascend_ge(&self, pivot: &Entry, f: Visitor) {
        Self::visit(
            self.entries.range((Bound::Included(pivot), Bound::Unbounded)),
            f,
        );
    }

    /// Visits items < pivot in ascending order.
    pub fn ascend_lt(&self, pivot: &Entry, f: Visitor) {
        Self::visit(
            self.entries.range((Bound::Unbounded, Bound::Excluded(pivot))),
            f,
        );
    }

    /// Visits items in [lo, hi) in ascending order.
    pub fn ascend_range(&self, lo: &Entry, hi: &Entry, f: Visitor) {
        if lo > hi {
            return;
        }
        Self::visit(
            self.entries.range((Bound::Included(lo), Bound::Excluded(hi))),
            f,
        );
    }

    /// Visits every item in descending order.
    pub fn descend(&self, f: Visitor) {
        Self::visit(self.entries.iter().rev(), f);
    }

    /// Visits items <= pivot in descending order.
    pub fn descend_le(&self, pivot: &Entry, f: Visitor) {
        Self::visit(
            self.entries
                .range((Bound::Unbounded, Bound::Included(pivot)))
                .rev(),
            f,
        );
    }

    /// Visits items > pivot in descending order.
    pub fn descend_gt(&self, pivot: &Entry, f: Visitor) {
        Self::visit(
            self.entries
                .range((Bound::Excluded(pivot), Bound::Unbounded))
                .rev(),
            f,
        );
    }

    /// Visits items in (lo, hi] from hi downward.
    pub fn descend_range(&self, hi: &Entry, lo: &Entry, f: Visitor) {
        if lo > hi {
            return;
        }
        Self::visit(
            self.entries
                .range((Bound::Excluded(lo), Bound::Included(hi)))
                .rev(),
            f,
        );
    }

    /// Visits every item comparing equal to the pivot, in ascending order.
    /// The pivot doubles as a keyed lower bound and a keyless upper bound,
    /// so all keys sharing the pivot value are covered.
    pub fn equal_range(&self, pivot: Arc<Item>, f: Visitor) {
        let lo = self.pivot(pivot.clone(), false);
        let hi = self.pivot(pivot, true);
        if lo > hi {
            return;
        }
        Self::visit(
            self.entries.range((Bound::Included(&lo), Bound::Included(&hi))),
            f,
        );
    }
}
