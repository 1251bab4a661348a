//! Ordered item storage.
//!
//! One set type serves the primary key tree, every secondary index, and the
//! expiration queue; only the comparator differs. Ordering is always made
//! total by falling back to a key comparison, so iteration is deterministic
//! even when a user comparator reports ties.

use crate::item::Item;
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

/// User comparator over item values: `less(a, b)` returns true when `a`
/// sorts before `b`.
pub type LessFn = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

/// Ordering discipline for an [`OrderedSet`].
#[derive(Clone)]
pub(crate) enum Comparator {
    /// Byte-lexicographic by key (the primary tree).
    Keys,
    /// By `(deadline, key)` (the expiration queue).
    Deadline,
    /// By user less over values, key tiebreak (secondary indexes).
    Less(LessFn),
}

impl fmt::Debug for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparator::Keys => write!(f, "Comparator::Keys"),
            Comparator::Deadline => write!(f, "Comparator::Deadline"),
            Comparator::Less(_) => write!(f, "Comparator::Less(..)"),
        }
    }
}

impl Comparator {
    fn compare(&self, a: &Item, a_keyless: bool, b: &Item, b_keyless: bool) -> Ordering {
        match self {
            Comparator::Keys => a.key.cmp(&b.key),
            Comparator::Deadline => match a.deadline.cmp(&b.deadline) {
                Ordering::Equal => Self::tiebreak(a, a_keyless, b, b_keyless),
                ord => ord,
            },
            Comparator::Less(less) => {
                if less(&a.value, &b.value) {
                    Ordering::Less
                } else if less(&b.value, &a.value) {
                    Ordering::Greater
                } else {
                    Self::tiebreak(a, a_keyless, b, b_keyless)
                }
            }
        }
    }

    // A keyless probe sorts after every equal-valued keyed entry, which is
    // what descending pivots need; ascending pivots keep an empty key and
    // sort before them.
    fn tiebreak(a: &Item, a_keyless: bool, b: &Item, b_keyless: bool) -> Ordering {
        match (a_keyless, b_keyless) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => a.key.cmp(&b.key),
        }
    }
}

/// A stored element or a pivot probe.
#[derive(Debug)]
pub(crate) struct Entry {
    pub item: Arc<Item>,
    keyless: bool,
    cmp: Comparator,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp
            .compare(&self.item, self.keyless, &other.item, other.keyless)
    }
}

/// Sorted collection of shared items with pivot seeks and early-stop scans.
#[derive(Debug)]
pub(crate) struct OrderedSet {
    set: BTreeSet<Entry>,
    cmp: Comparator,
}

impl OrderedSet {
    pub fn new(cmp: Comparator) -> Self {
        Self {
            set: BTreeSet::new(),
            cmp,
        }
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn clear(&mut self) {
        self.set.clear();
    }

    /// Build a pivot probe for seeks and boundary checks.
    pub fn probe(&self, item: Arc<Item>, keyless: bool) -> Entry {
        Entry {
            item,
            keyless,
            cmp: self.cmp.clone(),
        }
    }

    /// Build a key-only probe (primary tree and expiration removals ignore
    /// the value).
    pub fn key_probe(&self, key: &[u8]) -> Entry {
        self.probe(
            Arc::new(Item::new(Bytes::copy_from_slice(key), Bytes::new())),
            false,
        )
    }

    /// Compare a stored item against a probe under this set's ordering.
    pub fn cmp_item(&self, item: &Item, probe: &Entry) -> Ordering {
        self.cmp.compare(item, false, &probe.item, probe.keyless)
    }

    /// Insert or replace, returning the prior equal element if any.
    pub fn insert(&mut self, item: Arc<Item>) -> Option<Arc<Item>> {
        let entry = Entry {
            item,
            keyless: false,
            cmp: self.cmp.clone(),
        };
        self.set.replace(entry).map(|e| e.item)
    }

    /// Remove the element equal to `item`, returning it.
    pub fn remove(&mut self, item: &Arc<Item>) -> Option<Arc<Item>> {
        let probe = self.probe(item.clone(), false);
        self.set.take(&probe).map(|e| e.item)
    }

    /// Point lookup by probe.
    pub fn get(&self, probe: &Entry) -> Option<&Arc<Item>> {
        self.set.get(probe).map(|e| &e.item)
    }

    /// Ascending scan, optionally seeked to the first element `>= from`
    /// (inclusive). The callback returns false to stop.
    pub fn ascend(&self, from: Option<&Entry>, mut f: impl FnMut(&Arc<Item>) -> bool) {
        match from {
            Some(pivot) => {
                for entry in self.set.range((Bound::Included(pivot), Bound::Unbounded)) {
                    if !f(&entry.item) {
                        return;
                    }
                }
            }
            None => {
                for entry in &self.set {
                    if !f(&entry.item) {
                        return;
                    }
                }
            }
        }
    }

    /// Descending scan, optionally seeked to the last element `<= from`
    /// (inclusive). The callback returns false to stop.
    pub fn descend(&self, from: Option<&Entry>, mut f: impl FnMut(&Arc<Item>) -> bool) {
        match from {
            Some(pivot) => {
                for entry in self
                    .set
                    .range((Bound::Unbounded, Bound::Included(pivot)))
                    .rev()
                {
                    if !f(&entry.item) {
                        return;
                    }
                }
            }
            None => {
                for entry in self.set.iter().rev() {
                    if !f(&entry.item) {
                        return;
                    }
                }
            }
        }
    }
}
