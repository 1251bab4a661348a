//! Transactions.
//!
//! A transaction borrows the database under the readers-writer lock: many
//! concurrent read transactions, or one exclusive write transaction. Write
//! transactions journal every first mutation so rollback restores the exact
//! state observed at `begin`; commit serializes the accumulated changes to
//! the persistence log in one batch.
//!
//! The lock guard and the write context live behind a `RefCell`. Scans hold
//! a shared borrow for their whole walk, so a mutating call made from inside
//! an iteration callback fails the exclusive borrow and surfaces
//! `TxIterating` instead of corrupting the trees.

use crate::config::{IndexOptions, SetOptions, SyncPolicy};
use crate::db::{DbShared, DbState};
use crate::error::{AtollError, Result};
use crate::index::{Index, RectFn};
use crate::item::Item;
use crate::ordered::{Comparator, LessFn, OrderedSet};
use crate::pattern;
use bytes::Bytes;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::FxHashMap;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

enum Guard<'db> {
    Read(RwLockReadGuard<'db, DbState>),
    Write(RwLockWriteGuard<'db, DbState>),
}

pub(crate) struct TxInner<'db> {
    guard: Guard<'db>,
    wc: Option<WriteContext>,
}

impl TxInner<'_> {
    fn state(&self) -> &DbState {
        match &self.guard {
            Guard::Read(guard) => guard,
            Guard::Write(guard) => guard,
        }
    }

    fn write_parts(&mut self) -> (&mut DbState, &mut WriteContext) {
        let state = match &mut self.guard {
            Guard::Write(guard) => &mut **guard,
            Guard::Read(_) => unreachable!("write context always rides a write guard"),
        };
        match self.wc.as_mut() {
            Some(wc) => (state, wc),
            None => unreachable!("write context always rides a write guard"),
        }
    }
}

/// Journal of a write transaction.
#[derive(Default)]
pub(crate) struct WriteContext {
    /// Key to its pre-transaction item; `None` marks a key that was absent.
    rollback_items: FxHashMap<Bytes, Option<Arc<Item>>>,
    /// Key to its post-mutation item; `None` marks a deletion. This is what
    /// commit serializes.
    commit_items: FxHashMap<Bytes, Option<Arc<Item>>>,
    /// Index name to `None` for indexes created in this transaction (remove
    /// on rollback) or a cleared clone for dropped ones (reinstall and
    /// rebuild on rollback).
    rollback_indexes: FxHashMap<String, Option<Index>>,
    /// Entire prior trees, captured by `delete_all`. When set, per-item
    /// journaling is suppressed and rollback swaps the trees back wholesale.
    rbkeys: Option<OrderedSet>,
    rbexps: Option<OrderedSet>,
    rbidxs: Option<BTreeMap<String, Index>>,
}

/// A read or write transaction over the database.
pub struct Tx<'db> {
    writable: bool,
    done: Cell<bool>,
    pub(crate) inner: RefCell<TxInner<'db>>,
}

pub(crate) fn begin_tx(shared: &DbShared, writable: bool) -> Result<Tx<'_>> {
    let guard = if writable {
        Guard::Write(shared.state.write())
    } else {
        Guard::Read(shared.state.read())
    };
    if guard_state(&guard).closed {
        return Err(AtollError::DatabaseClosed);
    }
    Ok(Tx {
        writable,
        done: Cell::new(false),
        inner: RefCell::new(TxInner {
            guard,
            wc: writable.then(WriteContext::default),
        }),
    })
}

fn guard_state<'a>(guard: &'a Guard<'_>) -> &'a DbState {
    match guard {
        Guard::Read(g) => g,
        Guard::Write(g) => g,
    }
}

impl<'db> Tx<'db> {
    fn read_inner(&self) -> Result<Ref<'_, TxInner<'db>>> {
        if self.done.get() {
            return Err(AtollError::TxClosed);
        }
        Ok(self.inner.borrow())
    }

    fn write_inner(&self) -> Result<RefMut<'_, TxInner<'db>>> {
        if self.done.get() {
            return Err(AtollError::TxClosed);
        }
        if !self.writable {
            return Err(AtollError::TxNotWritable);
        }
        self.inner
            .try_borrow_mut()
            .map_err(|_| AtollError::TxIterating)
    }

    /// Whether this transaction can mutate the database.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Get the value for `key`. An item past its deadline reads as absent
    /// unless `ignore_expired` is set.
    pub fn get(&self, key: impl AsRef<[u8]>, ignore_expired: bool) -> Result<Bytes> {
        let inner = self.read_inner()?;
        let state = inner.state();
        let probe = state.keys.key_probe(key.as_ref());
        match state.keys.get(&probe) {
            Some(item) if ignore_expired || !item.is_expired_at(state.config.now()) => {
                Ok(item.value.clone())
            }
            _ => Err(AtollError::NotFound),
        }
    }

    /// Insert or replace `key`. Returns the previous value and whether a
    /// live item was replaced; a replaced-but-expired item reports
    /// `(None, false)`.
    pub fn set(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        opts: Option<SetOptions>,
    ) -> Result<(Option<Bytes>, bool)> {
        let mut inner = self.write_inner()?;
        let (state, wc) = inner.write_parts();
        let now = state.config.now();
        let key_bytes = Bytes::copy_from_slice(key.as_ref());
        let mut item = Item::new(key_bytes.clone(), Bytes::copy_from_slice(value.as_ref()));
        if let Some(opts) = &opts {
            item.deadline = opts.effective_deadline(now);
        }
        let item = Arc::new(item);
        let prev = state.insert_item(item.clone());

        let mut previous = None;
        let mut replaced = false;
        match &prev {
            Some(old) => {
                if wc.rbkeys.is_none() && !wc.rollback_items.contains_key(&key_bytes) {
                    wc.rollback_items
                        .insert(key_bytes.clone(), Some(old.clone()));
                }
                if !old.is_expired_at(now) {
                    previous = Some(old.value.clone());
                    replaced = true;
                }
            }
            None => {
                if wc.rbkeys.is_none() && !wc.rollback_items.contains_key(&key_bytes) {
                    wc.rollback_items.insert(key_bytes.clone(), None);
                }
            }
        }
        wc.commit_items.insert(key_bytes, Some(item));
        Ok((previous, replaced))
    }

    /// Remove `key`, returning its value. The removal is journaled even for
    /// an expired item, but an expired item reads back as `NotFound`.
    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<Bytes> {
        let mut inner = self.write_inner()?;
        let (state, wc) = inner.write_parts();
        let key_bytes = Bytes::copy_from_slice(key.as_ref());
        let Some(old) = state.remove_item_by_key(&key_bytes) else {
            return Err(AtollError::NotFound);
        };
        if wc.rbkeys.is_none() && !wc.rollback_items.contains_key(&key_bytes) {
            wc.rollback_items
                .insert(key_bytes.clone(), Some(old.clone()));
        }
        wc.commit_items.insert(key_bytes, None);
        if old.is_expired_at(state.config.now()) {
            return Err(AtollError::NotFound);
        }
        Ok(old.value.clone())
    }

    /// Remaining time to live for `key`: `None` when no deadline is set,
    /// `NotFound` when the key is absent or already expired.
    pub fn ttl(&self, key: impl AsRef<[u8]>) -> Result<Option<Duration>> {
        let inner = self.read_inner()?;
        let state = inner.state();
        let probe = state.keys.key_probe(key.as_ref());
        let Some(item) = state.keys.get(&probe) else {
            return Err(AtollError::NotFound);
        };
        if item.deadline.is_none() {
            return Ok(None);
        }
        let now = state.config.now();
        if item.is_expired_at(now) {
            return Err(AtollError::NotFound);
        }
        Ok(item.remaining_ttl_at(now))
    }

    /// Number of items in the primary tree, including not-yet-swept expired
    /// items.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read_inner()?.state().keys.len())
    }

    /// Remove everything: primary tree, expiration queue, and all index
    /// data. Indexes stay registered and are left empty.
    pub fn delete_all(&self) -> Result<()> {
        let mut inner = self.write_inner()?;
        let (state, wc) = inner.write_parts();

        let old_keys = std::mem::replace(&mut state.keys, OrderedSet::new(Comparator::Keys));
        let old_exps = std::mem::replace(&mut state.exps, OrderedSet::new(Comparator::Deadline));
        let old_idxs = std::mem::take(&mut state.idxs);
        for (name, idx) in &old_idxs {
            state.idxs.insert(name.clone(), idx.clear_copy());
        }

        if wc.rbkeys.is_none() {
            wc.rbkeys = Some(old_keys);
            wc.rbexps = Some(old_exps);
            wc.rbidxs = Some(old_idxs);
        }
        wc.commit_items.clear();
        Ok(())
    }

    /// Create a secondary index ordered by one or more less functions
    /// composed lexicographically.
    pub fn create_index(&self, name: &str, pattern: &str, lessers: Vec<LessFn>) -> Result<()> {
        self.create_index_inner(name, pattern, lessers, None, IndexOptions::default())
    }

    /// Like [`Tx::create_index`] with additional options.
    pub fn create_index_options(
        &self,
        name: &str,
        pattern: &str,
        opts: IndexOptions,
        lessers: Vec<LessFn>,
    ) -> Result<()> {
        self.create_index_inner(name, pattern, lessers, None, opts)
    }

    /// Create a spatial index organized by the rectangles `rect` extracts
    /// from item values.
    pub fn create_spatial_index(&self, name: &str, pattern: &str, rect: RectFn) -> Result<()> {
        self.create_index_inner(name, pattern, Vec::new(), Some(rect), IndexOptions::default())
    }

    /// Like [`Tx::create_spatial_index`] with additional options.
    pub fn create_spatial_index_options(
        &self,
        name: &str,
        pattern: &str,
        opts: IndexOptions,
        rect: RectFn,
    ) -> Result<()> {
        self.create_index_inner(name, pattern, Vec::new(), Some(rect), opts)
    }

    fn create_index_inner(
        &self,
        name: &str,
        pattern: &str,
        lessers: Vec<LessFn>,
        rect: Option<RectFn>,
        opts: IndexOptions,
    ) -> Result<()> {
        let mut inner = self.write_inner()?;
        let (state, wc) = inner.write_parts();
        if name.is_empty() {
            // the empty name designates the primary keys tree
            return Err(AtollError::IndexExists);
        }
        if state.idxs.contains_key(name) {
            return Err(AtollError::IndexExists);
        }
        let pattern = if opts.case_insensitive_key_matching {
            pattern.to_ascii_lowercase()
        } else {
            pattern.to_string()
        };
        let mut idx = Index::new(name, pattern, lessers, rect, opts);
        idx.rebuild(&state.keys);
        state.idxs.insert(name.to_string(), idx);
        if wc.rbkeys.is_none() && !wc.rollback_indexes.contains_key(name) {
            wc.rollback_indexes.insert(name.to_string(), None);
        }
        Ok(())
    }

    /// Remove an index. The empty name is the primary tree and cannot be
    /// dropped.
    pub fn drop_index(&self, name: &str) -> Result<()> {
        let mut inner = self.write_inner()?;
        let (state, wc) = inner.write_parts();
        if name.is_empty() {
            return Err(AtollError::InvalidOperation);
        }
        let Some(idx) = state.idxs.remove(name) else {
            return Err(AtollError::NotFound);
        };
        if wc.rbkeys.is_none() && !wc.rollback_indexes.contains_key(name) {
            wc.rollback_indexes
                .insert(name.to_string(), Some(idx.clear_copy()));
        }
        Ok(())
    }

    /// Registered index names, lexicographically sorted.
    pub fn indexes(&self) -> Result<Vec<String>> {
        Ok(self.read_inner()?.state().idxs.keys().cloned().collect())
    }

    /// The less function of a named index, if it has one.
    pub fn get_less(&self, index: &str) -> Result<Option<LessFn>> {
        let inner = self.read_inner()?;
        let idx = inner.state().idxs.get(index).ok_or(AtollError::NotFound)?;
        Ok(idx.less.clone())
    }

    /// The rectangle function of a named index, if it has one.
    pub fn get_rect(&self, index: &str) -> Result<Option<RectFn>> {
        let inner = self.read_inner()?;
        let idx = inner.state().idxs.get(index).ok_or(AtollError::NotFound)?;
        Ok(idx.rect.clone())
    }

    /// Unified scan driver. `gt`/`lt` say which pivots are present; pivots
    /// are inclusive on the greater-or-equal side and exclusive on the
    /// less-than side, mirrored when descending.
    pub(crate) fn scan(
        &self,
        desc: bool,
        gt: bool,
        lt: bool,
        index: &str,
        pivot1: Option<&[u8]>,
        pivot2: Option<&[u8]>,
        f: &mut dyn FnMut(&Arc<Item>) -> bool,
    ) -> Result<()> {
        let inner = self.read_inner()?;
        let state = inner.state();
        let tree = if index.is_empty() {
            &state.keys
        } else {
            let idx = state.idxs.get(index).ok_or(AtollError::NotFound)?;
            match &idx.btr {
                Some(btr) => btr,
                // spatial indexes carry no ordered items
                None => return Ok(()),
            }
        };

        let probe = |pivot: &[u8]| {
            if index.is_empty() {
                tree.key_probe(pivot)
            } else {
                tree.probe(
                    Arc::new(Item::new(Bytes::new(), Bytes::copy_from_slice(pivot))),
                    desc,
                )
            }
        };
        let a = pivot1.map(|p| probe(p));
        let b = pivot2.map(|p| probe(p));

        match (desc, gt, lt, &a, &b) {
            (false, false, false, ..) => tree.ascend(None, |it| f(it)),
            (false, true, false, Some(a), _) => tree.ascend(Some(a), |it| f(it)),
            (false, false, true, Some(a), _) => tree.ascend(None, |it| {
                tree.cmp_item(it, a) == Ordering::Less && f(it)
            }),
            (false, true, true, Some(a), Some(b)) => tree.ascend(Some(a), |it| {
                tree.cmp_item(it, b) == Ordering::Less && f(it)
            }),
            (true, false, false, ..) => tree.descend(None, |it| f(it)),
            (true, false, true, Some(a), _) => tree.descend(Some(a), |it| f(it)),
            (true, true, false, Some(a), _) => tree.descend(None, |it| {
                tree.cmp_item(it, a) == Ordering::Greater && f(it)
            }),
            (true, true, true, Some(a), Some(b)) => tree.descend(Some(a), |it| {
                tree.cmp_item(it, b) == Ordering::Greater && f(it)
            }),
            _ => return Err(AtollError::InvalidOperation),
        }
        Ok(())
    }

    /// Iterate every item ascending. With an index the order is the index
    /// comparator's; without one it is key order.
    pub fn ascend(&self, index: &str, mut f: impl FnMut(&[u8], &[u8]) -> bool) -> Result<()> {
        self.scan(false, false, false, index, None, None, &mut |it| {
            f(&it.key, &it.value)
        })
    }

    /// Iterate items `>= pivot` ascending.
    pub fn ascend_greater_or_equal(
        &self,
        index: &str,
        pivot: impl AsRef<[u8]>,
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        self.scan(
            false,
            true,
            false,
            index,
            Some(pivot.as_ref()),
            None,
            &mut |it| f(&it.key, &it.value),
        )
    }

    /// Iterate items `< pivot` ascending.
    pub fn ascend_less_than(
        &self,
        index: &str,
        pivot: impl AsRef<[u8]>,
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        self.scan(
            false,
            false,
            true,
            index,
            Some(pivot.as_ref()),
            None,
            &mut |it| f(&it.key, &it.value),
        )
    }

    /// Iterate items in `[greater_or_equal, less_than)` ascending.
    pub fn ascend_range(
        &self,
        index: &str,
        greater_or_equal: impl AsRef<[u8]>,
        less_than: impl AsRef<[u8]>,
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        self.scan(
            false,
            true,
            true,
            index,
            Some(greater_or_equal.as_ref()),
            Some(less_than.as_ref()),
            &mut |it| f(&it.key, &it.value),
        )
    }

    /// Iterate every item descending.
    pub fn descend(&self, index: &str, mut f: impl FnMut(&[u8], &[u8]) -> bool) -> Result<()> {
        self.scan(true, false, false, index, None, None, &mut |it| {
            f(&it.key, &it.value)
        })
    }

    /// Iterate items `> pivot` descending.
    pub fn descend_greater_than(
        &self,
        index: &str,
        pivot: impl AsRef<[u8]>,
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        self.scan(
            true,
            true,
            false,
            index,
            Some(pivot.as_ref()),
            None,
            &mut |it| f(&it.key, &it.value),
        )
    }

    /// Iterate items `<= pivot` descending, starting at the pivot.
    pub fn descend_less_or_equal(
        &self,
        index: &str,
        pivot: impl AsRef<[u8]>,
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        self.scan(
            true,
            false,
            true,
            index,
            Some(pivot.as_ref()),
            None,
            &mut |it| f(&it.key, &it.value),
        )
    }

    /// Iterate items in `[less_or_equal, greater_than)` descending.
    pub fn descend_range(
        &self,
        index: &str,
        less_or_equal: impl AsRef<[u8]>,
        greater_than: impl AsRef<[u8]>,
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        self.scan(
            true,
            true,
            true,
            index,
            Some(less_or_equal.as_ref()),
            Some(greater_than.as_ref()),
            &mut |it| f(&it.key, &it.value),
        )
    }

    /// Iterate items comparing equal to `pivot` ascending: equal under the
    /// index comparator, or exact key equality without an index.
    pub fn ascend_equal(
        &self,
        index: &str,
        pivot: impl AsRef<[u8]>,
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let less = if index.is_empty() {
            None
        } else {
            self.get_less(index)?
        };
        let pivot = pivot.as_ref();
        self.ascend_greater_or_equal(index, pivot, |key, value| {
            match &less {
                Some(less) => {
                    if less(pivot, value) {
                        return false;
                    }
                }
                None => {
                    if key != pivot {
                        return false;
                    }
                }
            }
            f(key, value)
        })
    }

    /// Iterate items comparing equal to `pivot` descending.
    pub fn descend_equal(
        &self,
        index: &str,
        pivot: impl AsRef<[u8]>,
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let less = if index.is_empty() {
            None
        } else {
            self.get_less(index)?
        };
        let pivot = pivot.as_ref();
        self.descend_less_or_equal(index, pivot, |key, value| {
            match &less {
                Some(less) => {
                    if less(value, pivot) {
                        return false;
                    }
                }
                None => {
                    if key != pivot {
                        return false;
                    }
                }
            }
            f(key, value)
        })
    }

    /// Iterate primary-tree items whose keys match `pattern`, ascending.
    /// An empty pattern is a no-op; a leading `*` falls back to a filtered
    /// full scan, anything else is bounded to the pattern's allowable range.
    pub fn ascend_keys(
        &self,
        pattern: impl AsRef<[u8]>,
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let pattern = pattern.as_ref();
        if pattern.is_empty() {
            return Ok(());
        }
        if pattern[0] == b'*' {
            if pattern == b"*" {
                return self.ascend("", f);
            }
            return self.ascend("", |key, value| {
                if pattern::matches(key, pattern) && !f(key, value) {
                    return false;
                }
                true
            });
        }
        let (min, max) = pattern::allowable(pattern);
        self.ascend_greater_or_equal("", &min, |key, value| {
            if let Some(max) = &max
                && key > &max[..]
            {
                return false;
            }
            if pattern::matches(key, pattern) && !f(key, value) {
                return false;
            }
            true
        })
    }

    /// Iterate primary-tree items whose keys match `pattern`, descending.
    pub fn descend_keys(
        &self,
        pattern: impl AsRef<[u8]>,
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let pattern = pattern.as_ref();
        if pattern.is_empty() {
            return Ok(());
        }
        if pattern[0] == b'*' {
            if pattern == b"*" {
                return self.descend("", f);
            }
            return self.descend("", |key, value| {
                if pattern::matches(key, pattern) && !f(key, value) {
                    return false;
                }
                true
            });
        }
        let (min, max) = pattern::allowable(pattern);
        let filter = |key: &[u8], value: &[u8], f: &mut dyn FnMut(&[u8], &[u8]) -> bool| {
            if key < &min[..] {
                return false;
            }
            if pattern::matches(key, pattern) && !f(key, value) {
                return false;
            }
            true
        };
        match &max {
            Some(max) => {
                self.descend_less_or_equal("", max, |key, value| filter(key, value, &mut f))
            }
            None => self.descend("", |key, value| filter(key, value, &mut f)),
        }
    }

    /// Enumerate spatial-index items whose rectangles intersect `bounds`
    /// (processed by the index's own rectangle function). The empty index
    /// name is a no-op; a non-spatial index yields nothing.
    pub fn intersects(
        &self,
        index: &str,
        bounds: impl AsRef<[u8]>,
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let inner = self.read_inner()?;
        let state = inner.state();
        if index.is_empty() {
            // the keys tree holds no rectangles
            return Ok(());
        }
        let idx = state.idxs.get(index).ok_or(AtollError::NotFound)?;
        let (Some(rtr), Some(rect_fn)) = (&idx.rtr, &idx.rect) else {
            return Ok(());
        };
        let Some(query) = rect_fn(bounds.as_ref()) else {
            return Ok(());
        };
        rtr.intersects(&query, |item| f(&item.key, &item.value));
        Ok(())
    }

    /// Enumerate spatial-index items from nearest to farthest from
    /// `bounds`, with the squared bounding-box distance.
    pub fn nearby(
        &self,
        index: &str,
        bounds: impl AsRef<[u8]>,
        mut f: impl FnMut(&[u8], &[u8], f64) -> bool,
    ) -> Result<()> {
        let inner = self.read_inner()?;
        let state = inner.state();
        if index.is_empty() {
            return Ok(());
        }
        let idx = state.idxs.get(index).ok_or(AtollError::NotFound)?;
        let (Some(rtr), Some(rect_fn)) = (&idx.rtr, &idx.rect) else {
            return Ok(());
        };
        let Some(query) = rect_fn(bounds.as_ref()) else {
            return Ok(());
        };
        rtr.nearby(&query, |item, dist| f(&item.key, &item.value, dist));
        Ok(())
    }

    /// Items whose deadlines have passed, in expiration order. Used by the
    /// background sweeper.
    pub(crate) fn expired_items(&self) -> Result<Vec<Arc<Item>>> {
        let inner = self.read_inner()?;
        let state = inner.state();
        let now = state.config.now();
        let mut expired = Vec::new();
        state.exps.ascend(None, |item| {
            if item.is_expired_at(now) {
                expired.push(item.clone());
                true
            } else {
                false
            }
        });
        Ok(expired)
    }

    /// Commit the transaction: serialize the change batch to the log, flush
    /// per the sync policy, and release the write lock. Any I/O failure
    /// rolls the in-memory state back and surfaces the error.
    pub fn commit(mut self) -> Result<()> {
        self.commit_inner()
    }

    fn commit_inner(&mut self) -> Result<()> {
        if self.done.get() {
            return Err(AtollError::TxClosed);
        }
        if !self.writable {
            return Err(AtollError::TxNotWritable);
        }

        let mut outcome = Ok(());
        {
            let mut inner = self.inner.borrow_mut();
            let (state, wc) = inner.write_parts();
            let policy = state.config.sync_policy;
            let mode = state.config.sync_mode;
            let has_changes = !wc.commit_items.is_empty() || wc.rbkeys.is_some();

            if has_changes && let Some(log) = state.log.as_mut() {
                if wc.rbkeys.is_some() {
                    log.push_flushdb();
                }
                for (key, item) in &wc.commit_items {
                    match item {
                        Some(item) => log.push_set(item),
                        None => log.push_del(key),
                    }
                }
                let sync = (policy == SyncPolicy::Always).then_some(mode);
                outcome = log.commit_batch(sync);
                if outcome.is_ok() {
                    state.flushes += 1;
                }
            }

            if outcome.is_err() {
                rollback_inner(state, wc);
            }
        }
        self.done.set(true);
        outcome
    }

    /// Roll the transaction back, restoring the state observed at `begin`,
    /// and release the lock. Rolling back a read transaction just releases
    /// it.
    pub fn rollback(mut self) -> Result<()> {
        if self.done.get() {
            return Err(AtollError::TxClosed);
        }
        self.rollback_and_close();
        Ok(())
    }

    fn rollback_and_close(&mut self) {
        if self.writable
            && let Ok(mut inner) = self.inner.try_borrow_mut()
        {
            let (state, wc) = inner.write_parts();
            rollback_inner(state, wc);
        }
        self.done.set(true);
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        // an abandoned write transaction rolls back
        if !self.done.get() {
            self.rollback_and_close();
        }
    }
}

/// Undo every journaled change. Wholesale tree restoration runs first so
/// per-item and per-index entries then reapply on the restored trees.
pub(crate) fn rollback_inner(state: &mut DbState, wc: &mut WriteContext) {
    if wc.rbkeys.is_some() {
        if let Some(keys) = wc.rbkeys.take() {
            state.keys = keys;
        }
        if let Some(exps) = wc.rbexps.take() {
            state.exps = exps;
        }
        if let Some(idxs) = wc.rbidxs.take() {
            state.idxs = idxs;
        }
    }
    for (key, old) in wc.rollback_items.drain() {
        state.remove_item_by_key(&key);
        if let Some(old) = old {
            state.insert_item(old);
        }
    }
    for (name, idx) in wc.rollback_indexes.drain() {
        state.idxs.remove(&name);
        if let Some(mut idx) = idx {
            idx.rebuild(&state.keys);
            state.idxs.insert(name, idx);
        }
    }
    wc.commit_items.clear();
}
