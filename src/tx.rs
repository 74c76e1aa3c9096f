//! Transactions. A read-only transaction wraps a shared lock over the
//! database core, a writable one wraps the exclusive lock, so one writer
//! excludes all readers and vice versa. Writable transactions carry a
//! rollback log (enough to undo every mutation in memory) and a commit log
//! (the frames to append on success); commit and rollback are driven by the
//! managed `view`/`update` entry points only.

use std::collections::HashMap;
use std::sync::{Arc, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::aof::format::Command;
use crate::db::Core;
use crate::error::{Error, Result};
use crate::item::{Item, SetOptions};
use crate::ordered::OrderedSet;
use crate::spatial::{index_rect, Rect};

enum Guard<'db> {
    Read(RwLockReadGuard<'db, Core>),
    Write(RwLockWriteGuard<'db, Core>),
}

/// A consistent view of the database, optionally writable.
pub struct Tx<'db> {
    guard: Guard<'db>,
    /// Prior item per first-touched key; `None` marks a fresh insert.
    /// Restoring these in any order rebuilds the pre-transaction state.
    rollbacks: HashMap<String, Option<Arc<Item>>>,
    /// Frames to append to the log on commit.
    commits: Vec<Command>,
    closed: bool,
}

impl<'db> Tx<'db> {
    pub(crate) fn read(guard: RwLockReadGuard<'db, Core>) -> Self {
        Self::new(Guard::Read(guard))
    }

    pub(crate) fn write(guard: RwLockWriteGuard<'db, Core>) -> Self {
        Self::new(Guard::Write(guard))
    }

    fn new(guard: Guard<'db>) -> Self {
        Self {
            guard,
            rollbacks: HashMap::new(),
            commits: Vec::new(),
            closed: false,
        }
    }

    fn core(&self) -> Result<&Core> {
        if self.closed {
            return Err(Error::TxClosed);
        }
        Ok(match &self.guard {
            Guard::Read(guard) => guard,
            Guard::Write(guard) => guard,
        })
    }

    /// Returns the value for `key`. Expired items are absent.
    pub fn get(&self, key: &str) -> Result<String> {
        let core = self.core()?;
        match core.get_item(key) {
            Some(item) if !item.expired(Instant::now()) => Ok(item.value.clone()),
            _ => Err(Error::NotFound),
        }
    }

    /// Inserts or replaces `key`, returning the previous live value and
    /// whether one was replaced. With `expires` set and a zero TTL the item
    /// is already expired: nothing is inserted and any prior item is
    /// deleted.
    pub fn set(
        &mut self,
        key: &str,
        value: &str,
        opts: Option<SetOptions>,
    ) -> Result<(Option<String>, bool)> {
        if self.closed {
            return Err(Error::TxClosed);
        }
        let Guard::Write(core) = &mut self.guard else {
            return Err(Error::TxNotWritable);
        };
        let now = Instant::now();

        if let Some(opts) = opts {
            if opts.expires && opts.ttl.is_zero() {
                let prior = core.delete_item(key);
                self.rollbacks
                    .entry(key.to_string())
                    .or_insert_with(|| prior.clone());
                return match prior {
                    Some(prior) => {
                        self.commits.push(Command::del(key));
                        Ok((Some(prior.value.clone()), true))
                    }
                    None => Ok((None, false)),
                };
            }
        }

        let expires_at = opts.filter(|o| o.expires).map(|o| now + o.ttl);
        let item = Arc::new(Item::new(key, value, expires_at));
        let prior = core.insert_item(item.clone());
        self.rollbacks
            .entry(key.to_string())
            .or_insert_with(|| prior.clone());
        self.commits.push(Command::from_item(&item, now));
        match prior {
            Some(prior) if !prior.expired(now) => Ok((Some(prior.value.clone()), true)),
            _ => Ok((None, false)),
        }
    }

    /// Removes `key`, returning its value. An item that only exists in
    /// expired form is physically removed (and the removal logged) but
    /// still reports `NotFound`.
    pub fn delete(&mut self, key: &str) -> Result<String> {
        if self.closed {
            return Err(Error::TxClosed);
        }
        let Guard::Write(core) = &mut self.guard else {
            return Err(Error::TxNotWritable);
        };
        let Some(item) = core.delete_item(key) else {
            return Err(Error::NotFound);
        };
        self.rollbacks
            .entry(key.to_string())
            .or_insert_with(|| Some(item.clone()));
        self.commits.push(Command::del(key));
        if item.expired(Instant::now()) {
            return Err(Error::NotFound);
        }
        Ok(item.value.clone())
    }

    /// Remaining time until `key` expires, or `None` for an item without
    /// an expiry. Missing and already-expired items are `NotFound`.
    pub fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let core = self.core()?;
        let now = Instant::now();
        let Some(item) = core.get_item(key) else {
            return Err(Error::NotFound);
        };
        match item.expires_at {
            None => Ok(None),
            Some(at) if at <= now => Err(Error::NotFound),
            Some(at) => Ok(Some(at - now)),
        }
    }

    /// The number of live (non-expired) items.
    pub fn len(&self) -> Result<usize> {
        Ok(self.core()?.live_len(Instant::now()))
    }

    /// Resolves the ordered container for `index`. `Ok(None)` means the
    /// index exists but holds nothing to scan (no comparator, or spatial).
    fn scan_set<'a>(core: &'a Core, index: &str) -> Result<Option<(&'a OrderedSet, bool)>> {
        if index.is_empty() {
            return Ok(Some((&core.keys, true)));
        }
        match core.idxs.get(index) {
            None => Err(Error::NotFound),
            Some(idx) => Ok(idx.set.as_ref().map(|set| (set, false))),
        }
    }

    /// Synthetic pivot item: primary scans pivot on keys, index scans on
    /// values.
    fn pivot_item(primary: bool, text: &str) -> Arc<Item> {
        if primary {
            Arc::new(Item::new(text, "", None))
        } else {
            Arc::new(Item::new("", text, None))
        }
    }

    /// Visits every item in `index` ascending.
    pub fn ascend(&self, index: &str, mut f: impl FnMut(&str, &str) -> bool) -> Result<()> {
        let core = self.core()?;
        let Some((set, _)) = Self::scan_set(core, index)? else {
            return Ok(());
        };
        let now = Instant::now();
        set.ascend(&mut |item| item.expired(now) || f(&item.key, &item.value));
        Ok(())
    }

    /// Visits items >= `pivot` ascending.
    pub fn ascend_greater_or_equal(
        &self,
        index: &str,
        pivot: &str,
        mut f: impl FnMut(&str, &str) -> bool,
    ) -> Result<()> {
        let core = self.core()?;
        let Some((set, primary)) = Self::scan_set(core, index)? else {
            return Ok(());
        };
        let pivot = set.pivot(Self::pivot_item(primary, pivot), false);
        let now = Instant::now();
        set.ascend_ge(&pivot, &mut |item| item.expired(now) || f(&item.key, &item.value));
        Ok(())
    }

    /// Visits items < `pivot` ascending.
    pub fn ascend_less_than(
        &self,
        index: &str,
        pivot: &str,
        mut f: impl FnMut(&str, &str) -> bool,
    ) -> Result<()> {
        let core = self.core()?;
        let Some((set, primary)) = Self::scan_set(core, index)? else {
            return Ok(());
        };
        let pivot = set.pivot(Self::pivot_item(primary, pivot), false);
        let now = Instant::now();
        set.ascend_lt(&pivot, &mut |item| item.expired(now) || f(&item.key, &item.value));
        Ok(())
    }

    /// Visits items in `[lo, hi)` ascending.
    pub fn ascend_range(
        &self,
        index: &str,
        lo: &str,
        hi: &str,
        mut f: impl FnMut(&str, &str) -> bool,
    ) -> Result<()> {
        let core = self.core()?;
        let Some((set, primary)) = Self::scan_set(core, index)? else {
            return Ok(());
        };
        let lo = set.pivot(Self::pivot_item(primary, lo), false);
        let hi = set.pivot(Self::pivot_item(primary, hi), false);
        let now = Instant::now();
        set.ascend_range(&lo, &hi, &mut |item| {
            item.expired(now) || f(&item.key, &item.value)
        });
        Ok(())
    }

    /// Visits every item in `index` descending.
    pub fn descend(&self, index: &str, mut f: impl FnMut(&str, &str) -> bool) -> Result<()> {
        let core = self.core()?;
        let Some((set, _)) = Self::scan_set(core, index)? else {
            return Ok(());
        };
        let now = Instant::now();
        set.descend(&mut |item| item.expired(now) || f(&item.key, &item.value));
        Ok(())
    }

    /// Visits items <= `pivot` descending. On value indexes the bound is
    /// inclusive of every item comparing equal to the pivot.
    pub fn descend_less_or_equal(
        &self,
        index: &str,
        pivot: &str,
        mut f: impl FnMut(&str, &str) -> bool,
    ) -> Result<()> {
        let core = self.core()?;
        let Some((set, primary)) = Self::scan_set(core, index)? else {
            return Ok(());
        };
        let pivot = set.pivot(Self::pivot_item(primary, pivot), !primary);
        let now = Instant::now();
        set.descend_le(&pivot, &mut |item| item.expired(now) || f(&item.key, &item.value));
        Ok(())
    }

    /// Visits items > `pivot` descending.
    pub fn descend_greater_than(
        &self,
        index: &str,
        pivot: &str,
        mut f: impl FnMut(&str, &str) -> bool,
    ) -> Result<()> {
        let core = self.core()?;
        let Some((set, primary)) = Self::scan_set(core, index)? else {
            return Ok(());
        };
        let pivot = set.pivot(Self::pivot_item(primary, pivot), !primary);
        let now = Instant::now();
        set.descend_gt(&pivot, &mut |item| item.expired(now) || f(&item.key, &item.value));
        Ok(())
    }

    /// Visits items in `(lo, hi]` from `hi` downward.
    pub fn descend_range(
        &self,
        index: &str,
        hi: &str,
        lo: &str,
        mut f: impl FnMut(&str, &str) -> bool,
    ) -> Result<()> {
        let core = self.core()?;
        let Some((set, primary)) = Self::scan_set(core, index)? else {
            return Ok(());
        };
        let hi = set.pivot(Self::pivot_item(primary, hi), !primary);
        let lo = set.pivot(Self::pivot_item(primary, lo), !primary);
        let now = Instant::now();
        set.descend_range(&hi, &lo, &mut |item| {
            item.expired(now) || f(&item.key, &item.value)
        });
        Ok(())
    }

    /// Visits items in a spatial `index` whose rectangle intersects
    /// `bounds` (inclusive on every axis). Empty bounds match everything.
    pub fn intersects(
        &self,
        index: &str,
        bounds: &str,
        mut f: impl FnMut(&str, &str) -> bool,
    ) -> Result<()> {
        let core = self.core()?;
        if index.is_empty() {
            // The primary index has no spatial container.
            return Ok(());
        }
        let Some(idx) = core.idxs.get(index) else {
            return Err(Error::NotFound);
        };
        let Some(tree) = &idx.tree else {
            return Ok(());
        };
        let (min, max) = index_rect(bounds);
        let min = min.unwrap_or_default();
        let max = max.unwrap_or_else(|| min.clone());
        let query = Rect::new(min, max);
        let now = Instant::now();
        tree.search(&query, &mut |item| {
            item.expired(now) || f(&item.key, &item.value)
        });
        Ok(())
    }

    /// Flushes the commit log to the persistence engine. A failed write
    /// reverts the in-memory state so user-visible state matches durable
    /// state, then surfaces the error.
    pub(crate) fn commit(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::TxClosed);
        }
        let Guard::Write(core) = &mut self.guard else {
            return Err(Error::TxNotWritable);
        };
        let result = if self.commits.is_empty() {
            Ok(())
        } else {
            core.write_commands(&self.commits)
        };
        if result.is_err() {
            Self::undo(core, &mut self.rollbacks);
        }
        self.rollbacks.clear();
        self.commits.clear();
        self.closed = true;
        result
    }

    /// Reverts every mutation in memory without touching the log.
    pub(crate) fn rollback(&mut self) {
        if let Guard::Write(core) = &mut self.guard {
            Self::undo(core, &mut self.rollbacks);
        }
        self.commits.clear();
        self.closed = true;
    }

    fn undo(core: &mut Core, rollbacks: &mut HashMap<String, Option<Arc<Item>>>) {
        for (key, prior) in rollbacks.drain() {
            core.delete_item(&key);
            if let Some(prior) = prior {
                core.insert_item(prior);
            }
        }
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        // A panic inside a managed closure lands here with the transaction
        // still open; revert it before the lock is released.
        if !self.closed {
            self.rollback();
        }
    }
}
