//! The database: the primary key index, the expiry tracker, the named
//! secondary indexes, and the optional append-only log, all guarded by one
//! reader-writer lock. `update` takes the exclusive lock, `view` the shared
//! lock; inside a transaction no further synchronization exists or is
//! needed.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::aof::format::Command;
use crate::aof::{self, Aof};
use crate::config::{Config, SyncPolicy};
use crate::errinvalid;
use crate::error::{Error, Result};
use crate::index::{Index, LessFn, RectFn};
use crate::item::Item;
use crate::ordered::{Comparator, OrderedSet};
use crate::scheduler::Scheduler;
use crate::tasks::{ShrinkTask, SweepTask, SyncTask};
use crate::tx::Tx;

/// Path sentinel for a database without persistence.
const MEMORY_PATH: &str = ":memory:";

/// Upper bound on items removed per sweep, so the sweeper never holds the
/// write lock long enough to starve user transactions.
const SWEEP_BATCH: usize = 512;

/// Everything behind the database lock.
pub(crate) struct Core {
    /// The always-present primary index, ordered by key.
    pub(crate) keys: OrderedSet,
    /// Items with an expiry, ordered by deadline.
    pub(crate) exps: OrderedSet,
    /// User indexes by name, ascending.
    pub(crate) idxs: BTreeMap<String, Index>,
    /// The append-only log; `None` for an in-memory database.
    pub(crate) persist: Option<Aof>,
    pub(crate) config: Config,
    pub(crate) closed: bool,
    /// Log size after the last shrink (or open), for the auto-shrink
    /// growth test.
    pub(crate) last_shrink_size: u64,
}

impl Core {
    fn new(config: Config) -> Self {
        Self {
            keys: OrderedSet::new(Comparator::Keys),
            exps: OrderedSet::new(Comparator::Expiry),
            idxs: BTreeMap::new(),
            persist: None,
            config,
            closed: false,
            last_shrink_size: 0,
        }
    }

    pub(crate) fn get_item(&self, key: &str) -> Option<&Arc<Item>> {
        self.keys.get(&Arc::new(Item::new(key, "", None)))
    }

    /// Inserts an item into the primary index and every other container it
    /// belongs to. A replaced item leaves all of its containers first.
    pub(crate) fn insert_item(&mut self, item: Arc<Item>) -> Option<Arc<Item>> {
        let prior = self.keys.insert(item.clone());
        if let Some(prior) = &prior {
            if prior.expires_at.is_some() {
                self.exps.remove(prior);
            }
            for idx in self.idxs.values_mut() {
                if idx.matches(&prior.key) {
                    idx.remove(prior);
                }
            }
        }
        if item.expires_at.is_some() {
            self.exps.insert(item.clone());
        }
        for idx in self.idxs.values_mut() {
            if idx.matches(&item.key) {
                idx.insert(&item);
            }
        }
        prior
    }

    /// Removes an item from the primary index and everywhere else.
    pub(crate) fn delete_item(&mut self, key: &str) -> Option<Arc<Item>> {
        let item = self.keys.remove(&Arc::new(Item::new(key, "", None)))?;
        if item.expires_at.is_some() {
            self.exps.remove(&item);
        }
        for idx in self.idxs.values_mut() {
            if idx.matches(&item.key) {
                idx.remove(&item);
            }
        }
        Some(item)
    }

    /// The number of live items: the primary count minus entries that have
    /// expired but not yet been swept.
    pub(crate) fn live_len(&self, now: Instant) -> usize {
        let mut expired = 0;
        self.exps.ascend(&mut |item| {
            if item.expired(now) {
                expired += 1;
                true
            } else {
                false
            }
        });
        self.keys.len() - expired
    }

    /// Appends and flushes frames per the sync policy. No-op without a log.
    pub(crate) fn write_commands(&mut self, commands: &[Command]) -> Result<()> {
        let sync_now = self.config.sync_policy == SyncPolicy::Always;
        let Some(aof) = &mut self.persist else {
            return Ok(());
        };
        aof.append(commands)?;
        aof.flush()?;
        if sync_now {
            aof.sync()?;
        }
        Ok(())
    }

    /// Applies one replayed frame without writing anything back.
    fn apply_replayed(&mut self, command: Command, now: Instant) {
        match command {
            Command::Set { key, value, ex: None } => {
                self.insert_item(Arc::new(Item::new(&key, &value, None)));
            }
            Command::Set { key, ex: Some(0), .. } => {
                // Already expired at write time; drop any earlier state.
                self.delete_item(&key);
            }
            Command::Set {
                key,
                value,
                ex: Some(seconds),
            } => {
                let expires_at = now + Duration::from_secs(seconds);
                self.insert_item(Arc::new(Item::new(&key, &value, Some(expires_at))));
            }
            Command::Del { key } => {
                self.delete_item(&key);
            }
        }
    }
}

/// An embedded key/value database. All methods are safe to call from any
/// thread; a handle is typically shared behind an `Arc`.
pub struct Database {
    core: Arc<RwLock<Core>>,
    /// Drives the background tasks; the public API stays synchronous.
    runtime: tokio::runtime::Runtime,
    scheduler: Mutex<Option<Scheduler>>,
}

impl Database {
    /// Opens or creates the database at `path`, replaying any existing log.
    /// The path `":memory:"` skips persistence entirely.
    pub fn open(path: &str) -> Result<Database> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens with explicit configuration.
    pub fn open_with_config(path: &str, config: Config) -> Result<Database> {
        let mut core = Core::new(config.clone());
        if path != MEMORY_PATH {
            let mut aof = Aof::open(Path::new(path))?;
            let now = Instant::now();
            let mut frames = 0usize;
            for command in aof.replay()? {
                core.apply_replayed(command?, now);
                frames += 1;
            }
            aof.seek_to_end()?;
            core.last_shrink_size = aof.disk_size();
            tracing::debug!(
                path = path,
                frames = frames,
                items = core.keys.len(),
                "replayed log"
            );
            core.persist = Some(aof);
        }

        let core = Arc::new(RwLock::new(core));
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("emberdb-background")
            .enable_all()
            .build()?;
        let mut scheduler = Scheduler::new();
        {
            let _guard = runtime.enter();
            scheduler.register(Arc::new(SweepTask::new(core.clone(), config.sweep_interval)));
            scheduler.register(Arc::new(SyncTask::new(core.clone(), config.sync_interval)));
            scheduler.register(Arc::new(ShrinkTask::new(core.clone(), config.shrink_interval)));
        }

        Ok(Database {
            core,
            runtime,
            scheduler: Mutex::new(Some(scheduler)),
        })
    }

    // A panicking transaction poisons the lock only after its rollback has
    // already run in the drop guard, so the inner state is consistent and
    // the poison can be taken over.
    fn read_core(&self) -> RwLockReadGuard<'_, Core> {
        self.core.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_core(&self) -> RwLockWriteGuard<'_, Core> {
        self.core.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs a read-only transaction under the shared lock. Write
    /// operations on the handle fail with `TxNotWritable`.
    pub fn view<T>(&self, f: impl FnOnce(&mut Tx) -> Result<T>) -> Result<T> {
        let guard = self.read_core();
        if guard.closed {
            return Err(Error::DatabaseClosed);
        }
        let mut tx = Tx::read(guard);
        f(&mut tx)
    }

    /// Runs a writable transaction under the exclusive lock. If `f`
    /// returns an error (or panics) every mutation is rolled back;
    /// otherwise the commit log is flushed to disk.
    pub fn update<T>(&self, f: impl FnOnce(&mut Tx) -> Result<T>) -> Result<T> {
        let guard = self.write_core();
        if guard.closed {
            return Err(Error::DatabaseClosed);
        }
        let mut tx = Tx::write(guard);
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }

    /// Creates a named ordered index over keys matching `pattern`, sorted
    /// by `less` over values. Existing matching items are indexed
    /// immediately. A `None` comparator registers an index that scans as
    /// empty.
    pub fn create_index(&self, name: &str, pattern: &str, less: Option<LessFn>) -> Result<()> {
        self.add_index(Index::ordered(name, pattern, less))
    }

    /// Creates a named spatial index over keys matching `pattern`, keyed by
    /// rectangles that `rect` extracts from values.
    pub fn create_spatial_index(
        &self,
        name: &str,
        pattern: &str,
        rect: Option<RectFn>,
    ) -> Result<()> {
        self.add_index(Index::spatial(name, pattern, rect))
    }

    fn add_index(&self, mut index: Index) -> Result<()> {
        let mut core = self.write_core();
        if core.closed {
            return Err(Error::DatabaseClosed);
        }
        if index.name.is_empty() {
            return errinvalid!("index name required");
        }
        if core.idxs.contains_key(&index.name) {
            return Err(Error::IndexExists);
        }
        // One pass over the primary index picks up existing members.
        let Core { keys, idxs, .. } = &mut *core;
        keys.ascend(&mut |item| {
            if index.matches(&item.key) {
                index.insert(item);
            }
            true
        });
        idxs.insert(index.name.clone(), index);
        Ok(())
    }

    /// Removes a named index. The indexed items are untouched.
    pub fn drop_index(&self, name: &str) -> Result<()> {
        let mut core = self.write_core();
        if core.closed {
            return Err(Error::DatabaseClosed);
        }
        if name.is_empty() {
            return errinvalid!("index name required");
        }
        core.idxs.remove(name).map(|_| ()).ok_or(Error::IndexNotFound)
    }

    /// The user index names in ascending order.
    pub fn indexes(&self) -> Result<Vec<String>> {
        let core = self.read_core();
        if core.closed {
            return Err(Error::DatabaseClosed);
        }
        Ok(core.idxs.keys().cloned().collect())
    }

    /// Replaces the configuration.
    pub fn set_config(&self, config: Config) -> Result<()> {
        let mut core = self.write_core();
        if core.closed {
            return Err(Error::DatabaseClosed);
        }
        core.config = config;
        Ok(())
    }

    /// A copy of the current configuration.
    pub fn read_config(&self) -> Result<Config> {
        let core = self.read_core();
        if core.closed {
            return Err(Error::DatabaseClosed);
        }
        Ok(core.config.clone())
    }

    /// Rewrites the log to the minimal sequence recreating current state.
    /// A no-op success on an in-memory database.
    pub fn shrink(&self) -> Result<()> {
        shrink_core(&self.core)
    }

    /// Flushes and fsyncs the log, stops every background task, and marks
    /// the database closed. Any later call returns `DatabaseClosed`.
    pub fn close(&self) -> Result<()> {
        {
            let mut core = self.write_core();
            if core.closed {
                return Err(Error::DatabaseClosed);
            }
            if let Some(aof) = &mut core.persist {
                aof.sync()?;
            }
            core.closed = true;
        }
        let scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(scheduler) = scheduler {
            self.runtime.block_on(scheduler.shutdown())?;
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// One bounded sweep pass: removes the earliest expired items and logs a
/// synthetic delete for each, so replay agrees with memory.
pub(crate) fn sweep_expired(core: &Arc<RwLock<Core>>) -> Result<usize> {
    let mut core = core.write().unwrap_or_else(|e| e.into_inner());
    if core.closed {
        return Ok(0);
    }
    let now = Instant::now();
    let mut expired = Vec::new();
    core.exps.ascend(&mut |item| {
        if !item.expired(now) {
            return false;
        }
        expired.push(item.clone());
        expired.len() < SWEEP_BATCH
    });
    if expired.is_empty() {
        return Ok(0);
    }
    let mut commands = Vec::with_capacity(expired.len());
    for item in &expired {
        core.delete_item(&item.key);
        commands.push(Command::del(&item.key));
    }
    core.write_commands(&commands)?;
    tracing::debug!(count = expired.len(), "swept expired items");
    Ok(expired.len())
}

/// Whether the log has outgrown the auto-shrink thresholds.
pub(crate) fn should_shrink(size: u64, last_shrink_size: u64, config: &Config) -> bool {
    size >= config.auto_shrink_min_size
        && size >= last_shrink_size + last_shrink_size * config.auto_shrink_percentage / 100
}

/// Shrinks the log: snapshot the live items under the write lock, write
/// them to a temp file without it, then reacquire the lock to carry over
/// any tail appended meanwhile and atomically swap the files. State is
/// unchanged if any step fails.
pub(crate) fn shrink_core(core: &Arc<RwLock<Core>>) -> Result<()> {
    let (path, offset, commands) = {
        let mut guard = core.write().unwrap_or_else(|e| e.into_inner());
        if guard.closed {
            return Err(Error::DatabaseClosed);
        }
        let Some(aof) = &mut guard.persist else {
            return Ok(());
        };
        let offset = aof.size()?;
        let path = aof.path().to_path_buf();
        let now = Instant::now();
        let mut commands = Vec::with_capacity(guard.keys.len());
        guard.keys.ascend(&mut |item| {
            commands.push(Command::from_item(item, now));
            true
        });
        (path, offset, commands)
    };

    let tmp_path = aof::snapshot_path(&path);
    aof::write_snapshot(&tmp_path, &commands)?;

    let result = (|| {
        let mut guard = core.write().unwrap_or_else(|e| e.into_inner());
        if guard.closed {
            return Err(Error::DatabaseClosed);
        }
        let Some(aof) = &mut guard.persist else {
            return Ok(());
        };
        aof.flush()?;
        let new_aof = aof::finish_rewrite(&path, &tmp_path, offset)?;
        guard.last_shrink_size = new_aof.disk_size();
        guard.persist = Some(new_aof);
        tracing::info!(
            path = %path.display(),
            size = guard.last_shrink_size,
            "log shrunk"
        );
        Ok(())
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::index_string;
    use crate::item::SetOptions;
    use crate::spatial::index_rect;
    use tempfile::TempDir;

    fn create_temp_dir() -> TempDir {
        TempDir::new().expect("Failed to create temporary directory")
    }

    fn db_path(temp_dir: &TempDir) -> String {
        temp_dir
            .path()
            .join("data.db")
            .to_str()
            .expect("path is utf-8")
            .to_string()
    }

    #[test]
    fn test_set_get_roundtrip() {
        let db = Database::open(":memory:").expect("Failed to open database");
        db.update(|tx| {
            let (prev, replaced) = tx.set("hello", "planet", None)?;
            assert_eq!(prev, None);
            assert!(!replaced);
            // Visible within the same transaction.
            assert_eq!(tx.get("hello")?, "planet");
            Ok(())
        })
        .expect("update failed");

        let value = db.view(|tx| tx.get("hello")).expect("view failed");
        assert_eq!(value, "planet");

        db.update(|tx| {
            let (prev, replaced) = tx.set("hello", "world", None)?;
            assert_eq!(prev.as_deref(), Some("planet"));
            assert!(replaced);
            Ok(())
        })
        .expect("update failed");
        assert_eq!(db.view(|tx| tx.get("hello")).expect("view"), "world");
        db.close().expect("close failed");
    }

    #[test]
    fn test_rollback_on_error() {
        let db = Database::open(":memory:").expect("open");
        db.update(|tx| {
            tx.set("hello", "planet", None)?;
            Ok(())
        })
        .expect("update");

        let broken = Error::Invalid("broken".to_string());
        let result: Result<()> = db.update(|tx| {
            tx.set("hello", "world", None)?;
            tx.set("fresh", "key", None)?;
            tx.delete("hello")?;
            Err(broken.clone())
        });
        assert_eq!(result, Err(broken));

        // The failed transaction left no trace.
        db.view(|tx| {
            assert_eq!(tx.get("hello")?, "planet");
            assert_eq!(tx.get("fresh"), Err(Error::NotFound));
            assert_eq!(tx.len()?, 1);
            Ok(())
        })
        .expect("view");
        db.close().expect("close");
    }

    #[test]
    fn test_commit_write_failure_rolls_back() {
        let temp_dir = create_temp_dir();
        let path = db_path(&temp_dir);
        let db = Database::open(&path).expect("open");
        db.update(|tx| {
            tx.set("hello", "planet", None)?;
            Ok(())
        })
        .expect("update");

        // Swap in a log handle whose descriptor cannot be written, so the
        // next commit fails when the frames are flushed.
        {
            let mut core = db.core.write().unwrap_or_else(|e| e.into_inner());
            core.persist = Some(Aof::open_read_only(Path::new(&path)).expect("read-only handle"));
        }
        let result = db.update(|tx| {
            tx.set("hello", "world", None)?;
            tx.set("fresh", "key", None)?;
            Ok(())
        });
        assert!(matches!(result, Err(Error::Io(_))));

        // The failed commit reverted memory, so visible state still
        // matches what the log holds.
        db.view(|tx| {
            assert_eq!(tx.get("hello")?, "planet");
            assert_eq!(tx.get("fresh"), Err(Error::NotFound));
            assert_eq!(tx.len()?, 1);
            Ok(())
        })
        .expect("view");

        // Restore a writable handle and confirm durable state agrees.
        {
            let mut core = db.core.write().unwrap_or_else(|e| e.into_inner());
            core.persist = Some(Aof::open_at_end(Path::new(&path)).expect("writable handle"));
        }
        db.close().expect("close");
        let db = Database::open(&path).expect("reopen");
        db.view(|tx| {
            assert_eq!(tx.get("hello")?, "planet");
            assert_eq!(tx.len()?, 1);
            Ok(())
        })
        .expect("view");
        db.close().expect("close");
    }

    #[test]
    fn test_tx_error_conditions() {
        let db = Database::open(":memory:").expect("open");
        db.update(|tx| {
            tx.set("hello", "planet", None)?;
            Ok(())
        })
        .expect("update");

        // Mutations on a read-only transaction.
        db.view(|tx| {
            assert_eq!(tx.set("hello", "world", None), Err(Error::TxNotWritable));
            assert_eq!(tx.delete("hello"), Err(Error::TxNotWritable));
            assert_eq!(tx.get("missing"), Err(Error::NotFound));
            assert_eq!(tx.get("hello")?, "planet");
            Ok(())
        })
        .expect("view");

        db.update(|tx| {
            assert_eq!(tx.get("something"), Err(Error::NotFound));
            assert_eq!(tx.delete("something"), Err(Error::NotFound));
            Ok(())
        })
        .expect("update");
        db.close().expect("close");
    }

    #[test]
    fn test_zero_ttl_behaves_as_delete() {
        let db = Database::open(":memory:").expect("open");
        db.update(|tx| {
            tx.set("x", "a", None)?;
            let (prev, replaced) =
                tx.set("x", "b", Some(SetOptions::expiring(Duration::ZERO)))?;
            assert_eq!(prev.as_deref(), Some("a"));
            assert!(replaced);
            Ok(())
        })
        .expect("update");

        db.update(|tx| {
            assert_eq!(tx.get("x"), Err(Error::NotFound));
            assert_eq!(tx.delete("x"), Err(Error::NotFound));
            assert_eq!(tx.len()?, 0);
            Ok(())
        })
        .expect("update");

        // Zero TTL on a missing key inserts nothing.
        db.update(|tx| {
            let (prev, replaced) =
                tx.set("y", "z", Some(SetOptions::expiring(Duration::ZERO)))?;
            assert_eq!(prev, None);
            assert!(!replaced);
            assert_eq!(tx.len()?, 0);
            Ok(())
        })
        .expect("update");
        db.close().expect("close");
    }

    #[test]
    fn test_ttl_expiry_and_reopen() {
        let temp_dir = create_temp_dir();
        let path = db_path(&temp_dir);
        let db = Database::open(&path).expect("open");
        db.update(|tx| {
            tx.set("k1", "v1", Some(SetOptions::expiring(Duration::from_millis(500))))?;
            tx.set("k2", "v2", None)?;
            Ok(())
        })
        .expect("update");
        assert_eq!(db.view(|tx| tx.len()).expect("len"), 2);

        std::thread::sleep(Duration::from_millis(1500));

        db.view(|tx| {
            assert_eq!(tx.len()?, 1);
            assert_eq!(tx.get("k1"), Err(Error::NotFound));
            assert_eq!(tx.get("k2")?, "v2");
            Ok(())
        })
        .expect("view");
        db.close().expect("close");

        // The sweeper logged the expiry, so a reopen agrees.
        let db = Database::open(&path).expect("reopen");
        db.view(|tx| {
            assert_eq!(tx.len()?, 1);
            assert_eq!(tx.get("k1"), Err(Error::NotFound));
            assert_eq!(tx.get("k2")?, "v2");
            Ok(())
        })
        .expect("view");
        db.close().expect("close");
    }

    #[test]
    fn test_ttl_query() {
        let db = Database::open(":memory:").expect("open");
        db.update(|tx| {
            tx.set("key1", "val1", Some(SetOptions::expiring(Duration::from_secs(1))))?;
            tx.set("key2", "val2", None)?;
            Ok(())
        })
        .expect("update");

        db.view(|tx| {
            let remaining = tx.ttl("key1")?.expect("key1 should carry a ttl");
            assert!(remaining <= Duration::from_secs(1));
            assert!(remaining > Duration::ZERO);
            assert_eq!(tx.ttl("key2")?, None);
            assert_eq!(tx.ttl("missing"), Err(Error::NotFound));
            Ok(())
        })
        .expect("view");
        db.close().expect("close");
    }

    #[test]
    fn test_primary_scans() {
        let db = Database::open(":memory:").expect("open");
        db.update(|tx| {
            tx.set("hello", "planet", None)?;
            tx.set("nothing", "here", None)?;
            Ok(())
        })
        .expect("update");

        db.view(|tx| {
            let mut s = String::new();
            tx.ascend("", |key, val| {
                s += &format!("{key}:{val}\n");
                true
            })?;
            assert_eq!(s, "hello:planet\nnothing:here\n");

            let mut s = String::new();
            tx.ascend_less_than("", "liger", |key, val| {
                s += &format!("{key}:{val}\n");
                true
            })?;
            assert_eq!(s, "hello:planet\n");

            let mut s = String::new();
            tx.descend("", |key, val| {
                s += &format!("{key}:{val}\n");
                true
            })?;
            assert_eq!(s, "nothing:here\nhello:planet\n");

            let mut s = String::new();
            tx.descend_less_or_equal("", "liger", |key, val| {
                s += &format!("{key}:{val}\n");
                true
            })?;
            assert_eq!(s, "hello:planet\n");

            let mut s = String::new();
            tx.descend_greater_than("", "liger", |key, val| {
                s += &format!("{key}:{val}\n");
                true
            })?;
            assert_eq!(s, "nothing:here\n");

            let mut s = String::new();
            tx.descend_range("", "liger", "apple", |key, val| {
                s += &format!("{key}:{val}\n");
                true
            })?;
            assert_eq!(s, "hello:planet\n");

            let mut s = String::new();
            tx.ascend_range("", "hello", "nothing", |key, _| {
                s += key;
                true
            })?;
            assert_eq!(s, "hello");
            Ok(())
        })
        .expect("view");
        db.close().expect("close");
    }

    #[test]
    fn test_scan_index_errors() {
        let db = Database::open(":memory:").expect("open");
        db.create_index("blank", "*", None).expect("create index");
        db.update(|tx| {
            tx.set("a", "1", None)?;
            Ok(())
        })
        .expect("update");

        db.view(|tx| {
            assert_eq!(tx.ascend("na", |_, _| true), Err(Error::NotFound));
            // A null-comparator index scans as empty, without error.
            let mut visited = 0;
            tx.ascend("blank", |_, _| {
                visited += 1;
                true
            })?;
            assert_eq!(visited, 0);
            Ok(())
        })
        .expect("view");
        db.close().expect("close");
    }

    #[test]
    fn test_index_ordering() {
        let db = Database::open(":memory:").expect("open");
        db.create_index("users", "fun:user:*", Some(index_string))
            .expect("create index");
        db.update(|tx| {
            for (key, name) in [
                ("fun:user:0", "tom"),
                ("fun:user:1", "Randi"),
                ("fun:user:2", "jane"),
                ("fun:user:4", "Janet"),
                ("fun:user:5", "Paula"),
                ("fun:user:6", "peter"),
                ("fun:user:7", "Terri"),
            ] {
                tx.set(key, name, None)?;
            }
            tx.set("misc", "ignored", None)?;
            Ok(())
        })
        .expect("update");

        let mut listing = String::new();
        db.view(|tx| {
            tx.ascend("users", |key, val| {
                listing += &format!("{key} {val}\n");
                true
            })
        })
        .expect("view");
        assert_eq!(
            listing,
            "fun:user:2 jane\nfun:user:4 Janet\nfun:user:5 Paula\nfun:user:6 peter\n\
             fun:user:1 Randi\nfun:user:7 Terri\nfun:user:0 tom\n"
        );
        db.close().expect("close");
    }

    #[test]
    fn test_spatial_index() {
        let db = Database::open(":memory:").expect("open");
        db.create_spatial_index("spat", "rect:*", Some(index_rect))
            .expect("create spatial index");
        db.create_spatial_index("junk", "rect:*", None)
            .expect("create null spatial index");
        db.update(|tx| {
            tx.set("rect:1", "[10 10],[20 20]", None)?;
            tx.set("rect:2", "[15 15],[25 25]", None)?;
            tx.set("shape:1", "[12 12],[25 25]", None)?;
            Ok(())
        })
        .expect("update");

        db.view(|tx| {
            let mut s = String::new();
            tx.intersects("spat", "[5 5],[13 13]", |key, val| {
                s += &format!("{key}:{val}\n");
                true
            })?;
            assert_eq!(s, "rect:1:[10 10],[20 20]\n");

            // The primary index has no spatial container.
            let mut visited = 0;
            tx.intersects("", "[5 5],[13 13]", |_, _| {
                visited += 1;
                true
            })?;
            assert_eq!(visited, 0);

            assert_eq!(
                tx.intersects("na", "[5 5],[13 13]", |_, _| true),
                Err(Error::NotFound)
            );

            // Null extractor: no items, no error.
            let mut visited = 0;
            tx.intersects("junk", "[5 5],[13 13]", |_, _| {
                visited += 1;
                true
            })?;
            assert_eq!(visited, 0);

            assert_eq!(tx.len()?, 3);
            Ok(())
        })
        .expect("view");
        db.close().expect("close");
    }

    #[test]
    fn test_spatial_membership_follows_writes() {
        let db = Database::open(":memory:").expect("open");
        db.create_spatial_index("rects", "rect:*", Some(index_rect))
            .expect("create");
        db.update(|tx| {
            tx.set("rect:1", "[1 1]", None)?;
            tx.set("rect:2", "[10 10]", None)?;
            Ok(())
        })
        .expect("update");

        // Replacing moves the item; deleting removes it.
        db.update(|tx| {
            tx.set("rect:1", "[50 50]", None)?;
            tx.delete("rect:2")?;
            Ok(())
        })
        .expect("update");

        db.view(|tx| {
            let mut keys = Vec::new();
            tx.intersects("rects", "[0 0],[100 100]", |key, _| {
                keys.push(key.to_string());
                true
            })?;
            assert_eq!(keys, ["rect:1"]);

            let mut count = 0;
            tx.intersects("rects", "[0 0],[5 5]", |_, _| {
                count += 1;
                true
            })?;
            assert_eq!(count, 0);
            Ok(())
        })
        .expect("view");
        db.close().expect("close");
    }

    #[test]
    fn test_index_lifecycle() {
        let temp_dir = create_temp_dir();
        let db = Database::open(&db_path(&temp_dir)).expect("open");

        assert!(db.create_index("", "", Some(index_string)).is_err());
        db.create_index("hello", "", None).expect("create");
        assert_eq!(
            db.create_index("hello", "", None),
            Err(Error::IndexExists)
        );

        db.update(|tx| {
            tx.set("user:1", "tom", None)?;
            tx.set("user:2", "janet", None)?;
            tx.set("alt:1", "from", None)?;
            tx.set("alt:2", "there", None)?;
            tx.set("rect:1", "[1 2],[3 4]", None)?;
            tx.set("rect:2", "[5 6],[7 8]", None)?;
            Ok(())
        })
        .expect("update");

        // Indexes created after the fact pick up matching items only.
        db.create_index("string", "user:*", Some(index_string))
            .expect("create after items");
        db.create_spatial_index("rect", "rect:*", Some(index_rect))
            .expect("create spatial after items");

        db.view(|tx| {
            let mut keys = Vec::new();
            tx.ascend("string", |key, _| {
                keys.push(key.to_string());
                true
            })?;
            assert_eq!(keys, ["user:2", "user:1"]); // janet before tom
            let mut count = 0;
            tx.intersects("rect", "[0 0],[100 100]", |_, _| {
                count += 1;
                true
            })?;
            assert_eq!(count, 2);
            Ok(())
        })
        .expect("view");

        db.drop_index("hello").expect("drop");
        assert!(db.drop_index("").is_err());
        assert_eq!(db.drop_index("na"), Err(Error::IndexNotFound));
        assert_eq!(db.indexes().expect("indexes"), ["rect", "string"]);

        db.close().expect("close");
        assert_eq!(
            db.create_index("new-index", "", None),
            Err(Error::DatabaseClosed)
        );
        assert_eq!(db.indexes(), Err(Error::DatabaseClosed));
        assert_eq!(db.drop_index("rect"), Err(Error::DatabaseClosed));
    }

    #[test]
    fn test_persistence_roundtrip() {
        let temp_dir = create_temp_dir();
        let path = db_path(&temp_dir);
        {
            let db = Database::open(&path).expect("open");
            db.update(|tx| {
                tx.set("a", "1", None)?;
                tx.set("b", "2", None)?;
                tx.set("a", "updated", None)?;
                tx.set("c", "3", None)?;
                tx.delete("b")?;
                Ok(())
            })
            .expect("update");
            db.close().expect("close");
        }

        let db = Database::open(&path).expect("reopen");
        db.view(|tx| {
            assert_eq!(tx.len()?, 2);
            assert_eq!(tx.get("a")?, "updated");
            assert_eq!(tx.get("b"), Err(Error::NotFound));
            assert_eq!(tx.get("c")?, "3");
            Ok(())
        })
        .expect("view");
        db.close().expect("close");
    }

    #[test]
    fn test_log_replay_literal_bytes() {
        let temp_dir = create_temp_dir();
        let path = db_path(&temp_dir);
        let frames = concat!(
            "*3\r\n$3\r\nset\r\n$4\r\nvar1\r\n$4\r\n1234\r\n",
            "*2\r\n$3\r\ndel\r\n$4\r\nvar1\r\n",
            "*5\r\n$3\r\nset\r\n$3\r\nvar\r\n$3\r\nval\r\n$2\r\nex\r\n$2\r\n10\r\n",
        );
        std::fs::write(&path, frames).expect("write fixture");

        let db = Database::open(&path).expect("open");
        db.view(|tx| {
            assert_eq!(tx.len()?, 1);
            assert_eq!(tx.get("var")?, "val");
            assert_eq!(tx.get("var1"), Err(Error::NotFound));
            let ttl = tx.ttl("var")?.expect("var should carry a ttl");
            assert!(ttl <= Duration::from_secs(10));
            Ok(())
        })
        .expect("view");
        db.close().expect("close");
    }

    #[test]
    fn test_bad_formats_fail_open() {
        // Structurally wrong frames condemn the whole log. Frames merely
        // cut short by the end of the file are torn tails and recover
        // instead; see test_torn_tail_recovered_on_open.
        let bad = [
            "*3\n",
            "*a\r\n",
            "*2\r\n$3\r\ndel\r\r",
            "*0\r\n*2\r\n$3\r\ndel\r\r",
            "*1\r\n$3\r\nnop\r\n",
            "*1\r\n$3\r\ndel\r\n",
            "*5\r\n$3\r\nset\r\n$3\r\nvar\r\n$3\r\nval\r\n$2\r\nex\r\n$2\r\naa\r\n",
            "invalid\r\nfile",
        ];
        for frames in bad {
            let temp_dir = create_temp_dir();
            let path = db_path(&temp_dir);
            std::fs::write(&path, frames).expect("write fixture");
            let result = Database::open(&path);
            assert!(
                matches!(result, Err(Error::Invalid(_))),
                "expected open to fail for {frames:?}",
            );
        }
    }

    #[test]
    fn test_torn_tail_recovered_on_open() {
        let temp_dir = create_temp_dir();
        let path = db_path(&temp_dir);
        {
            let db = Database::open(&path).expect("open");
            db.update(|tx| {
                tx.set("a", "1", None)?;
                tx.set("b", "2", None)?;
                Ok(())
            })
            .expect("update");
            db.close().expect("close");
        }
        let good = std::fs::metadata(&path).expect("stat").len();

        // A crash mid-append leaves a half-written frame at the end; open
        // must recover the valid prefix rather than refuse the log.
        use std::io::Write;
        let mut live = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open live");
        live.write_all(b"*3\r\n$3\r\nset\r\n$1\r\nc").expect("write torn frame");
        drop(live);

        let db = Database::open(&path).expect("open with torn tail");
        db.view(|tx| {
            assert_eq!(tx.len()?, 2);
            assert_eq!(tx.get("a")?, "1");
            assert_eq!(tx.get("b")?, "2");
            Ok(())
        })
        .expect("view");
        // The torn bytes were cut off and appends continue cleanly.
        assert_eq!(std::fs::metadata(&path).expect("stat").len(), good);
        db.update(|tx| {
            tx.set("c", "3", None)?;
            Ok(())
        })
        .expect("update");
        db.close().expect("close");

        let db = Database::open(&path).expect("reopen");
        db.view(|tx| {
            assert_eq!(tx.len()?, 3);
            assert_eq!(tx.get("c")?, "3");
            Ok(())
        })
        .expect("view");
        db.close().expect("close");
    }

    #[test]
    fn test_open_directory_fails() {
        let temp_dir = create_temp_dir();
        let path = temp_dir.path().to_str().expect("utf-8 path");
        assert!(Database::open(path).is_err());
    }

    #[test]
    fn test_double_close() {
        let temp_dir = create_temp_dir();
        let db = Database::open(&db_path(&temp_dir)).expect("open");
        db.close().expect("close");
        assert_eq!(db.close(), Err(Error::DatabaseClosed));
        assert_eq!(db.update(|_| Ok(())), Err(Error::DatabaseClosed));
        assert_eq!(db.view(|_| Ok(())), Err(Error::DatabaseClosed));

        let db = Database::open(":memory:").expect("open memory");
        db.close().expect("close");
        assert_eq!(db.close(), Err(Error::DatabaseClosed));
    }

    #[test]
    fn test_shrink() {
        let temp_dir = create_temp_dir();
        let path = db_path(&temp_dir);
        let db = Database::open(&path).expect("open");

        // Shrinking an empty database leaves an empty file.
        db.shrink().expect("shrink empty");
        assert_eq!(std::fs::metadata(&path).expect("stat").len(), 0);

        let fill = |db: &Database| {
            db.update(|tx| {
                for i in 0..10 {
                    tx.set(&format!("key{i}"), &format!("val{i}"), None)?;
                }
                Ok(())
            })
            .expect("update");
        };
        // Two rounds of the same keys produce ten superseded frames.
        fill(&db);
        fill(&db);
        let before = std::fs::metadata(&path).expect("stat").len();
        assert!(before > 0);

        db.shrink().expect("shrink");
        let after = std::fs::metadata(&path).expect("stat").len();
        assert!(after < before, "expected {after} < {before}");

        db.close().expect("close");
        assert_eq!(db.shrink(), Err(Error::DatabaseClosed));

        // The shrunk log reloads to the same state.
        let db = Database::open(&path).expect("reopen");
        db.view(|tx| {
            assert_eq!(tx.len()?, 10);
            assert_eq!(tx.get("key3")?, "val3");
            Ok(())
        })
        .expect("view");
        db.close().expect("close");

        // In-memory shrink is a no-op success.
        let db = Database::open(":memory:").expect("open memory");
        db.update(|tx| {
            tx.set("k", "v", None)?;
            Ok(())
        })
        .expect("update");
        db.shrink().expect("shrink memory");
        db.close().expect("close");
    }

    #[test]
    fn test_should_shrink_thresholds() {
        let config = Config::default()
            .auto_shrink_min_size(1000)
            .auto_shrink_percentage(100);
        // Below the minimum size: never.
        assert!(!should_shrink(999, 0, &config));
        // Above the minimum with no prior shrink: always.
        assert!(should_shrink(1000, 0, &config));
        // Needs to double past the last shrink size.
        assert!(!should_shrink(3999, 2000, &config));
        assert!(should_shrink(4000, 2000, &config));
    }

    #[test]
    fn test_auto_shrink_task() {
        let temp_dir = create_temp_dir();
        let path = db_path(&temp_dir);
        let config = Config::default()
            .auto_shrink_min_size(4 * 1024)
            .shrink_interval(Duration::from_millis(100));
        let db = Database::open_with_config(&path, config).expect("open");
        for _ in 0..200 {
            db.update(|tx| {
                for i in 0..20 {
                    tx.set(&format!("HELLO:{i}"), "WORLD", None)?;
                }
                Ok(())
            })
            .expect("update");
        }
        std::thread::sleep(Duration::from_millis(1500));
        // 4000 frames went through the log; the surviving 20 items fit in
        // a couple of kilobytes once the watcher has shrunk it.
        let after = std::fs::metadata(&path).expect("stat").len();
        assert!(after < 20 * 1024, "expected auto-shrink, size is {after}");
        db.close().expect("close");

        let db = Database::open(&path).expect("reopen");
        assert_eq!(db.view(|tx| tx.len()).expect("len"), 20);
        db.close().expect("close");
    }

    #[test]
    fn test_config_roundtrip() {
        let db = Database::open(":memory:").expect("open");
        let config = Config::default()
            .sync_policy(SyncPolicy::Always)
            .auto_shrink_min_size(100)
            .auto_shrink_percentage(200);
        db.set_config(config).expect("set config");

        let read = db.read_config().expect("read config");
        assert_eq!(read.sync_policy, SyncPolicy::Always);
        assert_eq!(read.auto_shrink_min_size, 100);
        assert_eq!(read.auto_shrink_percentage, 200);

        db.close().expect("close");
        assert_eq!(db.read_config(), Err(Error::DatabaseClosed));
        assert!(db.set_config(Config::default()).is_err());
    }

    #[test]
    fn test_expired_items_hidden_from_scans() {
        let db = Database::open(":memory:").expect("open");
        db.create_index("all", "*", Some(index_string)).expect("create");
        db.update(|tx| {
            tx.set("gone", "a", Some(SetOptions::expiring(Duration::from_millis(10))))?;
            tx.set("kept", "b", None)?;
            Ok(())
        })
        .expect("update");
        std::thread::sleep(Duration::from_millis(30));

        // Even before the sweeper runs, reads filter lazily.
        db.view(|tx| {
            let mut keys = Vec::new();
            tx.ascend("", |key, _| {
                keys.push(key.to_string());
                true
            })?;
            assert_eq!(keys, ["kept"]);
            let mut keys = Vec::new();
            tx.ascend("all", |key, _| {
                keys.push(key.to_string());
                true
            })?;
            assert_eq!(keys, ["kept"]);
            assert_eq!(tx.len()?, 1);
            Ok(())
        })
        .expect("view");
        db.close().expect("close");
    }

    #[test]
    fn test_update_survives_many_batches() {
        let temp_dir = create_temp_dir();
        let path = db_path(&temp_dir);
        let db = Database::open(&path).expect("open");
        for _ in 0..50 {
            db.update(|tx| {
                for j in 0..20 {
                    tx.set(&format!("hello{j}"), "planet", None)?;
                }
                tx.set(
                    "hi",
                    "world",
                    Some(SetOptions::expiring(Duration::from_millis(200))),
                )?;
                Ok(())
            })
            .expect("update");
        }
        assert_eq!(db.view(|tx| tx.len()).expect("len"), 21);
        std::thread::sleep(Duration::from_millis(700));
        assert_eq!(db.view(|tx| tx.len()).expect("len"), 20);
        db.close().expect("close");

        let db = Database::open(&path).expect("reopen");
        assert_eq!(db.view(|tx| tx.len()).expect("len"), 20);
        db.close().expect("close");
    }
}
