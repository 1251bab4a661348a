//! Database lifecycle: open and replay, transactions, background
//! maintenance, and the compacting log rewrite.
//!
//! All state sits behind one readers-writer lock; commits are totally
//! ordered by write-lock acquisition and that order is what the log
//! persists. A single maintenance thread drives expiration sweeps, the
//! every-second fsync, and the auto-shrink check, and exits on close.

use crate::config::{Config, SyncPolicy};
use crate::error::{AtollError, Result};
use crate::index::{Index, RectFn};
use crate::item::Item;
use crate::ordered::{Comparator, LessFn, OrderedSet};
use crate::persistence::{Command, LogFile, encode_set};
use crate::tx::{Tx, begin_tx};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

/// Items serialized per read-lock slice during shrink enumeration.
const SHRINK_BATCH: usize = 1000;

#[derive(Debug)]
pub(crate) struct DbState {
    pub(crate) keys: OrderedSet,
    pub(crate) exps: OrderedSet,
    pub(crate) idxs: BTreeMap<String, Index>,
    pub(crate) log: Option<LogFile>,
    pub(crate) config: Config,
    pub(crate) closed: bool,
    pub(crate) flushes: u64,
    pub(crate) shrinking: bool,
    pub(crate) last_shrink_size: u64,
}

impl DbState {
    fn new(config: Config) -> Self {
        Self {
            keys: OrderedSet::new(Comparator::Keys),
            exps: OrderedSet::new(Comparator::Deadline),
            idxs: BTreeMap::new(),
            log: None,
            config,
            closed: false,
            flushes: 0,
            shrinking: false,
            last_shrink_size: 0,
        }
    }

    /// Insert into the primary tree and keep the expiration queue and every
    /// matching index in step. Returns the replaced item.
    pub(crate) fn insert_item(&mut self, item: Arc<Item>) -> Option<Arc<Item>> {
        let prev = self.keys.insert(item.clone());
        if let Some(old) = &prev {
            if old.deadline.is_some() {
                self.exps.remove(old);
            }
            for idx in self.idxs.values_mut() {
                if idx.matches(&old.key) {
                    idx.remove(old);
                }
            }
        }
        if item.deadline.is_some() {
            self.exps.insert(item.clone());
        }
        for idx in self.idxs.values_mut() {
            if idx.matches(&item.key) {
                idx.insert(&item);
            }
        }
        prev
    }

    /// Remove from the primary tree, the expiration queue, and every
    /// matching index.
    pub(crate) fn remove_item_by_key(&mut self, key: &[u8]) -> Option<Arc<Item>> {
        let probe = self.keys.key_probe(key);
        let old = self.keys.remove(&probe.item)?;
        if old.deadline.is_some() {
            self.exps.remove(&old);
        }
        for idx in self.idxs.values_mut() {
            if idx.matches(&old.key) {
                idx.remove(&old);
            }
        }
        Some(old)
    }
}

#[derive(Debug)]
struct BgHandle {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub(crate) struct DbShared {
    pub(crate) state: RwLock<DbState>,
    bg: Mutex<Option<BgHandle>>,
}

/// An embedded ordered key/value database.
///
/// # Examples
///
/// ```rust
/// use atoll::Db;
///
/// let db = Db::memory()?;
/// db.update(|tx| {
///     tx.set("greeting", "hello", None)?;
///     Ok(())
/// })?;
/// let value = db.view(|tx| tx.get("greeting", false))?;
/// assert_eq!(&value[..], b"hello");
/// # Ok::<(), atoll::AtollError>(())
/// ```
#[derive(Debug)]
pub struct Db {
    shared: Arc<DbShared>,
}

impl Db {
    /// Open a database at `path`, replaying the persistence log to restore
    /// prior state. `":memory:"` opens a volatile in-memory database.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Open with a custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        let path = path.as_ref();
        let is_memory = path.to_str() == Some(":memory:");

        let mut state = DbState::new(config);
        if !is_memory {
            let mut log = LogFile::open(path)?;
            load_from_log(&mut state, &mut log)?;
            state.last_shrink_size = log.size();
            state.log = Some(log);
        }

        let shared = Arc::new(DbShared {
            state: RwLock::new(state),
            bg: Mutex::new(None),
        });
        start_background(&shared)?;
        Ok(Db { shared })
    }

    /// Open a volatile in-memory database.
    pub fn memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Open a volatile in-memory database with a custom configuration.
    pub fn memory_with_config(config: Config) -> Result<Self> {
        Self::open_with_config(":memory:", config)
    }

    /// A builder for advanced configuration.
    pub fn builder() -> DbBuilder {
        DbBuilder::new()
    }

    /// Begin a transaction. Read transactions may run concurrently; a write
    /// transaction is exclusive. Prefer [`Db::view`] and [`Db::update`],
    /// which manage commit and rollback.
    pub fn begin(&self, writable: bool) -> Result<Tx<'_>> {
        begin_tx(&self.shared, writable)
    }

    /// Run a read transaction.
    pub fn view<T>(&self, f: impl FnOnce(&Tx) -> Result<T>) -> Result<T> {
        let tx = self.begin(false)?;
        let result = f(&tx);
        tx.rollback()?;
        result
    }

    /// Run a write transaction. The transaction commits when `f` returns
    /// `Ok` and rolls back completely when it returns an error or panics.
    pub fn update<T>(&self, f: impl FnOnce(&Tx) -> Result<T>) -> Result<T> {
        let tx = self.begin(true)?;
        match panic::catch_unwind(AssertUnwindSafe(|| f(&tx))) {
            Ok(Ok(value)) => {
                tx.commit()?;
                Ok(value)
            }
            Ok(Err(err)) => {
                tx.rollback()?;
                Err(err)
            }
            Err(payload) => {
                let _ = tx.rollback();
                panic::resume_unwind(payload);
            }
        }
    }

    /// Create a secondary index. See [`Tx::create_index`].
    pub fn create_index(&self, name: &str, pattern: &str, lessers: Vec<LessFn>) -> Result<()> {
        self.update(|tx| tx.create_index(name, pattern, lessers))
    }

    /// Create a secondary index, replacing any existing index with the same
    /// name.
    pub fn replace_index(&self, name: &str, pattern: &str, lessers: Vec<LessFn>) -> Result<()> {
        self.update(|tx| {
            match tx.create_index(name, pattern, lessers.clone()) {
                Err(AtollError::IndexExists) => {
                    tx.drop_index(name)?;
                    tx.create_index(name, pattern, lessers.clone())
                }
                other => other,
            }
        })
    }

    /// Create a spatial index. See [`Tx::create_spatial_index`].
    pub fn create_spatial_index(&self, name: &str, pattern: &str, rect: RectFn) -> Result<()> {
        self.update(|tx| tx.create_spatial_index(name, pattern, rect))
    }

    /// Create a spatial index, replacing any existing index with the same
    /// name.
    pub fn replace_spatial_index(&self, name: &str, pattern: &str, rect: RectFn) -> Result<()> {
        self.update(|tx| {
            match tx.create_spatial_index(name, pattern, rect.clone()) {
                Err(AtollError::IndexExists) => {
                    tx.drop_index(name)?;
                    tx.create_spatial_index(name, pattern, rect.clone())
                }
                other => other,
            }
        })
    }

    /// Remove an index.
    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.update(|tx| tx.drop_index(name))
    }

    /// Registered index names, lexicographically sorted.
    pub fn indexes(&self) -> Result<Vec<String>> {
        self.view(|tx| tx.indexes())
    }

    /// A copy of the current configuration.
    pub fn read_config(&self) -> Result<Config> {
        let state = self.shared.state.read();
        if state.closed {
            return Err(AtollError::DatabaseClosed);
        }
        Ok(state.config.clone())
    }

    /// Replace the configuration.
    pub fn set_config(&self, config: Config) -> Result<()> {
        if config.validate().is_err() {
            return Err(AtollError::InvalidOperation);
        }
        let mut state = self.shared.state.write();
        if state.closed {
            return Err(AtollError::DatabaseClosed);
        }
        state.config = config;
        Ok(())
    }

    /// Flush and fsync pending log writes.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.shared.state.write();
        if state.closed {
            return Err(AtollError::DatabaseClosed);
        }
        let mode = state.config.sync_mode;
        if let Some(log) = state.log.as_mut() {
            log.sync(mode)?;
        }
        Ok(())
    }

    /// Rewrite the log to the minimum command set reproducing the live
    /// state. A no-op for in-memory databases; fails `ShrinkInProgress`
    /// when a shrink is already running.
    pub fn shrink(&self) -> Result<()> {
        shrink_shared(&self.shared)
    }

    /// Close the database: sync the log, stop the maintenance thread, and
    /// reject all further operations.
    pub fn close(&self) -> Result<()> {
        let sync_result = {
            let mut state = self.shared.state.write();
            if state.closed {
                return Err(AtollError::DatabaseClosed);
            }
            state.closed = true;
            let mode = state.config.sync_mode;
            match state.log.as_mut() {
                Some(log) => log.sync(mode),
                None => Ok(()),
            }
        };
        if let Some(bg) = self.shared.bg.lock().take() {
            let _ = bg.stop.send(());
            let _ = bg.handle.join();
        }
        sync_result
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Builder for databases with custom persistence paths and settings.
#[derive(Debug)]
pub struct DbBuilder {
    path: Option<PathBuf>,
    config: Config,
}

impl DbBuilder {
    /// Create a builder with default in-memory configuration.
    pub fn new() -> Self {
        Self {
            path: None,
            config: Config::default(),
        }
    }

    /// Set the log path. The file is created if needed and replayed on
    /// open.
    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Configure for in-memory storage with no persistence.
    pub fn in_memory(mut self) -> Self {
        self.path = None;
        self
    }

    /// Set the full configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set just the sync policy.
    pub fn sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.config.sync_policy = policy;
        self
    }

    /// Build the database, replaying the log if one is configured.
    pub fn build(self) -> Result<Db> {
        match self.path {
            Some(path) => Db::open_with_config(path, self.config),
            None => Db::open_with_config(":memory:", self.config),
        }
    }
}

impl Default for DbBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn load_from_log(state: &mut DbState, log: &mut LogFile) -> Result<()> {
    for command in log.replay()? {
        match command {
            Command::Set {
                key,
                value,
                deadline,
            } => {
                let mut item = Item::new(key, value);
                item.deadline = deadline;
                state.insert_item(Arc::new(item));
            }
            Command::Del { key } => {
                state.remove_item_by_key(&key);
            }
            Command::FlushDb => {
                state.keys.clear();
                state.exps.clear();
                let DbState { keys, idxs, .. } = state;
                for idx in idxs.values_mut() {
                    idx.rebuild(keys);
                }
            }
        }
    }
    Ok(())
}

fn start_background(shared: &Arc<DbShared>) -> Result<()> {
    let tick = shared.state.read().config.expiration_tick();
    let (stop_tx, stop_rx) = mpsc::channel();
    let thread_shared = shared.clone();
    let handle = std::thread::Builder::new()
        .name("atoll-maintenance".into())
        .spawn(move || background_manager(thread_shared, stop_rx, tick))?;
    *shared.bg.lock() = Some(BgHandle {
        stop: stop_tx,
        handle,
    });
    Ok(())
}

fn background_manager(shared: Arc<DbShared>, stop: Receiver<()>, tick: Duration) {
    let mut synced_flushes = 0u64;
    loop {
        match stop.recv_timeout(tick) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        match manager_tick(&shared, &mut synced_flushes) {
            Ok(true) => {
                if let Err(err) = shrink_shared(&shared) {
                    match err {
                        AtollError::ShrinkInProgress | AtollError::DatabaseClosed => {}
                        err => log::warn!("auto-shrink failed: {err}"),
                    }
                }
            }
            Ok(false) => {}
            Err(AtollError::DatabaseClosed) => break,
            Err(err) => log::error!("background maintenance failed: {err}"),
        }
    }
}

/// One maintenance pass: sweep expired items under a write transaction,
/// fsync when running `EverySecond`, and report whether the log has grown
/// past the auto-shrink threshold.
fn manager_tick(shared: &DbShared, synced_flushes: &mut u64) -> Result<bool> {
    let (on_expired, on_expired_sync, policy, mode, shrinking, shrink_due) = {
        let state = shared.state.read();
        if state.closed {
            return Err(AtollError::DatabaseClosed);
        }
        let config = &state.config;
        let shrink_due = !config.auto_shrink_disabled
            && state.log.as_ref().is_some_and(|log| {
                let size = log.size();
                let threshold = state.last_shrink_size.saturating_add(
                    state
                        .last_shrink_size
                        .saturating_mul(config.auto_shrink_percentage)
                        / 100,
                );
                size > config.auto_shrink_min_size && size > threshold
            });
        (
            config.on_expired.clone(),
            config.on_expired_sync.clone(),
            config.sync_policy,
            config.sync_mode,
            state.shrinking,
            shrink_due,
        )
    };

    // the sweeper sits out while a shrink is rewriting the log
    if !shrinking {
        let mut deferred: Vec<Bytes> = Vec::new();
        let tx = begin_tx(shared, true)?;
        let sweep = (|| -> Result<()> {
            let expired = tx.expired_items()?;
            if expired.is_empty() {
                return Ok(());
            }
            if let Some(hook) = &on_expired_sync {
                for item in &expired {
                    hook(&item.key, &item.value, &tx)?;
                }
            } else if on_expired.is_some() {
                deferred = expired.iter().map(|item| item.key.clone()).collect();
            } else {
                for item in &expired {
                    match tx.delete(&item.key) {
                        Ok(_) | Err(AtollError::NotFound) => {}
                        Err(err) => return Err(err),
                    }
                }
            }
            Ok(())
        })();
        match sweep {
            Ok(()) => tx.commit()?,
            Err(err) => {
                let _ = tx.rollback();
                return Err(err);
            }
        }
        if let Some(hook) = &on_expired
            && !deferred.is_empty()
        {
            hook(deferred);
        }
    }

    if policy == SyncPolicy::EverySecond {
        let mut state = shared.state.write();
        if state.closed {
            return Err(AtollError::DatabaseClosed);
        }
        let flushes = state.flushes;
        if flushes != *synced_flushes {
            if let Some(log) = state.log.as_mut() {
                log.sync(mode)?;
            }
            *synced_flushes = flushes;
        }
    }

    Ok(shrink_due)
}

pub(crate) fn shrink_shared(shared: &DbShared) -> Result<()> {
    let (path, endpos) = {
        let mut state = shared.state.write();
        if state.closed {
            return Err(AtollError::DatabaseClosed);
        }
        if state.shrinking {
            return Err(AtollError::ShrinkInProgress);
        }
        let Some(log) = state.log.as_mut() else {
            // nothing to rewrite for an in-memory database
            return Ok(());
        };
        log.flush()?;
        let path = log.path().to_path_buf();
        let endpos = log.size();
        state.shrinking = true;
        (path, endpos)
    };

    let result = shrink_rewrite(shared, &path, endpos);
    shared.state.write().shrinking = false;
    result
}

/// Enumerate the live items into a sibling temp file in pivot-continued
/// batches under short read locks, then swap it in under the write lock
/// after appending whatever was committed during the enumeration.
fn shrink_rewrite(shared: &DbShared, path: &Path, endpos: u64) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut writer = BufWriter::new(File::create(&tmp_path)?);
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut pivot: Option<Bytes> = None;
    let mut done = false;

    while !done {
        done = true;
        {
            let state = shared.state.read();
            if state.closed {
                return Err(AtollError::DatabaseClosed);
            }
            let from = pivot.take().map(|key| state.keys.key_probe(&key));
            let mut n = 0;
            state.keys.ascend(from.as_ref(), |item| {
                if n == SHRINK_BATCH {
                    pivot = Some(item.key.clone());
                    done = false;
                    return false;
                }
                encode_set(&mut buf, item);
                n += 1;
                true
            });
        }
        if !buf.is_empty() {
            writer.write_all(&buf)?;
            buf.clear();
        }
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;

    let mut state = shared.state.write();
    if state.closed {
        return Err(AtollError::DatabaseClosed);
    }
    let new_size = {
        let Some(log) = state.log.as_mut() else {
            return Err(AtollError::InvalidOperation);
        };
        log.flush()?;

        // commands appended since the snapshot began carry over verbatim
        let mut old = File::open(path)?;
        old.seek(SeekFrom::Start(endpos))?;
        std::io::copy(&mut old, &mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        std::fs::rename(&tmp_path, path)?;
        *log = LogFile::open(path)?;
        log.size()
    };
    state.last_shrink_size = new_size;
    Ok(())
}
