//! # Storage Engine
//!
//! The public surface of the store: open/close, point reads, blind
//! writes, read-modify-write merge, range delete, ordered iteration, and
//! explicit sync — stitched over the memtable view ring, the rotating
//! WAL, and the partitioned table versions.
//!
//! ## Read path
//!
//! A reader snapshots the current view and probes newest-first:
//! writable memtable → immutable memtable (during compaction) → table
//! version. The first authoritative answer (a value *or* a tombstone)
//! wins.
//!
//! ## Write path
//!
//! A writer checks the view pointer, then under the engine write lock
//! appends the record to the WAL buffer, adjusts the size accounting,
//! and merges into the writable memtable. If the view rotated between
//! the snapshot and the lock, the write retries against the new view.
//! Writers block in a bounded wait loop while the engine is full; the
//! background worker runs the compaction that drains it.
//!
//! ## Handles & reclamation
//!
//! Threads obtain an [`EngineHandle`], which owns a slot in the
//! quiescence registry and caches the current (view, version) pair.
//! Every operation publishes the reader's generation on entry and parks
//! it on exit, letting compaction retire previous views without
//! stop-the-world locks.
//!
//! ## Durability
//!
//! Every acknowledged write is in the WAL buffer before the memtable;
//! [`Engine::sync`] (or compaction) makes it durable. After a clean
//! `close` + reopen the store is byte-identical; after a crash, WAL
//! replay restores every record the WAL had absorbed.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod merge;

mod compaction;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::HashSet;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::kv::{KeyRef, KvItem, KvRecord, MergeUpdate};
use crate::memtable::{MemEntry, MemIter, Memtable, MemtableGet};
use crate::qsbr::{Qsbr, QsbrSlot};
use crate::sstable::{SstError, SstStore, TableGet, Version, VersionIter};
use crate::view::{MtView, ViewRing};
use crate::wal::{Wal, WalError};

use self::merge::{MergeIterator, RankedSource, VisibleIter};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by engine lifecycle operations.
///
/// Data-path operations (`get`, `put`, …) follow the bool/Option
/// convention instead; WAL ring failures on those paths are fatal.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error originating from the WAL subsystem.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Error originating from the table subsystem.
    #[error("table error: {0}")]
    Sst(#[from] SstError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation (poisoned lock, exhausted registry).
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Compaction worker CPU placement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WorkerCores {
    /// Let the OS scheduler place workers.
    #[default]
    Auto,

    /// Explicitly skip any placement logic.
    Dont,

    /// Pin workers round-robin to the listed CPUs.
    List(Vec<usize>),
}

impl FromStr for WorkerCores {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "dont" => Ok(Self::Dont),
            list => list
                .split(',')
                .map(|c| c.trim().parse::<usize>().map_err(|e| e.to_string()))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
        }
    }
}

/// Configuration for an [`Engine`] instance. Passed to [`Engine::open`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Table block cache budget in MiB. Tables are memory-mapped, so the
    /// budget is advisory; it is recorded and reported in stats.
    pub cache_size_mb: usize,

    /// Target max memtable size in MiB; reaching it triggers compaction.
    pub mt_size_mb: usize,

    /// Per-WAL-file size cap in MiB; reaching it triggers compaction.
    pub wal_size_mb: usize,

    /// Emit prefix-compressed key blocks in new tables.
    pub ckeys: bool,

    /// Emit per-key hash tags in table indexes for point-lookup speedup.
    pub tags: bool,

    /// Compaction worker thread count.
    pub nr_workers: usize,

    /// Merge tasks per compaction worker (sizing pass-through).
    pub co_per_worker: usize,

    /// Worker CPU placement policy.
    pub worker_cores: WorkerCores,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_size_mb: 256,
            mt_size_mb: 64,
            wal_size_mb: 256,
            ckeys: false,
            tags: true,
            nr_workers: 4,
            co_per_worker: 4,
            worker_cores: WorkerCores::Auto,
        }
    }
}

/// Snapshot of engine statistics returned by [`Engine::stats`].
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Current memtable size accounting, in bytes.
    pub mtsz: u64,

    /// Logical write offset of the current WAL file.
    pub wal_off: u64,

    /// Live table version id.
    pub version: u64,

    /// Partitions in the live version.
    pub partitions: usize,

    /// Tables in the live version.
    pub tables: usize,

    /// Total table data bytes in the live version.
    pub table_bytes: u64,

    /// Bytes written into tables since open (write amplification).
    pub stat_writes: u64,

    /// Bytes served from tables since open (read amplification).
    pub stat_reads: u64,

    /// Compaction rounds completed since open.
    pub compactions: u64,

    /// Configured (advisory) block cache budget in MiB.
    pub cache_size_mb: usize,
}

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

pub(crate) struct EngineMut {
    pub(crate) wal: Wal,
    pub(crate) mtsz: u64,
}

pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) max_mtsz: u64,
    pub(crate) max_walsz: u64,
    pub(crate) max_reject: u64,

    /// The engine write lock: guards `mtsz`, the WAL buffer, and view
    /// pointer advances. Held briefly; the only I/O under it is the
    /// rotation inside compaction.
    pub(crate) mu: Mutex<EngineMut>,

    pub(crate) ring: ViewRing,
    pub(crate) r#gen: AtomicU64,
    pub(crate) qsbr: Qsbr,
    pub(crate) store: SstStore,

    /// Set when the memtable or WAL hit their cap; writers wait on it.
    pub(crate) full: AtomicBool,
    pub(crate) shutdown: AtomicBool,

    pub(crate) compact_req: Mutex<bool>,
    pub(crate) compact_cv: Condvar,

    /// Serializes compaction rounds (background worker vs. explicit).
    pub(crate) compact_mu: Mutex<()>,
    pub(crate) compactions: AtomicU64,

    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EngineShared {
    pub(crate) fn notify_worker(&self) {
        let mut req = self.compact_req.lock().expect("compact_req lock");
        *req = true;
        self.compact_cv.notify_one();
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, EngineMut> {
        self.mu.lock().expect("engine lock poisoned")
    }
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

/// The engine handle. Clone-shareable across threads; per-thread
/// operations go through [`Engine::handle`].
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Engine {
    /// Opens (or creates) a store rooted at `dir`.
    ///
    /// Loads the persisted table version, replays the WAL pair into the
    /// writable memtable (re-logging retired-file survivors), and starts
    /// the background compaction worker.
    pub fn open(dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let dir: PathBuf = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let store = SstStore::open(&dir, config.ckeys, config.tags)?;

        let a = Arc::new(Memtable::new());
        let b = Arc::new(Memtable::new());
        let ring = ViewRing::new(Arc::clone(&a), Arc::clone(&b));

        // WAL replay drives records straight into the fresh writable
        // memtable, tracking which keys' newest value originated in the
        // retired file — those must be re-logged before it can go.
        let mut mtsz: u64 = 0;
        let mut old_origin: HashSet<Bytes> = HashSet::new();
        let (mut wal, summary) = Wal::open(&dir, store.version(), |newest, rec| {
            let old = a.entry_mem_size(&rec.key) as u64;
            mtsz = mtsz + rec.mem_size() as u64 - old;
            if newest {
                old_origin.remove(&rec.key);
            } else {
                old_origin.insert(rec.key.clone());
            }
            a.insert(&rec);
        })?;

        if summary.old_records > 0 {
            let mut relogged = 0usize;
            for key in old_origin {
                if let Some(entry) = a.entry(&key) {
                    wal.append(&entry.to_record(key))?;
                    relogged += 1;
                }
            }
            wal.flush_sync_wait()?;
            info!(relogged, "retired-wal survivors re-logged");
        }
        wal.truncate_retired()?;

        if !matches!(config.worker_cores, WorkerCores::Auto) {
            debug!(cores = ?config.worker_cores, "worker core placement noted");
        }

        let max_mtsz = (config.mt_size_mb as u64) << 20;
        let max_walsz = (config.wal_size_mb as u64) << 20;
        let wal_off = wal.write_off();
        let shared = Arc::new(EngineShared {
            max_mtsz,
            max_walsz,
            max_reject: max_mtsz >> 4,
            mu: Mutex::new(EngineMut { wal, mtsz }),
            ring,
            r#gen: AtomicU64::new(1),
            qsbr: Qsbr::new(),
            store,
            full: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            compact_req: Mutex::new(false),
            compact_cv: Condvar::new(),
            compact_mu: Mutex::new(()),
            compactions: AtomicU64::new(0),
            worker: Mutex::new(None),
            config,
        });

        if mtsz >= max_mtsz || wal_off >= max_walsz {
            shared.full.store(true, Ordering::SeqCst);
        }

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("remusdb-compact".into())
                .spawn(move || background_worker(&shared))
                .map_err(EngineError::Io)?
        };
        *shared.worker.lock().expect("worker slot") = Some(worker);

        if shared.full.load(Ordering::SeqCst) {
            shared.notify_worker();
        }

        info!(
            mtsz,
            replayed = summary.cur_records + summary.old_records,
            version = shared.store.version(),
            "engine opened"
        );
        Ok(Self { shared })
    }

    /// Registers a per-thread operation handle.
    pub fn handle(&self) -> Result<EngineHandle, EngineError> {
        let slot = self
            .shared
            .qsbr
            .register()
            .ok_or_else(|| EngineError::Internal("reader registry exhausted".into()))?;
        let (view_idx, view) = self.shared.ring.current();
        let version = self.shared.store.getv();
        Ok(EngineHandle {
            shared: Arc::clone(&self.shared),
            slot,
            cached_gen: self.shared.r#gen.load(Ordering::SeqCst),
            view_idx,
            view,
            version,
        })
    }

    /// Flushes and fsyncs the WAL; on return every acknowledged write is
    /// durable.
    pub fn sync(&self) -> Result<(), EngineError> {
        let mut g = self.shared.lock();
        g.wal.flush_sync_wait()?;
        Ok(())
    }

    /// Runs one compaction round synchronously.
    pub fn compact(&self) -> Result<(), EngineError> {
        compaction::run_compaction(&self.shared, true);
        Ok(())
    }

    /// Snapshot of engine statistics.
    pub fn stats(&self) -> EngineStats {
        let (mtsz, wal_off) = {
            let g = self.shared.lock();
            (g.mtsz, g.wal.write_off())
        };
        let v = self.shared.store.getv();
        EngineStats {
            mtsz,
            wal_off,
            version: v.seq,
            partitions: v.parts.len(),
            tables: v.table_count(),
            table_bytes: v.data_size(),
            stat_writes: self.shared.store.stat_writes(),
            stat_reads: self.shared.store.stat_reads(),
            compactions: self.shared.compactions.load(Ordering::Relaxed),
            cache_size_mb: self.shared.config.cache_size_mb,
        }
    }

    /// Gracefully shuts down: joins the background worker (draining any
    /// in-flight compaction) and makes the WAL durable.
    pub fn close(&self) -> Result<(), EngineError> {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.compact_cv.notify_all();
        let worker = self.shared.worker.lock().expect("worker slot").take();
        if let Some(w) = worker {
            let _ = w.join();
        }
        let mut g = self.shared.lock();
        g.wal.flush_sync_wait()?;
        info!("engine closed");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Last handle out turns off the lights; explicit close is still
        // the recommended path.
        if Arc::strong_count(&self.shared) == 1 && !self.shared.shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.close() {
                error!(error = %e, "close on drop failed");
            }
        }
    }
}

fn background_worker(shared: &EngineShared) {
    loop {
        {
            let mut req = shared.compact_req.lock().expect("compact_req lock");
            while !*req && !shared.shutdown.load(Ordering::SeqCst) {
                let (g, _) = shared
                    .compact_cv
                    .wait_timeout(req, Duration::from_millis(100))
                    .expect("compact_cv wait");
                req = g;
                if shared.full.load(Ordering::SeqCst) {
                    break;
                }
            }
            *req = false;
        }

        if shared.full.load(Ordering::SeqCst) {
            compaction::run_compaction(shared, false);
            continue;
        }
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
    }
}

// ------------------------------------------------------------------------------------------------
// EngineHandle — the per-thread operation surface
// ------------------------------------------------------------------------------------------------

/// Per-thread operation handle: owns a quiescence slot and caches the
/// current (view, version) pair, re-acquiring lazily when the engine's
/// view pointer advances.
pub struct EngineHandle {
    shared: Arc<EngineShared>,
    slot: QsbrSlot,
    cached_gen: u64,
    view_idx: usize,
    view: Arc<MtView>,
    version: Arc<Version>,
}

impl EngineHandle {
    /// Read-enter: publish our generation, refresh stale caches.
    fn enter(&mut self) {
        let r#gen = self.shared.r#gen.load(Ordering::SeqCst);
        self.shared.qsbr.update(&self.slot, r#gen);
        if r#gen != self.cached_gen {
            let (idx, view) = self.shared.ring.current();
            self.view_idx = idx;
            self.view = view;
            self.version = self.shared.store.getv();
            self.cached_gen = r#gen;
        }
    }

    /// Read-leave: park so reclamation never waits on an idle handle.
    fn leave(&self) {
        self.shared.qsbr.park(&self.slot);
    }

    /// Bounded wait while the engine is full. Returns `false` on
    /// shutdown.
    ///
    /// Parks our slot first: a writer spinning here must never hold the
    /// quiescence protocol hostage while compaction drains the engine.
    fn write_enter(&self) -> bool {
        self.shared.qsbr.park(&self.slot);
        while self.shared.full.load(Ordering::SeqCst) {
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            self.shared.notify_worker();
            std::thread::sleep(Duration::from_micros(200));
        }
        !self.shared.shutdown.load(Ordering::SeqCst)
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Point lookup. `None` means deleted or never written.
    pub fn get(&mut self, key: &[u8]) -> Option<Bytes> {
        self.enter();
        let r = self.get_inner(key);
        self.leave();
        r
    }

    fn get_inner(&self, key: &[u8]) -> Option<Bytes> {
        match self.view.wmt.get(key) {
            MemtableGet::Put(v) => return Some(v),
            MemtableGet::Tombstone => return None,
            MemtableGet::Miss => {}
        }
        if let Some(imt) = &self.view.imt {
            match imt.get(key) {
                MemtableGet::Put(v) => return Some(v),
                MemtableGet::Tombstone => return None,
                MemtableGet::Miss => {}
            }
        }
        let kref = KeyRef::new(key);
        match self.version.get_ts(kref) {
            Ok(TableGet::Put(v)) => {
                self.shared
                    .store
                    .add_stat_reads((key.len() + v.len()) as u64);
                Some(v)
            }
            Ok(TableGet::Tombstone) | Ok(TableGet::Miss) => None,
            Err(e) => {
                error!(error = %e, "table read failed");
                None
            }
        }
    }

    /// Existence probe with the same layering as [`EngineHandle::get`].
    pub fn probe(&mut self, key: &[u8]) -> bool {
        self.enter();
        let r = self.probe_inner(key);
        self.leave();
        r
    }

    fn probe_inner(&self, key: &[u8]) -> bool {
        match self.view.wmt.get(key) {
            MemtableGet::Put(_) => return true,
            MemtableGet::Tombstone => return false,
            MemtableGet::Miss => {}
        }
        if let Some(imt) = &self.view.imt {
            match imt.get(key) {
                MemtableGet::Put(_) => return true,
                MemtableGet::Tombstone => return false,
                MemtableGet::Miss => {}
            }
        }
        match self.version.probe_ts(KeyRef::new(key)) {
            Ok(found) => found,
            Err(e) => {
                error!(error = %e, "table probe failed");
                false
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Blind put. `false` on rejected input or shutdown.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> bool {
        if !KvRecord::size_ok(key.len(), value.len()) {
            warn!(klen = key.len(), vlen = value.len(), "oversized request rejected");
            return false;
        }
        let rec = KvRecord::new(key, value);
        self.update(rec)
    }

    /// Tombstone delete. Blind: succeeds whether or not the key exists.
    pub fn del(&mut self, key: &[u8]) -> bool {
        if !KvRecord::size_ok(key.len(), 0) {
            warn!(klen = key.len(), "oversized request rejected");
            return false;
        }
        let rec = KvRecord::new_tombstone(key);
        self.update(rec)
    }

    fn update(&mut self, rec: KvRecord) -> bool {
        loop {
            if !self.write_enter() {
                return false;
            }
            self.enter();
            let view_idx = self.view_idx;
            let wmt = Arc::clone(&self.view.wmt);

            let mut g = self.shared.lock();
            if self.shared.ring.current_index() != view_idx {
                // Rotated out from under us; retry against the new view.
                drop(g);
                continue;
            }
            let old = wmt.entry_mem_size(&rec.key) as u64;
            if let Err(e) = g.wal.append(&rec) {
                panic!("wal append failed, durability lost: {e}");
            }
            g.mtsz = g.mtsz + rec.mem_size() as u64 - old;
            wmt.insert(&rec);
            let full = g.mtsz >= self.shared.max_mtsz || g.wal.write_off() >= self.shared.max_walsz;
            drop(g);

            if full {
                self.shared.full.store(true, Ordering::SeqCst);
                self.shared.notify_worker();
            }
            self.leave();
            return true;
        }
    }

    /// Atomic read-modify-write.
    ///
    /// Phase 1 merges against the writable memtable. When the key is
    /// absent there, phase 2 fetches the older version from the
    /// immutable memtable or the tables, applies `f`, and merges the
    /// result back — re-running `f` if a concurrent writer raced the key
    /// into the memtable meanwhile.
    pub fn merge<F>(&mut self, key: &[u8], mut f: F) -> bool
    where
        F: FnMut(Option<&[u8]>) -> MergeUpdate,
    {
        if !KvRecord::size_ok(key.len(), 0) {
            warn!(klen = key.len(), "oversized request rejected");
            return false;
        }
        let kb = Bytes::copy_from_slice(key);
        loop {
            if !self.write_enter() {
                return false;
            }
            self.enter();
            let view_idx = self.view_idx;
            let wmt = Arc::clone(&self.view.wmt);

            // Phase 1: the key may already live in the writable memtable.
            {
                let mut g = self.shared.lock();
                if self.shared.ring.current_index() != view_idx {
                    continue;
                }
                if let Some(entry) = wmt.entry(key) {
                    let cur = (!entry.tombstone).then_some(entry.value.as_ref());
                    let upd = f(cur);
                    let ok = self.apply_update(&mut g, &wmt, &kb, upd);
                    drop(g);
                    self.leave();
                    return ok;
                }
            }

            // Phase 2: consult the older layers without holding the lock.
            let older: Option<Bytes> = self.view.imt.as_ref().and_then(|imt| match imt.get(key) {
                MemtableGet::Put(v) => Some(Some(v)),
                MemtableGet::Tombstone => Some(None),
                MemtableGet::Miss => None,
            }).unwrap_or_else(|| match self.version.get_ts(KeyRef::new(key)) {
                Ok(TableGet::Put(v)) => Some(v),
                _ => None,
            });
            let upd = f(older.as_deref());

            let mut g = self.shared.lock();
            if self.shared.ring.current_index() != view_idx {
                continue;
            }
            if wmt.entry(key).is_some() {
                // A writer slipped the key in; rerun phase 1.
                drop(g);
                continue;
            }
            let ok = self.apply_update(&mut g, &wmt, &kb, upd);
            drop(g);
            self.leave();
            return ok;
        }
    }

    fn apply_update(
        &self,
        g: &mut std::sync::MutexGuard<'_, EngineMut>,
        wmt: &Arc<Memtable>,
        key: &Bytes,
        upd: MergeUpdate,
    ) -> bool {
        let rec = match upd {
            MergeUpdate::Keep => return true,
            MergeUpdate::Put(v) => {
                if !KvRecord::size_ok(key.len(), v.len()) {
                    warn!(klen = key.len(), vlen = v.len(), "oversized merge result rejected");
                    return false;
                }
                KvRecord::from_parts(key.clone(), v, false)
            }
            MergeUpdate::Delete => KvRecord::from_parts(key.clone(), Bytes::new(), true),
        };
        let old = wmt.entry_mem_size(key) as u64;
        if let Err(e) = g.wal.append(&rec) {
            panic!("wal append failed, durability lost: {e}");
        }
        g.mtsz = g.mtsz + rec.mem_size() as u64 - old;
        wmt.insert(&rec);
        if g.mtsz >= self.shared.max_mtsz || g.wal.write_off() >= self.shared.max_walsz {
            self.shared.full.store(true, Ordering::SeqCst);
            self.shared.notify_worker();
        }
        true
    }

    /// Deletes every visible key in `[start, end)` by writing tombstones.
    ///
    /// The key set is snapshotted first; keys written into the range
    /// after the snapshot are unaffected.
    pub fn del_range(&mut self, start: &[u8], end: &[u8]) -> bool {
        if start >= end {
            return true;
        }
        self.enter();
        let sources = build_sources(&self.view, &self.version, Bound::Included(start));
        let keys: Vec<Bytes> = VisibleIter::new(MergeIterator::new(sources))
            .map(|(k, _)| k)
            .take_while(|k| k.as_ref() < end)
            .collect();
        self.leave();

        for key in keys {
            if !self.del(&key) {
                return false;
            }
        }
        true
    }

    /// Flushes and fsyncs the WAL.
    pub fn sync(&self) -> Result<(), EngineError> {
        let mut g = self.shared.lock();
        g.wal.flush_sync_wait()?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Iteration
    // --------------------------------------------------------------------------------------------

    /// Ordered, tombstone-aware iterator positioned at `seek`'s target
    /// (or the first key). Holds this handle exclusively; compaction can
    /// proceed while it runs — the iterator re-snapshots the view when
    /// the engine rotates past it.
    pub fn iter(&mut self) -> EngineIter<'_> {
        self.enter();
        let mut it = EngineIter {
            handle: self,
            merge: None,
            last: None,
        };
        it.rebuild(Bound::Unbounded);
        it
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shared.qsbr.unregister(&self.slot);
    }
}

// ------------------------------------------------------------------------------------------------
// EngineIter
// ------------------------------------------------------------------------------------------------

/// Ordered iterator over the full (wmt ∪ imt ∪ version) key universe.
pub struct EngineIter<'h> {
    handle: &'h mut EngineHandle,
    merge: Option<MergeIterator>,
    last: Option<Bytes>,
}

impl EngineIter<'_> {
    /// Repositions at the first key `>= key`.
    pub fn seek(&mut self, key: &[u8]) {
        self.last = None;
        self.rebuild(Bound::Included(key));
    }

    fn rebuild(&mut self, bound: Bound<&[u8]>) {
        self.handle.enter();
        let sources = build_sources(&self.handle.view, &self.handle.version, bound);
        self.merge = Some(MergeIterator::new(sources));
    }

    /// Whether the engine's view advanced past this iterator's snapshot.
    fn stale(&self) -> bool {
        self.handle.shared.r#gen.load(Ordering::SeqCst) != self.handle.cached_gen
    }
}

impl Iterator for EngineIter<'_> {
    type Item = (Bytes, Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.stale() || self.merge.is_none() {
                // Tear down and rebuild against the new view, resuming
                // just past the last yielded key.
                let last = self.last.clone();
                match &last {
                    Some(k) => self.rebuild(Bound::Excluded(k.as_ref())),
                    None => self.rebuild(Bound::Unbounded),
                }
            }
            let merge = self.merge.as_mut().expect("streams built");
            let item = merge.next_unique()?;
            self.last = Some(item.key.clone());
            if item.tombstone {
                continue;
            }
            return Some((item.key, item.value));
        }
    }
}

impl Drop for EngineIter<'_> {
    fn drop(&mut self) {
        self.handle.leave();
    }
}

/// Assembles the ranked sources for a merge over one view snapshot.
fn build_sources(
    view: &Arc<MtView>,
    version: &Arc<Version>,
    bound: Bound<&[u8]>,
) -> Vec<RankedSource> {
    let owned_bound = |b: Bound<&[u8]>| match b {
        Bound::Included(k) => Bound::Included(Bytes::copy_from_slice(k)),
        Bound::Excluded(k) => Bound::Excluded(Bytes::copy_from_slice(k)),
        Bound::Unbounded => Bound::Unbounded,
    };

    let mut sources: Vec<RankedSource> = Vec::with_capacity(3);
    sources.push((
        0,
        Box::new(VersionIter::new(Arc::clone(version), bound))
            as Box<dyn Iterator<Item = KvItem> + Send>,
    ));
    if let Some(imt) = &view.imt {
        sources.push((
            1,
            Box::new(
                MemIter::new(imt, owned_bound(bound), Bound::Unbounded)
                    .map(mem_to_item),
            ),
        ));
    }
    sources.push((
        2,
        Box::new(
            MemIter::new(&view.wmt, owned_bound(bound), Bound::Unbounded)
                .map(mem_to_item),
        ),
    ));
    sources
}

fn mem_to_item((key, entry): (Bytes, MemEntry)) -> KvItem {
    KvItem {
        key,
        value: entry.value,
        tombstone: entry.tombstone,
    }
}
