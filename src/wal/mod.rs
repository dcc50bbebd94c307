//! # Write-Ahead Log Module
//!
//! Durable, ordered, crash-safe append of every memtable-visible mutation,
//! rotating between the two files `wal1` and `wal2`.
//!
//! ## Design Overview
//!
//! Exactly one file is *current* at any time. Records are encoded into a
//! page-sized in-memory buffer; full (or explicitly flushed) buffers are
//! zero-padded to a page boundary and handed to a dedicated I/O thread —
//! the *write ring* — over a bounded channel. Ordering is preserved
//! because the ring is FIFO and every submission targets an ascending,
//! non-overlapping offset of the current file.
//!
//! Rotation ([`Wal::switch`]) happens once per compaction: the ring is
//! drained, the file roles swap, and the new current file is stamped with
//! the table version it pairs with. The retired file is truncated only
//! after the compaction's durability sequence completes
//! ([`Wal::truncate_retired`]).
//!
//! # On-disk layout
//!
//! ```text
//! [version u64 LE][zero padding to PGSZ]
//! [record][record]...[zero padding to PGSZ]
//! [record]...
//! ```
//!
//! Each record is:
//!
//! ```text
//! varint klen
//! varint vlen        (bit 16 = tombstone flag; effective length = vlen & 0xFFFF)
//! key bytes
//! value bytes
//! u32 crc32c(key) LE
//! ```
//!
//! Replay skips zero padding between records. A zero first byte is
//! ambiguous — it may open a legal empty-key record — so replay attempts a
//! record parse first and falls back to padding only when the key CRC does
//! not verify (zero padding never does: the empty key's CRC is the seed).
//!
//! # Guarantees
//!
//! - **Durability:** [`Wal::flush_sync_wait`] returns only after all
//!   submitted writes and an fsync have completed. Unacked writes beyond
//!   [`WAL_SYNC_SIZE`] trigger an opportunistic fsync.
//! - **Corruption detection:** replay halts a file at the first record
//!   whose CRC fails or whose length overflows the file.
//! - **Truncation safety:** a file is only truncated after every record in
//!   it is durably stored in a published table version or re-logged in the
//!   other file.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, bounded};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{get_varint_u32, put_varint_u32, varint_u32_len};
use crate::kv::{KvRecord, VLEN_TS, key_crc};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Page size; every buffer submission is a multiple of this.
pub const WAL_PGSZ: usize = 4096;

/// In-memory append buffer size (a fixed multiple of the page size).
pub const WAL_BUFSZ: usize = 256 * 1024;

/// Unacked write volume that triggers an opportunistic fsync.
pub const WAL_SYNC_SIZE: u64 = 64 << 20;

/// The two rotating file names.
pub const WAL_FILES: [&str; 2] = ["wal1", "wal2"];

/// Size of the leading version stamp.
const WAL_VERSION_SIZE: usize = 8;

/// Write-ring channel depth.
const RING_DEPTH: usize = 64;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The write ring reported an I/O failure; durability can no longer
    /// be guaranteed and the engine treats this as fatal.
    #[error("write ring failed: {0}")]
    RingFailed(String),
}

// ------------------------------------------------------------------------------------------------
// Record codec
// ------------------------------------------------------------------------------------------------

/// Encoded size of `rec` in the WAL record format.
fn record_encoded_len(rec: &KvRecord) -> usize {
    let vlen = if rec.tombstone { 0 } else { rec.value.len() };
    varint_u32_len(rec.key.len() as u32)
        + varint_u32_len(rec.vlen_ts())
        + rec.key.len()
        + vlen
        + 4
}

/// Appends the encoded record to `buf`.
fn encode_record_into(buf: &mut Vec<u8>, rec: &KvRecord) {
    put_varint_u32(buf, rec.key.len() as u32);
    put_varint_u32(buf, rec.vlen_ts());
    buf.extend_from_slice(&rec.key);
    if !rec.tombstone {
        buf.extend_from_slice(&rec.value);
    }
    buf.extend_from_slice(&rec.key_crc().to_le_bytes());
}

/// Attempts to decode one record from the front of `buf`.
///
/// Returns `None` on truncation, malformed lengths, or a key-CRC mismatch
/// — all of which replay treats as "no record here".
fn parse_record(buf: &[u8]) -> Option<(KvRecord, usize)> {
    let (klen, a) = get_varint_u32(buf)?;
    let (vlen_ts, b) = get_varint_u32(&buf[a..])?;
    if vlen_ts & !(VLEN_TS | 0xFFFF) != 0 {
        return None;
    }
    let klen = klen as usize;
    let vlen = (vlen_ts & 0xFFFF) as usize;
    let tombstone = vlen_ts & VLEN_TS != 0;
    if !KvRecord::size_ok(klen, vlen) {
        return None;
    }
    let body = a + b;
    let need = body + klen + vlen + 4;
    if buf.len() < need {
        return None;
    }
    let key = &buf[body..body + klen];
    let value = &buf[body + klen..body + klen + vlen];
    let stored = u32::from_le_bytes(buf[need - 4..need].try_into().unwrap());
    if stored != key_crc(key) {
        return None;
    }
    Some((
        KvRecord::from_parts(
            Bytes::copy_from_slice(key),
            Bytes::copy_from_slice(value),
            tombstone,
        ),
        need,
    ))
}

fn align_up(v: usize, to: usize) -> usize {
    v.div_ceil(to) * to
}

// ------------------------------------------------------------------------------------------------
// Write ring
// ------------------------------------------------------------------------------------------------

enum RingJob {
    Write { file: usize, off: u64, buf: Vec<u8> },
    Sync { file: usize },
    Barrier(Sender<()>),
}

/// Dedicated I/O thread that applies writes and fsyncs in submission
/// order. A failure latches [`WriteRing::failed`]; subsequent I/O is
/// skipped and the next barrier reports the failure to the caller.
struct WriteRing {
    tx: Option<Sender<RingJob>>,
    worker: Option<JoinHandle<()>>,
    failed: Arc<AtomicBool>,
}

impl WriteRing {
    fn spawn(files: [File; 2]) -> Result<Self, WalError> {
        let (tx, rx): (Sender<RingJob>, Receiver<RingJob>) = bounded(RING_DEPTH);
        let failed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failed);

        let worker = std::thread::Builder::new()
            .name("remusdb-wal-ring".into())
            .spawn(move || {
                for job in rx {
                    match job {
                        RingJob::Write { file, off, buf } => {
                            if flag.load(Ordering::SeqCst) {
                                continue;
                            }
                            if let Err(e) = files[file].write_all_at(&buf, off) {
                                error!(file, off, error = %e, "wal ring write failed");
                                flag.store(true, Ordering::SeqCst);
                            }
                        }
                        RingJob::Sync { file } => {
                            if flag.load(Ordering::SeqCst) {
                                continue;
                            }
                            if let Err(e) = files[file].sync_data() {
                                error!(file, error = %e, "wal ring fsync failed");
                                flag.store(true, Ordering::SeqCst);
                            }
                        }
                        RingJob::Barrier(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })
            .map_err(WalError::Io)?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            failed,
        })
    }

    fn submit(&self, job: RingJob) -> Result<(), WalError> {
        self.tx
            .as_ref()
            .expect("ring alive")
            .send(job)
            .map_err(|_| WalError::RingFailed("ring thread exited".into()))
    }

    /// Drains the ring, then reports any latched failure.
    fn wait(&self) -> Result<(), WalError> {
        let (done_tx, done_rx) = bounded(1);
        self.submit(RingJob::Barrier(done_tx))?;
        done_rx
            .recv()
            .map_err(|_| WalError::RingFailed("ring thread exited".into()))?;
        if self.failed.load(Ordering::SeqCst) {
            return Err(WalError::RingFailed("write or fsync failed".into()));
        }
        Ok(())
    }
}

impl Drop for WriteRing {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(w) = self.worker.take() {
            let _ = w.join();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Replay
// ------------------------------------------------------------------------------------------------

/// Per-file replay outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplaySummary {
    /// Records replayed from the retired (older) file.
    pub old_records: usize,

    /// Records replayed from the current (newer) file.
    pub cur_records: usize,
}

/// Replays one file, driving each valid record through `apply`.
///
/// Returns the byte offset just past the last valid record.
fn replay_file(file: &File, mut apply: impl FnMut(KvRecord)) -> Result<u64, WalError> {
    let mut data = Vec::new();
    let mut f = file.try_clone()?;
    f.seek(SeekFrom::Start(0))?;
    f.read_to_end(&mut data)?;

    let mut pos = WAL_PGSZ.min(data.len());
    let mut valid_end = pos;
    let mut count = 0usize;

    while pos < data.len() {
        if data[pos] == 0 {
            // Either an empty-key record or padding; the key CRC decides.
            if let Some((rec, n)) = parse_record(&data[pos..]) {
                apply(rec);
                count += 1;
                pos += n;
                valid_end = pos;
                continue;
            }
            pos = align_up(pos + 1, WAL_PGSZ);
            continue;
        }
        match parse_record(&data[pos..]) {
            Some((rec, n)) => {
                apply(rec);
                count += 1;
                pos += n;
                valid_end = pos;
            }
            None => {
                warn!(offset = pos, "wal replay halted at corrupt or truncated record");
                break;
            }
        }
    }

    debug!(records = count, valid_end, "wal file replayed");
    Ok(valid_end as u64)
}

/// Reads a file's leading version stamp; 0 for files too short to carry one.
fn read_version(file: &File) -> Result<(u64, u64), WalError> {
    let len = file.metadata()?.len();
    if len < WAL_VERSION_SIZE as u64 {
        return Ok((0, len));
    }
    let mut b = [0u8; WAL_VERSION_SIZE];
    file.read_exact_at(&mut b, 0)?;
    Ok((u64::from_le_bytes(b), len))
}

/// Writes a fresh header page stamping `version`, then fsyncs.
fn stamp_header(file: &File, version: u64) -> Result<(), WalError> {
    file.set_len(0)?;
    let mut page = vec![0u8; WAL_PGSZ];
    page[..WAL_VERSION_SIZE].copy_from_slice(&version.to_le_bytes());
    file.write_all_at(&page, 0)?;
    file.sync_data()?;
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

/// The two-file rotating write-ahead log.
///
/// All methods take `&mut self`; the engine serializes access through its
/// write lock.
pub struct Wal {
    files: [File; 2],
    versions: [u64; 2],
    cur: usize,
    buf: Vec<u8>,
    write_off: u64,
    sync_off: u64,
    ring: WriteRing,
}

impl Wal {
    /// Opens (or creates) the WAL pair in `dir` and replays any surviving
    /// records.
    ///
    /// Both file headers are inspected; non-empty files are replayed in
    /// ascending version order (ties break to `wal1`), and the
    /// highest-version file becomes current. `apply` receives each record
    /// with `newest = false` for records from the retired file — the
    /// engine re-logs the survivors among those into the current file
    /// before [`Wal::truncate_retired`] may run.
    ///
    /// Replay of a file halts at the first corrupt record; the invalid
    /// tail of the current file is zeroed so that a later replay cannot
    /// trip over it.
    pub fn open(
        dir: &Path,
        persisted_version: u64,
        mut apply: impl FnMut(bool, KvRecord),
    ) -> Result<(Self, ReplaySummary), WalError> {
        let mut files = Vec::with_capacity(2);
        for name in WAL_FILES {
            files.push(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(dir.join(name))?,
            );
        }
        let files: [File; 2] = files.try_into().expect("two wal files");

        let mut versions = [0u64; 2];
        let mut lens = [0u64; 2];
        for i in 0..2 {
            let (v, len) = read_version(&files[i])?;
            versions[i] = v;
            lens[i] = len;
        }

        // A file more than one version behind the persisted table version
        // is provably stale: everything in it is durable in tables, and
        // replaying it could shadow newer table data through the memtable.
        let mut candidates: Vec<usize> = Vec::new();
        for i in 0..2 {
            if lens[i] == 0 {
                continue;
            }
            if versions[i] + 1 < persisted_version {
                warn!(
                    file = WAL_FILES[i],
                    version = versions[i],
                    persisted_version,
                    "discarding stale wal file"
                );
                files[i].set_len(0)?;
                files[i].sync_data()?;
                versions[i] = 0;
                continue;
            }
            candidates.push(i);
        }
        candidates.sort_by_key(|&i| (versions[i], i));

        let mut summary = ReplaySummary::default();
        let cur = match candidates.last() {
            Some(&c) => c,
            None => {
                stamp_header(&files[0], persisted_version)?;
                versions[0] = persisted_version;
                0
            }
        };

        let mut cur_valid_end = WAL_PGSZ as u64;
        for &idx in &candidates {
            let newest = idx == cur;
            let mut n = 0usize;
            let end = replay_file(&files[idx], |rec| {
                n += 1;
                apply(newest, rec);
            })?;
            if newest {
                summary.cur_records = n;
                cur_valid_end = end.max(WAL_PGSZ as u64);
            } else {
                summary.old_records = n;
            }
            info!(
                file = WAL_FILES[idx],
                version = versions[idx],
                records = n,
                "wal file replayed"
            );
        }

        let write_off = align_up(cur_valid_end as usize, WAL_PGSZ) as u64;
        if lens[cur] > cur_valid_end {
            // Zero the invalid tail so replay never trips over it again.
            let pad = (write_off - cur_valid_end) as usize;
            if pad > 0 {
                files[cur].write_all_at(&vec![0u8; pad], cur_valid_end)?;
            }
            files[cur].set_len(write_off)?;
            files[cur].sync_data()?;
        }

        if versions[cur] < persisted_version {
            warn!(
                wal_version = versions[cur],
                persisted_version, "current wal is older than the persisted table version"
            );
        }

        let ring = WriteRing::spawn([files[0].try_clone()?, files[1].try_clone()?])?;

        info!(
            current = WAL_FILES[cur],
            version = versions[cur],
            write_off,
            "wal opened"
        );

        Ok((
            Self {
                files,
                versions,
                cur,
                buf: Vec::with_capacity(WAL_BUFSZ),
                write_off,
                sync_off: write_off,
                ring,
            },
            summary,
        ))
    }

    /// Copies the encoded record into the append buffer, flushing the
    /// buffer to the ring first when the record does not fit.
    pub fn append(&mut self, rec: &KvRecord) -> Result<(), WalError> {
        let need = record_encoded_len(rec);
        debug_assert!(need <= WAL_BUFSZ);
        if self.buf.len() + need > WAL_BUFSZ {
            self.flush_buf()?;
        }
        encode_record_into(&mut self.buf, rec);
        trace!(klen = rec.key.len(), vlen = rec.value.len(), "wal record appended");
        Ok(())
    }

    /// Zero-pads and submits the partial buffer.
    pub fn flush(&mut self) -> Result<(), WalError> {
        self.flush_buf()
    }

    /// Flush, then enqueue an fsync without waiting for it.
    pub fn flush_sync(&mut self) -> Result<(), WalError> {
        self.flush_buf()?;
        self.ring.submit(RingJob::Sync { file: self.cur })?;
        self.sync_off = self.write_off;
        Ok(())
    }

    /// Flush, fsync, and drain the ring.
    pub fn flush_sync_wait(&mut self) -> Result<(), WalError> {
        self.flush_sync()?;
        self.ring.wait()
    }

    /// Drains the ring without submitting new work; used to await a
    /// previously enqueued fsync.
    pub fn sync_wait(&mut self) -> Result<(), WalError> {
        self.ring.wait()
    }

    /// Rotates to the other file, stamping it with `version`.
    ///
    /// Drains the ring first so no write can land on the retiring file
    /// afterwards. Returns the size of the just-retired file.
    pub fn switch(&mut self, version: u64) -> Result<u64, WalError> {
        self.flush_sync_wait()?;
        let retired = self.write_off;

        self.cur ^= 1;
        self.versions[self.cur] = version;
        stamp_header(&self.files[self.cur], version)?;
        self.write_off = WAL_PGSZ as u64;
        self.sync_off = self.write_off;

        info!(
            current = WAL_FILES[self.cur],
            version, retired, "wal switched"
        );
        Ok(retired)
    }

    /// Truncates the retired (non-current) file to zero and fdatasyncs.
    ///
    /// Only legal once every record in it is durable elsewhere.
    pub fn truncate_retired(&mut self) -> Result<(), WalError> {
        let other = self.cur ^ 1;
        self.files[other].set_len(0)?;
        self.files[other].sync_data()?;
        self.versions[other] = 0;
        debug!(file = WAL_FILES[other], "retired wal truncated");
        Ok(())
    }

    /// Logical size of the current file, buffered bytes included.
    pub fn write_off(&self) -> u64 {
        self.write_off + self.buf.len() as u64
    }

    /// Version stamped into the current file.
    pub fn current_version(&self) -> u64 {
        self.versions[self.cur]
    }

    fn flush_buf(&mut self) -> Result<(), WalError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let padded = align_up(self.buf.len(), WAL_PGSZ);
        self.buf.resize(padded, 0);
        let data = std::mem::replace(&mut self.buf, Vec::with_capacity(WAL_BUFSZ));
        self.ring.submit(RingJob::Write {
            file: self.cur,
            off: self.write_off,
            buf: data,
        })?;
        self.write_off += padded as u64;

        if self.write_off - self.sync_off >= WAL_SYNC_SIZE {
            self.ring.submit(RingJob::Sync { file: self.cur })?;
            self.sync_off = self.write_off;
        }
        Ok(())
    }
}
