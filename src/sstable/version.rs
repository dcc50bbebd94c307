//! Version descriptors, atomic publication, and the table store.
//!
//! A version is a reference-counted snapshot of the on-disk sorted run:
//! an ordered list of anchor-keyed partitions, each owning at most one
//! table. Versions are immutable; compaction builds the successor and
//! publishes it by writing `NNNNNN.ver` (temp + rename) and repointing
//! the `HEAD` symlink (`HEAD1` keeps the predecessor). Readers hold
//! `Arc<Version>` clones; tables superseded by a publish are unlinked
//! when their last reference drops.
//!
//! # Version file format
//!
//! ```text
//! magic "RVER" | u32 format | u64 seq | u64 next_table_id | u32 nparts
//! per partition: varint anchor_len | anchor | u8 flags | u8 has_table | [u64 table_id]
//! u32 crc32c(everything above)
//! ```
//!
//! Flag bit 0 records the partition's compaction disposition: 0 =
//! accepted, 1 = rejected. The reinsert walk after a compaction reads
//! these dispositions from the freshly published version.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::codec::{crc32c_seeded, get_varint_u32, put_varint_u32};
use crate::kv::KeyRef;

use super::{SstError, SSTX_EXT, SSTY_EXT, Table, TableGet};

const VER_MAGIC: [u8; 4] = *b"RVER";
const VER_FORMAT: u32 = 1;
const VER_EXT: &str = "ver";
const FLAG_REJECTED: u8 = 1 << 0;

/// Live-version symlink name.
pub const HEAD: &str = "HEAD";

/// Previous-version symlink name.
pub const HEAD1: &str = "HEAD1";

fn ver_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(ver_name(seq))
}

fn ver_name(seq: u64) -> String {
    format!("{seq:06}.{VER_EXT}")
}

// ------------------------------------------------------------------------------------------------
// Partition & Version
// ------------------------------------------------------------------------------------------------

/// One anchor-keyed partition `[anchor, next_anchor)`.
pub struct Partition {
    /// First key of the partition's range. The first partition's anchor
    /// is always the empty key, so every key maps to some partition.
    pub anchor: Bytes,

    /// Disposition assigned by the compaction that produced this version:
    /// `true` when the partition kept its old table and its fresh keys
    /// were routed back to the write path.
    pub rejected: bool,

    /// The partition's table; `None` when nothing is stored in the range.
    pub table: Option<Arc<Table>>,
}

/// An immutable, shareable snapshot of the on-disk run.
pub struct Version {
    /// Monotonic version id.
    pub seq: u64,

    /// Next table id to allocate; persisted so ids never repeat.
    pub next_table_id: u64,

    /// Partitions in ascending anchor order.
    pub parts: Vec<Partition>,
}

impl Version {
    /// The empty bootstrap version: one anchor at the empty key, no table.
    pub fn empty(seq: u64) -> Self {
        Self {
            seq,
            next_table_id: 1,
            parts: vec![Partition {
                anchor: Bytes::new(),
                rejected: false,
                table: None,
            }],
        }
    }

    /// Index of the partition whose range contains `key`.
    pub fn part_for(&self, key: &[u8]) -> usize {
        let n = self.parts.partition_point(|p| p.anchor.as_ref() <= key);
        debug_assert!(n > 0, "first anchor is the empty key");
        n - 1
    }

    /// Exclusive end bound of partition `idx`.
    pub fn part_end(&self, idx: usize) -> Option<&Bytes> {
        self.parts.get(idx + 1).map(|p| &p.anchor)
    }

    /// Point lookup observing tombstones.
    pub fn get_ts(&self, kref: KeyRef<'_>) -> Result<TableGet, SstError> {
        let part = &self.parts[self.part_for(kref.key)];
        match &part.table {
            Some(t) => t.get_ts(kref),
            None => Ok(TableGet::Miss),
        }
    }

    /// Probe variant of [`Version::get_ts`].
    pub fn probe_ts(&self, kref: KeyRef<'_>) -> Result<bool, SstError> {
        Ok(matches!(self.get_ts(kref)?, TableGet::Put(_)))
    }

    /// The anchor array with per-partition dispositions.
    pub fn anchors(&self) -> impl Iterator<Item = (&Bytes, bool)> {
        self.parts.iter().map(|p| (&p.anchor, p.rejected))
    }

    /// Ids of every table referenced by this version.
    pub fn table_ids(&self) -> HashSet<u64> {
        self.parts
            .iter()
            .filter_map(|p| p.table.as_ref().map(|t| t.id))
            .collect()
    }

    /// Number of tables in this version.
    pub fn table_count(&self) -> usize {
        self.parts.iter().filter(|p| p.table.is_some()).count()
    }

    /// Total data bytes across all tables.
    pub fn data_size(&self) -> u64 {
        self.parts
            .iter()
            .filter_map(|p| p.table.as_ref())
            .map(|t| t.props.data_size)
            .sum()
    }
}

// ------------------------------------------------------------------------------------------------
// Version file codec
// ------------------------------------------------------------------------------------------------

/// Partition metadata as stored in a version file.
pub(crate) struct PartMeta {
    pub(crate) anchor: Bytes,
    pub(crate) rejected: bool,
    pub(crate) table_id: Option<u64>,
}

pub(crate) struct VerMeta {
    pub(crate) seq: u64,
    pub(crate) next_table_id: u64,
    pub(crate) parts: Vec<PartMeta>,
}

fn encode_version(v: &Version) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&VER_MAGIC);
    body.extend_from_slice(&VER_FORMAT.to_le_bytes());
    body.extend_from_slice(&v.seq.to_le_bytes());
    body.extend_from_slice(&v.next_table_id.to_le_bytes());
    body.extend_from_slice(&(v.parts.len() as u32).to_le_bytes());
    for p in &v.parts {
        put_varint_u32(&mut body, p.anchor.len() as u32);
        body.extend_from_slice(&p.anchor);
        body.push(if p.rejected { FLAG_REJECTED } else { 0 });
        match &p.table {
            Some(t) => {
                body.push(1);
                body.extend_from_slice(&t.id.to_le_bytes());
            }
            None => body.push(0),
        }
    }
    let crc = crc32c_seeded(&body);
    body.extend_from_slice(&crc.to_le_bytes());
    body
}

pub(crate) fn parse_version_file(buf: &[u8]) -> Result<VerMeta, SstError> {
    let corrupt = |what: &str| SstError::Corrupt(format!("version file: {what}"));
    if buf.len() < 8 {
        return Err(corrupt("too short"));
    }
    let (body, crc_bytes) = buf.split_at(buf.len() - 4);
    if u32::from_le_bytes(crc_bytes.try_into().unwrap()) != crc32c_seeded(body) {
        return Err(corrupt("checksum mismatch"));
    }
    if body.len() < 24 || body[..4] != VER_MAGIC {
        return Err(corrupt("bad magic"));
    }
    if u32::from_le_bytes(body[4..8].try_into().unwrap()) != VER_FORMAT {
        return Err(corrupt("unsupported format"));
    }
    let seq = u64::from_le_bytes(body[8..16].try_into().unwrap());
    let next_table_id = u64::from_le_bytes(body[16..24].try_into().unwrap());
    let nparts = u32::from_le_bytes(body[24..28].try_into().unwrap()) as usize;

    let mut pos = 28;
    let mut parts = Vec::with_capacity(nparts);
    for _ in 0..nparts {
        let (alen, n) = get_varint_u32(&body[pos..]).ok_or_else(|| corrupt("truncated anchor"))?;
        pos += n;
        let alen = alen as usize;
        if pos + alen + 2 > body.len() {
            return Err(corrupt("truncated partition"));
        }
        let anchor = Bytes::copy_from_slice(&body[pos..pos + alen]);
        pos += alen;
        let flags = body[pos];
        let has_table = body[pos + 1];
        pos += 2;
        let table_id = if has_table != 0 {
            if pos + 8 > body.len() {
                return Err(corrupt("truncated table id"));
            }
            let id = u64::from_le_bytes(body[pos..pos + 8].try_into().unwrap());
            pos += 8;
            Some(id)
        } else {
            None
        };
        parts.push(PartMeta {
            anchor,
            rejected: flags & FLAG_REJECTED != 0,
            table_id,
        });
    }
    if parts.is_empty() || !parts[0].anchor.is_empty() {
        return Err(corrupt("first anchor must be the empty key"));
    }
    Ok(VerMeta {
        seq,
        next_table_id,
        parts,
    })
}

// ------------------------------------------------------------------------------------------------
// SstStore
// ------------------------------------------------------------------------------------------------

/// The table store: owns the current version pointer, publication, the
/// compaction diagnostics log, and amplification counters.
pub struct SstStore {
    pub(crate) dir: PathBuf,
    current: RwLock<Arc<Version>>,
    log: Mutex<File>,
    pub(crate) ckeys: bool,
    pub(crate) tags: bool,
    stat_writes: AtomicU64,
    stat_reads: AtomicU64,
}

impl SstStore {
    /// Opens the store in `dir`: loads the `HEAD` version (bootstrapping
    /// an empty one on first open) and sweeps orphan files.
    pub fn open(dir: &Path, ckeys: bool, tags: bool) -> Result<Self, SstError> {
        let version = match read_link_name(&dir.join(HEAD)) {
            Some(name) => {
                let meta = parse_version_file(&fs::read(dir.join(&name))?)?;
                let mut parts = Vec::with_capacity(meta.parts.len());
                for pm in meta.parts {
                    let table = match pm.table_id {
                        Some(id) => Some(Arc::new(Table::open(dir, id)?)),
                        None => None,
                    };
                    parts.push(Partition {
                        anchor: pm.anchor,
                        rejected: pm.rejected,
                        table,
                    });
                }
                info!(seq = meta.seq, parts = parts.len(), "version loaded");
                Arc::new(Version {
                    seq: meta.seq,
                    next_table_id: meta.next_table_id,
                    parts,
                })
            }
            None => {
                let v = Version::empty(0);
                publish_version(dir, &v, None)?;
                info!("empty version bootstrapped");
                Arc::new(v)
            }
        };

        sweep_orphans(dir, &version)?;

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("LOG"))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            current: RwLock::new(version),
            log: Mutex::new(log),
            ckeys,
            tags,
            stat_writes: AtomicU64::new(0),
            stat_reads: AtomicU64::new(0),
        })
    }

    /// The live version.
    pub fn getv(&self) -> Arc<Version> {
        Arc::clone(&self.current.read().expect("version lock"))
    }

    /// Numeric id of the live version.
    pub fn version(&self) -> u64 {
        self.getv().seq
    }

    /// Swaps in a freshly published version.
    pub(crate) fn install(&self, v: Arc<Version>) {
        *self.current.write().expect("version lock") = v;
    }

    /// Bytes written into tables (write amplification counter).
    pub fn stat_writes(&self) -> u64 {
        self.stat_writes.load(Ordering::Relaxed)
    }

    /// Bytes served from tables (read amplification counter).
    pub fn stat_reads(&self) -> u64 {
        self.stat_reads.load(Ordering::Relaxed)
    }

    pub(crate) fn add_stat_writes(&self, n: u64) {
        self.stat_writes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_stat_reads(&self, n: u64) {
        self.stat_reads.fetch_add(n, Ordering::Relaxed);
    }

    /// Appends one line to the store's diagnostics log.
    pub(crate) fn log_line(&self, line: &str) {
        if let Ok(mut f) = self.log.lock() {
            let _ = writeln!(f, "{line}");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Publication & directory hygiene
// ------------------------------------------------------------------------------------------------

/// Writes the version file (temp + rename), repoints `HEAD`/`HEAD1`, and
/// fsyncs the directory so the publish survives a crash.
pub(crate) fn publish_version(
    dir: &Path,
    v: &Version,
    previous: Option<&Version>,
) -> Result<(), SstError> {
    let body = encode_version(v);
    let final_path = ver_path(dir, v.seq);
    let tmp_path = final_path.with_extension("ver.tmp");
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        f.write_all(&body)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, &final_path)?;

    set_symlink(dir, HEAD, &ver_name(v.seq))?;
    if let Some(prev) = previous {
        set_symlink(dir, HEAD1, &ver_name(prev.seq))?;
    }

    let dirf = File::open(dir)?;
    dirf.sync_all()?;

    debug!(seq = v.seq, parts = v.parts.len(), "version published");
    Ok(())
}

/// Atomically repoints `dir/name` at `target` (symlink to a temp name,
/// then rename over the old link).
fn set_symlink(dir: &Path, name: &str, target: &str) -> Result<(), SstError> {
    let tmp = dir.join(format!(".{name}.tmp"));
    let _ = fs::remove_file(&tmp);
    std::os::unix::fs::symlink(target, &tmp)?;
    fs::rename(&tmp, dir.join(name))?;
    Ok(())
}

fn read_link_name(path: &Path) -> Option<String> {
    fs::read_link(path)
        .ok()
        .and_then(|t| t.to_str().map(str::to_owned))
}

/// Removes table, version, and temp files not referenced by the live
/// version or its predecessor.
fn sweep_orphans(dir: &Path, live: &Version) -> Result<(), SstError> {
    let mut keep_tables = live.table_ids();
    let mut keep_vers: HashSet<String> = HashSet::new();
    keep_vers.insert(ver_name(live.seq));

    if let Some(prev_name) = read_link_name(&dir.join(HEAD1)) {
        if let Ok(buf) = fs::read(dir.join(&prev_name)) {
            if let Ok(meta) = parse_version_file(&buf) {
                keep_tables.extend(meta.parts.iter().filter_map(|p| p.table_id));
                keep_vers.insert(prev_name);
            }
        }
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        let orphan = match ext {
            "tmp" => true,
            SSTX_EXT | SSTY_EXT => name
                .split('.')
                .next()
                .and_then(|s| s.parse::<u64>().ok())
                .is_none_or(|id| !keep_tables.contains(&id)),
            VER_EXT => !keep_vers.contains(name),
            _ => false,
        };
        if orphan {
            warn!(path = %path.display(), "removing orphan file");
            let _ = fs::remove_file(&path);
        }
    }
    Ok(())
}
