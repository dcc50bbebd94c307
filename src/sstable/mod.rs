//! # SSTable Module
//!
//! Immutable, sorted on-disk tables, grouped into anchor-partitioned,
//! reference-counted **versions**, plus the compaction machinery that
//! produces new versions.
//!
//! ## Design Overview
//!
//! Each table is a pair of files:
//!
//! - `NNNNNN.sstx` — the data file: a sequence of CRC32C-framed blocks of
//!   sorted entries, optionally prefix-compressed.
//! - `NNNNNN.ssty` — the range index: per-block first keys and offsets,
//!   an optional per-key hash-tag filter for point lookups, and table
//!   properties. Loaded fully into memory at open; the data file is
//!   memory-mapped.
//!
//! A **version** is an ordered sequence of partitions `[kᵢ, kᵢ₊₁)` keyed
//! by anchor keys, each owning at most one table. Versions are published
//! atomically (temp + rename of a `.ver` descriptor, `HEAD` symlink
//! update) and shared via `Arc`; superseded tables are unlinked when the
//! last reader drops them.
//!
//! # Sub-modules
//!
//! - [`builder`] — [`TableBuilder`] for writing table file pairs.
//! - [`iterator`] — block, table, and version iterators.
//! - [`version`] — version descriptors, `HEAD` management, [`SstStore`].
//! - [`compact`] — partition planning and the accept/reject rewrite.
//!
//! # Concurrency model
//!
//! Tables and versions are immutable after construction; reads are
//! lock-free. [`SstStore`] guards only the current-version pointer.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod builder;
pub mod compact;
pub mod iterator;
pub mod version;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Re-exports — public API surface
// ------------------------------------------------------------------------------------------------

pub use builder::TableBuilder;
pub use compact::CompactOutcome;
pub use iterator::{TableIter, VersionIter};
pub use version::{Partition, SstStore, Version};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bloomfilter::Bloom;
use bytes::Bytes;
use memmap2::Mmap;
use thiserror::Error;
use tracing::warn;

use crate::codec::{crc32c_seeded, get_varint_u32};
use crate::kv::{KeyRef, VLEN_TS};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Target uncompressed size of one data block.
pub(crate) const SST_BLOCK_SIZE: usize = 4096;

/// Output size at which an accepted-partition rewrite splits, adding a
/// new anchor.
pub(crate) const SST_SPLIT_SIZE: u64 = 16 << 20;

/// False-positive rate for the per-key hash-tag filter.
pub(crate) const SST_TAG_FP_RATE: f64 = 0.01;

pub(crate) const SSTY_MAGIC: [u8; 4] = *b"RSTY";
pub(crate) const SSTY_VERSION: u32 = 1;
pub(crate) const SSTY_FLAG_CKEYS: u32 = 1 << 0;
pub(crate) const SSTY_FLAG_TAGS: u32 = 1 << 1;

/// Framing overhead of one data block: length prefix + trailing CRC.
pub(crate) const SST_BLOCK_FRAME: usize = 8;

/// Data file extension.
pub(crate) const SSTX_EXT: &str = "sstx";

/// Index file extension.
pub(crate) const SSTY_EXT: &str = "ssty";

pub(crate) fn sstx_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:06}.{SSTX_EXT}"))
}

pub(crate) fn ssty_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:06}.{SSTY_EXT}"))
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by table and version operations.
#[derive(Debug, Error)]
pub enum SstError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A file failed structural or checksum validation.
    #[error("corrupt table data: {0}")]
    Corrupt(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Table structures
// ------------------------------------------------------------------------------------------------

/// Location of one data block inside the `.sstx` file.
#[derive(Debug, Clone)]
pub(crate) struct BlockHandle {
    /// First key of the block.
    pub(crate) first_key: Bytes,

    /// Offset of the block frame in the data file.
    pub(crate) off: u64,

    /// Length of the whole frame (length prefix + data + CRC).
    pub(crate) len: u32,
}

/// Table-level properties carried in the `.ssty` file.
#[derive(Debug, Clone, Default)]
pub struct TableProps {
    /// Total records, tombstones included.
    pub record_count: u64,

    /// Point tombstones.
    pub tombstone_count: u64,

    /// Size of the data file in bytes.
    pub data_size: u64,

    /// Smallest key in the table.
    pub min_key: Bytes,

    /// Largest key in the table.
    pub max_key: Bytes,
}

/// Result of a table point lookup that observes tombstones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableGet {
    /// Key present with a live value.
    Put(Bytes),

    /// Key deleted by a stored tombstone.
    Tombstone,

    /// Key not present in this table.
    Miss,
}

/// One immutable on-disk table: a memory-mapped data file plus its
/// in-memory range index.
pub struct Table {
    /// Table id; names both files.
    pub id: u64,

    dir: PathBuf,
    data: Mmap,
    index: Vec<BlockHandle>,
    tags: Option<Bloom<u32>>,
    ckeys: bool,

    /// Table properties from the index file.
    pub props: TableProps,

    /// Set when a newer version supersedes this table; the files are
    /// unlinked when the last reference drops.
    obsolete: AtomicBool,
}

impl Table {
    /// Opens a table pair by id: parses and verifies `NNNNNN.ssty`, then
    /// memory-maps `NNNNNN.sstx`.
    pub fn open(dir: &Path, id: u64) -> Result<Self, SstError> {
        let ssty = std::fs::read(ssty_path(dir, id))?;
        let parsed = parse_ssty(&ssty, id)?;

        let data_file = File::open(sstx_path(dir, id))?;
        let data = unsafe { Mmap::map(&data_file)? };
        if (data.len() as u64) < parsed.props.data_size {
            return Err(SstError::Corrupt(format!(
                "table {id}: data file shorter than index claims"
            )));
        }

        Ok(Self {
            id,
            dir: dir.to_path_buf(),
            data,
            index: parsed.index,
            tags: parsed.tags,
            ckeys: parsed.ckeys,
            props: parsed.props,
            obsolete: AtomicBool::new(false),
        })
    }

    /// Point lookup observing tombstones.
    pub fn get_ts(&self, kref: KeyRef<'_>) -> Result<TableGet, SstError> {
        if self.index.is_empty() {
            return Ok(TableGet::Miss);
        }
        if let Some(tags) = &self.tags {
            if !tags.check(&kref.crc) {
                return Ok(TableGet::Miss);
            }
        }

        let Some(block_idx) = self.block_for(kref.key) else {
            return Ok(TableGet::Miss);
        };
        let block = self.block_data(block_idx)?;

        let mut cursor = BlockCursor::new(&block, self.ckeys);
        while let Some(entry) = cursor.next_entry()? {
            match entry.key.as_slice().cmp(kref.key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => {
                    return Ok(if entry.tombstone {
                        TableGet::Tombstone
                    } else {
                        TableGet::Put(Bytes::copy_from_slice(entry.value))
                    });
                }
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(TableGet::Miss)
    }

    /// Index of the block that may contain `key`, or `None` when `key`
    /// sorts before the table.
    pub(crate) fn block_for(&self, key: &[u8]) -> Option<usize> {
        let n = self
            .index
            .partition_point(|b| b.first_key.as_ref() <= key);
        n.checked_sub(1)
    }

    /// Number of data blocks.
    pub(crate) fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Decodes and CRC-verifies block `idx`, returning its entry bytes.
    pub(crate) fn block_data(&self, idx: usize) -> Result<Vec<u8>, SstError> {
        let h = &self.index[idx];
        let start = h.off as usize;
        let end = start + h.len as usize;
        if end > self.data.len() || (h.len as usize) < SST_BLOCK_FRAME {
            return Err(SstError::Corrupt(format!(
                "table {}: block {idx} frame out of bounds",
                self.id
            )));
        }
        let frame = &self.data[start..end];
        let data_len = u32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
        if data_len + SST_BLOCK_FRAME != frame.len() {
            return Err(SstError::Corrupt(format!(
                "table {}: block {idx} length mismatch",
                self.id
            )));
        }
        let data = &frame[4..4 + data_len];
        let stored = u32::from_le_bytes(frame[4 + data_len..].try_into().unwrap());
        if stored != crc32c_seeded(data) {
            return Err(SstError::Corrupt(format!(
                "table {}: block {idx} checksum mismatch",
                self.id
            )));
        }
        Ok(data.to_vec())
    }

    pub(crate) fn ckeys(&self) -> bool {
        self.ckeys
    }

    /// Combined on-disk size of the table pair.
    pub fn file_size(&self) -> u64 {
        let ssty = std::fs::metadata(ssty_path(&self.dir, self.id))
            .map(|m| m.len())
            .unwrap_or(0);
        self.props.data_size + ssty
    }

    /// Marks the table for deletion once the last reference drops.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::SeqCst);
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::SeqCst) {
            for path in [sstx_path(&self.dir, self.id), ssty_path(&self.dir, self.id)] {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to unlink obsolete table file");
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Block entry cursor
// ------------------------------------------------------------------------------------------------

/// A borrowed view of one block entry.
pub(crate) struct BlockEntry<'a> {
    /// Reconstructed key (borrowed from the cursor's key buffer).
    pub(crate) key: &'a Vec<u8>,

    /// Value bytes, borrowed from the block.
    pub(crate) value: &'a [u8],

    pub(crate) tombstone: bool,
}

/// Sequential decoder over one block's entry bytes.
///
/// With prefix compression the key is reconstructed incrementally into an
/// internal buffer; without it the buffer simply holds a copy of the
/// current key.
pub(crate) struct BlockCursor<'b> {
    data: &'b [u8],
    pos: usize,
    ckeys: bool,
    key_buf: Vec<u8>,
    value: (usize, usize),
    tombstone: bool,
}

impl<'b> BlockCursor<'b> {
    pub(crate) fn new(data: &'b [u8], ckeys: bool) -> Self {
        Self {
            data,
            pos: 0,
            ckeys,
            key_buf: Vec::new(),
            value: (0, 0),
            tombstone: false,
        }
    }

    /// Advances to the next entry; `None` at end of block.
    pub(crate) fn next_entry(&mut self) -> Result<Option<BlockEntry<'_>>, SstError> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let corrupt = || SstError::Corrupt("malformed block entry".into());

        let mut shared = 0usize;
        if self.ckeys {
            let (s, n) = get_varint_u32(&self.data[self.pos..]).ok_or_else(corrupt)?;
            self.pos += n;
            shared = s as usize;
            if shared > self.key_buf.len() {
                return Err(corrupt());
            }
        }
        let (rest, n) = get_varint_u32(&self.data[self.pos..]).ok_or_else(corrupt)?;
        self.pos += n;
        let (vlen_ts, n) = get_varint_u32(&self.data[self.pos..]).ok_or_else(corrupt)?;
        self.pos += n;

        let rest = rest as usize;
        let vlen = (vlen_ts & 0xFFFF) as usize;
        if self.pos + rest + vlen > self.data.len() {
            return Err(corrupt());
        }

        self.key_buf.truncate(shared);
        self.key_buf
            .extend_from_slice(&self.data[self.pos..self.pos + rest]);
        self.pos += rest;
        self.value = (self.pos, vlen);
        self.pos += vlen;
        self.tombstone = vlen_ts & VLEN_TS != 0;

        Ok(Some(BlockEntry {
            key: &self.key_buf,
            value: &self.data[self.value.0..self.value.0 + self.value.1],
            tombstone: self.tombstone,
        }))
    }
}

// ------------------------------------------------------------------------------------------------
// .ssty parsing
// ------------------------------------------------------------------------------------------------

pub(crate) struct ParsedSsty {
    pub(crate) index: Vec<BlockHandle>,
    pub(crate) tags: Option<Bloom<u32>>,
    pub(crate) ckeys: bool,
    pub(crate) props: TableProps,
}

pub(crate) fn parse_ssty(buf: &[u8], id: u64) -> Result<ParsedSsty, SstError> {
    let corrupt = |what: &str| SstError::Corrupt(format!("table {id}: {what}"));

    if buf.len() < 4 + 4 {
        return Err(corrupt("index file too short"));
    }
    let (body, crc_bytes) = buf.split_at(buf.len() - 4);
    let stored = u32::from_le_bytes(crc_bytes.try_into().unwrap());
    if stored != crc32c_seeded(body) {
        return Err(corrupt("index checksum mismatch"));
    }

    let mut r = SstyReader { buf: body, pos: 0 };
    if r.take(4)? != SSTY_MAGIC.as_slice() {
        return Err(corrupt("bad magic"));
    }
    let fmt = r.u32()?;
    if fmt != SSTY_VERSION {
        return Err(corrupt("unsupported format version"));
    }
    let flags = r.u32()?;
    let file_id = r.u64()?;
    if file_id != id {
        return Err(corrupt("id mismatch"));
    }

    let mut props = TableProps {
        data_size: r.u64()?,
        record_count: r.u64()?,
        tombstone_count: r.u64()?,
        ..Default::default()
    };

    let block_count = r.u32()? as usize;
    let mut index = Vec::with_capacity(block_count);
    for _ in 0..block_count {
        let first_key = r.bytes_varint()?;
        let off = r.u64()?;
        let len = r.u32()?;
        index.push(BlockHandle {
            first_key: Bytes::copy_from_slice(first_key),
            off,
            len,
        });
    }

    let tag_len = r.u32()? as usize;
    let tags = if tag_len > 0 {
        let raw = r.take(tag_len)?;
        match Bloom::from_slice(raw) {
            Ok(b) => Some(b),
            Err(_) => {
                // A damaged filter only costs speed, never correctness.
                warn!(table = id, "ignoring unreadable tag filter");
                None
            }
        }
    } else {
        None
    };

    props.min_key = Bytes::copy_from_slice(r.bytes_varint()?);
    props.max_key = Bytes::copy_from_slice(r.bytes_varint()?);

    Ok(ParsedSsty {
        index,
        tags,
        ckeys: flags & SSTY_FLAG_CKEYS != 0,
        props,
    })
}

struct SstyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SstyReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], SstError> {
        if self.pos + n > self.buf.len() {
            return Err(SstError::Corrupt("truncated index file".into()));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u32(&mut self) -> Result<u32, SstError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, SstError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes_varint(&mut self) -> Result<&'a [u8], SstError> {
        let (len, n) = get_varint_u32(&self.buf[self.pos..])
            .ok_or_else(|| SstError::Corrupt("truncated index file".into()))?;
        self.pos += n;
        self.take(len as usize)
    }
}
