//! Key-value record types and store-wide limits.
//!
//! A record is an owned (key, value) pair plus a 64-bit key hash and a
//! tombstone flag. The hash packs a CRC32C of the key into the low 32 bits
//! and the bitwise complement of that CRC into the high 32 bits, so a
//! corrupted hash is self-evident.
//!
//! [`KeyRef`] is the non-owning counterpart used on lookup paths: a borrowed
//! key slice plus its precomputed 32-bit CRC, so hashing happens once per
//! operation no matter how many layers are probed.

use bytes::Bytes;

use crate::codec::crc32c_seeded;

/// Maximum combined key + value length accepted by the public API.
pub const KV_SIZE_MAX: usize = 65_500;

/// Tombstone sentinel bit OR-ed into the on-disk `vlen` field.
///
/// The effective value length is `vlen & 0xFFFF`. A tombstone with a
/// non-zero residual length is reserved; readers never surface one.
pub const VLEN_TS: u32 = 0x1_0000;

/// Seed for every CRC32C in the store (key hashes, WAL records, blocks).
pub const CRC32C_SEED: u32 = 0xDEAD_BEEF;

/// Fixed per-entry overhead charged to the memtable size accounting, on
/// top of the raw key and value bytes.
pub const MEM_ENTRY_OVERHEAD: usize = 64;

/// 32-bit key CRC used in krefs and WAL record checksums.
pub fn key_crc(key: &[u8]) -> u32 {
    crc32c_seeded(key)
}

/// Expands a 32-bit key CRC into the 64-bit record hash.
pub fn key_hash64(crc: u32) -> u64 {
    (u64::from(!crc) << 32) | u64::from(crc)
}

// ------------------------------------------------------------------------------------------------
// KeyRef
// ------------------------------------------------------------------------------------------------

/// A non-owning key reference: borrowed bytes plus the key's CRC32C.
#[derive(Debug, Clone, Copy)]
pub struct KeyRef<'a> {
    /// Borrowed key bytes.
    pub key: &'a [u8],

    /// CRC32C of `key`, seeded with [`CRC32C_SEED`].
    pub crc: u32,
}

impl<'a> KeyRef<'a> {
    /// Builds a kref, computing the key CRC once.
    pub fn new(key: &'a [u8]) -> Self {
        Self {
            key,
            crc: key_crc(key),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// KvRecord
// ------------------------------------------------------------------------------------------------

/// An owned key-value record as it travels between the WAL, the memtable,
/// and the table writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvRecord {
    /// Key bytes.
    pub key: Bytes,

    /// Value bytes; empty for tombstones (and legally empty for puts).
    pub value: Bytes,

    /// Packed 64-bit key hash; see [`key_hash64`].
    pub hash: u64,

    /// Whether this record deletes its key.
    pub tombstone: bool,
}

impl KvRecord {
    /// Builds a put record, copying `key` and `value`.
    pub fn new(key: &[u8], value: &[u8]) -> Self {
        Self {
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
            hash: key_hash64(key_crc(key)),
            tombstone: false,
        }
    }

    /// Builds a tombstone record for `key`.
    pub fn new_tombstone(key: &[u8]) -> Self {
        Self {
            key: Bytes::copy_from_slice(key),
            value: Bytes::new(),
            hash: key_hash64(key_crc(key)),
            tombstone: true,
        }
    }

    /// Builds a record from already-owned buffers.
    pub fn from_parts(key: Bytes, value: Bytes, tombstone: bool) -> Self {
        let hash = key_hash64(key_crc(&key));
        Self {
            key,
            value,
            hash,
            tombstone,
        }
    }

    /// The low 32 bits of the record hash — the key CRC.
    pub fn key_crc(&self) -> u32 {
        self.hash as u32
    }

    /// On-disk `vlen` field with the tombstone bit applied.
    pub fn vlen_ts(&self) -> u32 {
        if self.tombstone {
            VLEN_TS
        } else {
            self.value.len() as u32
        }
    }

    /// Bytes charged to the memtable size accounting for this record.
    pub fn mem_size(&self) -> usize {
        self.key.len() + self.value.len() + MEM_ENTRY_OVERHEAD
    }

    /// Whether a (klen, vlen) pair is within the public API limit.
    pub fn size_ok(klen: usize, vlen: usize) -> bool {
        klen + vlen <= KV_SIZE_MAX
    }
}

// ------------------------------------------------------------------------------------------------
// KvItem
// ------------------------------------------------------------------------------------------------

/// A record as it flows through ordered streams (memtable iterators, table
/// iterators, the k-way merge): like [`KvRecord`] but without the key
/// hash, which streams have no use for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvItem {
    /// Key bytes.
    pub key: Bytes,

    /// Value bytes; empty for tombstones.
    pub value: Bytes,

    /// Whether this item deletes its key.
    pub tombstone: bool,
}

impl KvItem {
    /// On-disk `vlen` field with the tombstone bit applied.
    pub fn vlen_ts(&self) -> u32 {
        if self.tombstone {
            VLEN_TS
        } else {
            self.value.len() as u32
        }
    }
}

impl From<KvRecord> for KvItem {
    fn from(rec: KvRecord) -> Self {
        Self {
            key: rec.key,
            value: rec.value,
            tombstone: rec.tombstone,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Merge (read-modify-write) decisions
// ------------------------------------------------------------------------------------------------

/// Outcome of a user merge closure: what to do with the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeUpdate {
    /// Leave the key as it is (no-op).
    Keep,

    /// Replace the key's value.
    Put(Bytes),

    /// Delete the key (write a tombstone).
    Delete,
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
