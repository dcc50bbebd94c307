//! # Memtable Module
//!
//! The in-memory layer of the engine: a concurrent ordered map from key
//! bytes to the newest record for that key.
//!
//! ## Design Invariants
//!
//! - Readers and iterators are lock-free and may run concurrently with
//!   writers; iterators are stable under concurrent writes to other keys.
//! - Mutations must be externally serialized per key. The engine routes
//!   every mutation through its write lock, which trivially satisfies the
//!   single-writer-per-key requirement.
//! - Deletes are tombstone inserts, never physical removal; a tombstone is
//!   an authoritative "absent" answer that stops the read chain.
//! - Size accounting lives in the engine (it owns the lock); the memtable
//!   only reports per-entry sizes.
//!
//! ## Lifecycle
//!
//! Two memtable instances cycle through the engine's view ring. While a
//! memtable plays the immutable role it receives no writes; once every
//! reader has moved past the view that exposed it, [`Memtable::clean`]
//! empties it in place and it becomes the next writable memtable.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;

use crate::kv::KvRecord;

// ------------------------------------------------------------------------------------------------
// Entry & lookup result types
// ------------------------------------------------------------------------------------------------

/// The newest record for a key, as stored in the map.
///
/// `Bytes` clones are reference-counted handle copies, so moving entries
/// onto read paths never copies payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemEntry {
    /// Value bytes; empty for tombstones.
    pub value: Bytes,

    /// Whether this entry deletes the key.
    pub tombstone: bool,
}

impl MemEntry {
    /// Bytes this entry contributes to the engine's memtable accounting,
    /// given its key length.
    pub fn mem_size(&self, klen: usize) -> usize {
        klen + self.value.len() + crate::kv::MEM_ENTRY_OVERHEAD
    }

    /// Rebuilds the full record for a key, e.g. for WAL re-logging.
    pub fn to_record(&self, key: Bytes) -> KvRecord {
        KvRecord::from_parts(key, self.value.clone(), self.tombstone)
    }
}

/// Result of a memtable point lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemtableGet {
    /// Key present with a live value.
    Put(Bytes),

    /// Key deleted by a tombstone — an authoritative miss.
    Tombstone,

    /// Key not present in this memtable; probe the next layer.
    Miss,
}

// ------------------------------------------------------------------------------------------------
// Memtable Core
// ------------------------------------------------------------------------------------------------

/// A concurrent ordered map of byte-string keys to their newest record.
pub struct Memtable {
    map: SkipMap<Bytes, MemEntry>,
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            map: SkipMap::new(),
        }
    }

    /// Looks up `key`, distinguishing a live value, a tombstone, and a miss.
    pub fn get(&self, key: &[u8]) -> MemtableGet {
        match self.map.get(key) {
            Some(e) => {
                let v = e.value();
                if v.tombstone {
                    MemtableGet::Tombstone
                } else {
                    MemtableGet::Put(v.value.clone())
                }
            }
            None => MemtableGet::Miss,
        }
    }

    /// Returns the raw entry for `key`, tombstones included.
    pub fn entry(&self, key: &[u8]) -> Option<MemEntry> {
        self.map.get(key).map(|e| e.value().clone())
    }

    /// Bytes currently charged for `key`, or 0 when absent.
    pub fn entry_mem_size(&self, key: &[u8]) -> usize {
        self.map
            .get(key)
            .map(|e| e.value().mem_size(key.len()))
            .unwrap_or(0)
    }

    /// Inserts (or replaces) the record for `rec.key`.
    ///
    /// Callers must hold the engine write lock; see the module docs.
    pub fn insert(&self, rec: &KvRecord) {
        self.map.insert(
            rec.key.clone(),
            MemEntry {
                value: rec.value.clone(),
                tombstone: rec.tombstone,
            },
        );
    }

    /// Read-modify-write against the current entry for `key`.
    ///
    /// `f` observes the current entry (or `None`) and returns the entry to
    /// store, or `None` to leave the key untouched. The closure runs with
    /// the caller's serialization in effect, so it may perform the WAL
    /// append for the replacement before returning it.
    ///
    /// Returns `true` when an entry was stored.
    pub fn merge<F>(&self, key: &Bytes, f: F) -> bool
    where
        F: FnOnce(Option<&MemEntry>) -> Option<MemEntry>,
    {
        let cur = self.map.get(key.as_ref() as &[u8]);
        let new = f(cur.as_ref().map(|e| e.value()));
        drop(cur);
        match new {
            Some(entry) => {
                self.map.insert(key.clone(), entry);
                true
            }
            None => false,
        }
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Empties the memtable in place so the instance can be reused as the
    /// next writable memtable.
    ///
    /// Callers must guarantee no reader still iterates this memtable
    /// (the engine waits for quiescence first).
    pub fn clean(&self) {
        while let Some(entry) = self.map.front() {
            entry.remove();
        }
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

// ------------------------------------------------------------------------------------------------
// MemIter
// ------------------------------------------------------------------------------------------------

/// Owning ordered iterator over a key range of a [`Memtable`].
///
/// Each step re-seeks past the last yielded key, so the iterator is stable
/// under concurrent inserts and never holds internal map guards between
/// steps. Entries observed are the newest at the instant of each step.
pub struct MemIter {
    mt: Arc<Memtable>,
    start: Bound<Bytes>,
    end: Bound<Bytes>,
    last: Option<Bytes>,
}

impl MemIter {
    /// Ordered iterator over `[start, end)` that owns its memtable
    /// reference, so it can outlive the borrow that created it.
    pub fn new(mt: &Arc<Memtable>, start: Bound<Bytes>, end: Bound<Bytes>) -> Self {
        Self {
            mt: Arc::clone(mt),
            start,
            end,
            last: None,
        }
    }
}

impl Iterator for MemIter {
    type Item = (Bytes, MemEntry);

    fn next(&mut self) -> Option<Self::Item> {
        let from: Bound<&[u8]> = match &self.last {
            Some(k) => Bound::Excluded(k.as_ref()),
            None => match &self.start {
                Bound::Included(k) => Bound::Included(k.as_ref()),
                Bound::Excluded(k) => Bound::Excluded(k.as_ref()),
                Bound::Unbounded => Bound::Unbounded,
            },
        };

        let entry = self.mt.map.lower_bound(from)?;

        let key = entry.key().clone();
        match &self.end {
            Bound::Included(e) => {
                if key.as_ref() > e.as_ref() {
                    return None;
                }
            }
            Bound::Excluded(e) => {
                if key.as_ref() >= e.as_ref() {
                    return None;
                }
            }
            Bound::Unbounded => {}
        }

        let val = entry.value().clone();
        self.last = Some(key.clone());
        Some((key, val))
    }
}
