//! Ordered iteration over tables and versions.
//!
//! Both iterators own `Arc` references to the structures they walk, so
//! they satisfy the `'static` bound the engine's k-way merge requires and
//! stay valid while versions rotate underneath.
//!
//! A corrupt block ends iteration early: the iterator yields `None` and
//! latches [`TableIter::failed`]. Read paths treat that like truncation;
//! compaction checks the flag and refuses to publish from a damaged
//! source.

use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use tracing::error;

use crate::kv::KvItem;

use super::version::Version;
use super::{BlockCursor, SstError, Table};

// ------------------------------------------------------------------------------------------------
// TableIter
// ------------------------------------------------------------------------------------------------

/// Ordered iterator over one table, decoding one block at a time.
pub struct TableIter {
    table: Arc<Table>,
    next_block: usize,
    entries: std::vec::IntoIter<KvItem>,
    failed: bool,
}

impl TableIter {
    /// Positions the iterator at the first key satisfying `start`.
    pub fn new(table: Arc<Table>, start: Bound<&[u8]>) -> Self {
        let mut it = Self {
            table,
            next_block: 0,
            entries: Vec::new().into_iter(),
            failed: false,
        };
        match start {
            Bound::Unbounded => {}
            Bound::Included(k) | Bound::Excluded(k) => {
                if let Some(idx) = it.table.block_for(k) {
                    it.next_block = idx;
                    if it.load_next_block() {
                        let excl = matches!(start, Bound::Excluded(_));
                        it.skip_until(k, excl);
                    }
                }
            }
        }
        it
    }

    /// Whether iteration ended because of corrupt data.
    pub fn failed(&self) -> bool {
        self.failed
    }

    fn skip_until(&mut self, key: &[u8], exclusive: bool) {
        // The start key lives in the first loaded block (or nowhere);
        // linear skip within it is bounded by the block size.
        let rest: Vec<KvItem> = self
            .entries
            .by_ref()
            .skip_while(|e| {
                if exclusive {
                    e.key.as_ref() <= key
                } else {
                    e.key.as_ref() < key
                }
            })
            .collect();
        self.entries = rest.into_iter();
    }

    fn load_next_block(&mut self) -> bool {
        while self.next_block < self.table.block_count() {
            let idx = self.next_block;
            self.next_block += 1;
            match self.decode_block(idx) {
                Ok(entries) => {
                    if entries.is_empty() {
                        continue;
                    }
                    self.entries = entries.into_iter();
                    return true;
                }
                Err(e) => {
                    error!(table = self.table.id, block = idx, error = %e, "table iteration halted");
                    self.failed = true;
                    return false;
                }
            }
        }
        false
    }

    fn decode_block(&self, idx: usize) -> Result<Vec<KvItem>, SstError> {
        let data = self.table.block_data(idx)?;
        let mut out = Vec::new();
        let mut cursor = BlockCursor::new(&data, self.table.ckeys());
        while let Some(entry) = cursor.next_entry()? {
            out.push(KvItem {
                key: Bytes::copy_from_slice(entry.key),
                value: Bytes::copy_from_slice(entry.value),
                tombstone: entry.tombstone,
            });
        }
        Ok(out)
    }
}

impl Iterator for TableIter {
    type Item = KvItem;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }
            if let Some(item) = self.entries.next() {
                return Some(item);
            }
            if !self.load_next_block() {
                return None;
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// VersionIter
// ------------------------------------------------------------------------------------------------

/// Ordered iterator over all tables of a version, partition by partition.
///
/// Partitions hold disjoint, ascending key ranges, so simple
/// concatenation preserves global order.
pub struct VersionIter {
    version: Arc<Version>,
    next_part: usize,
    cur: Option<TableIter>,
    start: Bound<Bytes>,
    failed: bool,
}

impl VersionIter {
    /// Positions the iterator at the first key satisfying `start`.
    pub fn new(version: Arc<Version>, start: Bound<&[u8]>) -> Self {
        let (first_part, start) = match start {
            Bound::Unbounded => (0, Bound::Unbounded),
            Bound::Included(k) => (
                version.part_for(k),
                Bound::Included(Bytes::copy_from_slice(k)),
            ),
            Bound::Excluded(k) => (
                version.part_for(k),
                Bound::Excluded(Bytes::copy_from_slice(k)),
            ),
        };
        Self {
            version,
            next_part: first_part,
            cur: None,
            start,
            failed: false,
        }
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    fn open_next_part(&mut self) -> bool {
        while self.next_part < self.version.parts.len() {
            let part = &self.version.parts[self.next_part];
            self.next_part += 1;
            if let Some(table) = &part.table {
                // Only the first opened partition can straddle the start
                // bound; later partitions begin past it.
                let start = std::mem::replace(&mut self.start, Bound::Unbounded);
                let bound = match &start {
                    Bound::Included(k) => Bound::Included(k.as_ref()),
                    Bound::Excluded(k) => Bound::Excluded(k.as_ref()),
                    Bound::Unbounded => Bound::Unbounded,
                };
                self.cur = Some(TableIter::new(Arc::clone(table), bound));
                return true;
            }
        }
        false
    }
}

impl Iterator for VersionIter {
    type Item = KvItem;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(cur) = &mut self.cur {
                if let Some(item) = cur.next() {
                    return Some(item);
                }
                if cur.failed() {
                    self.failed = true;
                    return None;
                }
                self.cur = None;
            }
            if !self.open_next_part() {
                return None;
            }
        }
    }
}
