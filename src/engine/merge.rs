//! The k-way merging iterator over ranked record streams.
//!
//! Sources are ordered streams of [`KvItem`]s, each carrying a *rank*:
//!
//! ```text
//! rank 0: table version iterator (oldest)
//! rank 1: immutable memtable iterator (if present)
//! rank 2: writable memtable iterator (newest)
//! ```
//!
//! A binary heap orders heads by `(key ascending, rank descending)`, so
//! when several sources carry the same key the highest-rank (newest)
//! record surfaces first. [`MergeIterator::next_unique`] then discards
//! the older duplicates, yielding exactly one record per key — tombstones
//! included. [`VisibleIter`] wraps it for tombstone-aware consumers.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use bytes::Bytes;

use crate::kv::KvItem;

/// Maximum number of streams one merge may combine.
pub const MITER_MAX_STREAMS: usize = 18;

/// A ranked source stream.
pub type RankedSource = (usize, Box<dyn Iterator<Item = KvItem> + Send>);

struct HeapEntry {
    item: KvItem,
    rank: usize,
    src: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.item.key == other.item.key && self.rank == other.rank
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    /// `BinaryHeap` is a max-heap; reverse the `(key ASC, rank DESC)`
    /// order so the smallest key / newest rank pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        match self.item.key.cmp(&other.item.key) {
            Ordering::Equal => self.rank.cmp(&other.rank),
            ord => ord.reverse(),
        }
    }
}

/// Heap-based k-way merge yielding at most one record per key.
pub struct MergeIterator {
    sources: Vec<Box<dyn Iterator<Item = KvItem> + Send>>,
    ranks: Vec<usize>,
    heap: BinaryHeap<HeapEntry>,
}

impl MergeIterator {
    pub fn new(ranked: Vec<RankedSource>) -> Self {
        debug_assert!(ranked.len() <= MITER_MAX_STREAMS);
        let mut sources = Vec::with_capacity(ranked.len());
        let mut ranks = Vec::with_capacity(ranked.len());
        let mut heap = BinaryHeap::with_capacity(ranked.len() + 1);
        for (src, (rank, mut iter)) in ranked.into_iter().enumerate() {
            if let Some(item) = iter.next() {
                heap.push(HeapEntry { item, rank, src });
            }
            sources.push(iter);
            ranks.push(rank);
        }
        Self {
            sources,
            ranks,
            heap,
        }
    }

    /// Pops the next unique key: the newest record wins, older duplicates
    /// from lower-rank sources are consumed and dropped.
    pub fn next_unique(&mut self) -> Option<KvItem> {
        let top = self.heap.pop()?;
        self.refill(top.src);

        while let Some(dup) = self.heap.peek() {
            if dup.item.key != top.item.key {
                break;
            }
            let dup = self.heap.pop().expect("peeked entry");
            self.refill(dup.src);
        }
        Some(top.item)
    }

    fn refill(&mut self, src: usize) {
        if let Some(item) = self.sources[src].next() {
            self.heap.push(HeapEntry {
                item,
                rank: self.ranks[src],
                src,
            });
        }
    }
}

impl Iterator for MergeIterator {
    type Item = KvItem;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_unique()
    }
}

/// Tombstone-aware wrapper: yields only live `(key, value)` pairs.
pub struct VisibleIter {
    inner: MergeIterator,
}

impl VisibleIter {
    pub fn new(inner: MergeIterator) -> Self {
        Self { inner }
    }
}

impl Iterator for VisibleIter {
    type Item = (Bytes, Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let item = self.inner.next_unique()?;
            if item.tombstone {
                continue;
            }
            return Some((item.key, item.value));
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn src(items: Vec<(&'static str, &'static str, bool)>) -> Box<dyn Iterator<Item = KvItem> + Send> {
        Box::new(items.into_iter().map(|(k, v, ts)| KvItem {
            key: Bytes::from_static(k.as_bytes()),
            value: Bytes::from_static(v.as_bytes()),
            tombstone: ts,
        }))
    }

    #[test]
    fn merge_interleaves_sorted_sources() {
        let mut m = MergeIterator::new(vec![
            (0, src(vec![("a", "1", false), ("c", "3", false)])),
            (2, src(vec![("b", "2", false), ("d", "4", false)])),
        ]);
        let keys: Vec<_> = std::iter::from_fn(|| m.next_unique())
            .map(|i| i.key.to_vec())
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn highest_rank_wins_on_duplicate_keys() {
        let mut m = MergeIterator::new(vec![
            (0, src(vec![("k", "old", false)])),
            (1, src(vec![("k", "mid", false)])),
            (2, src(vec![("k", "new", false)])),
        ]);
        let item = m.next_unique().unwrap();
        assert_eq!(item.value.as_ref(), b"new");
        assert!(m.next_unique().is_none(), "duplicates are consumed");
    }

    #[test]
    fn visible_iter_hides_tombstones() {
        let m = MergeIterator::new(vec![
            (0, src(vec![("a", "table", false), ("b", "table", false)])),
            (2, src(vec![("a", "", true), ("c", "live", false)])),
        ]);
        let out: Vec<_> = VisibleIter::new(m)
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        assert_eq!(
            out,
            vec![
                (b"b".to_vec(), b"table".to_vec()),
                (b"c".to_vec(), b"live".to_vec()),
            ]
        );
    }

    #[test]
    fn tombstone_from_newest_rank_shadows_older_put() {
        let mut m = MergeIterator::new(vec![
            (0, src(vec![("k", "old", false)])),
            (2, src(vec![("k", "", true)])),
        ]);
        let item = m.next_unique().unwrap();
        assert!(item.tombstone, "the raw merge surfaces the tombstone");
        assert!(m.next_unique().is_none());
    }

    #[test]
    fn empty_sources_are_harmless() {
        let mut m = MergeIterator::new(vec![
            (0, src(vec![])),
            (1, src(vec![("only", "v", false)])),
            (2, src(vec![])),
        ]);
        assert_eq!(m.next_unique().unwrap().key.as_ref(), b"only");
        assert!(m.next_unique().is_none());
    }
}
