//! Partition-level compaction: merge the immutable memtable into the
//! live version, rewriting only the partitions worth rewriting.
//!
//! For every partition of the outgoing version the planner decides:
//!
//! - **accept** — merge the partition's incoming keys with its old table
//!   into fresh table(s); the old table is superseded. A rewrite that
//!   grows past [`SST_SPLIT_SIZE`](super::SST_SPLIT_SIZE) splits, adding
//!   new anchors. Because an accepted merge sees *all* data for its key
//!   range, tombstones cancel their targets and are dropped from the
//!   output.
//! - **reject** — keep the old table untouched and emit nothing; the
//!   caller routes the partition's incoming keys back into the write
//!   path. Rejection is chosen for partitions where a rewrite would be
//!   mostly old data (table size ≫ incoming bytes), and the aggregate
//!   incoming bytes of all rejected partitions never exceed the caller's
//!   budget. A zero budget disables rejection entirely.
//!
//! Accepted rewrites run on a worker pool; the new version is published
//! atomically before this returns, with per-partition dispositions
//! recorded in its anchor array.

use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, info};

use crate::kv::KvItem;
use crate::memtable::{MemIter, Memtable};

use super::iterator::TableIter;
use super::version::{Partition, SstStore, Version, publish_version};
use super::{SST_SPLIT_SIZE, SstError, Table, TableBuilder};

/// A rewrite is only worth skipping when the old table dwarfs the
/// incoming data by this factor.
const REJECT_FACTOR: u64 = 8;

/// Result of one compaction round.
pub struct CompactOutcome {
    /// The freshly published version.
    pub version: Arc<Version>,

    /// Bytes written into new tables.
    pub bytes_written: u64,

    /// Partitions rewritten.
    pub accepted: usize,

    /// Partitions that kept their table and need a reinsert walk.
    pub rejected: usize,

    /// Partitions carried unchanged (no incoming keys).
    pub carried: usize,
}

struct RewriteJob {
    part_idx: usize,
    anchor: Bytes,
    old_table: Option<Arc<Table>>,
    items: Vec<KvItem>,
}

struct RewriteOut {
    parts: Vec<Partition>,
    bytes: u64,
}

impl SstStore {
    /// Runs one compaction round against the live version.
    ///
    /// `imt` must be frozen (no concurrent writers). `max_reject_bytes`
    /// caps the aggregate incoming bytes routed back to the caller via
    /// rejected partitions. `co_per_worker` is a sizing pass-through
    /// recorded for diagnostics.
    pub fn compact(
        &self,
        imt: &Arc<Memtable>,
        nr_workers: usize,
        co_per_worker: usize,
        max_reject_bytes: u64,
    ) -> Result<CompactOutcome, SstError> {
        let old = self.getv();
        let nparts = old.parts.len();

        // Bin the immutable memtable by the outgoing partition ranges.
        let mut bins: Vec<Vec<KvItem>> = (0..nparts).map(|_| Vec::new()).collect();
        let mut inc_bytes = vec![0u64; nparts];
        for (key, entry) in MemIter::new(imt, Bound::Unbounded, Bound::Unbounded) {
            let p = old.part_for(&key);
            inc_bytes[p] += (key.len() + entry.value.len() + 16) as u64;
            bins[p].push(KvItem {
                key,
                value: entry.value,
                tombstone: entry.tombstone,
            });
        }

        // Pick rejections: cheapest reinserts first, under the budget.
        let mut rejected = vec![false; nparts];
        if max_reject_bytes > 0 {
            let mut cands: Vec<usize> = (0..nparts)
                .filter(|&i| {
                    !bins[i].is_empty()
                        && old.parts[i]
                            .table
                            .as_ref()
                            .is_some_and(|t| t.props.data_size > inc_bytes[i] * REJECT_FACTOR)
                })
                .collect();
            cands.sort_by_key(|&i| inc_bytes[i]);
            let mut budget = max_reject_bytes;
            for i in cands {
                if inc_bytes[i] <= budget {
                    budget -= inc_bytes[i];
                    rejected[i] = true;
                }
            }
        }

        // Collect rewrite jobs for accepted partitions with incoming keys.
        let mut jobs = Vec::new();
        for i in 0..nparts {
            if rejected[i] || bins[i].is_empty() {
                continue;
            }
            jobs.push(RewriteJob {
                part_idx: i,
                anchor: old.parts[i].anchor.clone(),
                old_table: old.parts[i].table.clone(),
                items: std::mem::take(&mut bins[i]),
            });
        }

        let accepted = jobs.len();
        let next_id = AtomicU64::new(old.next_table_id);
        let mut results: Vec<Option<RewriteOut>> = (0..nparts).map(|_| None).collect();
        let threads = nr_workers.clamp(1, jobs.len().max(1));

        {
            let jobs = &jobs;
            let next_job = AtomicUsize::new(0);
            let out: Mutex<Vec<(usize, RewriteOut)>> = Mutex::new(Vec::new());
            let first_err: Mutex<Option<SstError>> = Mutex::new(None);

            std::thread::scope(|s| {
                for _ in 0..threads {
                    s.spawn(|| {
                        loop {
                            let j = next_job.fetch_add(1, Ordering::Relaxed);
                            let Some(job) = jobs.get(j) else { break };
                            match rewrite_partition(
                                self,
                                job,
                                &next_id,
                            ) {
                                Ok(res) => out.lock().expect("results lock").push((job.part_idx, res)),
                                Err(e) => {
                                    let mut g = first_err.lock().expect("error lock");
                                    if g.is_none() {
                                        *g = Some(e);
                                    }
                                    break;
                                }
                            }
                        }
                    });
                }
            });

            if let Some(e) = first_err.into_inner().expect("error lock") {
                return Err(e);
            }
            for (idx, res) in out.into_inner().expect("results lock") {
                results[idx] = Some(res);
            }
        }

        // Assemble the successor's partition list in anchor order.
        let mut bytes_written = 0u64;
        let mut carried = 0usize;
        let mut rejected_count = 0usize;
        let mut parts: Vec<Partition> = Vec::with_capacity(nparts);
        let mut superseded: Vec<Arc<Table>> = Vec::new();

        for (i, oldp) in old.parts.iter().enumerate() {
            if rejected[i] {
                rejected_count += 1;
                parts.push(Partition {
                    anchor: oldp.anchor.clone(),
                    rejected: true,
                    table: oldp.table.clone(),
                });
            } else if let Some(res) = results[i].take() {
                bytes_written += res.bytes;
                if let Some(t) = &oldp.table {
                    superseded.push(Arc::clone(t));
                }
                parts.extend(res.parts);
            } else {
                carried += 1;
                parts.push(Partition {
                    anchor: oldp.anchor.clone(),
                    rejected: false,
                    table: oldp.table.clone(),
                });
            }
        }

        // Fold table-less partitions into their predecessor; the leading
        // empty-anchor partition always stays.
        let mut folded: Vec<Partition> = Vec::with_capacity(parts.len());
        for p in parts {
            if folded.is_empty() || p.table.is_some() {
                folded.push(p);
            }
        }

        let new = Arc::new(Version {
            seq: old.seq + 1,
            next_table_id: next_id.load(Ordering::SeqCst),
            parts: folded,
        });

        publish_version(&self.dir, &new, Some(&old))?;

        // The predecessor's predecessor is now unreferenced.
        if old.seq >= 1 {
            let _ = std::fs::remove_file(self.dir.join(format!("{:06}.ver", old.seq - 1)));
        }
        for t in superseded {
            t.mark_obsolete();
        }

        self.add_stat_writes(bytes_written);
        self.install(Arc::clone(&new));

        let line = format!(
            "compact seq={} parts={} accepted={accepted} rejected={rejected_count} carried={carried} \
             bytes={bytes_written} workers={threads} co_per_worker={co_per_worker} \
             reject_budget={max_reject_bytes}",
            new.seq,
            new.parts.len(),
        );
        self.log_line(&line);
        info!(
            seq = new.seq,
            accepted, rejected = rejected_count, carried, bytes = bytes_written,
            "compaction round published"
        );

        Ok(CompactOutcome {
            version: new,
            bytes_written,
            accepted,
            rejected: rejected_count,
            carried,
        })
    }
}

/// Merges one partition's old table with its incoming keys into fresh
/// table(s), dropping cancelled tombstones.
fn rewrite_partition(
    store: &SstStore,
    job: &RewriteJob,
    next_id: &AtomicU64,
) -> Result<RewriteOut, SstError> {
    let mut table_src = job
        .old_table
        .as_ref()
        .map(|t| TableIter::new(Arc::clone(t), Bound::Unbounded));
    let mut table_peek: Option<KvItem> = table_src.as_mut().and_then(|s| s.next());
    let mut imt_src = job.items.iter();
    let mut imt_peek: Option<&KvItem> = imt_src.next();

    let mut out_parts: Vec<Partition> = Vec::new();
    let mut builder: Option<TableBuilder> = None;
    let mut cur_anchor = job.anchor.clone();
    let mut bytes = 0u64;

    enum Pick {
        Table,
        Imt,
        /// Same key on both sides: the memtable record is newer; the
        /// table record is consumed and dropped.
        Both,
    }

    loop {
        // Pick the next unique key; the memtable side is newer on ties.
        let pick = match (&table_peek, imt_peek) {
            (None, None) => break,
            (Some(_), None) => Pick::Table,
            (None, Some(_)) => Pick::Imt,
            (Some(t), Some(m)) => match t.key.as_ref().cmp(m.key.as_ref()) {
                std::cmp::Ordering::Less => Pick::Table,
                std::cmp::Ordering::Greater => Pick::Imt,
                std::cmp::Ordering::Equal => Pick::Both,
            },
        };
        let item: KvItem = match pick {
            Pick::Table => {
                let it = table_peek.take().expect("table side peeked");
                table_peek = table_src.as_mut().and_then(|s| s.next());
                it
            }
            Pick::Imt => {
                let it = imt_peek.expect("imt side peeked").clone();
                imt_peek = imt_src.next();
                it
            }
            Pick::Both => {
                table_peek = table_src.as_mut().and_then(|s| s.next());
                let it = imt_peek.expect("imt side peeked").clone();
                imt_peek = imt_src.next();
                it
            }
        };

        // This merge sees every record for the partition's range, so a
        // tombstone has cancelled whatever it shadowed.
        if item.tombstone {
            continue;
        }

        if builder.is_none() {
            let id = next_id.fetch_add(1, Ordering::SeqCst);
            if !out_parts.is_empty() {
                // A continuation table after a split opens a new anchor;
                // the first output keeps the partition anchor.
                cur_anchor = item.key.clone();
            }
            builder = Some(TableBuilder::new(&store.dir, id, store.ckeys, store.tags)?);
        }
        let b = builder.as_mut().expect("builder present");
        b.add(&item)?;

        if b.data_size() >= SST_SPLIT_SIZE {
            let b = builder.take().expect("builder present");
            let id = b.id();
            bytes += b.finish()?;
            out_parts.push(Partition {
                anchor: std::mem::take(&mut cur_anchor),
                rejected: false,
                table: Some(Arc::new(Table::open(&store.dir, id)?)),
            });
        }
    }

    if let Some(src) = &table_src {
        if src.failed() {
            return Err(SstError::Corrupt(format!(
                "partition rewrite read a damaged table (id {})",
                job.old_table.as_ref().map(|t| t.id).unwrap_or_default()
            )));
        }
    }

    if let Some(b) = builder.take() {
        let id = b.id();
        bytes += b.finish()?;
        out_parts.push(Partition {
            anchor: cur_anchor,
            rejected: false,
            table: Some(Arc::new(Table::open(&store.dir, id)?)),
        });
    }

    if out_parts.is_empty() {
        // Everything cancelled: the range survives as an empty partition.
        out_parts.push(Partition {
            anchor: job.anchor.clone(),
            rejected: false,
            table: None,
        });
    } else {
        debug_assert_eq!(out_parts[0].anchor, job.anchor);
    }

    debug!(
        part = job.part_idx,
        outputs = out_parts.len(),
        bytes,
        "partition rewritten"
    );
    Ok(RewriteOut {
        parts: out_parts,
        bytes,
    })
}
