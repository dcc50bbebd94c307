//! The compaction pipeline: rotate, quiesce, rewrite, reinsert, truncate.
//!
//! One round, in order:
//!
//! 1. Under the engine lock: advance the view ring to the compacting
//!    state (the old writable memtable becomes the immutable memtable),
//!    switch the WAL to the other file stamped with the next version,
//!    and reset the size accounting. Writers resume immediately against
//!    the new memtable.
//! 2. Wait for every reader to cross the new generation; the immutable
//!    memtable is frozen from here on.
//! 3. Pin the outgoing table version.
//! 4. Run the table compaction: per-partition accept/reject, publishing
//!    the successor version.
//! 5. Walk the published version's rejected anchors and reinsert those
//!    ranges' immutable-memtable keys into the new writable memtable —
//!    appending each to the new WAL first, and skipping keys the
//!    memtable already holds (its value is newer).
//! 6. Flush the new WAL and enqueue its fsync; release the pin.
//! 7. Advance the ring back to a single-memtable view.
//! 8. Wait for quiescence again, then clean the former immutable
//!    memtable for reuse.
//! 9. Await the fsync from step 6.
//! 10. Truncate the retired WAL file and fdatasync it.
//!
//! Steps 6 and 9–10 establish the durability invariant: a rejected key
//! survives any crash after old-WAL truncation because it is already
//! durable in the new WAL, in the published version, or both.
//!
//! Failures here are fatal by design: partial progress between the view
//! rotations would leave the rejection-durability invariant at risk, so
//! WAL, rewrite, and reinsert errors abort the process with a
//! diagnostic.

use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, info};

use crate::memtable::MemIter;

use super::EngineShared;

/// Runs one compaction round. `force` rotates even when the engine is
/// not full (explicit [`Engine::compact`](super::Engine::compact)).
pub(crate) fn run_compaction(shared: &EngineShared, force: bool) {
    let _serial = shared.compact_mu.lock().expect("compaction serialization");

    // ---- Step 1: pre-rotate under the engine lock -------------------------
    let retired_wal;
    let next_version;
    {
        let mut g = shared.lock();
        if !force && !shared.full.load(Ordering::SeqCst) {
            return;
        }
        debug_assert!(
            shared.ring.current_index() % 2 == 0,
            "compaction must start from a normal view"
        );
        next_version = shared.store.version() + 1;
        shared.ring.advance();
        retired_wal = g
            .wal
            .switch(next_version)
            .unwrap_or_else(|e| panic!("wal switch failed: {e}"));
        g.mtsz = 0;
        shared.full.store(false, Ordering::SeqCst);
    }
    let gen1 = shared.r#gen.fetch_add(1, Ordering::SeqCst) + 1;
    debug!(retired_wal, next_version, "pre-rotate complete");

    // ---- Step 2: quiesce — the imt is frozen after this -------------------
    shared.qsbr.wait(gen1);

    let (_, view) = shared.ring.current();
    let imt = Arc::clone(view.imt.as_ref().expect("compacting view has an imt"));
    let wmt = Arc::clone(&view.wmt);

    // ---- Step 3: pin the outgoing version ---------------------------------
    // It must stay alive until rejected ranges are WAL-durable; a crash
    // in between recovers them from the still-untruncated old WAL.
    let old_version = shared.store.getv();

    // ---- Step 4: table compaction -----------------------------------------
    let outcome = shared
        .store
        .compact(
            &imt,
            shared.config.nr_workers,
            shared.config.co_per_worker,
            shared.max_reject,
        )
        .unwrap_or_else(|e| panic!("table compaction failed: {e}"));

    // ---- Step 5: reinsert rejected ranges into the new wmt ----------------
    let mut reinserted = 0u64;
    for (i, part) in outcome.version.parts.iter().enumerate() {
        if !part.rejected {
            continue;
        }
        let start = Bound::Included(part.anchor.clone());
        let end = match outcome.version.part_end(i) {
            Some(a) => Bound::Excluded(a.clone()),
            None => Bound::Unbounded,
        };
        for (key, entry) in MemIter::new(&imt, start, end) {
            let mut g = shared.lock();
            if wmt.entry(&key).is_none() {
                let rec = entry.to_record(key);
                if let Err(e) = g.wal.append(&rec) {
                    panic!("reinsert wal append failed, rejected range at risk: {e}");
                }
                g.mtsz += rec.mem_size() as u64;
                wmt.insert(&rec);
                reinserted += 1;
            }
        }
    }

    // ---- Step 6: flush the new WAL, fsync in flight -----------------------
    {
        let mut g = shared.lock();
        g.wal
            .flush_sync()
            .unwrap_or_else(|e| panic!("wal flush failed: {e}"));
    }
    drop(old_version);

    // ---- Step 7: rotate back to a normal view -----------------------------
    {
        let _g = shared.lock();
        shared.ring.advance();
    }
    let gen2 = shared.r#gen.fetch_add(1, Ordering::SeqCst) + 1;

    // ---- Step 8: quiesce, then recycle the imt ----------------------------
    shared.qsbr.wait(gen2);
    imt.clean();

    // ---- Step 9: the new WAL must be durable before the old one goes ------
    {
        let mut g = shared.lock();
        g.wal
            .sync_wait()
            .unwrap_or_else(|e| panic!("wal fsync failed: {e}"));
    }

    // ---- Step 10: drop the retired WAL ------------------------------------
    {
        let mut g = shared.lock();
        g.wal
            .truncate_retired()
            .unwrap_or_else(|e| panic!("wal truncate failed: {e}"));
    }

    shared.compactions.fetch_add(1, Ordering::Relaxed);

    // Heavy write traffic may have refilled the engine meanwhile.
    {
        let g = shared.lock();
        if g.mtsz >= shared.max_mtsz || g.wal.write_off() >= shared.max_walsz {
            shared.full.store(true, Ordering::SeqCst);
            shared.notify_worker();
        }
    }

    info!(
        version = outcome.version.seq,
        accepted = outcome.accepted,
        rejected = outcome.rejected,
        carried = outcome.carried,
        reinserted,
        bytes = outcome.bytes_written,
        "compaction round complete"
    );
}
