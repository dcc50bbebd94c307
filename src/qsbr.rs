//! Quiescent-state-based reclamation (QSBR).
//!
//! The engine retires shared structures (the previous memtable view, the
//! previous table version) without stop-the-world locks. Every reader
//! handle owns one slot in a sharded registry and publishes the view
//! generation it last observed; a writer that wants to reclaim generation
//! `G` spins until every registered slot has either *passed* `G` or is
//! *parked*.
//!
//! ## Protocol
//!
//! - A reader calls [`Qsbr::update`] with the current generation when it
//!   enters a top-level operation and [`Qsbr::park`] when it leaves. A
//!   parked slot reads as "passed" to any waiter, so idle readers never
//!   delay reclamation.
//! - A writer advances the engine generation, then calls [`Qsbr::wait`]
//!   with the new value. On return, no reader can still be inside an
//!   operation that observed the previous generation.
//!
//! All slot traffic uses sequentially consistent atomics; the registry is
//! tiny and the wait path is rare (once per view rotation), so the
//! simplicity is worth far more than the fence cost.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::Backoff;
use tracing::trace;

/// Number of registry shards.
pub const QSBR_SHARDS: usize = 8;

/// Slots per shard (one bitmap word's worth).
pub const QSBR_SLOTS_PER_SHARD: usize = 64;

/// Sentinel generation meaning "this reader is parked".
const PARKED: u64 = u64::MAX;

struct Shard {
    /// Bitmap of registered slots.
    registered: AtomicU64,

    /// Last generation observed by each registered reader, or [`PARKED`].
    slots: [AtomicU64; QSBR_SLOTS_PER_SHARD],
}

/// The sharded reader-generation registry.
pub struct Qsbr {
    shards: Box<[Shard; QSBR_SHARDS]>,
}

/// A registered reader slot. Obtained from [`Qsbr::register`]; the owner
/// must hand it back to [`Qsbr::unregister`] (the engine handle does this
/// on drop).
#[derive(Debug)]
pub struct QsbrSlot {
    shard: usize,
    idx: usize,
}

impl Qsbr {
    pub fn new() -> Self {
        let shards = Box::new(std::array::from_fn::<_, QSBR_SHARDS, _>(|_| Shard {
            registered: AtomicU64::new(0),
            slots: std::array::from_fn(|_| AtomicU64::new(PARKED)),
        }));
        Self { shards }
    }

    /// Claims a free slot. Returns `None` when all
    /// `QSBR_SHARDS * QSBR_SLOTS_PER_SHARD` slots are taken.
    pub fn register(&self) -> Option<QsbrSlot> {
        for (si, shard) in self.shards.iter().enumerate() {
            loop {
                let cur = shard.registered.load(Ordering::SeqCst);
                let free = !cur;
                if free == 0 {
                    break; // shard full, try the next one
                }
                let idx = free.trailing_zeros() as usize;
                let bit = 1u64 << idx;
                // Slots are parked whenever unregistered, so the value is
                // already safe to expose the instant the bit is claimed.
                if shard
                    .registered
                    .compare_exchange(cur, cur | bit, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    trace!(shard = si, slot = idx, "qsbr slot registered");
                    return Some(QsbrSlot { shard: si, idx });
                }
            }
        }
        None
    }

    /// Releases a slot back to the registry.
    pub fn unregister(&self, slot: &QsbrSlot) {
        let shard = &self.shards[slot.shard];
        shard.slots[slot.idx].store(PARKED, Ordering::SeqCst);
        shard
            .registered
            .fetch_and(!(1u64 << slot.idx), Ordering::SeqCst);
        trace!(shard = slot.shard, slot = slot.idx, "qsbr slot unregistered");
    }

    /// Publishes the generation this reader has observed.
    pub fn update(&self, slot: &QsbrSlot, r#gen: u64) {
        debug_assert_ne!(r#gen, PARKED);
        self.shards[slot.shard].slots[slot.idx].store(r#gen, Ordering::SeqCst);
    }

    /// Temporarily bows the reader out; waiters treat it as passed.
    pub fn park(&self, slot: &QsbrSlot) {
        self.shards[slot.shard].slots[slot.idx].store(PARKED, Ordering::SeqCst);
    }

    /// Blocks until every registered reader has observed a generation
    /// `>= target` or is parked.
    pub fn wait(&self, target: u64) {
        for shard in self.shards.iter() {
            let mut pending = shard.registered.load(Ordering::SeqCst);
            while pending != 0 {
                let idx = pending.trailing_zeros() as usize;
                let bit = 1u64 << idx;
                let backoff = Backoff::new();
                loop {
                    // A slot that unregisters mid-wait parks first, so the
                    // value check alone is sufficient.
                    let v = shard.slots[idx].load(Ordering::SeqCst);
                    if v == PARKED || v >= target {
                        break;
                    }
                    backoff.snooze();
                }
                pending &= !bit;
            }
        }
        trace!(target, "qsbr wait complete");
    }
}

impl Default for Qsbr {
    fn default() -> Self {
        Self::new()
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
