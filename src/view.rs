//! The memtable view ring.
//!
//! Two physical memtables A and B cycle through four immutable view
//! descriptors:
//!
//! ```text
//! view[0] = (A, none)    normal on A
//! view[1] = (B, A)       compacting A, writes go to B
//! view[2] = (B, none)    normal on B
//! view[3] = (A, B)       compacting B, writes go to A
//! ```
//!
//! Exactly one view is current at any time; advancing (0→1→2→3→0) is a
//! single index store performed under the engine write lock. Readers
//! snapshot the current view without any lock: the four descriptors are
//! built once at startup and never mutated, so a stale index only ever
//! selects a view whose memtables are kept alive by the reclamation
//! protocol.
//!
//! Invariant: in a compacting view the full key universe reads as
//! `wmt ∪ imt ∪ table-version`, and `imt` receives no writes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::memtable::Memtable;

/// One state of the ring: the writable memtable plus, in compacting
/// states, the immutable memtable being drained.
pub struct MtView {
    /// Writable memtable — the sink for all mutations under this view.
    pub wmt: Arc<Memtable>,

    /// Immutable memtable being compacted, when this is a compacting view.
    pub imt: Option<Arc<Memtable>>,

    /// Ring successor index.
    next: usize,
}

/// The four-view ring and the current-view index.
pub struct ViewRing {
    views: [Arc<MtView>; 4],
    cur: AtomicUsize,
}

impl ViewRing {
    /// Builds the ring over two fresh memtables; view 0 (normal on `a`)
    /// is current.
    pub fn new(a: Arc<Memtable>, b: Arc<Memtable>) -> Self {
        let views = [
            Arc::new(MtView {
                wmt: Arc::clone(&a),
                imt: None,
                next: 1,
            }),
            Arc::new(MtView {
                wmt: Arc::clone(&b),
                imt: Some(Arc::clone(&a)),
                next: 2,
            }),
            Arc::new(MtView {
                wmt: Arc::clone(&b),
                imt: None,
                next: 3,
            }),
            Arc::new(MtView {
                wmt: a,
                imt: Some(b),
                next: 0,
            }),
        ];
        Self {
            views,
            cur: AtomicUsize::new(0),
        }
    }

    /// Index of the current view.
    pub fn current_index(&self) -> usize {
        self.cur.load(Ordering::SeqCst)
    }

    /// Snapshot of the current view: `(index, descriptor)`.
    pub fn current(&self) -> (usize, Arc<MtView>) {
        let idx = self.current_index();
        (idx, Arc::clone(&self.views[idx]))
    }

    /// Descriptor at a fixed index.
    pub fn get(&self, idx: usize) -> Arc<MtView> {
        Arc::clone(&self.views[idx])
    }

    /// Advances to the ring successor and returns its index.
    ///
    /// Must be called under the engine write lock.
    pub fn advance(&self) -> usize {
        let cur = self.current_index();
        let next = self.views[cur].next;
        self.cur.store(next, Ordering::SeqCst);
        next
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
