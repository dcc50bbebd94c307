use std::path::Path;

use crate::kv::KvRecord;
use crate::wal::{ReplaySummary, Wal};
use tracing_subscriber::EnvFilter;

/// Initialize tracing controlled by `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Opens the WAL pair, collecting replayed records as
/// `(from_newest_file, record)` tuples.
pub fn open_collect(dir: &Path, persisted: u64) -> (Wal, ReplaySummary, Vec<(bool, KvRecord)>) {
    init_tracing();
    let mut out = Vec::new();
    let (wal, summary) = Wal::open(dir, persisted, |newest, rec| out.push((newest, rec))).expect("wal open");
    (wal, summary, out)
}

/// Appends `n` sequential put records and flushes them durably.
pub fn fill(wal: &mut Wal, n: usize, prefix: &str) {
    for i in 0..n {
        let rec = KvRecord::new(
            format!("{prefix}_{i:06}").as_bytes(),
            format!("value_{i:06}").as_bytes(),
        );
        wal.append(&rec).expect("append");
    }
    wal.flush_sync_wait().expect("flush_sync_wait");
}
