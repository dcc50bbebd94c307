use std::path::Path;
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

use crate::engine::{Engine, EngineConfig};

/// Initialize tracing controlled by `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Default config: caps far above anything a unit test writes, so no
/// background compaction interferes.
pub fn default_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        nr_workers: 2,
        co_per_worker: 2,
        ..EngineConfig::default()
    }
}

/// 1 MiB memtable cap: a few thousand 1 KiB values trigger compaction.
pub fn small_mt_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        mt_size_mb: 1,
        wal_size_mb: 8,
        nr_workers: 2,
        co_per_worker: 2,
        ..EngineConfig::default()
    }
}

pub fn open(path: &Path) -> Engine {
    Engine::open(path, default_config()).expect("open")
}

pub fn reopen(path: &Path) -> Engine {
    Engine::open(path, default_config()).expect("reopen")
}

/// Puts `n` keys `prefix_NNNNNN` with matching values.
pub fn fill(engine: &Engine, n: usize, prefix: &str) {
    let mut h = engine.handle().expect("handle");
    for i in 0..n {
        assert!(h.put(
            format!("{prefix}_{i:06}").as_bytes(),
            format!("value_{i:06}").as_bytes(),
        ));
    }
}

/// Blocks until the background worker has completed at least `rounds`
/// compaction rounds.
pub fn wait_for_compactions(engine: &Engine, rounds: u64) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while engine.stats().compactions < rounds {
        assert!(Instant::now() < deadline, "compaction did not complete in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Collects all live pairs as owned vectors.
pub fn collect_all(engine: &Engine) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut h = engine.handle().expect("handle");
    h.iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect()
}

/// Simulates an abrupt process death: the engine is abandoned without
/// close, losing any unflushed WAL buffer, exactly like a crash would.
pub fn crash(engine: Engine) {
    std::mem::forget(engine);
}
