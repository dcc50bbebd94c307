//! Randomized multi-epoch stress with a shadow map and reopen cycles.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use std::collections::BTreeMap;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    use crate::engine::tests::helpers::*;
    use crate::engine::{Engine, EngineConfig};

    fn stress_config() -> EngineConfig {
        init_tracing();
        EngineConfig {
            mt_size_mb: 1,
            wal_size_mb: 8,
            nr_workers: 2,
            co_per_worker: 2,
            ..EngineConfig::default()
        }
    }

    /// Epochs of random put/del against a shadow map, reopening the
    /// store between epochs to exercise replay. After each epoch the
    /// store must match the shadow exactly.
    #[test]
    fn stress__random_ops_with_reopen_epochs() {
        let dir = TempDir::new().unwrap();
        let mut rng = StdRng::seed_from_u64(0xE0E0);
        let mut shadow: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let key_space = 4096u32;

        for epoch in 0..4 {
            let engine = Engine::open(dir.path(), stress_config()).expect("open");
            let mut h = engine.handle().unwrap();

            for _ in 0..20_000 {
                let k = format!("key_{:08}", rng.random_range(0..key_space)).into_bytes();
                if rng.random_bool(0.25) {
                    assert!(h.del(&k));
                    shadow.remove(&k);
                } else {
                    let v = format!("v{epoch}_{}", rng.random_range(0..1_000_000)).into_bytes();
                    assert!(h.put(&k, &v));
                    shadow.insert(k, v);
                }
            }
            engine.sync().unwrap();

            // Spot-check live state against the shadow before closing.
            let mut stale = 0usize;
            for (k, v) in shadow.iter().step_by(37) {
                match h.get(k) {
                    Some(got) if got.as_ref() == v.as_slice() => {}
                    _ => stale += 1,
                }
            }
            assert_eq!(stale, 0, "epoch {epoch}: synced state must not be stale");

            drop(h);
            engine.close().unwrap();
        }

        // Full verification after the final reopen.
        let engine = Engine::open(dir.path(), stress_config()).expect("open");
        let got: Vec<(Vec<u8>, Vec<u8>)> = collect_all(&engine);
        let want: Vec<(Vec<u8>, Vec<u8>)> =
            shadow.into_iter().collect();
        assert_eq!(got.len(), want.len());
        assert_eq!(got, want);
        engine.close().unwrap();
    }

    /// Scaled-down bulk-load ordering check; the full 2^20-key variant
    /// runs with `--ignored`.
    #[test]
    fn stress__bulk_load_iterates_in_lexical_order() {
        bulk_load_case(1 << 14);
    }

    #[test]
    #[ignore = "full-size bulk load; minutes of runtime"]
    fn stress__bulk_load_full_size() {
        bulk_load_case(1 << 20);
    }

    fn bulk_load_case(n: usize) {
        let dir = TempDir::new().unwrap();
        let value = vec![b'v'; 120];
        {
            let engine = Engine::open(dir.path(), stress_config()).expect("open");
            let mut h = engine.handle().unwrap();
            for i in 0..n {
                assert!(h.put(format!("{i:020}").as_bytes(), &value));
            }
            engine.sync().unwrap();
            drop(h);
            engine.close().unwrap();
        }

        let engine = Engine::open(dir.path(), stress_config()).expect("open");
        let mut h = engine.handle().unwrap();
        let mut count = 0usize;
        let mut it = h.iter();
        it.seek(b"");
        let mut prev: Option<bytes::Bytes> = None;
        for (k, v) in it {
            assert_eq!(k.as_ref(), format!("{count:020}").as_bytes());
            assert_eq!(v.len(), 120);
            if let Some(p) = &prev {
                assert!(p < &k);
            }
            prev = Some(k);
            count += 1;
        }
        assert_eq!(count, n);
        engine.close().unwrap();
    }
}
