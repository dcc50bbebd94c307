//! Multi-threaded operation: handles per thread, readers against
//! writers, write visibility.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use crate::engine::tests::helpers::*;
    use tempfile::TempDir;

    #[test]
    fn concurrent__four_writers_disjoint_ranges() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());

        let mut threads = Vec::new();
        for t in 0..4u32 {
            let engine = engine.clone();
            threads.push(std::thread::spawn(move || {
                let mut h = engine.handle().expect("handle");
                for i in 0..2000u32 {
                    assert!(h.put(
                        format!("w{t}_{i:06}").as_bytes(),
                        format!("{t}:{i}").as_bytes(),
                    ));
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        let mut h = engine.handle().unwrap();
        for t in 0..4u32 {
            for i in (0..2000u32).step_by(271) {
                assert_eq!(
                    h.get(format!("w{t}_{i:06}").as_bytes()).as_deref(),
                    Some(format!("{t}:{i}").as_bytes()),
                );
            }
        }
        assert_eq!(collect_all(&engine).len(), 8000);
        engine.close().unwrap();
    }

    #[test]
    fn concurrent__readers_run_against_writers() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let engine = engine.clone();
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut h = engine.handle().expect("handle");
                let mut i = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    h.put(format!("k{:04}", i % 512).as_bytes(), format!("{i:020}").as_bytes());
                    i += 1;
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..3 {
            let engine = engine.clone();
            let stop = Arc::clone(&stop);
            readers.push(std::thread::spawn(move || {
                let mut h = engine.handle().expect("handle");
                while !stop.load(Ordering::Relaxed) {
                    if let Some(v) = h.get(b"k0000") {
                        assert_eq!(v.len(), 20, "torn read");
                    }
                }
            }));
        }

        std::thread::sleep(std::time::Duration::from_millis(300));
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        engine.close().unwrap();
    }

    #[test]
    fn concurrent__writers_race_the_same_key_via_merge() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());

        let mut threads = Vec::new();
        for _ in 0..4 {
            let engine = engine.clone();
            threads.push(std::thread::spawn(move || {
                let mut h = engine.handle().expect("handle");
                for _ in 0..500 {
                    assert!(h.merge(b"counter", |cur| {
                        let n: u64 = cur
                            .map(|v| std::str::from_utf8(v).unwrap().parse().unwrap())
                            .unwrap_or(0);
                        crate::kv::MergeUpdate::Put(bytes::Bytes::from((n + 1).to_string()))
                    }));
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        let mut h = engine.handle().unwrap();
        assert_eq!(h.get(b"counter").as_deref(), Some(b"2000".as_ref()));
        engine.close().unwrap();
    }

    #[test]
    fn concurrent__writes_proceed_while_background_compaction_runs() {
        let dir = TempDir::new().unwrap();
        let engine = crate::engine::Engine::open(dir.path(), small_mt_config()).expect("open");

        let mut threads = Vec::new();
        for t in 0..2u32 {
            let engine = engine.clone();
            threads.push(std::thread::spawn(move || {
                let mut h = engine.handle().expect("handle");
                let value = vec![b'v'; 512];
                for i in 0..4000u32 {
                    assert!(h.put(format!("t{t}_{i:06}").as_bytes(), &value));
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        wait_for_compactions(&engine, 1);

        let mut h = engine.handle().unwrap();
        for t in 0..2u32 {
            for i in (0..4000u32).step_by(499) {
                assert!(h.probe(format!("t{t}_{i:06}").as_bytes()), "t{t} i{i}");
            }
        }
        engine.close().unwrap();
    }
}
