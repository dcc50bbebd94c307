//! Ordered iteration across all layers.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::engine::tests::helpers::*;
    use tempfile::TempDir;

    #[test]
    fn iter__yields_sorted_pairs() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        let mut h = engine.handle().unwrap();
        h.put(b"00", b"0_value");
        h.put(b"11", b"1_value");
        h.put(b"22", b"2_value");
        engine.sync().unwrap();

        let mut it = h.iter();
        it.seek(b"");
        let got: Vec<_> = it.map(|(k, v)| (k.to_vec(), v.to_vec())).collect();
        assert_eq!(
            got,
            vec![
                (b"00".to_vec(), b"0_value".to_vec()),
                (b"11".to_vec(), b"1_value".to_vec()),
                (b"22".to_vec(), b"2_value".to_vec()),
            ]
        );
        engine.close().unwrap();
    }

    #[test]
    fn iter__merges_memtable_over_tables() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        fill(&engine, 10, "key");
        engine.compact().unwrap();

        let mut h = engine.handle().unwrap();
        h.put(b"key_000003", b"updated");
        h.del(b"key_000007");

        let got = collect_all(&engine);
        assert_eq!(got.len(), 9, "deleted key is hidden");
        assert!(got.iter().any(|(k, v)| k == b"key_000003" && v == b"updated"));
        assert!(!got.iter().any(|(k, _)| k == b"key_000007"));
        engine.close().unwrap();
    }

    #[test]
    fn iter__each_key_appears_once() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        fill(&engine, 20, "key");
        engine.compact().unwrap();
        // Rewrite every key so both layers hold a version of each.
        fill(&engine, 20, "key");

        let got = collect_all(&engine);
        assert_eq!(got.len(), 20);
        assert!(got.windows(2).all(|w| w[0].0 < w[1].0));
        engine.close().unwrap();
    }

    #[test]
    fn iter__seek_repositions() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        fill(&engine, 30, "key");

        let mut h = engine.handle().unwrap();
        let mut it = h.iter();
        it.seek(b"key_000025");
        let rest: Vec<_> = it.map(|(k, _)| k.to_vec()).collect();
        assert_eq!(rest.len(), 5);
        assert_eq!(rest[0], b"key_000025");

        engine.close().unwrap();
    }

    #[test]
    fn iter__seek_between_keys_lands_on_successor() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        let mut h = engine.handle().unwrap();
        h.put(b"a", b"1");
        h.put(b"c", b"3");

        let mut it = h.iter();
        it.seek(b"b");
        assert_eq!(it.next().map(|(k, _)| k.to_vec()), Some(b"c".to_vec()));
        drop(it);
        engine.close().unwrap();
    }

    #[test]
    fn iter__survives_compaction_mid_scan() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        fill(&engine, 200, "key");

        let mut h = engine.handle().unwrap();
        let mut it = h.iter();
        let mut seen = Vec::new();
        for _ in 0..50 {
            seen.push(it.next().unwrap().0.to_vec());
        }

        // Rotate the world under the iterator. Compaction must run on
        // another thread: it waits for this reader to cross the
        // generation, which happens on the iterator's next step.
        let compactor = {
            let engine = engine.clone();
            std::thread::spawn(move || engine.compact().unwrap())
        };

        for pair in it {
            seen.push(pair.0.to_vec());
        }
        compactor.join().unwrap();

        assert_eq!(seen.len(), 200, "no keys lost across the rotation");
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        engine.close().unwrap();
    }

    #[test]
    fn iter__empty_store_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        let mut h = engine.handle().unwrap();
        assert_eq!(h.iter().count(), 0);
        engine.close().unwrap();
    }
}
