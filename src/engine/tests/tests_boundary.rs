//! Size limits and degenerate inputs at the public API.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::engine::tests::helpers::*;
    use crate::kv::KV_SIZE_MAX;
    use tempfile::TempDir;

    #[test]
    fn boundary__combined_size_at_limit_succeeds() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        let mut h = engine.handle().unwrap();

        let key = vec![b'k'; 500];
        let value = vec![b'v'; KV_SIZE_MAX - 500];
        assert!(h.put(&key, &value));
        assert_eq!(h.get(&key).map(|v| v.len()), Some(KV_SIZE_MAX - 500));
        engine.close().unwrap();
    }

    #[test]
    fn boundary__one_byte_over_limit_fails_without_state_change() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        let mut h = engine.handle().unwrap();

        let key = vec![b'k'; 500];
        let value = vec![b'v'; KV_SIZE_MAX - 499];
        let wal_before = engine.stats().wal_off;
        assert!(!h.put(&key, &value));
        assert!(!h.probe(&key));
        assert_eq!(engine.stats().wal_off, wal_before, "no state change");
        engine.close().unwrap();
    }

    #[test]
    fn boundary__oversized_key_rejected_everywhere() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        let mut h = engine.handle().unwrap();

        let key = vec![b'k'; KV_SIZE_MAX + 1];
        assert!(!h.put(&key, b""));
        assert!(!h.del(&key));
        assert!(!h.merge(&key, |_| crate::kv::MergeUpdate::Delete));
        engine.close().unwrap();
    }

    #[test]
    fn boundary__oversized_merge_result_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        let mut h = engine.handle().unwrap();

        h.put(b"k", b"small");
        let huge = bytes::Bytes::from(vec![b'v'; KV_SIZE_MAX]);
        assert!(!h.merge(b"k", move |_| crate::kv::MergeUpdate::Put(huge.clone())));
        // The old value is untouched.
        assert_eq!(h.get(b"k").as_deref(), Some(&b"small"[..]));
        engine.close().unwrap();
    }

    #[test]
    fn boundary__max_size_record_survives_compaction_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let engine = open(dir.path());
            let mut h = engine.handle().unwrap();
            let key = vec![b'k'; 100];
            let value = vec![b'v'; KV_SIZE_MAX - 100];
            assert!(h.put(&key, &value));
            engine.compact().unwrap();
            assert_eq!(h.get(&key).map(|v| v.len()), Some(KV_SIZE_MAX - 100));
            engine.close().unwrap();
        }
        let engine = reopen(dir.path());
        let mut h = engine.handle().unwrap();
        assert_eq!(
            h.get(&vec![b'k'; 100]).map(|v| v.len()),
            Some(KV_SIZE_MAX - 100)
        );
        engine.close().unwrap();
    }
}
