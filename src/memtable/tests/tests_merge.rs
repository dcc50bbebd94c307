//! Read-modify-write merge closures against memtable entries.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use bytes::Bytes;

    use crate::kv::KvRecord;
    use crate::memtable::{MemEntry, Memtable, MemtableGet};

    #[test]
    fn merge__closure_sees_none_for_absent_key() {
        let mt = Memtable::new();
        let key = Bytes::from_static(b"fresh");
        let stored = mt.merge(&key, |cur| {
            assert!(cur.is_none());
            Some(MemEntry {
                value: Bytes::from_static(b"init"),
                tombstone: false,
            })
        });
        assert!(stored);
        assert_eq!(mt.get(b"fresh"), MemtableGet::Put(Bytes::from_static(b"init")));
    }

    #[test]
    fn merge__closure_sees_current_entry() {
        let mt = Memtable::new();
        mt.insert(&KvRecord::new(b"ctr", b"1"));
        let key = Bytes::from_static(b"ctr");
        mt.merge(&key, |cur| {
            let cur = cur.expect("entry present");
            assert_eq!(cur.value.as_ref(), b"1");
            Some(MemEntry {
                value: Bytes::from_static(b"2"),
                tombstone: false,
            })
        });
        assert_eq!(mt.get(b"ctr"), MemtableGet::Put(Bytes::from_static(b"2")));
    }

    #[test]
    fn merge__returning_none_is_a_noop() {
        let mt = Memtable::new();
        mt.insert(&KvRecord::new(b"k", b"v"));
        let key = Bytes::from_static(b"k");
        let stored = mt.merge(&key, |_| None);
        assert!(!stored);
        assert_eq!(mt.get(b"k"), MemtableGet::Put(Bytes::from_static(b"v")));
    }

    #[test]
    fn merge__can_store_a_tombstone() {
        let mt = Memtable::new();
        mt.insert(&KvRecord::new(b"k", b"v"));
        let key = Bytes::from_static(b"k");
        mt.merge(&key, |_| {
            Some(MemEntry {
                value: Bytes::new(),
                tombstone: true,
            })
        });
        assert_eq!(mt.get(b"k"), MemtableGet::Tombstone);
    }

    #[test]
    fn merge__closure_sees_tombstone_entry_raw() {
        let mt = Memtable::new();
        mt.insert(&KvRecord::new_tombstone(b"k"));
        let key = Bytes::from_static(b"k");
        mt.merge(&key, |cur| {
            assert!(cur.expect("tombstone entry present").tombstone);
            None
        });
    }
}
