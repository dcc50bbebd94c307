//! Corruption handling: replay halts at the first bad record and the
//! invalid tail is scrubbed.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use std::os::unix::fs::FileExt;

    use crate::wal::WAL_FILES;
    use crate::wal::tests::helpers::*;
    use tempfile::TempDir;

    /// Flip one byte of the first key in the record body.
    fn corrupt_at(dir: &std::path::Path, offset: u64) {
        let f = std::fs::OpenOptions::new()
            .write(true)
            .read(true)
            .open(dir.join(WAL_FILES[0]))
            .unwrap();
        let mut b = [0u8; 1];
        f.read_exact_at(&mut b, offset).unwrap();
        b[0] ^= 0xFF;
        f.write_all_at(&b, offset).unwrap();
        f.sync_data().unwrap();
    }

    #[test]
    fn corruption__bad_crc_halts_replay_at_that_record() {
        let dir = TempDir::new().unwrap();
        {
            let (mut wal, _, _) = open_collect(dir.path(), 0);
            fill(&mut wal, 100, "key");
        }
        // Body starts at the first page boundary; clobber a byte a few
        // records in so a prefix still replays.
        corrupt_at(dir.path(), 4096 + 200);

        let (_, summary, recs) = open_collect(dir.path(), 0);
        assert!(summary.cur_records < 100, "replay should have halted early");
        assert_eq!(recs.len(), summary.cur_records);
        // The surviving prefix is intact and in order.
        for (i, (_, rec)) in recs.iter().enumerate() {
            assert_eq!(rec.key.as_ref(), format!("key_{i:06}").as_bytes());
        }
    }

    #[test]
    fn corruption__truncated_tail_record_is_dropped() {
        let dir = TempDir::new().unwrap();
        let full_len;
        {
            let (mut wal, _, _) = open_collect(dir.path(), 0);
            fill(&mut wal, 50, "key");
            full_len = std::fs::metadata(dir.path().join(WAL_FILES[0]))
                .unwrap()
                .len();
        }
        // Chop the file mid-record (not on a page boundary).
        let f = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join(WAL_FILES[0]))
            .unwrap();
        f.set_len(full_len - 2000).unwrap();
        f.sync_data().unwrap();

        let (_, summary, _) = open_collect(dir.path(), 0);
        assert!(summary.cur_records > 0);
        assert!(summary.cur_records < 50);
    }

    #[test]
    fn corruption__scrubbed_tail_does_not_block_later_appends() {
        let dir = TempDir::new().unwrap();
        {
            let (mut wal, _, _) = open_collect(dir.path(), 0);
            fill(&mut wal, 30, "key");
        }
        // Record layout here is 28 bytes; offset 61 lands inside the third
        // record's key, which the CRC covers.
        corrupt_at(dir.path(), 4096 + 2 * 28 + 5);

        let survivors;
        {
            let (mut wal, summary, _) = open_collect(dir.path(), 0);
            survivors = summary.cur_records;
            // New appends go past the scrubbed region.
            fill(&mut wal, 10, "fresh");
        }

        let (_, summary, recs) = open_collect(dir.path(), 0);
        assert_eq!(summary.cur_records, survivors + 10);
        let fresh: Vec<_> = recs
            .iter()
            .filter(|(_, r)| r.key.starts_with(b"fresh"))
            .collect();
        assert_eq!(fresh.len(), 10);
    }

    #[test]
    fn corruption__garbage_header_page_yields_empty_replay() {
        let dir = TempDir::new().unwrap();
        {
            let (mut wal, _, _) = open_collect(dir.path(), 0);
            fill(&mut wal, 5, "key");
        }
        // Wipe the whole file with garbage that parses as neither records
        // nor padding.
        let f = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join(WAL_FILES[0]))
            .unwrap();
        f.write_all_at(&vec![0xA5u8; 8192], 0).unwrap();
        f.set_len(8192).unwrap();
        f.sync_data().unwrap();

        let (_, summary, recs) = open_collect(dir.path(), u64::from_le_bytes([0xA5; 8])) ;
        assert_eq!(summary.cur_records, 0);
        assert!(recs.is_empty());
    }
}
