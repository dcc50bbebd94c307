//! Table writer — builds one `.sstx`/`.ssty` pair from a sorted stream.
//!
//! # Input Requirements
//!
//! Entries **must** arrive in strictly ascending key order with no
//! duplicates; the upstream merge already resolved per-key versions.
//! Tombstones may be written (the format carries them), though compaction
//! normally cancels them before they reach a builder.
//!
//! # Atomicity
//!
//! Both files are written to `.tmp` paths, fsynced, then renamed. The
//! data file is renamed before the index file; a table without its index
//! is invisible to the store and is swept as an orphan on the next open.

use std::fs::{File, OpenOptions, rename};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bloomfilter::Bloom;
use bytes::Bytes;

use crate::codec::{crc32c_seeded, put_varint_u32};
use crate::kv::KvItem;

use super::{
    SST_BLOCK_SIZE, SST_TAG_FP_RATE, SSTY_FLAG_CKEYS, SSTY_FLAG_TAGS, SSTY_MAGIC, SSTY_VERSION,
    SstError, sstx_path, ssty_path,
};

// ------------------------------------------------------------------------------------------------
// TableBuilder
// ------------------------------------------------------------------------------------------------

/// Streaming writer for one table pair.
pub struct TableBuilder {
    dir: PathBuf,
    id: u64,
    ckeys: bool,
    tags: bool,

    data: BufWriter<File>,
    data_tmp: PathBuf,
    data_off: u64,

    block: Vec<u8>,
    block_first_key: Option<Bytes>,
    prev_key: Vec<u8>,

    index: Vec<(Bytes, u64, u32)>,
    tag_crcs: Vec<u32>,

    record_count: u64,
    tombstone_count: u64,
    min_key: Option<Bytes>,
    max_key: Option<Bytes>,
}

impl TableBuilder {
    /// Creates the builder and its temporary data file.
    pub fn new(dir: &Path, id: u64, ckeys: bool, tags: bool) -> Result<Self, SstError> {
        let data_tmp = sstx_path(dir, id).with_extension("sstx.tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&data_tmp)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            id,
            ckeys,
            tags,
            data: BufWriter::new(file),
            data_tmp,
            data_off: 0,
            block: Vec::with_capacity(SST_BLOCK_SIZE + 256),
            block_first_key: None,
            prev_key: Vec::new(),
            index: Vec::new(),
            tag_crcs: Vec::new(),
            record_count: 0,
            tombstone_count: 0,
            min_key: None,
            max_key: None,
        })
    }

    /// Appends one entry; keys must arrive in strictly ascending order.
    pub fn add(&mut self, item: &KvItem) -> Result<(), SstError> {
        debug_assert!(
            self.max_key
                .as_ref()
                .is_none_or(|m| m.as_ref() < item.key.as_ref()),
            "builder keys must be strictly ascending"
        );

        let entry_est = item.key.len() + item.value.len() + 12;
        if !self.block.is_empty() && self.block.len() + entry_est > SST_BLOCK_SIZE {
            self.flush_block()?;
        }

        if self.block.is_empty() {
            self.block_first_key = Some(item.key.clone());
            self.prev_key.clear();
        }

        if self.ckeys {
            let shared = shared_prefix(&self.prev_key, &item.key);
            put_varint_u32(&mut self.block, shared as u32);
            put_varint_u32(&mut self.block, (item.key.len() - shared) as u32);
            put_varint_u32(&mut self.block, item.vlen_ts());
            self.block.extend_from_slice(&item.key[shared..]);
        } else {
            put_varint_u32(&mut self.block, item.key.len() as u32);
            put_varint_u32(&mut self.block, item.vlen_ts());
            self.block.extend_from_slice(&item.key);
        }
        if !item.tombstone {
            self.block.extend_from_slice(&item.value);
        }

        self.prev_key.clear();
        self.prev_key.extend_from_slice(&item.key);

        if self.tags {
            self.tag_crcs.push(crate::kv::key_crc(&item.key));
        }
        self.record_count += 1;
        if item.tombstone {
            self.tombstone_count += 1;
        }
        if self.min_key.is_none() {
            self.min_key = Some(item.key.clone());
        }
        self.max_key = Some(item.key.clone());
        Ok(())
    }

    /// Bytes written to the data file so far, current block included.
    pub fn data_size(&self) -> u64 {
        self.data_off + self.block.len() as u64
    }

    /// The table id this builder writes.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Finishes both files and atomically installs them.
    ///
    /// Returns the final data size. Callers skip `finish` entirely for
    /// empty outputs (the temp file is cleaned up on drop).
    pub fn finish(mut self) -> Result<u64, SstError> {
        self.flush_block()?;
        self.data.flush()?;
        self.data.get_ref().sync_all()?;

        // Index file.
        let mut body = Vec::new();
        body.extend_from_slice(&SSTY_MAGIC);
        body.extend_from_slice(&SSTY_VERSION.to_le_bytes());
        let mut flags = 0u32;
        if self.ckeys {
            flags |= SSTY_FLAG_CKEYS;
        }
        if self.tags && !self.tag_crcs.is_empty() {
            flags |= SSTY_FLAG_TAGS;
        }
        body.extend_from_slice(&flags.to_le_bytes());
        body.extend_from_slice(&self.id.to_le_bytes());
        body.extend_from_slice(&self.data_off.to_le_bytes());
        body.extend_from_slice(&self.record_count.to_le_bytes());
        body.extend_from_slice(&self.tombstone_count.to_le_bytes());

        body.extend_from_slice(&(self.index.len() as u32).to_le_bytes());
        for (first_key, off, len) in &self.index {
            put_varint_u32(&mut body, first_key.len() as u32);
            body.extend_from_slice(first_key);
            body.extend_from_slice(&off.to_le_bytes());
            body.extend_from_slice(&len.to_le_bytes());
        }

        if self.tags && !self.tag_crcs.is_empty() {
            let mut bloom: Bloom<u32> =
                Bloom::new_for_fp_rate(self.tag_crcs.len(), SST_TAG_FP_RATE)
                    .map_err(|e| SstError::Internal(e.to_string()))?;
            for crc in &self.tag_crcs {
                bloom.set(crc);
            }
            let raw = bloom.as_slice();
            body.extend_from_slice(&(raw.len() as u32).to_le_bytes());
            body.extend_from_slice(raw);
        } else {
            body.extend_from_slice(&0u32.to_le_bytes());
        }

        let min_key = self.min_key.take().unwrap_or_default();
        let max_key = self.max_key.take().unwrap_or_default();
        put_varint_u32(&mut body, min_key.len() as u32);
        body.extend_from_slice(&min_key);
        put_varint_u32(&mut body, max_key.len() as u32);
        body.extend_from_slice(&max_key);

        let crc = crc32c_seeded(&body);
        body.extend_from_slice(&crc.to_le_bytes());

        let ssty_tmp = ssty_path(&self.dir, self.id).with_extension("ssty.tmp");
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&ssty_tmp)?;
            f.write_all(&body)?;
            f.sync_all()?;
        }

        // Data file first; an index without data would be corruption, a
        // data file without an index is just an orphan.
        rename(&self.data_tmp, sstx_path(&self.dir, self.id))?;
        rename(&ssty_tmp, ssty_path(&self.dir, self.id))?;

        Ok(self.data_off)
    }

    fn flush_block(&mut self) -> Result<(), SstError> {
        if self.block.is_empty() {
            return Ok(());
        }
        let crc = crc32c_seeded(&self.block);
        let frame_len = (self.block.len() + super::SST_BLOCK_FRAME) as u32;
        self.data
            .write_all(&(self.block.len() as u32).to_le_bytes())?;
        self.data.write_all(&self.block)?;
        self.data.write_all(&crc.to_le_bytes())?;

        let first = self
            .block_first_key
            .take()
            .expect("non-empty block has a first key");
        self.index.push((first, self.data_off, frame_len));
        self.data_off += frame_len as u64;
        self.block.clear();
        Ok(())
    }
}

impl Drop for TableBuilder {
    fn drop(&mut self) {
        // Unfinished builds leave no temp litter behind.
        let _ = std::fs::remove_file(&self.data_tmp);
        let _ = std::fs::remove_file(ssty_path(&self.dir, self.id).with_extension("ssty.tmp"));
    }
}

fn shared_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
