//! Key/time secondary index
//!
//! Hash-bucketed index over message keys, spanning rolling files so point
//! and range lookups never scan the commit log. Each file is
//! `header(40B) + slot table(slots x 4B) + entries(n x 20B)`: a slot holds
//! the most-recent entry index for its bucket, and every entry links to the
//! previous one in the bucket, newest-first. Entry index 0 is reserved as
//! the end-of-chain marker.
//!
//! Files are named by their creation timestamp; the header records the
//! covering time and physical-offset ranges so queries prune whole files
//! and retention can drop them alongside expired commit-log segments.

use crate::error::Result;
use crate::mapped_file::MappedFile;
use crate::message::string_hash;
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Header size: begin_ts, end_ts, begin_phy, end_phy (i64 each),
/// hash_slot_count, index_count (i32 each)
const INDEX_HEADER_SIZE: usize = 40;
/// Bytes per hash slot (entry index of the bucket head)
const HASH_SLOT_SIZE: usize = 4;
/// Bytes per entry: key_hash i32, phy_offset i64, time_diff i32, prev_index i32
const INDEX_ENTRY_SIZE: usize = 20;

/// One rolling index file
pub struct IndexFile {
    file: MappedFile,
    hash_slots: usize,
    max_entries: usize,
    begin_timestamp: AtomicI64,
    end_timestamp: AtomicI64,
    begin_phy_offset: AtomicI64,
    end_phy_offset: AtomicI64,
    /// Next free entry index; starts at 1 (0 = end of chain)
    index_count: AtomicI32,
}

impl IndexFile {
    fn capacity(hash_slots: usize, max_entries: usize) -> usize {
        INDEX_HEADER_SIZE + hash_slots * HASH_SLOT_SIZE + max_entries * INDEX_ENTRY_SIZE
    }

    /// Create a fresh file named by `timestamp` (millis)
    pub fn create(
        dir: &std::path::Path,
        timestamp: i64,
        hash_slots: usize,
        max_entries: usize,
    ) -> Result<Self> {
        let file = MappedFile::create(
            dir,
            timestamp as u64,
            Self::capacity(hash_slots, max_entries),
        )?;
        Ok(Self {
            file,
            hash_slots,
            max_entries,
            begin_timestamp: AtomicI64::new(0),
            end_timestamp: AtomicI64::new(0),
            begin_phy_offset: AtomicI64::new(0),
            end_phy_offset: AtomicI64::new(0),
            index_count: AtomicI32::new(1),
        })
    }

    /// Map an existing file and restore its header
    pub fn open(path: &std::path::Path, hash_slots: usize, max_entries: usize) -> Result<Self> {
        let file = MappedFile::open(path)?;
        let header = file
            .read(0, INDEX_HEADER_SIZE)
            .ok_or_else(|| crate::error::StoreError::corrupted("index header unreadable"))?;
        let mut buf = header;
        let begin_ts = buf.get_i64();
        let end_ts = buf.get_i64();
        let begin_phy = buf.get_i64();
        let end_phy = buf.get_i64();
        let _slots = buf.get_i32();
        let count = buf.get_i32();
        Ok(Self {
            file,
            hash_slots,
            max_entries,
            begin_timestamp: AtomicI64::new(begin_ts),
            end_timestamp: AtomicI64::new(end_ts),
            begin_phy_offset: AtomicI64::new(begin_phy),
            end_phy_offset: AtomicI64::new(end_phy),
            index_count: AtomicI32::new(count.max(1)),
        })
    }

    pub fn is_full(&self) -> bool {
        self.index_count.load(Ordering::Acquire) >= self.max_entries as i32
    }

    pub fn begin_timestamp(&self) -> i64 {
        self.begin_timestamp.load(Ordering::Acquire)
    }

    pub fn end_timestamp(&self) -> i64 {
        self.end_timestamp.load(Ordering::Acquire)
    }

    pub fn end_phy_offset(&self) -> i64 {
        self.end_phy_offset.load(Ordering::Acquire)
    }

    /// Whether this file's covering time range intersects `[begin, end]`
    pub fn time_matched(&self, begin: i64, end: i64) -> bool {
        self.begin_timestamp() <= end && self.end_timestamp() >= begin
    }

    /// Prepend one entry into its hash bucket. Returns false when full.
    pub fn put(&self, key_hash: i32, phy_offset: i64, size: i32, store_ts: i64) -> Result<bool> {
        let entry_index = self.index_count.load(Ordering::Acquire);
        if entry_index >= self.max_entries as i32 {
            return Ok(false);
        }

        let slot = (key_hash as u32 as usize) % self.hash_slots;
        let slot_pos = INDEX_HEADER_SIZE + slot * HASH_SLOT_SIZE;
        let prev_index = self
            .file
            .read(slot_pos, HASH_SLOT_SIZE)
            .map(|mut b| b.get_i32())
            .unwrap_or(0);
        let prev_index = if prev_index < 0 || prev_index >= entry_index {
            0
        } else {
            prev_index
        };

        if self.begin_timestamp() == 0 {
            self.begin_timestamp.store(store_ts, Ordering::Release);
            self.begin_phy_offset.store(phy_offset, Ordering::Release);
        }

        let time_diff = (store_ts - self.begin_timestamp()).clamp(0, i32::MAX as i64) as i32;
        let entry_pos = INDEX_HEADER_SIZE
            + self.hash_slots * HASH_SLOT_SIZE
            + entry_index as usize * INDEX_ENTRY_SIZE;

        let mut entry = BytesMut::with_capacity(INDEX_ENTRY_SIZE);
        entry.put_i32(key_hash);
        entry.put_i64(phy_offset);
        entry.put_i32(time_diff);
        entry.put_i32(prev_index);
        self.file.write_at(entry_pos, &entry)?;
        self.file
            .write_at(slot_pos, &entry_index.to_be_bytes())?;

        self.index_count.store(entry_index + 1, Ordering::Release);
        self.end_timestamp.store(store_ts, Ordering::Release);
        self.end_phy_offset
            .store(phy_offset + size as i64, Ordering::Release);
        self.write_header()?;
        Ok(true)
    }

    /// Walk the bucket chain for `key_hash`, newest-first, filtering by
    /// exact hash and time window, bounded by `max_chain_depth`.
    pub fn select(
        &self,
        key_hash: i32,
        begin_ts: i64,
        end_ts: i64,
        max_results: usize,
        max_chain_depth: usize,
        out: &mut Vec<i64>,
    ) {
        let slot = (key_hash as u32 as usize) % self.hash_slots;
        let slot_pos = INDEX_HEADER_SIZE + slot * HASH_SLOT_SIZE;
        let mut next = self
            .file
            .read(slot_pos, HASH_SLOT_SIZE)
            .map(|mut b| b.get_i32())
            .unwrap_or(0);

        let mut steps = 0;
        while next > 0
            && next < self.index_count.load(Ordering::Acquire)
            && out.len() < max_results
            && steps < max_chain_depth
        {
            let entry_pos = INDEX_HEADER_SIZE
                + self.hash_slots * HASH_SLOT_SIZE
                + next as usize * INDEX_ENTRY_SIZE;
            let Some(mut entry) = self.file.read(entry_pos, INDEX_ENTRY_SIZE) else {
                break;
            };
            let hash = entry.get_i32();
            let phy_offset = entry.get_i64();
            let time_diff = entry.get_i32();
            let prev = entry.get_i32();

            let ts = self.begin_timestamp() + time_diff as i64;
            if hash == key_hash && ts >= begin_ts && ts <= end_ts {
                out.push(phy_offset);
            }
            if prev <= 0 || prev == next {
                break;
            }
            next = prev;
            steps += 1;
        }
    }

    fn write_header(&self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(INDEX_HEADER_SIZE);
        buf.put_i64(self.begin_timestamp());
        buf.put_i64(self.end_timestamp());
        buf.put_i64(self.begin_phy_offset.load(Ordering::Acquire));
        buf.put_i64(self.end_phy_offset());
        buf.put_i32(self.hash_slots as i32);
        buf.put_i32(self.index_count.load(Ordering::Acquire));
        self.file.write_at(0, &buf)
    }

    pub fn flush(&self) -> Result<()> {
        self.write_header()?;
        self.file.flush()?;
        Ok(())
    }

    pub fn destroy(&self) -> Result<()> {
        self.file.destroy()
    }
}

/// Rolling set of index files plus the put/query/retention surface
pub struct IndexService {
    dir: PathBuf,
    hash_slots: usize,
    max_entries: usize,
    max_chain_depth: usize,
    files: RwLock<Vec<Arc<IndexFile>>>,
}

impl IndexService {
    pub fn new(dir: PathBuf, hash_slots: usize, max_entries: usize, max_chain_depth: usize) -> Self {
        Self {
            dir,
            hash_slots,
            max_entries,
            max_chain_depth,
            files: RwLock::new(Vec::new()),
        }
    }

    /// Open existing index files, oldest first
    pub fn load(&self) -> Result<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        paths.sort();

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            match IndexFile::open(&path, self.hash_slots, self.max_entries) {
                Ok(file) => files.push(Arc::new(file)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Dropping unreadable index file");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        if !files.is_empty() {
            info!(files = files.len(), "Loaded index files");
        }
        *self.files.write() = files;
        Ok(())
    }

    /// Commit-log offset frontier already indexed (replay idempotency bound)
    pub fn indexed_phy_offset(&self) -> i64 {
        self.files
            .read()
            .last()
            .map(|f| f.end_phy_offset())
            .unwrap_or(0)
    }

    /// Index every key of one message. A message whose record sits below the
    /// indexed frontier was already indexed before a restart and is skipped,
    /// keeping dispatch replay idempotent.
    pub fn put_message_keys(
        &self,
        topic: &str,
        keys: &[String],
        phy_offset: i64,
        size: i32,
        store_ts: i64,
    ) -> Result<()> {
        if keys.is_empty() || phy_offset < self.indexed_phy_offset() {
            return Ok(());
        }
        for key in keys {
            let hash = string_hash(&format!("{}#{}", topic, key));
            loop {
                let file = self.writable_file(store_ts)?;
                if file.put(hash, phy_offset, size, store_ts)? {
                    break;
                }
                debug!("Index file full, rolling");
            }
        }
        Ok(())
    }

    fn writable_file(&self, now_ts: i64) -> Result<Arc<IndexFile>> {
        {
            let files = self.files.read();
            if let Some(last) = files.last() {
                if !last.is_full() {
                    return Ok(last.clone());
                }
            }
        }
        let mut files = self.files.write();
        if let Some(last) = files.last() {
            if !last.is_full() {
                return Ok(last.clone());
            }
        }
        // Creation timestamps name the files; nudge forward to stay unique.
        let ts = files
            .last()
            .map(|f| (f.file.file_from_offset() as i64 + 1).max(now_ts))
            .unwrap_or(now_ts);
        let file = Arc::new(IndexFile::create(
            &self.dir,
            ts,
            self.hash_slots,
            self.max_entries,
        )?);
        files.push(file.clone());
        Ok(file)
    }

    /// Physical offsets of records matching `key` within `[begin_ts, end_ts]`,
    /// newest-first, truncated to `max_results`.
    pub fn query_offsets(
        &self,
        topic: &str,
        key: &str,
        max_results: usize,
        begin_ts: i64,
        end_ts: i64,
    ) -> Vec<i64> {
        let hash = string_hash(&format!("{}#{}", topic, key));
        let files: Vec<_> = self.files.read().clone();
        let mut out = Vec::new();
        for file in files.iter().rev() {
            if out.len() >= max_results {
                break;
            }
            if file.time_matched(begin_ts, end_ts) {
                file.select(hash, begin_ts, end_ts, max_results, self.max_chain_depth, &mut out);
            }
        }
        out.truncate(max_results);
        out
    }

    /// Drop trailing files that index records beyond the recovered commit-log
    /// frontier. Whole files go, not entries: a file mixing valid and dirty
    /// offsets is sacrificed so the indexed watermark never exceeds the
    /// commit log (otherwise fresh appends at the recovered frontier would be
    /// skipped as already indexed).
    pub fn truncate_beyond(&self, max_phy_offset: i64) {
        let mut removed = Vec::new();
        {
            let mut files = self.files.write();
            while let Some(last) = files.last() {
                if last.end_phy_offset() > max_phy_offset {
                    removed.push(files.pop().expect("non-empty"));
                } else {
                    break;
                }
            }
        }
        for file in removed {
            warn!(
                end_phy = file.end_phy_offset(),
                max_phy_offset,
                "Dropping index file beyond the recovered commit log"
            );
            let _ = file.destroy();
        }
    }

    /// Drop files (never the writable tail) fully behind the commit-log
    /// floor or entirely older than the retention cutoff.
    pub fn delete_expired(&self, min_phy_offset: i64, cutoff_ts: i64) -> usize {
        let mut deleted = 0;
        loop {
            let candidate = {
                let mut files = self.files.write();
                if files.len() <= 1 {
                    break;
                }
                let front = files[0].clone();
                if front.end_phy_offset() < min_phy_offset || front.end_timestamp() < cutoff_ts {
                    files.remove(0);
                    Some(front)
                } else {
                    None
                }
            };
            match candidate {
                Some(file) => {
                    info!(
                        end_phy = file.end_phy_offset(),
                        end_ts = file.end_timestamp(),
                        "Deleting expired index file"
                    );
                    let _ = file.destroy();
                    deleted += 1;
                }
                None => break,
            }
        }
        deleted
    }

    /// Flush every file; returns the durable end timestamp for the checkpoint
    pub fn flush_all(&self) -> Result<i64> {
        let files: Vec<_> = self.files.read().clone();
        let mut last_ts = 0;
        for file in files {
            file.flush()?;
            last_ts = file.end_timestamp();
        }
        Ok(last_ts)
    }
}
