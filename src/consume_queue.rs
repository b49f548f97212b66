//! Per-(topic, queue) logical index into the commit log
//!
//! Each consume queue is a stream of fixed 20-byte entries
//! `{commit-log offset: i64, size: i32, tags code: i64}` appended in strict
//! logical-offset order by the dispatch service. Consumers address messages
//! by logical offset; the entry maps that to the physical record.
//!
//! The store owns all queues through [`ConsumeQueueTable`], a two-level map
//! (topic, then queue id) with double-checked lazy creation, mirroring the
//! read-mostly access pattern: resolve under a short read lock, then operate
//! on the queue without further table locking.

use crate::error::Result;
use crate::mapped_queue::MappedQueue;
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fixed size of one consume-queue entry
pub const CQ_UNIT_SIZE: usize = 20;

/// One (topic, queue id) logical index
pub struct ConsumeQueue {
    topic: String,
    queue_id: i32,
    queue: MappedQueue,
    /// Commit-log frontier covered by this queue (offset + size of the last entry)
    max_physic_offset: AtomicI64,
    /// Byte-offset floor below which entries were retired by retention
    min_logic_offset: AtomicI64,
}

impl ConsumeQueue {
    pub fn new(topic: &str, queue_id: i32, root: &PathBuf, file_size: usize) -> Self {
        let dir = root.join(topic).join(queue_id.to_string());
        Self {
            topic: topic.to_string(),
            queue_id,
            queue: MappedQueue::new(dir, file_size, None),
            max_physic_offset: AtomicI64::new(0),
            min_logic_offset: AtomicI64::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn queue_id(&self) -> i32 {
        self.queue_id
    }

    /// Open existing segments from disk
    pub fn load(&self) -> Result<()> {
        self.queue.load()?;
        self.min_logic_offset
            .store(self.queue.min_offset() as i64, Ordering::Release);
        Ok(())
    }

    /// Walk entries from (at most) the third-from-last segment forward to
    /// find the valid frontier, then truncate beyond it. An entry is valid
    /// while its commit-log offset and size are positive.
    pub fn recover(&self) {
        let num_files = self.queue.num_files();
        if num_files == 0 {
            return;
        }
        let file_size = self.queue.file_size();
        let start_index = num_files.saturating_sub(3);
        let mut current = self.queue.min_offset() + (start_index * file_size) as u64;
        let mut valid = current;
        let mut max_physic = 0i64;

        while let Some(file) = self.queue.file_by_offset(current, false) {
            let mut pos = 0usize;
            let mut stopped = false;
            while pos + CQ_UNIT_SIZE <= file_size {
                let Some(mut buf) = file.read(pos, CQ_UNIT_SIZE) else {
                    stopped = true;
                    break;
                };
                let offset_py = buf.get_i64();
                let size = buf.get_i32();
                if offset_py >= 0 && size > 0 {
                    pos += CQ_UNIT_SIZE;
                    max_physic = offset_py + size as i64;
                } else {
                    stopped = true;
                    break;
                }
            }
            valid = file.file_from_offset() + pos as u64;
            if stopped {
                break;
            }
            current = file.file_from_offset() + file_size as u64;
        }

        debug!(
            topic = %self.topic,
            queue_id = self.queue_id,
            valid_offset = valid,
            max_physic_offset = max_physic,
            "Consume queue recovered"
        );
        self.queue.truncate_dirty_tail(valid);
        if max_physic > 0 {
            self.max_physic_offset.store(max_physic, Ordering::Release);
        }
    }

    /// Append one entry at the given logical offset. Replays of an already
    /// present offset are accepted silently (recovery replay is idempotent);
    /// forward gaps are zero-filled with a warning so the offset arithmetic
    /// never skews.
    pub fn put_entry(
        &self,
        commitlog_offset: i64,
        size: i32,
        tags_code: i64,
        logic_offset: i64,
    ) -> Result<()> {
        let expected_pos = logic_offset as u64 * CQ_UNIT_SIZE as u64;
        let current_max = self.queue.max_offset();

        if expected_pos < current_max {
            debug!(
                topic = %self.topic,
                queue_id = self.queue_id,
                logic_offset,
                "Repeated consume-queue entry ignored"
            );
            return Ok(());
        }
        if expected_pos > current_max {
            warn!(
                topic = %self.topic,
                queue_id = self.queue_id,
                expected = expected_pos,
                current = current_max,
                "Consume queue gap, zero-filling"
            );
            let blank = [0u8; CQ_UNIT_SIZE];
            let mut at = current_max;
            while at < expected_pos {
                let file = self.queue.current_append_file_or_create(at)?;
                file.append(&blank)?;
                at += CQ_UNIT_SIZE as u64;
            }
        }

        let mut buf = BytesMut::with_capacity(CQ_UNIT_SIZE);
        buf.put_i64(commitlog_offset);
        buf.put_i32(size);
        buf.put_i64(tags_code);

        let file = self.queue.current_append_file_or_create(expected_pos)?;
        file.append(&buf)?;
        self.max_physic_offset
            .store(commitlog_offset + size as i64, Ordering::Release);
        Ok(())
    }

    /// Entry at a logical offset: `(commitlog_offset, size, tags_code)`
    pub fn get_entry(&self, logic_offset: i64) -> Option<(i64, i32, i64)> {
        if logic_offset < 0 {
            return None;
        }
        let byte_pos = logic_offset as u64 * CQ_UNIT_SIZE as u64;
        if (byte_pos as i64) < self.min_logic_offset.load(Ordering::Acquire) {
            return None;
        }
        let file = self.queue.file_by_offset(byte_pos, false)?;
        let in_file = (byte_pos - file.file_from_offset()) as usize;
        if in_file + CQ_UNIT_SIZE > file.wrote_position() {
            return None;
        }
        let mut buf = file.read(in_file, CQ_UNIT_SIZE)?;
        let offset = buf.get_i64();
        let size = buf.get_i32();
        let tags_code = buf.get_i64();
        if size <= 0 {
            return None;
        }
        Some((offset, size, tags_code))
    }

    /// One past the last logical offset
    pub fn max_offset_in_queue(&self) -> i64 {
        (self.queue.max_offset() / CQ_UNIT_SIZE as u64) as i64
    }

    /// Smallest logical offset still readable
    pub fn min_offset_in_queue(&self) -> i64 {
        self.min_logic_offset.load(Ordering::Acquire) / CQ_UNIT_SIZE as i64
    }

    /// Commit-log frontier covered by this queue
    pub fn max_physic_offset(&self) -> i64 {
        self.max_physic_offset.load(Ordering::Acquire)
    }

    /// First logical offset whose record's store timestamp is >= `timestamp`.
    /// Entries are monotonic in both logical offset and store time, so this
    /// is a binary search; `store_ts_of(offset, size)` reads the referenced
    /// record's store timestamp out of the commit log.
    pub fn offset_by_timestamp(
        &self,
        timestamp: i64,
        store_ts_of: impl Fn(i64, i32) -> Option<i64>,
    ) -> i64 {
        let mut low = self.min_offset_in_queue();
        let mut high = self.max_offset_in_queue() - 1;
        if high < low {
            return low;
        }
        let mut answer = high + 1;
        while low <= high {
            let mid = low + (high - low) / 2;
            match self.get_entry(mid).and_then(|(o, s, _)| store_ts_of(o, s)) {
                Some(ts) if ts >= timestamp => {
                    answer = mid;
                    high = mid - 1;
                }
                Some(_) => low = mid + 1,
                // Unreadable entry (already retired); move up.
                None => low = mid + 1,
            }
        }
        answer
    }

    /// Drop entries whose referenced commit-log offset extends beyond the
    /// recovered commit-log frontier. Walks backward from the tail.
    pub fn truncate_dirty_logic_files(&self, max_valid_commitlog_offset: i64) {
        let min = self.min_offset_in_queue();
        let mut logic = self.max_offset_in_queue() - 1;
        let mut valid_bytes = min as u64 * CQ_UNIT_SIZE as u64;

        while logic >= min {
            match self.get_entry(logic) {
                Some((offset, size, _)) if offset + size as i64 <= max_valid_commitlog_offset => {
                    valid_bytes = (logic as u64 + 1) * CQ_UNIT_SIZE as u64;
                    self.max_physic_offset
                        .store(offset + size as i64, Ordering::Release);
                    break;
                }
                _ => logic -= 1,
            }
        }

        if valid_bytes < self.queue.max_offset() {
            info!(
                topic = %self.topic,
                queue_id = self.queue_id,
                valid_bytes,
                max_valid_commitlog_offset,
                "Truncating dirty consume-queue entries"
            );
            self.queue.truncate_dirty_tail(valid_bytes);
            if logic < min {
                self.max_physic_offset.store(0, Ordering::Release);
            }
        }
    }

    /// Retire whole segments fully below the commit-log floor, then advance
    /// the minimum logical offset within the new first segment.
    pub fn delete_expired_by_offset(&self, min_commitlog_offset: i64) -> usize {
        let deleted = self
            .queue
            .delete_expired_by_offset(min_commitlog_offset, CQ_UNIT_SIZE);
        self.correct_min_offset(min_commitlog_offset);
        deleted
    }

    /// Recompute the minimum readable logical offset against the commit-log
    /// floor (the first segment may contain a mix of retired and live refs).
    pub fn correct_min_offset(&self, min_commitlog_offset: i64) {
        let Some(first) = self.queue.first_file() else {
            return;
        };
        let base = first.file_from_offset();
        let wrote = first.wrote_position();
        let mut pos = 0usize;
        while pos + CQ_UNIT_SIZE <= wrote {
            let Some(mut buf) = first.read(pos, CQ_UNIT_SIZE) else {
                break;
            };
            let offset_py = buf.get_i64();
            if offset_py >= min_commitlog_offset {
                break;
            }
            pos += CQ_UNIT_SIZE;
        }
        self.min_logic_offset
            .store((base + pos as u64) as i64, Ordering::Release);
    }

    /// Flush dirty entries to disk
    pub fn flush(&self) -> Result<u64> {
        self.queue.flush()
    }

    /// Delete all segments for this queue
    pub fn destroy(&self) -> Result<()> {
        self.max_physic_offset.store(0, Ordering::Release);
        self.min_logic_offset.store(0, Ordering::Release);
        self.queue.destroy()
    }
}

/// Store-owned registry of consume queues, keyed by topic then queue id
pub struct ConsumeQueueTable {
    root: PathBuf,
    file_size: usize,
    table: RwLock<HashMap<String, HashMap<i32, Arc<ConsumeQueue>>>>,
}

impl ConsumeQueueTable {
    pub fn new(root: PathBuf, file_size: usize) -> Self {
        Self {
            root,
            file_size,
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Discover and load every queue directory under the root
    pub fn load(&self) -> Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        let mut table = self.table.write();
        for topic_entry in std::fs::read_dir(&self.root)? {
            let topic_entry = topic_entry?;
            if !topic_entry.file_type()?.is_dir() {
                continue;
            }
            let topic = topic_entry.file_name().to_string_lossy().to_string();
            for queue_entry in std::fs::read_dir(topic_entry.path())? {
                let queue_entry = queue_entry?;
                let Ok(queue_id) = queue_entry.file_name().to_string_lossy().parse::<i32>() else {
                    continue;
                };
                let cq = Arc::new(ConsumeQueue::new(&topic, queue_id, &self.root, self.file_size));
                cq.load()?;
                table.entry(topic.clone()).or_default().insert(queue_id, cq);
            }
        }
        info!(
            topics = table.len(),
            "Loaded consume-queue table"
        );
        Ok(())
    }

    /// Existing queue, if any
    pub fn find(&self, topic: &str, queue_id: i32) -> Option<Arc<ConsumeQueue>> {
        self.table
            .read()
            .get(topic)
            .and_then(|m| m.get(&queue_id))
            .cloned()
    }

    /// Queue for (topic, queue id), lazily created on first use
    pub fn find_or_create(&self, topic: &str, queue_id: i32) -> Arc<ConsumeQueue> {
        if let Some(cq) = self.find(topic, queue_id) {
            return cq;
        }
        let mut table = self.table.write();
        table
            .entry(topic.to_string())
            .or_default()
            .entry(queue_id)
            .or_insert_with(|| {
                Arc::new(ConsumeQueue::new(topic, queue_id, &self.root, self.file_size))
            })
            .clone()
    }

    /// Visit every queue
    pub fn for_each(&self, mut f: impl FnMut(&Arc<ConsumeQueue>)) {
        for queues in self.table.read().values() {
            for cq in queues.values() {
                f(cq);
            }
        }
    }

    /// Recover every queue; returns the highest commit-log offset any queue
    /// references (the dispatch watermark candidate).
    pub fn recover_all(&self) -> i64 {
        let mut max_physic = 0;
        self.for_each(|cq| {
            cq.recover();
            max_physic = max_physic.max(cq.max_physic_offset());
        });
        max_physic
    }

    /// Truncate every queue against the recovered commit-log frontier
    pub fn truncate_dirty(&self, max_valid_commitlog_offset: i64) {
        self.for_each(|cq| cq.truncate_dirty_logic_files(max_valid_commitlog_offset));
    }

    /// Flush every queue; returns the smallest per-queue covered commit-log
    /// frontier (0 when the table is empty).
    pub fn flush_all(&self) -> Result<()> {
        let mut result = Ok(());
        self.for_each(|cq| {
            if let Err(e) = cq.flush() {
                warn!(topic = %cq.topic(), queue_id = cq.queue_id(), error = %e, "Consume queue flush failed");
                result = Err(e);
            }
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_cq(root: &PathBuf) -> ConsumeQueue {
        // 10 entries per segment file
        ConsumeQueue::new("topicA", 0, root, 10 * CQ_UNIT_SIZE)
    }

    #[test]
    fn test_put_get_round_trip() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let cq = small_cq(&root);

        for i in 0..25i64 {
            cq.put_entry(i * 100, 100, i, i).unwrap();
        }

        assert_eq!(cq.max_offset_in_queue(), 25);
        assert_eq!(cq.min_offset_in_queue(), 0);
        assert_eq!(cq.get_entry(0), Some((0, 100, 0)));
        assert_eq!(cq.get_entry(24), Some((2400, 100, 24)));
        assert_eq!(cq.get_entry(25), None);
        assert_eq!(cq.max_physic_offset(), 2500);
    }

    #[test]
    fn test_put_repeated_offset_is_idempotent() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let cq = small_cq(&root);

        cq.put_entry(0, 100, 7, 0).unwrap();
        cq.put_entry(100, 100, 8, 1).unwrap();
        // Replay of offset 0 must not move the frontier or clobber entry 1.
        cq.put_entry(0, 100, 7, 0).unwrap();

        assert_eq!(cq.max_offset_in_queue(), 2);
        assert_eq!(cq.get_entry(1), Some((100, 100, 8)));
    }

    #[test]
    fn test_recover_finds_frontier() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        {
            let cq = small_cq(&root);
            for i in 0..12i64 {
                cq.put_entry(i * 50, 50, 0, i).unwrap();
            }
            cq.flush().unwrap();
        }
        let cq = small_cq(&root);
        cq.load().unwrap();
        cq.recover();
        assert_eq!(cq.max_offset_in_queue(), 12);
        assert_eq!(cq.max_physic_offset(), 12 * 50);
    }

    #[test]
    fn test_truncate_dirty_logic_files() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let cq = small_cq(&root);
        for i in 0..10i64 {
            cq.put_entry(i * 100, 100, 0, i).unwrap();
        }

        // Commit log only survived up to offset 500.
        cq.truncate_dirty_logic_files(500);
        assert_eq!(cq.max_offset_in_queue(), 5);
        assert_eq!(cq.get_entry(4), Some((400, 100, 0)));
        assert_eq!(cq.get_entry(5), None);
    }

    #[test]
    fn test_offset_by_timestamp() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let cq = small_cq(&root);
        for i in 0..8i64 {
            cq.put_entry(i * 10, 10, 0, i).unwrap();
        }
        // Store timestamps: entry i has timestamp 1000 + i*10.
        let ts_of = |offset: i64, _size: i32| Some(1000 + offset);

        assert_eq!(cq.offset_by_timestamp(1000, ts_of), 0);
        assert_eq!(cq.offset_by_timestamp(1035, ts_of), 4);
        assert_eq!(cq.offset_by_timestamp(1070, ts_of), 7);
        // Past the newest entry: one past the end.
        assert_eq!(cq.offset_by_timestamp(9999, ts_of), 8);
    }

    #[test]
    fn test_table_find_or_create() {
        let dir = tempdir().unwrap();
        let table = ConsumeQueueTable::new(dir.path().to_path_buf(), 10 * CQ_UNIT_SIZE);

        let a = table.find_or_create("t1", 0);
        let b = table.find_or_create("t1", 0);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(table.find("t1", 1).is_none());
        table.find_or_create("t1", 1);
        table.find_or_create("t2", 0);

        let mut count = 0;
        table.for_each(|_| count += 1);
        assert_eq!(count, 3);
    }

    #[test]
    fn test_delete_expired_by_offset() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let cq = small_cq(&root);
        for i in 0..30i64 {
            cq.put_entry(i * 100, 100, 0, i).unwrap();
        }
        // Everything below commit-log offset 1500 is gone; first segment
        // (entries 0..10, offsets 0..1000) is fully below it.
        let deleted = cq.delete_expired_by_offset(1500);
        assert_eq!(deleted, 1);
        assert_eq!(cq.min_offset_in_queue(), 15);
        assert_eq!(cq.get_entry(9), None);
        assert_eq!(cq.get_entry(15), Some((1500, 100, 0)));
    }

    #[test]
    fn test_retired_floor_survives_reload() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        {
            let cq = small_cq(&root);
            for i in 0..30i64 {
                cq.put_entry(i * 100, 100, 0, i).unwrap();
            }
            cq.delete_expired_by_offset(1500);
            assert_eq!(cq.min_offset_in_queue(), 15);
            cq.flush().unwrap();
        }

        // Restart: load alone only sees the first surviving segment, so the
        // floor must be corrected against the commit-log minimum again.
        let cq = small_cq(&root);
        cq.load().unwrap();
        cq.recover();
        cq.correct_min_offset(1500);

        assert_eq!(cq.min_offset_in_queue(), 15);
        assert_eq!(cq.get_entry(12), None);
        assert_eq!(cq.get_entry(15), Some((1500, 100, 0)));
    }
}
