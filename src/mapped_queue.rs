//! Ordered set of segment files backing one append-only stream
//!
//! Both the commit log and every consume queue own a [`MappedQueue`]: a
//! strictly ordered, contiguous list of fixed-capacity [`MappedFile`]s.
//! Segment N starts exactly where segment N-1's capacity ends, so the file
//! covering any stream offset is found by arithmetic. Rolling to a new tail
//! is an atomic hand-off under the files write lock; readers either see the
//! old tail or the fully-created new one.

use crate::allocate::AllocateService;
use crate::error::{Result, StoreError};
use crate::mapped_file::{parse_offset_file_name, MappedFile};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Contiguous, ordered segment file set
pub struct MappedQueue {
    dir: PathBuf,
    file_size: usize,
    files: RwLock<Vec<Arc<MappedFile>>>,
    allocator: Option<Arc<AllocateService>>,
}

impl MappedQueue {
    pub fn new(dir: PathBuf, file_size: usize, allocator: Option<Arc<AllocateService>>) -> Self {
        Self {
            dir,
            file_size,
            files: RwLock::new(Vec::new()),
            allocator,
        }
    }

    /// Open every existing segment under the directory, oldest first.
    /// Gaps or size mismatches mean the set was corrupted outside the
    /// engine's control and are reported as such.
    pub fn load(&self) -> Result<()> {
        if !self.dir.exists() {
            return Ok(());
        }

        let mut offsets: Vec<u64> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(parse_offset_file_name)
            })
            .collect();
        offsets.sort_unstable();

        let mut files = Vec::with_capacity(offsets.len());
        for (i, offset) in offsets.iter().enumerate() {
            if i > 0 && *offset != offsets[i - 1] + self.file_size as u64 {
                return Err(StoreError::corrupted(format!(
                    "segment gap in {}: {} does not follow {}",
                    self.dir.display(),
                    offset,
                    offsets[i - 1]
                )));
            }
            let path = self.dir.join(crate::mapped_file::offset_file_name(*offset));
            let file = MappedFile::open(&path)?;
            if file.capacity() != self.file_size {
                return Err(StoreError::corrupted(format!(
                    "segment {} has size {}, expected {}",
                    path.display(),
                    file.capacity(),
                    self.file_size
                )));
            }
            files.push(Arc::new(file));
        }

        if !files.is_empty() {
            info!(
                dir = %self.dir.display(),
                segments = files.len(),
                "Loaded segment file set"
            );
        }
        *self.files.write() = files;
        Ok(())
    }

    /// Segment size this set was built with
    pub fn file_size(&self) -> usize {
        self.file_size
    }

    /// Number of live segments
    pub fn num_files(&self) -> usize {
        self.files.read().len()
    }

    /// First (oldest) segment, if any
    pub fn first_file(&self) -> Option<Arc<MappedFile>> {
        self.files.read().first().cloned()
    }

    /// Current tail segment, if any
    pub fn current_append_file(&self) -> Option<Arc<MappedFile>> {
        self.files.read().last().cloned()
    }

    /// Tail segment, rolling to a freshly allocated one when the current
    /// tail is full or the set is empty. `start_offset` seeds the first
    /// segment's base (aligned down to the file size).
    pub fn current_append_file_or_create(&self, start_offset: u64) -> Result<Arc<MappedFile>> {
        {
            let files = self.files.read();
            if let Some(tail) = files.last() {
                if !tail.is_full() {
                    return Ok(tail.clone());
                }
            }
        }

        let mut files = self.files.write();
        // Re-check under the write lock; another roller may have won.
        if let Some(tail) = files.last() {
            if !tail.is_full() {
                return Ok(tail.clone());
            }
        }

        let next_offset = match files.last() {
            Some(tail) => tail.file_from_offset() + self.file_size as u64,
            None => start_offset - start_offset % self.file_size as u64,
        };

        let file = match &self.allocator {
            Some(allocator) => {
                let file = allocator.fetch(&self.dir, next_offset, self.file_size)?;
                allocator.prepare(
                    self.dir.clone(),
                    next_offset + self.file_size as u64,
                    self.file_size,
                );
                file
            }
            None => MappedFile::create(&self.dir, next_offset, self.file_size)?,
        };

        let file = Arc::new(file);
        files.push(file.clone());
        debug!(
            dir = %self.dir.display(),
            offset = next_offset,
            "Rolled to new segment"
        );
        Ok(file)
    }

    /// Segment covering the stream offset. With `return_first_on_miss` a
    /// too-small offset resolves to the oldest segment (the data before it
    /// was retired by retention).
    pub fn file_by_offset(&self, offset: u64, return_first_on_miss: bool) -> Option<Arc<MappedFile>> {
        let files = self.files.read();
        let first = files.first()?;
        let last = files.last()?;

        if offset < first.file_from_offset()
            || offset >= last.file_from_offset() + self.file_size as u64
        {
            return if return_first_on_miss {
                Some(first.clone())
            } else {
                None
            };
        }

        let index = ((offset - first.file_from_offset()) / self.file_size as u64) as usize;
        files.get(index).cloned()
    }

    /// Smallest stream offset still present
    pub fn min_offset(&self) -> u64 {
        self.first_file()
            .map(|f| f.file_from_offset())
            .unwrap_or(0)
    }

    /// Stream offset of the append frontier
    pub fn max_offset(&self) -> u64 {
        self.current_append_file()
            .map(|f| f.file_from_offset() + f.wrote_position() as u64)
            .unwrap_or(0)
    }

    /// Bytes written but not yet flushed, across all segments
    pub fn unflushed_bytes(&self) -> usize {
        self.files
            .read()
            .iter()
            .map(|f| f.wrote_position() - f.flushed_position())
            .sum()
    }

    /// Flush every dirty segment; returns the durable stream frontier
    pub fn flush(&self) -> Result<u64> {
        let files: Vec<_> = self.files.read().clone();
        let mut flushed_where = 0;
        for file in &files {
            flushed_where = file.flush()?;
        }
        Ok(flushed_where)
    }

    /// Discard every byte beyond `valid_offset`: trailing whole segments are
    /// destroyed, the boundary segment's frontier is pulled back.
    pub fn truncate_dirty_tail(&self, valid_offset: u64) {
        let mut removed = Vec::new();
        {
            let mut files = self.files.write();
            files.retain(|file| {
                let start = file.file_from_offset();
                if valid_offset >= start {
                    if start + self.file_size as u64 > valid_offset {
                        let in_file = (valid_offset - start) as usize;
                        file.set_positions(in_file, in_file);
                    }
                    true
                } else {
                    removed.push(file.clone());
                    false
                }
            });
        }
        for file in removed {
            warn!(
                path = %file.path().display(),
                valid_offset,
                "Truncating dirty trailing segment"
            );
            let _ = file.destroy();
        }
    }

    /// Delete whole segments whose data is all older than `expire_ms` and
    /// entirely below `reserve_offset` (the checkpoint floor: bytes not yet
    /// covered by a durable checkpoint are never deleted). Never touches the
    /// tail. `force` ignores the age floor (disk pressure) but not the
    /// reserve. Deletions are paced by `delete_interval` and capped at
    /// `batch_max` per call.
    pub async fn delete_expired_by_time(
        &self,
        expire_ms: i64,
        batch_max: usize,
        delete_interval: Duration,
        reserve_offset: u64,
        force: bool,
    ) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        let mut deleted = 0;

        while deleted < batch_max {
            let candidate = {
                let mut files = self.files.write();
                if files.len() <= 1 {
                    break;
                }
                let front = files[0].clone();
                if front.file_from_offset() + self.file_size as u64 > reserve_offset {
                    break;
                }
                if force || front.last_modified_ms() + expire_ms <= now {
                    files.remove(0);
                    Some(front)
                } else {
                    None
                }
            };

            match candidate {
                Some(file) => {
                    info!(
                        path = %file.path().display(),
                        force,
                        "Deleting expired segment"
                    );
                    let _ = file.destroy();
                    deleted += 1;
                    if deleted < batch_max {
                        tokio::time::sleep(delete_interval).await;
                    }
                }
                None => break,
            }
        }
        deleted
    }

    /// Delete whole segments whose last fixed-size unit references a
    /// commit-log offset below `min_commitlog_offset`. Used by consume
    /// queues whose entries lead with an 8-byte commit-log offset.
    pub fn delete_expired_by_offset(&self, min_commitlog_offset: i64, unit_size: usize) -> usize {
        let mut deleted = 0;
        loop {
            let candidate = {
                let mut files = self.files.write();
                if files.len() <= 1 {
                    break;
                }
                let front = files[0].clone();
                let destroyable = front
                    .read(self.file_size - unit_size, 8)
                    .map(|b| i64::from_be_bytes(b.as_ref().try_into().expect("8-byte read")))
                    .map(|last_ref| last_ref != 0 && last_ref < min_commitlog_offset)
                    .unwrap_or(false);
                if destroyable {
                    files.remove(0);
                    Some(front)
                } else {
                    None
                }
            };

            match candidate {
                Some(file) => {
                    debug!(
                        path = %file.path().display(),
                        min_commitlog_offset,
                        "Deleting logic segment below commit-log floor"
                    );
                    let _ = file.destroy();
                    deleted += 1;
                }
                None => break,
            }
        }
        deleted
    }

    /// Destroy every segment and the directory itself
    pub fn destroy(&self) -> Result<()> {
        let files: Vec<_> = {
            let mut guard = self.files.write();
            guard.drain(..).collect()
        };
        for file in files {
            file.destroy()?;
        }
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn queue(dir: &std::path::Path, file_size: usize) -> MappedQueue {
        MappedQueue::new(dir.to_path_buf(), file_size, None)
    }

    #[test]
    fn test_roll_keeps_contiguous_offsets() {
        let dir = tempdir().unwrap();
        let q = queue(dir.path(), 16);

        let f0 = q.current_append_file_or_create(0).unwrap();
        f0.append(&[0u8; 16]).unwrap();
        let f1 = q.current_append_file_or_create(0).unwrap();

        assert_eq!(f0.file_from_offset(), 0);
        assert_eq!(f1.file_from_offset(), 16);
        assert_eq!(q.max_offset(), 16);
        assert_eq!(q.num_files(), 2);
    }

    #[test]
    fn test_file_by_offset() {
        let dir = tempdir().unwrap();
        let q = queue(dir.path(), 16);
        for _ in 0..3 {
            let f = q.current_append_file_or_create(0).unwrap();
            f.append(&[1u8; 16]).unwrap();
        }

        assert_eq!(q.file_by_offset(0, false).unwrap().file_from_offset(), 0);
        assert_eq!(q.file_by_offset(17, false).unwrap().file_from_offset(), 16);
        assert_eq!(q.file_by_offset(47, false).unwrap().file_from_offset(), 32);
        assert!(q.file_by_offset(48, false).is_none());
        assert_eq!(q.file_by_offset(999, true).unwrap().file_from_offset(), 0);
    }

    #[test]
    fn test_load_round_trip() {
        let dir = tempdir().unwrap();
        {
            let q = queue(dir.path(), 32);
            let f = q.current_append_file_or_create(0).unwrap();
            f.append(b"abc").unwrap();
            f.flush().unwrap();
        }
        let q = queue(dir.path(), 32);
        q.load().unwrap();
        assert_eq!(q.num_files(), 1);
        assert_eq!(q.first_file().unwrap().read(0, 3).unwrap().as_ref(), b"abc");
    }

    #[test]
    fn test_truncate_dirty_tail() {
        let dir = tempdir().unwrap();
        let q = queue(dir.path(), 16);
        for _ in 0..3 {
            let f = q.current_append_file_or_create(0).unwrap();
            f.append(&[7u8; 16]).unwrap();
        }
        assert_eq!(q.num_files(), 3);

        q.truncate_dirty_tail(20);
        assert_eq!(q.num_files(), 2);
        assert_eq!(q.max_offset(), 20);
        assert_eq!(q.current_append_file().unwrap().wrote_position(), 4);
    }

    #[tokio::test]
    async fn test_delete_expired_never_removes_tail() {
        let dir = tempdir().unwrap();
        let q = queue(dir.path(), 16);
        for _ in 0..3 {
            let f = q.current_append_file_or_create(0).unwrap();
            f.append(&[2u8; 16]).unwrap();
        }

        let deleted = q
            .delete_expired_by_time(0, 10, Duration::from_millis(0), u64::MAX, true)
            .await;
        assert_eq!(deleted, 2);
        assert_eq!(q.num_files(), 1);
        assert_eq!(q.min_offset(), 32);
    }

    #[tokio::test]
    async fn test_delete_expired_respects_reserve_offset() {
        let dir = tempdir().unwrap();
        let q = queue(dir.path(), 16);
        for _ in 0..4 {
            let f = q.current_append_file_or_create(0).unwrap();
            f.append(&[3u8; 16]).unwrap();
        }

        // Checkpoint floor inside segment 1: only segment 0 may go.
        let deleted = q
            .delete_expired_by_time(0, 10, Duration::from_millis(0), 20, true)
            .await;
        assert_eq!(deleted, 1);
        assert_eq!(q.min_offset(), 16);
    }
}
