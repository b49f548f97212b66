//! Memory-mapped segment file
//!
//! A [`MappedFile`] is one fixed-capacity chunk of an append-only byte
//! stream. Its filename encodes the starting logical offset it represents
//! (zero-padded to 20 digits), so the set it belongs to can locate the
//! segment covering any offset by arithmetic alone.
//!
//! Writers append below `capacity`; readers copy bytes out of the mapping.
//! The mapping itself sits behind a `RwLock` so a tail-segment writer and
//! concurrent readers never alias the same region mutably; sealed segments
//! only ever see the read path.

use crate::error::{Result, StoreError};
use bytes::Bytes;
use memmap2::MmapMut;
use parking_lot::RwLock;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Build the zero-padded segment filename for a starting offset
pub fn offset_file_name(offset: u64) -> String {
    format!("{:020}", offset)
}

/// Parse a segment filename back into its starting offset
pub fn parse_offset_file_name(name: &str) -> Option<u64> {
    if name.len() == 20 {
        name.parse().ok()
    } else {
        None
    }
}

/// One fixed-capacity memory-mapped segment file
pub struct MappedFile {
    path: PathBuf,
    file_from_offset: u64,
    capacity: usize,
    mmap: RwLock<MmapMut>,
    wrote: AtomicUsize,
    flushed: AtomicUsize,
}

impl MappedFile {
    /// Create a new segment under `dir` starting at `file_from_offset`,
    /// pre-sized to `capacity` and mapped writable.
    pub fn create(dir: &Path, file_from_offset: u64, capacity: usize) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(offset_file_name(file_from_offset));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(capacity as u64)?;

        // SAFETY: the file was just sized to `capacity` and stays open for
        // the lifetime of the mapping; all access goes through the RwLock.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        debug!(path = %path.display(), capacity, "Created mapped file");

        Ok(Self {
            path,
            file_from_offset,
            capacity,
            mmap: RwLock::new(mmap),
            wrote: AtomicUsize::new(0),
            flushed: AtomicUsize::new(0),
        })
    }

    /// Map an existing segment file. The wrote position starts at capacity;
    /// recovery walks the contents and calls [`set_positions`](Self::set_positions)
    /// with the true frontier.
    pub fn open(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StoreError::corrupted(format!("bad segment path {}", path.display())))?;
        let file_from_offset = parse_offset_file_name(name)
            .ok_or_else(|| StoreError::corrupted(format!("bad segment name {}", name)))?;

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let capacity = file.metadata()?.len() as usize;

        // SAFETY: same discipline as `create`; the file handle outlives the map.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            path: path.to_path_buf(),
            file_from_offset,
            capacity,
            mmap: RwLock::new(mmap),
            wrote: AtomicUsize::new(capacity),
            flushed: AtomicUsize::new(capacity),
        })
    }

    /// Starting logical offset this file covers
    pub fn file_from_offset(&self) -> u64 {
        self.file_from_offset
    }

    /// Fixed file capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written so far
    pub fn wrote_position(&self) -> usize {
        self.wrote.load(Ordering::Acquire)
    }

    /// Bytes confirmed durable so far
    pub fn flushed_position(&self) -> usize {
        self.flushed.load(Ordering::Acquire)
    }

    /// Remaining writable bytes
    pub fn remaining(&self) -> usize {
        self.capacity - self.wrote_position()
    }

    /// Whether the append frontier reached capacity
    pub fn is_full(&self) -> bool {
        self.wrote_position() == self.capacity
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `data` at the wrote position. Returns the in-file position the
    /// bytes landed at. The owning queue serializes appends; this only
    /// guards against capacity overruns.
    pub fn append(&self, data: &[u8]) -> Result<usize> {
        let pos = self.wrote_position();
        if pos + data.len() > self.capacity {
            return Err(StoreError::OffsetOutOfRange((pos + data.len()) as i64));
        }
        {
            let mut mmap = self.mmap.write();
            mmap[pos..pos + data.len()].copy_from_slice(data);
        }
        self.wrote.store(pos + data.len(), Ordering::Release);
        Ok(pos)
    }

    /// Write at an arbitrary in-file position without moving the append
    /// frontier (index files manage their own layout).
    pub fn write_at(&self, pos: usize, data: &[u8]) -> Result<()> {
        if pos + data.len() > self.capacity {
            return Err(StoreError::OffsetOutOfRange((pos + data.len()) as i64));
        }
        let mut mmap = self.mmap.write();
        mmap[pos..pos + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copy `len` bytes out of the mapping at `pos`. Bounds-checked against
    /// capacity; callers enforce their own wrote-position visibility rule.
    pub fn read(&self, pos: usize, len: usize) -> Option<Bytes> {
        if pos + len > self.capacity {
            return None;
        }
        let mmap = self.mmap.read();
        Some(Bytes::copy_from_slice(&mmap[pos..pos + len]))
    }

    /// Force written bytes to stable storage. Returns the global offset of
    /// the flush frontier (file start + flushed position).
    pub fn flush(&self) -> Result<u64> {
        let wrote = self.wrote_position();
        if wrote > self.flushed_position() {
            self.mmap.read().flush()?;
            self.flushed.store(wrote, Ordering::Release);
        }
        Ok(self.file_from_offset + self.flushed_position() as u64)
    }

    /// Reset the wrote/flushed frontier, used by recovery truncation
    pub fn set_positions(&self, wrote: usize, flushed: usize) {
        self.wrote.store(wrote.min(self.capacity), Ordering::Release);
        self.flushed.store(flushed.min(self.capacity), Ordering::Release);
    }

    /// Last-modified time of the backing file in epoch millis
    pub fn last_modified_ms(&self) -> i64 {
        fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Delete the backing file. The mapping stays valid until the last
    /// `Arc<MappedFile>` drops; readers holding it see the old bytes.
    pub fn destroy(&self) -> Result<()> {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to delete segment file");
                return Err(e.into());
            }
        }
        debug!(path = %self.path.display(), "Deleted segment file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_filename_round_trip() {
        assert_eq!(offset_file_name(0), "00000000000000000000");
        assert_eq!(offset_file_name(1_073_741_824), "00000000001073741824");
        assert_eq!(
            parse_offset_file_name("00000000001073741824"),
            Some(1_073_741_824)
        );
        assert_eq!(parse_offset_file_name("checkpoint"), None);
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let mf = MappedFile::create(dir.path(), 0, 128).unwrap();

        let pos = mf.append(b"hello").unwrap();
        assert_eq!(pos, 0);
        assert_eq!(mf.wrote_position(), 5);
        assert_eq!(mf.read(0, 5).unwrap().as_ref(), b"hello");

        let pos = mf.append(b" world").unwrap();
        assert_eq!(pos, 5);
        assert_eq!(mf.read(0, 11).unwrap().as_ref(), b"hello world");
    }

    #[test]
    fn test_append_over_capacity() {
        let dir = tempdir().unwrap();
        let mf = MappedFile::create(dir.path(), 0, 8).unwrap();
        assert!(mf.append(b"12345678").is_ok());
        assert!(mf.is_full());
        assert!(mf.append(b"x").is_err());
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let mf = MappedFile::create(dir.path(), 0, 64).unwrap();
            mf.append(b"durable").unwrap();
            assert_eq!(mf.flush().unwrap(), 7);
        }
        let path = dir.path().join(offset_file_name(0));
        let reopened = MappedFile::open(&path).unwrap();
        assert_eq!(reopened.capacity(), 64);
        assert_eq!(reopened.read(0, 7).unwrap().as_ref(), b"durable");
    }

    #[test]
    fn test_destroy_removes_file() {
        let dir = tempdir().unwrap();
        let mf = MappedFile::create(dir.path(), 1024, 64).unwrap();
        let path = mf.path().to_path_buf();
        assert!(path.exists());
        mf.destroy().unwrap();
        assert!(!path.exists());
    }
}
