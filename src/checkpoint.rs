//! Store checkpoint: recovery lower bounds persisted across restarts
//!
//! Three positions written as a single small binary file: how far the
//! commit log was flushed, how far dispatch had applied records to the
//! logical indices, and the newest index timestamp that reached disk.
//! Recovery replays from the minimum of the first two, so a stale
//! checkpoint costs replay time, never correctness.

use crate::error::{Result, StoreError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// 3 x u64 positions + crc32 over them
const CHECKPOINT_FILE_SIZE: usize = 28;

pub struct StoreCheckpoint {
    path: PathBuf,
    physical_pos: AtomicU64,
    logical_pos: AtomicU64,
    index_timestamp: AtomicU64,
}

impl StoreCheckpoint {
    /// Read the checkpoint file, or start from zero when absent or corrupt.
    /// A corrupt checkpoint only widens the recovery window.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cp = Self {
            path: path.clone(),
            physical_pos: AtomicU64::new(0),
            logical_pos: AtomicU64::new(0),
            index_timestamp: AtomicU64::new(0),
        };

        if !path.exists() {
            info!(path = %path.display(), "No checkpoint found, recovering from the beginning");
            return Ok(cp);
        }

        let mut buf = [0u8; CHECKPOINT_FILE_SIZE];
        let mut file = File::open(&path)?;
        match file.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Short checkpoint file, ignoring");
                return Ok(cp);
            }
        }

        let stored_crc = u32::from_be_bytes(buf[24..28].try_into().unwrap());
        if crc32fast::hash(&buf[..24]) != stored_crc {
            warn!(path = %path.display(), "Checkpoint crc mismatch, ignoring");
            return Ok(cp);
        }

        cp.physical_pos
            .store(u64::from_be_bytes(buf[0..8].try_into().unwrap()), Ordering::Release);
        cp.logical_pos
            .store(u64::from_be_bytes(buf[8..16].try_into().unwrap()), Ordering::Release);
        cp.index_timestamp
            .store(u64::from_be_bytes(buf[16..24].try_into().unwrap()), Ordering::Release);
        info!(
            physical_pos = cp.physical_pos(),
            logical_pos = cp.logical_pos(),
            index_timestamp = cp.index_timestamp(),
            "Checkpoint loaded"
        );
        Ok(cp)
    }

    pub fn physical_pos(&self) -> u64 {
        self.physical_pos.load(Ordering::Acquire)
    }

    pub fn logical_pos(&self) -> u64 {
        self.logical_pos.load(Ordering::Acquire)
    }

    pub fn index_timestamp(&self) -> u64 {
        self.index_timestamp.load(Ordering::Acquire)
    }

    pub fn set_physical_pos(&self, pos: u64) {
        self.physical_pos.store(pos, Ordering::Release);
    }

    pub fn set_logical_pos(&self, pos: u64) {
        self.logical_pos.store(pos, Ordering::Release);
    }

    pub fn set_index_timestamp(&self, ts: u64) {
        self.index_timestamp.store(ts, Ordering::Release);
    }

    /// Persist atomically: write a temp file, fsync, rename over the old
    /// checkpoint, fsync the parent directory
    pub fn flush(&self) -> Result<()> {
        let mut buf = [0u8; CHECKPOINT_FILE_SIZE];
        buf[0..8].copy_from_slice(&self.physical_pos().to_be_bytes());
        buf[8..16].copy_from_slice(&self.logical_pos().to_be_bytes());
        buf[16..24].copy_from_slice(&self.index_timestamp().to_be_bytes());
        let crc = crc32fast::hash(&buf[..24]);
        buf[24..28].copy_from_slice(&crc.to_be_bytes());

        let parent = self.path.parent().ok_or_else(|| {
            StoreError::Config(format!("checkpoint path has no parent: {}", self.path.display()))
        })?;
        std::fs::create_dir_all(parent)?;

        let tmp = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp, &self.path)?;
        fsync_dir(parent)?;
        Ok(())
    }
}

pub(crate) fn fsync_dir(dir: &Path) -> Result<()> {
    let handle = File::open(dir)?;
    handle.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_flush_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint");

        let cp = StoreCheckpoint::load(&path).unwrap();
        assert_eq!(cp.physical_pos(), 0);

        cp.set_physical_pos(4096);
        cp.set_logical_pos(2048);
        cp.set_index_timestamp(1_700_000_000_000);
        cp.flush().unwrap();

        let reloaded = StoreCheckpoint::load(&path).unwrap();
        assert_eq!(reloaded.physical_pos(), 4096);
        assert_eq!(reloaded.logical_pos(), 2048);
        assert_eq!(reloaded.index_timestamp(), 1_700_000_000_000);
    }

    #[test]
    fn test_corrupt_checkpoint_resets_to_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint");

        let cp = StoreCheckpoint::load(&path).unwrap();
        cp.set_physical_pos(4096);
        cp.flush().unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        raw[3] ^= 0xff;
        std::fs::write(&path, &raw).unwrap();

        let reloaded = StoreCheckpoint::load(&path).unwrap();
        assert_eq!(reloaded.physical_pos(), 0);
        assert_eq!(reloaded.logical_pos(), 0);
    }
}
