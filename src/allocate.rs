//! Segment pre-allocation service
//!
//! Creating and mapping a fresh gigabyte segment on the append path would
//! stall producers on file-system latency, so a background worker creates
//! the next segment ahead of the writer. The owning queue submits a prepare
//! request when it rolls; the next roll finds the file already mapped in the
//! cache. A cache miss falls back to synchronous creation and logs the
//! starvation.

use crate::error::Result;
use crate::mapped_file::{offset_file_name, MappedFile};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

struct AllocateRequest {
    dir: PathBuf,
    offset: u64,
    capacity: usize,
}

/// Background pre-allocator shared by every segment file set in the store
pub struct AllocateService {
    tx: Mutex<Option<mpsc::Sender<AllocateRequest>>>,
    cache: std::sync::Arc<Mutex<HashMap<PathBuf, MappedFile>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AllocateService {
    /// Start the worker with a bounded request queue of `lookahead` slots
    pub fn start(lookahead: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<AllocateRequest>(lookahead.max(1));
        let cache = std::sync::Arc::new(Mutex::new(HashMap::new()));

        let worker_cache = cache.clone();
        let worker = tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let path = req.dir.join(offset_file_name(req.offset));
                if worker_cache.lock().contains_key(&path) {
                    continue;
                }
                match MappedFile::create(&req.dir, req.offset, req.capacity) {
                    Ok(file) => {
                        debug!(path = %path.display(), "Pre-allocated segment");
                        worker_cache.lock().insert(path, file);
                    }
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "Segment pre-allocation failed");
                    }
                }
            }
            debug!("Allocate service worker exiting");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            cache,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Ask the worker to create the segment starting at `offset` ahead of
    /// time. Best-effort: a full queue drops the request (the fetch path
    /// falls back to synchronous creation).
    pub fn prepare(&self, dir: PathBuf, offset: u64, capacity: usize) {
        let guard = self.tx.lock();
        if let Some(tx) = guard.as_ref() {
            if tx
                .try_send(AllocateRequest {
                    dir,
                    offset,
                    capacity,
                })
                .is_err()
            {
                debug!(offset, "Pre-allocation queue full, request dropped");
            }
        }
    }

    /// Take the segment starting at `offset` out of the cache, creating it
    /// synchronously on a miss.
    pub fn fetch(&self, dir: &std::path::Path, offset: u64, capacity: usize) -> Result<MappedFile> {
        let path = dir.join(offset_file_name(offset));
        if let Some(file) = self.cache.lock().remove(&path) {
            return Ok(file);
        }
        warn!(
            path = %path.display(),
            "Pre-allocation cache miss, creating segment synchronously"
        );
        MappedFile::create(dir, offset, capacity)
    }

    /// Close the request queue and wait for the in-flight creation to finish
    pub async fn shutdown(&self) {
        self.tx.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        // Drop any cached files that were never claimed; their backing files
        // are harmless zero-filled segments reclaimed on next load.
        for (path, file) in self.cache.lock().drain() {
            if file.wrote_position() == 0 {
                let _ = file.destroy();
                debug!(path = %path.display(), "Dropped unclaimed pre-allocated segment");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_prepare_then_fetch_hits_cache() {
        let dir = tempdir().unwrap();
        let service = AllocateService::start(2);

        service.prepare(dir.path().to_path_buf(), 0, 1024);
        // Give the worker a beat to create the file.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let file = service.fetch(dir.path(), 0, 1024).unwrap();
        assert_eq!(file.file_from_offset(), 0);
        assert_eq!(file.capacity(), 1024);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_fetch_miss_creates_synchronously() {
        let dir = tempdir().unwrap();
        let service = AllocateService::start(2);

        let file = service.fetch(dir.path(), 4096, 4096).unwrap();
        assert_eq!(file.file_from_offset(), 4096);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_reclaims_unclaimed_segments() {
        let dir = tempdir().unwrap();
        let service = AllocateService::start(2);

        service.prepare(dir.path().to_path_buf(), 0, 512);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        service.shutdown().await;

        assert!(!dir.path().join(offset_file_name(0)).exists());
    }
}
