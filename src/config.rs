//! Storage configuration
//!
//! Every tunable the engine depends on lives here: segment sizes, flush
//! behavior, dispatch backpressure and retry policy, index geometry,
//! retention windows and the delay-level table. Defaults match a small
//! single-node deployment; production deployments override via serde
//! (TOML/JSON) or the builder-style field access.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// When appended bytes are forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlushDiskType {
    /// Block each append until its bytes are durable (bounded by
    /// `sync_flush_timeout_ms`; on timeout the append reports
    /// `FlushDiskTimeout` but the data is still appended).
    SyncFlush,
    /// A background timer flushes every `flush_interval_ms` or once
    /// `flush_commit_log_least_pages` pages are dirty.
    #[default]
    AsyncFlush,
}

/// Storage engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStoreConfig {
    /// Root directory of the store instance. Commit-log segments live in
    /// `<root>/commitlog`, consume queues in `<root>/consumequeue/<topic>/<queueId>`,
    /// index files in `<root>/index`, the checkpoint in `<root>/checkpoint`.
    pub store_path_root: PathBuf,

    /// Commit-log segment file size in bytes
    #[serde(default = "default_commit_log_file_size")]
    pub commit_log_file_size: usize,

    /// Consume-queue entries per segment file (file size = entries * 20)
    #[serde(default = "default_consume_queue_file_entries")]
    pub consume_queue_file_entries: usize,

    /// Maximum accepted message size (body + metadata) in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Flush policy for the commit log
    #[serde(default)]
    pub flush_disk_type: FlushDiskType,

    /// Synchronous flush wait bound in milliseconds
    #[serde(default = "default_sync_flush_timeout_ms")]
    pub sync_flush_timeout_ms: u64,

    /// Async flush timer interval in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Dirty 4K pages required before an async flush cycle writes
    #[serde(default = "default_flush_commit_log_least_pages")]
    pub flush_commit_log_least_pages: usize,

    /// Consume-queue / index flush + checkpoint timer interval in milliseconds
    #[serde(default = "default_flush_consume_queue_interval_ms")]
    pub flush_consume_queue_interval_ms: u64,

    /// Capacity of the bounded dispatch queue; a full queue blocks producers
    #[serde(default = "default_dispatch_queue_capacity")]
    pub dispatch_queue_capacity: usize,

    /// Bounded retries for a failed consume-queue/index update
    #[serde(default = "default_dispatch_max_retries")]
    pub dispatch_max_retries: u32,

    /// Backoff between dispatch retries in milliseconds (doubled per attempt)
    #[serde(default = "default_dispatch_retry_backoff_ms")]
    pub dispatch_retry_backoff_ms: u64,

    /// Number of segments the pre-allocator keeps mapped ahead of the writer
    #[serde(default = "default_preallocate_lookahead")]
    pub preallocate_lookahead: usize,

    /// Hash slots per index file
    #[serde(default = "default_index_hash_slots")]
    pub index_hash_slots: usize,

    /// Maximum entries per index file before rolling to a new one
    #[serde(default = "default_index_max_entries")]
    pub index_max_entries: usize,

    /// Maximum hash-chain steps walked per bucket on query
    #[serde(default = "default_index_max_chain_depth")]
    pub index_max_chain_depth: usize,

    /// Minimum age (hours) before a fully-consumed segment may be deleted
    #[serde(default = "default_file_reserved_hours")]
    pub file_reserved_hours: u64,

    /// Retention sweep timer interval in milliseconds
    #[serde(default = "default_clean_interval_ms")]
    pub clean_interval_ms: u64,

    /// Max segment files deleted per retention pass (I/O spike limiter)
    #[serde(default = "default_delete_files_batch_max")]
    pub delete_files_batch_max: usize,

    /// Pause between individual segment deletions in milliseconds
    #[serde(default = "default_delete_files_interval_ms")]
    pub delete_files_interval_ms: u64,

    /// Total commit-log byte budget; exceeding it overrides the age floor
    /// during retention (0 = unlimited)
    #[serde(default)]
    pub max_store_size_bytes: u64,

    /// Delay-level table, e.g. "1s 5s 10s 30s 1m 2m 3m 4m 5m 6m 7m 8m 9m 10m 20m 30m 1h 2h"
    #[serde(default = "default_delay_levels")]
    pub message_delay_levels: String,

    /// Delay-queue scan timer interval in milliseconds
    #[serde(default = "default_schedule_scan_interval_ms")]
    pub schedule_scan_interval_ms: u64,

    /// Host identity recorded into each record's store-host field
    #[serde(default = "default_store_host")]
    pub store_host: std::net::SocketAddr,
}

impl MessageStoreConfig {
    /// Config rooted at `store_path_root` with all defaults
    pub fn new(store_path_root: impl Into<PathBuf>) -> Self {
        Self {
            store_path_root: store_path_root.into(),
            commit_log_file_size: default_commit_log_file_size(),
            consume_queue_file_entries: default_consume_queue_file_entries(),
            max_message_size: default_max_message_size(),
            flush_disk_type: FlushDiskType::default(),
            sync_flush_timeout_ms: default_sync_flush_timeout_ms(),
            flush_interval_ms: default_flush_interval_ms(),
            flush_commit_log_least_pages: default_flush_commit_log_least_pages(),
            flush_consume_queue_interval_ms: default_flush_consume_queue_interval_ms(),
            dispatch_queue_capacity: default_dispatch_queue_capacity(),
            dispatch_max_retries: default_dispatch_max_retries(),
            dispatch_retry_backoff_ms: default_dispatch_retry_backoff_ms(),
            preallocate_lookahead: default_preallocate_lookahead(),
            index_hash_slots: default_index_hash_slots(),
            index_max_entries: default_index_max_entries(),
            index_max_chain_depth: default_index_max_chain_depth(),
            file_reserved_hours: default_file_reserved_hours(),
            clean_interval_ms: default_clean_interval_ms(),
            delete_files_batch_max: default_delete_files_batch_max(),
            delete_files_interval_ms: default_delete_files_interval_ms(),
            max_store_size_bytes: 0,
            message_delay_levels: default_delay_levels(),
            schedule_scan_interval_ms: default_schedule_scan_interval_ms(),
            store_host: default_store_host(),
        }
    }

    /// Directory holding commit-log segments
    pub fn commit_log_path(&self) -> PathBuf {
        self.store_path_root.join("commitlog")
    }

    /// Root of the consume-queue directory tree
    pub fn consume_queue_path(&self) -> PathBuf {
        self.store_path_root.join("consumequeue")
    }

    /// Directory holding index files
    pub fn index_path(&self) -> PathBuf {
        self.store_path_root.join("index")
    }

    /// Checkpoint file path
    pub fn checkpoint_path(&self) -> PathBuf {
        self.store_path_root.join("checkpoint")
    }

    /// Delay-service cursor file path
    pub fn delay_offset_path(&self) -> PathBuf {
        self.store_path_root.join("delayOffset.json")
    }

    /// Consume-queue segment file size in bytes
    pub fn consume_queue_file_size(&self) -> usize {
        self.consume_queue_file_entries * crate::consume_queue::CQ_UNIT_SIZE
    }
}

fn default_commit_log_file_size() -> usize {
    1024 * 1024 * 1024
}
fn default_consume_queue_file_entries() -> usize {
    300_000
}
fn default_max_message_size() -> usize {
    1024 * 512
}
fn default_sync_flush_timeout_ms() -> u64 {
    5000
}
fn default_flush_interval_ms() -> u64 {
    500
}
fn default_flush_commit_log_least_pages() -> usize {
    4
}
fn default_flush_consume_queue_interval_ms() -> u64 {
    1000
}
fn default_dispatch_queue_capacity() -> usize {
    100_000
}
fn default_dispatch_max_retries() -> u32 {
    3
}
fn default_dispatch_retry_backoff_ms() -> u64 {
    50
}
fn default_preallocate_lookahead() -> usize {
    2
}
fn default_index_hash_slots() -> usize {
    5_000_000
}
fn default_index_max_entries() -> usize {
    5_000_000 * 4
}
fn default_index_max_chain_depth() -> usize {
    512
}
fn default_file_reserved_hours() -> u64 {
    72
}
fn default_clean_interval_ms() -> u64 {
    10_000
}
fn default_delete_files_batch_max() -> usize {
    10
}
fn default_delete_files_interval_ms() -> u64 {
    100
}
fn default_delay_levels() -> String {
    "1s 5s 10s 30s 1m 2m 3m 4m 5m 6m 7m 8m 9m 10m 20m 30m 1h 2h".to_string()
}
fn default_schedule_scan_interval_ms() -> u64 {
    1000
}
fn default_store_host() -> std::net::SocketAddr {
    "127.0.0.1:10911".parse().expect("static literal")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let config = MessageStoreConfig::new("/tmp/store");
        assert_eq!(config.commit_log_path(), PathBuf::from("/tmp/store/commitlog"));
        assert_eq!(
            config.consume_queue_path(),
            PathBuf::from("/tmp/store/consumequeue")
        );
        assert_eq!(config.index_path(), PathBuf::from("/tmp/store/index"));
    }

    #[test]
    fn test_serde_defaults() {
        let parsed: MessageStoreConfig =
            serde_json::from_str(r#"{"store_path_root": "/data/mq"}"#).unwrap();
        assert_eq!(parsed.commit_log_file_size, 1024 * 1024 * 1024);
        assert_eq!(parsed.flush_disk_type, FlushDiskType::AsyncFlush);
        assert_eq!(parsed.dispatch_max_retries, 3);
    }

    #[test]
    fn test_consume_queue_file_size() {
        let mut config = MessageStoreConfig::new("/tmp/store");
        config.consume_queue_file_entries = 100;
        assert_eq!(config.consume_queue_file_size(), 2000);
    }
}
