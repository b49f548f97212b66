//! The message store facade
//!
//! Owns every component and the background tasks around them. Lifecycle is
//! `new` -> `load` (open files, recover, replay dispatch) -> `start`
//! (background services) -> serve -> `shutdown` (drain, flush, final
//! checkpoint). The commit log is the source of truth; everything the
//! facade exposes for reading goes through a consume queue or the index
//! first and then back to the commit log for the record bytes.

use crate::allocate::AllocateService;
use crate::checkpoint::StoreCheckpoint;
use crate::commitlog::{
    decode_record, topic_queue_key, AppendResult, CommitLog, GroupCommitRequest, RecordCheck,
};
use crate::config::MessageStoreConfig;
use crate::consume_queue::ConsumeQueueTable;
use crate::dispatch::{DispatchRequest, DispatchService};
use crate::error::{Result, StoreError};
use crate::index::IndexService;
use crate::message::{decode_msg_id, Message, MessageExt};
use crate::running_flags::RunningFlags;
use crate::schedule::{DelayLevelTable, ScheduleService};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const FLUSH_PAGE_SIZE: usize = 4096;
/// Async flush is forced after this many idle intervals even below the
/// dirty-page threshold
const FORCE_FLUSH_INTERVALS: u32 = 10;

/// Status of a [`MessageStore::get_message`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMessageStatus {
    Found,
    NoMatchedMessage,
    NoMessageInQueue,
    OffsetTooSmall,
    OffsetOverflow,
}

/// Batch read result with the corrected resume offset
#[derive(Debug)]
pub struct GetMessageResult {
    pub status: GetMessageStatus,
    pub next_begin_offset: i64,
    pub min_offset: i64,
    pub max_offset: i64,
    pub messages: Vec<MessageExt>,
}

/// Key-index query result
#[derive(Debug, Default)]
pub struct QueryMessageResult {
    pub messages: Vec<MessageExt>,
}

pub struct MessageStore {
    config: Arc<MessageStoreConfig>,
    running_flags: Arc<RunningFlags>,
    allocator: Arc<AllocateService>,
    commit_log: Arc<CommitLog>,
    cq_table: Arc<ConsumeQueueTable>,
    index: Arc<IndexService>,
    checkpoint: Arc<StoreCheckpoint>,
    schedule: Arc<ScheduleService>,
    dispatched_position: Arc<AtomicI64>,
    dispatch_service: Mutex<Option<DispatchService>>,
    dispatch_rx: Mutex<Option<mpsc::Receiver<DispatchRequest>>>,
    group_commit_rx: Mutex<Option<mpsc::Receiver<GroupCommitRequest>>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageStore {
    pub fn new(config: MessageStoreConfig) -> Result<Self> {
        let config = Arc::new(config);
        let delay_levels = Arc::new(DelayLevelTable::parse(&config.message_delay_levels)?);
        let running_flags = Arc::new(RunningFlags::new());
        let allocator = Arc::new(AllocateService::start(config.preallocate_lookahead));

        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_queue_capacity);
        let (commit_log, group_commit_rx) = CommitLog::new(
            config.clone(),
            allocator.clone(),
            delay_levels.clone(),
            dispatch_tx,
        );
        let commit_log = Arc::new(commit_log);

        let cq_table = Arc::new(ConsumeQueueTable::new(
            config.consume_queue_path(),
            config.consume_queue_file_size(),
        ));
        let index = Arc::new(IndexService::new(
            config.index_path(),
            config.index_hash_slots,
            config.index_max_entries,
            config.index_max_chain_depth,
        ));
        let checkpoint = Arc::new(StoreCheckpoint::load(config.checkpoint_path())?);
        let schedule = Arc::new(ScheduleService::new(
            config.clone(),
            delay_levels,
            commit_log.clone(),
            cq_table.clone(),
            running_flags.clone(),
        )?);

        let dispatched_position = Arc::new(AtomicI64::new(0));
        let dispatch_service = DispatchService::new(
            config.clone(),
            cq_table.clone(),
            index.clone(),
            running_flags.clone(),
            dispatched_position.clone(),
        );

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            running_flags,
            allocator,
            commit_log,
            cq_table,
            index,
            checkpoint,
            schedule,
            dispatched_position,
            dispatch_service: Mutex::new(Some(dispatch_service)),
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            group_commit_rx: Mutex::new(Some(group_commit_rx)),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Open all on-disk structures and bring them back to a consistent
    /// state. Must be called before [`MessageStore::start`].
    pub async fn load(&self) -> Result<()> {
        self.commit_log.load()?;
        self.cq_table.load()?;
        self.index.load()?;

        let cq_frontier = self.cq_table.recover_all();
        // Commit-log head corruption is fatal and propagates.
        let valid_offset = self.commit_log.recover()?;
        // Logical structures past the surviving commit log are dirty.
        self.cq_table.truncate_dirty(valid_offset as i64);
        self.index.truncate_beyond(valid_offset as i64);
        // Entries retired before shutdown must not resurface: re-derive each
        // queue's readable floor against the surviving commit log instead of
        // waiting for the first cleaner pass.
        let min_phy_offset = self.commit_log.min_offset() as i64;
        self.cq_table
            .for_each(|cq| cq.correct_min_offset(min_phy_offset));

        let mut next_offsets: HashMap<String, i64> = HashMap::new();
        self.cq_table.for_each(|cq| {
            next_offsets.insert(
                topic_queue_key(cq.topic(), cq.queue_id()),
                cq.max_offset_in_queue(),
            );
        });
        self.commit_log.set_topic_queue_table(next_offsets).await;

        self.replay_dispatch(valid_offset)?;

        info!(
            commit_log_frontier = valid_offset,
            cq_frontier,
            indexed = self.index.indexed_phy_offset(),
            "Store loaded"
        );
        Ok(())
    }

    /// Re-apply dispatch for records the logical indices may have missed.
    /// Replay starts at the checkpoint's most conservative position; both
    /// the consume queues and the index tolerate re-application.
    fn replay_dispatch(&self, valid_offset: u64) -> Result<()> {
        let replay_from = self
            .checkpoint
            .physical_pos()
            .min(self.checkpoint.logical_pos())
            .max(self.commit_log.min_offset())
            .min(valid_offset);

        let guard = self.dispatch_service.lock();
        let service = guard
            .as_ref()
            .ok_or_else(|| StoreError::StoreUnavailable("store already started".to_string()))?;

        let file_size = self.config.commit_log_file_size as u64;
        let mut offset = replay_from;
        let mut replayed = 0u64;
        while offset < valid_offset {
            match self.commit_log.check_record(offset as i64) {
                RecordCheck::Ok(request) => {
                    let size = request.msg_size as u64;
                    service.apply(&request)?;
                    offset += size;
                    replayed += 1;
                }
                RecordCheck::Blank => {
                    offset = (offset / file_size + 1) * file_size;
                }
                RecordCheck::End => break,
                RecordCheck::Invalid => {
                    // recover() already truncated; anything invalid here is
                    // unexpected but must not wedge startup.
                    warn!(offset, "Invalid record during dispatch replay, stopping");
                    break;
                }
            }
        }
        self.dispatched_position
            .store(valid_offset as i64, Ordering::Release);
        if replayed > 0 {
            info!(replay_from, replayed, "Dispatch replay complete");
        }
        Ok(())
    }

    /// Spawn the background services. Idempotent only in the sense that a
    /// second call is rejected.
    pub fn start(&self) -> Result<()> {
        let dispatch_service = self
            .dispatch_service
            .lock()
            .take()
            .ok_or_else(|| StoreError::StoreUnavailable("store already started".to_string()))?;
        let dispatch_rx = self
            .dispatch_rx
            .lock()
            .take()
            .ok_or_else(|| StoreError::StoreUnavailable("store already started".to_string()))?;
        let group_commit_rx = self
            .group_commit_rx
            .lock()
            .take()
            .ok_or_else(|| StoreError::StoreUnavailable("store already started".to_string()))?;

        let mut handles = self.handles.lock();

        handles.push(tokio::spawn(
            dispatch_service.run(dispatch_rx, self.shutdown_tx.subscribe()),
        ));
        handles.push(tokio::spawn(group_commit_loop(
            self.commit_log.clone(),
            group_commit_rx,
            self.shutdown_tx.subscribe(),
        )));
        handles.push(tokio::spawn(async_flush_loop(
            self.config.clone(),
            self.commit_log.clone(),
            self.checkpoint.clone(),
            self.shutdown_tx.subscribe(),
        )));
        handles.push(tokio::spawn(logic_flush_loop(
            self.config.clone(),
            self.cq_table.clone(),
            self.index.clone(),
            self.checkpoint.clone(),
            self.dispatched_position.clone(),
            self.shutdown_tx.subscribe(),
        )));
        handles.push(tokio::spawn(clean_files_loop(
            self.config.clone(),
            self.commit_log.clone(),
            self.cq_table.clone(),
            self.index.clone(),
            self.checkpoint.clone(),
            self.shutdown_tx.subscribe(),
        )));
        handles.push(tokio::spawn(schedule_loop(
            self.config.clone(),
            self.schedule.clone(),
            self.shutdown_tx.subscribe(),
        )));

        self.schedule.log_levels();
        info!("Message store started");
        Ok(())
    }

    /// Stop the background services, drain dispatch, flush everything and
    /// write the final checkpoint last.
    pub async fn shutdown(&self) {
        self.running_flags.mark_not_writeable();
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Background task panicked during shutdown");
            }
        }

        if let Err(e) = self.flush_all() {
            error!(error = %e, "Final flush failed during shutdown");
        }
        if let Err(e) = self.schedule.persist_offsets() {
            error!(error = %e, "Failed to persist delay offsets during shutdown");
        }
        // The checkpoint is written after every other structure is durable,
        // so it never claims more than what is on disk.
        if let Err(e) = self.checkpoint.flush() {
            error!(error = %e, "Failed to write final checkpoint");
        }
        self.allocator.shutdown().await;
        info!("Message store stopped");
    }

    fn flush_all(&self) -> Result<()> {
        let flushed = self.commit_log.flush()?;
        self.checkpoint.set_physical_pos(flushed);
        self.cq_table.flush_all()?;
        let index_ts = self.index.flush_all()?;
        self.checkpoint
            .set_logical_pos(self.dispatched_position.load(Ordering::Acquire) as u64);
        self.checkpoint.set_index_timestamp(index_ts.max(0) as u64);
        Ok(())
    }

    /// Append one message. Rejected while the store is degraded or
    /// shutting down.
    pub async fn put_message(&self, msg: Message) -> Result<AppendResult> {
        if !self.running_flags.is_writeable() {
            return Err(StoreError::StoreUnavailable(
                "store is not writeable".to_string(),
            ));
        }
        self.commit_log.put_message(msg).await
    }

    /// Read up to `max_count` messages from a queue starting at a logical
    /// offset. `next_begin_offset` is always a valid position to resume
    /// from, including on every miss status.
    pub fn get_message(
        &self,
        topic: &str,
        queue_id: i32,
        offset: i64,
        max_count: usize,
    ) -> GetMessageResult {
        let Some(cq) = self.cq_table.find(topic, queue_id) else {
            return GetMessageResult {
                status: GetMessageStatus::NoMessageInQueue,
                next_begin_offset: 0,
                min_offset: 0,
                max_offset: 0,
                messages: Vec::new(),
            };
        };

        let min_offset = cq.min_offset_in_queue();
        let max_offset = cq.max_offset_in_queue();

        let (status, next_begin_offset) = if max_offset == 0 {
            (GetMessageStatus::NoMessageInQueue, 0)
        } else if offset < min_offset {
            (GetMessageStatus::OffsetTooSmall, min_offset)
        } else if offset >= max_offset {
            (GetMessageStatus::OffsetOverflow, max_offset)
        } else {
            let mut messages = Vec::new();
            let mut current = offset;
            while current < max_offset && messages.len() < max_count {
                let Some((phy_offset, size, _tags_code)) = cq.get_entry(current) else {
                    break;
                };
                current += 1;
                let Some(raw) = self.commit_log.get_message(phy_offset, size) else {
                    warn!(topic, queue_id, phy_offset, "Consume queue entry points past the commit log");
                    continue;
                };
                match decode_record(&raw) {
                    Ok(ext) => messages.push(ext),
                    Err(e) => {
                        warn!(topic, queue_id, phy_offset, error = %e, "Undecodable record");
                    }
                }
            }
            let status = if messages.is_empty() {
                GetMessageStatus::NoMatchedMessage
            } else {
                GetMessageStatus::Found
            };
            return GetMessageResult {
                status,
                next_begin_offset: current,
                min_offset,
                max_offset,
                messages,
            };
        };

        GetMessageResult {
            status,
            next_begin_offset,
            min_offset,
            max_offset,
            messages: Vec::new(),
        }
    }

    pub fn get_max_offset_in_queue(&self, topic: &str, queue_id: i32) -> i64 {
        self.cq_table
            .find(topic, queue_id)
            .map(|cq| cq.max_offset_in_queue())
            .unwrap_or(0)
    }

    pub fn get_min_offset_in_queue(&self, topic: &str, queue_id: i32) -> i64 {
        self.cq_table
            .find(topic, queue_id)
            .map(|cq| cq.min_offset_in_queue())
            .unwrap_or(0)
    }

    /// Earliest logical offset whose record was stored at or after
    /// `timestamp`, clamped into the queue's live range
    pub fn offset_in_queue_by_timestamp(&self, topic: &str, queue_id: i32, timestamp: i64) -> i64 {
        let Some(cq) = self.cq_table.find(topic, queue_id) else {
            return 0;
        };
        cq.offset_by_timestamp(timestamp, |phy_offset, size| {
            self.commit_log.pickup_store_timestamp(phy_offset, size)
        })
    }

    /// Resolve a message id straight to its record
    pub fn lookup_message_by_id(&self, msg_id: &str) -> Option<MessageExt> {
        let (offset, size) = decode_msg_id(msg_id)?;
        let raw = self.commit_log.get_message(offset, size)?;
        decode_record(&raw).ok()
    }

    /// Key-index lookup: newest matching records first
    pub fn query_message(
        &self,
        topic: &str,
        key: &str,
        max_results: usize,
        begin_ts: i64,
        end_ts: i64,
    ) -> QueryMessageResult {
        let offsets = self
            .index
            .query_offsets(topic, key, max_results, begin_ts, end_ts);
        let mut result = QueryMessageResult::default();
        for offset in offsets {
            let Some(raw) = self.commit_log.get_message_at(offset) else {
                continue;
            };
            match decode_record(&raw) {
                // Hash collisions across topics are filtered here.
                Ok(ext) if ext.topic == topic => result.messages.push(ext),
                Ok(_) => {}
                Err(e) => warn!(offset, error = %e, "Undecodable record from index"),
            }
        }
        result
    }

    pub fn min_phy_offset(&self) -> u64 {
        self.commit_log.min_offset()
    }

    pub fn max_phy_offset(&self) -> u64 {
        self.commit_log.max_offset()
    }

    pub fn running_flags(&self) -> &RunningFlags {
        &self.running_flags
    }
}

/// Synchronous-flush service: each request is acked once the durable
/// frontier covers its deadline.
async fn group_commit_loop(
    commit_log: Arc<CommitLog>,
    mut rx: mpsc::Receiver<GroupCommitRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(request) = request else { break };
                let flushed = match commit_log.flush() {
                    Ok(flushed) => flushed,
                    Err(e) => {
                        error!(error = %e, "Commit log flush failed");
                        let _ = request.ack.send(false);
                        continue;
                    }
                };
                let _ = request.ack.send(flushed >= request.deadline_offset);
                // Everything already queued was covered by the same flush.
                while let Ok(next) = rx.try_recv() {
                    let _ = next.ack.send(flushed >= next.deadline_offset);
                }
            }
            _ = shutdown.changed() => {
                let flushed = commit_log.flush().unwrap_or(0);
                while let Ok(next) = rx.try_recv() {
                    let _ = next.ack.send(flushed >= next.deadline_offset);
                }
                break;
            }
        }
    }
}

/// Timed commit-log flush for the async-flush policy
async fn async_flush_loop(
    config: Arc<MessageStoreConfig>,
    commit_log: Arc<CommitLog>,
    checkpoint: Arc<StoreCheckpoint>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(config.flush_interval_ms));
    let threshold = config.flush_commit_log_least_pages * FLUSH_PAGE_SIZE;
    let mut idle_intervals = 0u32;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let dirty = commit_log.unflushed_bytes();
                if dirty >= threshold || (dirty > 0 && idle_intervals >= FORCE_FLUSH_INTERVALS) {
                    match commit_log.flush() {
                        Ok(flushed) => checkpoint.set_physical_pos(flushed),
                        Err(e) => error!(error = %e, "Commit log flush failed"),
                    }
                    idle_intervals = 0;
                } else {
                    idle_intervals += 1;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Periodic consume-queue and index flush, followed by a checkpoint write
async fn logic_flush_loop(
    config: Arc<MessageStoreConfig>,
    cq_table: Arc<ConsumeQueueTable>,
    index: Arc<IndexService>,
    checkpoint: Arc<StoreCheckpoint>,
    dispatched_position: Arc<AtomicI64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval =
        tokio::time::interval(Duration::from_millis(config.flush_consume_queue_interval_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = cq_table.flush_all() {
                    error!(error = %e, "Consume queue flush failed");
                    continue;
                }
                let index_ts = match index.flush_all() {
                    Ok(ts) => ts,
                    Err(e) => {
                        error!(error = %e, "Index flush failed");
                        continue;
                    }
                };
                checkpoint.set_logical_pos(dispatched_position.load(Ordering::Acquire) as u64);
                checkpoint.set_index_timestamp(index_ts.max(0) as u64);
                if let Err(e) = checkpoint.flush() {
                    error!(error = %e, "Checkpoint write failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Retention enforcement: expired commit-log segments go first, then the
/// logical structures are trimmed to the new physical minimum.
async fn clean_files_loop(
    config: Arc<MessageStoreConfig>,
    commit_log: Arc<CommitLog>,
    cq_table: Arc<ConsumeQueueTable>,
    index: Arc<IndexService>,
    checkpoint: Arc<StoreCheckpoint>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(config.clean_interval_ms));
    let expire_ms = config.file_reserved_hours as i64 * 3_600_000;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let over_capacity = config.max_store_size_bytes > 0
                    && commit_log.total_bytes() > config.max_store_size_bytes;
                // Bytes not yet covered by a durable checkpoint stay on disk.
                let reserve = checkpoint.physical_pos().min(checkpoint.logical_pos());
                let deleted = commit_log
                    .delete_expired_files(
                        expire_ms,
                        config.delete_files_batch_max,
                        Duration::from_millis(config.delete_files_interval_ms),
                        reserve,
                        over_capacity,
                    )
                    .await;
                if deleted > 0 {
                    info!(deleted, over_capacity, "Expired commit log segments removed");
                }

                let min_phy = commit_log.min_offset() as i64;
                cq_table.for_each(|cq| {
                    cq.delete_expired_by_offset(min_phy);
                    cq.correct_min_offset(min_phy);
                });
                let cutoff_ts = chrono::Utc::now().timestamp_millis() - expire_ms;
                index.delete_expired(min_phy, cutoff_ts);
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Delay-queue scan timer
async fn schedule_loop(
    config: Arc<MessageStoreConfig>,
    schedule: Arc<ScheduleService>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval =
        tokio::time::interval(Duration::from_millis(config.schedule_scan_interval_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => schedule.scan().await,
            _ = shutdown.changed() => break,
        }
    }
}
