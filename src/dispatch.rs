//! Dispatch pipeline: commit log -> consume queues + index
//!
//! A single consumer drains the bounded request channel in strict FIFO
//! order, which is what turns the append lock's total order into the order
//! consumers observe. Each request updates exactly one consume queue and,
//! when the message carries keys, the index. Failures are retried with
//! backoff; exhausting the budget marks the store degraded instead of
//! silently letting the logical indices diverge from the commit log.

use crate::config::MessageStoreConfig;
use crate::consume_queue::ConsumeQueueTable;
use crate::index::IndexService;
use crate::running_flags::RunningFlags;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Descriptor of one appended record, consumed exactly once
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub topic: String,
    pub queue_id: i32,
    pub commitlog_offset: i64,
    pub msg_size: i32,
    pub tags_code: i64,
    pub store_timestamp: i64,
    pub queue_offset: i64,
    pub keys: Vec<String>,
}

/// The single-consumer dispatch task
pub struct DispatchService {
    config: Arc<MessageStoreConfig>,
    cq_table: Arc<ConsumeQueueTable>,
    index: Arc<IndexService>,
    running_flags: Arc<RunningFlags>,
    /// Commit-log frontier applied to the logical indices (offset + size of
    /// the last dispatched record); feeds the checkpoint's logical position.
    dispatched_position: Arc<AtomicI64>,
}

impl DispatchService {
    pub fn new(
        config: Arc<MessageStoreConfig>,
        cq_table: Arc<ConsumeQueueTable>,
        index: Arc<IndexService>,
        running_flags: Arc<RunningFlags>,
        dispatched_position: Arc<AtomicI64>,
    ) -> Self {
        Self {
            config,
            cq_table,
            index,
            running_flags,
            dispatched_position,
        }
    }

    /// Apply one request: consume-queue entry first, then index keys.
    /// Shared by the live pipeline and recovery replay.
    pub fn apply(&self, request: &DispatchRequest) -> crate::error::Result<()> {
        let cq = self.cq_table.find_or_create(&request.topic, request.queue_id);
        cq.put_entry(
            request.commitlog_offset,
            request.msg_size,
            request.tags_code,
            request.queue_offset,
        )?;

        if !request.keys.is_empty() {
            if let Err(e) = self.index.put_message_keys(
                &request.topic,
                &request.keys,
                request.commitlog_offset,
                request.msg_size,
                request.store_timestamp,
            ) {
                // Index damage degrades queries, not consumption; flag it
                // and keep the pipeline moving.
                error!(error = %e, topic = %request.topic, "Index update failed");
                self.running_flags.mark_index_file_error();
            }
        }

        self.dispatched_position.store(
            request.commitlog_offset + request.msg_size as i64,
            Ordering::Release,
        );
        Ok(())
    }

    async fn apply_with_retry(&self, request: &DispatchRequest) {
        let mut backoff = Duration::from_millis(self.config.dispatch_retry_backoff_ms);
        for attempt in 0..=self.config.dispatch_max_retries {
            match self.apply(request) {
                Ok(()) => return,
                Err(e) if attempt < self.config.dispatch_max_retries => {
                    debug!(
                        error = %e,
                        attempt,
                        topic = %request.topic,
                        queue_id = request.queue_id,
                        "Dispatch failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        topic = %request.topic,
                        queue_id = request.queue_id,
                        commitlog_offset = request.commitlog_offset,
                        "Dispatch retries exhausted, store degraded"
                    );
                    self.running_flags.mark_logics_queue_error();
                }
            }
        }
    }

    /// Drain the channel until shutdown, then finish whatever is queued
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<DispatchRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                request = rx.recv() => {
                    match request {
                        Some(request) => self.apply_with_retry(&request).await,
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    // Drain the backlog so consume queues catch up to the
                    // commit log before the store flushes its checkpoint.
                    while let Ok(request) = rx.try_recv() {
                        self.apply_with_retry(&request).await;
                    }
                    break;
                }
            }
        }
        info!(
            dispatched_position = self.dispatched_position.load(Ordering::Acquire),
            "Dispatch service stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consume_queue::CQ_UNIT_SIZE;
    use tempfile::tempdir;

    fn fixture(dir: &std::path::Path) -> (DispatchService, Arc<ConsumeQueueTable>, Arc<AtomicI64>) {
        let config = Arc::new(MessageStoreConfig::new(dir));
        let cq_table = Arc::new(ConsumeQueueTable::new(
            config.consume_queue_path(),
            100 * CQ_UNIT_SIZE,
        ));
        let index = Arc::new(IndexService::new(config.index_path(), 16, 64, 32));
        let position = Arc::new(AtomicI64::new(0));
        let service = DispatchService::new(
            config,
            cq_table.clone(),
            index,
            Arc::new(RunningFlags::new()),
            position.clone(),
        );
        (service, cq_table, position)
    }

    fn request(queue_offset: i64, commitlog_offset: i64) -> DispatchRequest {
        DispatchRequest {
            topic: "topicA".to_string(),
            queue_id: 0,
            commitlog_offset,
            msg_size: 100,
            tags_code: 0,
            store_timestamp: 1000,
            queue_offset,
            keys: vec![],
        }
    }

    #[test]
    fn test_apply_creates_queue_and_entry() {
        let dir = tempdir().unwrap();
        let (service, cq_table, position) = fixture(dir.path());

        service.apply(&request(0, 0)).unwrap();
        service.apply(&request(1, 100)).unwrap();

        let cq = cq_table.find("topicA", 0).unwrap();
        assert_eq!(cq.max_offset_in_queue(), 2);
        assert_eq!(cq.get_entry(1), Some((100, 100, 0)));
        assert_eq!(position.load(Ordering::Acquire), 200);
    }

    #[tokio::test]
    async fn test_run_drains_on_shutdown() {
        let dir = tempdir().unwrap();
        let (service, cq_table, _) = fixture(dir.path());
        let (tx, rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);

        for i in 0..5 {
            tx.send(request(i, i * 100)).await.unwrap();
        }
        let handle = tokio::spawn(service.run(rx, stop_rx));
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        let cq = cq_table.find("topicA", 0).unwrap();
        assert_eq!(cq.max_offset_in_queue(), 5);
    }
}
