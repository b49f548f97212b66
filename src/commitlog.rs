//! The commit log: single physical append-only record stream
//!
//! Every message on the node, regardless of topic, lands here first; consume
//! queues and the key index are derived views. Append is the one
//! serialization point in the engine: an exclusive async lock assigns the
//! global physical offset and the per-(topic, queue) logical offset, writes
//! the record, and enqueues the dispatch request before the lock drops, so
//! dispatch order always equals append order.
//!
//! ## Record layout (big-endian)
//!
//! ```text
//! total_size:i32  magic:i32  body_crc:u32  queue_id:i32  flags:i32
//! queue_offset:i64  physical_offset:i64  sys_flags:i32
//! born_timestamp:i64  born_host:8B  store_timestamp:i64  store_host:8B
//! reconsume_times:i32  prepared_transaction_offset:i64
//! body_len:i32 + body  topic_len:u8 + topic  properties_len:i16 + properties
//! ```
//!
//! `physical_offset + total_size` of any valid record equals the physical
//! offset of the next record or the current write frontier. A segment tail
//! too small for the next record is closed with a blank record
//! (`{remaining, BLANK_MAGIC}`) and the stream rolls to the next segment.

use crate::allocate::AllocateService;
use crate::config::{FlushDiskType, MessageStoreConfig};
use crate::dispatch::DispatchRequest;
use crate::error::{Result, StoreError};
use crate::mapped_queue::MappedQueue;
use crate::message::{
    host_to_bytes, parse_properties, properties_to_string, string_hash, Message, MessageExt,
    PROPERTY_DELAY_LEVEL, PROPERTY_REAL_QUEUE_ID, PROPERTY_REAL_TOPIC, PROPERTY_TAGS,
};
use crate::schedule::{DelayLevelTable, SCHEDULE_TOPIC};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Magic code of a live record
pub const MESSAGE_MAGIC_CODE: i32 = -626843481;
/// Magic code of the blank filler closing out a segment
pub const BLANK_MAGIC_CODE: i32 = -875286124;

/// Minimum tail space kept for the blank filler (total_size + magic)
const END_FILE_MIN_BLANK: usize = 8;

/// Fixed byte offset of the store timestamp within a record
const STORE_TIMESTAMP_POS: usize = 56;

/// Fixed header bytes before the variable body/topic/properties sections
const RECORD_HEADER_SIZE: usize = 84;

/// Outcome of an append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendStatus {
    Ok,
    MessageIllegal,
    FlushDiskTimeout,
    UnknownError,
}

/// Result of [`CommitLog::put_message`]
#[derive(Debug, Clone)]
pub struct AppendResult {
    pub status: AppendStatus,
    pub physical_offset: i64,
    pub wrote_bytes: i32,
    pub msg_id: String,
    pub queue_offset: i64,
    pub store_timestamp: i64,
}

impl AppendResult {
    fn rejected(status: AppendStatus) -> Self {
        Self {
            status,
            physical_offset: -1,
            wrote_bytes: 0,
            msg_id: String::new(),
            queue_offset: -1,
            store_timestamp: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status, AppendStatus::Ok | AppendStatus::FlushDiskTimeout)
    }
}

/// Synchronous-flush request: ack fires once the durable frontier passes
/// `deadline_offset`.
pub struct GroupCommitRequest {
    pub deadline_offset: u64,
    pub ack: oneshot::Sender<bool>,
}

/// Outcome of validating one position in the stream during a scan
pub enum RecordCheck {
    /// A valid record and its dispatch descriptor
    Ok(DispatchRequest),
    /// Blank filler: the stream continues at the next segment boundary
    Blank,
    /// Zeroed bytes: the write frontier
    End,
    /// Garbage: torn write or corruption
    Invalid,
}

/// Key of the logical offset assignment table; also used when the table is
/// rebuilt from the consume queues after recovery.
pub fn topic_queue_key(topic: &str, queue_id: i32) -> String {
    format!("{}-{}", topic, queue_id)
}

/// State guarded by the append lock: the per-(topic, queue) logical offset
/// assignment table.
struct TopicQueueTable {
    next_offsets: HashMap<String, i64>,
}

impl TopicQueueTable {
    fn key(topic: &str, queue_id: i32) -> String {
        topic_queue_key(topic, queue_id)
    }
}

/// The physical append-only message log
pub struct CommitLog {
    config: Arc<MessageStoreConfig>,
    queue: MappedQueue,
    delay_levels: Arc<DelayLevelTable>,
    append_lock: tokio::sync::Mutex<TopicQueueTable>,
    dispatch_tx: mpsc::Sender<DispatchRequest>,
    group_commit_tx: mpsc::Sender<GroupCommitRequest>,
}

impl CommitLog {
    /// Returns the log plus the receiving end of the group-commit channel;
    /// the store spawns the group-commit flush task around it.
    pub fn new(
        config: Arc<MessageStoreConfig>,
        allocator: Arc<AllocateService>,
        delay_levels: Arc<DelayLevelTable>,
        dispatch_tx: mpsc::Sender<DispatchRequest>,
    ) -> (Self, mpsc::Receiver<GroupCommitRequest>) {
        let (group_commit_tx, group_commit_rx) = mpsc::channel(1024);
        let queue = MappedQueue::new(
            config.commit_log_path(),
            config.commit_log_file_size,
            Some(allocator),
        );
        (
            Self {
                config,
                queue,
                delay_levels,
                append_lock: tokio::sync::Mutex::new(TopicQueueTable {
                    next_offsets: HashMap::new(),
                }),
                dispatch_tx,
                group_commit_tx,
            },
            group_commit_rx,
        )
    }

    /// Open existing segments from disk
    pub fn load(&self) -> Result<()> {
        self.queue.load()
    }

    /// Append one message. The critical section assigns offsets, writes the
    /// record and enqueues the dispatch request; the flush policy runs after
    /// the lock drops.
    pub async fn put_message(&self, mut msg: Message) -> Result<AppendResult> {
        if msg.topic.len() > u8::MAX as usize {
            return Ok(AppendResult::rejected(AppendStatus::MessageIllegal));
        }
        if msg.body.len() > self.config.max_message_size {
            return Ok(AppendResult::rejected(AppendStatus::MessageIllegal));
        }

        // Delayed messages are rerouted into the per-level delay queue; the
        // real destination travels in the properties.
        let delay_level = msg.delay_level();
        if delay_level > 0 && msg.topic != SCHEDULE_TOPIC {
            let level = delay_level.min(self.delay_levels.max_level());
            msg.properties
                .insert(PROPERTY_REAL_TOPIC.to_string(), msg.topic.clone());
            msg.properties
                .insert(PROPERTY_REAL_QUEUE_ID.to_string(), msg.queue_id.to_string());
            msg.properties
                .insert(PROPERTY_DELAY_LEVEL.to_string(), level.to_string());
            msg.topic = SCHEDULE_TOPIC.to_string();
            msg.queue_id = (level - 1) as i32;
        }

        let properties = properties_to_string(&msg.properties);
        if properties.len() > i16::MAX as usize {
            return Ok(AppendResult::rejected(AppendStatus::MessageIllegal));
        }
        let total_size = RECORD_HEADER_SIZE + 4 + msg.body.len() + 1 + msg.topic.len() + 2 + properties.len();
        if total_size + END_FILE_MIN_BLANK > self.config.commit_log_file_size {
            return Ok(AppendResult::rejected(AppendStatus::MessageIllegal));
        }

        let store_timestamp;
        let physical_offset;
        let queue_offset;
        {
            let mut table = self.append_lock.lock().await;
            store_timestamp = chrono::Utc::now().timestamp_millis();

            let key = TopicQueueTable::key(&msg.topic, msg.queue_id);
            queue_offset = *table.next_offsets.entry(key.clone()).or_insert(0);

            let file = loop {
                let file = self
                    .queue
                    .current_append_file_or_create(self.queue.max_offset())?;
                if total_size + END_FILE_MIN_BLANK <= file.remaining() {
                    break file;
                }
                // Close out the tail with a blank record and roll.
                let remaining = file.remaining();
                let mut blank = vec![0u8; remaining];
                blank[..4].copy_from_slice(&(remaining as i32).to_be_bytes());
                blank[4..8].copy_from_slice(&BLANK_MAGIC_CODE.to_be_bytes());
                file.append(&blank)?;
            };

            physical_offset = (file.file_from_offset() + file.wrote_position() as u64) as i64;
            let record = encode_record(
                &msg,
                physical_offset,
                queue_offset,
                store_timestamp,
                &properties,
                host_to_bytes(&self.config.store_host),
            );
            debug_assert_eq!(record.len(), total_size);
            file.append(&record)?;
            table.next_offsets.insert(key, queue_offset + 1);

            let request = DispatchRequest {
                topic: msg.topic.clone(),
                queue_id: msg.queue_id,
                commitlog_offset: physical_offset,
                msg_size: total_size as i32,
                tags_code: self.tags_code(&msg.topic, &msg.properties, store_timestamp),
                store_timestamp,
                queue_offset,
                keys: msg.keys(),
            };
            // Bounded queue: a full dispatch pipeline blocks producers here
            // so the source of truth cannot outrun index consistency.
            self.dispatch_tx
                .send(request)
                .await
                .map_err(|_| StoreError::ShuttingDown)?;
        }

        let status = self.handle_flush(physical_offset as u64 + total_size as u64).await;

        Ok(AppendResult {
            status,
            physical_offset,
            wrote_bytes: total_size as i32,
            msg_id: crate::message::encode_msg_id(physical_offset, total_size as i32),
            queue_offset,
            store_timestamp,
        })
    }

    /// Apply the configured flush policy after a successful append
    async fn handle_flush(&self, deadline_offset: u64) -> AppendStatus {
        match self.config.flush_disk_type {
            FlushDiskType::AsyncFlush => AppendStatus::Ok,
            FlushDiskType::SyncFlush => {
                let (ack_tx, ack_rx) = oneshot::channel();
                let request = GroupCommitRequest {
                    deadline_offset,
                    ack: ack_tx,
                };
                if self.group_commit_tx.send(request).await.is_err() {
                    return AppendStatus::FlushDiskTimeout;
                }
                let timeout = std::time::Duration::from_millis(self.config.sync_flush_timeout_ms);
                match tokio::time::timeout(timeout, ack_rx).await {
                    Ok(Ok(true)) => AppendStatus::Ok,
                    _ => {
                        warn!(deadline_offset, "Synchronous flush timed out");
                        AppendStatus::FlushDiskTimeout
                    }
                }
            }
        }
    }

    /// Tags code for dispatch: for delay-queue records this is the deliver
    /// timestamp (the schedule scan compares it against the clock); for
    /// everything else it is the tag hash.
    fn tags_code(&self, topic: &str, properties: &HashMap<String, String>, store_ts: i64) -> i64 {
        if topic == SCHEDULE_TOPIC {
            if let Some(level) = properties
                .get(PROPERTY_DELAY_LEVEL)
                .and_then(|v| v.parse::<u32>().ok())
            {
                return store_ts + self.delay_levels.delay_ms(level);
            }
        }
        properties
            .get(PROPERTY_TAGS)
            .map(|tags| string_hash(tags) as i64)
            .unwrap_or(0)
    }

    /// Raw record bytes at (offset, size)
    pub fn get_message(&self, offset: i64, size: i32) -> Option<Bytes> {
        if offset < 0 || size <= 0 {
            return None;
        }
        let file = self.queue.file_by_offset(offset as u64, false)?;
        let in_file = (offset as u64 - file.file_from_offset()) as usize;
        if in_file + size as usize > file.wrote_position() {
            return None;
        }
        file.read(in_file, size as usize)
    }

    /// Raw record bytes at an offset, reading the size prefix first
    pub fn get_message_at(&self, offset: i64) -> Option<Bytes> {
        let file = self.queue.file_by_offset(offset as u64, false)?;
        let in_file = (offset as u64 - file.file_from_offset()) as usize;
        if in_file + 4 > file.wrote_position() {
            return None;
        }
        let size = i32::from_be_bytes(file.read(in_file, 4)?.as_ref().try_into().ok()?);
        self.get_message(offset, size)
    }

    /// Store timestamp of the record at (offset, size), without a full decode
    pub fn pickup_store_timestamp(&self, offset: i64, size: i32) -> Option<i64> {
        if size < (STORE_TIMESTAMP_POS + 8) as i32 {
            return None;
        }
        let bytes = self.get_message(offset, STORE_TIMESTAMP_POS as i32 + 8)?;
        Some(i64::from_be_bytes(
            bytes[STORE_TIMESTAMP_POS..STORE_TIMESTAMP_POS + 8]
                .try_into()
                .ok()?,
        ))
    }

    /// Validate the record at `offset` and build its dispatch descriptor.
    /// Used by recovery scanning and dispatch replay.
    pub fn check_record(&self, offset: i64) -> RecordCheck {
        let Some(file) = self.queue.file_by_offset(offset as u64, false) else {
            return RecordCheck::End;
        };
        let in_file = (offset as u64 - file.file_from_offset()) as usize;
        let Some(head) = file.read(in_file, 8) else {
            return RecordCheck::End;
        };
        let total_size = i32::from_be_bytes(head[..4].try_into().expect("4 bytes"));
        let magic = i32::from_be_bytes(head[4..].try_into().expect("4 bytes"));

        match magic {
            BLANK_MAGIC_CODE => RecordCheck::Blank,
            MESSAGE_MAGIC_CODE => {
                if total_size <= 0 || in_file + total_size as usize > file.capacity() {
                    return RecordCheck::Invalid;
                }
                let Some(record) = file.read(in_file, total_size as usize) else {
                    return RecordCheck::Invalid;
                };
                match decode_record(&record) {
                    Ok(msg) => {
                        if msg.physical_offset != offset {
                            return RecordCheck::Invalid;
                        }
                        let mut crc = crc32fast::Hasher::new();
                        crc.update(&msg.body);
                        if crc.finalize() != msg.body_crc {
                            warn!(offset, "Record body CRC mismatch");
                            return RecordCheck::Invalid;
                        }
                        RecordCheck::Ok(DispatchRequest {
                            tags_code: self.tags_code(
                                &msg.topic,
                                &msg.properties,
                                msg.store_timestamp,
                            ),
                            keys: msg
                                .properties
                                .get(crate::message::PROPERTY_KEYS)
                                .map(|k| {
                                    k.split(' ')
                                        .filter(|s| !s.is_empty())
                                        .map(str::to_string)
                                        .collect()
                                })
                                .unwrap_or_default(),
                            topic: msg.topic,
                            queue_id: msg.queue_id,
                            commitlog_offset: msg.physical_offset,
                            msg_size: msg.total_size,
                            store_timestamp: msg.store_timestamp,
                            queue_offset: msg.queue_offset,
                        })
                    }
                    Err(_) => RecordCheck::Invalid,
                }
            }
            0 => RecordCheck::End,
            _ => RecordCheck::Invalid,
        }
    }

    /// Scan from (at most) the third-from-last segment forward, validating
    /// magic and CRC record by record, and truncate everything beyond the
    /// last fully-valid offset. Returns the valid frontier.
    ///
    /// Unrecognized garbage at the very head of the log means the log itself
    /// is not ours to repair: fatal.
    pub fn recover(&self) -> Result<u64> {
        let num_files = self.queue.num_files();
        if num_files == 0 {
            return Ok(0);
        }
        let file_size = self.config.commit_log_file_size as u64;
        let start_index = num_files.saturating_sub(3);
        let mut offset = self.queue.min_offset() + start_index as u64 * file_size;
        let head_offset = self.queue.min_offset();

        loop {
            match self.check_record(offset as i64) {
                RecordCheck::Ok(request) => {
                    offset += request.msg_size as u64;
                }
                RecordCheck::Blank => {
                    // Jump to the next segment boundary.
                    offset = (offset / file_size + 1) * file_size;
                    if self.queue.file_by_offset(offset, false).is_none() {
                        break;
                    }
                }
                RecordCheck::End => break,
                RecordCheck::Invalid => {
                    if offset == head_offset {
                        return Err(StoreError::StoreUnavailable(
                            "unrecognized magic code at commit log head".to_string(),
                        ));
                    }
                    warn!(offset, "Invalid record found during recovery, truncating");
                    break;
                }
            }
        }

        info!(
            valid_offset = offset,
            max_offset = self.queue.max_offset(),
            "Commit log recovered"
        );
        self.queue.truncate_dirty_tail(offset);
        Ok(offset)
    }

    /// Seed the per-queue logical offset counters after recovery (derived
    /// from each consume queue's frontier).
    pub async fn set_topic_queue_table(&self, offsets: HashMap<String, i64>) {
        self.append_lock.lock().await.next_offsets = offsets;
    }

    /// Force all written bytes durable; returns the flushed frontier
    pub fn flush(&self) -> Result<u64> {
        self.queue.flush()
    }

    /// Written-but-unflushed bytes (async flush trigger input)
    pub fn unflushed_bytes(&self) -> usize {
        self.queue.unflushed_bytes()
    }

    pub fn min_offset(&self) -> u64 {
        self.queue.min_offset()
    }

    pub fn max_offset(&self) -> u64 {
        self.queue.max_offset()
    }

    pub fn total_bytes(&self) -> u64 {
        (self.queue.num_files() as u64) * self.config.commit_log_file_size as u64
    }

    /// Delete whole expired segments; see [`MappedQueue::delete_expired_by_time`]
    pub async fn delete_expired_files(
        &self,
        expire_ms: i64,
        batch_max: usize,
        delete_interval: std::time::Duration,
        reserve_offset: u64,
        force: bool,
    ) -> usize {
        self.queue
            .delete_expired_by_time(expire_ms, batch_max, delete_interval, reserve_offset, force)
            .await
    }
}

/// Serialize a record; offsets and store timestamp were assigned under the
/// append lock.
fn encode_record(
    msg: &Message,
    physical_offset: i64,
    queue_offset: i64,
    store_timestamp: i64,
    properties: &str,
    store_host: [u8; 8],
) -> BytesMut {
    let total_size =
        RECORD_HEADER_SIZE + 4 + msg.body.len() + 1 + msg.topic.len() + 2 + properties.len();

    let mut crc = crc32fast::Hasher::new();
    crc.update(&msg.body);

    let mut buf = BytesMut::with_capacity(total_size);
    buf.put_i32(total_size as i32);
    buf.put_i32(MESSAGE_MAGIC_CODE);
    buf.put_u32(crc.finalize());
    buf.put_i32(msg.queue_id);
    buf.put_i32(msg.flags);
    buf.put_i64(queue_offset);
    buf.put_i64(physical_offset);
    buf.put_i32(msg.sys_flags);
    buf.put_i64(msg.born_timestamp);
    buf.put_slice(&host_to_bytes(&msg.born_host));
    buf.put_i64(store_timestamp);
    buf.put_slice(&store_host);
    buf.put_i32(msg.reconsume_times);
    buf.put_i64(msg.prepared_transaction_offset);
    buf.put_i32(msg.body.len() as i32);
    buf.put_slice(&msg.body);
    buf.put_u8(msg.topic.len() as u8);
    buf.put_slice(msg.topic.as_bytes());
    buf.put_i16(properties.len() as i16);
    buf.put_slice(properties.as_bytes());
    buf
}

/// Decode a full record. Fails on any structural inconsistency; the caller
/// decides whether that is corruption (recovery) or a hard error.
pub fn decode_record(record: &Bytes) -> Result<MessageExt> {
    if record.len() < RECORD_HEADER_SIZE + 4 + 1 + 2 {
        return Err(StoreError::corrupted("record shorter than fixed header"));
    }
    let mut buf = record.clone();
    let total_size = buf.get_i32();
    let magic = buf.get_i32();
    if magic != MESSAGE_MAGIC_CODE {
        return Err(StoreError::corrupted(format!("bad magic {:#x}", magic)));
    }
    if total_size as usize != record.len() {
        return Err(StoreError::corrupted(format!(
            "record length {} does not match total_size {}",
            record.len(),
            total_size
        )));
    }
    let body_crc = buf.get_u32();
    let queue_id = buf.get_i32();
    let flags = buf.get_i32();
    let queue_offset = buf.get_i64();
    let physical_offset = buf.get_i64();
    let sys_flags = buf.get_i32();
    let born_timestamp = buf.get_i64();
    let mut born_host = [0u8; 8];
    buf.copy_to_slice(&mut born_host);
    let store_timestamp = buf.get_i64();
    let mut store_host = [0u8; 8];
    buf.copy_to_slice(&mut store_host);
    let reconsume_times = buf.get_i32();
    let prepared_transaction_offset = buf.get_i64();

    let body_len = buf.get_i32() as usize;
    if buf.remaining() < body_len + 1 {
        return Err(StoreError::corrupted("record body overruns record"));
    }
    let body = buf.copy_to_bytes(body_len);

    let topic_len = buf.get_u8() as usize;
    if buf.remaining() < topic_len + 2 {
        return Err(StoreError::corrupted("record topic overruns record"));
    }
    let topic = String::from_utf8(buf.copy_to_bytes(topic_len).to_vec())
        .map_err(|_| StoreError::corrupted("record topic is not UTF-8"))?;

    let properties_len = buf.get_i16() as usize;
    if buf.remaining() < properties_len {
        return Err(StoreError::corrupted("record properties overrun record"));
    }
    let properties_raw = String::from_utf8(buf.copy_to_bytes(properties_len).to_vec())
        .map_err(|_| StoreError::corrupted("record properties are not UTF-8"))?;

    Ok(MessageExt {
        topic,
        queue_id,
        queue_offset,
        physical_offset,
        total_size,
        body,
        flags,
        sys_flags,
        properties: parse_properties(&properties_raw),
        born_timestamp,
        born_host,
        store_timestamp,
        store_host,
        reconsume_times,
        prepared_transaction_offset,
        body_crc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_simple(topic: &str, body: &[u8], physical_offset: i64) -> BytesMut {
        let msg = Message::new(topic, 2, body.to_vec());
        let properties = properties_to_string(&msg.properties);
        encode_record(&msg, physical_offset, 5, 1_700_000_000_000, &properties, [0u8; 8])
    }

    #[test]
    fn test_record_round_trip() {
        let record = encode_simple("topicA", b"payload", 4096).freeze();
        let decoded = decode_record(&record).unwrap();

        assert_eq!(decoded.topic, "topicA");
        assert_eq!(decoded.queue_id, 2);
        assert_eq!(decoded.queue_offset, 5);
        assert_eq!(decoded.physical_offset, 4096);
        assert_eq!(decoded.body.as_ref(), b"payload");
        assert_eq!(decoded.store_timestamp, 1_700_000_000_000);
        assert_eq!(decoded.total_size as usize, record.len());
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut record = encode_simple("topicA", b"x", 0);
        record[4] ^= 0xFF;
        assert!(decode_record(&record.freeze()).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let record = encode_simple("topicA", b"some body bytes", 0).freeze();
        let truncated = record.slice(..record.len() - 4);
        assert!(decode_record(&truncated).is_err());
    }

    #[test]
    fn test_store_timestamp_position() {
        // pickup_store_timestamp depends on this fixed layout position.
        let record = encode_simple("t", b"b", 0).freeze();
        let ts = i64::from_be_bytes(
            record[STORE_TIMESTAMP_POS..STORE_TIMESTAMP_POS + 8]
                .try_into()
                .unwrap(),
        );
        assert_eq!(ts, 1_700_000_000_000);
    }
}
