//! Delay-level redelivery
//!
//! Delayed messages are appended under an internal topic with one queue
//! per delay level; the consume-queue tags code of each entry is the
//! deliver timestamp. A periodic scan walks each level from a persisted
//! cursor, and once an entry comes due its record is read back, its real
//! destination restored from the properties, and the message appended
//! again as an ordinary immediate message.

use crate::commitlog::{decode_record, CommitLog};
use crate::config::MessageStoreConfig;
use crate::consume_queue::ConsumeQueueTable;
use crate::error::{Result, StoreError};
use crate::message::{
    Message, PROPERTY_DELAY_LEVEL, PROPERTY_REAL_QUEUE_ID, PROPERTY_REAL_TOPIC,
};
use crate::running_flags::RunningFlags;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Internal topic holding delayed messages, one queue per delay level
pub const SCHEDULE_TOPIC: &str = "SCHEDULE_TOPIC_XXXX";

/// Parsed delay-level tiers, 1-based
pub struct DelayLevelTable {
    delays_ms: Vec<i64>,
}

impl DelayLevelTable {
    /// Parse the config string, e.g. `"1s 5s 10s 30s 1m 2m"`.
    pub fn parse(levels: &str) -> Result<Self> {
        let mut delays_ms = Vec::new();
        for token in levels.split_whitespace() {
            let (number, unit_ms) = if let Some(n) = token.strip_suffix('s') {
                (n, 1_000)
            } else if let Some(n) = token.strip_suffix('m') {
                (n, 60_000)
            } else if let Some(n) = token.strip_suffix('h') {
                (n, 3_600_000)
            } else if let Some(n) = token.strip_suffix('d') {
                (n, 86_400_000)
            } else {
                return Err(StoreError::Config(format!("bad delay unit: {token}")));
            };
            let value: i64 = number
                .parse()
                .map_err(|_| StoreError::Config(format!("bad delay level: {token}")))?;
            delays_ms.push(value * unit_ms);
        }
        if delays_ms.is_empty() {
            return Err(StoreError::Config("empty delay level table".to_string()));
        }
        Ok(Self { delays_ms })
    }

    /// Highest level (levels above this are clamped down)
    pub fn max_level(&self) -> u32 {
        self.delays_ms.len() as u32
    }

    /// Delay of a 1-based level in milliseconds; out-of-range levels clamp
    /// to the nearest tier
    pub fn delay_ms(&self, level: u32) -> i64 {
        let idx = (level.max(1) as usize - 1).min(self.delays_ms.len() - 1);
        self.delays_ms[idx]
    }
}

/// Per-level scan cursors with JSON persistence
pub struct DelayOffsetStore {
    path: PathBuf,
    offsets: Mutex<HashMap<u32, i64>>,
}

impl DelayOffsetStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let offsets = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            offsets: Mutex::new(offsets),
        })
    }

    pub fn get(&self, level: u32) -> i64 {
        self.offsets.lock().get(&level).copied().unwrap_or(0)
    }

    pub fn set(&self, level: u32, offset: i64) {
        self.offsets.lock().insert(level, offset);
    }

    /// Write the cursor file atomically (temp file then rename)
    pub fn persist(&self) -> Result<()> {
        let json = {
            let offsets = self.offsets.lock();
            serde_json::to_string_pretty(&*offsets)?
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Periodic delay-queue scanner
pub struct ScheduleService {
    config: Arc<MessageStoreConfig>,
    delay_levels: Arc<DelayLevelTable>,
    commit_log: Arc<CommitLog>,
    cq_table: Arc<ConsumeQueueTable>,
    running_flags: Arc<RunningFlags>,
    offsets: DelayOffsetStore,
}

impl ScheduleService {
    pub fn new(
        config: Arc<MessageStoreConfig>,
        delay_levels: Arc<DelayLevelTable>,
        commit_log: Arc<CommitLog>,
        cq_table: Arc<ConsumeQueueTable>,
        running_flags: Arc<RunningFlags>,
    ) -> Result<Self> {
        let offsets = DelayOffsetStore::load(config.delay_offset_path())?;
        Ok(Self {
            config,
            delay_levels,
            commit_log,
            cq_table,
            running_flags,
            offsets,
        })
    }

    /// One pass over every level. Entries are ordered by store time within
    /// a level so the scan stops at the first not-yet-due entry.
    pub async fn scan(&self) {
        for level in 1..=self.delay_levels.max_level() {
            if let Err(e) = self.scan_level(level).await {
                error!(level, error = %e, "Delay level scan failed");
            }
        }
        if let Err(e) = self.offsets.persist() {
            warn!(error = %e, "Failed to persist delay offsets");
        }
    }

    async fn scan_level(&self, level: u32) -> Result<()> {
        // Redelivery appends like any other write; when the store refuses
        // appends the cursor stays put and the level is retried later.
        if !self.running_flags.is_writeable() {
            return Ok(());
        }
        let queue_id = (level - 1) as i32;
        let cq = match self.cq_table.find(SCHEDULE_TOPIC, queue_id) {
            Some(cq) => cq,
            None => return Ok(()),
        };

        let mut cursor = self.offsets.get(level).max(cq.min_offset_in_queue());
        let max = cq.max_offset_in_queue();
        let now = chrono::Utc::now().timestamp_millis();

        while cursor < max {
            let (phy_offset, size, deliver_ts) = match cq.get_entry(cursor) {
                Some(entry) => entry,
                None => break,
            };
            if deliver_ts > now {
                break;
            }

            match self.redeliver(phy_offset, size).await {
                Ok(()) => {}
                Err(StoreError::ShuttingDown) => return Err(StoreError::ShuttingDown),
                Err(e) => {
                    // A record that cannot be redelivered is skipped rather
                    // than wedging every later entry in the level.
                    warn!(
                        level,
                        phy_offset,
                        error = %e,
                        "Skipping undeliverable delayed record"
                    );
                }
            }
            cursor += 1;
            self.offsets.set(level, cursor);
        }
        Ok(())
    }

    async fn redeliver(&self, phy_offset: i64, size: i32) -> Result<()> {
        let raw = self
            .commit_log
            .get_message(phy_offset, size)
            .ok_or_else(|| StoreError::OffsetOutOfRange(phy_offset))?;
        let ext = decode_record(&raw)?;
        let msg = restore_real_destination(ext)?;
        debug!(
            topic = %msg.topic,
            queue_id = msg.queue_id,
            phy_offset,
            "Redelivering delayed message"
        );
        self.commit_log.put_message(msg).await?;
        Ok(())
    }

    pub fn persist_offsets(&self) -> Result<()> {
        self.offsets.persist()
    }
}

/// Rebuild the original message from a delay-queue record, restoring its
/// real topic and queue id and stripping the delay properties so the
/// re-append is immediate.
fn restore_real_destination(ext: crate::message::MessageExt) -> Result<Message> {
    let mut properties = ext.properties;
    let topic = properties.remove(PROPERTY_REAL_TOPIC).ok_or_else(|| {
        StoreError::MessageIllegal("delayed record missing real topic".to_string())
    })?;
    let queue_id = properties
        .remove(PROPERTY_REAL_QUEUE_ID)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            StoreError::MessageIllegal("delayed record missing real queue id".to_string())
        })?;
    properties.remove(PROPERTY_DELAY_LEVEL);

    let born_host: SocketAddr = {
        let octets = &ext.born_host[..4];
        let port = u32::from_be_bytes(ext.born_host[4..].try_into().unwrap_or_default()) as u16;
        format!("{}.{}.{}.{}:{}", octets[0], octets[1], octets[2], octets[3], port)
            .parse()
            .unwrap_or_else(|_| "127.0.0.1:0".parse().expect("static literal"))
    };

    Ok(Message {
        topic,
        queue_id,
        body: ext.body,
        flags: ext.flags,
        sys_flags: ext.sys_flags,
        properties,
        born_timestamp: ext.born_timestamp,
        born_host,
        reconsume_times: ext.reconsume_times,
        prepared_transaction_offset: ext.prepared_transaction_offset,
    })
}

impl ScheduleService {
    /// Log the configured tiers once at startup
    pub fn log_levels(&self) {
        info!(
            levels = self.delay_levels.max_level(),
            table = %self.config.message_delay_levels,
            "Delay level table loaded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_delay_levels() {
        let table = DelayLevelTable::parse("1s 5s 10s 30s 1m 2m 1h").unwrap();
        assert_eq!(table.max_level(), 7);
        assert_eq!(table.delay_ms(1), 1_000);
        assert_eq!(table.delay_ms(5), 60_000);
        assert_eq!(table.delay_ms(7), 3_600_000);
        // out of range clamps
        assert_eq!(table.delay_ms(0), 1_000);
        assert_eq!(table.delay_ms(99), 3_600_000);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DelayLevelTable::parse("").is_err());
        assert!(DelayLevelTable::parse("5x").is_err());
        assert!(DelayLevelTable::parse("abc").is_err());
        // Multi-byte trailing character must error, not panic.
        assert!(DelayLevelTable::parse("5é").is_err());
        assert!(DelayLevelTable::parse("1s 5é 10s").is_err());
    }

    #[test]
    fn test_delay_offset_store_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("delayOffset.json");

        let store = DelayOffsetStore::load(&path).unwrap();
        assert_eq!(store.get(1), 0);
        store.set(1, 42);
        store.set(3, 7);
        store.persist().unwrap();

        let reloaded = DelayOffsetStore::load(&path).unwrap();
        assert_eq!(reloaded.get(1), 42);
        assert_eq!(reloaded.get(3), 7);
        assert_eq!(reloaded.get(2), 0);
    }

    #[test]
    fn test_restore_real_destination() {
        let mut properties = HashMap::new();
        properties.insert(PROPERTY_REAL_TOPIC.to_string(), "orders".to_string());
        properties.insert(PROPERTY_REAL_QUEUE_ID.to_string(), "2".to_string());
        properties.insert(PROPERTY_DELAY_LEVEL.to_string(), "3".to_string());

        let ext = crate::message::MessageExt {
            topic: SCHEDULE_TOPIC.to_string(),
            queue_id: 2,
            queue_offset: 0,
            physical_offset: 0,
            total_size: 100,
            body: bytes::Bytes::from_static(b"payload"),
            body_crc: 0,
            flags: 0,
            sys_flags: 0,
            properties,
            born_timestamp: 123,
            born_host: [127, 0, 0, 1, 0, 0, 0, 80],
            store_timestamp: 456,
            store_host: [0; 8],
            reconsume_times: 0,
            prepared_transaction_offset: 0,
        };

        let msg = restore_real_destination(ext).unwrap();
        assert_eq!(msg.topic, "orders");
        assert_eq!(msg.queue_id, 2);
        assert_eq!(msg.delay_level(), 0);
        assert!(!msg.properties.contains_key(PROPERTY_REAL_TOPIC));
    }
}
