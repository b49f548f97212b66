//! Message types and property codec
//!
//! [`Message`] is the producer-facing input; [`MessageExt`] is a fully
//! decoded commit-log record. Properties travel inside the record as a flat
//! `key\x01value\x02...` string; well-known keys (tags, index keys, delay
//! level, real destination of a delayed message) are defined here.

use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Property key: message tags (single filter tag)
pub const PROPERTY_TAGS: &str = "TAGS";
/// Property key: space-separated index keys
pub const PROPERTY_KEYS: &str = "KEYS";
/// Property key: delay level (redelivery tier), absent or "0" = immediate
pub const PROPERTY_DELAY_LEVEL: &str = "DELAY";
/// Property key: real destination topic of a delayed message
pub const PROPERTY_REAL_TOPIC: &str = "REAL_TOPIC";
/// Property key: real destination queue id of a delayed message
pub const PROPERTY_REAL_QUEUE_ID: &str = "REAL_QID";

/// Separator between a property key and its value
pub const PROPERTY_KV_SEPARATOR: char = '\u{1}';
/// Separator between properties
pub const PROPERTY_SEPARATOR: char = '\u{2}';

/// Separator for multiple values under [`PROPERTY_KEYS`]
pub const KEYS_SEPARATOR: char = ' ';

/// A message as handed to the store by the protocol layer.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub queue_id: i32,
    pub body: Bytes,
    pub flags: i32,
    pub sys_flags: i32,
    pub properties: HashMap<String, String>,
    pub born_timestamp: i64,
    pub born_host: SocketAddr,
    pub reconsume_times: i32,
    pub prepared_transaction_offset: i64,
}

impl Message {
    /// New message with empty properties and loopback born host
    pub fn new(topic: impl Into<String>, queue_id: i32, body: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            queue_id,
            body: body.into(),
            flags: 0,
            sys_flags: 0,
            properties: HashMap::new(),
            born_timestamp: chrono::Utc::now().timestamp_millis(),
            born_host: "127.0.0.1:0".parse().expect("static literal"),
            reconsume_times: 0,
            prepared_transaction_offset: 0,
        }
    }

    /// Set a property, consuming and returning self
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Set the delay level (0 disables delay)
    pub fn with_delay_level(self, level: u32) -> Self {
        self.with_property(PROPERTY_DELAY_LEVEL, level.to_string())
    }

    /// Delay level parsed from properties, 0 when absent
    pub fn delay_level(&self) -> u32 {
        self.properties
            .get(PROPERTY_DELAY_LEVEL)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Index keys from the KEYS property
    pub fn keys(&self) -> Vec<String> {
        self.properties
            .get(PROPERTY_KEYS)
            .map(|k| {
                k.split(KEYS_SEPARATOR)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A fully decoded commit-log record.
#[derive(Debug, Clone)]
pub struct MessageExt {
    pub topic: String,
    pub queue_id: i32,
    pub queue_offset: i64,
    pub physical_offset: i64,
    pub total_size: i32,
    pub body: Bytes,
    pub flags: i32,
    pub sys_flags: i32,
    pub properties: HashMap<String, String>,
    pub born_timestamp: i64,
    pub born_host: [u8; 8],
    pub store_timestamp: i64,
    pub store_host: [u8; 8],
    pub reconsume_times: i32,
    pub prepared_transaction_offset: i64,
    pub body_crc: u32,
}

impl MessageExt {
    /// Message id for this record: physical offset (16 hex) + size (8 hex)
    pub fn msg_id(&self) -> String {
        encode_msg_id(self.physical_offset, self.total_size)
    }
}

/// Encode a message id from physical offset and record size.
pub fn encode_msg_id(physical_offset: i64, size: i32) -> String {
    format!("{:016X}{:08X}", physical_offset as u64, size as u32)
}

/// Decode a message id back into (physical offset, record size).
pub fn decode_msg_id(msg_id: &str) -> Option<(i64, i32)> {
    if msg_id.len() != 24 {
        return None;
    }
    let offset = u64::from_str_radix(&msg_id[..16], 16).ok()? as i64;
    let size = u32::from_str_radix(&msg_id[16..], 16).ok()? as i32;
    Some((offset, size))
}

/// Flatten a property map into its on-disk string form.
pub fn properties_to_string(properties: &HashMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in properties {
        out.push_str(key);
        out.push(PROPERTY_KV_SEPARATOR);
        out.push_str(value);
        out.push(PROPERTY_SEPARATOR);
    }
    out
}

/// Parse the on-disk property string back into a map.
pub fn parse_properties(raw: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for item in raw.split(PROPERTY_SEPARATOR) {
        if item.is_empty() {
            continue;
        }
        if let Some((key, value)) = item.split_once(PROPERTY_KV_SEPARATOR) {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

/// Hash used for both tags codes and index keys (Java-style string hash,
/// kept for parity with the original on-disk chains).
pub fn string_hash(s: &str) -> i32 {
    let mut h: i32 = 0;
    for b in s.bytes() {
        h = h.wrapping_mul(31).wrapping_add(b as i32);
    }
    h
}

/// Pack a socket address into the record's fixed 8-byte host field
/// (IPv4 octets + port; IPv6 addresses degrade to zeroed octets).
pub fn host_to_bytes(addr: &SocketAddr) -> [u8; 8] {
    let mut out = [0u8; 8];
    if let SocketAddr::V4(v4) = addr {
        out[..4].copy_from_slice(&v4.ip().octets());
    }
    out[4..].copy_from_slice(&(addr.port() as u32).to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_round_trip() {
        let mut props = HashMap::new();
        props.insert("TAGS".to_string(), "tagA".to_string());
        props.insert("KEYS".to_string(), "order-1 order-2".to_string());

        let raw = properties_to_string(&props);
        let parsed = parse_properties(&raw);
        assert_eq!(parsed, props);
    }

    #[test]
    fn test_msg_id_round_trip() {
        let id = encode_msg_id(1_234_567, 456);
        assert_eq!(id.len(), 24);
        assert_eq!(decode_msg_id(&id), Some((1_234_567, 456)));
        assert_eq!(decode_msg_id("short"), None);
    }

    #[test]
    fn test_keys_split() {
        let msg = Message::new("topicA", 0, "x").with_property(PROPERTY_KEYS, "k1 k2  k3");
        assert_eq!(msg.keys(), vec!["k1", "k2", "k3"]);
    }

    #[test]
    fn test_delay_level_default() {
        let msg = Message::new("topicA", 0, "x");
        assert_eq!(msg.delay_level(), 0);
        assert_eq!(msg.with_delay_level(3).delay_level(), 3);
    }

    #[test]
    fn test_host_to_bytes() {
        let addr: SocketAddr = "10.1.2.3:10911".parse().unwrap();
        let bytes = host_to_bytes(&addr);
        assert_eq!(&bytes[..4], &[10, 1, 2, 3]);
        assert_eq!(u32::from_be_bytes(bytes[4..].try_into().unwrap()), 10911);
    }
}
