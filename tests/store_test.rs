//! End-to-end store tests: append, read, restart recovery, crash
//! truncation, index queries and delayed redelivery.

use mqstore::message::PROPERTY_KEYS;
use mqstore::{
    FlushDiskType, GetMessageStatus, Message, MessageStore, MessageStoreConfig, StoreError,
};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Initialize test logging
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("mqstore=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

fn test_config(root: &Path) -> MessageStoreConfig {
    let mut config = MessageStoreConfig::new(root);
    config.commit_log_file_size = 64 * 1024;
    config.consume_queue_file_entries = 100;
    config.index_hash_slots = 64;
    config.index_max_entries = 256;
    config.flush_interval_ms = 50;
    config.flush_consume_queue_interval_ms = 50;
    config.schedule_scan_interval_ms = 100;
    config.message_delay_levels = "1s 2s".to_string();
    config
}

async fn open_store(config: MessageStoreConfig) -> MessageStore {
    init_logging();
    let store = MessageStore::new(config).unwrap();
    store.load().await.unwrap();
    store.start().unwrap();
    store
}

/// Poll until `cond` holds; dispatch is asynchronous so reads lag appends.
async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_put_get_round_trip_preserves_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(test_config(dir.path())).await;

    for body in ["A", "B", "C"] {
        let result = store
            .put_message(Message::new("orders", 0, body.as_bytes().to_vec()))
            .await
            .unwrap();
        assert!(result.is_ok(), "append rejected: {:?}", result.status);
    }

    wait_for("3 dispatched messages", || {
        store.get_max_offset_in_queue("orders", 0) == 3
    })
    .await;

    let batch = store.get_message("orders", 0, 0, 32);
    assert_eq!(batch.status, GetMessageStatus::Found);
    assert_eq!(batch.next_begin_offset, 3);
    let bodies: Vec<_> = batch.messages.iter().map(|m| m.body.as_ref()).collect();
    assert_eq!(bodies, vec![b"A".as_ref(), b"B".as_ref(), b"C".as_ref()]);

    // Logical offsets are dense from zero.
    for (i, msg) in batch.messages.iter().enumerate() {
        assert_eq!(msg.queue_offset, i as i64);
        assert_eq!(msg.topic, "orders");
    }

    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_message_statuses() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(test_config(dir.path())).await;

    let missing = store.get_message("nope", 0, 0, 10);
    assert_eq!(missing.status, GetMessageStatus::NoMessageInQueue);
    assert_eq!(missing.next_begin_offset, 0);

    store
        .put_message(Message::new("orders", 0, "x"))
        .await
        .unwrap();
    wait_for("dispatch", || store.get_max_offset_in_queue("orders", 0) == 1).await;

    let overflow = store.get_message("orders", 0, 50, 10);
    assert_eq!(overflow.status, GetMessageStatus::OffsetOverflow);
    assert_eq!(overflow.next_begin_offset, 1);

    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_flush_acks() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.flush_disk_type = FlushDiskType::SyncFlush;
    let store = open_store(config).await;

    let result = store
        .put_message(Message::new("orders", 0, "durable"))
        .await
        .unwrap();
    assert_eq!(result.status, mqstore::AppendStatus::Ok);

    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_recovers_identical_state() {
    let dir = tempfile::tempdir().unwrap();

    let store = open_store(test_config(dir.path())).await;
    let mut ids = Vec::new();
    for i in 0..10 {
        let result = store
            .put_message(Message::new("orders", 1, format!("m{i}")))
            .await
            .unwrap();
        ids.push(result.msg_id);
    }
    wait_for("dispatch", || store.get_max_offset_in_queue("orders", 1) == 10).await;
    store.shutdown().await;

    let store = open_store(test_config(dir.path())).await;
    assert_eq!(store.get_max_offset_in_queue("orders", 1), 10);

    let batch = store.get_message("orders", 1, 0, 32);
    assert_eq!(batch.status, GetMessageStatus::Found);
    assert_eq!(batch.messages.len(), 10);
    assert_eq!(batch.messages[7].body.as_ref(), b"m7");

    // Message ids from before the restart still resolve.
    let found = store.lookup_message_by_id(&ids[3]).unwrap();
    assert_eq!(found.body.as_ref(), b"m3");

    // New appends continue the logical sequence.
    let result = store
        .put_message(Message::new("orders", 1, "again"))
        .await
        .unwrap();
    assert_eq!(result.queue_offset, 10);
    wait_for("dispatch", || {
        store.get_max_offset_in_queue("orders", 1) == 11
    })
    .await;
    store.shutdown().await;

    // A second restart lands on the same recovered state.
    let store = open_store(test_config(dir.path())).await;
    assert_eq!(store.get_max_offset_in_queue("orders", 1), 11);
    let tail = store.get_message("orders", 1, 10, 1);
    assert_eq!(tail.messages[0].body.as_ref(), b"again");
    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_torn_tail_record_is_discarded_on_recovery() {
    let dir = tempfile::tempdir().unwrap();

    let last_offset;
    {
        let store = open_store(test_config(dir.path())).await;
        for i in 0..3 {
            store
                .put_message(Message::new("orders", 0, format!("m{i}")))
                .await
                .unwrap();
        }
        let result = store
            .put_message(Message::new("orders", 0, "torn"))
            .await
            .unwrap();
        last_offset = result.physical_offset;
        wait_for("dispatch", || store.get_max_offset_in_queue("orders", 0) == 4).await;
        store.shutdown().await;
    }

    // Smash the magic code of the last record, as a torn write would.
    let segment = dir.path().join("commitlog").join(format!("{:020}", 0));
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(&segment)
        .unwrap();
    file.seek(SeekFrom::Start(last_offset as u64 + 4)).unwrap();
    file.write_all(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
    file.sync_all().unwrap();
    drop(file);

    let store = open_store(test_config(dir.path())).await;
    // Exactly the damaged record is gone.
    assert_eq!(store.get_max_offset_in_queue("orders", 0), 3);
    assert_eq!(store.max_phy_offset(), last_offset as u64);
    let batch = store.get_message("orders", 0, 0, 32);
    assert_eq!(batch.messages.len(), 3);
    assert_eq!(batch.messages[2].body.as_ref(), b"m2");

    // The frontier is writable again.
    let result = store
        .put_message(Message::new("orders", 0, "replacement"))
        .await
        .unwrap();
    assert_eq!(result.physical_offset, last_offset);
    assert_eq!(result.queue_offset, 3);
    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_query_message_by_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(test_config(dir.path())).await;

    for i in 0..5 {
        store
            .put_message(
                Message::new("orders", 0, format!("m{i}"))
                    .with_property(PROPERTY_KEYS, format!("order-{i}")),
            )
            .await
            .unwrap();
    }
    store
        .put_message(
            Message::new("orders", 0, "dup").with_property(PROPERTY_KEYS, "order-2"),
        )
        .await
        .unwrap();
    wait_for("dispatch", || store.get_max_offset_in_queue("orders", 0) == 6).await;

    let result = store.query_message("orders", "order-2", 16, 0, i64::MAX);
    assert_eq!(result.messages.len(), 2);
    // Newest first.
    assert_eq!(result.messages[0].body.as_ref(), b"dup");
    assert_eq!(result.messages[1].body.as_ref(), b"m2");

    assert!(store
        .query_message("orders", "order-99", 16, 0, i64::MAX)
        .messages
        .is_empty());

    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delayed_message_redelivered_after_due() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(test_config(dir.path())).await;

    store
        .put_message(Message::new("orders", 2, "later").with_delay_level(1))
        .await
        .unwrap();

    // Routed into the delay queue, not the destination.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.get_max_offset_in_queue("orders", 2), 0);

    wait_for("delayed redelivery", || {
        store.get_max_offset_in_queue("orders", 2) == 1
    })
    .await;

    let batch = store.get_message("orders", 2, 0, 1);
    assert_eq!(batch.status, GetMessageStatus::Found);
    assert_eq!(batch.messages[0].body.as_ref(), b"later");
    assert_eq!(batch.messages[0].topic, "orders");
    assert_eq!(batch.messages[0].queue_id, 2);

    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_degraded_store_suppresses_redelivery() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(test_config(dir.path())).await;

    store
        .put_message(Message::new("orders", 2, "held").with_delay_level(1))
        .await
        .unwrap();
    store.running_flags().mark_not_writeable();

    // Past the 1s due time with margin; a degraded store must not append
    // the redelivered copy.
    tokio::time::sleep(Duration::from_millis(1800)).await;
    assert_eq!(store.get_max_offset_in_queue("orders", 2), 0);

    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejects_oversized_and_degraded_writes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.max_message_size = 128;
    let store = open_store(config).await;

    let result = store
        .put_message(Message::new("orders", 0, vec![0u8; 1024]))
        .await
        .unwrap();
    assert_eq!(result.status, mqstore::AppendStatus::MessageIllegal);

    store.running_flags().mark_not_writeable();
    let err = store
        .put_message(Message::new("orders", 0, "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::StoreUnavailable(_)));

    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_offset_by_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(test_config(dir.path())).await;

    store
        .put_message(Message::new("orders", 0, "early"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mid = chrono::Utc::now().timestamp_millis();
    tokio::time::sleep(Duration::from_millis(50)).await;
    store
        .put_message(Message::new("orders", 0, "late"))
        .await
        .unwrap();
    wait_for("dispatch", || store.get_max_offset_in_queue("orders", 0) == 2).await;

    assert_eq!(store.offset_in_queue_by_timestamp("orders", 0, 0), 0);
    assert_eq!(store.offset_in_queue_by_timestamp("orders", 0, mid), 1);

    store.shutdown().await;
}
