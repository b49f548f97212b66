//! Durable message store for a topic/queue pub-sub broker.
//!
//! All messages land in a single append-only commit log; per-(topic, queue)
//! consume queues and a key/time index are derived views maintained by an
//! asynchronous dispatch pipeline. The store survives crashes by scanning
//! the commit-log tail on startup and replaying dispatch from a checkpoint.
//!
//! ```no_run
//! use mqstore::{Message, MessageStore, MessageStoreConfig};
//!
//! # async fn demo() -> mqstore::Result<()> {
//! let store = MessageStore::new(MessageStoreConfig::new("/var/lib/mqstore"))?;
//! store.load().await?;
//! store.start()?;
//!
//! store.put_message(Message::new("orders", 0, "payload")).await?;
//! let batch = store.get_message("orders", 0, 0, 32);
//!
//! store.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod allocate;
pub mod checkpoint;
pub mod commitlog;
pub mod config;
pub mod consume_queue;
pub mod dispatch;
pub mod error;
pub mod index;
pub mod mapped_file;
pub mod mapped_queue;
pub mod message;
pub mod running_flags;
pub mod schedule;
pub mod store;

pub use commitlog::{AppendResult, AppendStatus};
pub use config::{FlushDiskType, MessageStoreConfig};
pub use error::{Result, StoreError};
pub use message::{Message, MessageExt};
pub use store::{GetMessageResult, GetMessageStatus, MessageStore, QueryMessageResult};
