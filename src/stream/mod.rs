//! Durable, replayable message streams with consumer-group delivery
//!
//! A topic is an append-only log. Each consumer group sees every message once
//! through `read`, keeps it in its pending list until `acknowledge`, and can
//! hand an idle pending entry to another consumer with `claim`.
//!
//! Two backends implement [`DurableStream`]:
//! - [`RedisStream`]: Redis streams (XADD / XREADGROUP / XACK / XPENDING / XCLAIM)
//! - [`MemoryStream`]: in-process log with the same semantics (tests, single-process mode)

mod memory;
mod redis;

pub use self::memory::MemoryStream;
pub use self::redis::{connect_redis, RedisStream};

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

/// Key/value payload carried by a stream message. Values are plain strings;
/// structured values travel JSON-encoded.
pub type Payload = BTreeMap<String, String>;

/// A message delivered from a topic to a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    /// Stream-assigned id (`<millis>-<seq>`), monotonic per topic
    pub id: String,

    pub topic: String,

    pub payload: Payload,

    /// When the message was appended (derived from the id)
    pub enqueued_at: DateTime<Utc>,

    /// How many times this message was delivered to the group before this delivery
    pub retry_count: u32,
}

impl StreamMessage {
    pub fn new(id: String, topic: &str, payload: Payload, delivery_count: u64) -> Self {
        let enqueued_at = enqueued_at_from_id(&id);
        Self {
            id,
            topic: topic.to_string(),
            payload,
            enqueued_at,
            retry_count: delivery_count.saturating_sub(1).min(u32::MAX as u64) as u32,
        }
    }

    /// Payload field lookup
    pub fn field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).map(String::as_str)
    }
}

/// An entry in a consumer group's pending list
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub id: String,

    /// Consumer currently owning the entry
    pub consumer: String,

    /// Time since the entry was last delivered
    pub idle: Duration,

    /// Number of deliveries so far (first read counts as 1)
    pub delivery_count: u64,
}

/// Append-only topic log with consumer groups
#[async_trait::async_trait]
pub trait DurableStream: Send + Sync {
    /// Append a message, returning its id. Never waits on consumers.
    async fn append(&self, topic: &str, payload: &Payload) -> Result<String>;

    /// Create the consumer group (and topic) if absent
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<()>;

    /// Read messages never delivered to this group before, blocking up to
    /// `block` when none are available. Creates the group on first use.
    async fn read(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>>;

    /// Remove a message from the group's pending list. Acknowledging an
    /// unknown or already acknowledged id is a no-op.
    async fn acknowledge(&self, topic: &str, group: &str, id: &str) -> Result<()>;

    /// Delivered-but-unacknowledged entries of the group, oldest first
    async fn pending(&self, topic: &str, group: &str) -> Result<Vec<PendingEntry>>;

    /// Take ownership of a pending entry if it has been idle for at least
    /// `min_idle`. Returns `None` when the entry is gone or another consumer
    /// claimed it first.
    async fn claim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        id: &str,
        min_idle: Duration,
    ) -> Result<Option<StreamMessage>>;

    /// Number of messages in the topic
    async fn len(&self, topic: &str) -> Result<usize>;

    /// Newest `count` messages of the topic, newest first
    async fn range(&self, topic: &str, count: usize) -> Result<Vec<StreamMessage>>;
}

/// Milliseconds part of a `<millis>-<seq>` id as a timestamp
pub fn enqueued_at_from_id(id: &str) -> DateTime<Utc> {
    id.split('-')
        .next()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}
