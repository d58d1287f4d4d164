use super::{DurableStream, Payload, PendingEntry, StreamMessage};
use anyhow::{anyhow, Context, Result};
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, RedisResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound on entries fetched by one XPENDING call
const PENDING_SCAN_LIMIT: usize = 1000;

/// Open the process-wide Redis connection shared by the stream and the store
pub async fn connect_redis(url: &str) -> Result<ConnectionManager> {
    info!("Connecting to Redis at {}", url);

    let client = redis::Client::open(url).context("Invalid Redis URL")?;
    let manager = ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;

    info!("Connected to Redis successfully");
    Ok(manager)
}

/// Durable stream backed by Redis streams
#[derive(Clone)]
pub struct RedisStream {
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl RedisStream {
    pub fn new(conn: ConnectionManager, op_timeout: Duration) -> Self {
        Self { conn, op_timeout }
    }

    /// Run one Redis call, failing with a retryable error if it outlives `limit`
    async fn bounded<T>(
        &self,
        what: &str,
        limit: Duration,
        call: impl Future<Output = RedisResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result.with_context(|| format!("Redis {} failed", what)),
            Err(_) => Err(anyhow!("Redis {} timed out after {:?}", what, limit)),
        }
    }
}

fn payload_of(entry: &StreamId) -> Payload {
    entry
        .map
        .iter()
        .filter_map(|(key, value)| {
            redis::from_redis_value::<String>(value)
                .ok()
                .map(|value| (key.clone(), value))
        })
        .collect()
}

#[async_trait::async_trait]
impl DurableStream for RedisStream {
    async fn append(&self, topic: &str, payload: &Payload) -> Result<String> {
        let mut conn = self.conn.clone();
        let items: Vec<(&str, &str)> = payload.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        let id: String = self
            .bounded("XADD", self.op_timeout, conn.xadd(topic, "*", &items))
            .await?;

        debug!("Appended {} to {}", id, topic);
        Ok(id)
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: RedisResult<()> = conn.xgroup_create_mkstream(topic, group, "0").await;

        match created {
            Ok(()) => {
                info!("Created consumer group {} for stream {}", group, topic);
                Ok(())
            }
            // Group already exists
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e).context("Failed to create consumer group"),
        }
    }

    async fn read(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>> {
        let mut conn = self.conn.clone();

        let mut opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(max_count.max(1));
        if !block.is_zero() {
            opts = opts.block(block.as_millis() as usize);
        }

        let keys = [topic];
        let ids = [">"];
        let call = conn.xread_options::<_, _, Option<StreamReadReply>>(&keys, &ids, &opts);
        let reply = match self.bounded("XREADGROUP", block + self.op_timeout, call).await {
            Ok(reply) => reply,
            Err(e) if format!("{:#}", e).contains("NOGROUP") => {
                self.ensure_group(topic, group).await?;
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        Ok(reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|entry| {
                let payload = payload_of(&entry);
                StreamMessage::new(entry.id, topic, payload, 1)
            })
            .collect())
    }

    async fn acknowledge(&self, topic: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .bounded("XACK", self.op_timeout, conn.xack(topic, group, &[id]))
            .await?;
        Ok(())
    }

    async fn pending(&self, topic: &str, group: &str) -> Result<Vec<PendingEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply = self
            .bounded(
                "XPENDING",
                self.op_timeout,
                conn.xpending_count(topic, group, "-", "+", PENDING_SCAN_LIMIT),
            )
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|entry| PendingEntry {
                id: entry.id,
                consumer: entry.consumer,
                idle: Duration::from_millis(entry.last_delivered_ms as u64),
                delivery_count: entry.times_delivered as u64,
            })
            .collect())
    }

    async fn claim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        id: &str,
        min_idle: Duration,
    ) -> Result<Option<StreamMessage>> {
        let mut conn = self.conn.clone();

        // XCLAIM re-checks idle time server side, so of two racing claimers
        // only the first gets the entry back.
        let claimed: StreamClaimReply = self
            .bounded(
                "XCLAIM",
                self.op_timeout,
                conn.xclaim(topic, group, consumer, min_idle.as_millis() as u64, &[id]),
            )
            .await?;

        let Some(entry) = claimed.ids.into_iter().find(|entry| entry.id == id) else {
            return Ok(None);
        };

        let pending: StreamPendingCountReply = self
            .bounded(
                "XPENDING",
                self.op_timeout,
                conn.xpending_count(topic, group, id, id, 1),
            )
            .await?;
        let delivery_count = pending
            .ids
            .first()
            .map(|p| p.times_delivered as u64)
            .unwrap_or(1);

        let payload = payload_of(&entry);
        Ok(Some(StreamMessage::new(entry.id, topic, payload, delivery_count)))
    }

    async fn len(&self, topic: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        self.bounded("XLEN", self.op_timeout, conn.xlen(topic)).await
    }

    async fn range(&self, topic: &str, count: usize) -> Result<Vec<StreamMessage>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = self
            .bounded(
                "XREVRANGE",
                self.op_timeout,
                conn.xrevrange_count(topic, "+", "-", count),
            )
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|entry| {
                let payload = payload_of(&entry);
                StreamMessage::new(entry.id, topic, payload, 0)
            })
            .collect())
    }
}
