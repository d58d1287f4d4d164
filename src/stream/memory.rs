use super::{DurableStream, Payload, PendingEntry, StreamMessage};
use anyhow::Result;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// In-process durable stream
///
/// Keeps every topic in memory for the lifetime of the value. Delivery,
/// pending-list and claim semantics match the Redis backend so the worker
/// runtime behaves identically on both.
#[derive(Default)]
pub struct MemoryStream {
    topics: Mutex<HashMap<String, TopicLog>>,
    appended: Notify,
}

#[derive(Default)]
struct TopicLog {
    entries: BTreeMap<u64, Entry>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

struct Entry {
    id: String,
    payload: Payload,
}

#[derive(Default)]
struct GroupState {
    /// Highest sequence number handed out to this group
    cursor: u64,
    pending: BTreeMap<u64, Pending>,
}

struct Pending {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, TopicLog>> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_new(&self, topic: &str, group: &str, consumer: &str, max_count: usize) -> Vec<StreamMessage> {
        let mut topics = self.topics();
        let log = topics.entry(topic.to_string()).or_default();
        let TopicLog { entries, groups, .. } = log;
        let state = groups.entry(group.to_string()).or_default();

        let now = Instant::now();
        let mut delivered = Vec::new();

        for (&seq, entry) in entries.range(state.cursor + 1..).take(max_count.max(1)) {
            state.pending.insert(
                seq,
                Pending {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            state.cursor = seq;
            delivered.push(StreamMessage::new(entry.id.clone(), topic, entry.payload.clone(), 1));
        }

        delivered
    }
}

/// Sequence number encoded after the dash of a `<millis>-<seq>` id
fn seq_of(id: &str) -> Option<u64> {
    id.rsplit('-').next()?.parse().ok()
}

#[async_trait::async_trait]
impl DurableStream for MemoryStream {
    async fn append(&self, topic: &str, payload: &Payload) -> Result<String> {
        let id = {
            let mut topics = self.topics();
            let log = topics.entry(topic.to_string()).or_default();
            log.next_seq += 1;
            let seq = log.next_seq;
            let id = format!("{}-{}", Utc::now().timestamp_millis(), seq);
            log.entries.insert(
                seq,
                Entry {
                    id: id.clone(),
                    payload: payload.clone(),
                },
            );
            id
        };

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<()> {
        let mut topics = self.topics();
        topics
            .entry(topic.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>> {
        let deadline = Instant::now() + block;

        loop {
            // Register interest before checking so an append between the
            // check and the wait is not missed.
            let appended = self.appended.notified();

            let batch = self.take_new(topic, group, consumer, max_count);
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let _ = tokio::time::timeout(deadline - now, appended).await;
        }
    }

    async fn acknowledge(&self, topic: &str, group: &str, id: &str) -> Result<()> {
        let Some(seq) = seq_of(id) else {
            return Ok(());
        };

        let mut topics = self.topics();
        if let Some(state) = topics.get_mut(topic).and_then(|log| log.groups.get_mut(group)) {
            state.pending.remove(&seq);
        }
        Ok(())
    }

    async fn pending(&self, topic: &str, group: &str) -> Result<Vec<PendingEntry>> {
        let topics = self.topics();
        let Some(log) = topics.get(topic) else {
            return Ok(Vec::new());
        };
        let Some(state) = log.groups.get(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        Ok(state
            .pending
            .iter()
            .filter_map(|(seq, pending)| {
                let entry = log.entries.get(seq)?;
                Some(PendingEntry {
                    id: entry.id.clone(),
                    consumer: pending.consumer.clone(),
                    idle: now.saturating_duration_since(pending.delivered_at),
                    delivery_count: pending.delivery_count,
                })
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
        let Some(seq) = seq_of(id) else {
            return Ok(None);
        };

        let mut topics = self.topics();
        let Some(log) = topics.get_mut(topic) else {
            return Ok(None);
        };
        let TopicLog { entries, groups, .. } = log;
        let Some(state) = groups.get_mut(group) else {
            return Ok(None);
        };
        let (Some(pending), Some(entry)) = (state.pending.get_mut(&seq), entries.get(&seq)) else {
            return Ok(None);
        };

        let now = Instant::now();
        if now.saturating_duration_since(pending.delivered_at) < min_idle {
            return Ok(None);
        }

        pending.consumer = consumer.to_string();
        pending.delivered_at = now;
        pending.delivery_count += 1;

        Ok(Some(StreamMessage::new(
            entry.id.clone(),
            topic,
            entry.payload.clone(),
            pending.delivery_count,
        )))
    }

    async fn len(&self, topic: &str) -> Result<usize> {
        Ok(self.topics().get(topic).map(|log| log.entries.len()).unwrap_or(0))
    }

    async fn range(&self, topic: &str, count: usize) -> Result<Vec<StreamMessage>> {
        let topics = self.topics();
        let Some(log) = topics.get(topic) else {
            return Ok(Vec::new());
        };

        Ok(log
            .entries
            .values()
            .rev()
            .take(count)
            .map(|entry| StreamMessage::new(entry.id.clone(), topic, entry.payload.clone(), 0))
            .collect())
    }
}
