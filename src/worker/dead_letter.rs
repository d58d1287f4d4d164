use crate::stream::{DurableStream, Payload, StreamMessage};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Dead-letter topic of `topic`
pub fn dead_letter_topic(topic: &str, suffix: &str) -> String {
    format!("{}{}", topic, suffix)
}

/// Original payload plus the failure envelope
pub fn dead_letter_payload(message: &StreamMessage, error: &str, failed_at: DateTime<Utc>) -> Payload {
    let mut payload = message.payload.clone();
    payload.insert("original_message_id".into(), message.id.clone());
    payload.insert("original_topic".into(), message.topic.clone());
    payload.insert("error".into(), error.to_string());
    payload.insert("failed_at".into(), failed_at.to_rfc3339());
    payload.insert("retry_count".into(), message.retry_count.to_string());
    payload
}

/// A dead-lettered message, as listed for inspection
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    /// Id in the dead-letter topic
    pub id: String,
    pub original_message_id: String,
    pub original_topic: String,
    pub error: String,
    pub failed_at: String,
    pub retry_count: u32,

    /// Payload of the original message
    pub payload: Payload,
}

impl From<StreamMessage> for DeadLetter {
    fn from(message: StreamMessage) -> Self {
        let mut payload = message.payload;
        let mut take = |name: &str| payload.remove(name).unwrap_or_default();

        let original_message_id = take("original_message_id");
        let original_topic = take("original_topic");
        let error = take("error");
        let failed_at = take("failed_at");
        let retry_count = take("retry_count").parse().unwrap_or(0);

        Self {
            id: message.id,
            original_message_id,
            original_topic,
            error,
            failed_at,
            retry_count,
            payload,
        }
    }
}

/// Newest `count` dead letters of `topic`. Nothing here requeues them.
pub async fn list_dead_letters(
    stream: &dyn DurableStream,
    topic: &str,
    suffix: &str,
    count: usize,
) -> Result<Vec<DeadLetter>> {
    let messages = stream.range(&dead_letter_topic(topic, suffix), count).await?;
    Ok(messages.into_iter().map(DeadLetter::from).collect())
}
