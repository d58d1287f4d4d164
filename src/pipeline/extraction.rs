use super::messages::ExtractionJob;
use crate::session::SessionTracker;
use crate::store::fields;
use crate::stream::{DurableStream, StreamMessage};
use crate::worker::{HandlerOutcome, MessageHandler};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info};

/// Text-to-structured-data capability
#[async_trait::async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, session_id: &str, text: &str) -> Result<serde_json::Value>;
}

/// Producer side of the extraction topic
#[derive(Clone)]
pub struct ExtractionQueue {
    stream: Arc<dyn DurableStream>,
    topic: String,
}

impl ExtractionQueue {
    pub fn new(stream: Arc<dyn DurableStream>, topic: &str) -> Self {
        Self {
            stream,
            topic: topic.to_string(),
        }
    }

    /// Enqueue extraction of a final transcript. The transcript is already
    /// committed, so a failure here is recorded on the session rather than
    /// failing the caller.
    pub async fn enqueue(&self, tracker: &SessionTracker, session_id: &str, text: &str) {
        let job = ExtractionJob {
            session_id: session_id.to_string(),
            transcript_text: text.to_string(),
        };

        let status = match self.stream.append(&self.topic, &job.to_payload()).await {
            Ok(id) => {
                info!("Queued extraction for session {} as {}", session_id, id);
                fields([("extraction_status", "queued".to_string())])
            }
            Err(e) => {
                error!("Failed to queue extraction for session {}: {:#}", session_id, e);
                fields([
                    ("extraction_status", "error".to_string()),
                    ("extraction_error", format!("failed to enqueue: {:#}", e)),
                ])
            }
        };

        if let Err(e) = tracker.update(session_id, &status).await {
            error!("Failed to record extraction status of {}: {:#}", session_id, e);
        }
    }
}

/// Handles jobs on the extraction topic. Writes only the `extraction_*`
/// fields; the transcription status is never touched.
pub struct ExtractionHandler {
    tracker: SessionTracker,
    extractor: Arc<dyn Extractor>,
}

impl ExtractionHandler {
    pub fn new(tracker: SessionTracker, extractor: Arc<dyn Extractor>) -> Self {
        Self { tracker, extractor }
    }

    async fn process(&self, job: &ExtractionJob) -> Result<HandlerOutcome> {
        let Some(session) = self.tracker.get(&job.session_id).await? else {
            return Ok(HandlerOutcome::rejected(format!("session {} not found", job.session_id)));
        };

        if session.extraction_status.as_deref() == Some("completed") {
            return Ok(HandlerOutcome::Completed);
        }

        if job.transcript_text.trim().is_empty() {
            self.tracker
                .update(&session.id, &fields([("extraction_status", "skipped")]))
                .await?;
            info!("Skipped extraction for session {}: empty transcript", session.id);
            return Ok(HandlerOutcome::Completed);
        }

        self.tracker
            .update(&session.id, &fields([("extraction_status", "processing")]))
            .await?;

        let data = match self.extractor.extract(&session.id, &job.transcript_text).await {
            Ok(data) => data,
            Err(e) => return Ok(HandlerOutcome::retry(format!("extraction failed: {:#}", e))),
        };

        self.tracker
            .update(
                &session.id,
                &fields([
                    ("extraction_status", "completed".to_string()),
                    ("extraction_result", data.to_string()),
                    ("extraction_completed_at", Utc::now().to_rfc3339()),
                ]),
            )
            .await?;
        info!("Extraction completed for session {}", session.id);

        Ok(HandlerOutcome::Completed)
    }
}

#[async_trait::async_trait]
impl MessageHandler for ExtractionHandler {
    async fn handle(&self, message: &StreamMessage) -> HandlerOutcome {
        let job = match ExtractionJob::from_payload(&message.payload) {
            Ok(job) => job,
            Err(e) => return HandlerOutcome::rejected(format!("{:#}", e)),
        };

        match self.process(&job).await {
            Ok(outcome) => outcome,
            Err(e) => HandlerOutcome::retry(format!("{:#}", e)),
        }
    }

    async fn on_dead_letter(&self, message: &StreamMessage, reason: &str) -> Result<()> {
        if let Some(session_id) = message.field("session_id") {
            self.tracker
                .update(
                    session_id,
                    &fields([
                        ("extraction_status", "error".to_string()),
                        ("extraction_error", format!("max retries exceeded: {}", reason)),
                    ]),
                )
                .await?;
        }
        Ok(())
    }
}
