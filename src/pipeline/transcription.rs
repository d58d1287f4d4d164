use super::extraction::ExtractionQueue;
use super::messages::{ChunkJob, DirectJob};
use crate::session::{SessionStatus, SessionTracker, TranscriptResult};
use crate::store::fields;
use crate::stream::StreamMessage;
use crate::worker::{HandlerOutcome, MessageHandler};
use anyhow::Result;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Warning recorded when a transcript comes back empty
pub const NO_SPEECH_WARNING: &str = "No speech detected";

/// Output of the transcription service
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,

    /// Confidence score (0.0 to 1.0)
    pub confidence: f64,

    /// Audio duration in seconds
    pub duration: f64,
}

impl Transcript {
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Speech-to-text capability, callable per chunk or per whole file
#[async_trait::async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio_path: &Path) -> Result<Transcript>;
}

/// Handles whole-file jobs from the audio input topic
pub struct DirectTranscriptionHandler {
    tracker: SessionTracker,
    transcriber: Arc<dyn Transcriber>,
    extraction: Option<ExtractionQueue>,
}

impl DirectTranscriptionHandler {
    pub fn new(tracker: SessionTracker, transcriber: Arc<dyn Transcriber>, extraction: Option<ExtractionQueue>) -> Self {
        Self {
            tracker,
            transcriber,
            extraction,
        }
    }

    async fn process(&self, job: &DirectJob) -> Result<HandlerOutcome> {
        let Some(session) = self.tracker.get(&job.session_id).await? else {
            return Ok(HandlerOutcome::rejected(format!("session {} not found", job.session_id)));
        };

        // Redelivery of a job that already finished
        if session.status.is_terminal() {
            info!("Session {} already {}, skipping", session.id, session.status);
            return Ok(HandlerOutcome::Completed);
        }

        if session.status != SessionStatus::Processing {
            let started = fields([("processing_started_at", Utc::now().to_rfc3339())]);
            self.tracker
                .try_transition(&session.id, SessionStatus::Processing, started)
                .await?;
        }

        if !Path::new(&job.audio_path).exists() {
            let reason = format!("Audio file not found: {}", job.audio_path);
            self.tracker.fail(&session.id, &reason).await?;
            return Ok(HandlerOutcome::rejected(reason));
        }

        info!("Transcribing session {} from {}", session.id, job.audio_path);
        let transcript = match self.transcriber.transcribe(Path::new(&job.audio_path)).await {
            Ok(transcript) => transcript,
            Err(e) => return Ok(HandlerOutcome::retry(format!("transcription failed: {:#}", e))),
        };

        let result = TranscriptResult {
            word_count: transcript.word_count(),
            text: transcript.text,
            confidence: transcript.confidence,
            duration: transcript.duration,
        };
        let warning = result.text.trim().is_empty().then_some(NO_SPEECH_WARNING);

        if self.tracker.complete(&session.id, &result, warning).await? {
            if let Some(extraction) = &self.extraction {
                extraction.enqueue(&self.tracker, &session.id, &result.text).await;
            }
        }

        Ok(HandlerOutcome::Completed)
    }
}

#[async_trait::async_trait]
impl MessageHandler for DirectTranscriptionHandler {
    async fn handle(&self, message: &StreamMessage) -> HandlerOutcome {
        let job = match DirectJob::from_payload(&message.payload) {
            Ok(job) => job,
            Err(e) => {
                let reason = format!("Malformed job: {:#}", e);
                if let Some(session_id) = message.field("session_id").filter(|id| !id.is_empty()) {
                    if let Err(e) = self.tracker.fail(session_id, &reason).await {
                        return HandlerOutcome::retry(format!("{:#}", e));
                    }
                }
                return HandlerOutcome::rejected(reason);
            }
        };

        match self.process(&job).await {
            Ok(outcome) => outcome,
            Err(e) => HandlerOutcome::retry(format!("{:#}", e)),
        }
    }

    async fn on_dead_letter(&self, message: &StreamMessage, reason: &str) -> Result<()> {
        if let Some(session_id) = message.field("session_id") {
            self.tracker
                .fail(session_id, &format!("max retries exceeded: {}", reason))
                .await?;
        }
        Ok(())
    }
}

/// Handles per-chunk jobs. Only the chunk record is written here; the
/// completion reconciler derives the session outcome from the chunks.
pub struct ChunkTranscriptionHandler {
    tracker: SessionTracker,
    transcriber: Arc<dyn Transcriber>,
}

impl ChunkTranscriptionHandler {
    pub fn new(tracker: SessionTracker, transcriber: Arc<dyn Transcriber>) -> Self {
        Self { tracker, transcriber }
    }

    async fn process(&self, job: &ChunkJob) -> Result<HandlerOutcome> {
        let Some(chunk) = self.tracker.get_chunk(&job.chunk_id).await? else {
            return Ok(HandlerOutcome::rejected(format!("chunk {} not found", job.chunk_id)));
        };

        if chunk.status.is_terminal() {
            info!("Chunk {} already {}, skipping", chunk.chunk_id, chunk.status);
            return Ok(HandlerOutcome::Completed);
        }

        match self.tracker.get(&job.session_id).await? {
            Some(session) if !session.status.is_terminal() => {}
            Some(session) => {
                warn!(
                    "Session {} is {}, dropping chunk {}",
                    session.id, session.status, job.chunk_id
                );
                return Ok(HandlerOutcome::Completed);
            }
            None => {
                return Ok(HandlerOutcome::rejected(format!("session {} not found", job.session_id)));
            }
        }

        self.tracker.start_chunk(&job.chunk_id).await?;

        if !Path::new(&job.chunk_path).exists() {
            let reason = format!("Chunk file not found: {}", job.chunk_path);
            self.tracker.fail_chunk(&job.chunk_id, &reason).await?;
            return Ok(HandlerOutcome::rejected(reason));
        }

        info!(
            "Transcribing chunk {} ({}/{}, {:.1}s-{:.1}s)",
            job.chunk_id,
            job.chunk_index + 1,
            job.total_chunks,
            job.start_time,
            job.end_time
        );
        let transcript = match self.transcriber.transcribe(Path::new(&job.chunk_path)).await {
            Ok(transcript) => transcript,
            Err(e) => return Ok(HandlerOutcome::retry(format!("transcription failed: {:#}", e))),
        };

        self.tracker
            .complete_chunk(&job.chunk_id, &transcript.text, transcript.confidence)
            .await?;
        info!(
            "Chunk {} transcribed ({} words)",
            job.chunk_id,
            transcript.word_count()
        );

        Ok(HandlerOutcome::Completed)
    }
}

#[async_trait::async_trait]
impl MessageHandler for ChunkTranscriptionHandler {
    async fn handle(&self, message: &StreamMessage) -> HandlerOutcome {
        let job = match ChunkJob::from_payload(&message.payload) {
            Ok(job) => job,
            Err(e) => {
                let reason = format!("Malformed job: {:#}", e);
                // Without a usable chunk id the session itself has to go, or
                // the reconciler would wait on it forever
                let chunk_id = message.field("chunk_id").filter(|id| !id.is_empty());
                let session_id = message.field("session_id").filter(|id| !id.is_empty());
                let failed = match (chunk_id, session_id) {
                    (Some(chunk_id), _) => self.tracker.fail_chunk(chunk_id, &reason).await.map(|_| ()),
                    (None, Some(session_id)) => self.tracker.fail(session_id, &reason).await.map(|_| ()),
                    (None, None) => Ok(()),
                };
                if let Err(e) = failed {
                    return HandlerOutcome::retry(format!("{:#}", e));
                }
                return HandlerOutcome::rejected(reason);
            }
        };

        match self.process(&job).await {
            Ok(outcome) => outcome,
            Err(e) => HandlerOutcome::retry(format!("{:#}", e)),
        }
    }

    async fn on_dead_letter(&self, message: &StreamMessage, reason: &str) -> Result<()> {
        if let Some(chunk_id) = message.field("chunk_id") {
            self.tracker
                .fail_chunk(chunk_id, &format!("max retries exceeded: {}", reason))
                .await?;
        }
        Ok(())
    }
}
