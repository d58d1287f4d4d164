use super::extraction::ExtractionQueue;
use super::transcription::NO_SPEECH_WARNING;
use crate::audio::{merge_transcripts, ChunkTranscript};
use crate::session::{
    chunk_id, ChunkProgress, ChunkRecord, ChunkStatus, ProcessingStrategy, Session, SessionStatus, SessionTracker,
    TranscriptResult,
};
use crate::store::fields;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Reconciler settings
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between passes (default: 10 seconds)
    pub interval: Duration,

    /// Chunk records read from the store per pass, across all sessions
    pub max_chunks_per_tick: usize,

    /// Words compared at chunk boundaries when merging
    pub overlap_lookback_words: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_chunks_per_tick: 500,
            overlap_lookback_words: 5,
        }
    }
}

/// What one pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Chunked sessions in `processing`
    pub sessions: usize,

    /// Chunk records read from the store
    pub chunks_read: usize,

    pub completed: usize,
    pub failed: usize,

    /// Sessions skipped because the per-tick budget ran out
    pub deferred: usize,
}

/// Background loop that finalises chunked sessions once every chunk is
/// terminal
///
/// Progress is re-derived from the chunk records on every pass. Terminal
/// chunk records never change again, so they are cached and only chunks
/// still in flight cost a store read, bounded by `max_chunks_per_tick`.
/// When the budget runs out, the next pass starts at the first session
/// that was deferred instead of the oldest one.
/// Finalisation is a compare-and-set on the session status, so repeated
/// passes (or several reconcilers) finalise a session exactly once.
pub struct CompletionReconciler {
    tracker: SessionTracker,
    extraction: Option<ExtractionQueue>,
    config: ReconcilerConfig,
    terminal_chunks: HashMap<String, ChunkRecord>,
    resume_from: Option<String>,
}

impl CompletionReconciler {
    pub fn new(tracker: SessionTracker, extraction: Option<ExtractionQueue>, config: ReconcilerConfig) -> Self {
        Self {
            tracker,
            extraction,
            config,
            terminal_chunks: HashMap::new(),
            resume_from: None,
        }
    }

    /// Run passes on a fixed interval until `shutdown` flips to `true`.
    /// A failed pass is logged and retried on the next tick.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Completion reconciler started (every {:?})", self.config.interval);

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) if report.completed + report.failed > 0 => {
                            info!(
                                "Reconciler pass: {} completed, {} failed, {} in progress",
                                report.completed,
                                report.failed,
                                report.sessions - report.completed - report.failed
                            );
                        }
                        Ok(report) => debug!("Reconciler pass: {:?}", report),
                        Err(e) => warn!("Reconciler pass failed: {:#}", e),
                    }
                }
            }
        }

        info!("Completion reconciler stopped");
    }

    /// One pass over every chunked session in `processing`
    pub async fn tick(&mut self) -> Result<TickReport> {
        let mut sessions: Vec<Session> = self
            .tracker
            .list()
            .await?
            .into_iter()
            .filter(|s| s.processing_strategy == ProcessingStrategy::Chunked && s.status == SessionStatus::Processing)
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        if let Some(id) = self.resume_from.take() {
            if let Some(position) = sessions.iter().position(|s| s.id == id) {
                sessions.rotate_left(position);
            }
        }

        // Drop cached chunks of sessions no longer being reconciled
        let live: HashSet<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
        self.terminal_chunks
            .retain(|_, chunk| live.contains(chunk.session_id.as_str()));

        let mut report = TickReport {
            sessions: sessions.len(),
            ..Default::default()
        };
        let mut budget = self.config.max_chunks_per_tick;

        for (position, session) in sessions.iter().enumerate() {
            let Some(chunks) = self.load_chunks(session, &mut budget, &mut report).await? else {
                report.deferred += 1;
                if self.resume_from.is_none() {
                    // A session too big for a whole budget must not hold
                    // the front of every pass
                    let next = if position == 0 { sessions.get(1) } else { Some(session) };
                    self.resume_from = next.map(|s| s.id.clone());
                }
                continue;
            };

            let progress = ChunkProgress::tally(session.total_chunks, chunks.iter().map(|c| c.as_ref().map(|c| c.status)));
            if progress.completed != session.completed_chunks || progress.failed != session.failed_chunks {
                self.tracker
                    .update(
                        &session.id,
                        &fields([
                            ("completed_chunks", progress.completed.to_string()),
                            ("failed_chunks", progress.failed.to_string()),
                        ]),
                    )
                    .await?;
            }

            if !progress.is_done() {
                debug!(
                    "Session {}: {}/{} chunks done",
                    session.id,
                    progress.completed + progress.failed,
                    progress.total
                );
                continue;
            }

            match self.finalize(session, &chunks, &progress).await? {
                Some(SessionStatus::Completed) => report.completed += 1,
                Some(_) => report.failed += 1,
                None => {}
            }
        }

        Ok(report)
    }

    /// Chunk records in index order, `None` if the budget ran out first
    async fn load_chunks(
        &mut self,
        session: &Session,
        budget: &mut usize,
        report: &mut TickReport,
    ) -> Result<Option<Vec<Option<ChunkRecord>>>> {
        let mut chunks = Vec::with_capacity(session.total_chunks as usize);

        for index in 0..session.total_chunks {
            let id = chunk_id(&session.id, index);
            if let Some(chunk) = self.terminal_chunks.get(&id) {
                chunks.push(Some(chunk.clone()));
                continue;
            }

            if *budget == 0 {
                return Ok(None);
            }
            *budget -= 1;
            report.chunks_read += 1;

            let chunk = self.tracker.get_chunk(&id).await?;
            if let Some(chunk) = &chunk {
                if chunk.status.is_terminal() {
                    self.terminal_chunks.insert(id, chunk.clone());
                }
            }
            chunks.push(chunk);
        }

        Ok(Some(chunks))
    }

    /// Merge and move the session to its final status. Returns the status
    /// reached, or `None` if another actor finalised it first.
    async fn finalize(
        &mut self,
        session: &Session,
        chunks: &[Option<ChunkRecord>],
        progress: &ChunkProgress,
    ) -> Result<Option<SessionStatus>> {
        let transcripts: Vec<ChunkTranscript> = chunks
            .iter()
            .flatten()
            .filter(|chunk| chunk.status == ChunkStatus::Completed)
            .map(|chunk| ChunkTranscript {
                chunk_index: chunk.chunk_index,
                text: chunk.transcript_text.clone().unwrap_or_default(),
                confidence: chunk.transcript_confidence.unwrap_or(0.0),
                duration: chunk.duration(),
            })
            .collect();

        let outcome = match merge_transcripts(&transcripts, self.config.overlap_lookback_words) {
            Ok(merged) => {
                let warning = if progress.failed > 0 {
                    Some(format!(
                        "{} of {} chunks failed to process",
                        progress.failed, progress.total
                    ))
                } else if merged.text.is_empty() {
                    Some(NO_SPEECH_WARNING.to_string())
                } else {
                    None
                };

                let result = TranscriptResult {
                    text: merged.text,
                    confidence: merged.confidence,
                    word_count: merged.word_count,
                    duration: merged.duration,
                };

                if !self.tracker.complete(&session.id, &result, warning.as_deref()).await? {
                    return Ok(None);
                }
                if let Some(extraction) = &self.extraction {
                    extraction.enqueue(&self.tracker, &session.id, &result.text).await;
                }
                SessionStatus::Completed
            }
            // Zero successful chunks
            Err(e) => {
                if !self.tracker.fail(&session.id, &e.to_string()).await? {
                    return Ok(None);
                }
                SessionStatus::Error
            }
        };

        match self.tracker.remove_chunks(session).await {
            Ok(removed) => debug!(
                "Released {} chunk records and {} chunk files of session {}",
                removed.records, removed.files, session.id
            ),
            Err(e) => warn!("Failed to release chunks of session {}: {:#}", session.id, e),
        }
        self.terminal_chunks
            .retain(|_, chunk| chunk.session_id != session.id);

        info!("Session {} finalised as {}", session.id, outcome);
        Ok(Some(outcome))
    }
}
