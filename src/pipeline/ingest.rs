use super::messages::{ChunkJob, DirectJob};
use crate::audio::{
    plan_chunks, should_split, write_wav, AudioFile, AudioInfo, ChunkArtifact, ChunkMaterializer, ChunkingConfig,
};
use crate::session::{
    chunk_id, session_key, ChunkRecord, ChunkStatus, ProcessingStrategy, Session, SessionStatus, SessionTracker,
    TransitionError,
};
use crate::store::fields;
use crate::stream::DurableStream;
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Where ingest writes artifacts and which topics it feeds
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub chunking: ChunkingConfig,
    pub uploads_dir: PathBuf,
    pub chunks_dir: PathBuf,
    pub audio_input_topic: String,
    pub audio_chunks_topic: String,
}

/// Outcome of ingesting one artifact
#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub session_id: String,
    pub status: SessionStatus,
    pub processing_strategy: ProcessingStrategy,
    pub total_chunks: u32,

    /// Stream ids of the messages enqueued for this session
    pub message_ids: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// State of a streaming session after an increment arrived
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamProgress {
    /// Distinct increments stored so far
    pub received: u32,

    /// Sequence number of the final increment, once it has arrived
    pub final_sequence: Option<u32>,

    /// Whether this call merged the increments and queued the session
    pub finalized: bool,
}

const FINAL_SEQUENCE: &str = "final_sequence";

fn increment_field(sequence: u32) -> String {
    format!("increment_{:06}", sequence)
}

/// Turns uploaded artifacts into sessions and queued work
#[derive(Clone)]
pub struct Ingestor {
    tracker: SessionTracker,
    stream: Arc<dyn DurableStream>,
    config: IngestConfig,
}

impl Ingestor {
    pub fn new(tracker: SessionTracker, stream: Arc<dyn DurableStream>, config: IngestConfig) -> Self {
        Self {
            tracker,
            stream,
            config,
        }
    }

    /// Create a session for `path` and enqueue it, whole or in chunks.
    ///
    /// An unreadable artifact is an input error: the session is created and
    /// immediately marked `error`, nothing is enqueued.
    pub async fn ingest(&self, path: &Path, session_id: Option<String>) -> Result<IngestReceipt> {
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let artifact = path.display().to_string();

        let probe_path = path.to_path_buf();
        let info = tokio::task::spawn_blocking(move || AudioFile::probe(probe_path)).await?;

        let info = match info {
            Ok(info) => info,
            Err(e) => {
                let mut session = Session::new(&session_id, SessionStatus::Queued, ProcessingStrategy::Direct);
                session.artifact_path = Some(artifact);
                self.tracker.create(&session).await?;

                let reason = format!("Invalid audio file: {:#}", e);
                self.tracker.fail(&session_id, &reason).await?;
                return Ok(IngestReceipt {
                    session_id,
                    status: SessionStatus::Error,
                    processing_strategy: ProcessingStrategy::Direct,
                    total_chunks: 0,
                    message_ids: Vec::new(),
                    error: Some(reason),
                });
            }
        };

        if should_split(&info, &self.config.chunking) {
            self.ingest_chunked(session_id, path, &info).await
        } else {
            self.ingest_direct(session_id, path, &info, ProcessingStrategy::Direct).await
        }
    }

    async fn ingest_direct(
        &self,
        session_id: String,
        path: &Path,
        info: &AudioInfo,
        strategy: ProcessingStrategy,
    ) -> Result<IngestReceipt> {
        let mut session = Session::new(&session_id, SessionStatus::Queued, strategy);
        session.artifact_path = Some(path.display().to_string());
        session.file_size = Some(info.size_bytes);
        session.audio_duration = Some(info.duration_seconds);
        self.tracker.create(&session).await?;

        let id = match self.enqueue_direct(&session_id, path).await {
            Ok(id) => id,
            Err(e) => return Err(self.fail_stranded(&session_id, "Failed to queue session", e).await),
        };

        Ok(IngestReceipt {
            session_id,
            status: SessionStatus::Queued,
            processing_strategy: strategy,
            total_chunks: 0,
            message_ids: vec![id],
            error: None,
        })
    }

    async fn enqueue_direct(&self, session_id: &str, path: &Path) -> Result<String> {
        let job = DirectJob {
            session_id: session_id.to_string(),
            audio_path: path.display().to_string(),
        };
        let id = self
            .stream
            .append(&self.config.audio_input_topic, &job.to_payload())
            .await?;

        info!("Queued session {} for direct processing as {}", session_id, id);
        Ok(id)
    }

    /// `queued -> processing` while the chunks are cut, `chunking_completed`
    /// once every chunk record exists, then `processing` again after the
    /// chunk jobs are on the stream
    async fn ingest_chunked(&self, session_id: String, path: &Path, info: &AudioInfo) -> Result<IngestReceipt> {
        let mut session = Session::new(&session_id, SessionStatus::Queued, ProcessingStrategy::Chunked);
        session.artifact_path = Some(path.display().to_string());
        session.file_size = Some(info.size_bytes);
        session.audio_duration = Some(info.duration_seconds);
        self.tracker.create(&session).await?;

        match self.chunk_and_queue(&session_id, path, info).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => Err(self.fail_stranded(&session_id, "Failed to queue chunks", e).await),
        }
    }

    /// Everything after the session record exists. An error here leaves no
    /// job on the stream to finish the session, so the caller fails it.
    async fn chunk_and_queue(&self, session_id: &str, path: &Path, info: &AudioInfo) -> Result<IngestReceipt> {
        let session_id = session_id.to_string();
        let started = fields([("processing_started_at", Utc::now().to_rfc3339())]);
        self.tracker
            .transition(&session_id, SessionStatus::Processing, started)
            .await?;

        let artifacts = match self.materialize(&session_id, path, info).await {
            Ok(artifacts) => artifacts,
            Err(e) => {
                let reason = format!("Chunking failed: {:#}", e);
                self.tracker.fail(&session_id, &reason).await?;
                return Ok(IngestReceipt {
                    session_id,
                    status: SessionStatus::Error,
                    processing_strategy: ProcessingStrategy::Chunked,
                    total_chunks: 0,
                    message_ids: Vec::new(),
                    error: Some(reason),
                });
            }
        };
        let total_chunks = artifacts.len() as u32;

        for artifact in &artifacts {
            let spec = &artifact.spec;
            let record = ChunkRecord {
                chunk_id: chunk_id(&session_id, spec.chunk_index),
                session_id: session_id.clone(),
                chunk_index: spec.chunk_index,
                start_time: spec.start_time,
                end_time: spec.end_time,
                overlap_seconds: spec.overlap_seconds,
                status: ChunkStatus::Queued,
                path: artifact.file_path.display().to_string(),
                transcript_text: None,
                transcript_confidence: None,
                error: None,
            };
            self.tracker.create_chunk(&record).await?;
        }

        let counters = fields([
            ("total_chunks", total_chunks.to_string()),
            ("completed_chunks", "0".to_string()),
            ("failed_chunks", "0".to_string()),
        ]);
        self.tracker
            .transition(&session_id, SessionStatus::ChunkingCompleted, counters)
            .await?;

        let mut message_ids = Vec::with_capacity(artifacts.len());
        for artifact in &artifacts {
            let spec = &artifact.spec;
            let job = ChunkJob {
                session_id: session_id.clone(),
                chunk_id: chunk_id(&session_id, spec.chunk_index),
                chunk_index: spec.chunk_index,
                total_chunks,
                start_time: spec.start_time,
                end_time: spec.end_time,
                chunk_path: artifact.file_path.display().to_string(),
            };
            let id = self
                .stream
                .append(&self.config.audio_chunks_topic, &job.to_payload())
                .await?;
            self.tracker
                .update_chunk(&job.chunk_id, &fields([("stream_id", id.clone())]))
                .await?;
            message_ids.push(id);
        }

        self.tracker
            .transition(&session_id, SessionStatus::Processing, Default::default())
            .await?;

        info!(
            "Queued session {} as {} chunks ({:.1}s of audio)",
            session_id, total_chunks, info.duration_seconds
        );

        Ok(IngestReceipt {
            session_id,
            status: SessionStatus::Processing,
            processing_strategy: ProcessingStrategy::Chunked,
            total_chunks,
            message_ids,
            error: None,
        })
    }

    /// Decode, plan and write the chunk artifacts off the async runtime
    async fn materialize(&self, session_id: &str, path: &Path, info: &AudioInfo) -> Result<Vec<ChunkArtifact>> {
        let chunking = self.config.chunking.clone();
        let specs = plan_chunks(
            info.duration_seconds,
            chunking.chunk_duration_secs,
            chunking.overlap_secs,
            chunking.min_chunk_secs,
        )?;

        let path = path.to_path_buf();
        let chunks_dir = self.config.chunks_dir.clone();
        let session_id = session_id.to_string();

        tokio::task::spawn_blocking(move || {
            let audio = AudioFile::open(&path)?;
            let samples = audio.resample_to_mono(chunking.target_sample_rate);
            let materializer = ChunkMaterializer::new(chunks_dir, &session_id, chunking.target_sample_rate)?;
            materializer.write_all(&samples, &specs)
        })
        .await?
    }

    /// Open a streaming session. Increments follow via
    /// [`append_increment`](Self::append_increment).
    pub async fn begin_stream(&self, session_id: Option<String>) -> Result<String> {
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let session = Session::new(&session_id, SessionStatus::Recording, ProcessingStrategy::StreamingMerged);
        self.tracker.create(&session).await?;
        Ok(session_id)
    }

    /// Record one increment of a streaming session. Increments may arrive
    /// in any order; once the final one is known and every sequence up to
    /// it is present, the increments are merged into one artifact and the
    /// session is queued for direct processing.
    pub async fn append_increment(
        &self,
        session_id: &str,
        sequence: u32,
        path: &Path,
        is_last: bool,
    ) -> Result<StreamProgress> {
        let Some(session) = self.tracker.get(session_id).await? else {
            return Err(TransitionError::NotFound(session_id.to_string()).into());
        };
        if session.status != SessionStatus::Recording {
            bail!("session {} is {}, not recording", session_id, session.status);
        }

        let mut update = fields([(increment_field(sequence), path.display().to_string())]);
        if is_last {
            update.insert(FINAL_SEQUENCE.into(), sequence.to_string());
        }
        self.tracker.update(session_id, &update).await?;

        let record = self
            .tracker
            .store()
            .get(&session_key(session_id))
            .await?
            .ok_or_else(|| anyhow!("session {} expired while recording", session_id))?;

        let received = record.keys().filter(|k| k.starts_with("increment_")).count() as u32;
        let final_sequence: Option<u32> = record.get(FINAL_SEQUENCE).and_then(|v| v.parse().ok());

        let Some(last) = final_sequence else {
            return Ok(StreamProgress {
                received,
                final_sequence,
                finalized: false,
            });
        };

        let increments: Option<Vec<PathBuf>> = (0..=last)
            .map(|seq| record.get(&increment_field(seq)).map(PathBuf::from))
            .collect();
        let Some(increments) = increments else {
            return Ok(StreamProgress {
                received,
                final_sequence,
                finalized: false,
            });
        };

        let finalized = self.finalize_stream(session_id, increments).await?;
        Ok(StreamProgress {
            received,
            final_sequence,
            finalized,
        })
    }

    async fn finalize_stream(&self, session_id: &str, increments: Vec<PathBuf>) -> Result<bool> {
        let started = fields([("processing_started_at", Utc::now().to_rfc3339())]);
        // Only the caller that moves the session out of `recording` merges
        if !self
            .tracker
            .try_transition(session_id, SessionStatus::Processing, started)
            .await?
        {
            return Ok(false);
        }

        let target_rate = self.config.chunking.target_sample_rate;
        let merged_path = self.config.uploads_dir.join(format!("{}-stream.wav", session_id));
        let output = merged_path.clone();
        let count = increments.len();

        let merged = tokio::task::spawn_blocking(move || -> Result<(f64, u64)> {
            let mut samples: Vec<i16> = Vec::new();
            for increment in &increments {
                let audio = AudioFile::open(increment)?;
                samples.extend(audio.resample_to_mono(target_rate));
            }

            if let Some(parent) = output.parent() {
                std::fs::create_dir_all(parent).context("Failed to create uploads directory")?;
            }
            write_wav(&output, &samples, target_rate)?;

            for increment in &increments {
                if let Err(e) = std::fs::remove_file(increment) {
                    warn!("Could not delete increment {}: {}", increment.display(), e);
                }
            }

            let size = std::fs::metadata(&output)?.len();
            Ok((samples.len() as f64 / f64::from(target_rate), size))
        })
        .await?;

        let (duration, size) = match merged {
            Ok(merged) => merged,
            Err(e) => {
                self.tracker
                    .fail(session_id, &format!("Failed to merge stream increments: {:#}", e))
                    .await?;
                return Ok(false);
            }
        };

        let merged_fields = fields([
            ("artifact_path", merged_path.display().to_string()),
            ("audio_duration", duration.to_string()),
            ("file_size", size.to_string()),
        ]);
        let queued = async {
            self.tracker.update(session_id, &merged_fields).await?;
            self.enqueue_direct(session_id, &merged_path).await
        };
        if let Err(e) = queued.await {
            return Err(self.fail_stranded(session_id, "Failed to queue merged stream", e).await);
        }

        info!(
            "Merged {} increments of session {} ({:.1}s)",
            count, session_id, duration
        );
        Ok(true)
    }

    /// Mark a session whose work never reached the stream as failed and
    /// hand back the original error
    async fn fail_stranded(&self, session_id: &str, what: &str, e: anyhow::Error) -> anyhow::Error {
        let reason = format!("{}: {:#}", what, e);
        if let Err(fail_err) = self.tracker.fail(session_id, &reason).await {
            warn!("Could not mark session {} failed: {:#}", session_id, fail_err);
        }
        e.context(format!("{} {}", what, session_id))
    }
}
