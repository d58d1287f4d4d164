use crate::store::Fields;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Store key of a session record
pub fn session_key(session_id: &str) -> String {
    format!("session_status:{}", session_id)
}

/// Store key of a chunk record
pub fn chunk_key(chunk_id: &str) -> String {
    format!("chunk_status:{}", chunk_id)
}

/// Chunk ids are derived from the owning session and the chunk index
pub fn chunk_id(session_id: &str, chunk_index: u32) -> String {
    format!("{}-chunk-{:03}", session_id, chunk_index)
}

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Queued,
    Recording,
    Processing,
    ChunkingCompleted,
    Completed,
    Error,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 6] = [
        SessionStatus::Queued,
        SessionStatus::Recording,
        SessionStatus::Processing,
        SessionStatus::ChunkingCompleted,
        SessionStatus::Completed,
        SessionStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Queued => "queued",
            SessionStatus::Recording => "recording",
            SessionStatus::Processing => "processing",
            SessionStatus::ChunkingCompleted => "chunking_completed",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        SessionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow!("Unknown session status: {}", s))
    }
}

/// How a session's audio is processed. Set once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStrategy {
    Direct,
    Chunked,
    StreamingMerged,
}

impl ProcessingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStrategy::Direct => "direct",
            ProcessingStrategy::Chunked => "chunked",
            ProcessingStrategy::StreamingMerged => "streaming_merged",
        }
    }
}

impl fmt::Display for ProcessingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "direct" => Ok(ProcessingStrategy::Direct),
            "chunked" => Ok(ProcessingStrategy::Chunked),
            "streaming_merged" => Ok(ProcessingStrategy::StreamingMerged),
            other => bail!("Unknown processing strategy: {}", other),
        }
    }
}

/// Status of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Queued,
    Processing,
    Completed,
    Error,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Queued => "queued",
            ChunkStatus::Processing => "processing",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChunkStatus::Completed | ChunkStatus::Error)
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(ChunkStatus::Queued),
            "processing" => Ok(ChunkStatus::Processing),
            "completed" => Ok(ChunkStatus::Completed),
            "error" => Ok(ChunkStatus::Error),
            other => bail!("Unknown chunk status: {}", other),
        }
    }
}

/// Final transcript of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptResult {
    pub text: String,

    /// Confidence score (0.0 to 1.0)
    pub confidence: f64,

    pub word_count: usize,

    /// Audio duration covered, in seconds
    pub duration: f64,
}

/// One user-initiated unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,

    pub status: SessionStatus,

    pub processing_strategy: ProcessingStrategy,

    /// Chunk counters (chunked sessions only)
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub failed_chunks: u32,

    /// Populated only once `status` is `completed`
    pub result: Option<TranscriptResult>,

    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,

    /// Populated only once `status` is `error`
    pub error: Option<String>,

    /// Non-fatal note (partial chunk failure, silence)
    pub warning: Option<String>,

    /// Source audio artifact
    pub artifact_path: Option<String>,

    pub file_size: Option<u64>,

    /// Audio duration of the source artifact, in seconds
    pub audio_duration: Option<f64>,

    pub extraction_status: Option<String>,

    /// Structured extraction output, JSON-encoded
    pub extraction_result: Option<String>,

    pub extraction_error: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, status: SessionStatus, strategy: ProcessingStrategy) -> Self {
        Self {
            id: id.into(),
            status,
            processing_strategy: strategy,
            total_chunks: 0,
            completed_chunks: 0,
            failed_chunks: 0,
            result: None,
            created_at: Utc::now(),
            processing_started_at: None,
            processing_completed_at: None,
            error: None,
            warning: None,
            artifact_path: None,
            file_size: None,
            audio_duration: None,
            extraction_status: None,
            extraction_result: None,
            extraction_error: None,
        }
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("session_id".into(), self.id.clone());
        fields.insert("status".into(), self.status.as_str().into());
        fields.insert("processing_strategy".into(), self.processing_strategy.as_str().into());
        fields.insert("created_at".into(), self.created_at.to_rfc3339());

        if self.processing_strategy == ProcessingStrategy::Chunked {
            fields.insert("total_chunks".into(), self.total_chunks.to_string());
            fields.insert("completed_chunks".into(), self.completed_chunks.to_string());
            fields.insert("failed_chunks".into(), self.failed_chunks.to_string());
        }
        if let Some(result) = &self.result {
            fields.extend(result_fields(result));
        }

        let optional = [
            ("processing_started_at", self.processing_started_at.map(|t| t.to_rfc3339())),
            ("processing_completed_at", self.processing_completed_at.map(|t| t.to_rfc3339())),
            ("error", self.error.clone()),
            ("warning", self.warning.clone()),
            ("artifact_path", self.artifact_path.clone()),
            ("file_size", self.file_size.map(|s| s.to_string())),
            ("audio_duration", self.audio_duration.map(|d| d.to_string())),
            ("extraction_status", self.extraction_status.clone()),
            ("extraction_result", self.extraction_result.clone()),
            ("extraction_error", self.extraction_error.clone()),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                fields.insert(name.into(), value);
            }
        }

        fields
    }

    pub fn from_fields(fields: &Fields) -> Result<Self> {
        let id = required(fields, "session_id")?.to_string();
        let status: SessionStatus = required(fields, "status")?.parse()?;
        let processing_strategy: ProcessingStrategy = required(fields, "processing_strategy")?.parse()?;

        // The transcript is only part of the session once it is completed
        let result = if status == SessionStatus::Completed {
            fields.get("transcript_text").map(|text| TranscriptResult {
                text: text.clone(),
                confidence: parse_or(fields, "transcript_confidence", 0.0),
                word_count: parse_or(fields, "transcript_words", 0),
                duration: parse_or(fields, "transcript_duration", 0.0),
            })
        } else {
            None
        };

        Ok(Self {
            id,
            status,
            processing_strategy,
            total_chunks: parse_or(fields, "total_chunks", 0),
            completed_chunks: parse_or(fields, "completed_chunks", 0),
            failed_chunks: parse_or(fields, "failed_chunks", 0),
            result,
            created_at: timestamp(fields, "created_at")?.unwrap_or_else(Utc::now),
            processing_started_at: timestamp(fields, "processing_started_at")?,
            processing_completed_at: timestamp(fields, "processing_completed_at")?,
            error: if status == SessionStatus::Error {
                fields.get("error").cloned()
            } else {
                None
            },
            warning: fields.get("warning").cloned(),
            artifact_path: fields.get("artifact_path").cloned(),
            file_size: fields.get("file_size").and_then(|v| v.parse().ok()),
            audio_duration: fields.get("audio_duration").and_then(|v| v.parse().ok()),
            extraction_status: fields.get("extraction_status").cloned(),
            extraction_result: fields.get("extraction_result").cloned(),
            extraction_error: fields.get("extraction_error").cloned(),
        })
    }

    /// Wall time between processing start and completion, in seconds
    pub fn processing_duration_secs(&self) -> Option<f64> {
        let started = self.processing_started_at?;
        let completed = self.processing_completed_at?;
        Some(completed.signed_duration_since(started).num_milliseconds() as f64 / 1000.0)
    }
}

/// Store fields holding a transcript result
pub fn result_fields(result: &TranscriptResult) -> Fields {
    let mut fields = Fields::new();
    fields.insert("transcript_text".into(), result.text.clone());
    fields.insert("transcript_confidence".into(), result.confidence.to_string());
    fields.insert("transcript_words".into(), result.word_count.to_string());
    fields.insert("transcript_duration".into(), result.duration.to_string());
    fields
}

/// One time-sliced sub-artifact of a session's audio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub session_id: String,
    pub chunk_index: u32,
    pub start_time: f64,
    pub end_time: f64,
    pub overlap_seconds: f64,
    pub status: ChunkStatus,

    /// Materialised chunk artifact
    pub path: String,

    pub transcript_text: Option<String>,
    pub transcript_confidence: Option<f64>,
    pub error: Option<String>,
}

impl ChunkRecord {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("chunk_id".into(), self.chunk_id.clone());
        fields.insert("session_id".into(), self.session_id.clone());
        fields.insert("chunk_index".into(), self.chunk_index.to_string());
        fields.insert("start_time".into(), self.start_time.to_string());
        fields.insert("end_time".into(), self.end_time.to_string());
        fields.insert("duration".into(), self.duration().to_string());
        fields.insert("overlap_seconds".into(), self.overlap_seconds.to_string());
        fields.insert("status".into(), self.status.as_str().into());
        fields.insert("chunk_path".into(), self.path.clone());
        if let Some(text) = &self.transcript_text {
            fields.insert("transcript_text".into(), text.clone());
        }
        if let Some(confidence) = self.transcript_confidence {
            fields.insert("transcript_confidence".into(), confidence.to_string());
        }
        if let Some(error) = &self.error {
            fields.insert("error".into(), error.clone());
        }
        fields
    }

    pub fn from_fields(fields: &Fields) -> Result<Self> {
        Ok(Self {
            chunk_id: required(fields, "chunk_id")?.to_string(),
            session_id: required(fields, "session_id")?.to_string(),
            chunk_index: required(fields, "chunk_index")?
                .parse()
                .context("Invalid chunk_index")?,
            start_time: parse_or(fields, "start_time", 0.0),
            end_time: parse_or(fields, "end_time", 0.0),
            overlap_seconds: parse_or(fields, "overlap_seconds", 0.0),
            status: required(fields, "status")?.parse()?,
            path: fields.get("chunk_path").cloned().unwrap_or_default(),
            transcript_text: fields.get("transcript_text").cloned(),
            transcript_confidence: fields.get("transcript_confidence").and_then(|v| v.parse().ok()),
            error: fields.get("error").cloned(),
        })
    }
}

fn required<'a>(fields: &'a Fields, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("Record is missing field '{}'", name))
}

fn parse_or<T: FromStr>(fields: &Fields, name: &str, default: T) -> T {
    fields.get(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn timestamp(fields: &Fields, name: &str) -> Result<Option<DateTime<Utc>>> {
    fields
        .get(name)
        .map(|v| {
            DateTime::parse_from_rfc3339(v)
                .map(|t| t.with_timezone(&Utc))
                .with_context(|| format!("Invalid timestamp in '{}'", name))
        })
        .transpose()
}
