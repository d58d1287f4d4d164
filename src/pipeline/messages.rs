//! Typed views of the stream payloads exchanged between ingest and workers.
//! Every field travels as a string; the `type` field tells them apart.

use crate::stream::Payload;
use anyhow::{anyhow, bail, Context, Result};

/// Whole-file transcription job on the audio input topic
#[derive(Debug, Clone, PartialEq)]
pub struct DirectJob {
    pub session_id: String,
    pub audio_path: String,
}

/// Transcription job for one chunk of a chunked session
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkJob {
    pub session_id: String,
    pub chunk_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub start_time: f64,
    pub end_time: f64,
    pub chunk_path: String,
}

/// Structured extraction of a finished transcript
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionJob {
    pub session_id: String,
    pub transcript_text: String,
}

impl DirectJob {
    pub const TYPE: &'static str = "direct";

    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("type".into(), Self::TYPE.into());
        payload.insert("session_id".into(), self.session_id.clone());
        payload.insert("audio_path".into(), self.audio_path.clone());
        payload
    }

    pub fn from_payload(payload: &Payload) -> Result<Self> {
        expect_type(payload, Self::TYPE)?;
        Ok(Self {
            session_id: field(payload, "session_id")?,
            audio_path: field(payload, "audio_path")?,
        })
    }
}

impl ChunkJob {
    pub const TYPE: &'static str = "chunk";

    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("type".into(), Self::TYPE.into());
        payload.insert("session_id".into(), self.session_id.clone());
        payload.insert("chunk_id".into(), self.chunk_id.clone());
        payload.insert("chunk_index".into(), self.chunk_index.to_string());
        payload.insert("total_chunks".into(), self.total_chunks.to_string());
        payload.insert("start_time".into(), self.start_time.to_string());
        payload.insert("end_time".into(), self.end_time.to_string());
        payload.insert("chunk_path".into(), self.chunk_path.clone());
        payload
    }

    pub fn from_payload(payload: &Payload) -> Result<Self> {
        expect_type(payload, Self::TYPE)?;
        Ok(Self {
            session_id: field(payload, "session_id")?,
            chunk_id: field(payload, "chunk_id")?,
            chunk_index: parsed(payload, "chunk_index")?,
            total_chunks: parsed(payload, "total_chunks")?,
            start_time: parsed(payload, "start_time")?,
            end_time: parsed(payload, "end_time")?,
            chunk_path: field(payload, "chunk_path")?,
        })
    }
}

impl ExtractionJob {
    pub const TYPE: &'static str = "extraction";

    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("type".into(), Self::TYPE.into());
        payload.insert("session_id".into(), self.session_id.clone());
        payload.insert("transcript_text".into(), self.transcript_text.clone());
        payload
    }

    pub fn from_payload(payload: &Payload) -> Result<Self> {
        expect_type(payload, Self::TYPE)?;
        Ok(Self {
            session_id: field(payload, "session_id")?,
            // Silent recordings legitimately produce an empty transcript
            transcript_text: payload.get("transcript_text").cloned().unwrap_or_default(),
        })
    }
}

fn expect_type(payload: &Payload, expected: &str) -> Result<()> {
    match payload.get("type").map(String::as_str) {
        Some(t) if t == expected => Ok(()),
        Some(other) => bail!("Expected a '{}' message, got '{}'", expected, other),
        None => bail!("Message has no type"),
    }
}

fn field(payload: &Payload, name: &str) -> Result<String> {
    payload
        .get(name)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| anyhow!("Message is missing '{}'", name))
}

fn parsed<T>(payload: &Payload, name: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    field(payload, name)?
        .parse()
        .with_context(|| format!("Message field '{}' is malformed", name))
}
