use serde::{Deserialize, Serialize};

/// Audio frame message published to NATS
#[derive(Debug, Serialize, Deserialize)]
pub struct AudioFrameMessage {
    /// Transcription request the frame belongs to
    pub session_id: String,
    pub sequence: u32,
    pub pcm: String,  // Base64-encoded PCM bytes
    pub sample_rate: u32,
    pub channels: u16,
    pub timestamp: String,  // RFC3339 timestamp
    #[serde(rename = "final")]
    pub final_frame: bool,
}

/// Transcript message received from STT service
#[derive(Debug, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub session_id: String,
    pub text: String,
    pub partial: bool,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// Request sent to the extraction service
#[derive(Debug, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub session_id: String,
    pub text: String,
}

/// Reply from the extraction service
#[derive(Debug, Serialize, Deserialize)]
pub struct ExtractionReply {
    /// `success` or `error`
    pub status: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}
