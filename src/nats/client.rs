use super::messages::{AudioFrameMessage, ExtractionReply, ExtractionRequest, TranscriptMessage};
use crate::audio::AudioFile;
use crate::config::NatsConfig;
use crate::pipeline::{Extractor, Transcriber, Transcript};
use anyhow::{anyhow, bail, Context, Result};
use async_nats::Client;
use base64::Engine;
use futures::StreamExt;
use std::path::Path;
use tracing::{debug, info};

/// Sample rate the STT service consumes (Whisper expects 16kHz)
const STT_SAMPLE_RATE: u32 = 16000;

/// Shared NATS connection for the transcription and extraction services
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
    config: NatsConfig,
}

impl NatsClient {
    /// Connect to NATS server
    pub async fn connect(config: &NatsConfig) -> Result<Self> {
        info!("Connecting to NATS at {}", config.url);

        let client = async_nats::connect(config.url.as_str())
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Publish audio frame to NATS
    async fn publish_audio_frame(
        &self,
        request_id: &str,
        pcm_bytes: &[u8],
        sequence: u32,
        is_final: bool,
    ) -> Result<()> {
        let subject = format!("{}.{}", self.config.audio_subject_prefix, request_id);

        let message = AudioFrameMessage {
            session_id: request_id.to_string(),
            sequence,
            pcm: base64::engine::general_purpose::STANDARD.encode(pcm_bytes),
            sample_rate: STT_SAMPLE_RATE,
            channels: 1,
            timestamp: chrono::Utc::now().to_rfc3339(),
            final_frame: is_final,
        };

        let payload = serde_json::to_vec(&message)?;

        self.client
            .publish(subject.clone(), payload.into())
            .await
            .context("Failed to publish audio frame")?;

        debug!(
            "Published audio frame to {} (sequence={}, bytes={}, final={})",
            subject,
            sequence,
            pcm_bytes.len(),
            is_final
        );

        Ok(())
    }

    /// Subscribe to transcript messages
    async fn subscribe_transcripts(&self) -> Result<async_nats::Subscriber> {
        // The STT service publishes partial and final transcripts on the
        // same subject tree; replies are matched on session_id
        let subject = self.config.transcript_subject.clone();

        let subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .context("Failed to subscribe to transcripts")?;

        debug!("Subscribed to {}", subject);

        Ok(subscriber)
    }
}

/// Transcription over NATS
///
/// Streams the artifact as 16 kHz mono PCM frames to
/// `<audio_subject_prefix>.<request id>`, marks the last frame final and
/// waits for the first non-partial transcript carrying the request id.
pub struct NatsTranscriber {
    nats: NatsClient,
}

impl NatsTranscriber {
    pub fn new(nats: NatsClient) -> Self {
        Self { nats }
    }
}

#[async_trait::async_trait]
impl Transcriber for NatsTranscriber {
    async fn transcribe(&self, audio_path: &Path) -> Result<Transcript> {
        let path = audio_path.to_path_buf();
        let samples = tokio::task::spawn_blocking(move || -> Result<Vec<i16>> {
            let audio = AudioFile::open(&path)?;
            Ok(audio.resample_to_mono(STT_SAMPLE_RATE))
        })
        .await??;

        let request_id = uuid::Uuid::new_v4().to_string();
        let duration = samples.len() as f64 / f64::from(STT_SAMPLE_RATE);

        // Subscribe before publishing so the reply cannot be missed
        let mut transcripts = self.nats.subscribe_transcripts().await?;

        let frame_len = (STT_SAMPLE_RATE as u64 * self.nats.config.frame_duration_ms.max(1) / 1000).max(1) as usize;
        let frames: Vec<&[i16]> = samples.chunks(frame_len).collect();
        let last = frames.len().saturating_sub(1);

        if frames.is_empty() {
            self.nats.publish_audio_frame(&request_id, &[], 0, true).await?;
        }
        for (sequence, frame) in frames.iter().enumerate() {
            let bytes: Vec<u8> = frame.iter().flat_map(|s| s.to_le_bytes()).collect();
            self.nats
                .publish_audio_frame(&request_id, &bytes, sequence as u32, sequence == last)
                .await?;
        }

        info!(
            "Sent {:.1}s of audio from {} as request {}",
            duration,
            audio_path.display(),
            request_id
        );

        let wait = async {
            while let Some(message) = transcripts.next().await {
                let transcript: TranscriptMessage = match serde_json::from_slice(&message.payload) {
                    Ok(transcript) => transcript,
                    Err(e) => {
                        debug!("Ignoring malformed transcript message: {}", e);
                        continue;
                    }
                };

                if transcript.session_id == request_id && !transcript.partial {
                    return Ok(transcript);
                }
            }
            Err(anyhow!("Transcript subscription closed"))
        };

        let transcript = tokio::time::timeout(self.nats.config.request_timeout(), wait)
            .await
            .map_err(|_| anyhow!("No transcript within {:?}", self.nats.config.request_timeout()))??;

        Ok(Transcript {
            text: transcript.text.trim().to_string(),
            confidence: transcript.confidence.map(f64::from).unwrap_or(0.0),
            duration,
        })
    }
}

/// Extraction over NATS request/reply
pub struct NatsExtractor {
    nats: NatsClient,
}

impl NatsExtractor {
    pub fn new(nats: NatsClient) -> Self {
        Self { nats }
    }
}

#[async_trait::async_trait]
impl Extractor for NatsExtractor {
    async fn extract(&self, session_id: &str, text: &str) -> Result<serde_json::Value> {
        let request = ExtractionRequest {
            session_id: session_id.to_string(),
            text: text.to_string(),
        };
        let payload = serde_json::to_vec(&request)?;
        let subject = self.nats.config.extraction_subject.clone();

        let call = self.nats.client.request(subject.clone(), payload.into());
        let message = tokio::time::timeout(self.nats.config.request_timeout(), call)
            .await
            .map_err(|_| anyhow!("Extraction request to {} timed out", subject))?
            .context("Extraction request failed")?;

        let reply: ExtractionReply =
            serde_json::from_slice(&message.payload).context("Malformed extraction reply")?;

        if reply.status != "success" {
            bail!(
                "Extraction service returned {}: {}",
                reply.status,
                reply.error.unwrap_or_default()
            );
        }
        Ok(reply.data)
    }
}
