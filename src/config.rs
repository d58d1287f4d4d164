use crate::audio::ChunkingConfig;
use crate::session::SessionTtls;
use crate::worker::{dead_letter_topic, WorkerConfig};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default config file, looked up relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config/scribe-stream";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub backend: BackendConfig,
    pub nats: NatsConfig,
    pub paths: PathsConfig,
    pub streams: StreamsConfig,
    pub worker: WorkerSettings,
    pub chunking: ChunkingConfig,
    pub reconciler: ReconcilerSettings,
    pub session: SessionSettings,
    pub extraction: ExtractionSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "scribe-stream".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub redis_url: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,

    /// Audio frames go to `<prefix>.<request id>`
    pub audio_subject_prefix: String,

    /// Subject the STT service publishes transcripts on
    pub transcript_subject: String,

    pub extraction_subject: String,
    pub request_timeout_secs: u64,

    /// PCM carried by one published frame
    pub frame_duration_ms: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            audio_subject_prefix: "audio.frame".to_string(),
            transcript_subject: "stt.text.>".to_string(),
            extraction_subject: "extract.medical".to_string(),
            request_timeout_secs: 60,
            frame_duration_ms: 1000,
        }
    }
}

impl NatsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub uploads: PathBuf,
    pub chunks: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            uploads: PathBuf::from("data/uploads"),
            chunks: PathBuf::from("data/chunks"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    pub audio_input: String,
    pub audio_chunks: String,
    pub extraction: String,
    pub direct_group: String,
    pub chunk_group: String,
    pub extraction_group: String,
    pub dead_letter_suffix: String,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            audio_input: "audio_input".to_string(),
            audio_chunks: "audio_chunks".to_string(),
            extraction: "medical_extraction_queue".to_string(),
            direct_group: "audio_processors".to_string(),
            chunk_group: "chunk_processors".to_string(),
            extraction_group: "medical_extractors".to_string(),
            dead_letter_suffix: ":dead_letter".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub block_timeout_ms: u64,
    pub batch_size: usize,
    pub max_retries: u32,
    pub stuck_threshold_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub max_consecutive_errors: u32,

    /// Upper bound on every store / stream call
    pub operation_timeout_secs: u64,

    pub handler_timeout_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            block_timeout_ms: 1000,
            batch_size: 1,
            max_retries: 3,
            stuck_threshold_secs: 300,
            heartbeat_interval_secs: 30,
            max_consecutive_errors: 5,
            operation_timeout_secs: 10,
            handler_timeout_secs: 900,
        }
    }
}

impl WorkerSettings {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcilerSettings {
    pub interval_secs: u64,

    /// Chunk records read per tick across all sessions
    pub max_chunks_per_tick: usize,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            max_chunks_per_tick: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub chunked_ttl_secs: u64,
    pub simple_ttl_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            chunked_ttl_secs: 4 * 3600,
            simple_ttl_secs: 3600,
        }
    }
}

impl SessionSettings {
    pub fn ttls(&self) -> SessionTtls {
        SessionTtls {
            chunked: Duration::from_secs(self.chunked_ttl_secs),
            simple: Duration::from_secs(self.simple_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractionSettings {
    /// Enqueue extraction once a transcript is final
    pub enabled: bool,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// The three worker flavours, one per topic and group
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WorkerKind {
    /// Whole-file transcription (`audio_input`)
    Direct,
    /// Per-chunk transcription (`audio_chunks`), hosts the reconciler
    Chunk,
    /// Structured extraction of finished transcripts
    Extraction,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Direct => "direct",
            WorkerKind::Chunk => "chunk",
            WorkerKind::Extraction => "extraction",
        }
    }
}

impl Config {
    /// Load `path` (extension optional, missing file allowed unless
    /// `required`) with `SCRIBE__SECTION__KEY` environment overrides on top
    pub fn load(path: &str, required: bool) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(required))
            .add_source(
                config::Environment::with_prefix("SCRIBE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to load configuration from {}", path))?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    pub fn topic_and_group(&self, kind: WorkerKind) -> (&str, &str) {
        let streams = &self.streams;
        match kind {
            WorkerKind::Direct => (&streams.audio_input, &streams.direct_group),
            WorkerKind::Chunk => (&streams.audio_chunks, &streams.chunk_group),
            WorkerKind::Extraction => (&streams.extraction, &streams.extraction_group),
        }
    }

    /// Runtime configuration of a worker of `kind`, named `<kind>-<pid>`
    pub fn worker_config(&self, kind: WorkerKind) -> WorkerConfig {
        let (topic, group) = self.topic_and_group(kind);
        let consumer = format!("{}-{}", kind.as_str(), std::process::id());
        let settings = &self.worker;

        let mut config = WorkerConfig::new(topic, group, &consumer);
        config.dead_letter_topic = dead_letter_topic(topic, &self.streams.dead_letter_suffix);
        config.block_timeout = Duration::from_millis(settings.block_timeout_ms);
        config.batch_size = settings.batch_size.max(1);
        config.max_retries = settings.max_retries;
        config.stuck_threshold = Duration::from_secs(settings.stuck_threshold_secs);
        config.heartbeat_interval = Duration::from_secs(settings.heartbeat_interval_secs.max(1));
        config.max_consecutive_errors = settings.max_consecutive_errors.max(1);
        config.handler_timeout = Duration::from_secs(settings.handler_timeout_secs);
        config
    }
}
