use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::file::AudioInfo;

/// Errors from planning chunks or merging their transcripts
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChunkError {
    #[error("chunk duration {chunk_duration}s must exceed overlap {overlap}s")]
    InvalidPlan { chunk_duration: f64, overlap: f64 },

    #[error("audio of {0:.1}s yields no chunk of at least the minimum length")]
    NoChunks(f64),

    #[error("All chunks failed to process")]
    NoSuccessfulChunks,
}

/// Chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Length of each chunk in seconds (default: 180)
    pub chunk_duration_secs: f64,

    /// Overlap between consecutive chunks in seconds (default: 10)
    pub overlap_secs: f64,

    /// Chunks shorter than this are dropped (default: 5)
    pub min_chunk_secs: f64,

    /// Artifacts longer than this are chunked (default: 300 = 5 minutes)
    pub split_duration_secs: f64,

    /// Artifacts larger than this are chunked (default: 50 MiB)
    pub split_size_bytes: u64,

    /// Words compared at each chunk boundary when removing overlap (default: 5)
    pub overlap_lookback_words: usize,

    /// Sample rate of materialised chunks (Whisper expects 16kHz)
    pub target_sample_rate: u32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_duration_secs: 180.0,
            overlap_secs: 10.0,
            min_chunk_secs: 5.0,
            split_duration_secs: 300.0,
            split_size_bytes: 50 * 1024 * 1024,
            overlap_lookback_words: 5,
            target_sample_rate: 16000,
        }
    }
}

/// Whether an artifact is processed as chunks: too long OR too large
pub fn should_split(info: &AudioInfo, config: &ChunkingConfig) -> bool {
    let split = info.duration_seconds > config.split_duration_secs || info.size_bytes > config.split_size_bytes;

    info!(
        "Should chunk? {} (duration: {:.1}s, size: {:.1}MB)",
        split,
        info.duration_seconds,
        info.size_bytes as f64 / (1024.0 * 1024.0)
    );
    split
}

/// Time window of one chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSpec {
    /// Chunk number (0-indexed)
    pub chunk_index: u32,
    pub start_time: f64,
    pub end_time: f64,

    /// Overlap with the next chunk (0 for the last one)
    pub overlap_seconds: f64,
}

impl ChunkSpec {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Lay out overlapping chunk windows over `duration` seconds.
///
/// `total = ceil(duration / (chunk - overlap))`, chunk `i` covers
/// `[i * step, min(i * step + chunk, duration))`. Windows shorter than
/// `min_chunk` are dropped; only the tail window can be that short, so
/// indices stay contiguous.
pub fn plan_chunks(duration: f64, chunk_duration: f64, overlap: f64, min_chunk: f64) -> Result<Vec<ChunkSpec>, ChunkError> {
    if chunk_duration <= overlap || overlap < 0.0 {
        return Err(ChunkError::InvalidPlan {
            chunk_duration,
            overlap,
        });
    }
    if duration <= 0.0 {
        return Err(ChunkError::NoChunks(duration));
    }

    let step = chunk_duration - overlap;
    let total = (duration / step).ceil() as u32;

    let mut chunks: Vec<ChunkSpec> = (0..total)
        .map(|i| {
            let start_time = f64::from(i) * step;
            let end_time = (start_time + chunk_duration).min(duration);
            ChunkSpec {
                chunk_index: i,
                start_time,
                end_time,
                overlap_seconds: overlap,
            }
        })
        .filter(|chunk| chunk.duration() >= min_chunk)
        .collect();

    match chunks.last_mut() {
        Some(last) => last.overlap_seconds = 0.0,
        None => return Err(ChunkError::NoChunks(duration)),
    }

    Ok(chunks)
}

/// A chunk written to disk
#[derive(Debug, Clone)]
pub struct ChunkArtifact {
    pub spec: ChunkSpec,

    /// File path to the chunk
    pub file_path: PathBuf,

    /// Number of samples in this chunk
    pub sample_count: usize,
}

/// Chunk artifact filename, `<session>-chunk-NNN.wav`
pub fn chunk_file_name(session_id: &str, chunk_index: u32) -> String {
    format!("{}-chunk-{:03}.wav", session_id, chunk_index)
}

/// Writes each planned window of a mono PCM buffer as its own WAV file
pub struct ChunkMaterializer {
    output_dir: PathBuf,
    session_id: String,
    sample_rate: u32,
}

impl ChunkMaterializer {
    pub fn new(output_dir: impl Into<PathBuf>, session_id: &str, sample_rate: u32) -> Result<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir).context("Failed to create chunks directory")?;

        Ok(Self {
            output_dir,
            session_id: session_id.to_string(),
            sample_rate,
        })
    }

    /// Write every chunk. `samples` is mono at the materializer's sample rate.
    pub fn write_all(&self, samples: &[i16], specs: &[ChunkSpec]) -> Result<Vec<ChunkArtifact>> {
        let mut artifacts = Vec::with_capacity(specs.len());

        for spec in specs {
            let artifact = self.write_one(samples, spec)?;
            info!(
                "Created chunk {}/{}: {:.1}s-{:.1}s ({} samples)",
                spec.chunk_index + 1,
                specs.len(),
                spec.start_time,
                spec.end_time,
                artifact.sample_count
            );
            artifacts.push(artifact);
        }

        info!("Successfully created {} chunks for session {}", artifacts.len(), self.session_id);
        Ok(artifacts)
    }

    fn write_one(&self, samples: &[i16], spec: &ChunkSpec) -> Result<ChunkArtifact> {
        let rate = f64::from(self.sample_rate);
        let start = ((spec.start_time * rate) as usize).min(samples.len());
        let end = ((spec.end_time * rate).ceil() as usize).min(samples.len()).max(start);

        let file_path = self.output_dir.join(chunk_file_name(&self.session_id, spec.chunk_index));
        let mut writer = ChunkWriter::new(&file_path, self.sample_rate)?;
        writer.write_samples(&samples[start..end])?;
        let sample_count = writer.finish()?;

        Ok(ChunkArtifact {
            spec: spec.clone(),
            file_path,
            sample_count,
        })
    }
}

/// Writes a single chunk to disk as WAV file
struct ChunkWriter {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    sample_count: usize,
}

impl ChunkWriter {
    fn new(file_path: &Path, sample_rate: u32) -> Result<Self> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let writer = hound::WavWriter::create(file_path, spec)
            .with_context(|| format!("Failed to create WAV file: {:?}", file_path))?;

        Ok(Self {
            writer: Some(writer),
            sample_count: 0,
        })
    }

    fn write_samples(&mut self, samples: &[i16]) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            for &sample in samples {
                writer.write_sample(sample).context("Failed to write sample to WAV")?;
            }
            self.sample_count += samples.len();
        }

        Ok(())
    }

    fn finish(mut self) -> Result<usize> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().context("Failed to finalize WAV file")?;
        }

        Ok(self.sample_count)
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                warn!("Failed to finalize WAV writer on drop: {}", e);
            }
        }
    }
}

/// Remove every chunk artifact of a session from `dir`, returning how many were deleted
pub fn cleanup_chunk_files(dir: &Path, session_id: &str) -> Result<usize> {
    let prefix = format!("{}-chunk-", session_id);
    let mut cleaned = 0;

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).context("Failed to list chunks directory"),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(&prefix) || !name.ends_with(".wav") {
            continue;
        }

        match fs::remove_file(entry.path()) {
            Ok(()) => cleaned += 1,
            Err(e) => warn!("Could not delete {}: {}", entry.path().display(), e),
        }
    }

    info!("Cleaned up {} chunk files for session {}", cleaned, session_id);
    Ok(cleaned)
}
