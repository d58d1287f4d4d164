// Integration tests for configuration loading
//
// These tests verify the built-in defaults, that the shipped config file
// parses and that SCRIBE__SECTION__KEY environment variables override it.

use anyhow::Result;
use scribe_stream::config::{BackendKind, Config, WorkerKind};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

fn shipped_config() -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("config")
        .join("scribe-stream.toml")
        .display()
        .to_string()
}

#[test]
fn test_defaults() {
    let cfg = Config::default();

    assert_eq!(cfg.backend.kind, BackendKind::Redis);
    assert_eq!(cfg.streams.audio_input, "audio_input");
    assert_eq!(cfg.worker.max_retries, 3);
    assert_eq!(cfg.worker.max_consecutive_errors, 5);
    assert_eq!(cfg.chunking.chunk_duration_secs, 180.0);
    assert_eq!(cfg.chunking.overlap_secs, 10.0);
    assert_eq!(cfg.chunking.split_size_bytes, 50 * 1024 * 1024);
    assert_eq!(cfg.reconciler.max_chunks_per_tick, 500);
    assert_eq!(cfg.session.ttls().chunked, Duration::from_secs(4 * 3600));
}

#[test]
fn test_shipped_config_matches_defaults() -> Result<()> {
    let cfg = Config::load(&shipped_config(), true)?;
    let defaults = Config::default();

    assert_eq!(cfg.streams.extraction, defaults.streams.extraction);
    assert_eq!(cfg.worker.stuck_threshold_secs, defaults.worker.stuck_threshold_secs);
    assert_eq!(cfg.chunking.min_chunk_secs, defaults.chunking.min_chunk_secs);
    assert_eq!(cfg.nats.extraction_subject, defaults.nats.extraction_subject);

    Ok(())
}

#[test]
fn test_partial_file_keeps_defaults() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("partial.toml");
    std::fs::write(
        &path,
        "[backend]\nkind = \"memory\"\n\n[chunking]\nchunk_duration_secs = 120.0\n",
    )?;

    let cfg = Config::load(&path.display().to_string(), true)?;
    assert_eq!(cfg.backend.kind, BackendKind::Memory);
    assert_eq!(cfg.chunking.chunk_duration_secs, 120.0);
    assert_eq!(cfg.chunking.overlap_secs, 10.0);
    assert_eq!(cfg.worker.batch_size, 1);

    Ok(())
}

#[test]
fn test_missing_file() -> Result<()> {
    assert!(Config::load("/nonexistent/scribe-stream", true).is_err());

    let cfg = Config::load("/nonexistent/scribe-stream", false)?;
    assert_eq!(cfg.service.name, "scribe-stream");

    Ok(())
}

#[test]
fn test_environment_overrides_file() -> Result<()> {
    std::env::set_var("SCRIBE__RECONCILER__MAX_CHUNKS_PER_TICK", "42");
    let cfg = Config::load(&shipped_config(), true);
    std::env::remove_var("SCRIBE__RECONCILER__MAX_CHUNKS_PER_TICK");

    assert_eq!(cfg?.reconciler.max_chunks_per_tick, 42);

    Ok(())
}

#[test]
fn test_worker_config_per_kind() {
    let cfg = Config::default();

    let chunk = cfg.worker_config(WorkerKind::Chunk);
    assert_eq!(chunk.topic, "audio_chunks");
    assert_eq!(chunk.group, "chunk_processors");
    assert_eq!(chunk.dead_letter_topic, "audio_chunks:dead_letter");
    assert!(chunk.consumer.starts_with("chunk-"));
    assert_eq!(chunk.stuck_threshold, Duration::from_secs(300));

    let extraction = cfg.worker_config(WorkerKind::Extraction);
    assert_eq!(extraction.topic, "medical_extraction_queue");
    assert_eq!(extraction.group, "medical_extractors");
}
