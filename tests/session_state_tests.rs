// Integration tests for session and chunk tracking
//
// These tests verify that session status only moves forward through the
// tracker, that racing writers cannot apply the same edge twice, and that
// progress, reset and cleanup behave on top of the in-memory store.

use anyhow::Result;
use scribe_stream::session::{
    chunk_id, ChunkRecord, ChunkStatus, ProcessingStrategy, Session, SessionStatus, SessionTracker, SessionTtls,
    TranscriptResult, TransitionError,
};
use scribe_stream::store::{fields, Fields, MemoryStore};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn tracker() -> SessionTracker {
    SessionTracker::new(Arc::new(MemoryStore::new()), SessionTtls::default())
}

fn transcript(text: &str) -> TranscriptResult {
    TranscriptResult {
        text: text.to_string(),
        confidence: 0.92,
        word_count: text.split_whitespace().count(),
        duration: 12.5,
    }
}

fn chunk(session_id: &str, index: u32, path: &Path) -> ChunkRecord {
    ChunkRecord {
        chunk_id: chunk_id(session_id, index),
        session_id: session_id.to_string(),
        chunk_index: index,
        start_time: f64::from(index) * 170.0,
        end_time: f64::from(index) * 170.0 + 180.0,
        overlap_seconds: 10.0,
        status: ChunkStatus::Queued,
        path: path.display().to_string(),
        transcript_text: None,
        transcript_confidence: None,
        error: None,
    }
}

#[tokio::test]
async fn test_direct_session_lifecycle() -> Result<()> {
    let tracker = tracker();
    tracker
        .create(&Session::new("s1", SessionStatus::Queued, ProcessingStrategy::Direct))
        .await?;

    tracker
        .transition("s1", SessionStatus::Processing, Fields::new())
        .await?;
    let completed = tracker.complete("s1", &transcript("hello world"), None).await?;
    assert!(completed);

    let session = tracker.get("s1").await?.expect("session should exist");
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.result, Some(transcript("hello world")));
    assert!(session.processing_completed_at.is_some());
    assert!(session.error.is_none());

    Ok(())
}

#[tokio::test]
async fn test_result_hidden_until_completed() -> Result<()> {
    let tracker = tracker();
    tracker
        .create(&Session::new("s1", SessionStatus::Processing, ProcessingStrategy::Direct))
        .await?;

    // A stray result field on a non-completed session is not surfaced
    tracker
        .update("s1", &fields([("transcript_text", "partial")]))
        .await?;
    let session = tracker.get("s1").await?.expect("session should exist");
    assert!(session.result.is_none());

    Ok(())
}

#[tokio::test]
async fn test_status_never_regresses() -> Result<()> {
    let tracker = tracker();
    tracker
        .create(&Session::new("s1", SessionStatus::Queued, ProcessingStrategy::Direct))
        .await?;
    tracker
        .transition("s1", SessionStatus::Processing, Fields::new())
        .await?;
    assert!(tracker.complete("s1", &transcript("done"), None).await?);

    // Terminal sessions refuse every edge
    assert!(!tracker.fail("s1", "late failure").await?);
    assert!(
        !tracker
            .try_transition("s1", SessionStatus::Processing, Fields::new())
            .await?
    );

    let err = tracker
        .transition("s1", SessionStatus::Processing, Fields::new())
        .await
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<TransitionError>(),
        Some(&TransitionError::Illegal {
            session_id: "s1".to_string(),
            from: SessionStatus::Completed,
            to: SessionStatus::Processing,
        })
    );

    let session = tracker.get("s1").await?.expect("session should exist");
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.error.is_none());

    Ok(())
}

#[tokio::test]
async fn test_completion_applies_once() -> Result<()> {
    let tracker = tracker();
    tracker
        .create(&Session::new("s1", SessionStatus::Processing, ProcessingStrategy::Chunked))
        .await?;

    let first = transcript("first writer");
    let second = transcript("second writer");
    let (a, b) = tokio::join!(
        tracker.complete("s1", &first, None),
        tracker.complete("s1", &second, None),
    );
    let winners = [a?, b?].iter().filter(|won| **won).count();
    assert_eq!(winners, 1, "Exactly one finaliser should win");

    Ok(())
}

#[tokio::test]
async fn test_transition_on_missing_session() -> Result<()> {
    let tracker = tracker();

    let err = tracker
        .transition("ghost", SessionStatus::Processing, Fields::new())
        .await
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<TransitionError>(),
        Some(&TransitionError::NotFound("ghost".to_string()))
    );
    assert!(tracker.get("ghost").await?.is_none());

    Ok(())
}

#[tokio::test]
async fn test_fail_records_reason() -> Result<()> {
    let tracker = tracker();
    tracker
        .create(&Session::new("s1", SessionStatus::Queued, ProcessingStrategy::Direct))
        .await?;

    assert!(tracker.fail("s1", "Invalid audio file").await?);

    let session = tracker.get("s1").await?.expect("session should exist");
    assert_eq!(session.status, SessionStatus::Error);
    assert_eq!(session.error.as_deref(), Some("Invalid audio file"));
    assert!(session.result.is_none());

    Ok(())
}

#[tokio::test]
async fn test_reset_is_the_only_regression() -> Result<()> {
    let tracker = tracker();
    let mut session = Session::new("s1", SessionStatus::Processing, ProcessingStrategy::Chunked);
    session.total_chunks = 3;
    session.completed_chunks = 2;
    session.failed_chunks = 1;
    tracker.create(&session).await?;
    tracker.fail("s1", "boom").await?;

    let reset = tracker.reset("s1").await?;
    assert_eq!(reset.status, SessionStatus::Queued);
    assert_eq!(reset.completed_chunks, 0);
    assert_eq!(reset.failed_chunks, 0);
    assert_eq!(reset.total_chunks, 3);
    assert!(reset.error.is_none(), "Error is only surfaced in the error state");

    // From queued the normal forward path is open again
    tracker
        .transition("s1", SessionStatus::Processing, Fields::new())
        .await?;

    Ok(())
}

#[tokio::test]
async fn test_chunk_status_transitions() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let tracker = tracker();
    let record = chunk("s1", 0, &temp_dir.path().join("c0.wav"));
    tracker.create_chunk(&record).await?;

    assert!(tracker.start_chunk(&record.chunk_id).await?);
    // Redelivery re-enters processing
    assert!(tracker.start_chunk(&record.chunk_id).await?);
    assert!(tracker.complete_chunk(&record.chunk_id, "chunk text", 0.8).await?);

    // Terminal chunks stay put
    assert!(!tracker.start_chunk(&record.chunk_id).await?);
    assert!(!tracker.fail_chunk(&record.chunk_id, "late").await?);

    let stored = tracker.get_chunk(&record.chunk_id).await?.expect("chunk should exist");
    assert_eq!(stored.status, ChunkStatus::Completed);
    assert_eq!(stored.transcript_text.as_deref(), Some("chunk text"));
    assert_eq!(stored.transcript_confidence, Some(0.8));
    assert_eq!(stored.path, record.path);

    Ok(())
}

#[tokio::test]
async fn test_progress_and_status_view() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let tracker = tracker();
    let mut session = Session::new("s1", SessionStatus::Processing, ProcessingStrategy::Chunked);
    session.total_chunks = 4;
    tracker.create(&session).await?;

    // Chunk 3 has no record yet
    for index in 0..3 {
        tracker
            .create_chunk(&chunk("s1", index, &temp_dir.path().join(format!("c{}.wav", index))))
            .await?;
    }
    tracker.start_chunk(&chunk_id("s1", 0)).await?;
    tracker.complete_chunk(&chunk_id("s1", 0), "zero", 0.9).await?;
    tracker.fail_chunk(&chunk_id("s1", 1), "bad chunk").await?;
    tracker.start_chunk(&chunk_id("s1", 2)).await?;

    let view = tracker.status("s1").await?.expect("session should exist");
    let progress = view.progress.expect("chunked session reports progress");
    assert_eq!(progress.total, 4);
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.failed, 1);
    assert_eq!(progress.processing, 1);
    assert_eq!(progress.pending, 1);
    assert!(!progress.is_done());
    assert_eq!(progress.percent(), 50.0);

    let json = serde_json::to_value(&view)?;
    assert_eq!(json["id"], "s1");
    assert_eq!(json["status"], "processing");
    assert_eq!(json["progress"]["failed"], 1);

    Ok(())
}

#[tokio::test]
async fn test_list_and_counts() -> Result<()> {
    let tracker = tracker();
    for (id, status) in [
        ("a", SessionStatus::Queued),
        ("b", SessionStatus::Processing),
        ("c", SessionStatus::Processing),
    ] {
        tracker
            .create(&Session::new(id, status, ProcessingStrategy::Direct))
            .await?;
    }

    assert_eq!(tracker.list().await?.len(), 3);

    let counts = tracker.counts_by_status().await?;
    assert_eq!(counts.get("queued"), Some(&1));
    assert_eq!(counts.get("processing"), Some(&2));

    Ok(())
}

#[tokio::test]
async fn test_cleanup_removes_records_and_files() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let tracker = tracker();

    let artifact = temp_dir.path().join("upload.wav");
    std::fs::write(&artifact, b"audio")?;

    let mut session = Session::new("s1", SessionStatus::Processing, ProcessingStrategy::Chunked);
    session.total_chunks = 2;
    session.artifact_path = Some(artifact.display().to_string());
    tracker.create(&session).await?;

    for index in 0..2 {
        let path = temp_dir.path().join(format!("s1-chunk-{:03}.wav", index));
        std::fs::write(&path, b"chunk")?;
        tracker.create_chunk(&chunk("s1", index, &path)).await?;
    }

    let report = tracker.cleanup("s1").await?;
    assert_eq!(report.records, 3, "Two chunk records plus the session");
    assert_eq!(report.files, 3, "Two chunk files plus the upload");

    assert!(tracker.get("s1").await?.is_none());
    assert!(tracker.get_chunk(&chunk_id("s1", 0)).await?.is_none());
    assert!(!artifact.exists());

    // Cleaning up again is harmless
    let again = tracker.cleanup("s1").await?;
    assert_eq!(again.records, 0);

    Ok(())
}

#[tokio::test]
async fn test_late_writes_after_cleanup_do_not_recreate_records() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let tracker = tracker();

    let mut session = Session::new("s1", SessionStatus::Processing, ProcessingStrategy::Chunked);
    session.total_chunks = 1;
    tracker.create(&session).await?;
    let path = temp_dir.path().join("s1-chunk-000.wav");
    std::fs::write(&path, b"chunk")?;
    tracker.create_chunk(&chunk("s1", 0, &path)).await?;
    tracker.start_chunk(&chunk_id("s1", 0)).await?;

    tracker.cleanup("s1").await?;

    // Workers that were still running finish after the cleanup
    assert!(!tracker.complete("s1", &transcript("late"), None).await?);
    assert!(!tracker.complete_chunk(&chunk_id("s1", 0), "late", 0.9).await?);
    tracker
        .update("s1", &fields([("extraction_status", "queued")]))
        .await?;

    assert!(tracker.get("s1").await?.is_none());
    assert!(tracker.get_chunk(&chunk_id("s1", 0)).await?.is_none());
    assert!(tracker.store().scan("session_status:").await?.is_empty());
    assert!(tracker.store().scan("chunk_status:").await?.is_empty());
    assert!(tracker.list().await?.is_empty());

    Ok(())
}
