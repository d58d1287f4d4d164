use super::model::{
    chunk_id, chunk_key, result_fields, session_key, ChunkRecord, ChunkStatus, ProcessingStrategy,
    Session, SessionStatus, TranscriptResult,
};
use super::progress::ChunkProgress;
use super::state::{expected_chunk_for, expected_for, TransitionError};
use crate::store::{fields, Fields, SessionStore};
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SESSION_PREFIX: &str = "session_status:";

/// Record expiry per processing strategy
#[derive(Debug, Clone, Copy)]
pub struct SessionTtls {
    pub chunked: Duration,
    pub simple: Duration,
}

impl Default for SessionTtls {
    fn default() -> Self {
        Self {
            chunked: Duration::from_secs(4 * 3600),
            simple: Duration::from_secs(3600),
        }
    }
}

/// A session with its derived progress, as reported to pollers
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: Session,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ChunkProgress>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_duration_secs: Option<f64>,
}

/// What `cleanup` removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub records: usize,
    pub files: usize,
}

/// Session and chunk records on top of a [`SessionStore`]
///
/// Every status change is a compare-and-set against the statuses allowed to
/// precede it, so two actors racing on the same session can never both
/// apply the same edge.
#[derive(Clone)]
pub struct SessionTracker {
    store: Arc<dyn SessionStore>,
    ttls: SessionTtls,
}

impl SessionTracker {
    pub fn new(store: Arc<dyn SessionStore>, ttls: SessionTtls) -> Self {
        Self { store, ttls }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn ttl_for(&self, strategy: ProcessingStrategy) -> Duration {
        match strategy {
            ProcessingStrategy::Chunked => self.ttls.chunked,
            ProcessingStrategy::Direct | ProcessingStrategy::StreamingMerged => self.ttls.simple,
        }
    }

    /// Write a new session record
    pub async fn create(&self, session: &Session) -> Result<()> {
        let ttl = self.ttl_for(session.processing_strategy);
        self.store
            .put(&session_key(&session.id), &session.to_fields(), ttl)
            .await?;

        info!(
            "Created session {} ({}, {})",
            session.id, session.processing_strategy, session.status
        );
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        match self.store.get(&session_key(session_id)).await? {
            Some(record) => Ok(Some(Session::from_fields(&record)?)),
            None => Ok(None),
        }
    }

    /// Merge fields into the session record
    pub async fn update(&self, session_id: &str, fields: &Fields) -> Result<()> {
        self.store.update(&session_key(session_id), fields).await
    }

    /// Move the session to `to` if its current status allows it, then write
    /// `extra`. Returns `false` when the edge is not allowed (another actor
    /// got there first, or the session is gone).
    pub async fn try_transition(&self, session_id: &str, to: SessionStatus, extra: Fields) -> Result<bool> {
        let key = session_key(session_id);
        let moved = self
            .store
            .compare_and_set(&key, "status", &expected_for(to), to.as_str())
            .await?;

        if !moved {
            debug!("Session {} not moved to {}", session_id, to);
            return Ok(false);
        }

        self.store.update(&key, &extra).await?;
        debug!("Session {} moved to {}", session_id, to);
        Ok(true)
    }

    /// Like [`try_transition`](Self::try_transition) but a refused edge is an error
    pub async fn transition(&self, session_id: &str, to: SessionStatus, extra: Fields) -> Result<()> {
        if self.try_transition(session_id, to, extra).await? {
            return Ok(());
        }

        let err = match self.get(session_id).await? {
            Some(session) => TransitionError::Illegal {
                session_id: session_id.to_string(),
                from: session.status,
                to,
            },
            None => TransitionError::NotFound(session_id.to_string()),
        };
        Err(err.into())
    }

    /// Store the result and move `processing -> completed`.
    ///
    /// The result lands before the status flips so a reader that sees
    /// `completed` always sees the transcript too.
    pub async fn complete(&self, session_id: &str, result: &TranscriptResult, warning: Option<&str>) -> Result<bool> {
        let mut extra = result_fields(result);
        extra.insert("processing_completed_at".into(), Utc::now().to_rfc3339());
        if let Some(warning) = warning {
            extra.insert("warning".into(), warning.to_string());
        }
        self.update(session_id, &extra).await?;

        let completed = self
            .try_transition(session_id, SessionStatus::Completed, Fields::new())
            .await?;
        if completed {
            info!(
                "Session {} completed ({} words, confidence {:.2})",
                session_id, result.word_count, result.confidence
            );
        }
        Ok(completed)
    }

    /// Move the session to `error` with a reason. A session already in a
    /// terminal state is left untouched.
    pub async fn fail(&self, session_id: &str, error: &str) -> Result<bool> {
        let extra = fields([
            ("error", error.to_string()),
            ("processing_completed_at", Utc::now().to_rfc3339()),
        ]);
        let failed = self.try_transition(session_id, SessionStatus::Error, extra).await?;

        if failed {
            warn!("Session {} failed: {}", session_id, error);
        }
        Ok(failed)
    }

    /// Return a session to `queued`. The only regression the state machine
    /// allows, and only on explicit request.
    pub async fn reset(&self, session_id: &str) -> Result<Session> {
        let Some(session) = self.get(session_id).await? else {
            return Err(TransitionError::NotFound(session_id.to_string()).into());
        };

        let from: Vec<&str> = SessionStatus::ALL
            .iter()
            .filter(|status| **status != SessionStatus::Queued)
            .map(SessionStatus::as_str)
            .collect();
        let key = session_key(session_id);
        self.store
            .compare_and_set(&key, "status", &from, SessionStatus::Queued.as_str())
            .await?;

        let mut extra = fields([("reset_at", Utc::now().to_rfc3339())]);
        if session.processing_strategy == ProcessingStrategy::Chunked {
            extra.insert("completed_chunks".into(), "0".into());
            extra.insert("failed_chunks".into(), "0".into());
        }
        self.store.update(&key, &extra).await?;

        info!("Session {} reset from {} to queued", session_id, session.status);
        self.get(session_id)
            .await?
            .ok_or_else(|| TransitionError::NotFound(session_id.to_string()).into())
    }

    /// Write a new chunk record
    pub async fn create_chunk(&self, chunk: &ChunkRecord) -> Result<()> {
        self.store
            .put(&chunk_key(&chunk.chunk_id), &chunk.to_fields(), self.ttls.chunked)
            .await
    }

    pub async fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkRecord>> {
        match self.store.get(&chunk_key(chunk_id)).await? {
            Some(record) => Ok(Some(ChunkRecord::from_fields(&record)?)),
            None => Ok(None),
        }
    }

    pub async fn update_chunk(&self, chunk_id: &str, fields: &Fields) -> Result<()> {
        self.store.update(&chunk_key(chunk_id), fields).await
    }

    /// Mark a chunk as being worked on. Redelivered chunks re-enter `processing`.
    pub async fn start_chunk(&self, chunk_id: &str) -> Result<bool> {
        let extra = fields([("processing_started_at", Utc::now().to_rfc3339())]);
        self.chunk_transition(chunk_id, ChunkStatus::Processing, extra).await
    }

    pub async fn complete_chunk(&self, chunk_id: &str, text: &str, confidence: f64) -> Result<bool> {
        let key = chunk_key(chunk_id);
        self.store
            .update(
                &key,
                &fields([
                    ("transcript_text", text.to_string()),
                    ("transcript_confidence", confidence.to_string()),
                    ("processing_completed_at", Utc::now().to_rfc3339()),
                ]),
            )
            .await?;

        self.chunk_transition(chunk_id, ChunkStatus::Completed, Fields::new())
            .await
    }

    pub async fn fail_chunk(&self, chunk_id: &str, error: &str) -> Result<bool> {
        let extra = fields([
            ("error", error.to_string()),
            ("processing_completed_at", Utc::now().to_rfc3339()),
        ]);
        self.chunk_transition(chunk_id, ChunkStatus::Error, extra).await
    }

    async fn chunk_transition(&self, chunk_id: &str, to: ChunkStatus, extra: Fields) -> Result<bool> {
        let key = chunk_key(chunk_id);
        let moved = self
            .store
            .compare_and_set(&key, "status", &expected_chunk_for(to), to.as_str())
            .await?;

        if moved {
            self.store.update(&key, &extra).await?;
            debug!("Chunk {} moved to {}", chunk_id, to);
        } else {
            debug!("Chunk {} not moved to {}", chunk_id, to);
        }
        Ok(moved)
    }

    /// Chunk records of a session in index order, `None` where a record is missing
    pub async fn chunks(&self, session: &Session) -> Result<Vec<Option<ChunkRecord>>> {
        let mut chunks = Vec::with_capacity(session.total_chunks as usize);
        for index in 0..session.total_chunks {
            chunks.push(self.get_chunk(&chunk_id(&session.id, index)).await?);
        }
        Ok(chunks)
    }

    pub async fn progress(&self, session: &Session) -> Result<ChunkProgress> {
        let chunks = self.chunks(session).await?;
        Ok(ChunkProgress::tally(
            session.total_chunks,
            chunks.iter().map(|chunk| chunk.as_ref().map(|c| c.status)),
        ))
    }

    /// Session record plus derived progress, `None` if unknown or expired
    pub async fn status(&self, session_id: &str) -> Result<Option<SessionView>> {
        let Some(session) = self.get(session_id).await? else {
            return Ok(None);
        };

        let progress = if session.processing_strategy == ProcessingStrategy::Chunked && session.total_chunks > 0 {
            Some(self.progress(&session).await?)
        } else {
            None
        };
        let processing_duration_secs = session.processing_duration_secs();

        Ok(Some(SessionView {
            session,
            progress,
            processing_duration_secs,
        }))
    }

    /// Every live session. Unreadable records are skipped.
    pub async fn list(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for key in self.store.scan(SESSION_PREFIX).await? {
            let Some(record) = self.store.get(&key).await? else {
                continue;
            };
            match Session::from_fields(&record) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("Skipping unreadable session record {}: {:#}", key, e),
            }
        }
        Ok(sessions)
    }

    pub async fn counts_by_status(&self) -> Result<BTreeMap<String, usize>> {
        let mut counts = BTreeMap::new();
        for session in self.list().await? {
            *counts.entry(session.status.to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Delete a session's chunk records and chunk artifacts
    pub async fn remove_chunks(&self, session: &Session) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let mut keys = Vec::new();

        for (index, chunk) in self.chunks(session).await?.into_iter().enumerate() {
            keys.push(chunk_key(&chunk_id(&session.id, index as u32)));
            if let Some(chunk) = chunk {
                if remove_file(Path::new(&chunk.path)).await? {
                    report.files += 1;
                }
            }
        }

        report.records = self.store.delete(&keys).await?;
        Ok(report)
    }

    /// Delete everything belonging to a session: chunk records and
    /// artifacts, the source artifact and the session record itself
    pub async fn cleanup(&self, session_id: &str) -> Result<CleanupReport> {
        let Some(session) = self.get(session_id).await? else {
            return Ok(CleanupReport::default());
        };

        let mut report = self.remove_chunks(&session).await?;
        if let Some(path) = &session.artifact_path {
            if remove_file(Path::new(path)).await? {
                report.files += 1;
            }
        }
        report.records += self.store.delete(&[session_key(session_id)]).await?;

        info!(
            "Cleaned up session {} ({} records, {} files)",
            session_id, report.records, report.files
        );
        Ok(report)
    }
}

/// Remove a file, treating an already missing one as done
async fn remove_file(path: &Path) -> Result<bool> {
    if path.as_os_str().is_empty() {
        return Ok(false);
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
