//! Session and chunk records
//!
//! This module provides the `SessionTracker` abstraction that manages:
//! - Session and chunk records in the session store
//! - The session state machine (forward-only status, compare-and-set edges)
//! - Chunk progress for chunked sessions
//! - Cleanup of records and audio artifacts

mod model;
mod progress;
mod state;
mod tracker;

pub use model::{
    chunk_id, chunk_key, result_fields, session_key, ChunkRecord, ChunkStatus, ProcessingStrategy, Session,
    SessionStatus, TranscriptResult,
};
pub use progress::ChunkProgress;
pub use state::TransitionError;
pub use tracker::{CleanupReport, SessionTracker, SessionTtls, SessionView};
