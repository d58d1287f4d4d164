//! The transcription pipeline on top of the stream, the store and the
//! worker runtime
//!
//! Ingest creates a session and enqueues either one direct job or one job
//! per chunk. Transcription handlers write results back to the session and
//! chunk records. The completion reconciler merges finished chunk sets and
//! finalises their sessions, and every final transcript is handed on to
//! the extraction topic.

pub mod extraction;
pub mod ingest;
pub mod messages;
pub mod reconciler;
pub mod transcription;

pub use extraction::{ExtractionHandler, ExtractionQueue, Extractor};
pub use ingest::{IngestConfig, IngestReceipt, Ingestor, StreamProgress};
pub use messages::{ChunkJob, DirectJob, ExtractionJob};
pub use reconciler::{CompletionReconciler, ReconcilerConfig, TickReport};
pub use transcription::{
    ChunkTranscriptionHandler, DirectTranscriptionHandler, Transcriber, Transcript, NO_SPEECH_WARNING,
};
