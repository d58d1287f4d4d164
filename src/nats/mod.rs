pub mod client;
pub mod messages;

pub use client::{NatsClient, NatsExtractor, NatsTranscriber};
pub use messages::{AudioFrameMessage, ExtractionReply, ExtractionRequest, TranscriptMessage};
