pub mod audio;
pub mod config;
pub mod nats;
pub mod pipeline;
pub mod session;
pub mod store;
pub mod stream;
pub mod worker;

pub use audio::{AudioFile, ChunkError, ChunkingConfig};
pub use config::{Config, WorkerKind};
pub use nats::{NatsClient, NatsExtractor, NatsTranscriber};
pub use pipeline::{CompletionReconciler, Ingestor, Transcriber};
pub use session::{Session, SessionStatus, SessionTracker};
pub use store::{MemoryStore, RedisStore, SessionStore};
pub use stream::{DurableStream, MemoryStream, RedisStream, StreamMessage};
pub use worker::{HandlerOutcome, MessageHandler, WorkerRuntime};
