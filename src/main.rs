use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use scribe_stream::config::{BackendKind, Config, WorkerKind, DEFAULT_CONFIG_PATH};
use scribe_stream::nats::{NatsClient, NatsExtractor, NatsTranscriber};
use scribe_stream::pipeline::{
    ChunkTranscriptionHandler, CompletionReconciler, DirectTranscriptionHandler, ExtractionHandler, ExtractionQueue,
    IngestConfig, Ingestor, ReconcilerConfig,
};
use scribe_stream::session::SessionTracker;
use scribe_stream::store::{MemoryStore, RedisStore, SessionStore};
use scribe_stream::stream::{connect_redis, DurableStream, MemoryStream, RedisStream};
use scribe_stream::worker::{list_dead_letters, MessageHandler, WorkerRuntime};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Audio transcription pipeline over durable streams
#[derive(Parser, Debug)]
#[command(name = "scribe-stream", version, about = "Audio transcription pipeline over durable streams")]
struct Cli {
    /// Path to configuration file (extension optional)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one worker until interrupted
    Worker {
        #[arg(value_enum)]
        kind: WorkerKind,

        /// Do not host the completion reconciler (chunk workers only)
        #[arg(long)]
        no_reconciler: bool,
    },

    /// Ingest an audio file and print the session id
    Ingest {
        file: PathBuf,

        #[arg(long)]
        session_id: Option<String>,
    },

    /// Print a session as JSON
    Status { session_id: String },

    /// Queue and session statistics
    Stats,

    /// List dead-lettered messages of a topic
    DeadLetters {
        topic: String,

        #[arg(long, default_value = "10")]
        count: usize,
    },

    /// Delete a session's records and audio artifacts
    Cleanup { session_id: String },

    /// Return a session to queued
    Reset { session_id: String },

    /// Process one file end to end in this process, on in-memory backends
    Run {
        file: PathBuf,

        #[arg(long)]
        session_id: Option<String>,
    },
}

/// Process-wide stream and store clients
struct Backends {
    stream: Arc<dyn DurableStream>,
    store: Arc<dyn SessionStore>,
}

impl Backends {
    async fn connect(cfg: &Config) -> Result<Self> {
        match cfg.backend.kind {
            BackendKind::Redis => {
                let conn = connect_redis(&cfg.backend.redis_url).await?;
                let op_timeout = cfg.worker.operation_timeout();
                Ok(Self {
                    stream: Arc::new(RedisStream::new(conn.clone(), op_timeout)),
                    store: Arc::new(RedisStore::new(conn, op_timeout)),
                })
            }
            BackendKind::Memory => Ok(Self::memory()),
        }
    }

    fn memory() -> Self {
        Self {
            stream: Arc::new(MemoryStream::new()),
            store: Arc::new(MemoryStore::new()),
        }
    }

    fn tracker(&self, cfg: &Config) -> SessionTracker {
        SessionTracker::new(Arc::clone(&self.store), cfg.session.ttls())
    }

    fn extraction_queue(&self, cfg: &Config) -> Option<ExtractionQueue> {
        cfg.extraction
            .enabled
            .then(|| ExtractionQueue::new(Arc::clone(&self.stream), &cfg.streams.extraction))
    }

    fn ingestor(&self, cfg: &Config) -> Ingestor {
        let config = IngestConfig {
            chunking: cfg.chunking.clone(),
            uploads_dir: cfg.paths.uploads.clone(),
            chunks_dir: cfg.paths.chunks.clone(),
            audio_input_topic: cfg.streams.audio_input.clone(),
            audio_chunks_topic: cfg.streams.audio_chunks.clone(),
        };
        Ingestor::new(self.tracker(cfg), Arc::clone(&self.stream), config)
    }

    fn reconciler(&self, cfg: &Config) -> CompletionReconciler {
        let config = ReconcilerConfig {
            interval: Duration::from_secs(cfg.reconciler.interval_secs.max(1)),
            max_chunks_per_tick: cfg.reconciler.max_chunks_per_tick,
            overlap_lookback_words: cfg.chunking.overlap_lookback_words,
        };
        CompletionReconciler::new(self.tracker(cfg), self.extraction_queue(cfg), config)
    }

    fn spawn_worker(
        &self,
        cfg: &Config,
        kind: WorkerKind,
        nats: &NatsClient,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Result<()>> {
        let tracker = self.tracker(cfg);
        let config = cfg.worker_config(kind);
        let stream = Arc::clone(&self.stream);

        match kind {
            WorkerKind::Direct => {
                let transcriber = Arc::new(NatsTranscriber::new(nats.clone()));
                let handler = DirectTranscriptionHandler::new(tracker, transcriber, self.extraction_queue(cfg));
                spawn_runtime(WorkerRuntime::new(stream, Arc::new(handler), config), shutdown)
            }
            WorkerKind::Chunk => {
                let transcriber = Arc::new(NatsTranscriber::new(nats.clone()));
                let handler = ChunkTranscriptionHandler::new(tracker, transcriber);
                spawn_runtime(WorkerRuntime::new(stream, Arc::new(handler), config), shutdown)
            }
            WorkerKind::Extraction => {
                let extractor = Arc::new(NatsExtractor::new(nats.clone()));
                let handler = ExtractionHandler::new(tracker, extractor);
                spawn_runtime(WorkerRuntime::new(stream, Arc::new(handler), config), shutdown)
            }
        }
    }
}

fn spawn_runtime<H: MessageHandler + 'static>(
    mut runtime: WorkerRuntime<H>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let stats = runtime.run(shutdown).await?;
        info!("Final worker stats: {:?}", stats);
        Ok(())
    })
}

/// Flips to `true` on SIGINT or SIGTERM
fn shutdown_signal() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    let signal_tx = tx.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received, finishing in-flight work");
        let _ = signal_tx.send(true);
    });

    (tx, rx)
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => Config::load(path, true)?,
        None => Config::load(DEFAULT_CONFIG_PATH, false)?,
    };

    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Worker { kind, no_reconciler } => run_worker(&cfg, kind, no_reconciler).await,
        Commands::Ingest { file, session_id } => {
            let backends = Backends::connect(&cfg).await?;
            let receipt = backends.ingestor(&cfg).ingest(&file, session_id).await?;
            print_json(&receipt)
        }
        Commands::Status { session_id } => {
            let backends = Backends::connect(&cfg).await?;
            match backends.tracker(&cfg).status(&session_id).await? {
                Some(view) => print_json(&view),
                None => bail!("Session {} not found", session_id),
            }
        }
        Commands::Stats => {
            let backends = Backends::connect(&cfg).await?;
            print_stats(&cfg, &backends).await
        }
        Commands::DeadLetters { topic, count } => {
            let backends = Backends::connect(&cfg).await?;
            let letters = list_dead_letters(
                backends.stream.as_ref(),
                &topic,
                &cfg.streams.dead_letter_suffix,
                count,
            )
            .await?;
            print_json(&letters)
        }
        Commands::Cleanup { session_id } => {
            let backends = Backends::connect(&cfg).await?;
            let report = backends.tracker(&cfg).cleanup(&session_id).await?;
            print_json(&report)
        }
        Commands::Reset { session_id } => {
            let backends = Backends::connect(&cfg).await?;
            let session = backends.tracker(&cfg).reset(&session_id).await?;
            print_json(&session)
        }
        Commands::Run { file, session_id } => run_local(&cfg, file, session_id).await,
    }
}

async fn run_worker(cfg: &Config, kind: WorkerKind, no_reconciler: bool) -> Result<()> {
    let backends = Backends::connect(cfg).await?;
    let nats = NatsClient::connect(&cfg.nats).await?;
    let (_tx, shutdown) = shutdown_signal();

    let reconciler = if kind == WorkerKind::Chunk && !no_reconciler {
        Some(tokio::spawn(backends.reconciler(cfg).run(shutdown.clone())))
    } else {
        None
    };

    let result = backends.spawn_worker(cfg, kind, &nats, shutdown).await?;

    if let Some(reconciler) = reconciler {
        // A fatal worker error leaves the reconciler running; stop it with the process
        if result.is_ok() {
            reconciler.await?;
        } else {
            reconciler.abort();
        }
    }

    if let Err(e) = &result {
        error!("Worker exited: {:#}", e);
    }
    result
}

async fn print_stats(cfg: &Config, backends: &Backends) -> Result<()> {
    let mut queues = serde_json::Map::new();
    for kind in [WorkerKind::Direct, WorkerKind::Chunk, WorkerKind::Extraction] {
        let (topic, group) = cfg.topic_and_group(kind);
        let dead_letters = format!("{}{}", topic, cfg.streams.dead_letter_suffix);

        queues.insert(
            topic.to_string(),
            serde_json::json!({
                "group": group,
                "length": backends.stream.len(topic).await?,
                "pending": backends.stream.pending(topic, group).await?.len(),
                "dead_letters": backends.stream.len(&dead_letters).await?,
            }),
        );
    }

    let sessions = backends.tracker(cfg).counts_by_status().await?;
    print_json(&serde_json::json!({ "queues": queues, "sessions": sessions }))
}

/// Ingest one file and run every worker plus the reconciler in this process
/// until the session (and its extraction) settles
async fn run_local(cfg: &Config, file: PathBuf, session_id: Option<String>) -> Result<()> {
    let backends = Backends::memory();
    let nats = NatsClient::connect(&cfg.nats).await?;
    let (tx, shutdown) = shutdown_signal();

    let mut tasks = Vec::new();
    for kind in [WorkerKind::Direct, WorkerKind::Chunk, WorkerKind::Extraction] {
        tasks.push(backends.spawn_worker(cfg, kind, &nats, shutdown.clone()));
    }
    let reconciler = tokio::spawn(backends.reconciler(cfg).run(shutdown.clone()));

    let receipt = backends.ingestor(cfg).ingest(&file, session_id).await?;
    info!("Ingested {} as session {}", file.display(), receipt.session_id);

    let tracker = backends.tracker(cfg);
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut interrupted = shutdown.clone();
    let view = loop {
        tokio::select! {
            _ = interrupted.changed() => break None,
            _ = ticker.tick() => {
                let Some(view) = tracker.status(&receipt.session_id).await? else {
                    bail!("Session {} disappeared", receipt.session_id);
                };
                let extraction_settled = !cfg.extraction.enabled
                    || view.session.status.is_terminal() && view.session.result.is_none()
                    || matches!(
                        view.session.extraction_status.as_deref(),
                        Some("completed" | "skipped" | "error")
                    );
                if view.session.status.is_terminal() && extraction_settled {
                    break Some(view);
                }
            }
        }
    };

    let _ = tx.send(true);
    for task in tasks {
        if let Err(e) = task.await? {
            warn!("Worker stopped with error: {:#}", e);
        }
    }
    reconciler.await?;

    match view {
        Some(view) => print_json(&view),
        None => bail!("Interrupted before session {} settled", receipt.session_id),
    }
}
