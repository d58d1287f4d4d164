// Integration tests for the consumer-group worker runtime
//
// These tests drive a WorkerRuntime over the in-memory stream with
// scripted handlers and verify acknowledgement, retry through the
// recovery pass, dead-lettering and the consecutive error limit.

use anyhow::{bail, Result};
use scribe_stream::store::fields;
use scribe_stream::stream::{DurableStream, MemoryStream, Payload, PendingEntry, StreamMessage};
use scribe_stream::worker::{list_dead_letters, HandlerOutcome, MessageHandler, WorkerConfig, WorkerRuntime};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

const TOPIC: &str = "audio_chunks";
const GROUP: &str = "chunk_processors";

/// Returns the same outcome for every message and records what it saw
struct ScriptedHandler {
    outcome: HandlerOutcome,
    calls: AtomicUsize,
    retry_counts: Mutex<Vec<u32>>,
    dead_letters: Mutex<Vec<String>>,
}

impl ScriptedHandler {
    fn new(outcome: HandlerOutcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            calls: AtomicUsize::new(0),
            retry_counts: Mutex::new(Vec::new()),
            dead_letters: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(&self, message: &StreamMessage) -> HandlerOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.retry_counts.lock().unwrap().push(message.retry_count);
        self.outcome.clone()
    }

    async fn on_dead_letter(&self, message: &StreamMessage, reason: &str) -> Result<()> {
        self.dead_letters
            .lock()
            .unwrap()
            .push(format!("{}: {}", message.id, reason));
        Ok(())
    }
}

/// A stream whose reads always fail
struct BrokenStream;

#[async_trait::async_trait]
impl DurableStream for BrokenStream {
    async fn append(&self, _topic: &str, _payload: &Payload) -> Result<String> {
        bail!("connection refused")
    }

    async fn ensure_group(&self, _topic: &str, _group: &str) -> Result<()> {
        Ok(())
    }

    async fn read(
        &self,
        _topic: &str,
        _group: &str,
        _consumer: &str,
        _max_count: usize,
        _block: Duration,
    ) -> Result<Vec<StreamMessage>> {
        bail!("connection refused")
    }

    async fn acknowledge(&self, _topic: &str, _group: &str, _id: &str) -> Result<()> {
        bail!("connection refused")
    }

    async fn pending(&self, _topic: &str, _group: &str) -> Result<Vec<PendingEntry>> {
        Ok(Vec::new())
    }

    async fn claim(
        &self,
        _topic: &str,
        _group: &str,
        _consumer: &str,
        _id: &str,
        _min_idle: Duration,
    ) -> Result<Option<StreamMessage>> {
        Ok(None)
    }

    async fn len(&self, _topic: &str) -> Result<usize> {
        Ok(0)
    }

    async fn range(&self, _topic: &str, _count: usize) -> Result<Vec<StreamMessage>> {
        Ok(Vec::new())
    }
}

fn fast_config(consumer: &str) -> WorkerConfig {
    let mut config = WorkerConfig::new(TOPIC, GROUP, consumer);
    config.block_timeout = Duration::from_millis(20);
    config.stuck_threshold = Duration::from_millis(30);
    config.heartbeat_interval = Duration::from_millis(40);
    config.max_retries = 3;
    config
}

fn chunk_job(chunk_id: &str) -> Payload {
    fields([("type", "chunk"), ("session_id", "s1"), ("chunk_id", chunk_id)])
}

/// Poll `check` every 10ms for up to 5 seconds
async fn wait_for<F, Fut>(mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    for _ in 0..500 {
        if check().await? {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("condition not reached in time")
}

#[tokio::test]
async fn test_completed_messages_are_acknowledged() -> Result<()> {
    let stream = Arc::new(MemoryStream::new());
    let handler = ScriptedHandler::new(HandlerOutcome::Completed);
    let mut runtime = WorkerRuntime::new(stream.clone(), handler.clone(), fast_config("worker-1"));

    stream.append(TOPIC, &chunk_job("s1-chunk-000")).await?;
    stream.append(TOPIC, &chunk_job("s1-chunk-001")).await?;

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(async move { runtime.run(rx).await });

    wait_for(|| {
        let handler = handler.clone();
        async move { Ok(handler.calls.load(Ordering::SeqCst) == 2) }
    })
    .await?;

    tx.send(true)?;
    let stats = task.await??;

    assert_eq!(stats.processed, 2);
    assert_eq!(stats.dead_lettered, 0);
    assert!(stream.pending(TOPIC, GROUP).await?.is_empty(), "Completed messages must be acknowledged");
    assert_eq!(stream.len("audio_chunks:dead_letter").await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_rejected_messages_are_acknowledged_without_retry() -> Result<()> {
    let stream = Arc::new(MemoryStream::new());
    let handler = ScriptedHandler::new(HandlerOutcome::rejected("Chunk file not found"));
    let mut runtime = WorkerRuntime::new(stream.clone(), handler.clone(), fast_config("worker-1"));

    stream.append(TOPIC, &chunk_job("s1-chunk-000")).await?;

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(async move { runtime.run(rx).await });

    wait_for(|| {
        let handler = handler.clone();
        async move { Ok(handler.calls.load(Ordering::SeqCst) >= 1) }
    })
    .await?;
    // Leave room for a recovery pass that must find nothing
    tokio::time::sleep(Duration::from_millis(100)).await;

    tx.send(true)?;
    let stats = task.await??;

    assert_eq!(stats.rejected, 1);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert!(stream.pending(TOPIC, GROUP).await?.is_empty());
    assert_eq!(stream.len("audio_chunks:dead_letter").await?, 0);
    assert!(handler.dead_letters.lock().unwrap().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_failing_message_is_retried_then_dead_lettered_once() -> Result<()> {
    let stream = Arc::new(MemoryStream::new());
    let handler = ScriptedHandler::new(HandlerOutcome::retry("stt unavailable"));
    let mut runtime = WorkerRuntime::new(stream.clone(), handler.clone(), fast_config("worker-1"));

    let id = stream.append(TOPIC, &chunk_job("s1-chunk-000")).await?;

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(async move { runtime.run(rx).await });

    let dlq_stream = stream.clone();
    wait_for(|| {
        let stream = dlq_stream.clone();
        async move { Ok(stream.len("audio_chunks:dead_letter").await? == 1) }
    })
    .await?;
    // A few more heartbeats must not dead-letter it again
    tokio::time::sleep(Duration::from_millis(150)).await;

    tx.send(true)?;
    let stats = task.await??;

    assert_eq!(*handler.retry_counts.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.recovered, 2);

    assert!(
        stream.pending(TOPIC, GROUP).await?.is_empty(),
        "Dead-lettered message must leave the pending list"
    );
    assert_eq!(stream.len("audio_chunks:dead_letter").await?, 1);

    let letters = list_dead_letters(stream.as_ref(), TOPIC, ":dead_letter", 10).await?;
    assert_eq!(letters.len(), 1);
    let letter = &letters[0];
    assert_eq!(letter.original_message_id, id);
    assert_eq!(letter.original_topic, TOPIC);
    assert_eq!(letter.error, "stt unavailable");
    assert_eq!(letter.retry_count, 2);
    assert_eq!(letter.payload.get("chunk_id").map(String::as_str), Some("s1-chunk-000"));
    assert!(!letter.failed_at.is_empty());

    let recorded = handler.dead_letters.lock().unwrap().clone();
    assert_eq!(recorded, vec![format!("{}: stt unavailable", id)]);

    Ok(())
}

#[tokio::test]
async fn test_recovery_takes_over_abandoned_messages() -> Result<()> {
    let stream = Arc::new(MemoryStream::new());
    stream.ensure_group(TOPIC, GROUP).await?;
    stream.append(TOPIC, &chunk_job("s1-chunk-000")).await?;

    // A worker that read the message and then crashed
    let abandoned = stream
        .read(TOPIC, GROUP, "crashed-worker", 1, Duration::ZERO)
        .await?;
    assert_eq!(abandoned.len(), 1);

    tokio::time::sleep(Duration::from_millis(40)).await;

    let handler = ScriptedHandler::new(HandlerOutcome::Completed);
    let mut runtime = WorkerRuntime::new(stream.clone(), handler.clone(), fast_config("worker-2"));

    let reclaimed = runtime.recover().await?;
    assert_eq!(reclaimed, 1);
    assert_eq!(*handler.retry_counts.lock().unwrap(), vec![1]);
    assert_eq!(runtime.stats().processed, 1);
    assert!(stream.pending(TOPIC, GROUP).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_recovery_dead_letters_exhausted_messages() -> Result<()> {
    let stream = Arc::new(MemoryStream::new());
    stream.ensure_group(TOPIC, GROUP).await?;
    let id = stream.append(TOPIC, &chunk_job("s1-chunk-000")).await?;

    // Three deliveries, none acknowledged
    stream.read(TOPIC, GROUP, "crashed-1", 1, Duration::ZERO).await?;
    for consumer in ["crashed-2", "crashed-3"] {
        tokio::time::sleep(Duration::from_millis(40)).await;
        stream
            .claim(TOPIC, GROUP, consumer, &id, Duration::from_millis(30))
            .await?;
    }
    tokio::time::sleep(Duration::from_millis(40)).await;

    let handler = ScriptedHandler::new(HandlerOutcome::Completed);
    let mut runtime = WorkerRuntime::new(stream.clone(), handler.clone(), fast_config("worker-4"));

    runtime.recover().await?;

    assert_eq!(handler.calls.load(Ordering::SeqCst), 0, "Exhausted message must not be handled again");
    assert_eq!(runtime.stats().dead_lettered, 1);
    assert!(stream.pending(TOPIC, GROUP).await?.is_empty());

    let letters = list_dead_letters(stream.as_ref(), TOPIC, ":dead_letter", 10).await?;
    assert_eq!(letters[0].error, "max retries exceeded");
    assert_eq!(letters[0].retry_count, 3);

    Ok(())
}

#[tokio::test]
async fn test_concurrent_workers_recover_each_message_once() -> Result<()> {
    let stream = Arc::new(MemoryStream::new());
    stream.ensure_group(TOPIC, GROUP).await?;
    let exhausted = stream.append(TOPIC, &chunk_job("s1-chunk-000")).await?;
    stream.append(TOPIC, &chunk_job("s1-chunk-001")).await?;

    // The first message has used up its deliveries, the second was read once
    stream.read(TOPIC, GROUP, "crashed-1", 1, Duration::ZERO).await?;
    for consumer in ["crashed-2", "crashed-3"] {
        tokio::time::sleep(Duration::from_millis(40)).await;
        stream
            .claim(TOPIC, GROUP, consumer, &exhausted, Duration::from_millis(30))
            .await?;
    }
    stream.read(TOPIC, GROUP, "crashed-4", 1, Duration::ZERO).await?;
    tokio::time::sleep(Duration::from_millis(40)).await;

    // Both workers share one handler so dispatches are counted together
    let handler = ScriptedHandler::new(HandlerOutcome::Completed);
    let (tx, rx) = watch::channel(false);
    let mut tasks = Vec::new();
    for consumer in ["worker-a", "worker-b"] {
        let mut runtime = WorkerRuntime::new(stream.clone(), handler.clone(), fast_config(consumer));
        let rx = rx.clone();
        tasks.push(tokio::spawn(async move { runtime.run(rx).await }));
    }

    let seen = handler.clone();
    wait_for(|| {
        let seen = seen.clone();
        async move {
            Ok(seen.calls.load(Ordering::SeqCst) == 1 && seen.dead_letters.lock().unwrap().len() == 1)
        }
    })
    .await?;

    // Several more heartbeats, each running a recovery pass on both workers
    tokio::time::sleep(Duration::from_millis(150)).await;
    tx.send(true)?;

    let mut recovered = 0;
    for task in tasks {
        let stats = tokio::time::timeout(Duration::from_secs(2), task).await???;
        recovered += stats.recovered;
    }

    assert_eq!(handler.calls.load(Ordering::SeqCst), 1, "Abandoned message handled exactly once");
    assert_eq!(handler.dead_letters.lock().unwrap().len(), 1);
    assert_eq!(stream.len("audio_chunks:dead_letter").await?, 1);
    assert_eq!(recovered, 2, "Each stuck message is claimed by one worker only");
    assert!(stream.pending(TOPIC, GROUP).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_worker_exits_after_consecutive_infra_errors() -> Result<()> {
    let handler = ScriptedHandler::new(HandlerOutcome::Completed);
    let mut config = fast_config("worker-1");
    config.max_consecutive_errors = 3;
    let mut runtime = WorkerRuntime::new(Arc::new(BrokenStream), handler, config);

    let (_tx, rx) = watch::channel(false);
    let result = tokio::time::timeout(Duration::from_secs(5), runtime.run(rx)).await?;

    let err = result.unwrap_err();
    assert!(err.to_string().contains("3 consecutive errors"), "unexpected error: {}", err);
    assert_eq!(runtime.stats().infra_errors, 3);

    Ok(())
}

#[tokio::test]
async fn test_shutdown_stops_idle_worker() -> Result<()> {
    let stream = Arc::new(MemoryStream::new());
    let handler = ScriptedHandler::new(HandlerOutcome::Completed);
    let mut runtime = WorkerRuntime::new(stream, handler, fast_config("worker-1"));

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(async move { runtime.run(rx).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true)?;

    let stats = tokio::time::timeout(Duration::from_secs(2), task).await???;
    assert_eq!(stats.processed, 0);

    Ok(())
}
