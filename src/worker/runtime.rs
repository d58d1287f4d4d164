use super::dead_letter::dead_letter_payload;
use super::handler::{HandlerOutcome, MessageHandler};
use crate::stream::{DurableStream, StreamMessage};
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Configuration for one consumer-group worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub topic: String,
    pub group: String,

    /// Consumer name within the group, unique per worker process
    pub consumer: String,

    pub dead_letter_topic: String,

    /// How long one read waits for new messages
    pub block_timeout: Duration,

    /// Messages fetched per read
    pub batch_size: usize,

    /// Deliveries a message gets before it is dead-lettered (default: 3)
    pub max_retries: u32,

    /// Pending entries idle this long are reclaimed (default: 5 minutes)
    pub stuck_threshold: Duration,

    pub heartbeat_interval: Duration,

    /// Consecutive infrastructure errors before the worker gives up (default: 5)
    pub max_consecutive_errors: u32,

    /// Upper bound on one handler invocation
    pub handler_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(topic: &str, group: &str, consumer: &str) -> Self {
        Self {
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            dead_letter_topic: super::dead_letter_topic(topic, ":dead_letter"),
            block_timeout: Duration::from_millis(1000),
            batch_size: 1,
            max_retries: 3,
            stuck_threshold: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            max_consecutive_errors: 5,
            handler_timeout: Duration::from_secs(900),
        }
    }
}

/// Counters reported on every heartbeat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Messages handled and acknowledged
    pub processed: u64,

    /// Handler failures left pending for redelivery
    pub retried: u64,

    /// Messages acknowledged after the handler rejected their input
    pub rejected: u64,

    pub dead_lettered: u64,

    /// Pending entries reclaimed from stuck consumers
    pub recovered: u64,

    pub infra_errors: u64,
}

/// Consumer-group loop: read, dispatch, acknowledge, retry, dead-letter
///
/// Delivery bookkeeping lives entirely in the stream: a failed message is
/// simply left unacknowledged and comes back through the recovery pass
/// (on start and on every heartbeat) once it has been idle for
/// `stuck_threshold`. The stream's delivery counter is the retry counter.
pub struct WorkerRuntime<H: MessageHandler> {
    stream: Arc<dyn DurableStream>,
    handler: Arc<H>,
    config: WorkerConfig,
    stats: WorkerStats,
    consecutive_errors: u32,
}

impl<H: MessageHandler> WorkerRuntime<H> {
    pub fn new(stream: Arc<dyn DurableStream>, handler: Arc<H>, config: WorkerConfig) -> Self {
        Self {
            stream,
            handler,
            config,
            stats: WorkerStats::default(),
            consecutive_errors: 0,
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// A message already being handled is finished before returning. Fails
    /// after `max_consecutive_errors` infrastructure errors in a row so a
    /// supervisor can restart the process.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<WorkerStats> {
        info!(
            "Starting worker {} on {} (group {})",
            self.config.consumer, self.config.topic, self.config.group
        );

        self.stream.ensure_group(&self.config.topic, &self.config.group).await?;

        if let Err(e) = self.recover().await {
            self.infra_error(e)?;
        }

        let stream = Arc::clone(&self.stream);
        let topic = self.config.topic.clone();
        let group = self.config.group.clone();
        let consumer = self.config.consumer.clone();
        let batch_size = self.config.batch_size;
        let block = self.config.block_timeout;

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    info!(
                        "Worker {} heartbeat: processed={} retried={} rejected={} dead_lettered={} recovered={} infra_errors={}",
                        consumer,
                        self.stats.processed,
                        self.stats.retried,
                        self.stats.rejected,
                        self.stats.dead_lettered,
                        self.stats.recovered,
                        self.stats.infra_errors
                    );
                    if let Err(e) = self.recover().await {
                        self.infra_error(e)?;
                        self.backoff().await;
                    }
                }
                read = stream.read(&topic, &group, &consumer, batch_size, block) => {
                    match read {
                        Ok(messages) => {
                            self.consecutive_errors = 0;
                            for message in messages {
                                match self.process(message).await {
                                    Ok(()) => self.consecutive_errors = 0,
                                    Err(e) => {
                                        self.infra_error(e)?;
                                        self.backoff().await;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            self.infra_error(e)?;
                            self.backoff().await;
                        }
                    }
                }
            }
        }

        info!(
            "Worker {} stopped: processed={} dead_lettered={}",
            self.config.consumer, self.stats.processed, self.stats.dead_lettered
        );
        Ok(self.stats)
    }

    /// Reclaim pending entries idle past the stuck threshold and dispatch
    /// them again, dead-lettering those that used up their retries.
    /// Returns how many entries this worker reclaimed.
    pub async fn recover(&mut self) -> Result<usize> {
        let pending = self.stream.pending(&self.config.topic, &self.config.group).await?;
        let mut reclaimed = 0;

        for entry in pending {
            if entry.idle < self.config.stuck_threshold {
                continue;
            }

            let claimed = self
                .stream
                .claim(
                    &self.config.topic,
                    &self.config.group,
                    &self.config.consumer,
                    &entry.id,
                    self.config.stuck_threshold,
                )
                .await?;

            // Another worker got it first
            let Some(message) = claimed else {
                continue;
            };

            reclaimed += 1;
            self.stats.recovered += 1;
            info!(
                "Reclaimed {} from {} (idle {:?}, retry {})",
                message.id, entry.consumer, entry.idle, message.retry_count
            );

            if message.retry_count >= self.config.max_retries {
                self.dead_letter(&message, "max retries exceeded").await?;
            } else {
                self.process(message).await?;
            }
        }

        if reclaimed > 0 {
            info!("Recovered {} stuck messages on {}", reclaimed, self.config.topic);
        }
        Ok(reclaimed)
    }

    /// Dispatch one message and settle its delivery. Errors are
    /// infrastructure failures (stream unreachable), never handler failures.
    async fn process(&mut self, message: StreamMessage) -> Result<()> {
        debug!("Dispatching {} (retry {})", message.id, message.retry_count);

        let outcome = match tokio::time::timeout(self.config.handler_timeout, self.handler.handle(&message)).await {
            Ok(outcome) => outcome,
            Err(_) => HandlerOutcome::retry(format!(
                "handler timed out after {:?}",
                self.config.handler_timeout
            )),
        };

        match outcome {
            HandlerOutcome::Completed => {
                self.acknowledge(&message).await?;
                self.stats.processed += 1;
            }
            HandlerOutcome::Rejected { reason } => {
                warn!("Rejected {}: {}", message.id, reason);
                self.acknowledge(&message).await?;
                self.stats.rejected += 1;
            }
            HandlerOutcome::Retry { reason } => {
                if message.retry_count + 1 >= self.config.max_retries {
                    self.dead_letter(&message, &reason).await?;
                } else {
                    warn!(
                        "Message {} failed (attempt {}/{}), left pending for retry: {}",
                        message.id,
                        message.retry_count + 1,
                        self.config.max_retries,
                        reason
                    );
                    self.stats.retried += 1;
                }
            }
        }

        Ok(())
    }

    /// Copy to the dead-letter topic, acknowledge the original, then let the
    /// handler record the failure
    async fn dead_letter(&mut self, message: &StreamMessage, reason: &str) -> Result<()> {
        let payload = dead_letter_payload(message, reason, Utc::now());
        let id = self.stream.append(&self.config.dead_letter_topic, &payload).await?;
        self.acknowledge(message).await?;
        self.stats.dead_lettered += 1;

        error!(
            "Dead-lettered {} to {} as {} after {} retries: {}",
            message.id, self.config.dead_letter_topic, id, message.retry_count, reason
        );

        if let Err(e) = self.handler.on_dead_letter(message, reason).await {
            warn!("Failed to record dead letter of {}: {:#}", message.id, e);
        }
        Ok(())
    }

    async fn acknowledge(&self, message: &StreamMessage) -> Result<()> {
        self.stream
            .acknowledge(&self.config.topic, &self.config.group, &message.id)
            .await
    }

    fn infra_error(&mut self, e: anyhow::Error) -> Result<()> {
        self.consecutive_errors += 1;
        self.stats.infra_errors += 1;
        error!(
            "Worker {} infrastructure error ({}/{}): {:#}",
            self.config.consumer, self.consecutive_errors, self.config.max_consecutive_errors, e
        );

        if self.consecutive_errors >= self.config.max_consecutive_errors {
            return Err(anyhow!(
                "worker {} giving up after {} consecutive errors: {:#}",
                self.config.consumer,
                self.consecutive_errors,
                e
            ));
        }
        Ok(())
    }

    async fn backoff(&self) {
        let delay = Duration::from_millis(200 * u64::from(self.consecutive_errors.min(10)));
        tokio::time::sleep(delay).await;
    }
}
