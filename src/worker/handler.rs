use crate::stream::StreamMessage;
use anyhow::Result;

/// Result of handling one message, as seen by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Work done (or already done). The message is acknowledged.
    Completed,

    /// Transient failure. The message stays pending and is redelivered by the
    /// recovery pass until the retry budget is spent, then dead-lettered.
    Retry { reason: String },

    /// The input can never succeed (missing or unreadable artifact). The
    /// handler has already recorded the failure on the session; the message
    /// is acknowledged without retry.
    Rejected { reason: String },
}

impl HandlerOutcome {
    pub fn retry(reason: impl Into<String>) -> Self {
        HandlerOutcome::Retry { reason: reason.into() }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        HandlerOutcome::Rejected { reason: reason.into() }
    }
}

/// Pluggable message handler driven by [`WorkerRuntime`](super::WorkerRuntime)
///
/// Handlers turn every failure into an outcome (and, where it is final, a
/// session status update); nothing they do may take the worker down.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &StreamMessage) -> HandlerOutcome;

    /// Called once a message has been moved to the dead-letter topic
    async fn on_dead_letter(&self, _message: &StreamMessage, _reason: &str) -> Result<()> {
        Ok(())
    }
}
