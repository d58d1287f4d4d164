//! Generic consumer-group worker
//!
//! A [`WorkerRuntime`] owns delivery guarantees only: it reads messages,
//! hands them to a [`MessageHandler`], acknowledges, leaves failures pending
//! for redelivery, reclaims entries abandoned by crashed workers and moves
//! messages that exhausted their retries to a dead-letter topic.

mod dead_letter;
mod handler;
mod runtime;

pub use dead_letter::{dead_letter_payload, dead_letter_topic, list_dead_letters, DeadLetter};
pub use handler::{HandlerOutcome, MessageHandler};
pub use runtime::{WorkerConfig, WorkerRuntime, WorkerStats};
