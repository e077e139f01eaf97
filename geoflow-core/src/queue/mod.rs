//! The Queue Transport contract (spec.md section 4.2): at-least-once
//! delivery of `JobMessage`/`TaskMessage` envelopes between the Submission
//! Gateway, Job Orchestrator, and Task Executor.
//!
//! A `Delivery<T>` is a received message plus the token needed to `ack` or
//! `nack` it — callers cannot accidentally forget which queue a message came
//! from, since the token is opaque.

pub mod postgres;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is empty")]
    Empty,
    #[error("delivery token not found or already acknowledged: {0}")]
    UnknownDelivery(String),
    #[error("durable backend error: {0}")]
    Durable(#[from] sqlx::Error),
}

/// A message received from a queue, with the token needed to settle it.
#[derive(Debug, Clone)]
pub struct Delivery<T> {
    pub payload: T,
    pub delivery_token: String,
    pub delivery_count: i32,
}

/// Transport for one logical queue of `T` (either `JobMessage` or
/// `TaskMessage`). Implementations own their own visibility-timeout and
/// dead-letter policy; callers only see `ack`/`nack`.
#[async_trait]
pub trait QueueTransport<T>: Send + Sync
where
    T: Send + Sync,
{
    async fn enqueue(&self, payload: T) -> Result<(), QueueError>;

    /// Enqueue a message that only becomes visible to receivers after
    /// `delay` has elapsed — used by the Retry/Failure Manager to schedule a
    /// backed-off re-delivery (spec.md section 4.7).
    async fn enqueue_delayed(&self, payload: T, delay: Duration) -> Result<(), QueueError>;

    /// Claim up to `max` currently-visible messages, making them invisible
    /// to other receivers until `ack`/`nack` or the visibility timeout
    /// elapses.
    async fn receive(&self, max: i64) -> Result<Vec<Delivery<T>>, QueueError>;

    /// Permanently remove a delivered message.
    async fn ack(&self, delivery_token: &str) -> Result<(), QueueError>;

    /// Return a message to the queue immediately (or dead-letter it once its
    /// delivery count exceeds the configured threshold).
    async fn nack(&self, delivery_token: &str) -> Result<(), QueueError>;

    /// Payloads currently parked in the dead-letter state, for the
    /// Janitor's dead-letter reconciliation sweep (spec.md 4.8.4).
    async fn list_dead_lettered(&self) -> Result<Vec<T>, QueueError>;
}
