//! Inbound work messages and handler results.

use crate::error::WorkerError;
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Settles a delivery on the channel it arrived on.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), WorkerError>;

    /// Negatively acknowledges the delivery. With `requeue == false` the broker
    /// drops it or routes it to the queue's dead-letter exchange.
    async fn reject(&self, requeue: bool) -> Result<(), WorkerError>;
}

#[async_trait]
impl Acknowledge for Acker {
    async fn ack(&self) -> Result<(), WorkerError> {
        Acker::ack(self, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), WorkerError> {
        Acker::nack(self, BasicNackOptions { requeue, ..Default::default() }).await?;
        Ok(())
    }
}

/// Number of messages taken from one channel and not settled yet.
#[derive(Debug, Clone, Default)]
pub struct PendingCount {
    count: Arc<AtomicUsize>,
}

impl PendingCount {
    pub fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wraps `acker` so the message counts as pending until it is dropped.
    pub fn track<A: Acknowledge>(&self, acker: A) -> TrackedAcker<A> {
        self.count.fetch_add(1, Ordering::SeqCst);
        TrackedAcker { acker, count: self.count.clone() }
    }

    /// Waits until nothing is pending or `timeout` passes, returning the
    /// number of messages still pending.
    pub async fn wait_idle(&self, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let pending = self.get();
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if pending == 0 || left.is_zero() {
                return pending;
            }
            tokio::time::sleep(left.min(IDLE_CHECK_INTERVAL)).await;
        }
    }
}

/// An acker registered with a [`PendingCount`].
pub struct TrackedAcker<A> {
    acker: A,
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl<A: Acknowledge> Acknowledge for TrackedAcker<A> {
    async fn ack(&self) -> Result<(), WorkerError> {
        self.acker.ack().await
    }

    async fn reject(&self, requeue: bool) -> Result<(), WorkerError> {
        self.acker.reject(requeue).await
    }
}

impl<A> Drop for TrackedAcker<A> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A request taken off the work queue.
pub struct WorkMessage {
    pub payload: Vec<u8>,
    /// Destination for the reply. `None` for fire-and-forget requests.
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub delivery_tag: u64,
    /// Set by the broker when this message was delivered before.
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl WorkMessage {
    pub fn new(
        payload: Vec<u8>,
        reply_to: Option<String>,
        correlation_id: Option<String>,
        delivery_tag: u64,
        redelivered: bool,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            payload,
            reply_to: reply_to.filter(|r| !r.is_empty()),
            correlation_id,
            delivery_tag,
            redelivered,
            acker,
        }
    }

    /// Builds a message from a lapin delivery, counted in `pending` until
    /// the message is dropped.
    pub fn from_delivery(delivery: Delivery, pending: &PendingCount) -> Self {
        let reply_to = delivery.properties.reply_to().as_ref().map(|s| s.as_str().to_string());
        let correlation_id = delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_string());

        Self::new(
            delivery.data,
            reply_to,
            correlation_id,
            delivery.delivery_tag,
            delivery.redelivered,
            Box::new(pending.track(delivery.acker)),
        )
    }

    pub async fn ack(&self) -> Result<(), WorkerError> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), WorkerError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for WorkMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkMessage")
            .field("delivery_tag", &self.delivery_tag)
            .field("reply_to", &self.reply_to)
            .field("correlation_id", &self.correlation_id)
            .field("redelivered", &self.redelivered)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Outcome of a handler invocation, published back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkResult {
    Success(Vec<u8>),
    Failure(String),
}

impl WorkResult {
    pub fn is_success(&self) -> bool {
        matches!(self, WorkResult::Success(_))
    }
}
