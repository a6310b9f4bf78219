//! In-memory stand-ins for the broker, used by unit tests.

use crate::error::WorkerError;
use crate::message::{Acknowledge, WorkMessage};
use crate::publisher::{OutboundReply, ReplySink};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct SettleLog {
    acks: AtomicUsize,
    requeued: AtomicUsize,
    dead_lettered: AtomicUsize,
}

impl SettleLog {
    pub fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn requeued(&self) -> usize {
        self.requeued.load(Ordering::SeqCst)
    }

    pub fn dead_lettered(&self) -> usize {
        self.dead_lettered.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.acks() + self.requeued() + self.dead_lettered()
    }
}

pub struct RecordingAcker {
    log: Arc<SettleLog>,
}

impl RecordingAcker {
    pub fn new() -> (Self, Arc<SettleLog>) {
        let log = Arc::new(SettleLog::default());
        (Self { log: log.clone() }, log)
    }

    pub fn with_log(log: Arc<SettleLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl Acknowledge for RecordingAcker {
    async fn ack(&self) -> Result<(), WorkerError> {
        self.log.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), WorkerError> {
        if requeue {
            self.log.requeued.fetch_add(1, Ordering::SeqCst);
        } else {
            self.log.dead_lettered.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Reply sink that records everything it is asked to send.
#[derive(Default)]
pub struct MemorySink {
    sent: Mutex<Vec<OutboundReply>>,
    fail: AtomicBool,
}

impl MemorySink {
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.fail.store(true, Ordering::SeqCst);
        sink
    }

    pub fn sent(&self) -> Vec<OutboundReply> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplySink for MemorySink {
    async fn send(&self, reply: OutboundReply) -> Result<(), WorkerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(WorkerError::Publish {
                reply_to: reply.reply_to,
                reason: "broker unavailable".into(),
            });
        }
        self.sent.lock().unwrap().push(reply);
        Ok(())
    }
}

pub fn message(
    payload: &[u8],
    reply_to: Option<&str>,
    correlation_id: Option<&str>,
    delivery_tag: u64,
    redelivered: bool,
    log: &Arc<SettleLog>,
) -> WorkMessage {
    WorkMessage::new(
        payload.to_vec(),
        reply_to.map(str::to_string),
        correlation_id.map(str::to_string),
        delivery_tag,
        redelivered,
        Box::new(RecordingAcker::with_log(log.clone())),
    )
}
