//! Publishing handler results back to the requesting caller.

use crate::error::WorkerError;
use crate::message::WorkResult;
use async_trait::async_trait;
use chrono::Utc;
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel,
};
use serde_json::json;
use std::time::Duration;
use tokio::sync::watch;

/// A reply ready to go on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundReply {
    pub reply_to: String,
    pub correlation_id: Option<String>,
    pub body: Vec<u8>,
    pub is_error: bool,
}

/// Transport used by [`ReplyPublisher`].
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Sends `reply`, returning only once the broker has taken it.
    async fn send(&self, reply: OutboundReply) -> Result<(), WorkerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    /// No `reply_to` on the request, nothing to send.
    Skipped,
}

/// Serializes results and hands them to a [`ReplySink`].
pub struct ReplyPublisher<S> {
    sink: S,
}

impl<S: ReplySink> ReplyPublisher<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Publishes `result` to `reply_to`, echoing `correlation_id`.
    pub async fn publish(
        &self,
        reply_to: Option<&str>,
        correlation_id: Option<&str>,
        result: &WorkResult,
    ) -> Result<PublishOutcome, WorkerError> {
        let reply_to = match reply_to {
            Some(r) if !r.is_empty() => r,
            _ => return Ok(PublishOutcome::Skipped),
        };

        let (body, is_error) = match result {
            WorkResult::Success(bytes) => (bytes.clone(), false),
            WorkResult::Failure(reason) => {
                let body = json!({
                    "error": reason,
                    "failed_at": Utc::now(),
                });
                (serde_json::to_vec(&body)?, true)
            }
        };

        self.sink
            .send(OutboundReply {
                reply_to: reply_to.to_string(),
                correlation_id: correlation_id.map(str::to_string),
                body,
                is_error,
            })
            .await?;

        log::debug!(
            target: "reply",
            "Reply sent to '{}' (correlation id: {:?}).",
            reply_to, correlation_id
        );
        Ok(PublishOutcome::Sent)
    }
}

/// A channel replies can be published on.
#[async_trait]
pub trait ReplyChannel: Clone + Send + Sync + 'static {
    /// Whether publishing on this channel can currently succeed.
    fn is_usable(&self) -> bool;

    /// Publishes `reply` and waits for the broker's confirmation.
    async fn publish_reply(&self, reply: &OutboundReply) -> Result<(), WorkerError>;
}

#[async_trait]
impl ReplyChannel for Channel {
    fn is_usable(&self) -> bool {
        self.status().connected()
    }

    async fn publish_reply(&self, reply: &OutboundReply) -> Result<(), WorkerError> {
        let mut properties = BasicProperties::default().with_content_type("application/json".into());
        if let Some(id) = &reply.correlation_id {
            properties = properties.with_correlation_id(id.as_str().into());
        }
        if reply.is_error {
            let mut headers = FieldTable::default();
            headers.insert("x-worker-error".into(), AMQPValue::Boolean(true));
            properties = properties.with_headers(headers);
        }

        let confirmation = self
            .basic_publish(
                "",
                &reply.reply_to,
                BasicPublishOptions::default(),
                &reply.body,
                properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(WorkerError::Publish {
                reply_to: reply.reply_to.clone(),
                reason: "broker nacked the reply".into(),
            });
        }
        Ok(())
    }
}

/// Publishes replies on whichever channel the runtime currently has open.
///
/// The runtime swaps the channel after a reconnect. A reply produced while
/// no channel is usable waits up to `wait` for the next one.
#[derive(Clone)]
pub struct ChannelReplySink<C = Channel> {
    current: watch::Receiver<Option<C>>,
    wait: Duration,
}

impl<C: ReplyChannel> ChannelReplySink<C> {
    pub fn new(current: watch::Receiver<Option<C>>, wait: Duration) -> Self {
        Self { current, wait }
    }

    async fn usable_channel(&self, reply_to: &str) -> Result<C, WorkerError> {
        let mut current = self.current.clone();
        let ready = tokio::time::timeout(
            self.wait,
            current.wait_for(|channel| channel.as_ref().is_some_and(|c| c.is_usable())),
        )
        .await;

        match ready {
            Ok(Ok(channel)) => channel.clone().ok_or_else(|| WorkerError::Publish {
                reply_to: reply_to.to_string(),
                reason: "no channel available".into(),
            }),
            Ok(Err(_)) => Err(WorkerError::Publish {
                reply_to: reply_to.to_string(),
                reason: "runtime stopped".into(),
            }),
            Err(_) => Err(WorkerError::Publish {
                reply_to: reply_to.to_string(),
                reason: format!("no usable channel within {:?}", self.wait),
            }),
        }
    }
}

#[async_trait]
impl<C: ReplyChannel> ReplySink for ChannelReplySink<C> {
    async fn send(&self, reply: OutboundReply) -> Result<(), WorkerError> {
        let channel = self.usable_channel(&reply.reply_to).await?;
        channel.publish_reply(&reply).await
    }
}
