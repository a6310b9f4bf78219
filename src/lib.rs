//! # RabbitMQ RPC Worker
//! A worker runtime for RPC over RabbitMQ: consumes a durable work queue,
//! runs a handler with bounded concurrency, replies to `reply_to` with the
//! request's correlation id and acknowledges only after the reply is confirmed.

pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod dlq;
pub mod error;
pub mod handler;
pub mod message;
pub mod publisher;
pub mod retry;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export key components for easy access
pub use channel::WorkChannel;
pub use config::{QueueSettings, WorkerConfig};
pub use connection::{BrokerConnection, ConnectionState};
pub use dispatch::{DispatchLoop, DispatchRules, LoopExit, Settlement};
pub use error::{ConfigError, WorkerError};
pub use handler::{JsonHandler, MessageHandler, PayloadHandler};
pub use message::{PendingCount, WorkMessage, WorkResult};
pub use publisher::{ChannelReplySink, PublishOutcome, ReplyChannel, ReplyPublisher, ReplySink};
pub use retry::{FailurePolicy, ReconnectPolicy};
pub use worker::{shutdown_on_ctrl_c, RuntimePhase, ServiceRuntime};
