//! Dead-letter topology for rejected work packages.
//!
//! Messages rejected without requeue are routed by the broker through
//! `<queue>_dlx` into `<queue>_dlq`, so dead-lettering is atomic with the
//! reject itself.

use crate::error::WorkerError;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    Channel, ExchangeKind,
};

/// Defines the names for the dead-letter infrastructure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DlxNames {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl DlxNames {
    pub fn new(base_name: &str) -> Self {
        Self {
            exchange: format!("{}_dlx", base_name),
            queue: format!("{}_dlq", base_name),
            routing_key: format!("{}.failed", base_name),
        }
    }

    /// Arguments the work queue needs so that rejected messages land in the DLQ.
    pub fn queue_arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(self.exchange.clone().into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(self.routing_key.clone().into()),
        );
        args
    }

    /// Declares the DLX exchange and the DLQ, and binds them.
    pub async fn declare(&self, channel: &Channel) -> Result<(), WorkerError> {
        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|source| WorkerError::QueueDeclare { queue: self.exchange.clone(), source })?;

        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|source| WorkerError::QueueDeclare { queue: self.queue.clone(), source })?;

        channel
            .queue_bind(
                &self.queue,
                &self.exchange,
                &self.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        log::info!(target: "amqp", "Dead-letter queue '{}' bound to exchange '{}'.", self.queue, self.exchange);
        Ok(())
    }
}
