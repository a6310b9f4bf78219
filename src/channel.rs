//! The work channel: queue declaration and message consumption.

use crate::config::QueueSettings;
use crate::connection::BrokerConnection;
use crate::dlq::DlxNames;
use crate::error::WorkerError;
use crate::message::{PendingCount, WorkMessage};
use futures_util::{Stream, StreamExt};
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    Channel,
};
use std::pin::Pin;
use std::time::Duration;

/// Inbound messages of one channel.
pub type WorkStream = Pin<Box<dyn Stream<Item = WorkMessage> + Send>>;

/// A consumption channel bound to the work queue.
pub struct WorkChannel {
    channel: Channel,
    settings: QueueSettings,
    pending: PendingCount,
}

impl WorkChannel {
    /// Opens a channel on `connection`, applies QoS, enables publisher
    /// confirms and declares the work queue.
    ///
    /// Declaration is idempotent for identical parameters. If the queue
    /// already exists with different ones the broker refuses it and
    /// [`WorkerError::QueueDeclare`] is returned.
    pub async fn open(connection: &BrokerConnection, settings: &QueueSettings) -> Result<Self, WorkerError> {
        let channel = connection.create_channel().await?;

        channel.on_error(|err| {
            log::error!(target: "amqp", "Channel error: {}", err);
        });

        channel
            .basic_qos(settings.prefetch_count, BasicQosOptions::default())
            .await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;

        let mut arguments = queue_arguments(settings);
        if settings.dead_letter {
            let names = DlxNames::new(&settings.queue_name);
            names.declare(&channel).await?;
            for (key, value) in names.queue_arguments().inner() {
                arguments.insert(key.clone(), value.clone());
            }
        }

        channel
            .queue_declare(
                &settings.queue_name,
                QueueDeclareOptions {
                    durable: settings.durable,
                    auto_delete: settings.auto_delete,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|source| {
                log::error!(
                    target: "amqp",
                    "Queue '{}' could not be declared. An existing queue with different arguments must be deleted first.",
                    settings.queue_name
                );
                WorkerError::QueueDeclare { queue: settings.queue_name.clone(), source }
            })?;

        log::info!(
            target: "amqp",
            "Queue '{}' declared (auto_delete: {}, ttl: {:?}, prefetch: {}).",
            settings.queue_name, settings.auto_delete, settings.message_ttl, settings.prefetch_count
        );

        Ok(Self {
            channel,
            settings: settings.clone(),
            pending: PendingCount::default(),
        })
    }

    /// Starts consuming with manual acknowledgment.
    ///
    /// The returned stream ends when the consumer fails or the channel
    /// closes. Open a new `WorkChannel` to resume.
    pub async fn consume(&self) -> Result<WorkStream, WorkerError> {
        let consumer = self
            .channel
            .basic_consume(
                &self.settings.queue_name,
                &self.settings.consumer_tag,
                BasicConsumeOptions { no_ack: false, ..Default::default() },
                FieldTable::default(),
            )
            .await?;

        log::info!(
            target: "amqp",
            "Worker is started on queue <{}> with tag '{}'.",
            self.settings.queue_name,
            consumer.tag().as_str()
        );

        let pending = self.pending.clone();
        let messages = consumer
            .take_while(|delivery| {
                if let Err(e) = delivery {
                    log::warn!(target: "amqp", "Consumer stopped: {}", e);
                }
                futures_util::future::ready(delivery.is_ok())
            })
            .filter_map(move |delivery| {
                futures_util::future::ready(delivery.ok().map(|d| WorkMessage::from_delivery(d, &pending)))
            });

        Ok(Box::pin(messages))
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    /// Messages consumed on this channel that are not settled yet.
    pub fn pending(&self) -> usize {
        self.pending.get()
    }

    /// Closes a channel the runtime has replaced. While it is still open,
    /// in-flight messages get up to `timeout` to settle on it first.
    pub async fn retire(self, timeout: Duration) {
        if !self.is_open() {
            return;
        }
        let unsettled = self.pending.wait_idle(timeout).await;
        if unsettled > 0 {
            log::warn!(
                target: "amqp",
                "Closing replaced channel with {} unsettled message(s); the broker will redeliver them.",
                unsettled
            );
        }
        self.close().await;
    }

    pub async fn close(&self) {
        if !self.is_open() {
            return;
        }
        if let Err(e) = self.channel.close(200, "worker shutdown").await {
            log::warn!(target: "amqp", "Error while closing channel: {}", e);
        } else {
            log::info!(target: "amqp", "Channel closed.");
        }
    }
}

/// Queue arguments derived from the settings. TTL is only set when non-zero.
pub fn queue_arguments(settings: &QueueSettings) -> FieldTable {
    let mut args = FieldTable::default();
    let ttl = settings.message_ttl.as_millis();
    if ttl > 0 {
        args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(ttl as i64));
    }
    args
}
