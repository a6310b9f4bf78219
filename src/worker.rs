//! The service runtime tying connection, channel and dispatch together.

use crate::channel::WorkChannel;
use crate::config::WorkerConfig;
use crate::connection::BrokerConnection;
use crate::dispatch::{DispatchLoop, LoopExit};
use crate::error::WorkerError;
use crate::handler::{JsonHandler, MessageHandler, PayloadHandler};
use crate::publisher::{ChannelReplySink, ReplyPublisher};
use lapin::Channel;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Lifecycle phases of a [`ServiceRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimePhase {
    Initializing,
    Starting,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for RuntimePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A worker node: consumes the work queue, runs the handler and replies.
pub struct ServiceRuntime {
    config: WorkerConfig,
    handler: Arc<dyn PayloadHandler>,
    phase: watch::Sender<RuntimePhase>,
}

impl ServiceRuntime {
    /// Validates `config` and registers `handler`. No network activity happens
    /// here; configuration problems surface as [`WorkerError::Config`].
    pub fn new(config: WorkerConfig, handler: Arc<dyn PayloadHandler>) -> Result<Self, WorkerError> {
        let (phase, _) = watch::channel(RuntimePhase::Initializing);
        config.validate().map_err(|e| {
            log::error!(target: "service", "{}", e);
            e
        })?;

        Ok(Self { config, handler, phase })
    }

    /// Registers a typed JSON handler.
    pub fn with_message_handler<H>(config: WorkerConfig, handler: H) -> Result<Self, WorkerError>
    where
        H: MessageHandler + 'static,
    {
        Self::new(config, Arc::new(JsonHandler::new(handler)))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn phase(&self) -> RuntimePhase {
        *self.phase.borrow()
    }

    pub fn phase_receiver(&self) -> watch::Receiver<RuntimePhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, next: RuntimePhase) {
        let previous = self.phase.send_replace(next);
        if previous != next {
            log::info!(target: "service", "Runtime {} -> {}.", previous, next);
        }
    }

    /// Runs the worker until `shutdown` is cancelled or a fatal error occurs.
    ///
    /// On shutdown intake stops immediately, in-flight handlers get up to the
    /// drain timeout, then the channel and the connection are closed.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        self.set_phase(RuntimePhase::Starting);

        let mut connection = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                self.set_phase(RuntimePhase::Stopped);
                return Ok(());
            }
            connected = BrokerConnection::connect(&self.config) => match connected {
                Ok(connection) => connection,
                Err(e) => {
                    log::error!(target: "service", "Startup failed: {}", e);
                    self.set_phase(RuntimePhase::Stopped);
                    return Err(e);
                }
            },
        };

        let (channel_tx, channel_rx) = watch::channel::<Option<Channel>>(None);
        let publisher = Arc::new(ReplyPublisher::new(ChannelReplySink::new(
            channel_rx,
            self.config.reply_timeout,
        )));
        let mut dispatch = DispatchLoop::new(
            self.handler.clone(),
            publisher,
            self.config.dispatch_rules(),
            self.config.max_concurrency,
        );
        let mut current = None;
        let mut retiring = JoinSet::new();

        let outcome = self
            .serve(&mut connection, &mut dispatch, &channel_tx, &mut current, &mut retiring, &shutdown)
            .await;
        if let Err(e) = &outcome {
            log::error!(target: "service", "Fatal error, stopping worker: {}", e);
        }

        self.set_phase(RuntimePhase::Draining);
        let abandoned = dispatch.drain(self.config.drain_timeout).await;
        if abandoned > 0 {
            log::warn!(target: "service", "{} message(s) abandoned during drain.", abandoned);
        }

        channel_tx.send_replace(None);
        if let Some(channel) = current {
            channel.close().await;
        }
        while retiring.join_next().await.is_some() {}
        connection.close().await;

        self.set_phase(RuntimePhase::Stopped);
        outcome
    }

    /// The Starting/Running cycle. Returns `Ok` on shutdown and `Err` on fatal
    /// errors; reconnects whenever the dispatch loop reports a lost channel.
    async fn serve(
        &self,
        connection: &mut BrokerConnection,
        dispatch: &mut DispatchLoop<ChannelReplySink>,
        channel_tx: &watch::Sender<Option<Channel>>,
        current: &mut Option<WorkChannel>,
        retiring: &mut JoinSet<()>,
        shutdown: &CancellationToken,
    ) -> Result<(), WorkerError> {
        let settings = self.config.queue_settings();
        let mut failures = 0;

        loop {
            self.set_phase(RuntimePhase::Starting);
            while retiring.try_join_next().is_some() {}

            let opened = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                opened = async {
                    connection.reconnect().await?;
                    let channel = WorkChannel::open(connection, &settings).await?;
                    let inbound = channel.consume().await?;
                    Ok::<_, WorkerError>((channel, inbound))
                } => opened,
            };

            let (channel, inbound) = match opened {
                Ok(opened) => opened,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    failures += 1;
                    let Some(delay) = self.config.reconnect.delay_after(failures) else {
                        return Err(e);
                    };
                    log::warn!(target: "service", "Could not start consuming: {}. Retrying in {:?}.", e, delay);
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };
            failures = 0;

            channel_tx.send_replace(Some(channel.channel().clone()));
            *current = Some(channel);
            self.set_phase(RuntimePhase::Running);

            match dispatch.run(inbound, connection.state_receiver(), shutdown).await {
                LoopExit::Shutdown => {
                    log::info!(target: "service", "Shutdown requested, no longer accepting messages.");
                    return Ok(());
                }
                exit => {
                    log::warn!(
                        target: "service",
                        "Consumer interrupted ({:?}) with {} message(s) in flight; reconnecting.",
                        exit,
                        dispatch.in_flight()
                    );
                    channel_tx.send_replace(None);
                    if let Some(replaced) = current.take() {
                        retiring.spawn(replaced.retire(self.config.drain_timeout));
                    }
                }
            }
        }
    }
}

/// Returns a token cancelled on the first Ctrl+C.
pub fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!(target: "service", "Service manually stopped by ctrl+c.");
                trigger.cancel();
            }
            Err(e) => log::error!(target: "service", "Cannot listen for ctrl+c: {}", e),
        }
    });
    token
}
