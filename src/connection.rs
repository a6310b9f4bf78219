//! Broker connection lifecycle.

use crate::config::{WorkerConfig, HEARTBEAT_SECS};
use crate::error::{ConfigError, WorkerError};
use crate::retry::ReconnectPolicy;
use lapin::{
    uri::{AMQPUri, AMQPUserInfo},
    Channel, Connection, ConnectionProperties,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Observable state of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Publishes state transitions to watchers and logs each one.
#[derive(Clone)]
struct StateCell {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl StateCell {
    fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx: Arc::new(tx) }
    }

    fn set(&self, next: ConnectionState) {
        let previous = self.tx.send_replace(next);
        if previous != next {
            log::info!(target: "amqp", "Connection state {} -> {}.", previous, next);
        }
    }

    fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }
}

/// Owns the single AMQP connection of a worker node.
pub struct BrokerConnection {
    uri: AMQPUri,
    policy: ReconnectPolicy,
    state: StateCell,
    connection: Connection,
}

impl BrokerConnection {
    /// Validates `config` and connects, retrying with backoff up to the
    /// configured number of attempts.
    pub async fn connect(config: &WorkerConfig) -> Result<Self, WorkerError> {
        config.validate()?;
        let uri = broker_uri(config)?;
        let state = StateCell::new();
        let connection = open(&uri, &config.reconnect, &state).await?;

        log::info!(target: "amqp", "Connected to {}.", redacted(&uri));
        Ok(Self {
            uri,
            policy: config.reconnect.clone(),
            state,
            connection,
        })
    }

    /// Re-establishes the connection after it dropped.
    pub async fn reconnect(&mut self) -> Result<(), WorkerError> {
        if self.is_connected() {
            return Ok(());
        }
        self.state.set(ConnectionState::Disconnected);
        self.connection = open(&self.uri, &self.policy, &self.state).await?;
        log::info!(target: "amqp", "Reconnected to {}.", redacted(&self.uri));
        Ok(())
    }

    pub async fn create_channel(&self) -> Result<Channel, WorkerError> {
        Ok(self.connection.create_channel().await?)
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state.get() == ConnectionState::Connected && self.connection.status().connected()
    }

    pub async fn close(&self) {
        self.state.set(ConnectionState::Closing);
        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(200, "worker shutdown").await {
                log::warn!(target: "amqp", "Error while closing connection: {}", e);
            }
        }
        self.state.set(ConnectionState::Disconnected);
    }
}

async fn open(
    uri: &AMQPUri,
    policy: &ReconnectPolicy,
    state: &StateCell,
) -> Result<Connection, WorkerError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        state.set(ConnectionState::Connecting);

        match Connection::connect_uri(uri.clone(), ConnectionProperties::default()).await {
            Ok(connection) => {
                let on_error = state.clone();
                connection.on_error(move |err| {
                    log::warn!(target: "amqp", "Connection error: {}", err);
                    if on_error.get() != ConnectionState::Closing {
                        on_error.set(ConnectionState::Disconnected);
                    }
                });
                state.set(ConnectionState::Connected);
                return Ok(connection);
            }
            Err(source) => {
                state.set(ConnectionState::Disconnected);
                match policy.delay_after(attempt) {
                    Some(delay) => {
                        log::warn!(
                            target: "amqp",
                            "Connection attempt {}/{} failed: {}. Retrying in {:?}.",
                            attempt, policy.max_attempts, source, delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        log::error!(target: "amqp", "Giving up after {} connection attempt(s): {}", attempt, source);
                        return Err(WorkerError::Connect { attempts: attempt, source });
                    }
                }
            }
        }
    }
}

/// Builds the broker URI from the configured host and credentials.
pub fn broker_uri(config: &WorkerConfig) -> Result<AMQPUri, ConfigError> {
    let url = config.broker_url();
    let mut uri: AMQPUri = url.parse().map_err(|_| ConfigError::Invalid {
        key: crate::config::ENV_HOST,
        value: config.host.clone(),
        reason: "not a valid AMQP URI",
    })?;
    uri.authority.userinfo = AMQPUserInfo {
        username: config.user.clone(),
        password: config.password.clone(),
    };
    uri.query.heartbeat = Some(HEARTBEAT_SECS);
    Ok(uri)
}

fn redacted(uri: &AMQPUri) -> String {
    format!("{}:{}{}", uri.authority.host, uri.authority.port, uri.vhost)
}
