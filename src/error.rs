use thiserror::Error;

/// Problems found while validating worker configuration.
///
/// Always fatal and always raised before any network activity.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} not defined")]
    Missing(&'static str),

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{key} has invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Generic error type for the RPC worker runtime.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Missing or malformed configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The broker could not be reached within the reconnect budget.
    #[error("could not connect to broker after {attempts} attempt(s): {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: lapin::Error,
    },

    /// The broker refused the queue declaration, usually because the queue
    /// already exists with different arguments.
    #[error("declaration of queue '{queue}' rejected by broker: {source}")]
    QueueDeclare {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    /// The payload could not be parsed. Never retried.
    #[error("failed to decode payload: {0}")]
    Decode(String),

    /// Business logic failure reported by the handler.
    #[error("message handler failed: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The reply could not be delivered to `reply_to`.
    #[error("failed to publish reply to '{reply_to}': {reason}")]
    Publish { reply_to: String, reason: String },

    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    #[error("failed to serialize reply: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkerError {
    /// Wraps any error produced by business logic.
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        WorkerError::Handler(err.into())
    }

    /// Fatal errors stop the runtime; everything else is local to one message.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkerError::Config(_) | WorkerError::Connect { .. } | WorkerError::QueueDeclare { .. }
        )
    }
}

// Allow handlers to fail with a plain message.
impl From<&str> for WorkerError {
    fn from(s: &str) -> Self {
        WorkerError::handler(s)
    }
}

impl From<String> for WorkerError {
    fn from(s: String) -> Self {
        WorkerError::handler(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(WorkerError::from(ConfigError::Missing("AMQP_QUEUE")).is_fatal());
        assert!(!WorkerError::Decode("eof".into()).is_fatal());
        assert!(!WorkerError::from("boom").is_fatal());
        assert!(!WorkerError::Publish {
            reply_to: "amq.rabbitmq.reply-to".into(),
            reason: "nack".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_string_becomes_handler_error() {
        let err = WorkerError::from(format!("division by {}", 0));
        assert!(matches!(err, WorkerError::Handler(_)));
        assert_eq!(err.to_string(), "message handler failed: division by 0");
    }

    #[test]
    fn test_config_error_names_variable() {
        let err = WorkerError::from(ConfigError::Missing("AMQP_QUEUE"));
        assert_eq!(err.to_string(), "configuration error: AMQP_QUEUE not defined");
    }
}
