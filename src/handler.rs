//! Defines the traits for request handling logic.

use crate::error::WorkerError;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

/// Raw request handler: payload bytes in, reply bytes out.
///
/// Invoked concurrently from several tasks, so implementations must be
/// `Send + Sync` and must not keep the payload beyond the call. Return
/// [`WorkerError::Decode`] for payloads that can never be processed; every
/// other error is treated as a business failure and goes through the
/// configured failure policy.
#[async_trait]
pub trait PayloadHandler: Send + Sync {
    async fn call(&self, payload: &[u8]) -> Result<Vec<u8>, WorkerError>;

    /// A name for the handler, used for logging.
    fn handler_name(&self) -> &str {
        "payload-handler"
    }
}

/// A typed handler for JSON work packages.
///
/// Implement this trait for your request/response types and wrap it in
/// [`JsonHandler`] to register it with the runtime.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The request type. Must be deserializable from JSON.
    type Request: DeserializeOwned + Send;
    /// The reply type, serialized to JSON.
    type Response: Serialize + Send;

    /// Processes a single deserialized request.
    async fn handle_message(&self, request: Self::Request) -> Result<Self::Response, WorkerError>;

    /// A name for the handler, used for logging and identification.
    fn handler_name(&self) -> &str;
}

/// Adapts a [`MessageHandler`] to the raw [`PayloadHandler`] interface.
pub struct JsonHandler<H> {
    inner: H,
}

impl<H: MessageHandler> JsonHandler<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H: MessageHandler> PayloadHandler for JsonHandler<H> {
    async fn call(&self, payload: &[u8]) -> Result<Vec<u8>, WorkerError> {
        let request: H::Request =
            serde_json::from_slice(payload).map_err(|e| WorkerError::Decode(e.to_string()))?;
        let response = self.inner.handle_message(request).await?;
        Ok(serde_json::to_vec(&response)?)
    }

    fn handler_name(&self) -> &str {
        self.inner.handler_name()
    }
}
