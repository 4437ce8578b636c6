//! Raw transport error types
//!
//! These are what a `ChatTransport` reports. They never cross the
//! `StreamingClient` boundary; `crate::error::classify` folds them into
//! the domain taxonomy.

use std::time::Duration;
use thiserror::Error;

/// Failure reported by a chat transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// Host actively refused or reset the connection
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Host name could not be resolved
    #[error("failed to resolve host: {0}")]
    Dns(String),

    /// No connection within the request timeout
    #[error("timed out after {0:?} establishing connection")]
    ConnectTimeout(Duration),

    /// Backend says the requested model does not exist
    #[error("model {0:?} not found")]
    ModelNotFound(String),

    /// Non-success HTTP status before any chunk was read
    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Transport dropped after the stream was open
    #[error("connection dropped mid-stream: {0}")]
    Disconnected(String),

    /// A chunk could not be decoded
    #[error("malformed chunk: {0}")]
    MalformedChunk(String),

    /// Stream ended without the backend signalling completion
    #[error("stream closed before completion")]
    UnexpectedClose,

    /// Error payload sent by the backend inside the stream
    #[error("backend error: {0}")]
    Backend(String),

    /// Anything else the transport could not name
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into().into())
    }

    /// Network-level connection failures are the only ones worth retrying.
    /// A 404 or 500 answered by the backend will answer the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused(_) | Self::Dns(_) | Self::ConnectTimeout(_)
        )
    }
}
