//! Domain error taxonomy
//!
//! A closed set of failure kinds exposed at the engine boundary, and the
//! single mapping from raw transport failures onto it.

use crate::llm::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Stable tag for a domain error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainErrorKind {
    /// Backend host unreachable (refused, DNS, connect timeout)
    ConnectionFailure,
    /// Requested model does not exist on the backend
    ModelNotFound,
    /// Anything that went wrong once the stream was under way, plus
    /// every failure that has no better home
    StreamingFailure,
    /// Configuration rejected before the engine started
    ConfigInvalid,
}

impl DomainErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionFailure => "connection_failure",
            Self::ModelNotFound => "model_not_found",
            Self::StreamingFailure => "streaming_failure",
            Self::ConfigInvalid => "config_invalid",
        }
    }
}

impl fmt::Display for DomainErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure with a user-presentable message and optional cause
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DomainError {
    pub kind: DomainErrorKind,
    pub message: String,
    #[source]
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl DomainError {
    pub fn new(kind: DomainErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn connection_failure(message: impl Into<String>) -> Self {
        Self::new(DomainErrorKind::ConnectionFailure, message)
    }

    pub fn model_not_found(message: impl Into<String>) -> Self {
        Self::new(DomainErrorKind::ModelNotFound, message)
    }

    pub fn streaming_failure(message: impl Into<String>) -> Self {
        Self::new(DomainErrorKind::StreamingFailure, message)
    }

    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::new(DomainErrorKind::ConfigInvalid, message)
    }

    /// The wrapped cause, for diagnostic chaining
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }
}

impl PartialEq for DomainError {
    // Causes are diagnostic only; two errors are the same if they read the same.
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.message == other.message
    }
}

/// Map a raw transport failure onto the domain taxonomy.
///
/// Total: every input maps to exactly one kind, and this never panics.
/// The raw error is kept as the cause.
pub fn classify(raw: TransportError) -> DomainError {
    let error = match &raw {
        TransportError::ConnectionRefused(_)
        | TransportError::Dns(_)
        | TransportError::ConnectTimeout(_) => {
            DomainError::connection_failure(format!("Unable to reach the chat backend ({raw})."))
        }
        TransportError::ModelNotFound(model) => {
            DomainError::model_not_found(format!("Model {model:?} is not available on the backend."))
        }
        TransportError::Status { status, body } if mentions_missing_model(*status, body) => {
            DomainError::model_not_found(format!("The requested model was not found: {body}"))
        }
        TransportError::Backend(message) if mentions_missing_model(0, message) => {
            DomainError::model_not_found(format!("The requested model was not found: {message}"))
        }
        TransportError::Status { .. }
        | TransportError::Disconnected(_)
        | TransportError::MalformedChunk(_)
        | TransportError::UnexpectedClose
        | TransportError::Backend(_)
        | TransportError::Other(_) => {
            DomainError::streaming_failure(format!("The response stream failed: {raw}"))
        }
    };
    error.with_cause(raw)
}

/// Backends rarely give a structured "no such model" signal, so fall back
/// to reading the text the way users would.
fn mentions_missing_model(status: u16, text: &str) -> bool {
    let lower = text.to_lowercase();
    if !lower.contains("model") {
        return false;
    }
    lower.contains("not found") || status == 404
}
