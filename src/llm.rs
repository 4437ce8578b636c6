//! Chat backend abstraction
//!
//! A `ChatTransport` opens raw chunk streams against a backend; the
//! `StreamingClient` layers retry, batching, cancellation and error
//! classification on top of it.

mod client;
mod error;
mod ollama;
mod types;

pub use client::{FragmentStream, StreamEvent, StreamOutcome, StreamingClient};
pub use error::TransportError;
pub use ollama::OllamaTransport;
pub use types::*;

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;

/// Raw chunks in arrival order. An `Err` item is a mid-stream failure and
/// ends the stream.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<RawChunk, TransportError>> + Send>>;

/// Common interface for chat backends
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Establish a streaming request. Errors returned here are
    /// connection-phase failures; dropping the stream aborts the request.
    async fn open_stream(&self, request: &ChatRequest) -> Result<ChunkStream, TransportError>;

    /// Models installed on the backend
    async fn list_models(&self) -> Result<Vec<ModelInfo>, TransportError>;

    /// Download a model, returning once the backend reports success
    async fn pull_model(&self, model: &str) -> Result<(), TransportError>;

    /// Where requests go, for logs and status lines
    fn endpoint(&self) -> &str;
}

#[async_trait]
impl<T: ChatTransport + ?Sized> ChatTransport for Arc<T> {
    async fn open_stream(&self, request: &ChatRequest) -> Result<ChunkStream, TransportError> {
        (**self).open_stream(request).await
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, TransportError> {
        (**self).list_models().await
    }

    async fn pull_model(&self, model: &str) -> Result<(), TransportError> {
        (**self).pull_model(model).await
    }

    fn endpoint(&self) -> &str {
        (**self).endpoint()
    }
}

/// Logging wrapper for chat transports
pub struct LoggingTransport {
    inner: Arc<dyn ChatTransport>,
    endpoint: String,
}

impl LoggingTransport {
    pub fn new(inner: Arc<dyn ChatTransport>) -> Self {
        let endpoint = inner.endpoint().to_string();
        Self { inner, endpoint }
    }
}

#[async_trait]
impl ChatTransport for LoggingTransport {
    async fn open_stream(&self, request: &ChatRequest) -> Result<ChunkStream, TransportError> {
        let start = std::time::Instant::now();
        let result = self.inner.open_stream(request).await;
        let duration = start.elapsed();

        match &result {
            Ok(_) => {
                tracing::info!(
                    endpoint = %self.endpoint,
                    model = %request.model,
                    messages = request.messages.len(),
                    duration_ms = %duration.as_millis(),
                    "Chat stream opened"
                );
            }
            Err(e) => {
                tracing::error!(
                    endpoint = %self.endpoint,
                    model = %request.model,
                    duration_ms = %duration.as_millis(),
                    error = %e,
                    retryable = e.is_retryable(),
                    "Chat stream failed to open"
                );
            }
        }

        result
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, TransportError> {
        let result = self.inner.list_models().await;
        match &result {
            Ok(models) => tracing::debug!(endpoint = %self.endpoint, count = models.len(), "Listed models"),
            Err(e) => tracing::warn!(endpoint = %self.endpoint, error = %e, "Listing models failed"),
        }
        result
    }

    async fn pull_model(&self, model: &str) -> Result<(), TransportError> {
        let start = std::time::Instant::now();
        let result = self.inner.pull_model(model).await;
        match &result {
            Ok(()) => tracing::info!(
                endpoint = %self.endpoint,
                model = %model,
                duration_ms = %start.elapsed().as_millis(),
                "Model pulled"
            ),
            Err(e) => tracing::error!(endpoint = %self.endpoint, model = %model, error = %e, "Model pull failed"),
        }
        result
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
