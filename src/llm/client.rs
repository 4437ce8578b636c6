//! Streaming client: connect with retry, batch chunks, observe cancellation

use super::types::*;
use super::{ChatTransport, ChunkStream, TransportError};
use crate::error::{classify, DomainError};
use crate::store::Message;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How a fragment stream ended. Cancellation is an outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
    Failed(DomainError),
}

/// Item pulled from a `FragmentStream`
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Fragment(Fragment),
    /// Always the last event
    Finished(StreamOutcome),
}

/// Performs streaming requests against a `ChatTransport`
#[derive(Clone)]
pub struct StreamingClient {
    transport: Arc<dyn ChatTransport>,
}

impl StreamingClient {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn ChatTransport> {
        &self.transport
    }

    /// Start a lazy, one-shot stream over `context`.
    ///
    /// Nothing is sent until the first `next()`. If `cancel` is already
    /// triggered by then, the stream finishes `Cancelled` without touching
    /// the transport.
    pub fn stream(
        &self,
        context: &[Message],
        options: &StreamOptions,
        cancel: CancellationToken,
    ) -> FragmentStream {
        let request = ChatRequest {
            model: options.model.clone(),
            messages: context.iter().map(ChatMessage::from).collect(),
            think: options.think,
            num_ctx: options.num_ctx,
        };

        FragmentStream {
            transport: Arc::clone(&self.transport),
            request,
            options: options.clone(),
            batch_size: options.batch_size.max(1),
            cancel,
            phase: Phase::Connect,
            buffer: Fragment::default(),
            pending: None,
            attempts: 0,
        }
    }

    /// Make sure `model` is installed, pulling it when allowed
    pub async fn ensure_model_ready(
        &self,
        model: &str,
        pull_if_missing: bool,
    ) -> Result<(), DomainError> {
        let models = self.transport.list_models().await.map_err(classify)?;
        if let Some(found) = models.iter().find(|m| m.matches(model)) {
            tracing::debug!(model = %found.name, size_bytes = ?found.size, "Model available");
            return Ok(());
        }

        if !pull_if_missing {
            return Err(DomainError::model_not_found(format!(
                "Model {model:?} is not installed on {}.",
                self.transport.endpoint()
            )));
        }

        tracing::info!(model = %model, endpoint = %self.transport.endpoint(), "Pulling missing model");
        self.transport.pull_model(model).await.map_err(classify)
    }

    /// Whether the backend answers at all
    pub async fn check_connection(&self) -> bool {
        self.transport.list_models().await.is_ok()
    }
}

enum Phase {
    Connect,
    Open(ChunkStream),
    Done,
}

enum Read {
    Cancelled,
    Chunk(RawChunk),
    Failed(TransportError),
    End,
}

/// Lazy sequence of batched fragments ending in exactly one `Finished`
pub struct FragmentStream {
    transport: Arc<dyn ChatTransport>,
    request: ChatRequest,
    options: StreamOptions,
    batch_size: usize,
    cancel: CancellationToken,
    phase: Phase,
    buffer: Fragment,
    /// Outcome held back while the final buffered fragment is delivered
    pending: Option<StreamOutcome>,
    attempts: u32,
}

impl FragmentStream {
    /// Connection attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Pull the next event. Returns `None` once `Finished` has been yielded.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if let Some(outcome) = self.pending.take() {
            return Some(StreamEvent::Finished(outcome));
        }

        loop {
            match &mut self.phase {
                Phase::Done => return None,
                Phase::Connect => match self.connect().await {
                    Ok(chunks) => self.phase = Phase::Open(chunks),
                    Err(outcome) => return Some(self.finish(outcome)),
                },
                Phase::Open(chunks) => {
                    let read = tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => Read::Cancelled,
                        item = chunks.next() => match item {
                            Some(Ok(chunk)) => Read::Chunk(chunk),
                            Some(Err(e)) => Read::Failed(e),
                            None => Read::End,
                        },
                    };

                    match read {
                        Read::Cancelled => {
                            tracing::debug!(model = %self.request.model, "Stream cancelled");
                            return Some(self.finish(StreamOutcome::Cancelled));
                        }
                        Read::Chunk(chunk) => {
                            if !chunk.is_empty() {
                                self.buffer.push(&chunk);
                            }
                            if chunk.done {
                                return Some(self.finish(StreamOutcome::Completed));
                            }
                            if self.buffer.chunks >= self.batch_size {
                                return Some(StreamEvent::Fragment(std::mem::take(
                                    &mut self.buffer,
                                )));
                            }
                        }
                        Read::Failed(e) => {
                            tracing::warn!(model = %self.request.model, error = %e, "Stream failed mid-response");
                            return Some(self.finish(StreamOutcome::Failed(classify(e))));
                        }
                        Read::End => return Some(self.finish(StreamOutcome::Completed)),
                    }
                }
            }
        }
    }

    /// Drop the transport stream, then deliver what is buffered before the
    /// outcome.
    fn finish(&mut self, outcome: StreamOutcome) -> StreamEvent {
        self.phase = Phase::Done;
        if self.buffer.chunks == 0 {
            return StreamEvent::Finished(outcome);
        }
        self.pending = Some(outcome);
        StreamEvent::Fragment(std::mem::take(&mut self.buffer))
    }

    async fn connect(&mut self) -> Result<ChunkStream, StreamOutcome> {
        let mut retry = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(StreamOutcome::Cancelled);
            }

            self.attempts += 1;
            tracing::debug!(
                model = %self.request.model,
                attempt = self.attempts,
                "Opening chat stream"
            );

            let opened = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(StreamOutcome::Cancelled),
                result = tokio::time::timeout(
                    self.options.timeout,
                    self.transport.open_stream(&self.request),
                ) => result,
            };

            let error = match opened {
                Ok(Ok(chunks)) => return Ok(chunks),
                Ok(Err(e)) => e,
                Err(_elapsed) => TransportError::ConnectTimeout(self.options.timeout),
            };

            if !error.is_retryable() || retry >= self.options.max_retries {
                tracing::error!(
                    model = %self.request.model,
                    attempts = self.attempts,
                    error = %error,
                    "Giving up on chat stream"
                );
                return Err(StreamOutcome::Failed(classify(error)));
            }

            let delay = self.options.backoff(retry);
            tracing::warn!(
                model = %self.request.model,
                attempt = self.attempts,
                delay_ms = %delay.as_millis(),
                error = %error,
                "Connection failed, retrying"
            );

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(StreamOutcome::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            retry += 1;
        }
    }

    /// Adapt to a `futures::Stream`
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send {
        futures::stream::unfold(self, |mut fragments| async move {
            fragments.next().await.map(|event| (event, fragments))
        })
    }
}
