//! Ollama HTTP transport
//!
//! `/api/chat` streams newline-delimited JSON objects, one per token batch,
//! the last carrying `"done": true`.

use super::types::*;
use super::{ChatTransport, ChunkStream, TransportError};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// Longest slice of an undecodable line kept in the error
const MALFORMED_PREVIEW: usize = 120;

/// Ollama service implementation
pub struct OllamaTransport {
    client: Client,
    host: String,
    connect_timeout: Duration,
}

impl OllamaTransport {
    pub fn new(host: &str, connect_timeout: Duration) -> Result<Self, TransportError> {
        // No overall request timeout: a healthy stream may run for minutes.
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Other(Box::new(e)))?;

        Ok(Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            connect_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.host, path)
    }

    fn map_send_error(&self, e: reqwest::Error) -> TransportError {
        let detail = error_chain(&e);
        if e.is_timeout() {
            TransportError::ConnectTimeout(self.connect_timeout)
        } else if e.is_connect() {
            let lower = detail.to_lowercase();
            if lower.contains("dns error") || lower.contains("failed to lookup") {
                TransportError::Dns(detail)
            } else {
                TransportError::ConnectionRefused(detail)
            }
        } else {
            TransportError::Other(Box::new(e))
        }
    }

    fn classify_status(status: StatusCode, body: String, model: &str) -> TransportError {
        if status == StatusCode::NOT_FOUND && body.to_lowercase().contains("not found") {
            return TransportError::ModelNotFound(model.to_string());
        }
        TransportError::Status {
            status: status.as_u16(),
            body: error_message(&body),
        }
    }

    fn translate_request(request: &ChatRequest) -> OllamaChatRequest<'_> {
        OllamaChatRequest {
            model: &request.model,
            messages: &request.messages,
            stream: true,
            think: request.think.then_some(true),
            options: request.num_ctx.map(|num_ctx| OllamaOptions { num_ctx }),
        }
    }
}

#[async_trait]
impl ChatTransport for OllamaTransport {
    async fn open_stream(&self, request: &ChatRequest) -> Result<ChunkStream, TransportError> {
        let response = self
            .client
            .post(self.url("/api/chat"))
            .json(&Self::translate_request(request))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body, &request.model));
        }

        Ok(decode_ndjson(Box::pin(response.bytes_stream())))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, TransportError> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Disconnected(error_chain(&e)))?;
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: error_message(&body),
            });
        }

        let tags: OllamaTags = serde_json::from_str(&body)
            .map_err(|e| TransportError::MalformedChunk(format!("{e}: {}", preview(&body))))?;
        Ok(tags.models)
    }

    async fn pull_model(&self, model: &str) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.url("/api/pull"))
            .json(&OllamaPullRequest {
                model,
                stream: false,
            })
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Disconnected(error_chain(&e)))?;
        if !status.is_success() {
            return Err(Self::classify_status(status, body, model));
        }

        let reply: OllamaStatus = serde_json::from_str(&body)
            .map_err(|e| TransportError::MalformedChunk(format!("{e}: {}", preview(&body))))?;
        match reply.error {
            Some(error) => Err(TransportError::Backend(error)),
            None => Ok(()),
        }
    }

    fn endpoint(&self) -> &str {
        &self.host
    }
}

// ============================================================================
// NDJSON decoding
// ============================================================================

/// Splits a byte stream into complete lines
#[derive(Debug, Default)]
struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

fn parse_line(line: &str) -> Result<RawChunk, TransportError> {
    let chunk: OllamaChatChunk = serde_json::from_str(line)
        .map_err(|e| TransportError::MalformedChunk(format!("{e}: {}", preview(line))))?;

    if let Some(error) = chunk.error {
        return Err(TransportError::Backend(error));
    }

    let message = chunk.message.unwrap_or_default();
    Ok(RawChunk {
        content: message.content,
        thinking: message.thinking.unwrap_or_default(),
        done: chunk.done,
    })
}

struct DecodeState<S> {
    bytes: S,
    lines: LineDecoder,
    queued: VecDeque<Result<RawChunk, TransportError>>,
    eof: bool,
    ended: bool,
}

/// Turn a response body into raw chunks.
///
/// The stream ends after the `done` chunk or the first error. A body that
/// ends without `done` yields `UnexpectedClose`.
fn decode_ndjson<S, B, E>(bytes: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = DecodeState {
        bytes,
        lines: LineDecoder::default(),
        queued: VecDeque::new(),
        eof: false,
        ended: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if st.ended {
                return None;
            }
            if let Some(item) = st.queued.pop_front() {
                match &item {
                    Err(_) => st.ended = true,
                    Ok(chunk) if chunk.done => st.ended = true,
                    Ok(_) => {}
                }
                return Some((item, st));
            }
            if st.eof {
                st.ended = true;
                return Some((Err(TransportError::UnexpectedClose), st));
            }
            match st.bytes.next().await {
                Some(Ok(bytes)) => {
                    for line in st.lines.push(bytes.as_ref()) {
                        st.queued.push_back(parse_line(&line));
                    }
                }
                Some(Err(e)) => {
                    st.queued
                        .push_back(Err(TransportError::Disconnected(e.to_string())));
                }
                None => {
                    if let Some(line) = st.lines.finish() {
                        st.queued.push_back(parse_line(&line));
                    }
                    st.eof = true;
                }
            }
        }
    }))
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

/// Pull `{"error": "..."}` out of a response body when present
fn error_message(body: &str) -> String {
    serde_json::from_str::<OllamaStatus>(body)
        .ok()
        .and_then(|status| status.error)
        .unwrap_or_else(|| body.trim().to_string())
}

fn preview(text: &str) -> String {
    text.chars().take(MALFORMED_PREVIEW).collect()
}

// Ollama API types

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    think: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_ctx: usize,
}

#[derive(Debug, Serialize)]
struct OllamaPullRequest<'a> {
    model: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaChatChunk {
    #[serde(default)]
    message: Option<OllamaChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OllamaChunkMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct OllamaStatus {
    #[serde(default)]
    error: Option<String>,
}
