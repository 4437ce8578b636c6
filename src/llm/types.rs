//! Common types for chat backend interactions

use crate::store::{Message, Role};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One streaming chat request as handed to a transport
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Ask the backend for reasoning traces alongside the answer
    pub think: bool,
    /// Context window hint passed through to the backend
    pub num_ctx: Option<usize>,
}

/// Message in wire form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// Smallest unit a transport yields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawChunk {
    pub content: String,
    pub thinking: String,
    /// Backend signalled this is the final chunk
    pub done: bool,
}

impl RawChunk {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: text.into(),
            ..Self::default()
        }
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        Self {
            thinking: text.into(),
            ..Self::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.thinking.is_empty()
    }
}

/// A batch of raw chunks, concatenated in arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Fragment {
    pub content: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub thinking: String,
    /// Number of raw chunks folded into this fragment
    pub chunks: usize,
}

impl Fragment {
    pub fn push(&mut self, chunk: &RawChunk) {
        self.content.push_str(&chunk.content);
        self.thinking.push_str(&chunk.thinking);
        self.chunks += 1;
    }
}

/// Per-request streaming knobs
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub model: String,
    /// Raw chunks per emitted fragment
    pub batch_size: usize,
    /// Connection attempts after the first one
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_backoff: Duration,
    /// Bound on connection establishment only
    pub timeout: Duration,
    pub think: bool,
    pub num_ctx: Option<usize>,
}

impl StreamOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            batch_size: 8,
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            timeout: Duration::from_secs(120),
            think: false,
            num_ctx: None,
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

/// Model advertised by the backend
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl ModelInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: None,
        }
    }

    /// Case-insensitive; a bare name matches any of its tags
    pub fn matches(&self, wanted: &str) -> bool {
        let have = self.name.to_lowercase();
        let wanted = wanted.trim().to_lowercase();
        if have == wanted {
            return true;
        }
        !wanted.contains(':')
            && have
                .split_once(':')
                .is_some_and(|(base, _tag)| base == wanted)
    }
}
