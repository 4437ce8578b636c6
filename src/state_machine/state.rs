//! Session state types

use crate::error::{DomainError, DomainErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Session state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionState {
    /// Ready for input, no stream task
    #[default]
    Idle,

    /// A stream task is running and feeding the in-progress reply
    Streaming,

    /// Cancellation signalled; the stream task has not finished yet
    Cancelling,

    /// Last stream failed - UI displays this state directly
    Error {
        kind: DomainErrorKind,
        message: String,
    },
}

impl SessionState {
    pub fn from_error(error: &DomainError) -> Self {
        SessionState::Error {
            kind: error.kind,
            message: error.message.clone(),
        }
    }

    /// Whether a new submission would be accepted
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Error { .. })
    }

    /// A stream task may be alive
    pub fn is_busy(&self) -> bool {
        matches!(self, SessionState::Streaming | SessionState::Cancelling)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Streaming => "streaming",
            SessionState::Cancelling => "cancelling",
            SessionState::Error { .. } => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Error { kind, message } => write!(f, "error ({kind}): {message}"),
            other => f.write_str(other.name()),
        }
    }
}

/// What happens to a half-streamed reply when its stream is cancelled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialContent {
    /// Append what arrived as an assistant message
    Keep,
    /// Drop it
    #[default]
    Discard,
}

impl PartialContent {
    pub fn from_keep(keep: bool) -> Self {
        if keep {
            PartialContent::Keep
        } else {
            PartialContent::Discard
        }
    }
}
