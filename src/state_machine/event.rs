//! Events that can occur in a session

use super::state::PartialContent;
use crate::error::DomainError;
use crate::llm::Fragment;

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    // User events
    Submit {
        text: String,
    },
    CancelRequested,
    Acknowledge,
    Shutdown,

    // Stream task events
    FragmentReceived {
        fragment: Fragment,
    },
    StreamCompleted,
    StreamFailed {
        error: DomainError,
    },
    /// The stream task has terminated after a cancel request
    CancelAcknowledged {
        partial: PartialContent,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Submit { .. } => "submit",
            Event::CancelRequested => "cancel_requested",
            Event::Acknowledge => "acknowledge",
            Event::Shutdown => "shutdown",
            Event::FragmentReceived { .. } => "fragment_received",
            Event::StreamCompleted => "stream_completed",
            Event::StreamFailed { .. } => "stream_failed",
            Event::CancelAcknowledged { .. } => "cancel_acknowledged",
        }
    }
}
