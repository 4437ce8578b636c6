//! Effects produced by state transitions

use crate::error::DomainError;
use crate::llm::Fragment;

/// Effects to be executed by the session after a transition, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Forget the recorded error
    ClearError,

    /// Append the user's message to the store
    PersistUserMessage { text: String },

    /// Open an empty in-progress assistant message
    BeginAssistant,

    /// Spawn the stream task over the current context
    SpawnStream,

    /// Grow the in-progress reply and forward the fragment to the consumer
    ForwardFragment { fragment: Fragment },

    /// Move the in-progress reply into history (dropped if empty)
    FinalizeAssistant,

    /// Drop the in-progress reply
    DiscardAssistant,

    /// Remove the last user message if the turn left no reply behind it
    RollbackUserMessage,

    /// Signal the stream task to stop
    AbortStream,

    /// Keep the error for `last_error` and notify the consumer
    RecordError { error: DomainError },
}

impl Effect {
    pub fn persist_user_message(text: impl Into<String>) -> Self {
        Effect::PersistUserMessage { text: text.into() }
    }

    pub fn forward(fragment: Fragment) -> Self {
        Effect::ForwardFragment { fragment }
    }

    pub fn record_error(error: DomainError) -> Self {
        Effect::RecordError { error }
    }
}
