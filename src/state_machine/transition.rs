//! Pure state transition function
//!
//! Given the same state and event this always produces the same result,
//! with no I/O. The session executes the returned effects.

use super::{Effect, Event, PartialContent, SessionState};
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: SessionState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: SessionState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Message is empty")]
    EmptyMessage,
    #[error("A response is still streaming (cancel it first)")]
    Busy,
    #[error("Cancellation in progress")]
    CancellationInProgress,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Pure transition function
pub fn transition(
    state: &SessionState,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        // ============================================================
        // Submission
        // ============================================================
        (SessionState::Idle | SessionState::Error { .. }, Event::Submit { text }) => {
            let text = text.trim();
            if text.is_empty() {
                return Err(TransitionError::EmptyMessage);
            }
            let clear = matches!(state, SessionState::Error { .. }).then_some(Effect::ClearError);
            Ok(TransitionResult::new(SessionState::Streaming)
                .with_effects(clear)
                .with_effect(Effect::persist_user_message(text))
                .with_effect(Effect::BeginAssistant)
                .with_effect(Effect::SpawnStream))
        }

        (SessionState::Streaming, Event::Submit { .. }) => Err(TransitionError::Busy),

        (SessionState::Cancelling, Event::Submit { .. }) => {
            Err(TransitionError::CancellationInProgress)
        }

        // ============================================================
        // Stream progress
        // ============================================================

        // Fragments keep flowing while cancelling: the final flush of a
        // cancelled stream is still delivered.
        (SessionState::Streaming | SessionState::Cancelling, Event::FragmentReceived { fragment }) => {
            Ok(TransitionResult::new(state.clone()).with_effect(Effect::forward(fragment)))
        }

        (SessionState::Streaming, Event::StreamCompleted) => {
            Ok(TransitionResult::new(SessionState::Idle).with_effect(Effect::FinalizeAssistant))
        }

        (SessionState::Streaming, Event::StreamFailed { error }) => {
            Ok(TransitionResult::new(SessionState::from_error(&error))
                .with_effect(Effect::FinalizeAssistant)
                .with_effect(Effect::RollbackUserMessage)
                .with_effect(Effect::record_error(error)))
        }

        // The task ended on its own after cancel was signalled; Idle still
        // waits for the acknowledgement.
        (SessionState::Cancelling, Event::StreamCompleted | Event::StreamFailed { .. }) => {
            Ok(TransitionResult::new(SessionState::Cancelling))
        }

        // ============================================================
        // Cancellation
        // ============================================================
        (SessionState::Streaming, Event::CancelRequested) => {
            Ok(TransitionResult::new(SessionState::Cancelling).with_effect(Effect::AbortStream))
        }

        // Nothing to cancel, or someone else already is
        (SessionState::Idle | SessionState::Error { .. } | SessionState::Cancelling, Event::CancelRequested) => {
            Ok(TransitionResult::new(state.clone()))
        }

        (SessionState::Cancelling, Event::CancelAcknowledged { partial }) => {
            let effect = match partial {
                PartialContent::Keep => Effect::FinalizeAssistant,
                PartialContent::Discard => Effect::DiscardAssistant,
            };
            Ok(TransitionResult::new(SessionState::Idle)
                .with_effect(effect)
                .with_effect(Effect::RollbackUserMessage))
        }

        // ============================================================
        // Error recovery
        // ============================================================
        (SessionState::Error { .. }, Event::Acknowledge) => {
            Ok(TransitionResult::new(SessionState::Idle).with_effect(Effect::ClearError))
        }

        (SessionState::Idle, Event::Acknowledge) => Ok(TransitionResult::new(SessionState::Idle)),

        // ============================================================
        // Shutdown
        // ============================================================

        // A live stream is cancelled first; the session awaits the task
        // and acknowledges before shutdown completes.
        (SessionState::Streaming, Event::Shutdown) => {
            Ok(TransitionResult::new(SessionState::Cancelling).with_effect(Effect::AbortStream))
        }

        (SessionState::Cancelling, Event::Shutdown) => Ok(TransitionResult::new(SessionState::Cancelling)),

        (SessionState::Idle, Event::Shutdown) => Ok(TransitionResult::new(SessionState::Idle)),

        (SessionState::Error { .. }, Event::Shutdown) => {
            Ok(TransitionResult::new(SessionState::Idle).with_effect(Effect::ClearError))
        }

        // ============================================================
        // Everything else
        // ============================================================
        (state, event) => Err(TransitionError::InvalidTransition(format!(
            "{} in state {}",
            event.name(),
            state.name()
        ))),
    }
}
