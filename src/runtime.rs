//! Runtime for driving a conversation
//!
//! `ConversationSession` executes the effects of the pure state machine:
//! it owns the message store, spawns and cancels the stream task, and
//! delivers events to the consumer.

mod monitor;
mod session;
mod task;

#[cfg(test)]
pub mod testing;

pub use monitor::{ConnectionMonitor, ConnectionStatus};
pub use session::{ConversationSession, RejectReason, SessionEvent, SubmitOutcome};
