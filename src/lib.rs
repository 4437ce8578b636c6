//! Session Engine - streaming chat sessions against a local model server
//!
//! A pure conversation state machine drives a bounded message history and a
//! cancellable, batched response stream from an Ollama-compatible backend.

pub mod config;
pub mod error;
pub mod llm;
pub mod runtime;
pub mod state_machine;
pub mod store;

pub use config::SessionConfig;
pub use error::{DomainError, DomainErrorKind};
pub use runtime::{ConversationSession, RejectReason, SessionEvent, SubmitOutcome};
pub use state_machine::{PartialContent, SessionState};
pub use store::{Message, MessageStore, ParseRoleError, Role};
