//! Bounded conversation history with deterministic context trimming


use crate::error::DomainError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Message
// ============================================================================

/// Who authored a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A role name outside `system | user | assistant`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown message role {0:?}")]
pub struct ParseRoleError(pub String);

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(ParseRoleError(other.to_string())),
        }
    }
}

/// Opaque reference carried alongside a message (file path, image id, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attachment(pub String);

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            attachments: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

// ============================================================================
// Token estimation
// ============================================================================

/// Deterministic token cost heuristic.
///
/// Returning `None` means the estimate could not be produced; the store then
/// charges the message the whole remaining budget.
pub trait TokenEstimator {
    fn estimate(&self, text: &str) -> Option<usize>;
}

impl<F> TokenEstimator for F
where
    F: Fn(&str) -> Option<usize>,
{
    fn estimate(&self, text: &str) -> Option<usize> {
        self(text)
    }
}

/// Roughly four characters per token
#[derive(Debug, Clone, Copy, Default)]
pub struct CharRatio;

impl TokenEstimator for CharRatio {
    fn estimate(&self, text: &str) -> Option<usize> {
        Some(text.len() / 4)
    }
}

/// Character ratio plus word count plus a fixed per-message overhead
#[derive(Debug, Clone, Copy, Default)]
pub struct WordHeuristic;

impl TokenEstimator for WordHeuristic {
    fn estimate(&self, text: &str) -> Option<usize> {
        // role marker + content + message framing
        Some(2 + text.len() / 4 + text.split_whitespace().count() + 2)
    }
}

// ============================================================================
// Store
// ============================================================================

/// Compact persisted form: role and content only, in stable field order
#[derive(Serialize)]
struct ExportedMessage<'a> {
    role: Role,
    content: &'a str,
}

/// Bounded, insertion-ordered conversation history.
///
/// The first system message is pinned: it survives capacity eviction and
/// context trimming as long as it exists.
#[derive(Debug, Clone)]
pub struct MessageStore {
    max_history_messages: usize,
    messages: VecDeque<Message>,
    /// Assistant reply currently being streamed; not part of history yet
    pending: Option<Message>,
}

impl MessageStore {
    /// Create an empty store. A capacity of zero could not hold even the
    /// system message, so it is rejected.
    pub fn new(max_history_messages: usize) -> Result<Self, DomainError> {
        if max_history_messages == 0 {
            return Err(DomainError::config_invalid(
                "max_history_messages must be at least 1",
            ));
        }
        Ok(Self {
            max_history_messages,
            messages: VecDeque::new(),
            pending: None,
        })
    }

    pub fn with_system_prompt(
        max_history_messages: usize,
        prompt: &str,
    ) -> Result<Self, DomainError> {
        let mut store = Self::new(max_history_messages)?;
        let prompt = prompt.trim();
        if !prompt.is_empty() {
            store.append(Message::system(prompt));
        }
        Ok(store)
    }

    pub fn capacity(&self) -> usize {
        self.max_history_messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The pinned system message, if any
    pub fn system_message(&self) -> Option<&Message> {
        self.system_index().and_then(|i| self.messages.get(i))
    }

    fn system_index(&self) -> Option<usize> {
        self.messages.iter().position(|m| m.role == Role::System)
    }

    /// Add a message to the end, evicting the oldest non-system message when
    /// over capacity.
    pub fn append(&mut self, message: Message) {
        self.messages.push_back(message);
        self.enforce_capacity();
    }

    fn enforce_capacity(&mut self) {
        while self.messages.len() > self.max_history_messages {
            // The pinned system message is either first or absent in every
            // store that started from `with_system_prompt`, so this is O(1)
            // in practice.
            let victim = match self.system_index() {
                Some(0) => 1,
                _ => 0,
            };
            if victim >= self.messages.len() {
                // Only the system message is left and capacity >= 1, so
                // this cannot be reached; stop rather than drop it.
                break;
            }
            self.messages.remove(victim);
        }
    }

    /// Messages to send to the backend under a token budget.
    ///
    /// The system message is always first and never counted against the
    /// budget. The rest is the longest chronological suffix of history whose
    /// summed cost fits in `max_tokens`. Nothing is removed from the store.
    pub fn context<E>(&self, max_tokens: usize, estimator: &E) -> Vec<Message>
    where
        E: TokenEstimator + ?Sized,
    {
        let system_index = self.system_index();
        let mut used = 0usize;
        let mut kept: Vec<&Message> = Vec::new();

        for (index, message) in self.messages.iter().enumerate().rev() {
            if Some(index) == system_index {
                continue;
            }
            let remaining = max_tokens - used;
            match estimator.estimate(&message.content) {
                Some(cost) if cost <= remaining => {
                    used += cost;
                    kept.push(message);
                }
                Some(_) => break,
                None => {
                    // Fail closed: charge everything that is left.
                    kept.push(message);
                    break;
                }
            }
        }

        let mut context = Vec::with_capacity(kept.len() + 1);
        if let Some(system) = self.system_message() {
            context.push(system.clone());
        }
        context.extend(kept.into_iter().rev().cloned());
        context
    }

    /// Full history in insertion order
    pub fn export(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    /// History as compact JSON `[{"role":..,"content":..}]`, stable ordering
    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        let exported: Vec<ExportedMessage<'_>> = self
            .messages
            .iter()
            .map(|m| ExportedMessage {
                role: m.role,
                content: &m.content,
            })
            .collect();
        serde_json::to_string(&exported)
    }

    /// Replace history with persisted messages.
    ///
    /// Content is trimmed. If the loaded history carries no system message,
    /// the current one is kept in front. Capacity is re-applied.
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        let mut loaded: VecDeque<Message> = messages
            .into_iter()
            .map(|mut m| {
                m.content = m.content.trim().to_string();
                m
            })
            .collect();

        if !loaded.iter().any(|m| m.role == Role::System) {
            if let Some(system) = self.system_message().cloned() {
                loaded.push_front(system);
            }
        }

        self.messages = loaded;
        self.pending = None;
        self.enforce_capacity();
    }

    /// Empty the store, system message included
    pub fn clear(&mut self) {
        self.messages.clear();
        self.pending = None;
    }

    /// Deterministic estimate of the whole history, never below 1
    pub fn estimated_tokens<E>(&self, estimator: &E) -> usize
    where
        E: TokenEstimator + ?Sized,
    {
        let total: usize = self
            .messages
            .iter()
            .map(|m| estimator.estimate(&m.content).unwrap_or(0))
            .sum();
        total.max(1)
    }

    // ------------------------------------------------------------------
    // In-progress assistant message
    // ------------------------------------------------------------------

    /// Start a new streaming assistant reply, dropping any unfinished one
    pub fn begin_assistant(&mut self) {
        self.pending = Some(Message::assistant(String::new()));
    }

    /// Grow the in-progress reply. Ignored when no reply is in progress.
    pub fn append_pending(&mut self, text: &str) {
        if let Some(pending) = self.pending.as_mut() {
            pending.content.push_str(text);
        }
    }

    pub fn pending(&self) -> Option<&Message> {
        self.pending.as_ref()
    }

    /// Move the in-progress reply into history. Empty replies are dropped.
    /// Returns the appended message.
    pub fn finalize_pending(&mut self) -> Option<Message> {
        let mut message = self.pending.take()?;
        let trimmed = message.content.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.len() != message.content.len() {
            message.content = trimmed.to_string();
        }
        self.append(message.clone());
        Some(message)
    }

    pub fn discard_pending(&mut self) {
        self.pending = None;
    }

    /// Drop the trailing user message of a turn that produced no reply, so
    /// the next request does not carry two user turns in a row. Returns the
    /// removed message, or `None` when history does not end with a user turn.
    pub fn rollback_last_user(&mut self) -> Option<Message> {
        match self.messages.back() {
            Some(last) if last.role == Role::User => self.messages.pop_back(),
            _ => None,
        }
    }
}
