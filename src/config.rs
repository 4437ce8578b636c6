//! Session configuration

use crate::error::DomainError;
use crate::llm::StreamOptions;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

/// Tunables for one conversation session.
///
/// Durations are stored as plain integers so the struct deserializes from
/// flat config sources.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Backend base URL
    pub host: String,
    pub model: String,
    /// Pinned system message; empty disables it
    pub system_prompt: String,
    pub max_history_messages: usize,
    /// Token budget for the context sent with each request
    pub max_context_tokens: usize,
    /// Raw chunks per emitted fragment
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_secs: u64,
    /// Capacity of the session event channel
    pub event_buffer: usize,
    /// Default cancel policy for the half-streamed reply
    pub keep_partial_on_cancel: bool,
    pub connection_check_interval_secs: u64,
    /// Request reasoning traces from models that support them
    pub think: bool,
    pub pull_if_missing: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
            system_prompt: "You are a helpful assistant.".to_string(),
            max_history_messages: 200,
            max_context_tokens: 4096,
            batch_size: 8,
            max_retries: 2,
            retry_backoff_ms: 500,
            max_backoff_ms: 8_000,
            request_timeout_secs: 120,
            event_buffer: 64,
            keep_partial_on_cancel: false,
            connection_check_interval_secs: 15,
            think: false,
            pull_if_missing: true,
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `CHAT_*` environment variables
    pub fn from_env() -> Result<Self, DomainError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `CHAT_*` key
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, DomainError> {
        let mut config = Self::default();

        if let Some(host) = lookup("CHAT_HOST") {
            config.host = host;
        }
        if let Some(model) = lookup("CHAT_MODEL") {
            config.model = model;
        }
        if let Some(prompt) = lookup("CHAT_SYSTEM_PROMPT") {
            config.system_prompt = prompt;
        }
        override_parsed(&lookup, "CHAT_MAX_HISTORY_MESSAGES", &mut config.max_history_messages)?;
        override_parsed(&lookup, "CHAT_MAX_CONTEXT_TOKENS", &mut config.max_context_tokens)?;
        override_parsed(&lookup, "CHAT_BATCH_SIZE", &mut config.batch_size)?;
        override_parsed(&lookup, "CHAT_MAX_RETRIES", &mut config.max_retries)?;
        override_parsed(&lookup, "CHAT_RETRY_BACKOFF_MS", &mut config.retry_backoff_ms)?;
        override_parsed(&lookup, "CHAT_MAX_BACKOFF_MS", &mut config.max_backoff_ms)?;
        override_parsed(&lookup, "CHAT_REQUEST_TIMEOUT_SECS", &mut config.request_timeout_secs)?;
        override_parsed(&lookup, "CHAT_EVENT_BUFFER", &mut config.event_buffer)?;
        override_parsed(&lookup, "CHAT_KEEP_PARTIAL_ON_CANCEL", &mut config.keep_partial_on_cancel)?;
        override_parsed(
            &lookup,
            "CHAT_CONNECTION_CHECK_INTERVAL_SECS",
            &mut config.connection_check_interval_secs,
        )?;
        override_parsed(&lookup, "CHAT_THINK", &mut config.think)?;
        override_parsed(&lookup, "CHAT_PULL_IF_MISSING", &mut config.pull_if_missing)?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.host.trim().is_empty() {
            return Err(DomainError::config_invalid("host must not be empty"));
        }
        if self.model.trim().is_empty() {
            return Err(DomainError::config_invalid("model must not be empty"));
        }
        let positive = [
            ("max_history_messages", self.max_history_messages),
            ("batch_size", self.batch_size),
            ("event_buffer", self.event_buffer),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(DomainError::config_invalid(format!("{name} must be at least 1")));
            }
        }
        let positive_secs = [
            ("request_timeout_secs", self.request_timeout_secs),
            ("connection_check_interval_secs", self.connection_check_interval_secs),
        ];
        for (name, value) in positive_secs {
            if value == 0 {
                return Err(DomainError::config_invalid(format!("{name} must be at least 1")));
            }
        }
        if self.max_backoff_ms < self.retry_backoff_ms {
            return Err(DomainError::config_invalid(
                "max_backoff_ms must not be below retry_backoff_ms",
            ));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connection_check_interval(&self) -> Duration {
        Duration::from_secs(self.connection_check_interval_secs)
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            model: self.model.clone(),
            batch_size: self.batch_size,
            max_retries: self.max_retries,
            base_delay: self.retry_backoff(),
            max_backoff: self.max_backoff(),
            timeout: self.request_timeout(),
            think: self.think,
            num_ctx: Some(self.max_context_tokens),
        }
    }
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<(), DomainError> {
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| DomainError::config_invalid(format!("{key}={raw:?} is not valid")))?;
    }
    Ok(())
}
