//! Completion service client
//!
//! Pipelines talk to the hosted language model through [`CompletionClient`];
//! [`OpenAiCompatClient`] is the production implementation.

mod openai;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::Result;

pub use openai::OpenAiCompatClient;

/// Timeout for a call with empty input
pub const BASE_TIMEOUT: Duration = Duration::from_secs(60);

/// Extra time granted per 1000 input characters
pub const TIMEOUT_PER_1000_CHARS: Duration = Duration::from_secs(20);

/// Upper bound of the dynamic timeout
pub const MAX_TIMEOUT: Duration = Duration::from_secs(300);

/// Default sampling temperature
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Temperature used for structured (JSON) calls
pub const JSON_TEMPERATURE: f32 = 0.3;

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One message of a completion request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Per-call options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionOptions {
    /// Defaults to [`DEFAULT_TEMPERATURE`]
    pub temperature: Option<f32>,
    /// Ask for a JSON object response
    pub json: bool,
    /// Overrides the dynamic timeout
    pub timeout: Option<Duration>,
}

impl CompletionOptions {
    /// Structured call: JSON object response at low temperature
    #[must_use]
    pub const fn json() -> Self {
        Self {
            temperature: Some(JSON_TEMPERATURE),
            json: true,
            timeout: None,
        }
    }

    /// Free-text call at the given temperature
    #[must_use]
    pub const fn text(temperature: f32) -> Self {
        Self {
            temperature: Some(temperature),
            json: false,
            timeout: None,
        }
    }
}

/// Stream of text fragments
pub type TextStream = BoxStream<'static, Result<String>>;

/// Hosted language-model completion service
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Full response text of one completion
    async fn complete(&self, messages: &[ChatMessage], options: &CompletionOptions)
    -> Result<String>;

    /// Streamed completion, one item per content fragment
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<TextStream>;
}

/// Timeout for a call: base plus 20s per 1000 input characters, capped at 5 minutes
#[must_use]
pub fn dynamic_timeout(base: Duration, messages: &[ChatMessage]) -> Duration {
    let chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
    let per_char_ms = TIMEOUT_PER_1000_CHARS.as_millis() / 1000;
    let extra = u64::try_from(chars as u128 * per_char_ms).unwrap_or(u64::MAX);
    (base + Duration::from_millis(extra)).min(MAX_TIMEOUT)
}
