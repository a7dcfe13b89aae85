//! Language-model integration.
//!
//! Defines the `LanguageModel` trait used by the synthesis engine and
//! provides implementations for OpenAI Chat Completions and the
//! Anthropic Messages API. Both route their HTTP calls through a shared
//! `RateLimitedClient`.

pub mod anthropic;
pub mod openai;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::net::ClientError;

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
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

/// A complete request: system instructions plus the conversation so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub messages: Vec<ChatMessage>,
}

/// Abstraction over chat-completion providers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Send the prompt and return the assistant's reply text.
    async fn complete(&self, prompt: &Prompt) -> Result<String, ClientError>;

    /// Approximate spend so far, in USD.
    fn cumulative_cost(&self) -> Decimal;
}
