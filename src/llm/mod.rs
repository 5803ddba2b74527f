//! LLM client module for interacting with language models.
//!
//! This module provides a trait-based abstraction over LLM providers,
//! with OpenRouter as the primary implementation. Calls are not retried
//! internally; transient failures surface to the caller, which folds them
//! into the task's iteration budget.

mod error;
mod openrouter;

pub use error::{classify_http_status, LlmError, LlmErrorKind};
pub use openrouter::OpenRouterClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Role in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
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

/// Token usage reported by the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Response from a chat completion call.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

/// Trait for LLM providers.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run a chat completion with the given model.
    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> Result<ChatResponse, LlmError>;
}

/// Scripted client that replays canned responses in order (for testing).
///
/// Responses are consumed front to back; once exhausted, further calls fail
/// with a network error so runaway loops show up in tests.
pub struct ScriptedLlm {
    responses: std::sync::Mutex<std::collections::VecDeque<String>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into()),
        }
    }
}

/// Client that records every message it receives and replies with one
/// canned response (for testing prompt construction).
pub struct RecordingLlm {
    messages: std::sync::Mutex<Vec<ChatMessage>>,
    response: String,
}

impl RecordingLlm {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            messages: std::sync::Mutex::new(Vec::new()),
            response: response.into(),
        }
    }

    /// Every message sent so far, in order.
    pub fn seen(&self) -> Vec<ChatMessage> {
        self.messages
            .lock()
            .expect("recorded messages poisoned")
            .clone()
    }
}

#[async_trait]
impl LlmClient for RecordingLlm {
    async fn chat(&self, _model: &str, messages: &[ChatMessage]) -> Result<ChatResponse, LlmError> {
        self.messages
            .lock()
            .expect("recorded messages poisoned")
            .extend_from_slice(messages);
        Ok(ChatResponse {
            content: self.response.clone(),
            usage: None,
        })
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
    ) -> Result<ChatResponse, LlmError> {
        let next = self
            .responses
            .lock()
            .expect("scripted responses poisoned")
            .pop_front();
        match next {
            Some(content) => Ok(ChatResponse {
                content,
                usage: None,
            }),
            None => Err(LlmError::network_error(
                "scripted responses exhausted".to_string(),
            )),
        }
    }
}
