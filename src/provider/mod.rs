//! Provider-agnostic streaming layer.
//!
//! Every supported wire dialect is folded behind one contract: a request
//! goes in, a finite single-pass stream of `ChunkEvent`s comes out.
//! Consumers must treat streams as non-restartable.

pub mod http;
pub mod router;
pub mod sse;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::state::{PersonaConfig, Provider};

/// Role of a chat turn on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One chat turn in a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A chat-completions request, provider-neutral.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
}

impl CompletionRequest {
    /// Build a request from a persona snapshot and an assembled message list.
    pub fn from_persona(persona: &PersonaConfig, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: persona.model_name.clone(),
            messages,
            temperature: persona.temperature,
            max_tokens: persona.max_output_tokens,
            top_p: persona.top_p,
            presence_penalty: persona.presence_penalty,
            frequency_penalty: persona.frequency_penalty,
        }
    }
}

/// Token accounting reported by some providers at stream end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One event in a completion stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkEvent {
    /// A piece of generated text.
    TokenDelta(String),
    /// The provider's finish reason (`stop`, `length`, ...).
    FinishReason(String),
    /// End-of-stream token accounting.
    Usage(TokenUsage),
}

/// Error type for the provider layer.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed stream chunk: {0}")]
    Malformed(String),

    #[error("model {0} is not configured, or has no API key")]
    NotConfigured(String),

    #[error("provider {0} is not implemented")]
    NotImplemented(Provider),

    #[error("credential resolution failed: {0}")]
    Credential(String),
}

impl ProviderError {
    /// Whether a retry may help: network failures and 408/429/5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// A finite, single-pass stream of chunk events.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChunkEvent, ProviderError>> + Send>>;

/// Connection parameters for one resolved endpoint.
#[derive(Clone)]
pub struct EndpointConfig {
    pub endpoint: String,
    pub provider: Provider,
    pub api_key: String,
}

/// The uniform streaming contract every dialect implements. Abstracted as a
/// trait so orchestration tests can substitute scripted backends.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn stream_completion(
        &self,
        endpoint: &EndpointConfig,
        request: &CompletionRequest,
    ) -> Result<ChunkStream, ProviderError>;
}
