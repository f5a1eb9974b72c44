//! Provider Adapter Strategy
//!
//! Defines the one canonical call shape every LLM backend is driven through.
//! Each provider kind implements [`ProviderAdapter`] and owns its own request
//! construction, auth headers and response parsing.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_core::provider::{AdapterFactory, ChatRequest};
//!
//! let adapter = factory.build(&endpoint)?;
//! let response = adapter.send(&request).await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{ModelEndpoint, ProviderKind, SamplingParams};
use crate::error::ProviderError;
use crate::message::Message;
use crate::tool::ParameterSchema;

/// A tool as declared to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
}

/// Canonical chat request handed to an adapter.
#[derive(Clone, Debug, Serialize)]
pub struct ChatRequest {
    /// Model name sent on the wire
    pub model: String,

    pub system_prompt: String,

    /// Conversation without system messages, oldest first
    pub messages: Vec<Message>,

    pub sampling: SamplingParams,

    /// Tools the model may call this turn
    pub tools: Vec<ToolDeclaration>,
}

/// Token usage statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Reason for completion finishing
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolUse,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    /// Map the assorted provider spellings onto one enum.
    pub fn from_provider(raw: &str) -> Self {
        match raw {
            "stop" | "end_turn" | "STOP" | "stop_sequence" => FinishReason::Stop,
            "length" | "max_tokens" | "MAX_TOKENS" => FinishReason::Length,
            "tool_calls" | "tool_use" | "function_call" => FinishReason::ToolUse,
            "content_filter" | "SAFETY" | "RECITATION" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

/// Canonical response from one model call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Assistant message with text and/or tool calls
    pub message: Message,

    /// Model that generated this response
    pub model: String,

    /// Token usage, if the provider reported it
    pub usage: Option<TokenUsage>,

    pub finish_reason: Option<FinishReason>,
}

/// Strategy trait for LLM providers
///
/// Adapters are stateless translators: safe to share across concurrent runs,
/// and they never retry on their own.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Perform one model call
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Builds the adapter for an endpoint. Dispatch on [`ProviderKind`] happens
/// here, once per run, not per call.
/// Invalid endpoint configuration (bad header values, unusable URL) is
/// reported as [`AgentError::Config`](crate::AgentError::Config).
pub trait AdapterFactory: Send + Sync {
    fn build(&self, endpoint: &ModelEndpoint) -> crate::Result<Arc<dyn ProviderAdapter>>;
}
