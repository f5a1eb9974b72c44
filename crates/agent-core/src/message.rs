//! Canonical Messages
//!
//! The single provider-agnostic message shape the reasoning loop works on.
//! Provider adapters translate to and from their wire formats at the edge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a message sender
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt/instructions
    System,
    /// User input
    User,
    /// Assistant (LLM) response
    Assistant,
    /// Tool result, answering a call id issued by an assistant message
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Call id, echoed back on the matching `tool` message
    pub id: String,

    /// Tool name as declared to the model
    pub name: String,

    /// Parsed arguments
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// A single message in a conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message role
    pub role: Role,

    /// Text content (assistant messages that only call tools may have none)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Tool calls requested by an assistant message, in request order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,

    /// Originating call id (tool messages only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Timestamp
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a new text message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant message carrying tool calls
    pub fn assistant_with_tools(content: Option<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls: if calls.is_empty() { None } else { Some(calls) },
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a tool result message
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            timestamp: Utc::now(),
        }
    }

    /// Tool calls requested by this message (empty for non-assistant roles)
    pub fn requested_calls(&self) -> &[ToolCallRequest] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.requested_calls().is_empty()
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// Estimate token count (rough approximation)
    pub fn estimate_tokens(&self) -> u32 {
        let mut chars = self.text().len();
        for call in self.requested_calls() {
            chars += call.name.len() + call.arguments.to_string().len();
        }
        // ~4 characters per token, +4 for role overhead
        u32::try_from(chars / 4).unwrap_or(u32::MAX).saturating_add(4)
    }
}

/// Rough token estimate for a piece of text.
pub fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.len() / 4).unwrap_or(u32::MAX)
}

/// Split history into turns. A turn starts at a user message and runs up to
/// the next one; anything before the first user message forms its own turn.
/// System messages are dropped since the loop supplies its own prompt.
fn turns(history: &[Message]) -> Vec<&[Message]> {
    let mut out = Vec::new();
    let mut start = None;
    for (i, msg) in history.iter().enumerate() {
        if msg.role == Role::System {
            continue;
        }
        match start {
            None => start = Some(i),
            Some(s) if msg.role == Role::User => {
                out.push(&history[s..i]);
                start = Some(i);
            }
            Some(_) => {}
        }
    }
    if let Some(s) = start {
        out.push(&history[s..]);
    }
    out
}

/// Keep the most recent `window` turns of `history`, oldest dropped first.
///
/// `window == 0` disables windowing. System messages are never part of the
/// result; the caller prepends the agent's own system prompt.
pub fn window_turns(history: &[Message], window: usize) -> Vec<Message> {
    let all = turns(history);
    let skip = if window == 0 {
        0
    } else {
        all.len().saturating_sub(window)
    };
    all[skip..]
        .iter()
        .flat_map(|turn| turn.iter().filter(|m| m.role != Role::System).cloned())
        .collect()
}

/// Drop whole oldest turns while the estimated prompt exceeds `max_tokens`.
/// The newest turn always survives, even if it alone is too large.
pub fn fit_to_context(system_prompt: &str, history: Vec<Message>, max_tokens: u32) -> Vec<Message> {
    if max_tokens == 0 {
        return history;
    }
    let budget = max_tokens.saturating_sub(estimate_tokens(system_prompt));
    let turn_sizes: Vec<(usize, u32)> = turns(&history)
        .iter()
        .map(|t| (t.len(), t.iter().map(Message::estimate_tokens).sum()))
        .collect();

    let mut total: u32 = turn_sizes.iter().map(|(_, tokens)| tokens).sum();
    let mut drop_messages = 0;
    for (count, tokens) in turn_sizes.iter().take(turn_sizes.len().saturating_sub(1)) {
        if total <= budget {
            break;
        }
        total -= tokens;
        drop_messages += count;
    }
    if drop_messages > 0 {
        tracing::debug!(dropped = drop_messages, "Trimmed history to fit context length");
    }
    history.into_iter().skip(drop_messages).collect()
}
