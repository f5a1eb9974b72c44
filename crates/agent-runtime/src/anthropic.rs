//! Anthropic Messages Provider
//!
//! `x-api-key` auth, top-level system prompt, `tool_use` / `tool_result`
//! content blocks. Consecutive tool results are merged into one user turn
//! since the API requires alternating roles.

use std::time::Duration;

use agent_core::provider::{ChatRequest, ChatResponse, FinishReason, ProviderAdapter, TokenUsage};
use agent_core::{AgentError, Message, ModelEndpoint, ProviderError, ProviderKind, Role, ToolCallRequest};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::http::{build_headers, post_json};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// `max_tokens` is mandatory on this API
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicAdapter {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl AnthropicAdapter {
    pub fn new(client: reqwest::Client, endpoint: &ModelEndpoint, api_key: Option<String>) -> Result<Self, AgentError> {
        let mut headers = build_headers(api_key.map(|k| ("x-api-key", k)), &endpoint.custom_headers)?;
        let version = HeaderName::from_static("anthropic-version");
        if !headers.contains_key(&version) {
            headers.insert(version, HeaderValue::from_static(API_VERSION));
        }
        Ok(Self {
            client,
            url: messages_url(&endpoint.base_url),
            headers,
            timeout: endpoint.request_timeout(),
        })
    }
}

fn messages_url(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    let base = if base.is_empty() { DEFAULT_BASE_URL } else { base };
    if base.ends_with("/messages") {
        base.to_string()
    } else if base.ends_with("/v1") {
        format!("{base}/messages")
    } else {
        format!("{base}/v1/messages")
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = encode_request(request);
        tracing::debug!(url = %self.url, model = %request.model, "Anthropic messages request");
        let raw = post_json(&self.client, &self.url, &self.headers, &body, self.timeout).await?;
        decode_response(raw, &request.model)
    }
}

/// Canonical request → Messages API body. Penalties are not supported by
/// this API and are dropped.
pub fn encode_request(request: &ChatRequest) -> Value {
    let mut turns: Vec<(&'static str, Vec<Value>)> = Vec::new();

    for msg in &request.messages {
        let (role, blocks) = match msg.role {
            Role::System => continue,
            Role::User => ("user", vec![json!({ "type": "text", "text": msg.text() })]),
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !msg.text().trim().is_empty() {
                    blocks.push(json!({ "type": "text", "text": msg.text() }));
                }
                for call in msg.requested_calls() {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": input_object(&call.arguments),
                    }));
                }
                if blocks.is_empty() {
                    blocks.push(json!({ "type": "text", "text": "" }));
                }
                ("assistant", blocks)
            }
            Role::Tool => (
                "user",
                vec![json!({
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "content": msg.text(),
                    "is_error": is_error_payload(msg.text()),
                })],
            ),
        };

        if let Some((last_role, last_blocks)) = turns.last_mut() {
            if *last_role == role {
                last_blocks.extend(blocks);
                continue;
            }
        }
        turns.push((role, blocks));
    }

    let messages: Vec<Value> = turns
        .into_iter()
        .map(|(role, content)| json!({ "role": role, "content": content }))
        .collect();

    let mut body = Map::new();
    body.insert("model".into(), json!(request.model));
    body.insert("messages".into(), Value::Array(messages));
    body.insert(
        "max_tokens".into(),
        json!(request.sampling.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    if !request.system_prompt.trim().is_empty() {
        body.insert("system".into(), json!(request.system_prompt));
    }
    if let Some(t) = request.sampling.temperature {
        // Anthropic caps temperature at 1.0
        body.insert("temperature".into(), json!(t.min(1.0)));
    }
    if let Some(p) = request.sampling.top_p {
        body.insert("top_p".into(), json!(p));
    }

    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();
        body.insert("tools".into(), Value::Array(tools));
    }
    Value::Object(body)
}

/// `input` must be an object on the wire
fn input_object(arguments: &Value) -> Value {
    match arguments {
        Value::Object(_) => arguments.clone(),
        Value::Null => json!({}),
        other => json!({ "value": other }),
    }
}

fn is_error_payload(content: &str) -> bool {
    serde_json::from_str::<Value>(content)
        .ok()
        .is_some_and(|v| v.get("error").is_some() && v.get("kind").is_some())
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    content: Vec<WireBlock>,
    model: Option<String>,
    stop_reason: Option<String>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

/// Messages API body → canonical response
pub fn decode_response(raw: Value, requested_model: &str) -> Result<ChatResponse, ProviderError> {
    let parsed: WireResponse = serde_json::from_value(raw)
        .map_err(|e| ProviderError::MalformedResponse(format!("unexpected message shape: {e}")))?;

    let mut text = String::new();
    let mut calls = Vec::new();
    for block in parsed.content {
        match block {
            WireBlock::Text { text: t } => text.push_str(&t),
            WireBlock::ToolUse { id, name, input } => calls.push(ToolCallRequest::new(id, name, input)),
            WireBlock::Other => {}
        }
    }

    let content = if text.is_empty() && !calls.is_empty() { None } else { Some(text) };
    let usage = parsed.usage.and_then(|u| {
        Some(TokenUsage {
            input_tokens: u.input_tokens?,
            output_tokens: u.output_tokens?,
        })
    });

    Ok(ChatResponse {
        message: Message::assistant_with_tools(content, calls),
        model: parsed.model.unwrap_or_else(|| requested_model.to_string()),
        usage,
        finish_reason: parsed.stop_reason.as_deref().map(FinishReason::from_provider),
    })
}

#[cfg(test)]
mod tests {
    use agent_core::SamplingParams;

    use super::*;

    fn request(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: "claude-3-5-sonnet".into(),
            system_prompt: "You are terse.".into(),
            messages,
            sampling: SamplingParams {
                temperature: Some(1.5),
                top_p: None,
                frequency_penalty: Some(0.3),
                presence_penalty: Some(0.3),
                max_tokens: None,
            },
            tools: Vec::new(),
        }
    }

    #[test]
    fn test_messages_url() {
        assert_eq!(messages_url(""), "https://api.anthropic.com/v1/messages");
        assert_eq!(messages_url("https://api.anthropic.com/"), "https://api.anthropic.com/v1/messages");
        assert_eq!(messages_url("https://proxy.local/v1"), "https://proxy.local/v1/messages");
    }

    #[test]
    fn test_encode_drops_penalties_and_caps_temperature() {
        let body = encode_request(&request(vec![Message::user("hi")]));
        assert_eq!(body["system"], "You are terse.");
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["temperature"], json!(1.0));
        assert!(body.get("frequency_penalty").is_none());
        assert!(body.get("presence_penalty").is_none());
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_parallel_tool_results_share_one_user_turn() {
        let history = vec![
            Message::user("compare"),
            Message::assistant_with_tools(
                Some("checking".into()),
                vec![
                    ToolCallRequest::new("t1", "calculator", json!({"expression": "1+1"})),
                    ToolCallRequest::new("t2", "calculator", json!({"expression": "2+2"})),
                ],
            ),
            Message::tool("t1", r#"{"result":2}"#),
            Message::tool("t2", r#"{"error":"boom","kind":"ToolExecutionError"}"#),
        ];
        let body = encode_request(&request(history));
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["content"][0]["type"], "text");
        assert_eq!(messages[1]["content"][2]["id"], "t2");
        let results = messages[2]["content"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["tool_use_id"], "t1");
        assert_eq!(results[0]["is_error"], false);
        assert_eq!(results[1]["is_error"], true);
    }

    #[test]
    fn test_tool_arguments_round_trip() {
        let args = json!({"query": "rust", "filters": {"year": [2023, 2024], "exact": true}});
        let history = vec![
            Message::user("search"),
            Message::assistant_with_tools(None, vec![ToolCallRequest::new("toolu_1", "search", args.clone())]),
            Message::tool("toolu_1", "[]"),
        ];
        let body = encode_request(&request(history));
        let input = body["messages"][1]["content"][0]["input"].clone();
        assert_eq!(input, args);

        let response = json!({
            "id": "msg_1",
            "model": "claude-3-5-sonnet-20241022",
            "content": [
                { "type": "text", "text": "Let me search." },
                { "type": "tool_use", "id": "toolu_2", "name": "search", "input": input }
            ],
            "stop_reason": "tool_use",
            "usage": { "input_tokens": 100, "output_tokens": 20 }
        });
        let decoded = decode_response(response, "claude").unwrap();
        assert_eq!(decoded.message.text(), "Let me search.");
        assert_eq!(decoded.message.requested_calls()[0].arguments, args);
        assert_eq!(decoded.finish_reason, Some(FinishReason::ToolUse));
        assert_eq!(decoded.usage.unwrap().input_tokens, 100);
    }

    #[test]
    fn test_decode_ignores_unknown_blocks() {
        let decoded = decode_response(
            json!({
                "content": [{ "type": "thinking", "thinking": "..." }, { "type": "text", "text": "ok" }],
                "stop_reason": "end_turn"
            }),
            "claude",
        )
        .unwrap();
        assert_eq!(decoded.message.text(), "ok");
        assert!(decoded.usage.is_none());
        assert!(decode_response(json!({"type": "error"}), "claude").is_err());
    }

    #[test]
    fn test_auth_header() {
        let endpoint = ModelEndpoint::new("c", ProviderKind::Anthropic, "", "claude");
        let adapter = AnthropicAdapter::new(reqwest::Client::new(), &endpoint, Some("sk-ant".into())).unwrap();
        assert_eq!(adapter.headers["x-api-key"], "sk-ant");
        assert_eq!(adapter.headers["anthropic-version"], API_VERSION);
        assert!(adapter.headers.get("authorization").is_none());
    }
}
