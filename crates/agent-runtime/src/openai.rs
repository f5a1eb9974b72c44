//! OpenAI-compatible Provider
//!
//! Chat Completions wire format, spoken by OpenAI itself and by most local
//! servers (Ollama, vLLM, LM Studio). The `custom` endpoint kind reuses the
//! same body but posts to the configured URL verbatim.

use std::time::Duration;

use agent_core::provider::{ChatRequest, ChatResponse, FinishReason, ProviderAdapter, TokenUsage};
use agent_core::{AgentError, Message, ModelEndpoint, ProviderError, ProviderKind, Role, ToolCallRequest};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::http::{build_headers, parse_arguments, post_json};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiCompatibleAdapter {
    client: reqwest::Client,
    kind: ProviderKind,
    url: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl OpenAiCompatibleAdapter {
    /// `api_key` is sent as a bearer token; `None` sends no auth header.
    pub fn new(client: reqwest::Client, endpoint: &ModelEndpoint, api_key: Option<String>) -> Result<Self, AgentError> {
        let url = match endpoint.kind {
            ProviderKind::Custom => endpoint.base_url.trim().to_string(),
            _ => format!("{}/chat/completions", normalize_base_url(&endpoint.base_url)),
        };
        let auth = api_key.map(|key| ("authorization", format!("Bearer {key}")));
        Ok(Self {
            client,
            kind: endpoint.kind,
            url,
            headers: build_headers(auth, &endpoint.custom_headers)?,
            timeout: endpoint.request_timeout(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = encode_request(request);
        tracing::debug!(url = %self.url, model = %request.model, "Chat completion request");
        let raw = post_json(&self.client, &self.url, &self.headers, &body, self.timeout).await?;
        decode_response(raw, &request.model)
    }
}

/// Canonical request → Chat Completions body
pub fn encode_request(request: &ChatRequest) -> Value {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if !request.system_prompt.trim().is_empty() {
        messages.push(json!({ "role": "system", "content": request.system_prompt }));
    }
    messages.extend(request.messages.iter().map(encode_message));

    let mut body = Map::new();
    body.insert("model".into(), json!(request.model));
    body.insert("messages".into(), Value::Array(messages));

    let s = &request.sampling;
    for (key, value) in [
        ("temperature", s.temperature),
        ("top_p", s.top_p),
        ("frequency_penalty", s.frequency_penalty),
        ("presence_penalty", s.presence_penalty),
    ] {
        if let Some(v) = value {
            body.insert(key.into(), json!(v));
        }
    }
    if let Some(max) = s.max_tokens {
        body.insert("max_tokens".into(), json!(max));
    }

    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body.insert("tools".into(), Value::Array(tools));
        body.insert("tool_choice".into(), json!("auto"));
    }
    Value::Object(body)
}

fn encode_message(msg: &Message) -> Value {
    let mut out = Map::new();
    out.insert("role".into(), json!(msg.role.to_string()));
    out.insert("content".into(), msg.content.clone().map_or(Value::Null, Value::String));

    if msg.role == Role::Tool {
        if let Some(id) = &msg.tool_call_id {
            out.insert("tool_call_id".into(), json!(id));
        }
    }

    if msg.has_tool_calls() {
        let calls: Vec<Value> = msg
            .requested_calls()
            .iter()
            .map(|tc| {
                json!({
                    "id": tc.id,
                    "type": "function",
                    "function": { "name": tc.name, "arguments": tc.arguments.to_string() },
                })
            })
            .collect();
        out.insert("tool_calls".into(), Value::Array(calls));
    }
    Value::Object(out)
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    model: Option<String>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
    /// Missing or `null` when the model answered in text
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    /// Usually a JSON string; some local servers send an object
    #[serde(default)]
    arguments: Value,
}

/// Chat Completions body → canonical response
pub fn decode_response(raw: Value, requested_model: &str) -> Result<ChatResponse, ProviderError> {
    let parsed: WireResponse = serde_json::from_value(raw)
        .map_err(|e| ProviderError::MalformedResponse(format!("unexpected completion shape: {e}")))?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::MalformedResponse("response has no choices".into()))?;

    let calls: Vec<ToolCallRequest> = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            let arguments = match tc.function.arguments {
                Value::String(raw) => parse_arguments(&raw),
                Value::Null => Value::Object(Map::new()),
                other => other,
            };
            ToolCallRequest::new(tc.id, tc.function.name, arguments)
        })
        .collect();

    let content = choice.message.content.filter(|c| !c.is_empty() || calls.is_empty());
    let usage = parsed.usage.and_then(|u| {
        Some(TokenUsage {
            input_tokens: u.prompt_tokens?,
            output_tokens: u.completion_tokens?,
        })
    });

    Ok(ChatResponse {
        message: Message::assistant_with_tools(content, calls),
        model: parsed.model.unwrap_or_else(|| requested_model.to_string()),
        usage,
        finish_reason: choice.finish_reason.as_deref().map(FinishReason::from_provider),
    })
}

/// Accept bare hosts, `/v1` bases and full `/chat/completions` URLs alike.
pub fn normalize_base_url(base_url: &str) -> String {
    let base = base_url.trim();
    if base.is_empty() {
        return DEFAULT_BASE_URL.to_string();
    }

    let trimmed = base.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/chat/completions").unwrap_or(trimmed);

    // only append /v1 when no path was given
    match url::Url::parse(trimmed) {
        Ok(url) if url.path().is_empty() || url.path() == "/" => format!("{trimmed}/v1"),
        _ => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use agent_core::provider::ToolDeclaration;
    use agent_core::tool::{ParamType, ParameterSchema, PropertySchema};
    use agent_core::SamplingParams;

    use super::*;

    fn request(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: "gpt-4o".into(),
            system_prompt: "Be brief.".into(),
            messages,
            sampling: SamplingParams {
                temperature: Some(0.2),
                top_p: None,
                frequency_penalty: Some(0.5),
                presence_penalty: None,
                max_tokens: Some(256),
            },
            tools: vec![ToolDeclaration {
                name: "calculator".into(),
                description: "math".into(),
                parameters: ParameterSchema::new().property(
                    "expression",
                    PropertySchema::new(ParamType::String, "expr"),
                    true,
                ),
            }],
        }
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url(""), "https://api.openai.com/v1");
        assert_eq!(normalize_base_url("http://localhost:11434"), "http://localhost:11434/v1");
        assert_eq!(normalize_base_url("http://localhost:11434/"), "http://localhost:11434/v1");
        assert_eq!(normalize_base_url("https://api.groq.com/openai/v1/"), "https://api.groq.com/openai/v1");
        assert_eq!(
            normalize_base_url("https://api.openai.com/v1/chat/completions"),
            "https://api.openai.com/v1"
        );
    }

    #[test]
    fn test_encode_request_shape() {
        let body = encode_request(&request(vec![Message::user("hi")]));
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["frequency_penalty"], json!(0.5));
        assert!(body.get("top_p").is_none());
        assert!(body.get("presence_penalty").is_none());
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["tools"][0]["function"]["parameters"]["type"], "object");
        assert_eq!(body["tool_choice"], "auto");
    }

    #[test]
    fn test_tool_arguments_round_trip() {
        let args = json!({"expression": "21*2", "options": {"precision": 2, "tags": ["a", "b"]}});
        let history = vec![
            Message::user("what is 21*2?"),
            Message::assistant_with_tools(None, vec![ToolCallRequest::new("call_1", "calculator", args.clone())]),
            Message::tool("call_1", r#"{"result":42}"#),
        ];
        let body = encode_request(&request(history));

        let wire_call = &body["messages"][2]["tool_calls"][0];
        assert_eq!(wire_call["id"], "call_1");
        let encoded = wire_call["function"]["arguments"].as_str().unwrap();
        assert_eq!(serde_json::from_str::<Value>(encoded).unwrap(), args);
        assert_eq!(body["messages"][3]["tool_call_id"], "call_1");
        assert_eq!(body["messages"][2]["content"], Value::Null);

        // the provider echoes the same call back
        let response = json!({
            "model": "gpt-4o-2024",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_2",
                        "type": "function",
                        "function": { "name": "calculator", "arguments": encoded }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 40, "completion_tokens": 12 }
        });
        let decoded = decode_response(response, "gpt-4o").unwrap();
        let call = &decoded.message.requested_calls()[0];
        assert_eq!(call.arguments, args);
        assert_eq!(call.id, "call_2");
        assert_eq!(decoded.finish_reason, Some(FinishReason::ToolUse));
        assert_eq!(decoded.usage.unwrap().total(), 52);
        assert_eq!(decoded.model, "gpt-4o-2024");
    }

    #[test]
    fn test_decode_text_and_missing_usage() {
        let decoded = decode_response(
            json!({"choices": [{"message": {"content": "42"}, "finish_reason": "stop"}]}),
            "llama3",
        )
        .unwrap();
        assert_eq!(decoded.message.text(), "42");
        assert_eq!(decoded.message.role, Role::Assistant);
        assert!(decoded.usage.is_none());
        assert_eq!(decoded.model, "llama3");
    }

    #[test]
    fn test_null_tool_calls_is_text_answer() {
        let decoded = decode_response(
            json!({
                "choices": [{
                    "message": { "role": "assistant", "content": "hello", "tool_calls": null },
                    "finish_reason": "stop"
                }]
            }),
            "qwen2.5",
        )
        .unwrap();
        assert_eq!(decoded.message.text(), "hello");
        assert!(!decoded.message.has_tool_calls());
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            decode_response(json!({"choices": []}), "m"),
            Err(ProviderError::MalformedResponse(_))
        ));
        assert!(matches!(
            decode_response(json!({"error": "boom", "choices": "nope"}), "m"),
            Err(ProviderError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_custom_kind_posts_verbatim() {
        let endpoint = ModelEndpoint::new(
            "gw",
            ProviderKind::Custom,
            "https://gateway.internal/llm/invoke",
            "house-model",
        );
        let adapter = OpenAiCompatibleAdapter::new(reqwest::Client::new(), &endpoint, None).unwrap();
        assert_eq!(adapter.url(), "https://gateway.internal/llm/invoke");
        assert!(adapter.headers.get("authorization").is_none());

        let endpoint = ModelEndpoint::new("oa", ProviderKind::OpenaiCompatible, "https://api.openai.com", "gpt-4o");
        let adapter =
            OpenAiCompatibleAdapter::new(reqwest::Client::new(), &endpoint, Some("sk-test".into())).unwrap();
        assert_eq!(adapter.url(), "https://api.openai.com/v1/chat/completions");
        assert_eq!(adapter.headers["authorization"], "Bearer sk-test");
    }
}
