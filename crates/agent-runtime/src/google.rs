//! Google Gemini Provider
//!
//! `generateContent` wire format. Gemini has no tool-call ids, so function
//! responses are matched to calls by name and ids are assigned on decode.

use std::collections::HashMap;
use std::time::Duration;

use agent_core::provider::{ChatRequest, ChatResponse, FinishReason, ProviderAdapter, TokenUsage};
use agent_core::{AgentError, Message, ModelEndpoint, ProviderError, ProviderKind, Role, ToolCallRequest};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::http::{build_headers, post_json};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GoogleAdapter {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl GoogleAdapter {
    pub fn new(client: reqwest::Client, endpoint: &ModelEndpoint, api_key: Option<String>) -> Result<Self, AgentError> {
        Ok(Self {
            client,
            url: generate_url(&endpoint.base_url, &endpoint.model),
            headers: build_headers(api_key.map(|k| ("x-goog-api-key", k)), &endpoint.custom_headers)?,
            timeout: endpoint.request_timeout(),
        })
    }
}

fn generate_url(base_url: &str, model: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    let base = if base.is_empty() { DEFAULT_BASE_URL } else { base };
    if base.contains(":generateContent") {
        return base.to_string();
    }
    let base = if base.ends_with("/v1beta") || base.ends_with("/v1") {
        base.to_string()
    } else {
        format!("{base}/v1beta")
    };
    let model = model.strip_prefix("models/").unwrap_or(model);
    format!("{base}/models/{model}:generateContent")
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = encode_request(request);
        tracing::debug!(url = %self.url, model = %request.model, "Gemini generateContent request");
        let raw = post_json(&self.client, &self.url, &self.headers, &body, self.timeout).await?;
        decode_response(raw, &request.model)
    }
}

/// Canonical request → `generateContent` body
pub fn encode_request(request: &ChatRequest) -> Value {
    // call id → tool name, for functionResponse parts
    let mut call_names: HashMap<&str, &str> = HashMap::new();
    let mut contents: Vec<(&'static str, Vec<Value>)> = Vec::new();

    for msg in &request.messages {
        let (role, parts) = match msg.role {
            Role::System => continue,
            Role::User => ("user", vec![json!({ "text": msg.text() })]),
            Role::Assistant => {
                let mut parts = Vec::new();
                if !msg.text().is_empty() {
                    parts.push(json!({ "text": msg.text() }));
                }
                for call in msg.requested_calls() {
                    call_names.insert(call.id.as_str(), call.name.as_str());
                    parts.push(json!({ "functionCall": { "name": call.name, "args": call.arguments } }));
                }
                ("model", parts)
            }
            Role::Tool => {
                let id = msg.tool_call_id.as_deref().unwrap_or_default();
                let name = call_names.get(id).copied().unwrap_or(id);
                let response = match serde_json::from_str::<Value>(msg.text()) {
                    Ok(Value::Object(map)) => Value::Object(map),
                    Ok(other) => json!({ "result": other }),
                    Err(_) => json!({ "result": msg.text() }),
                };
                ("user", vec![json!({ "functionResponse": { "name": name, "response": response } })])
            }
        };
        if parts.is_empty() {
            continue;
        }

        if let Some((last_role, last_parts)) = contents.last_mut() {
            if *last_role == role {
                last_parts.extend(parts);
                continue;
            }
        }
        contents.push((role, parts));
    }

    let contents: Vec<Value> = contents
        .into_iter()
        .map(|(role, parts)| json!({ "role": role, "parts": parts }))
        .collect();

    let mut body = Map::new();
    body.insert("contents".into(), Value::Array(contents));
    if !request.system_prompt.trim().is_empty() {
        body.insert(
            "systemInstruction".into(),
            json!({ "parts": [{ "text": request.system_prompt }] }),
        );
    }

    let s = &request.sampling;
    let mut config = Map::new();
    for (key, value) in [
        ("temperature", s.temperature),
        ("topP", s.top_p),
        ("frequencyPenalty", s.frequency_penalty),
        ("presencePenalty", s.presence_penalty),
    ] {
        if let Some(v) = value {
            config.insert(key.into(), json!(v));
        }
    }
    if let Some(max) = s.max_tokens {
        config.insert("maxOutputTokens".into(), json!(max));
    }
    if !config.is_empty() {
        body.insert("generationConfig".into(), Value::Object(config));
    }

    if !request.tools.is_empty() {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|t| json!({ "name": t.name, "description": t.description, "parameters": t.parameters }))
            .collect();
        body.insert("tools".into(), json!([{ "functionDeclarations": declarations }]));
    }
    Value::Object(body)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    usage_metadata: Option<WireUsage>,
    model_version: Option<String>,
    prompt_feedback: Option<WirePromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    content: Option<WireContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    text: Option<String>,
    function_call: Option<WireFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUsage {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePromptFeedback {
    block_reason: Option<String>,
}

/// `generateContent` body → canonical response
pub fn decode_response(raw: Value, requested_model: &str) -> Result<ChatResponse, ProviderError> {
    let parsed: WireResponse = serde_json::from_value(raw)
        .map_err(|e| ProviderError::MalformedResponse(format!("unexpected generateContent shape: {e}")))?;

    let Some(candidate) = parsed.candidates.into_iter().next() else {
        let reason = parsed
            .prompt_feedback
            .and_then(|f| f.block_reason)
            .unwrap_or_else(|| "no candidates".into());
        return Err(ProviderError::MalformedResponse(format!("response has no candidates: {reason}")));
    };

    let mut text = String::new();
    let mut calls = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(t) = part.text {
            text.push_str(&t);
        }
        if let Some(call) = part.function_call {
            let args = if call.args.is_null() { json!({}) } else { call.args };
            let id = format!("{}_{}", call.name, calls.len());
            calls.push(ToolCallRequest::new(id, call.name, args));
        }
    }

    let content = if text.is_empty() && !calls.is_empty() { None } else { Some(text) };
    let usage = parsed.usage_metadata.and_then(|u| {
        Some(TokenUsage {
            input_tokens: u.prompt_token_count?,
            output_tokens: u.candidates_token_count.unwrap_or(0),
        })
    });

    Ok(ChatResponse {
        message: Message::assistant_with_tools(content, calls),
        model: parsed.model_version.unwrap_or_else(|| requested_model.to_string()),
        usage,
        finish_reason: candidate.finish_reason.as_deref().map(FinishReason::from_provider),
    })
}
