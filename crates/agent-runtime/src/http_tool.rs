//! HTTP Tools
//!
//! A tool resolved by a remote endpoint. The request body is
//! `{"arguments": ...}`; the response is `{"result": ...}` or
//! `{"error": "..."}`.

use std::collections::BTreeMap;
use std::time::Duration;

use agent_core::tool::{ParameterSchema, Tool, ToolSpec};
use agent_core::{AgentError, ToolError};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::http::build_headers;

/// Catalog entry for an HTTP tool
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpToolConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub parameters: ParameterSchema,

    pub url: String,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Overrides the engine-wide tool timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

pub struct HttpTool {
    spec: ToolSpec,
    url: String,
    headers: HeaderMap,
    client: reqwest::Client,
}

impl HttpTool {
    pub fn new(client: reqwest::Client, config: HttpToolConfig) -> Result<Self, AgentError> {
        if url::Url::parse(&config.url).is_err() {
            return Err(AgentError::Config(format!(
                "tool '{}' has an invalid url: {}",
                config.name, config.url
            )));
        }
        let headers = build_headers(None, &config.headers)?;
        let spec = ToolSpec {
            name: config.name,
            description: config.description,
            parameters: config.parameters,
            timeout_secs: config.timeout_secs,
        };
        Ok(Self {
            spec,
            url: config.url,
            headers,
            client,
        })
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let name = &self.spec.name;
        let mut request = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .json(&json!({ "arguments": arguments }));
        if let Some(secs) = self.spec.timeout_secs {
            // the invoker enforces the same limit; this frees the connection too
            request = request.timeout(Duration::from_secs(secs));
        }

        let resp = request
            .send()
            .await
            .map_err(|e| ToolError::execution(name, format!("request failed: {e}")))?;

        let status = resp.status();
        let body: Value = resp.json().await.map_err(|e| {
            ToolError::execution(name, format!("{status}: response is not JSON: {e}"))
        })?;
        decode_tool_response(name, status.is_success(), body)
    }
}

/// Interpret an HTTP tool response body.
pub fn decode_tool_response(tool: &str, success: bool, body: Value) -> Result<Value, ToolError> {
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        let message = error.as_str().map_or_else(|| error.to_string(), str::to_string);
        return Err(ToolError::execution(tool, message));
    }
    if !success {
        return Err(ToolError::execution(tool, format!("tool endpoint failed: {body}")));
    }
    match body {
        Value::Object(mut map) if map.contains_key("result") => Ok(map.remove("result").unwrap_or(Value::Null)),
        other => Err(ToolError::execution(
            tool,
            format!("response has neither 'result' nor 'error': {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_result_and_error() {
        assert_eq!(
            decode_tool_response("t", true, json!({"result": {"rows": [1, 2]}})).unwrap(),
            json!({"rows": [1, 2]})
        );
        assert_eq!(
            decode_tool_response("t", true, json!({"error": "quota exceeded"})).unwrap_err(),
            ToolError::execution("t", "quota exceeded")
        );
        assert!(decode_tool_response("t", false, json!({"detail": "boom"})).is_err());
        assert!(decode_tool_response("t", true, json!({"unexpected": 1})).is_err());
        assert_eq!(
            decode_tool_response("t", true, json!({"result": null, "error": null})).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_config_from_catalog_json() {
        let config: HttpToolConfig = serde_json::from_value(json!({
            "name": "web_search",
            "description": "Search the web",
            "url": "https://tools.internal/search",
            "parameters": {
                "type": "object",
                "properties": { "query": { "type": "string" } },
                "required": ["query"]
            },
            "timeout_secs": 5
        }))
        .unwrap();
        let tool = HttpTool::new(reqwest::Client::new(), config).unwrap();
        let spec = tool.spec();
        assert_eq!(spec.timeout_secs, Some(5));
        assert!(spec.parameters.validate(&json!({"query": "rust"})).is_ok());
        assert!(spec.parameters.validate(&json!({})).is_err());
    }

    #[test]
    fn test_rejects_bad_url() {
        let config = HttpToolConfig {
            name: "broken".into(),
            description: String::new(),
            parameters: ParameterSchema::new(),
            url: "not a url".into(),
            headers: BTreeMap::new(),
            timeout_secs: None,
        };
        assert!(matches!(
            HttpTool::new(reqwest::Client::new(), config),
            Err(AgentError::Config(_))
        ));
    }
}
