//! Tool Invoker
//!
//! Executes one named tool call for a run: enabled-list check, schema
//! validation, per-tool timeout. Results and failures are both turned into
//! `tool` messages by the reasoning loop; nothing here aborts a run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::{ErrorKind, ToolError};
use crate::message::{Message, ToolCallRequest};
use crate::tool::ToolRegistry;

/// Successful tool execution
#[derive(Clone, Debug, PartialEq)]
pub struct ToolOutput {
    pub value: Value,
    pub duration: Duration,
}

/// Per-run view of the registry restricted to an agent's enabled tools.
#[derive(Clone)]
pub struct ToolInvoker {
    registry: Arc<ToolRegistry>,
    enabled: HashSet<String>,
    default_timeout: Duration,
}

impl ToolInvoker {
    pub fn new(registry: Arc<ToolRegistry>, enabled: &[String], default_timeout: Duration) -> Self {
        Self {
            registry,
            enabled: enabled.iter().cloned().collect(),
            default_timeout,
        }
    }

    /// Invoke `name` with `arguments`.
    ///
    /// Disabled or unregistered tools and arguments that fail the declared
    /// schema are rejected before the tool implementation is touched.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolOutput, ToolError> {
        if !self.enabled.contains(name) {
            return Err(ToolError::ToolNotFound(name.to_string()));
        }
        let tool = self
            .registry
            .get(name)
            .ok_or_else(|| ToolError::ToolNotFound(name.to_string()))?;

        let spec = tool.spec();
        spec.parameters
            .validate(&arguments)
            .map_err(|reason| ToolError::InvalidArguments {
                tool: name.to_string(),
                reason,
            })?;

        let limit = spec.timeout_secs.map_or(self.default_timeout, Duration::from_secs);
        let start = Instant::now();
        let value = tokio::time::timeout(limit, tool.call(arguments))
            .await
            .map_err(|_| ToolError::ToolTimeout {
                tool: name.to_string(),
                after: limit,
            })??;

        let duration = start.elapsed();
        tracing::debug!(tool = %name, duration_ms = duration.as_millis(), "Tool executed");
        Ok(ToolOutput { value, duration })
    }
}

/// Lifecycle of a tool call inside a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Success,
    Error,
}

/// Record of a single tool call, owned by the assistant message that requested it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub result: Option<Value>,
    pub status: ToolCallStatus,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,

    /// Index of the requesting assistant message within the run's messages
    pub message_index: usize,
}

impl ToolCallRecord {
    pub fn pending(call: &ToolCallRequest, message_index: usize) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            result: None,
            status: ToolCallStatus::Pending,
            duration_ms: 0,
            error: None,
            error_kind: None,
            message_index,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.status, ToolCallStatus::Success | ToolCallStatus::Error)
    }

    /// Close the record from the invoker's answer.
    pub fn close(&mut self, outcome: &Result<ToolOutput, ToolError>, elapsed: Duration) {
        self.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        match outcome {
            Ok(output) => {
                self.status = ToolCallStatus::Success;
                self.result = Some(output.value.clone());
            }
            Err(e) => {
                self.status = ToolCallStatus::Error;
                self.error = Some(e.to_string());
                self.error_kind = Some(e.kind());
            }
        }
    }

    /// Close a record whose call never returned (run aborted mid-turn).
    pub fn abandon(&mut self, reason: &str) {
        if !self.is_closed() {
            self.status = ToolCallStatus::Error;
            self.error = Some(reason.to_string());
        }
    }
}

/// Build the `tool` message fed back to the model.
///
/// Errors are serialized as `{"error", "kind"}` so the model can react.
pub fn tool_message(call_id: &str, outcome: &Result<ToolOutput, ToolError>) -> Message {
    let content = match outcome {
        Ok(output) => match &output.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
        Err(e) => serde_json::json!({ "error": e.to_string(), "kind": e.kind() }).to_string(),
    };
    Message::tool(call_id, content)
}
