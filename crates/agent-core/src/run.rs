//! Run Records
//!
//! A [`Run`] is one execution of the reasoning loop for one
//! (agent, turn, model) triple. It is created `pending`, flipped to
//! `running`, and closed exactly once as `completed` or `failed`; after that
//! every mutator returns [`AgentError::RunFinalized`].

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{AgentDefinition, ModelEndpoint, Pricing};
use crate::error::{AgentError, ErrorKind, Result};
use crate::invoker::ToolCallRecord;
use crate::message::{Message, Role};
use crate::reasoning::{LoopOutcome, LoopState};

/// Run lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a run failed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
    /// Presentation-friendly text
    pub user_message: String,
}

impl From<&AgentError> for RunError {
    fn from(err: &AgentError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            user_message: err.user_message(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    id: Uuid,
    agent_id: String,
    agent_version: u32,
    endpoint_id: String,
    model: String,
    status: RunStatus,

    /// Assistant and tool messages produced by the loop
    messages: Vec<Message>,
    tool_calls: Vec<ToolCallRecord>,

    input_tokens: u64,
    output_tokens: u64,
    tokens_estimated: bool,
    cost: Option<Decimal>,

    iterations: usize,
    model_calls: u32,
    execution_time_ms: u64,
    error: Option<RunError>,

    /// Primary run this one replaced, when executed against the fallback model
    fallback_from: Option<Uuid>,

    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// New `pending` run
    pub fn new(agent: &AgentDefinition, endpoint: &ModelEndpoint) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent.id.clone(),
            agent_version: agent.version,
            endpoint_id: endpoint.id.clone(),
            model: endpoint.model.clone(),
            status: RunStatus::Pending,
            messages: Vec::new(),
            tool_calls: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            tokens_estimated: false,
            cost: None,
            iterations: 0,
            model_calls: 0,
            execution_time_ms: 0,
            error: None,
            fallback_from: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(AgentError::RunFinalized(self.id.to_string()));
        }
        Ok(())
    }

    pub(crate) fn set_fallback_from(&mut self, primary: Uuid) -> Result<()> {
        self.ensure_open()?;
        self.fallback_from = Some(primary);
        Ok(())
    }

    /// `pending` -> `running`
    pub fn start(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.status == RunStatus::Running {
            return Err(AgentError::Internal(format!("run {} already started", self.id)));
        }
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Close the run from a loop outcome. Partial traces are kept on failure.
    pub fn finish(
        &mut self,
        outcome: LoopOutcome,
        pricing: Option<&Pricing>,
        elapsed: Duration,
    ) -> Result<()> {
        self.ensure_open()?;
        self.messages = outcome.messages;
        self.tool_calls = outcome.tool_calls;
        self.input_tokens = u64::from(outcome.usage.input_tokens);
        self.output_tokens = u64::from(outcome.usage.output_tokens);
        self.tokens_estimated = outcome.tokens_estimated;
        self.cost = pricing.map(|p| p.cost(self.input_tokens, self.output_tokens));
        self.iterations = outcome.iterations;
        self.model_calls = outcome.model_calls;

        match (outcome.error, outcome.final_state) {
            (Some(err), _) => self.close(Some(&err), elapsed),
            (None, LoopState::Finished) => self.close(None, elapsed),
            (None, state) => {
                let err = AgentError::Internal(format!("loop ended in non-terminal state {state:?}"));
                self.close(Some(&err), elapsed);
            }
        }
        Ok(())
    }

    /// Close the run as `failed` without a loop outcome (setup failure,
    /// panicked task, dispatcher backstop).
    pub fn fail(&mut self, error: &AgentError, elapsed: Duration) -> Result<()> {
        self.ensure_open()?;
        self.close(Some(error), elapsed);
        Ok(())
    }

    fn close(&mut self, error: Option<&AgentError>, elapsed: Duration) {
        self.execution_time_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.completed_at = Some(Utc::now());
        match error {
            Some(err) => {
                self.status = RunStatus::Failed;
                self.error = Some(err.into());
            }
            None => self.status = RunStatus::Completed,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn agent_version(&self) -> u32 {
        self.agent_version
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn tool_calls(&self) -> &[ToolCallRecord] {
        &self.tool_calls
    }

    /// Final assistant answer of a completed run
    pub fn final_answer(&self) -> Option<&str> {
        if self.status != RunStatus::Completed {
            return None;
        }
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .and_then(|m| m.content.as_deref())
    }

    pub fn input_tokens(&self) -> u64 {
        self.input_tokens
    }

    pub fn output_tokens(&self) -> u64 {
        self.output_tokens
    }

    pub fn tokens_estimated(&self) -> bool {
        self.tokens_estimated
    }

    pub fn cost(&self) -> Option<Decimal> {
        self.cost
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn model_calls(&self) -> u32 {
        self.model_calls
    }

    pub fn execution_time_ms(&self) -> u64 {
        self.execution_time_ms
    }

    pub fn error(&self) -> Option<&RunError> {
        self.error.as_ref()
    }

    pub fn fallback_from(&self) -> Option<Uuid> {
        self.fallback_from
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Check the message ordering invariants of this run
    pub fn validate_trace(&self) -> std::result::Result<(), String> {
        validate_trace(&self.messages)
    }
}

/// Every `tool` message must answer a call id issued by an earlier assistant
/// message, each id at most once. Only assistant and tool roles may appear.
pub fn validate_trace(messages: &[Message]) -> std::result::Result<(), String> {
    let mut issued = HashSet::new();
    let mut answered = HashSet::new();

    for (i, msg) in messages.iter().enumerate() {
        match msg.role {
            Role::Assistant => {
                for call in msg.requested_calls() {
                    if !issued.insert(call.id.as_str()) {
                        return Err(format!("message {i}: duplicate tool call id '{}'", call.id));
                    }
                }
            }
            Role::Tool => {
                let id = msg
                    .tool_call_id
                    .as_deref()
                    .ok_or_else(|| format!("message {i}: tool message without call id"))?;
                if !issued.contains(id) {
                    return Err(format!("message {i}: tool result for unknown call '{id}'"));
                }
                if !answered.insert(id) {
                    return Err(format!("message {i}: call '{id}' answered twice"));
                }
            }
            role => return Err(format!("message {i}: unexpected {role} message in run trace")),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::message::ToolCallRequest;
    use crate::provider::TokenUsage;

    fn new_run() -> Run {
        let agent = AgentDefinition::new("a", "m");
        let endpoint = ModelEndpoint::new("m", ProviderKind::Custom, "http://localhost", "m");
        Run::new(&agent, &endpoint)
    }

    fn outcome(error: Option<AgentError>) -> LoopOutcome {
        LoopOutcome {
            messages: vec![Message::assistant("hi")],
            tool_calls: Vec::new(),
            usage: TokenUsage {
                input_tokens: 3,
                output_tokens: 1,
            },
            tokens_estimated: false,
            iterations: 1,
            model_calls: 1,
            final_state: if error.is_some() { LoopState::Aborted } else { LoopState::Finished },
            error,
        }
    }

    #[test]
    fn test_terminal_run_is_immutable() {
        let mut run = new_run();
        run.start().unwrap();
        run.finish(outcome(None), None, Duration::from_millis(10)).unwrap();
        assert_eq!(run.status(), RunStatus::Completed);
        assert_eq!(run.final_answer(), Some("hi"));

        let snapshot = serde_json::to_value(&run).unwrap();
        assert!(matches!(run.start(), Err(AgentError::RunFinalized(_))));
        assert!(run.fail(&AgentError::Cancelled, Duration::ZERO).is_err());
        assert!(run.finish(outcome(None), None, Duration::ZERO).is_err());
        assert_eq!(serde_json::to_value(&run).unwrap(), snapshot);
    }

    #[test]
    fn test_failed_run_keeps_partial_trace() {
        let mut run = new_run();
        run.start().unwrap();
        run.finish(outcome(Some(AgentError::MaxIterationsExceeded(1))), None, Duration::ZERO)
            .unwrap();
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.messages().len(), 1);
        assert_eq!(run.error().unwrap().kind, ErrorKind::MaxIterationsExceeded);
        assert_eq!(run.final_answer(), None);
    }

    #[test]
    fn test_validate_trace() {
        let call = ToolCallRequest::new("c1", "calculator", serde_json::json!({}));
        let good = vec![
            Message::assistant_with_tools(None, vec![call.clone()]),
            Message::tool("c1", "{}"),
            Message::assistant("done"),
        ];
        assert!(validate_trace(&good).is_ok());

        let orphan = vec![Message::tool("c1", "{}")];
        assert!(validate_trace(&orphan).is_err());

        let twice = vec![
            Message::assistant_with_tools(None, vec![call]),
            Message::tool("c1", "{}"),
            Message::tool("c1", "{}"),
        ];
        assert!(validate_trace(&twice).is_err());

        assert!(validate_trace(&[Message::user("hi")]).is_err());
    }
}
