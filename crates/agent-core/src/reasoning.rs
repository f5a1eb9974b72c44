//! Reasoning Loop
//!
//! The state machine that alternates model calls and tool calls:
//!
//! ```text
//! Start → AwaitingModel → (ToolCallsRequested → ExecutingTools → AwaitingModel)* → Finished | Aborted
//! ```
//!
//! The loop holds no state between turns. Each run starts from the history
//! the caller passes in and returns everything it produced, including the
//! partial trace when it aborts.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentDefinition, EngineSettings, ModelEndpoint};
use crate::error::{AgentError, ProviderError, Result, ToolError};
use crate::invoker::{ToolCallRecord, ToolCallStatus, ToolInvoker, ToolOutput, tool_message};
use crate::message::{Message, Role, ToolCallRequest, estimate_tokens, fit_to_context, window_turns};
use crate::provider::{ChatRequest, ChatResponse, ProviderAdapter, TokenUsage, ToolDeclaration};

/// Loop states
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Start,
    AwaitingModel,
    ToolCallsRequested,
    ExecutingTools,
    Finished,
    Aborted,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Finished | LoopState::Aborted)
    }
}

/// Cancellation token plus optional deadline, honoured at every suspension
/// point of a run.
#[derive(Clone, Debug, Default)]
pub struct RunContext {
    cancel: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Expire `budget` from now. Expiry is reported as `AggregateTimeout`.
    pub fn with_timeout(mut self, budget: Duration) -> Self {
        self.deadline = Some((Instant::now() + budget, budget));
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Child context: cancelled with the parent, same deadline.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|(at, _)| at)
    }

    /// Run `fut` unless the token fires or the deadline passes first; the
    /// future is dropped in that case.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output> {
        let expiry = async {
            match self.deadline {
                Some((at, _)) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(AgentError::Cancelled),
            () = expiry => Err(AgentError::AggregateTimeout(self.deadline.map_or(Duration::ZERO, |(_, b)| b))),
            out = fut => Ok(out),
        }
    }
}

/// Everything one loop execution produced.
#[derive(Debug)]
pub struct LoopOutcome {
    /// Assistant and tool messages, in order. Never contains the user message.
    pub messages: Vec<Message>,
    pub tool_calls: Vec<ToolCallRecord>,
    /// Summed over every model call
    pub usage: TokenUsage,
    /// True when any call's usage had to be estimated
    pub tokens_estimated: bool,
    /// Model calls that produced a response or exhausted retries
    pub iterations: usize,
    /// Adapter invocations, retries included
    pub model_calls: u32,
    pub final_state: LoopState,
    pub error: Option<AgentError>,
}

/// One reasoning loop instance, bound to a single (agent, endpoint) pair.
pub struct ReasoningLoop {
    agent: AgentDefinition,
    endpoint: ModelEndpoint,
    adapter: Arc<dyn ProviderAdapter>,
    invoker: ToolInvoker,
    tools: Vec<ToolDeclaration>,
    settings: EngineSettings,
}

/// Mutable bookkeeping for one execution
struct Trace {
    state: LoopState,
    messages: Vec<Message>,
    tool_calls: Vec<ToolCallRecord>,
    usage: TokenUsage,
    tokens_estimated: bool,
    iterations: usize,
    model_calls: u32,
    /// Every call id seen in the prompt or issued so far
    call_ids: HashSet<String>,
}

impl Trace {
    fn transition(&mut self, next: LoopState) {
        tracing::debug!(from = ?self.state, to = ?next, iteration = self.iterations, "Loop transition");
        self.state = next;
    }

    fn finish(mut self, error: Option<AgentError>) -> LoopOutcome {
        let next = if error.is_some() { LoopState::Aborted } else { LoopState::Finished };
        if let Some(e) = &error {
            for record in &mut self.tool_calls {
                record.abandon(&e.to_string());
            }
        }
        self.transition(next);
        LoopOutcome {
            messages: self.messages,
            tool_calls: self.tool_calls,
            usage: self.usage,
            tokens_estimated: self.tokens_estimated,
            iterations: self.iterations,
            model_calls: self.model_calls,
            final_state: self.state,
            error,
        }
    }
}

impl ReasoningLoop {
    pub fn new(
        agent: AgentDefinition,
        endpoint: ModelEndpoint,
        adapter: Arc<dyn ProviderAdapter>,
        invoker: ToolInvoker,
        tools: Vec<ToolDeclaration>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            agent,
            endpoint,
            adapter,
            invoker,
            tools,
            settings,
        }
    }

    /// Seed the prompt: memory window, then the context-length guard.
    fn seed(&self, history: &[Message], user_message: Message) -> Vec<Message> {
        let mut prompt = window_turns(history, self.agent.memory_window);
        prompt.push(user_message);
        let limit = self
            .endpoint
            .context_length
            .saturating_sub(self.agent.sampling.max_tokens.unwrap_or(0));
        fit_to_context(&self.agent.system_prompt, prompt, limit)
    }

    /// Drive the loop to a terminal state.
    pub async fn run(&self, history: &[Message], user_message: Message, ctx: &RunContext) -> LoopOutcome {
        let mut conversation = self.seed(history, user_message);
        let mut trace = Trace {
            state: LoopState::Start,
            messages: Vec::new(),
            tool_calls: Vec::new(),
            usage: TokenUsage::default(),
            tokens_estimated: false,
            iterations: 0,
            model_calls: 0,
            call_ids: conversation
                .iter()
                .flat_map(Message::requested_calls)
                .map(|c| c.id.clone())
                .collect(),
        };

        loop {
            if trace.iterations >= self.agent.max_iterations {
                tracing::warn!(
                    agent = %self.agent.id,
                    max = self.agent.max_iterations,
                    "Iteration cap reached"
                );
                let cap = AgentError::MaxIterationsExceeded(self.agent.max_iterations);
                return trace.finish(Some(cap));
            }

            trace.transition(LoopState::AwaitingModel);
            trace.iterations += 1;

            let request = ChatRequest {
                model: self.endpoint.model.clone(),
                system_prompt: self.agent.system_prompt.clone(),
                messages: conversation.clone(),
                sampling: self.agent.sampling.clone(),
                tools: self.tools.clone(),
            };

            let response = match self.call_model(&request, ctx, &mut trace.model_calls).await {
                Ok(response) => response,
                Err(e) => return trace.finish(Some(e)),
            };
            account_usage(&mut trace, &request, &response);

            let message = normalize_assistant(response.message, trace.iterations, &mut trace.call_ids);
            let calls = message.requested_calls().to_vec();
            conversation.push(message.clone());
            trace.messages.push(message);

            if calls.is_empty() {
                return trace.finish(None);
            }

            trace.transition(LoopState::ToolCallsRequested);
            let message_index = trace.messages.len() - 1;
            let first_record = trace.tool_calls.len();
            trace
                .tool_calls
                .extend(calls.iter().map(|c| ToolCallRecord::pending(c, message_index)));

            trace.transition(LoopState::ExecutingTools);
            let records = &mut trace.tool_calls[first_record..];
            let results = match ctx.guard(self.execute_tools(&calls, records)).await {
                Ok(results) => results,
                Err(e) => return trace.finish(Some(e)),
            };

            for result in results {
                conversation.push(result.clone());
                trace.messages.push(result);
            }
        }
    }

    /// One model call with bounded retries on transient errors.
    async fn call_model(
        &self,
        request: &ChatRequest,
        ctx: &RunContext,
        model_calls: &mut u32,
    ) -> Result<ChatResponse> {
        let policy = &self.settings.retry;
        let per_call = self.endpoint.request_timeout();
        let mut attempt = 0u32;

        loop {
            *model_calls += 1;
            let call = tokio::time::timeout(per_call, self.adapter.send(request));
            let result = match ctx.guard(call).await? {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(format!(
                    "no response within {}s",
                    per_call.as_secs()
                ))),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < policy.max_retries => {
                    let delay = policy.delay_for(attempt, e.retry_after());
                    tracing::warn!(
                        model = %request.model,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Transient provider error, retrying"
                    );
                    ctx.guard(tokio::time::sleep(delay)).await?;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(model = %request.model, error = %e, "Provider call failed");
                    return Err(e.into());
                }
            }
        }
    }

    /// Execute one assistant turn's tool calls and return the `tool`
    /// messages in request order.
    async fn execute_tools(
        &self,
        calls: &[ToolCallRequest],
        records: &mut [ToolCallRecord],
    ) -> Vec<Message> {
        for record in records.iter_mut() {
            record.status = ToolCallStatus::Running;
        }

        // futures are lazy: nothing runs until polled below
        let pending: Vec<_> = calls
            .iter()
            .map(|call| timed_invoke(&self.invoker, call.name.clone(), call.arguments.clone()))
            .collect();

        let outcomes: Vec<_> = if self.agent.parallel_tool_calls && calls.len() > 1 {
            stream::iter(pending)
                .buffered(self.settings.tool_concurrency.max(1))
                .collect()
                .await
        } else {
            let mut outcomes = Vec::with_capacity(pending.len());
            for fut in pending {
                outcomes.push(fut.await);
            }
            outcomes
        };

        calls
            .iter()
            .zip(records.iter_mut())
            .zip(outcomes)
            .map(|((call, record), (outcome, elapsed))| {
                record.close(&outcome, elapsed);
                if let Err(e) = &outcome {
                    tracing::warn!(tool = %call.name, call_id = %call.id, error = %e, "Tool call failed");
                }
                tool_message(&call.id, &outcome)
            })
            .collect()
    }
}

async fn timed_invoke(
    invoker: &ToolInvoker,
    name: String,
    arguments: serde_json::Value,
) -> (std::result::Result<ToolOutput, ToolError>, Duration) {
    let start = Instant::now();
    let outcome = invoker.invoke(&name, arguments).await;
    (outcome, start.elapsed())
}

/// Force the assistant role and give every tool call an id unique within
/// the run. Empty ids and ids already in `issued` are replaced.
fn normalize_assistant(mut message: Message, iteration: usize, issued: &mut HashSet<String>) -> Message {
    message.role = Role::Assistant;
    if let Some(calls) = message.tool_calls.as_mut() {
        for (i, call) in calls.iter_mut().enumerate() {
            if call.id.trim().is_empty() || issued.contains(&call.id) {
                let mut id = format!("call_{iteration}_{i}");
                let mut n = 1;
                while issued.contains(&id) {
                    id = format!("call_{iteration}_{i}_{n}");
                    n += 1;
                }
                tracing::debug!(from = %call.id, to = %id, "Reassigned tool call id");
                call.id = id;
            }
            issued.insert(call.id.clone());
        }
        if calls.is_empty() {
            message.tool_calls = None;
        }
    }
    message
}

fn account_usage(trace: &mut Trace, request: &ChatRequest, response: &ChatResponse) {
    let usage = response.usage.unwrap_or_else(|| {
        trace.tokens_estimated = true;
        TokenUsage {
            input_tokens: estimate_tokens(&request.system_prompt)
                .saturating_add(request.messages.iter().map(Message::estimate_tokens).sum()),
            output_tokens: response.message.estimate_tokens(),
        }
    });
    trace.usage.input_tokens = trace.usage.input_tokens.saturating_add(usage.input_tokens);
    trace.usage.output_tokens = trace.usage.output_tokens.saturating_add(usage.output_tokens);
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::config::{ProviderKind, RetryPolicy};
    use crate::tool::ToolRegistry;

    /// Adapter that replays a fixed script of responses
    struct Scripted {
        replies: Mutex<VecDeque<std::result::Result<ChatResponse, ProviderError>>>,
    }

    impl Scripted {
        fn new(replies: Vec<std::result::Result<Message, ProviderError>>) -> Arc<Self> {
            let replies = replies
                .into_iter()
                .map(|r| {
                    r.map(|message| ChatResponse {
                        message,
                        model: "stub".into(),
                        usage: Some(TokenUsage {
                            input_tokens: 10,
                            output_tokens: 2,
                        }),
                        finish_reason: None,
                    })
                })
                .collect();
            Arc::new(Self {
                replies: Mutex::new(replies),
            })
        }
    }

    #[async_trait]
    impl ProviderAdapter for Scripted {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Custom
        }

        async fn send(&self, _request: &ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::MalformedResponse("script exhausted".into())))
        }
    }

    fn build(adapter: Arc<dyn ProviderAdapter>, retry: RetryPolicy) -> ReasoningLoop {
        let mut agent = AgentDefinition::new("calc", "stub");
        agent.enabled_tools = vec!["calculator".into()];
        let endpoint = ModelEndpoint::new("stub", ProviderKind::Custom, "http://localhost", "stub");
        let registry = Arc::new(ToolRegistry::with_builtins());
        let settings = EngineSettings {
            retry,
            ..EngineSettings::default()
        };
        let invoker = ToolInvoker::new(registry.clone(), &agent.enabled_tools, settings.tool_timeout);
        let tools = registry.declarations_for(&agent.enabled_tools);
        ReasoningLoop::new(agent, endpoint, adapter, invoker, tools, settings)
    }

    #[tokio::test]
    async fn test_tool_cycle_then_answer() {
        let adapter = Scripted::new(vec![
            Ok(Message::assistant_with_tools(
                None,
                vec![ToolCallRequest::new("", "calculator", serde_json::json!({"expression": "6*7"}))],
            )),
            Ok(Message::assistant("42")),
        ]);
        let outcome = build(adapter, RetryPolicy::none())
            .run(&[], Message::user("6*7?"), &RunContext::new())
            .await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.final_state, LoopState::Finished);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.messages.len(), 3);
        assert_eq!(outcome.messages[1].tool_call_id.as_deref(), Some("call_1_0"));
        assert_eq!(outcome.usage.input_tokens, 20);
        assert_eq!(outcome.tool_calls[0].result.as_ref().unwrap()["result"], 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let adapter = Scripted::new(vec![
            Err(ProviderError::RateLimited {
                message: "slow down".into(),
                retry_after: Some(Duration::from_secs(1)),
            }),
            Err(ProviderError::ProviderUnavailable("reset".into())),
            Ok(Message::assistant("done")),
        ]);
        let outcome = build(adapter, RetryPolicy::default())
            .run(&[], Message::user("hi"), &RunContext::new())
            .await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.model_calls, 3);
        assert_eq!(outcome.iterations, 1);
    }

    #[tokio::test]
    async fn test_auth_error_aborts_without_retry() {
        let adapter = Scripted::new(vec![
            Err(ProviderError::Auth("bad key".into())),
            Ok(Message::assistant("unreachable")),
        ]);
        let outcome = build(adapter, RetryPolicy::default())
            .run(&[], Message::user("hi"), &RunContext::new())
            .await;

        assert_eq!(outcome.final_state, LoopState::Aborted);
        assert_eq!(outcome.model_calls, 1);
        assert!(matches!(
            outcome.error,
            Some(AgentError::Provider(ProviderError::Auth(_)))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_context_aborts() {
        let adapter = Scripted::new(vec![Ok(Message::assistant("late"))]);
        let ctx = RunContext::new();
        ctx.cancel_token().cancel();
        let outcome = build(adapter, RetryPolicy::none())
            .run(&[], Message::user("hi"), &ctx)
            .await;

        assert!(matches!(outcome.error, Some(AgentError::Cancelled)));
        assert!(outcome.messages.is_empty());
    }

    #[test]
    fn test_normalize_assigns_ids() {
        let msg = Message::assistant_with_tools(
            Some("thinking".into()),
            vec![
                ToolCallRequest::new("keep", "a", serde_json::Value::Null),
                ToolCallRequest::new(" ", "b", serde_json::Value::Null),
            ],
        );
        let mut issued = HashSet::new();
        let msg = normalize_assistant(msg, 3, &mut issued);
        let ids: Vec<_> = msg.requested_calls().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["keep", "call_3_1"]);
    }

    #[test]
    fn test_normalize_rewrites_repeated_ids() {
        let repeated = || {
            Message::assistant_with_tools(
                None,
                vec![
                    ToolCallRequest::new("calculator_0", "calculator", serde_json::Value::Null),
                    ToolCallRequest::new("calculator_0", "calculator", serde_json::Value::Null),
                ],
            )
        };
        let mut issued = HashSet::from(["call_2_0".to_string()]);

        let first = normalize_assistant(repeated(), 1, &mut issued);
        let ids: Vec<_> = first.requested_calls().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["calculator_0", "call_1_1"]);

        let second = normalize_assistant(repeated(), 2, &mut issued);
        let ids: Vec<_> = second.requested_calls().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["call_2_0_1", "call_2_1"]);
    }

    #[tokio::test]
    async fn test_provider_ids_reused_across_iterations() {
        let call = || {
            Ok(Message::assistant_with_tools(
                None,
                vec![ToolCallRequest::new("calculator_0", "calculator", serde_json::json!({"expression": "1+1"}))],
            ))
        };
        let adapter = Scripted::new(vec![call(), call(), Ok(Message::assistant("2"))]);
        let outcome = build(adapter, RetryPolicy::none())
            .run(&[], Message::user("twice"), &RunContext::new())
            .await;

        assert!(outcome.error.is_none());
        assert!(crate::run::validate_trace(&outcome.messages).is_ok());
        assert_eq!(outcome.messages[1].tool_call_id.as_deref(), Some("calculator_0"));
        assert_eq!(outcome.messages[3].tool_call_id.as_deref(), Some("call_2_0"));
        let record_ids: Vec<_> = outcome.tool_calls.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(record_ids, ["calculator_0", "call_2_0"]);
    }
}
