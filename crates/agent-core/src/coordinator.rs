//! Run Coordinator
//!
//! Entry point per conversation turn. Owns one reasoning loop, turns its
//! outcome into a terminal [`Run`] and hands that run to the persistence
//! sink. Never fails: setup errors, loop errors and panics all come back as
//! a `failed` run.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{AgentDefinition, EngineSettings, ModelEndpoint};
use crate::error::{AgentError, ErrorKind};
use crate::invoker::ToolInvoker;
use crate::message::Message;
use crate::provider::AdapterFactory;
use crate::reasoning::{ReasoningLoop, RunContext};
use crate::run::{Run, RunStatus};
use crate::store::RunSink;
use crate::tool::ToolRegistry;

/// Drives single runs. Cheap to clone; shared by the fan-out dispatcher.
#[derive(Clone)]
pub struct RunCoordinator {
    factory: Arc<dyn AdapterFactory>,
    tools: Arc<ToolRegistry>,
    settings: EngineSettings,
    sink: Option<Arc<dyn RunSink>>,
}

impl RunCoordinator {
    pub fn new(factory: Arc<dyn AdapterFactory>, tools: Arc<ToolRegistry>, settings: EngineSettings) -> Self {
        Self {
            factory,
            tools,
            settings,
            sink: None,
        }
    }

    /// Persist every terminal run to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn RunSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Execute one turn of `agent` against `endpoint`.
    pub async fn execute(
        &self,
        agent: &AgentDefinition,
        endpoint: &ModelEndpoint,
        history: &[Message],
        user_message: Message,
    ) -> Run {
        self.execute_with_context(agent, endpoint, history, user_message, RunContext::new())
            .await
    }

    /// Execute under a caller-supplied cancellation token and deadline.
    pub async fn execute_with_context(
        &self,
        agent: &AgentDefinition,
        endpoint: &ModelEndpoint,
        history: &[Message],
        user_message: Message,
        ctx: RunContext,
    ) -> Run {
        self.execute_inner(agent, endpoint, history, user_message, ctx, None)
            .await
    }

    /// Execute against the primary model; if that run failed on a transient
    /// provider error before any assistant message, re-run the turn on the
    /// fallback endpoint. Both runs are persisted; the one returned is the
    /// last one executed.
    pub async fn execute_with_fallback(
        &self,
        agent: &AgentDefinition,
        primary: &ModelEndpoint,
        fallback: Option<&ModelEndpoint>,
        history: &[Message],
        user_message: Message,
        ctx: RunContext,
    ) -> Run {
        let run = self
            .execute_inner(agent, primary, history, user_message.clone(), ctx.clone(), None)
            .await;

        let Some(fallback) = fallback else {
            return run;
        };
        if !should_fall_back(&run) || ctx.cancel_token().is_cancelled() {
            return run;
        }

        tracing::warn!(
            run_id = %run.id(),
            primary = %primary.id,
            fallback = %fallback.id,
            "Primary model unavailable, retrying turn on fallback"
        );
        self.execute_inner(agent, fallback, history, user_message, ctx, Some(run.id()))
            .await
    }

    async fn execute_inner(
        &self,
        agent: &AgentDefinition,
        endpoint: &ModelEndpoint,
        history: &[Message],
        user_message: Message,
        ctx: RunContext,
        fallback_from: Option<Uuid>,
    ) -> Run {
        let started = Instant::now();
        let mut run = Run::new(agent, endpoint);
        let span = tracing::info_span!(
            "run",
            run_id = %run.id(),
            agent = %agent.id,
            model = %endpoint.model
        );

        async {
            if let Err(e) = self.drive(&mut run, agent, endpoint, history, user_message, ctx, fallback_from).await {
                // fail() only errors on a terminal run, which drive() never leaves behind on error
                let _ = run.fail(&e, started.elapsed());
            }

            match run.status() {
                RunStatus::Completed => tracing::info!(
                    iterations = run.iterations(),
                    input_tokens = run.input_tokens(),
                    output_tokens = run.output_tokens(),
                    elapsed_ms = run.execution_time_ms(),
                    "Run completed"
                ),
                _ => tracing::warn!(
                    error = run.error().map_or("", |e| e.message.as_str()),
                    elapsed_ms = run.execution_time_ms(),
                    "Run failed"
                ),
            }

            self.persist(&run).await;
            run
        }
        .instrument(span)
        .await
    }

    /// Hand a terminal run to the sink. Sink failures are logged only.
    pub(crate) async fn persist(&self, run: &Run) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.persist(run).await {
                tracing::warn!(run_id = %run.id(), error = %e, "Failed to persist run");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        run: &mut Run,
        agent: &AgentDefinition,
        endpoint: &ModelEndpoint,
        history: &[Message],
        user_message: Message,
        ctx: RunContext,
        fallback_from: Option<Uuid>,
    ) -> crate::Result<()> {
        let started = Instant::now();
        if let Some(primary) = fallback_from {
            run.set_fallback_from(primary)?;
        }
        run.start()?;
        agent.validate()?;
        endpoint.validate()?;

        let adapter = self.factory.build(endpoint)?;
        let invoker = ToolInvoker::new(self.tools.clone(), &agent.enabled_tools, self.settings.tool_timeout);
        let declarations = self.tools.declarations_for(&agent.enabled_tools);
        let reasoning = ReasoningLoop::new(
            agent.clone(),
            endpoint.clone(),
            adapter,
            invoker,
            declarations,
            self.settings.clone(),
        );

        // The loop runs on its own task so a panic surfaces as a JoinError.
        // Dropping this future cancels the child token and with it the loop.
        let loop_ctx = ctx.child();
        let _cancel_on_drop = loop_ctx.cancel_token().clone().drop_guard();
        let history = history.to_vec();
        let handle = tokio::spawn(
            async move { reasoning.run(&history, user_message, &loop_ctx).await }.in_current_span(),
        );

        let outcome = handle
            .await
            .map_err(|e| AgentError::Internal(format!("run task failed: {e}")))?;
        run.finish(outcome, endpoint.pricing.as_ref(), started.elapsed())
    }
}

fn should_fall_back(run: &Run) -> bool {
    run.status() == RunStatus::Failed
        && run.messages().is_empty()
        && run.error().is_some_and(|e| {
            matches!(
                e.kind,
                ErrorKind::RateLimited | ErrorKind::Timeout | ErrorKind::ProviderUnavailable
            )
        })
}
