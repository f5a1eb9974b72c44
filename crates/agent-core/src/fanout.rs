//! Fan-out Dispatcher
//!
//! Runs the same user turn against several model endpoints concurrently.
//! All runs settle independently: one model failing or hanging never
//! cancels or delays the others, and the result list matches the input
//! endpoints one to one, in order.

use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentDefinition, ModelEndpoint};
use crate::coordinator::RunCoordinator;
use crate::error::AgentError;
use crate::message::Message;
use crate::reasoning::RunContext;
use crate::run::Run;

/// Slack given to a run after its deadline to wind down on its own before
/// the dispatcher aborts the task.
const ABORT_GRACE: Duration = Duration::from_millis(250);

pub struct FanoutDispatcher {
    coordinator: RunCoordinator,
    run_timeout: Duration,
}

impl FanoutDispatcher {
    /// Per-run budget taken from the coordinator's settings
    pub fn new(coordinator: RunCoordinator) -> Self {
        let run_timeout = coordinator.settings().run_timeout;
        Self {
            coordinator,
            run_timeout,
        }
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    pub fn run_timeout(&self) -> Duration {
        self.run_timeout
    }

    pub async fn execute_many(
        &self,
        agent: &AgentDefinition,
        endpoints: &[ModelEndpoint],
        history: &[Message],
        user_message: Message,
    ) -> Vec<Run> {
        self.execute_many_with_cancel(agent, endpoints, history, user_message, CancellationToken::new())
            .await
    }

    /// Like [`execute_many`](Self::execute_many), cancelling every run when
    /// `cancel` fires.
    pub async fn execute_many_with_cancel(
        &self,
        agent: &AgentDefinition,
        endpoints: &[ModelEndpoint],
        history: &[Message],
        user_message: Message,
        cancel: CancellationToken,
    ) -> Vec<Run> {
        let started = Instant::now();
        tracing::info!(
            agent = %agent.id,
            models = endpoints.len(),
            timeout_ms = self.run_timeout.as_millis(),
            "Fan-out started"
        );

        let handles: Vec<_> = endpoints
            .iter()
            .map(|endpoint| {
                let coordinator = self.coordinator.clone();
                let agent = agent.clone();
                let endpoint = endpoint.clone();
                let history = history.to_vec();
                let user_message = user_message.clone();
                let ctx = RunContext::with_cancel(cancel.child_token()).with_timeout(self.run_timeout);
                tokio::spawn(async move {
                    coordinator
                        .execute_with_context(&agent, &endpoint, &history, user_message, ctx)
                        .await
                })
            })
            .collect();

        let backstop = self.run_timeout + ABORT_GRACE;
        let settled = handles
            .into_iter()
            .zip(endpoints)
            .map(|(mut handle, endpoint)| async move {
                let err = match tokio::time::timeout(backstop, &mut handle).await {
                    Ok(Ok(run)) => return run,
                    Ok(Err(join)) => {
                        tracing::error!(endpoint = %endpoint.id, error = %join, "Fan-out task failed");
                        AgentError::Internal(format!("run task failed: {join}"))
                    }
                    Err(_) => {
                        tracing::error!(endpoint = %endpoint.id, "Run ignored its deadline, aborting");
                        handle.abort();
                        AgentError::AggregateTimeout(self.run_timeout)
                    }
                };

                let mut run = Run::new(agent, endpoint);
                // a fresh run is never terminal
                let _ = run.fail(&err, started.elapsed());
                self.coordinator.persist(&run).await;
                run
            });

        let runs = join_all(settled).await;
        tracing::info!(
            agent = %agent.id,
            completed = runs.iter().filter(|r| r.final_answer().is_some()).count(),
            elapsed_ms = started.elapsed().as_millis(),
            "Fan-out finished"
        );
        runs
    }
}
