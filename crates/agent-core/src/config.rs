//! Engine Configuration
//!
//! Structured, validated configuration read by the engine. Agent definitions
//! and model endpoints are owned by the catalog layer and treated as
//! read-only for the duration of a run.

use std::collections::BTreeMap;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Sampling parameters sent to the provider. Unset fields are omitted from
/// the wire request so the provider default applies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Temperature for sampling (0.0 = deterministic)
    #[serde(default = "default_temperature")]
    pub temperature: Option<f32>,

    /// Top-p nucleus sampling
    #[serde(default)]
    pub top_p: Option<f32>,

    /// Penalise tokens by frequency (openai-compatible and google only)
    #[serde(default)]
    pub frequency_penalty: Option<f32>,

    /// Penalise tokens already present (openai-compatible and google only)
    #[serde(default)]
    pub presence_penalty: Option<f32>,

    /// Maximum tokens to generate per model call
    #[serde(default = "default_max_tokens")]
    pub max_tokens: Option<u32>,
}

#[allow(clippy::unnecessary_wraps)]
fn default_temperature() -> Option<f32> {
    Some(0.7)
}

#[allow(clippy::unnecessary_wraps)]
fn default_max_tokens() -> Option<u32> {
    Some(2000)
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            max_tokens: default_max_tokens(),
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(AgentError::Config(format!("temperature {t} outside 0.0..=2.0")));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(AgentError::Config(format!("top_p {p} outside 0.0..=1.0")));
            }
        }
        for (name, value) in [
            ("frequency_penalty", self.frequency_penalty),
            ("presence_penalty", self.presence_penalty),
        ] {
            if let Some(v) = value {
                if !(-2.0..=2.0).contains(&v) {
                    return Err(AgentError::Config(format!("{name} {v} outside -2.0..=2.0")));
                }
            }
        }
        if self.max_tokens == Some(0) {
            return Err(AgentError::Config("max_tokens must be positive".into()));
        }
        Ok(())
    }
}

/// One agent version: prompt, models, tools and loop limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default = "default_version")]
    pub version: u32,

    /// Endpoint id of the primary model
    pub primary_model: String,

    /// Endpoint id used when the primary is unavailable
    #[serde(default)]
    pub fallback_model: Option<String>,

    #[serde(default)]
    pub sampling: SamplingParams,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Tool names the model may call
    #[serde(default)]
    pub enabled_tools: Vec<String>,

    /// Maximum model calls per run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Number of past turns replayed to the model (0 = all)
    #[serde(default = "default_memory_window")]
    pub memory_window: usize,

    /// Run independent tool calls from one assistant turn concurrently
    #[serde(default)]
    pub parallel_tool_calls: bool,
}

fn default_version() -> u32 {
    1
}

fn default_system_prompt() -> String {
    "You are a helpful AI assistant.".into()
}

fn default_max_iterations() -> usize {
    6
}

fn default_memory_window() -> usize {
    10
}

impl AgentDefinition {
    pub fn new(id: impl Into<String>, primary_model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            version: default_version(),
            primary_model: primary_model.into(),
            fallback_model: None,
            sampling: SamplingParams::default(),
            system_prompt: default_system_prompt(),
            enabled_tools: Vec::new(),
            max_iterations: default_max_iterations(),
            memory_window: default_memory_window(),
            parallel_tool_calls: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(AgentError::Config("agent id is required".into()));
        }
        if self.primary_model.trim().is_empty() {
            return Err(AgentError::Config(format!("agent '{}' has no primary model", self.id)));
        }
        if self.max_iterations == 0 {
            return Err(AgentError::Config(format!(
                "agent '{}' must allow at least one iteration",
                self.id
            )));
        }
        self.sampling.validate()
    }

    pub fn allows_tool(&self, name: &str) -> bool {
        self.enabled_tools.iter().any(|t| t == name)
    }
}

/// Wire protocol family of a model endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    OpenaiCompatible,
    Anthropic,
    Google,
    Custom,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenaiCompatible => write!(f, "openai-compatible"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::Google => write!(f, "google"),
            ProviderKind::Custom => write!(f, "custom"),
        }
    }
}

/// Price per thousand tokens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_1k: Decimal,
    pub output_per_1k: Decimal,
}

impl Pricing {
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> Decimal {
        let thousand = Decimal::from(1000);
        (Decimal::from(input_tokens) * self.input_per_1k
            + Decimal::from(output_tokens) * self.output_per_1k)
            / thousand
    }
}

/// A configured model endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelEndpoint {
    /// Catalog id
    pub id: String,

    /// Model name sent on the wire (e.g. "gpt-4o", "claude-3-5-sonnet")
    pub model: String,

    pub kind: ProviderKind,

    pub base_url: String,

    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub custom_headers: BTreeMap<String, String>,

    /// Declared context window in tokens (0 = unknown)
    #[serde(default = "default_context_length")]
    pub context_length: u32,

    /// Per-request timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub pricing: Option<Pricing>,
}

fn default_context_length() -> u32 {
    4096
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl ModelEndpoint {
    pub fn new(
        id: impl Into<String>,
        kind: ProviderKind,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            kind,
            base_url: base_url.into(),
            api_key: None,
            custom_headers: BTreeMap::new(),
            context_length: default_context_length(),
            request_timeout_secs: default_request_timeout_secs(),
            pricing: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(AgentError::Config(format!("endpoint '{}' has no model name", self.id)));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(AgentError::Config(format!(
                "endpoint '{}' base_url must be http(s): {}",
                self.id, self.base_url
            )));
        }
        Ok(())
    }
}

/// Backoff policy for transient provider errors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based). A server hint wins over
    /// the exponential schedule; both are capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let cap = Duration::from_millis(self.max_delay_ms);
        let computed = hint.unwrap_or_else(|| {
            let factor = 2u64.saturating_pow(attempt);
            Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
        });
        computed.min(cap)
    }
}

/// Process-wide engine knobs.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub retry: RetryPolicy,

    /// Default per-tool timeout when a tool declares none
    pub tool_timeout: Duration,

    /// Per-run budget inside a fan-out batch
    pub run_timeout: Duration,

    /// Upper bound on concurrent tool calls within one assistant turn
    pub tool_concurrency: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            tool_timeout: Duration::from_secs(30),
            run_timeout: Duration::from_secs(120),
            tool_concurrency: 4,
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        let defaults = Self::default();
        Self {
            retry: RetryPolicy {
                max_retries: var("AGENT_MAX_RETRIES").unwrap_or(defaults.retry.max_retries),
                base_delay_ms: var("AGENT_RETRY_BASE_MS").unwrap_or(defaults.retry.base_delay_ms),
                max_delay_ms: var("AGENT_RETRY_MAX_MS").unwrap_or(defaults.retry.max_delay_ms),
            },
            tool_timeout: var("AGENT_TOOL_TIMEOUT_SECS")
                .map_or(defaults.tool_timeout, Duration::from_secs),
            run_timeout: var("AGENT_RUN_TIMEOUT_SECS")
                .map_or(defaults.run_timeout, Duration::from_secs),
            tool_concurrency: var::<usize>("AGENT_TOOL_CONCURRENCY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.tool_concurrency),
        }
    }
}
