//! # agent-core
//!
//! Agent execution engine: provider-agnostic model calls, tool invocation,
//! the reasoning loop, run records and multi-model fan-out.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ FanoutDispatcher ──▶ RunCoordinator × N                          │
//! │                        │                                         │
//! │                        ▼                                         │
//! │                   ReasoningLoop ──▶ ProviderAdapter (strategy)   │
//! │                        │                                         │
//! │                        └──────────▶ ToolInvoker ──▶ ToolRegistry │
//! │                                                                  │
//! │ RunCoordinator ──▶ RunSink (persistence collaborator)            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `ProviderAdapter` trait lets OpenAI-compatible servers, Anthropic,
//! Google or a custom endpoint be swapped without touching the loop. The
//! engine is stateless across turns: callers pass the full history each time.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fanout;
pub mod invoker;
pub mod message;
pub mod provider;
pub mod reasoning;
pub mod run;
pub mod store;
pub mod tool;

pub use config::{AgentDefinition, EngineSettings, ModelEndpoint, Pricing, ProviderKind, RetryPolicy, SamplingParams};
pub use coordinator::RunCoordinator;
pub use error::{AgentError, ErrorKind, ProviderError, Result, ToolError};
pub use fanout::FanoutDispatcher;
pub use invoker::{ToolCallRecord, ToolCallStatus, ToolInvoker};
pub use message::{Message, Role, ToolCallRequest};
pub use provider::{AdapterFactory, ChatRequest, ChatResponse, ProviderAdapter, TokenUsage};
pub use reasoning::{LoopState, ReasoningLoop, RunContext};
pub use run::{Run, RunError, RunStatus};
pub use store::{MemoryRunStore, RunSink};
pub use tool::{FnTool, ParameterSchema, Tool, ToolRegistry, ToolSpec};
