//! # agent-runtime
//!
//! HTTP implementations of the engine's collaborators.
//!
//! ## Providers
//!
//! - **openai-compatible**: OpenAI, Ollama, vLLM and other Chat Completions servers
//! - **anthropic**: Messages API
//! - **google**: Gemini `generateContent`
//! - **custom**: Chat Completions body posted to a fixed URL
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::HttpAdapterFactory;
//!
//! let factory = HttpAdapterFactory::with_default_client()?;
//! let coordinator = RunCoordinator::new(Arc::new(factory), Arc::new(tools), EngineSettings::from_env());
//! let run = coordinator.execute(&agent, &endpoint, &history, Message::user("hi")).await;
//! ```

pub mod anthropic;
pub mod factory;
pub mod google;
pub mod http;
pub mod http_tool;
pub mod openai;

pub use factory::HttpAdapterFactory;
pub use http_tool::{HttpTool, HttpToolConfig};

// Re-export core types for convenience
pub use agent_core::{AgentError, Message, Result, Role, Run, RunCoordinator, Tool, ToolRegistry};
