//! Catalog & Server Configuration
//!
//! Agents, model endpoints and HTTP tools loaded from a JSON file. This
//! stands in for the CRUD store: the engine only ever reads it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use agent_core::{AgentDefinition, ModelEndpoint, ProviderKind};
use agent_runtime::HttpToolConfig;
use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

/// Process configuration from the environment
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// JSON catalog; a single local-model agent is used when unset
    pub catalog_path: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into()),
            catalog_path: std::env::var("CATALOG_PATH").ok().map(PathBuf::from),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,

    #[serde(default)]
    pub models: Vec<ModelEndpoint>,

    #[serde(default)]
    pub tools: Vec<HttpToolConfig>,
}

impl Catalog {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading catalog {}", path.display()))?;
        let catalog: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing catalog {}", path.display()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// One agent on a local Ollama server, mirroring `OLLAMA_HOST`/`OLLAMA_MODEL`.
    pub fn local_default() -> Self {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| "http://localhost:11434".into());
        let model = std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3.2".into());

        let mut agent = AgentDefinition::new("assistant", "local");
        agent.name = "Assistant".into();
        agent.enabled_tools = vec!["calculator".into(), "datetime".into()];

        Self {
            agents: vec![agent],
            models: vec![ModelEndpoint::new("local", ProviderKind::OpenaiCompatible, host, model)],
            tools: Vec::new(),
        }
    }

    /// Every agent and endpoint must validate, ids must be unique, and
    /// model references must resolve.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut models = HashMap::new();
        for model in &self.models {
            model.validate()?;
            if models.insert(model.id.as_str(), model).is_some() {
                bail!("duplicate model id '{}'", model.id);
            }
        }

        let mut agents = HashMap::new();
        for agent in &self.agents {
            agent.validate()?;
            if agents.insert(agent.id.as_str(), agent).is_some() {
                bail!("duplicate agent id '{}'", agent.id);
            }
            for model_ref in std::iter::once(&agent.primary_model).chain(agent.fallback_model.as_ref()) {
                if !models.contains_key(model_ref.as_str()) {
                    bail!("agent '{}' references unknown model '{model_ref}'", agent.id);
                }
            }
        }
        Ok(())
    }

    pub fn agent(&self, id: &str) -> Option<&AgentDefinition> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn model(&self, id: &str) -> Option<&ModelEndpoint> {
        self.models.iter().find(|m| m.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> serde_json::Value {
        serde_json::json!({
            "agents": [{
                "id": "helper",
                "primary_model": "gpt",
                "fallback_model": "claude",
                "enabled_tools": ["calculator"],
                "parallel_tool_calls": true
            }],
            "models": [
                { "id": "gpt", "kind": "openai-compatible", "base_url": "https://api.openai.com/v1", "model": "gpt-4o" },
                {
                    "id": "claude",
                    "kind": "anthropic",
                    "base_url": "https://api.anthropic.com",
                    "model": "claude-3-5-sonnet-20241022",
                    "pricing": { "input_per_1k": "0.003", "output_per_1k": "0.015" }
                }
            ]
        })
    }

    #[test]
    fn test_catalog_parses_and_validates() {
        let catalog: Catalog = serde_json::from_value(sample()).unwrap();
        assert!(catalog.validate().is_ok());
        assert_eq!(catalog.agent("helper").unwrap().max_iterations, 6);
        assert!(catalog.model("claude").unwrap().pricing.is_some());
    }

    #[test]
    fn test_unknown_model_reference_rejected() {
        let mut catalog: Catalog = serde_json::from_value(sample()).unwrap();
        catalog.agents[0].fallback_model = Some("missing".into());
        let err = catalog.validate().unwrap_err();
        assert!(err.to_string().contains("unknown model 'missing'"));
    }

    #[test]
    fn test_example_catalog_is_valid() {
        let catalog: Catalog = serde_json::from_str(include_str!("../catalog.example.json")).unwrap();
        assert!(catalog.validate().is_ok());
        assert_eq!(catalog.tools[0].parameters.required, ["city"]);
        assert!(catalog.agent("assistant").unwrap().parallel_tool_calls);
    }

    #[test]
    fn test_local_default_is_valid() {
        assert!(Catalog::local_default().validate().is_ok());
    }
}
