//! Adapter Factory
//!
//! Selects the adapter implementation once per endpoint. The HTTP client is
//! injected so connection pools are shared and tests can swap it out.

use std::sync::Arc;
use std::time::Duration;

use agent_core::provider::{AdapterFactory, ProviderAdapter};
use agent_core::{AgentError, ModelEndpoint, ProviderKind, Result};

use crate::anthropic::AnthropicAdapter;
use crate::google::GoogleAdapter;
use crate::http::api_key_from_env;
use crate::openai::OpenAiCompatibleAdapter;

/// Environment variable consulted when an endpoint carries no API key
pub fn api_key_env_var(kind: ProviderKind) -> Option<&'static str> {
    match kind {
        ProviderKind::OpenaiCompatible => Some("OPENAI_API_KEY"),
        ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
        ProviderKind::Google => Some("GOOGLE_API_KEY"),
        ProviderKind::Custom => None,
    }
}

#[derive(Clone)]
pub struct HttpAdapterFactory {
    client: reqwest::Client,
    env_fallback: bool,
}

impl HttpAdapterFactory {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            env_fallback: true,
        }
    }

    /// Shared client with connection pooling and a connect timeout.
    /// Request timeouts are applied per endpoint.
    pub fn with_default_client() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::new(client))
    }

    /// Never read API keys from the environment
    pub fn without_env_fallback(mut self) -> Self {
        self.env_fallback = false;
        self
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    fn api_key(&self, endpoint: &ModelEndpoint) -> Option<String> {
        endpoint
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                if !self.env_fallback {
                    return None;
                }
                api_key_env_var(endpoint.kind).and_then(api_key_from_env)
            })
    }
}

impl AdapterFactory for HttpAdapterFactory {
    fn build(&self, endpoint: &ModelEndpoint) -> Result<Arc<dyn ProviderAdapter>> {
        let key = self.api_key(endpoint);
        if key.is_none() {
            tracing::debug!(endpoint = %endpoint.id, kind = %endpoint.kind, "No API key, sending unauthenticated requests");
        }

        let client = self.client.clone();
        let adapter: Arc<dyn ProviderAdapter> = match endpoint.kind {
            ProviderKind::OpenaiCompatible | ProviderKind::Custom => {
                Arc::new(OpenAiCompatibleAdapter::new(client, endpoint, key)?)
            }
            ProviderKind::Anthropic => Arc::new(AnthropicAdapter::new(client, endpoint, key)?),
            ProviderKind::Google => Arc::new(GoogleAdapter::new(client, endpoint, key)?),
        };
        Ok(adapter)
    }
}
