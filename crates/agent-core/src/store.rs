//! Run Persistence
//!
//! The engine hands every terminal [`Run`] to a [`RunSink`]; the storage
//! collaborator decides how it maps onto its schema.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::run::Run;

/// Receives terminal runs
#[async_trait]
pub trait RunSink: Send + Sync {
    async fn persist(&self, run: &Run) -> Result<()>;
}

/// In-memory run store (for development/testing)
#[derive(Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<Uuid, Run>>,
}

fn poisoned<T>(_: T) -> AgentError {
    AgentError::Persistence("run store lock poisoned".into())
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save a run. Only terminal runs are accepted.
    pub fn save(&self, run: &Run) -> Result<()> {
        if !run.status().is_terminal() {
            return Err(AgentError::Persistence(format!(
                "run {} is still {}",
                run.id(),
                run.status()
            )));
        }
        self.runs.write().map_err(poisoned)?.insert(run.id(), run.clone());
        Ok(())
    }

    /// Load a run by ID
    pub fn load(&self, id: Uuid) -> Result<Option<Run>> {
        Ok(self.runs.read().map_err(poisoned)?.get(&id).cloned())
    }

    /// Runs for one agent, newest first
    pub fn list_for_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<Run>> {
        let runs = self.runs.read().map_err(poisoned)?;
        let mut result: Vec<_> = runs
            .values()
            .filter(|r| r.agent_id() == agent_id)
            .cloned()
            .collect();

        result.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        result.truncate(limit);
        Ok(result)
    }

    pub fn len(&self) -> usize {
        self.runs.read().map_or(0, |r| r.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RunSink for MemoryRunStore {
    async fn persist(&self, run: &Run) -> Result<()> {
        self.save(run)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{AgentDefinition, ModelEndpoint, ProviderKind};

    fn failed_run(agent: &str) -> Run {
        let agent = AgentDefinition::new(agent, "m");
        let endpoint = ModelEndpoint::new("m", ProviderKind::Custom, "http://localhost", "m");
        let mut run = Run::new(&agent, &endpoint);
        run.fail(&AgentError::Cancelled, Duration::from_millis(5)).unwrap();
        run
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryRunStore::new();
        let run = failed_run("a");
        let id = run.id();

        store.save(&run).unwrap();
        store.save(&failed_run("b")).unwrap();

        let loaded = store.load(id).unwrap().unwrap();
        assert_eq!(loaded.id(), id);
        assert_eq!(store.list_for_agent("a", 10).unwrap().len(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_rejects_non_terminal_run() {
        let store = MemoryRunStore::new();
        let agent = AgentDefinition::new("a", "m");
        let endpoint = ModelEndpoint::new("m", ProviderKind::Custom, "http://localhost", "m");
        assert!(store.save(&Run::new(&agent, &endpoint)).is_err());
        assert!(store.is_empty());
    }
}
