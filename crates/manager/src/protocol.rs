//! Contract between the manager and the agent protocol adapters.

use async_trait::async_trait;
use fleet_core::{Agent, Configuration, Labels, Result};
use fleet_store::ResourceStore;
use tokio_util::sync::CancellationToken;

/// Desired state pushed to one agent. `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentUpdates {
    pub labels: Option<Labels>,
    pub configuration: Option<Configuration>,
}

impl AgentUpdates {
    pub fn labels(labels: Labels) -> Self { Self { labels: Some(labels), configuration: None } }

    pub fn configuration(configuration: Configuration) -> Self { Self { labels: None, configuration: Some(configuration) } }

    pub fn is_empty(&self) -> bool { self.labels.is_none() && self.configuration.is_none() }

    /// Fields set in `other` win.
    pub fn merge(&mut self, other: AgentUpdates) {
        if other.labels.is_some() {
            self.labels = other.labels;
        }
        if other.configuration.is_some() {
            self.configuration = other.configuration;
        }
    }
}

/// Full desired state for `agent`: its labels and the configuration it should run.
pub fn agent_updates(store: &ResourceStore, agent: &Agent) -> Result<AgentUpdates> {
    Ok(AgentUpdates { labels: Some(agent.labels.clone()), configuration: store.configuration_for(agent)? })
}

/// An agent protocol adapter registered with the manager.
#[async_trait]
pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;

    /// True if the agent has a live session on this adapter.
    fn connected(&self, agent_id: &str) -> bool;

    async fn connected_agent_ids(&self, ctx: &CancellationToken) -> Result<Vec<String>>;

    /// Drop the agent's session. Returns false if it had none.
    async fn disconnect(&self, agent_id: &str) -> bool;

    /// Push `updates` to the agent. Adapters without a session for it return `Ok`.
    async fn update_agent(&self, ctx: &CancellationToken, agent: &Agent, updates: &AgentUpdates) -> Result<()>;

    async fn send_heartbeat(&self, agent_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::ConfigurationSpec;

    #[test]
    fn merge_prefers_later_fields() {
        let mut u = AgentUpdates::labels("env=a".parse().unwrap());
        assert!(!u.is_empty());
        u.merge(AgentUpdates::configuration(Configuration::new("c1", ConfigurationSpec::default())));
        assert_eq!(u.labels.as_ref().and_then(|l| l.get("env")), Some("a"));
        assert_eq!(u.configuration.as_ref().map(|c| c.name()), Some("c1"));
        u.merge(AgentUpdates::labels("env=b".parse().unwrap()));
        assert_eq!(u.labels.as_ref().and_then(|l| l.get("env")), Some("b"));
        assert!(AgentUpdates::default().is_empty());
    }
}
