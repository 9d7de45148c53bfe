//! The three agent-side configuration files and the diff the server pushes.

use fleet_core::{Agent, Configuration, Labels, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::messages::{AgentConfigFile, AgentConfigMap, EffectiveConfig};

pub const COLLECTOR_FILENAME: &str = "collector.yaml";
pub const LOGGING_FILENAME: &str = "logging.yaml";
pub const MANAGER_FILENAME: &str = "manager.yaml";

/// `manager.yaml` as written by the agent. Absent fields stay absent; unknown ones are dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cacert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tlscert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tlskey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_interval: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_interval: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connect_backoff: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headless: Option<bool>,
}

/// What must change on the agent. `logging.yaml` is never managed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDiff {
    pub collector: Option<String>,
    pub labels: Option<Labels>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool { self.collector.is_none() && self.labels.is_none() }
}

/// File bodies as reported by the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawAgentConfiguration {
    pub collector: Vec<u8>,
    pub logging: Vec<u8>,
    pub manager: Vec<u8>,
}

impl RawAgentConfiguration {
    pub fn from_config_map(map: &AgentConfigMap) -> Self {
        let body = |name: &str| map.config_map.get(name).map(|f| f.body.clone()).unwrap_or_default();
        Self { collector: body(COLLECTOR_FILENAME), logging: body(LOGGING_FILENAME), manager: body(MANAGER_FILENAME) }
    }

    pub fn from_effective(config: &EffectiveConfig) -> Self { Self::from_config_map(&config.config_map) }

    /// Config map with the non-empty files.
    pub fn to_config_map(&self) -> AgentConfigMap {
        let mut map = AgentConfigMap::default();
        for (name, body) in
            [(COLLECTOR_FILENAME, &self.collector), (LOGGING_FILENAME, &self.logging), (MANAGER_FILENAME, &self.manager)]
        {
            if !body.is_empty() {
                map.config_map.insert(name.to_string(), AgentConfigFile::yaml(body.clone()));
            }
        }
        map
    }

    /// Parsed `manager.yaml`; `None` when empty or unparseable.
    pub fn manager(&self) -> Option<ManagerFile> {
        if self.manager.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }
        match serde_yaml::from_slice::<ManagerFile>(&self.manager) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(error = %e, "unparseable manager.yaml");
                None
            }
        }
    }

    /// Labels the agent reports in `manager.yaml`.
    pub fn labels(&self) -> Labels {
        self.manager()
            .and_then(|m| m.labels)
            .and_then(|l| l.parse::<Labels>().ok())
            .unwrap_or_default()
    }

    /// Difference between this configuration and the desired collector document and labels.
    pub fn diff(&self, collector: Option<&str>, labels: Option<&Labels>) -> ConfigDiff {
        let mut diff = ConfigDiff::default();
        if let Some(c) = collector {
            if c.as_bytes() != self.collector.as_slice() {
                diff.collector = Some(c.to_string());
            }
        }
        if let Some(l) = labels {
            let desired = l.custom();
            if desired != self.labels().custom() {
                diff.labels = Some(desired);
            }
        }
        diff
    }

    /// Configuration after the agent applies `diff`. `None` returns an identical copy.
    pub fn apply_updates(&self, diff: Option<&ConfigDiff>) -> Result<Self> {
        let Some(diff) = diff else { return Ok(self.clone()) };
        let mut next = self.clone();
        if let Some(c) = &diff.collector {
            next.collector = c.clone().into_bytes();
        }
        if let Some(l) = &diff.labels {
            let mut manager = self.manager().unwrap_or_default();
            manager.labels = Some(l.to_string());
            next.manager = encode_manager(&manager)?;
        }
        Ok(next)
    }

    /// sha256 over collector, logging and manager. `manager.yaml` is hashed in canonical
    /// field order so reordering its keys does not change the hash.
    pub fn hash(&self) -> Vec<u8> {
        let manager = self.manager().and_then(|m| encode_manager(&m).ok()).unwrap_or_else(|| self.manager.clone());
        let mut h = Sha256::new();
        h.update(&self.collector);
        h.update(&self.logging);
        h.update(&manager);
        h.finalize().to_vec()
    }
}

fn encode_manager(m: &ManagerFile) -> Result<Vec<u8>> {
    serde_yaml::to_string(m)
        .map(String::into_bytes)
        .map_err(|e| fleet_core::Error::Internal(format!("encoding manager.yaml: {}", e)))
}

/// Renders the collector document for an agent from its configuration.
pub trait Renderer: Send + Sync {
    fn render(&self, configuration: &Configuration, agent: &Agent) -> Result<Option<String>>;
}

/// Uses the configuration's raw document as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawRenderer;

impl Renderer for RawRenderer {
    fn render(&self, configuration: &Configuration, _agent: &Agent) -> Result<Option<String>> {
        Ok(configuration.spec.raw.clone())
    }
}
