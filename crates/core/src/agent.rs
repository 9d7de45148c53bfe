//! Agent records as stored in the catalog.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::labels::{Labels, CONFIGURATION_LABEL};

pub const LABEL_AGENT_ID: &str = "bindplane/agent-id";
pub const LABEL_AGENT_NAME: &str = "bindplane/agent-name";
pub const LABEL_AGENT_VERSION: &str = "bindplane/agent-version";
pub const LABEL_AGENT_OS: &str = "bindplane/agent-os";
pub const LABEL_AGENT_ARCH: &str = "bindplane/agent-arch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AgentStatus {
    #[default]
    Disconnected = 0,
    Connected = 1,
    Error = 2,
    Configuring = 3,
    Upgrading = 4,
    Deleted = 5,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Disconnected => "disconnected",
            AgentStatus::Connected => "connected",
            AgentStatus::Error => "error",
            AgentStatus::Configuring => "configuring",
            AgentStatus::Upgrading => "upgrading",
            AgentStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub operating_system: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub remote_address: String,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: Labels,
    /// Last effective configuration reported by the agent.
    #[serde(default)]
    pub configuration: Option<Json>,
    /// Protocol-specific substate blob.
    #[serde(default)]
    pub state: Option<Json>,
    /// Name of the protocol the agent last connected with.
    #[serde(default)]
    pub protocol: Option<String>,
}

impl Agent {
    pub fn new(id: impl Into<String>) -> Self {
        let mut a = Self { id: id.into(), ..Default::default() };
        a.disconnected_at = Some(Utc::now());
        a.ensure_reserved_labels();
        a
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.status, AgentStatus::Disconnected | AgentStatus::Deleted)
    }

    /// Mark the agent connected. The connect time only moves when it was disconnected.
    pub fn connect(&mut self) {
        if !self.is_connected() || self.connected_at.is_none() {
            self.connected_at = Some(Utc::now());
        }
        if !self.is_connected() {
            self.status = AgentStatus::Connected;
        }
        self.disconnected_at = None;
    }

    pub fn disconnect(&mut self) {
        self.status = AgentStatus::Disconnected;
        self.disconnected_at = Some(Utc::now());
    }

    /// Overwrite the server-maintained labels from the current fields.
    pub fn ensure_reserved_labels(&mut self) {
        self.labels.insert(LABEL_AGENT_ID, self.id.clone());
        for (key, value) in [
            (LABEL_AGENT_NAME, &self.name),
            (LABEL_AGENT_VERSION, &self.version),
            (LABEL_AGENT_OS, &self.platform),
            (LABEL_AGENT_ARCH, &self.architecture),
        ] {
            if value.is_empty() {
                self.labels.remove(key);
            } else {
                self.labels.insert(key, value.clone());
            }
        }
    }

    /// Replace user labels, keeping the reserved ones.
    pub fn set_custom_labels(&mut self, custom: &Labels) {
        let mut next = self.labels.reserved();
        for (k, v) in custom.custom().iter() {
            next.insert(k, v);
        }
        self.labels = next;
        self.ensure_reserved_labels();
    }

    /// Configuration pinned through the `configuration` label, if any.
    pub fn configuration_name(&self) -> Option<&str> { self.labels.get(CONFIGURATION_LABEL) }
}
