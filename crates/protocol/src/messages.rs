//! Agent protocol messages. Field layout follows the open agent-management protocol; the
//! transport framing is left to the caller.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod agent_capabilities {
    pub const REPORTS_STATUS: u64 = 0x1;
    pub const ACCEPTS_REMOTE_CONFIG: u64 = 0x2;
    pub const REPORTS_EFFECTIVE_CONFIG: u64 = 0x4;
    pub const ACCEPTS_PACKAGES: u64 = 0x8;
    pub const REPORTS_PACKAGE_STATUSES: u64 = 0x10;
    pub const REPORTS_HEALTH: u64 = 0x800;
    pub const REPORTS_REMOTE_CONFIG: u64 = 0x1000;
}

pub mod server_capabilities {
    pub const ACCEPTS_STATUS: u64 = 0x1;
    pub const OFFERS_REMOTE_CONFIG: u64 = 0x2;
    pub const ACCEPTS_EFFECTIVE_CONFIG: u64 = 0x4;
}

pub mod flags {
    /// Ask the agent to resend every substate on its next message.
    pub const REPORT_FULL_STATE: u64 = 0x1;
}

/// Capabilities this server announces on every response.
pub const SERVER_CAPABILITIES: u64 = server_capabilities::ACCEPTS_STATUS
    | server_capabilities::OFFERS_REMOTE_CONFIG
    | server_capabilities::ACCEPTS_EFFECTIVE_CONFIG;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self { Self { key: key.into(), value: value.into() } }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescription {
    #[serde(default)]
    pub identifying_attributes: Vec<KeyValue>,
    #[serde(default)]
    pub non_identifying_attributes: Vec<KeyValue>,
}

impl AgentDescription {
    /// First value for `key` in either attribute list, identifying attributes first.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.identifying_attributes
            .iter()
            .chain(self.non_identifying_attributes.iter())
            .find(|kv| kv.key == key)
            .map(|kv| kv.value.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfigFile {
    #[serde(default)]
    pub body: Vec<u8>,
    #[serde(default)]
    pub content_type: String,
}

impl AgentConfigFile {
    pub fn yaml(body: impl Into<Vec<u8>>) -> Self { Self { body: body.into(), content_type: "text/yaml".into() } }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfigMap {
    #[serde(default)]
    pub config_map: BTreeMap<String, AgentConfigFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    #[serde(default)]
    pub config_map: AgentConfigMap,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteConfigStatuses {
    #[default]
    Unset,
    Applied,
    Applying,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfigStatus {
    #[serde(default)]
    pub last_remote_config_hash: Vec<u8>,
    #[serde(default)]
    pub status: RemoteConfigStatuses,
    #[serde(default)]
    pub error_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageStatus {
    pub name: String,
    #[serde(default)]
    pub agent_has_version: String,
    #[serde(default)]
    pub server_offered_version: String,
    #[serde(default)]
    pub error_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageStatuses {
    #[serde(default)]
    pub packages: BTreeMap<String, PackageStatus>,
    #[serde(default)]
    pub server_provided_all_packages_hash: Vec<u8>,
    #[serde(default)]
    pub error_message: String,
}

/// Application-defined message carried over the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomMessage {
    pub capability: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentToServer {
    pub instance_uid: String,
    #[serde(default)]
    pub sequence_num: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_description: Option<AgentDescription>,
    #[serde(default)]
    pub capabilities: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_config: Option<EffectiveConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_config_status: Option<RemoteConfigStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_statuses: Option<PackageStatuses>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_message: Option<CustomMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRemoteConfig {
    pub config: AgentConfigMap,
    pub config_hash: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerToAgent {
    pub instance_uid: String,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub capabilities: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_config: Option<AgentRemoteConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_message: Option<CustomMessage>,
}

impl ServerToAgent {
    pub fn new(instance_uid: impl Into<String>) -> Self {
        Self { instance_uid: instance_uid.into(), capabilities: SERVER_CAPABILITIES, ..Default::default() }
    }

    pub fn requests_full_state(&self) -> bool { self.flags & flags::REPORT_FULL_STATE != 0 }
}
