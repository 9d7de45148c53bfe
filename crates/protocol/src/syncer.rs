//! Per-substate syncers. Each syncer copies one part of an agent's status report into the
//! stored agent, or asks for a full report when the part is missing or a message was lost.

use fleet_core::{Agent, Labels};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::messages::{
    agent_capabilities, flags, AgentDescription, AgentToServer, EffectiveConfig, PackageStatuses, RemoteConfigStatus,
    ServerToAgent,
};

/// Protocol substate kept in `Agent::state`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub sequence_num: u64,
    #[serde(default)]
    pub status: StatusState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_description: Option<AgentDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_config: Option<EffectiveConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_config_status: Option<RemoteConfigStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_statuses: Option<PackageStatuses>,
}

impl AgentState {
    /// Decode the agent's stored state. Missing or undecodable state starts fresh.
    pub fn load(agent: &Agent) -> Option<Self> {
        let state = agent.state.as_ref()?;
        match serde_json::from_value(state.clone()) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(agent_id = %agent.id, error = %e, "discarding undecodable agent state");
                None
            }
        }
    }

    pub fn store(&self, agent: &mut Agent) {
        match serde_json::to_value(self) {
            Ok(v) => agent.state = Some(v),
            Err(e) => warn!(agent_id = %agent.id, error = %e, "agent state not stored"),
        }
    }
}

/// True if `next` does not directly follow `prev`. Unsigned, so a step back is a gap too.
pub fn sequence_gap(prev: u64, next: u64) -> bool { next.wrapping_sub(prev) > 1 }

pub trait Syncer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Agent capability that means the agent can report this substate.
    fn capability(&self) -> u64;

    fn present(&self, msg: &AgentToServer) -> bool;

    /// Copy the incoming substate into `state` and `agent`. Returns false if nothing changed.
    fn apply(&self, msg: &AgentToServer, state: &mut StatusState, agent: &mut Agent) -> bool;
}

/// Run one syncer. `previous` is the last stored sequence number, `None` on first contact.
pub fn sync(
    syncer: &dyn Syncer,
    msg: &AgentToServer,
    previous: Option<u64>,
    state: &mut StatusState,
    agent: &mut Agent,
    response: &mut ServerToAgent,
) -> bool {
    let gap = previous.map(|p| sequence_gap(p, msg.sequence_num)).unwrap_or(false);
    if !syncer.present(msg) || gap {
        if msg.capabilities & syncer.capability() != 0 {
            response.flags |= flags::REPORT_FULL_STATE;
        }
        return false;
    }
    let changed = syncer.apply(msg, state, agent);
    if changed {
        debug!(agent_id = %agent.id, substate = syncer.name(), "substate updated");
    }
    changed
}

pub struct AgentDescriptionSyncer;
pub struct EffectiveConfigSyncer;
pub struct RemoteConfigStatusSyncer;
pub struct PackageStatusesSyncer;

/// Syncers in the order they run.
pub const SYNCERS: [&dyn Syncer; 4] =
    [&AgentDescriptionSyncer, &EffectiveConfigSyncer, &RemoteConfigStatusSyncer, &PackageStatusesSyncer];

impl Syncer for AgentDescriptionSyncer {
    fn name(&self) -> &'static str { "agent_description" }
    fn capability(&self) -> u64 { agent_capabilities::REPORTS_STATUS }
    fn present(&self, msg: &AgentToServer) -> bool { msg.agent_description.is_some() }

    fn apply(&self, msg: &AgentToServer, state: &mut StatusState, agent: &mut Agent) -> bool {
        let Some(desc) = &msg.agent_description else { return false };
        if state.agent_description.as_ref() == Some(desc) {
            return false;
        }
        apply_description(desc, agent);
        state.agent_description = Some(desc.clone());
        true
    }
}

impl Syncer for EffectiveConfigSyncer {
    fn name(&self) -> &'static str { "effective_config" }
    fn capability(&self) -> u64 { agent_capabilities::REPORTS_EFFECTIVE_CONFIG }
    fn present(&self, msg: &AgentToServer) -> bool { msg.effective_config.is_some() }

    fn apply(&self, msg: &AgentToServer, state: &mut StatusState, agent: &mut Agent) -> bool {
        let Some(cfg) = &msg.effective_config else { return false };
        if state.effective_config.as_ref() == Some(cfg) {
            return false;
        }
        let files: serde_json::Map<String, Json> = cfg
            .config_map
            .config_map
            .iter()
            .map(|(name, f)| (name.clone(), Json::String(String::from_utf8_lossy(&f.body).into_owned())))
            .collect();
        agent.configuration = Some(Json::Object(files));
        state.effective_config = Some(cfg.clone());
        true
    }
}

impl Syncer for RemoteConfigStatusSyncer {
    fn name(&self) -> &'static str { "remote_config_status" }
    fn capability(&self) -> u64 { agent_capabilities::REPORTS_REMOTE_CONFIG }
    fn present(&self, msg: &AgentToServer) -> bool { msg.remote_config_status.is_some() }

    fn apply(&self, msg: &AgentToServer, state: &mut StatusState, _agent: &mut Agent) -> bool {
        let Some(status) = &msg.remote_config_status else { return false };
        if state.remote_config_status.as_ref() == Some(status) {
            return false;
        }
        state.remote_config_status = Some(status.clone());
        true
    }
}

impl Syncer for PackageStatusesSyncer {
    fn name(&self) -> &'static str { "package_statuses" }
    fn capability(&self) -> u64 { agent_capabilities::REPORTS_PACKAGE_STATUSES }
    fn present(&self, msg: &AgentToServer) -> bool { msg.package_statuses.is_some() }

    fn apply(&self, msg: &AgentToServer, state: &mut StatusState, _agent: &mut Agent) -> bool {
        let Some(packages) = &msg.package_statuses else { return false };
        if state.package_statuses.as_ref() == Some(packages) {
            return false;
        }
        state.package_statuses = Some(packages.clone());
        true
    }
}

/// Copy descriptor attributes onto the agent record. `service.labels` replaces the agent's
/// custom labels; if it does not parse only the reserved labels remain.
fn apply_description(desc: &AgentDescription, agent: &mut Agent) {
    let attr = |k: &str| desc.attribute(k).map(str::to_string);
    if let Some(name) = attr("service.instance.name").or_else(|| attr("host.name")) {
        agent.name = name;
    }
    if let Some(v) = attr("service.version") {
        agent.version = v;
    }
    if let Some(v) = attr("os.family") {
        agent.platform = v;
    }
    if let Some(v) = attr("os.details") {
        agent.operating_system = v;
    }
    if let Some(v) = attr("os.arch") {
        agent.architecture = v;
    }
    if let Some(v) = attr("host.name") {
        agent.hostname = v;
    }
    if let Some(v) = attr("host.mac_address") {
        agent.mac_address = v;
    }
    let custom = match desc.attribute("service.labels") {
        Some(raw) => raw.parse::<Labels>().unwrap_or_else(|e| {
            warn!(agent_id = %agent.id, error = %e, "ignoring unparseable service.labels");
            Labels::new()
        }),
        None => Labels::new(),
    };
    agent.set_custom_labels(&custom);
}
