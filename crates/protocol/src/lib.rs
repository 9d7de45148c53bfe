//! Fleet agent protocol: connection checks, per-agent status handling and configuration
//! pushes for agents speaking the open agent-management protocol.
//!
//! The transport (websocket or plain HTTP) is outside this crate. It calls
//! [`AgentProtocol::on_connecting`] with the upgrade request headers, then
//! [`AgentProtocol::on_message`] for every decoded frame, and
//! [`AgentProtocol::on_connection_close`] when the socket goes away.

#![forbid(unsafe_code)]

pub mod config;
pub mod connection;
pub mod messages;
pub mod syncer;

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{Agent, AgentStatus, Error, Result};
use fleet_manager::{agent_updates, AgentUpdates, LiveTailConfigurer, LiveTailMessage, LiveTailSession, Protocol, Relayer};
use fleet_store::ResourceStore;
use http::{HeaderMap, HeaderValue, StatusCode};
use metrics::counter;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use config::{ConfigDiff, ManagerFile, RawAgentConfiguration, RawRenderer, Renderer};
pub use connection::{Connection, ConnectionTable};
pub use messages::{AgentRemoteConfig, AgentToServer, CustomMessage, RemoteConfigStatuses, ServerToAgent};
pub use syncer::{AgentState, StatusState};

use messages::RemoteConfigStatus;
use syncer::{sync, SYNCERS};

pub const PROTOCOL_NAME: &str = "opamp";

/// Custom-message capability used for live-tail configuration and samples.
pub const LIVE_TAIL_CAPABILITY: &str = "com.bindplane.livetail";

pub mod headers {
    pub const AUTHORIZATION: &str = "Authorization";
    pub const OPAMP_VERSION: &str = "OpAMP-Version";
    pub const AGENT_ID: &str = "Agent-ID";
    pub const AGENT_VERSION: &str = "Agent-Version";
    pub const AGENT_HOSTNAME: &str = "Agent-Hostname";
}

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Required `Authorization: Secret-Key <key>` value. `None` accepts any agent.
    pub secret_key: Option<String>,
    /// Accepted `OpAMP-Version` values. Empty accepts every version.
    pub compatible_versions: Vec<String>,
    pub send_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            compatible_versions: vec!["v0.2.0".to_string()],
            send_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Identity headers of an accepted connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectingInfo {
    pub agent_id: Option<String>,
    pub agent_version: Option<String>,
    pub hostname: Option<String>,
}

/// HTTP status and headers for a connection refused by `on_connecting`.
pub fn rejection(err: &Error) -> Option<(StatusCode, HeaderMap)> {
    match err {
        Error::UpgradeRequired { supported } => {
            let mut h = HeaderMap::new();
            if let Some(v) = supported.first().and_then(|v| HeaderValue::from_str(v).ok()) {
                h.insert(http::header::UPGRADE, v);
            }
            Some((StatusCode::UPGRADE_REQUIRED, h))
        }
        Error::Unauthorized => Some((StatusCode::UNAUTHORIZED, HeaderMap::new())),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LiveTailPayload {
    #[serde(default)]
    sessions: Vec<String>,
    #[serde(default)]
    records: Json,
}

/// Protocol adapter owning the connection table. Constructed once per server.
pub struct AgentProtocol {
    store: Arc<ResourceStore>,
    connections: ConnectionTable,
    renderer: Arc<dyn Renderer>,
    config: ProtocolConfig,
    relayer: OnceCell<Weak<Relayer>>,
}

impl AgentProtocol {
    pub fn new(store: Arc<ResourceStore>, config: ProtocolConfig) -> Self {
        Self::with_renderer(store, config, Arc::new(RawRenderer))
    }

    pub fn with_renderer(store: Arc<ResourceStore>, config: ProtocolConfig, renderer: Arc<dyn Renderer>) -> Self {
        Self { store, connections: ConnectionTable::new(), renderer, config, relayer: OnceCell::new() }
    }

    pub fn connections(&self) -> &ConnectionTable { &self.connections }

    /// Route inbound live-tail samples to `relayer`. Only the first call has an effect.
    pub fn set_relayer(&self, relayer: &Arc<Relayer>) {
        if self.relayer.set(Arc::downgrade(relayer)).is_err() {
            debug!("relayer already set");
        }
    }

    /// Check the upgrade request headers.
    pub fn on_connecting(&self, request: &HeaderMap) -> Result<ConnectingInfo> {
        let header = |name: &str| request.get(name).and_then(|v| v.to_str().ok()).map(str::trim);
        let info = ConnectingInfo {
            agent_id: header(headers::AGENT_ID).map(str::to_string),
            agent_version: header(headers::AGENT_VERSION).map(str::to_string),
            hostname: header(headers::AGENT_HOSTNAME).map(str::to_string),
        };
        let supported = &self.config.compatible_versions;
        if !supported.is_empty() {
            let version = header(headers::OPAMP_VERSION);
            if !version.map(|v| supported.iter().any(|s| s == v)).unwrap_or(false) {
                warn!(agent_id = ?info.agent_id, version = ?version, "incompatible protocol version");
                return Err(Error::UpgradeRequired { supported: supported.clone() });
            }
        }
        if let Some(secret) = self.config.secret_key.as_deref().filter(|s| !s.is_empty()) {
            let key = header(headers::AUTHORIZATION).and_then(|v| v.strip_prefix("Secret-Key "));
            if key != Some(secret) {
                warn!(agent_id = ?info.agent_id, "agent rejected: bad secret key");
                return Err(Error::Unauthorized);
            }
        }
        Ok(info)
    }

    pub fn on_connected(&self, connection: &Arc<dyn Connection>) {
        debug!(connection = connection.id(), remote = %connection.remote_addr(), "connection opened");
    }

    /// Handle one status report: sync substates into the agent record, derive its status,
    /// and answer with the flags and remote configuration it needs.
    pub async fn on_message(&self, connection: &Arc<dyn Connection>, msg: AgentToServer) -> Result<ServerToAgent> {
        counter!("protocol_messages_total", 1u64);
        let agent_id = msg.instance_uid.clone();
        if agent_id.is_empty() {
            return Err(Error::Invalid("message without instance_uid".into()));
        }
        let (new, replaced) = self.connections.register(connection, &agent_id);
        if let Some(old) = replaced {
            if let Err(e) = old.close().await {
                debug!(agent_id = %agent_id, error = %e, "closing replaced connection failed");
            }
        }
        if new {
            info!(agent_id = %agent_id, remote = %connection.remote_addr(), "agent connected");
        }
        if let Some(custom) = msg.custom_message.as_ref().filter(|c| c.capability == LIVE_TAIL_CAPABILITY) {
            self.relay_live_tail(&agent_id, custom).await;
        }

        let mut response = ServerToAgent::new(&agent_id);
        let mut failure: Option<Error> = None;
        let store = &self.store;
        let renderer = &*self.renderer;
        let remote_addr = connection.remote_addr();
        self.store
            .upsert_agent(&agent_id, |agent| {
                let previous = AgentState::load(agent);
                let mut state = previous.clone().unwrap_or_default();
                let previous_seq = previous.as_ref().map(|s| s.sequence_num);
                for syncer in SYNCERS {
                    sync(syncer, &msg, previous_seq, &mut state.status, agent, &mut response);
                }
                state.sequence_num = msg.sequence_num;
                agent.protocol = Some(PROTOCOL_NAME.to_string());
                if !remote_addr.is_empty() {
                    agent.remote_address = remote_addr;
                }
                agent.connect();
                derive_status(agent, msg.remote_config_status.as_ref());
                if !response.requests_full_state() {
                    match remote_config(store, renderer, agent, &state.status, None) {
                        Ok(Some(rc)) => {
                            agent.status = AgentStatus::Configuring;
                            response.remote_config = Some(rc);
                        }
                        Ok(None) => {}
                        Err(e) => failure = Some(e),
                    }
                }
                state.store(agent);
            })
            .await?;

        if let Some(e) = failure {
            warn!(agent_id = %agent_id, error = %e, "remote configuration not computed");
        }
        if response.requests_full_state() {
            counter!("protocol_full_state_requests_total", 1u64);
            debug!(agent_id = %agent_id, seq = msg.sequence_num, "requesting full state");
        }
        if let Some(rc) = &response.remote_config {
            counter!("protocol_remote_configs_total", 1u64);
            info!(agent_id = %agent_id, hash = %hex::encode(&rc.config_hash), "sending remote configuration");
        }
        if let Err(e) = self.connections.send_on(connection, &response, self.config.send_timeout).await {
            counter!("protocol_send_errors_total", 1u64);
            warn!(agent_id = %agent_id, error = %e, "response not sent");
        }
        Ok(response)
    }

    /// Forget the connection and mark its agent disconnected.
    pub async fn on_connection_close(&self, connection: &Arc<dyn Connection>) -> Result<()> {
        let Some(agent_id) = self.connections.remove_connection(connection.id()) else { return Ok(()) };
        self.store.upsert_agent(&agent_id, |a| a.disconnect()).await?;
        info!(agent_id = %agent_id, "agent disconnected");
        Ok(())
    }

    /// Send heartbeats to every connected agent until `ctx` is cancelled.
    pub fn spawn_heartbeat(self: &Arc<Self>, ctx: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.config.heartbeat_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = tick.tick() => {
                        for id in this.connections.agent_ids() {
                            // Failures are logged by send_heartbeat; the connection stays.
                            let _ = this.send_heartbeat(&id).await;
                        }
                    }
                }
            }
        })
    }

    async fn relay_live_tail(&self, agent_id: &str, custom: &CustomMessage) {
        let Some(relayer) = self.relayer.get().and_then(Weak::upgrade) else { return };
        match serde_json::from_slice::<LiveTailPayload>(&custom.data) {
            Ok(p) => {
                relayer
                    .relay(LiveTailMessage { agent_id: agent_id.to_string(), sessions: p.sessions, records: p.records })
                    .await
            }
            Err(e) => warn!(agent_id = %agent_id, error = %e, "bad live tail payload"),
        }
    }

    async fn send(&self, agent_id: &str, message: &ServerToAgent) -> Result<bool> {
        self.connections.send_to_agent(agent_id, message, self.config.send_timeout).await.map_err(|e| {
            counter!("protocol_send_errors_total", 1u64);
            warn!(agent_id = %agent_id, error = %e, "send failed");
            e
        })
    }
}

/// Status from the agent's report on its last remote configuration.
fn derive_status(agent: &mut Agent, status: Option<&RemoteConfigStatus>) {
    match status.map(|s| (s.status, s)) {
        Some((RemoteConfigStatuses::Failed, s)) => {
            agent.status = AgentStatus::Error;
            agent.error_message = s.error_message.clone();
        }
        Some((RemoteConfigStatuses::Applying, _)) => {
            agent.status = AgentStatus::Configuring;
            agent.error_message.clear();
        }
        _ => {
            agent.status = AgentStatus::Connected;
            agent.error_message.clear();
        }
    }
}

/// Remote configuration that moves the agent from its effective configuration to the desired
/// one, or `None` when nothing differs or the agent already reported this exact configuration.
fn remote_config(
    store: &ResourceStore,
    renderer: &dyn Renderer,
    agent: &Agent,
    status: &StatusState,
    overrides: Option<&AgentUpdates>,
) -> Result<Option<AgentRemoteConfig>> {
    let Some(effective) = &status.effective_config else { return Ok(None) };
    let current = RawAgentConfiguration::from_effective(effective);
    let mut desired = agent_updates(store, agent)?;
    if let Some(o) = overrides {
        desired.merge(o.clone());
    }
    let collector = match &desired.configuration {
        Some(c) => renderer.render(c, agent)?,
        None => None,
    };
    let diff = current.diff(collector.as_deref(), desired.labels.as_ref());
    if diff.is_empty() {
        return Ok(None);
    }
    let next = current.apply_updates(Some(&diff))?;
    let hash = next.hash();
    if status.remote_config_status.as_ref().map(|s| s.last_remote_config_hash == hash).unwrap_or(false) {
        debug!(agent_id = %agent.id, "agent already has this configuration; not resending");
        return Ok(None);
    }
    Ok(Some(AgentRemoteConfig { config: next.to_config_map(), config_hash: hash }))
}

#[async_trait]
impl Protocol for AgentProtocol {
    fn name(&self) -> &'static str { PROTOCOL_NAME }

    fn connected(&self, agent_id: &str) -> bool { self.connections.connected(agent_id) }

    async fn connected_agent_ids(&self, _ctx: &CancellationToken) -> Result<Vec<String>> { Ok(self.connections.agent_ids()) }

    async fn disconnect(&self, agent_id: &str) -> bool {
        let Some(conn) = self.connections.remove_agent(agent_id) else { return false };
        if let Err(e) = conn.close().await {
            debug!(agent_id = %agent_id, error = %e, "close failed");
        }
        info!(agent_id = %agent_id, "agent connection closed by server");
        true
    }

    async fn update_agent(&self, _ctx: &CancellationToken, agent: &Agent, updates: &AgentUpdates) -> Result<()> {
        if !self.connections.connected(&agent.id) || self.store.agent(&agent.id)?.is_none() {
            return Ok(());
        }
        let mut pushed: Option<AgentRemoteConfig> = None;
        let mut failure: Option<Error> = None;
        let store = &self.store;
        let renderer = &*self.renderer;
        self.store
            .upsert_agent(&agent.id, |a| {
                let Some(state) = AgentState::load(a) else { return };
                match remote_config(store, renderer, a, &state.status, Some(updates)) {
                    Ok(Some(rc)) => {
                        a.status = AgentStatus::Configuring;
                        pushed = Some(rc);
                    }
                    Ok(None) => {}
                    Err(e) => failure = Some(e),
                }
            })
            .await?;
        if let Some(e) = failure {
            return Err(e);
        }
        let Some(rc) = pushed else { return Ok(()) };
        counter!("protocol_remote_configs_total", 1u64);
        info!(agent_id = %agent.id, hash = %hex::encode(&rc.config_hash), "pushing remote configuration");
        let message = ServerToAgent { remote_config: Some(rc), ..ServerToAgent::new(&agent.id) };
        self.send(&agent.id, &message).await.map(|_| ())
    }

    async fn send_heartbeat(&self, agent_id: &str) -> Result<()> {
        self.send(agent_id, &ServerToAgent::new(agent_id)).await.map(|_| ())
    }
}

#[async_trait]
impl LiveTailConfigurer for AgentProtocol {
    async fn configure_live_tail(&self, agent_id: &str, sessions: &[LiveTailSession]) -> Result<()> {
        let message = ServerToAgent {
            custom_message: Some(CustomMessage {
                capability: LIVE_TAIL_CAPABILITY.to_string(),
                kind: "configure".to_string(),
                data: serde_json::to_vec(sessions)?,
            }),
            ..ServerToAgent::new(agent_id)
        };
        self.send(agent_id, &message).await.map(|_| ())
    }
}
