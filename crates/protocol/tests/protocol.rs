use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{AgentSelector, AgentStatus, Configuration, ConfigurationSpec, Labels, Resource, Result};
use fleet_manager::{LiveTailConfigurer, Manager, ManagerConfig, Relayer};
use fleet_protocol::messages::{
    agent_capabilities, AgentConfigFile, AgentConfigMap, AgentDescription, EffectiveConfig, KeyValue,
    RemoteConfigStatus,
};
use fleet_protocol::{
    AgentProtocol, AgentToServer, Connection, CustomMessage, ProtocolConfig, RemoteConfigStatuses, ServerToAgent,
    LIVE_TAIL_CAPABILITY,
};
use fleet_store::ResourceStore;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct MockConnection {
    id: u64,
    sent: Mutex<Vec<ServerToAgent>>,
    closed: AtomicBool,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockConnection {
    fn new(id: u64) -> Arc<Self> { Arc::new(Self { id, ..Default::default() }) }

    fn sent(&self) -> Vec<ServerToAgent> { self.sent.lock().clone() }
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> u64 { self.id }

    fn remote_addr(&self) -> String { "10.0.0.7:51000".into() }

    async fn send(&self, message: &ServerToAgent) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        self.sent.lock().push(message.clone());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

const CAPS: u64 = agent_capabilities::REPORTS_STATUS
    | agent_capabilities::ACCEPTS_REMOTE_CONFIG
    | agent_capabilities::REPORTS_EFFECTIVE_CONFIG
    | agent_capabilities::REPORTS_REMOTE_CONFIG;

fn effective(collector: &str, labels: &str) -> EffectiveConfig {
    let mut map = AgentConfigMap::default();
    map.config_map.insert("collector.yaml".into(), AgentConfigFile::yaml(collector.as_bytes().to_vec()));
    map.config_map.insert(
        "manager.yaml".into(),
        AgentConfigFile::yaml(format!("endpoint: ws://fleet:3001/v1/opamp\nagent_id: a1\nlabels: {}\n", labels)),
    );
    EffectiveConfig { config_map: map }
}

fn report(seq: u64, collector: &str, remote: RemoteConfigStatus) -> AgentToServer {
    AgentToServer {
        instance_uid: "a1".into(),
        sequence_num: seq,
        capabilities: CAPS,
        agent_description: Some(AgentDescription {
            identifying_attributes: vec![
                KeyValue::new("service.instance.id", "a1"),
                KeyValue::new("service.instance.name", "edge-1"),
                KeyValue::new("service.version", "v1.30.0"),
            ],
            non_identifying_attributes: vec![
                KeyValue::new("os.family", "linux"),
                KeyValue::new("service.labels", "env=prod"),
            ],
        }),
        effective_config: Some(effective(collector, "env=prod")),
        remote_config_status: Some(remote),
        ..Default::default()
    }
}

fn configuration(name: &str, raw: &str) -> Resource {
    Configuration::new(
        name,
        ConfigurationSpec {
            raw: Some(raw.to_string()),
            selector: AgentSelector { match_labels: "env=prod".parse::<Labels>().unwrap() },
            ..Default::default()
        },
    )
    .into()
}

async fn setup() -> (Arc<ResourceStore>, Arc<AgentProtocol>) {
    let store = Arc::new(ResourceStore::in_memory().await.unwrap());
    let protocol = Arc::new(AgentProtocol::new(Arc::clone(&store), ProtocolConfig::default()));
    (store, protocol)
}

#[tokio::test]
async fn first_contact_records_agent_without_pushing() {
    let (store, protocol) = setup().await;
    let conn = MockConnection::new(1);
    let dyn_conn: Arc<dyn Connection> = conn.clone();

    let resp = protocol.on_message(&dyn_conn, report(1, "receivers: {}\n", RemoteConfigStatus::default())).await.unwrap();
    assert!(!resp.requests_full_state());
    assert!(resp.remote_config.is_none());
    assert_eq!(conn.sent().len(), 1);

    let agent = store.agent("a1").unwrap().unwrap();
    assert_eq!(agent.name, "edge-1");
    assert_eq!(agent.status, AgentStatus::Connected);
    assert_eq!(agent.protocol.as_deref(), Some("opamp"));
    assert_eq!(agent.remote_address, "10.0.0.7:51000");
    assert_eq!(agent.labels.get("env"), Some("prod"));
    assert!(agent.configuration.is_some());
    assert!(protocol.connections().connected("a1"));
}

#[tokio::test]
async fn missing_effective_config_gets_flags_only() {
    let (store, protocol) = setup().await;
    store.apply(vec![configuration("edge", "receivers: {otlp: {}}\n")]).await.unwrap();
    let conn: Arc<dyn Connection> = MockConnection::new(1);
    let mut msg = report(1, "", RemoteConfigStatus::default());
    msg.effective_config = None;

    let resp = protocol.on_message(&conn, msg).await.unwrap();
    assert!(resp.requests_full_state());
    assert!(resp.remote_config.is_none());
    assert_ne!(resp.capabilities, 0);
}

#[tokio::test]
async fn matching_configuration_is_pushed_then_suppressed_by_hash() {
    let (store, protocol) = setup().await;
    store.apply(vec![configuration("edge", "receivers: {otlp: {}}\n")]).await.unwrap();
    let conn: Arc<dyn Connection> = MockConnection::new(1);

    let resp = protocol.on_message(&conn, report(1, "receivers: {}\n", RemoteConfigStatus::default())).await.unwrap();
    let rc = resp.remote_config.expect("remote config");
    assert_eq!(rc.config.config_map["collector.yaml"].body, b"receivers: {otlp: {}}\n".to_vec());
    assert_eq!(rc.config_hash.len(), 32);
    assert_eq!(store.agent("a1").unwrap().unwrap().status, AgentStatus::Configuring);

    // The agent failed to apply it and replays its old effective config with the hash.
    let failed = RemoteConfigStatus {
        last_remote_config_hash: rc.config_hash.clone(),
        status: RemoteConfigStatuses::Failed,
        error_message: "invalid receiver".into(),
    };
    let resp = protocol.on_message(&conn, report(2, "receivers: {}\n", failed)).await.unwrap();
    assert!(resp.remote_config.is_none());
    let agent = store.agent("a1").unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Error);
    assert_eq!(agent.error_message, "invalid receiver");

    // Once applied nothing differs.
    let applied = RemoteConfigStatus { last_remote_config_hash: rc.config_hash, status: RemoteConfigStatuses::Applied, ..Default::default() };
    let resp = protocol.on_message(&conn, report(3, "receivers: {otlp: {}}\n", applied)).await.unwrap();
    assert!(resp.remote_config.is_none());
    assert_eq!(store.agent("a1").unwrap().unwrap().status, AgentStatus::Connected);
}

#[tokio::test]
async fn sequence_gap_requests_full_state() {
    let (store, protocol) = setup().await;
    let conn: Arc<dyn Connection> = MockConnection::new(1);
    protocol.on_message(&conn, report(1, "receivers: {}\n", RemoteConfigStatus::default())).await.unwrap();

    let mut later = report(5, "receivers: {changed: {}}\n", RemoteConfigStatus::default());
    later.agent_description = None;
    let resp = protocol.on_message(&conn, later).await.unwrap();
    assert!(resp.requests_full_state());
    assert!(resp.remote_config.is_none());
    // Nothing from the gapped message was taken.
    let agent = store.agent("a1").unwrap().unwrap();
    let cfg = agent.configuration.unwrap();
    assert_eq!(cfg["collector.yaml"], "receivers: {}\n");

    let resp = protocol.on_message(&conn, report(6, "receivers: {}\n", RemoteConfigStatus::default())).await.unwrap();
    assert!(!resp.requests_full_state());
}

#[tokio::test]
async fn closing_the_connection_disconnects_the_agent() {
    let (store, protocol) = setup().await;
    let conn: Arc<dyn Connection> = MockConnection::new(1);
    protocol.on_message(&conn, report(1, "receivers: {}\n", RemoteConfigStatus::default())).await.unwrap();

    protocol.on_connection_close(&conn).await.unwrap();
    let agent = store.agent("a1").unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Disconnected);
    assert!(agent.disconnected_at.is_some());
    assert!(protocol.connections().is_empty());
    // A second close is a no-op.
    protocol.on_connection_close(&conn).await.unwrap();
}

#[tokio::test]
async fn reconnect_closes_the_previous_socket() {
    let (_store, protocol) = setup().await;
    let old = MockConnection::new(1);
    let old_dyn: Arc<dyn Connection> = old.clone();
    protocol.on_message(&old_dyn, report(1, "receivers: {}\n", RemoteConfigStatus::default())).await.unwrap();

    let new: Arc<dyn Connection> = MockConnection::new(2);
    protocol.on_message(&new, report(2, "receivers: {}\n", RemoteConfigStatus::default())).await.unwrap();
    assert!(old.closed.load(Ordering::SeqCst));
    assert_eq!(protocol.connections().len(), 1);
}

#[tokio::test]
async fn sends_to_one_agent_never_overlap() {
    let (_store, protocol) = setup().await;
    let conn = Arc::new(MockConnection { id: 1, delay: Some(Duration::from_millis(5)), ..Default::default() });
    let dyn_conn: Arc<dyn Connection> = conn.clone();
    protocol.on_message(&dyn_conn, report(1, "receivers: {}\n", RemoteConfigStatus::default())).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let p = Arc::clone(&protocol);
        tasks.push(tokio::spawn(async move { fleet_manager::Protocol::send_heartbeat(&*p, "a1").await }));
    }
    for t in tasks {
        t.await.unwrap().unwrap();
    }
    assert_eq!(conn.sent().len(), 9);
    assert_eq!(conn.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn manager_pushes_new_configuration_to_connected_agent() {
    let (store, protocol) = setup().await;
    let conn = MockConnection::new(1);
    let dyn_conn: Arc<dyn Connection> = conn.clone();
    protocol.on_message(&dyn_conn, report(1, "receivers: {}\n", RemoteConfigStatus::default())).await.unwrap();

    let manager = Arc::new(Manager::new(
        Arc::clone(&store),
        ManagerConfig { updates_interval: Duration::from_millis(5), ..Default::default() },
    ));
    manager.add_protocol(protocol.clone());
    let ctx = CancellationToken::new();
    let handle = manager.start(ctx.clone()).await;

    store.apply(vec![configuration("edge", "receivers: {otlp: {}}\n")]).await.unwrap();

    let pushed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(rc) = conn.sent().into_iter().find_map(|m| m.remote_config) {
                return rc;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("configuration pushed");
    assert_eq!(pushed.config.config_map["collector.yaml"].body, b"receivers: {otlp: {}}\n".to_vec());
    assert_eq!(store.agent("a1").unwrap().unwrap().status, AgentStatus::Configuring);

    ctx.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn live_tail_sessions_are_configured_and_relayed() {
    let (_store, protocol) = setup().await;
    let conn = MockConnection::new(1);
    let dyn_conn: Arc<dyn Connection> = conn.clone();
    protocol.on_message(&dyn_conn, report(1, "receivers: {}\n", RemoteConfigStatus::default())).await.unwrap();

    let configurer: Arc<dyn LiveTailConfigurer> = protocol.clone();
    let relayer = Arc::new(Relayer::new(configurer));
    protocol.set_relayer(&relayer);

    let mut sub = relayer.add_subscription(None, &["a1".to_string()], vec!["severity>=warn".into()]).await;
    let configure = conn.sent().into_iter().find_map(|m| m.custom_message).expect("configure message");
    assert_eq!(configure.capability, LIVE_TAIL_CAPABILITY);
    assert_eq!(configure.kind, "configure");
    let sessions: serde_json::Value = serde_json::from_slice(&configure.data).unwrap();
    assert_eq!(sessions[0]["id"], sub.id.as_str());

    let mut msg = report(2, "receivers: {}\n", RemoteConfigStatus::default());
    msg.custom_message = Some(CustomMessage {
        capability: LIVE_TAIL_CAPABILITY.into(),
        kind: "records".into(),
        data: serde_json::to_vec(&serde_json::json!({"sessions": [sub.id], "records": [{"body": "disk full"}]})).unwrap(),
    });
    protocol.on_message(&dyn_conn, msg).await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(2), sub.stream.recv()).await.unwrap().unwrap();
    assert_eq!(got.agent_id, "a1");
    assert_eq!(got.records[0]["body"], "disk full");
}
