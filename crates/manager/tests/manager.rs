use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{Agent, AgentSelector, Configuration, ConfigurationSpec, Error, Labels, Resource, Result};
use fleet_manager::{AgentUpdates, Manager, ManagerConfig, Protocol};
use fleet_store::ResourceStore;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct MockProtocol {
    connected: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(String, AgentUpdates)>>,
    disconnects: Mutex<Vec<String>>,
    fail_for: Option<String>,
}

impl MockProtocol {
    fn with_connected(ids: &[&str]) -> Self {
        let p = Self::default();
        p.connected.lock().extend(ids.iter().map(|s| s.to_string()));
        p
    }

    fn calls(&self) -> Vec<(String, AgentUpdates)> { self.calls.lock().clone() }
}

#[async_trait]
impl Protocol for MockProtocol {
    fn name(&self) -> &'static str { "mock" }

    fn connected(&self, agent_id: &str) -> bool { self.connected.lock().contains(agent_id) }

    async fn connected_agent_ids(&self, _ctx: &CancellationToken) -> Result<Vec<String>> {
        Ok(self.connected.lock().iter().cloned().collect())
    }

    async fn disconnect(&self, agent_id: &str) -> bool {
        self.disconnects.lock().push(agent_id.to_string());
        self.connected.lock().remove(agent_id)
    }

    async fn update_agent(&self, _ctx: &CancellationToken, agent: &Agent, updates: &AgentUpdates) -> Result<()> {
        self.calls.lock().push((agent.id.clone(), updates.clone()));
        if self.fail_for.as_deref() == Some(agent.id.as_str()) {
            return Err(Error::Transport("socket closed".into()));
        }
        Ok(())
    }

    async fn send_heartbeat(&self, _agent_id: &str) -> Result<()> { Ok(()) }
}

fn labels(s: &str) -> Labels { s.parse().unwrap() }

fn configuration(name: &str, selector: &str) -> Resource {
    Configuration::new(
        name,
        ConfigurationSpec {
            raw: Some(format!("receivers: {{}} # {}", name)),
            selector: AgentSelector { match_labels: labels(selector) },
            ..Default::default()
        },
    )
    .into()
}

async fn setup(agents: &[(&str, &str)]) -> Arc<ResourceStore> {
    let store = Arc::new(ResourceStore::in_memory().await.unwrap());
    for (id, l) in agents {
        let l = labels(l);
        store.upsert_agent(id, |a| a.set_custom_labels(&l)).await.unwrap();
    }
    store
}

fn config() -> ManagerConfig { ManagerConfig { updates_interval: Duration::from_millis(5), ..Default::default() } }

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn configuration_change_reaches_connected_agents_only() {
    let store = setup(&[("A", "env=test,app=bp"), ("B", "foo=bar")]).await;
    let mock = Arc::new(MockProtocol::with_connected(&["A"]));
    let manager = Arc::new(Manager::new(store.clone(), config()));
    manager.add_protocol(mock.clone());
    let ctx = CancellationToken::new();
    let handle = manager.start(ctx.clone()).await;

    store.apply(vec![configuration("C", "env=test,app=bp"), configuration("C2", "foo=bar")]).await.unwrap();
    eventually(|| !mock.calls().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let calls = mock.calls();
    assert_eq!(calls.len(), 1, "calls={:?}", calls);
    assert_eq!(calls[0].0, "A");
    assert_eq!(calls[0].1.configuration.as_ref().map(|c| c.name()), Some("C"));

    ctx.cancel();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removed_configuration_sends_labels_only() {
    let store = setup(&[("A", "env=test")]).await;
    let cfg = configuration("C", "env=test");
    store.apply(vec![cfg.clone()]).await.unwrap();
    let mock = Arc::new(MockProtocol::with_connected(&["A"]));
    let manager = Arc::new(Manager::new(store.clone(), config()));
    manager.add_protocol(mock.clone());
    let ctx = CancellationToken::new();
    let _handle = manager.start(ctx.clone()).await;

    store.delete(vec![cfg]).await.unwrap();
    eventually(|| !mock.calls().is_empty()).await;
    let (id, updates) = mock.calls().remove(0);
    assert_eq!(id, "A");
    assert!(updates.configuration.is_none());
    assert_eq!(updates.labels.as_ref().and_then(|l| l.get("env")), Some("test"));
    ctx.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn label_change_and_agent_removal() {
    let store = setup(&[("A", "env=test"), ("B", "env=test")]).await;
    let mock = Arc::new(MockProtocol::with_connected(&["A"]));
    let manager = Arc::new(Manager::new(store.clone(), config()));
    manager.add_protocol(mock.clone());
    let ctx = CancellationToken::new();
    let _handle = manager.start(ctx.clone()).await;

    store.apply_agent_labels("A", &labels("team=core"), false).await.unwrap();
    store.apply_agent_labels("B", &labels("team=core"), false).await.unwrap();
    eventually(|| !mock.calls().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    let calls = mock.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "A");
    assert_eq!(calls[0].1.labels.as_ref().and_then(|l| l.get("team")), Some("core"));
    assert!(calls[0].1.configuration.is_none());

    store.delete_agents(&["A".to_string()]).await.unwrap();
    eventually(|| mock.disconnects.lock().contains(&"A".to_string())).await;
    assert!(!manager.connected("A"));
    ctx.cancel();
}

#[tokio::test]
async fn one_failing_agent_does_not_stop_the_others() {
    let ids: Vec<String> = (0..12).map(|i| format!("agent-{:02}", i)).collect();
    let store = Arc::new(ResourceStore::in_memory().await.unwrap());
    for id in &ids {
        store.upsert_agent(id, |a| a.set_custom_labels(&labels("env=prod"))).await.unwrap();
    }
    let mock = Arc::new(MockProtocol {
        fail_for: Some("agent-03".into()),
        ..MockProtocol::with_connected(&ids.iter().map(|s| s.as_str()).collect::<Vec<_>>())
    });
    let manager = Manager::new(store.clone(), config());
    manager.add_protocol(mock.clone());

    let cfg = match configuration("prod", "env=prod") {
        Resource::Configuration(c) => c,
        _ => unreachable!(),
    };
    let pending: BTreeMap<String, AgentUpdates> =
        ids.iter().map(|id| (id.clone(), AgentUpdates::configuration(cfg.clone()))).collect();
    manager.dispatch(&CancellationToken::new(), pending).await;

    let mut called: Vec<String> = mock.calls().into_iter().map(|(id, _)| id).collect();
    called.sort();
    assert_eq!(called, ids);
    assert_eq!(manager.connected_agent_ids(&CancellationToken::new()).await.unwrap().len(), 12);
}

#[tokio::test]
async fn agent_updates_resolve_pinned_configuration() {
    let store = setup(&[("A", "env=test"), ("B", "env=test,configuration=pinned")]).await;
    store.apply(vec![configuration("by-selector", "env=test"), configuration("pinned", "x=y")]).await.unwrap();
    let manager = Manager::new(store.clone(), config());

    let a = store.agent("A").unwrap().unwrap();
    let b = store.agent("B").unwrap().unwrap();
    let ua = manager.agent_updates(&a).unwrap();
    let ub = manager.agent_updates(&b).unwrap();
    assert_eq!(ua.configuration.map(|c| c.metadata.name), Some("by-selector".to_string()));
    assert_eq!(ub.configuration.map(|c| c.metadata.name), Some("pinned".to_string()));
    assert_eq!(ub.labels.as_ref().and_then(|l| l.get("configuration")), Some("pinned"));
}

#[tokio::test]
async fn cleanup_removes_only_disconnected_agents() {
    let store = setup(&[("gone", ""), ("live", "")]).await;
    store.upsert_agent("live", |a| a.connect()).await.unwrap();
    let manager = Manager::new(store.clone(), config());
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(manager.cleanup_disconnected(Duration::ZERO).await.unwrap(), 1);
    assert!(store.agent("gone").unwrap().is_none());
    assert!(store.agent("live").unwrap().is_some());
    assert_eq!(manager.cleanup_disconnected(Duration::from_secs(3600)).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn label_change_survives_a_later_update_in_the_same_flush() {
    let store = setup(&[("A", "env=test")]).await;
    let mock = Arc::new(MockProtocol::with_connected(&["A"]));
    let slow = ManagerConfig { updates_interval: Duration::from_millis(200), ..Default::default() };
    let manager = Arc::new(Manager::new(store.clone(), slow));
    manager.add_protocol(mock.clone());
    let ctx = CancellationToken::new();
    let _handle = manager.start(ctx.clone()).await;

    store.apply_agent_labels("A", &labels("team=core"), false).await.unwrap();
    store.upsert_agent("A", |a| a.hostname = "h2".into()).await.unwrap();
    eventually(|| !mock.calls().is_empty()).await;

    let calls = mock.calls();
    assert_eq!(calls.len(), 1, "calls={:?}", calls);
    assert_eq!(calls[0].1.labels.as_ref().and_then(|l| l.get("team")), Some("core"));
    ctx.cancel();
}

fn revised(name: &str, selector: &str) -> Resource {
    let mut c = match configuration(name, selector) {
        Resource::Configuration(c) => c,
        _ => unreachable!(),
    };
    c.spec.raw = Some(format!("receivers: {{}} # {} v2", name));
    c.into()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_configurations_push_only_the_resolved_one() {
    let store = setup(&[("A", "env=prod"), ("B", "env=prod,configuration=pinned")]).await;
    store
        .apply(vec![configuration("a-cfg", "env=prod"), configuration("b-cfg", "env=prod"), configuration("pinned", "x=y")])
        .await
        .unwrap();
    let mock = Arc::new(MockProtocol::with_connected(&["A", "B"]));
    let manager = Arc::new(Manager::new(store.clone(), config()));
    manager.add_protocol(mock.clone());
    let ctx = CancellationToken::new();
    let _handle = manager.start(ctx.clone()).await;

    // A resolves to a-cfg by name order and B is pinned, so b-cfg reaches nobody.
    store.apply(vec![revised("b-cfg", "env=prod")]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(mock.calls().is_empty(), "calls={:?}", mock.calls());

    store.apply(vec![revised("a-cfg", "env=prod")]).await.unwrap();
    eventually(|| !mock.calls().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    let calls = mock.calls();
    assert_eq!(calls.len(), 1, "calls={:?}", calls);
    assert_eq!(calls[0].0, "A");
    assert_eq!(calls[0].1.configuration.as_ref().map(|c| c.name()), Some("a-cfg"));
    ctx.cancel();
}
