use std::sync::Arc;
use std::time::Duration;

use fleet_bus::SubscriptionOptions;
use fleet_core::{AgentSelector, Configuration, ConfigurationSpec, Resource, ResourceTypeSpec, SourceType};
use fleet_store::{Backend, LocalBroker, MemoryBackend, ResourceStore};
use tokio_util::sync::CancellationToken;

async fn node(backend: Arc<MemoryBackend>, broker: Arc<LocalBroker>, ctx: &CancellationToken) -> ResourceStore {
    let backend: Arc<dyn Backend> = backend;
    ResourceStore::builder(backend).broker(broker, ctx.clone()).open().await.unwrap()
}

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
async fn peers_receive_batches_and_update_indices() {
    let backend = Arc::new(MemoryBackend::new());
    let broker = Arc::new(LocalBroker::new(Duration::from_millis(2)));
    let ctx = CancellationToken::new();
    let a = node(backend.clone(), broker.clone(), &ctx).await;
    let b = node(backend.clone(), broker.clone(), &ctx).await;
    assert_eq!(broker.nodes(), 2);

    let (mut on_b, _u) = b.updates().subscribe(None, SubscriptionOptions::unbounded(Duration::from_millis(2))).await;
    let (mut on_a, _u) = a.updates().subscribe(None, SubscriptionOptions::unbounded(Duration::from_millis(2))).await;

    a.apply(vec![Resource::source_type(SourceType::new("macos", ResourceTypeSpec::default()))]).await.unwrap();
    let batch = tokio::time::timeout(Duration::from_secs(1), on_b.recv()).await.unwrap().unwrap();
    assert!(batch.source_types.contains_key("macos"));
    let own = tokio::time::timeout(Duration::from_secs(1), on_a.recv()).await.unwrap().unwrap();
    assert!(own.source_types.contains_key("macos"));

    let cfg = Configuration::new(
        "c1",
        ConfigurationSpec {
            selector: AgentSelector { match_labels: "env=test".parse().unwrap() },
            ..Default::default()
        },
    );
    a.apply(vec![cfg.into()]).await.unwrap();
    eventually(|| b.configuration_index().contains("c1")).await;
    eventually(|| a.configuration_index().contains("c1")).await;

    b.upsert_agent("agent-1", |ag| ag.labels = "env=test".parse().unwrap()).await.unwrap();
    eventually(|| a.agent_index().contains("agent-1")).await;
    let c1 = a.configuration("c1").unwrap().unwrap();
    assert_eq!(a.agents_ids_matching_configuration(&c1), vec!["agent-1"]);

    ctx.cancel();
    eventually(|| broker.nodes() == 0).await;
}
