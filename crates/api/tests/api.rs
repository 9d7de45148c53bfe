use std::sync::Arc;

use fleet_api::{ApiError, FleetApi, InProcApi, SearchTarget};
use fleet_apply::Planned;
use fleet_core::{Kind, Labels, QueryOptions, UpdateStatus};
use fleet_store::ResourceStore;

const CATALOG: &str = r#"
apiVersion: bindplane.observiq.com/v1
kind: SourceType
metadata:
  name: macos
spec:
  parameters:
    - name: collection_interval
      type: int
      default: 30
---
apiVersion: bindplane.observiq.com/v1
kind: Source
metadata:
  name: s1
spec:
  type: macos
  parameters:
    - name: collection_interval
      value: 60
"#;

const EDGE: &str = r#"
kind: Configuration
metadata:
  name: edge
spec:
  raw: "receivers: {}"
  selector:
    matchLabels:
      env: test
      app: bp
"#;

async fn api() -> InProcApi { InProcApi::new(Arc::new(ResourceStore::in_memory().await.unwrap())) }

fn labels(s: &str) -> Labels { s.parse().unwrap() }

#[tokio::test]
async fn seed_then_query_and_guarded_delete() {
    let api = api().await;
    let out = api.apply(CATALOG).await.unwrap();
    assert!(out.iter().all(|s| s.status == UpdateStatus::Created), "{:?}", out);

    let sources = api.list(Kind::Source, &QueryOptions::default()).await.unwrap();
    assert_eq!(sources.iter().map(|r| r.name()).collect::<Vec<_>>(), vec!["s1"]);

    let err = api.delete_resource(Kind::SourceType, "macos").await.unwrap_err();
    assert_eq!(err.status().as_u16(), 409);
    match err {
        ApiError::InUse { dependents, .. } => {
            assert_eq!(dependents.len(), 1);
            assert_eq!(dependents[0].kind, Kind::Source);
            assert_eq!(dependents[0].name, "s1");
        }
        other => panic!("expected InUse, got {:?}", other),
    }
    assert!(api.get(Kind::SourceType, "macos").await.is_ok());

    assert_eq!(api.delete_resource(Kind::Source, "s1").await.unwrap().status, UpdateStatus::Deleted);
    assert_eq!(api.delete_resource(Kind::SourceType, "macos").await.unwrap().status, UpdateStatus::Deleted);
    let missing = api.get(Kind::SourceType, "macos").await.unwrap_err();
    assert_eq!(missing.status().as_u16(), 404);
}

#[tokio::test]
async fn dry_run_never_writes() {
    let api = api().await;
    let plan = api.dry_run(CATALOG).await.unwrap();
    assert_eq!(plan.len(), 2);
    assert!(plan.iter().all(|p| p.planned == Planned::Create));
    assert!(api.list(Kind::SourceType, &QueryOptions::default()).await.unwrap().is_empty());

    let err = api.dry_run("kind: Agent\nmetadata:\n  name: a\n").await.unwrap_err();
    assert_eq!(err.status().as_u16(), 400);
}

#[tokio::test]
async fn agent_configuration_follows_selector() {
    let api = api().await;
    let store = api.store().clone();
    let (a, b) = (labels("env=test,app=bp"), labels("foo=bar"));
    store.upsert_agent("A", |ag| ag.set_custom_labels(&a)).await.unwrap();
    store.upsert_agent("B", |ag| ag.set_custom_labels(&b)).await.unwrap();
    api.apply(EDGE).await.unwrap();

    let cfg = api.agent_configuration("A").await.unwrap().unwrap();
    assert_eq!(cfg.metadata.name, "edge");
    assert!(api.agent_configuration("B").await.unwrap().is_none());
    assert_eq!(api.agent_configuration("nobody").await.unwrap_err().status().as_u16(), 404);
}

#[tokio::test]
async fn label_patch_detects_conflicts() {
    let api = api().await;
    let l = labels("env=test");
    api.store().upsert_agent("a1", |a| a.set_custom_labels(&l)).await.unwrap();

    let err = api.patch_agent_labels("a1", &labels("env=prod"), false).await.unwrap_err();
    assert!(matches!(err, ApiError::Conflict(_)), "{:?}", err);
    assert_eq!(err.status().as_u16(), 409);
    assert_eq!(api.agent("a1").await.unwrap().labels.get("env"), Some("test"));

    let agent = api.patch_agent_labels("a1", &labels("team=core"), false).await.unwrap();
    assert_eq!(agent.labels.get("team"), Some("core"));

    let agent = api.patch_agent_labels("a1", &labels("env=prod"), true).await.unwrap();
    assert_eq!(agent.labels.get("env"), Some("prod"));
    assert_eq!(agent.labels.get("team"), Some("core"));

    let err = api.patch_agent_labels("a1", &labels("bindplane/agent-id=evil"), true).await.unwrap_err();
    assert_eq!(err.status().as_u16(), 400);
    let err = api.patch_agent_labels("ghost", &labels("env=prod"), true).await.unwrap_err();
    assert_eq!(err.status().as_u16(), 404);
}

#[tokio::test]
async fn agents_page_and_search() {
    let api = api().await;
    for (id, name) in [("a1", "edge-1"), ("a2", "edge-2"), ("a3", "core-1")] {
        api.store().upsert_agent(id, |a| a.name = name.to_string()).await.unwrap();
    }
    let page = api.agents(&QueryOptions::new().with_limit(2)).await.unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.agents.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(), vec!["a3", "a1"]);

    assert_eq!(api.search(SearchTarget::Agents, "name:edge-2").await.unwrap(), vec!["a2"]);
    let removed = api.delete_agents(&["a3".to_string()]).await.unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(api.agents(&QueryOptions::default()).await.unwrap().total, 2);
}
