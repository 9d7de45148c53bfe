use std::sync::Arc;

use fleet_core::{AgentStatus, Kind, QueryOptions, Resource, ResourceTypeSpec, SourceType, UpdateStatus};
use fleet_persist::SqliteBackend;
use fleet_store::ResourceStore;

async fn open(path: &std::path::Path) -> ResourceStore {
    let backend = Arc::new(SqliteBackend::open(path).unwrap());
    ResourceStore::builder(backend).open().await.unwrap()
}

#[tokio::test]
async fn catalog_survives_restart_and_agents_come_back_disconnected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet.db");

    let id = {
        let store = open(&path).await;
        let out = store
            .apply(vec![Resource::source_type(SourceType::new("macos", ResourceTypeSpec::default()))])
            .await
            .unwrap();
        assert_eq!(out[0].status, UpdateStatus::Created);
        store.upsert_agent("a1", |a| a.connect()).await.unwrap();
        assert_eq!(store.agent("a1").unwrap().unwrap().status, AgentStatus::Connected);
        out[0].resource.id().to_string()
    };

    let store = open(&path).await;
    let macos = store.get(Kind::SourceType, "macos").unwrap().unwrap();
    assert_eq!(macos.id(), id);
    let agent = store.agent("a1").unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Disconnected);
    assert!(agent.disconnected_at.is_some());
    assert_eq!(store.agents_count(&QueryOptions::new()).unwrap(), 1);

    let again = store
        .apply(vec![Resource::source_type(SourceType::new("macos", ResourceTypeSpec::default()))])
        .await
        .unwrap();
    assert_eq!(again[0].status, UpdateStatus::Unchanged);
}
