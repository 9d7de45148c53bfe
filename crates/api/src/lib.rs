//! Fleet public API façade (in-process).
//!
//! Frontends (the CLI, a REST layer) depend on [`FleetApi`] and [`ApiError`] only. The
//! in-process implementation calls the store and the apply crate directly.

#![forbid(unsafe_code)]

pub mod install;

use std::sync::Arc;
use std::time::Instant;

use fleet_apply::Planned;
use fleet_core::{Agent, Configuration, Dependency, Error, Kind, Labels, QueryOptions, Resource, ResourceStatus};
use fleet_search::Suggestion;
use fleet_store::ResourceStore;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use install::{install_command, InstallParams, Platform};

/// API errors with a stable HTTP mapping.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("in_use: {message}")]
    InUse { message: String, dependents: Vec<Dependency> },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("upgrade_required: {}", .0.join(", "))]
    UpgradeRequired(Vec<String>),
    #[error("internal: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InUse { .. } | ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Invalid(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::UpgradeRequired(_) => StatusCode::UPGRADE_REQUIRED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::ResourceMissing { .. } => ApiError::NotFound(e.to_string()),
            Error::ResourceInUse { ref dependents, .. } => {
                ApiError::InUse { dependents: dependents.clone(), message: e.to_string() }
            }
            Error::Invalid(m) => ApiError::Invalid(m),
            Error::Conflict(m) => ApiError::Conflict(m),
            Error::Unauthorized => ApiError::Unauthorized,
            Error::UpgradeRequired { supported } => ApiError::UpgradeRequired(supported),
            Error::Transport(m) | Error::Internal(m) => ApiError::Internal(m),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// One page of agents plus the unpaged total.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsPage {
    pub agents: Vec<Agent>,
    pub total: usize,
}

/// Outcome of a dry-run apply for one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanItem {
    pub kind: Kind,
    pub name: String,
    #[serde(flatten)]
    pub planned: Planned,
}

/// Which index a search runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchTarget {
    Agents,
    Configurations,
}

/// Declarative fleet API surface.
#[async_trait::async_trait]
pub trait FleetApi: Send + Sync {
    /// Apply every resource in a (multi-document) YAML payload.
    async fn apply(&self, yaml: &str) -> ApiResult<Vec<ResourceStatus>>;

    /// Parse and validate a payload and report what apply would do, without writing.
    async fn dry_run(&self, yaml: &str) -> ApiResult<Vec<PlanItem>>;

    /// Delete every resource named in a YAML payload. Unknown resources are skipped.
    async fn delete(&self, yaml: &str) -> ApiResult<Vec<ResourceStatus>>;

    /// Delete one resource by kind and name. Fails with `InUse` while referenced.
    async fn delete_resource(&self, kind: Kind, name: &str) -> ApiResult<ResourceStatus>;

    async fn get(&self, kind: Kind, name: &str) -> ApiResult<Resource>;

    async fn list(&self, kind: Kind, opts: &QueryOptions) -> ApiResult<Vec<Resource>>;

    async fn agents(&self, opts: &QueryOptions) -> ApiResult<AgentsPage>;

    async fn agent(&self, id: &str) -> ApiResult<Agent>;

    /// Configuration the agent should be running, if any.
    async fn agent_configuration(&self, id: &str) -> ApiResult<Option<Configuration>>;

    /// Merge user labels into an agent. Changing an existing value needs `overwrite`.
    async fn patch_agent_labels(&self, id: &str, labels: &Labels, overwrite: bool) -> ApiResult<Agent>;

    async fn delete_agents(&self, ids: &[String]) -> ApiResult<Vec<Agent>>;

    /// Ids matching `query`, ascending.
    async fn search(&self, target: SearchTarget, query: &str) -> ApiResult<Vec<String>>;

    async fn suggestions(&self, target: SearchTarget, query: &str) -> ApiResult<Vec<Suggestion>>;

    fn install_command(&self, params: &InstallParams) -> ApiResult<String>;
}

/// In-process implementation over a shared store.
pub struct InProcApi {
    store: Arc<ResourceStore>,
}

impl InProcApi {
    pub fn new(store: Arc<ResourceStore>) -> Self { Self { store } }

    pub fn store(&self) -> &Arc<ResourceStore> { &self.store }

    fn index(&self, target: SearchTarget) -> &fleet_search::SearchIndex {
        match target {
            SearchTarget::Agents => self.store.agent_index(),
            SearchTarget::Configurations => self.store.configuration_index(),
        }
    }
}

#[async_trait::async_trait]
impl FleetApi for InProcApi {
    async fn apply(&self, yaml: &str) -> ApiResult<Vec<ResourceStatus>> {
        let t0 = Instant::now();
        info!(bytes = yaml.len(), "api: apply start");
        let resources = fleet_apply::parse_resources(yaml)?;
        let statuses = self.store.apply(resources).await?;
        info!(count = statuses.len(), took_ms = %t0.elapsed().as_millis(), "api: apply ok");
        Ok(statuses)
    }

    async fn dry_run(&self, yaml: &str) -> ApiResult<Vec<PlanItem>> {
        let t0 = Instant::now();
        info!(bytes = yaml.len(), "api: dry_run start");
        let resources = fleet_apply::parse_resources(yaml)?;
        let plan = fleet_apply::plan(&self.store, &resources)?;
        let items: Vec<PlanItem> = plan
            .into_iter()
            .map(|(r, planned)| PlanItem { kind: r.kind(), name: r.name().to_string(), planned })
            .collect();
        info!(count = items.len(), took_ms = %t0.elapsed().as_millis(), "api: dry_run ok");
        Ok(items)
    }

    async fn delete(&self, yaml: &str) -> ApiResult<Vec<ResourceStatus>> {
        let t0 = Instant::now();
        info!(bytes = yaml.len(), "api: delete start");
        let resources = fleet_apply::parse_resources(yaml)?;
        let statuses = self.store.delete(resources).await?;
        info!(count = statuses.len(), took_ms = %t0.elapsed().as_millis(), "api: delete ok");
        Ok(statuses)
    }

    async fn delete_resource(&self, kind: Kind, name: &str) -> ApiResult<ResourceStatus> {
        info!(kind = %kind, name = %name, "api: delete_resource start");
        let resource = self.get(kind, name).await?;
        let mut statuses = self.store.delete(vec![resource]).await?;
        let Some(status) = statuses.pop() else {
            return Err(ApiError::NotFound(format!("{} '{}' not found", kind, name)));
        };
        if let fleet_core::UpdateStatus::InUse(message) = &status.status {
            warn!(kind = %kind, name = %name, "api: delete_resource blocked");
            return Err(ApiError::InUse { message: message.clone(), dependents: in_use_by(&self.store, kind, name) });
        }
        info!(kind = %kind, name = %name, status = %status.status.label(), "api: delete_resource ok");
        Ok(status)
    }

    async fn get(&self, kind: Kind, name: &str) -> ApiResult<Resource> {
        self.store
            .get(kind, name)?
            .ok_or_else(|| ApiError::NotFound(format!("{} '{}' not found", kind, name)))
    }

    async fn list(&self, kind: Kind, opts: &QueryOptions) -> ApiResult<Vec<Resource>> {
        let t0 = Instant::now();
        let items = self.store.list(kind, opts)?;
        info!(kind = %kind, count = items.len(), took_ms = %t0.elapsed().as_millis(), "api: list ok");
        Ok(items)
    }

    async fn agents(&self, opts: &QueryOptions) -> ApiResult<AgentsPage> {
        let t0 = Instant::now();
        let total = self.store.agents_count(opts)?;
        let agents = self.store.agents(opts)?;
        info!(count = agents.len(), total, took_ms = %t0.elapsed().as_millis(), "api: agents ok");
        Ok(AgentsPage { agents, total })
    }

    async fn agent(&self, id: &str) -> ApiResult<Agent> {
        self.store.agent(id)?.ok_or_else(|| ApiError::NotFound(format!("agent '{}' not found", id)))
    }

    async fn agent_configuration(&self, id: &str) -> ApiResult<Option<Configuration>> {
        let agent = self.agent(id).await?;
        Ok(self.store.configuration_for(&agent)?)
    }

    async fn patch_agent_labels(&self, id: &str, labels: &Labels, overwrite: bool) -> ApiResult<Agent> {
        info!(agent_id = %id, labels = %labels, overwrite, "api: patch_agent_labels start");
        let agent = self.store.apply_agent_labels(id, labels, overwrite).await.map_err(|e| {
            warn!(agent_id = %id, error = %e, "api: patch_agent_labels failed");
            ApiError::from(e)
        })?;
        info!(agent_id = %id, "api: patch_agent_labels ok");
        Ok(agent)
    }

    async fn delete_agents(&self, ids: &[String]) -> ApiResult<Vec<Agent>> {
        Ok(self.store.delete_agents(ids).await?)
    }

    async fn search(&self, target: SearchTarget, query: &str) -> ApiResult<Vec<String>> {
        let t0 = Instant::now();
        let ids = self.index(target).search(query);
        info!(?target, query = %query, hits = ids.len(), took_ms = %t0.elapsed().as_millis(), "api: search ok");
        Ok(ids)
    }

    async fn suggestions(&self, target: SearchTarget, query: &str) -> ApiResult<Vec<Suggestion>> {
        Ok(self.index(target).suggestions(query))
    }

    fn install_command(&self, params: &InstallParams) -> ApiResult<String> { install_command(params) }
}

/// Resources that refer to `(kind, name)`.
fn in_use_by(store: &ResourceStore, kind: Kind, name: &str) -> Vec<Dependency> {
    let target = Dependency { kind, name: name.to_string() };
    let mut out = Vec::new();
    for k in Kind::ALL.iter().copied().filter(|k| *k != Kind::Agent) {
        match store.list(k, &QueryOptions::default()) {
            Ok(items) => out.extend(items.iter().filter(|r| r.dependencies().contains(&target)).map(|r| r.reference())),
            Err(e) => warn!(kind = %k, error = %e, "listing dependents failed"),
        }
    }
    out.sort();
    out
}
