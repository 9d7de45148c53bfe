//! Fleet store: resource catalog and agent registry with dependency-aware deletes,
//! transitive update propagation and an `Updates` stream.
//!
//! Every mutation runs under one write lock: validate, commit to the backend in a single
//! call, expand the batch, update the indices, emit. Emission happens before the lock is
//! released so subscribers observe batches in commit order; a full bounded subscriber
//! therefore stalls writers.

#![forbid(unsafe_code)]

pub mod backend;
pub mod broker;
mod propagate;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use fleet_bus::Source;
use fleet_core::labels::CONFIGURATION_LABEL;
use fleet_core::{
    Agent, AgentStatus, Configuration, Dependency, Error, EventType, Kind, Labels, QueryOptions, Resource,
    ResourceStatus, Result, UpdateStatus, Updates,
};
use fleet_search::{SearchIndex, VersionProvider};
use rustc_hash::FxHashSet;
use serde_json::Value as Json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use backend::{Backend, MemoryBackend, Op};
pub use broker::{Broker, LocalBroker};

/// Builder for [`ResourceStore`].
pub struct StoreBuilder {
    backend: Arc<dyn Backend>,
    broker: Option<(Arc<dyn Broker>, CancellationToken)>,
    versions: Option<Arc<dyn VersionProvider>>,
}

impl StoreBuilder {
    /// Publish batches through `broker` instead of emitting locally. The receive task
    /// stops when `ctx` is cancelled.
    pub fn broker(mut self, broker: Arc<dyn Broker>, ctx: CancellationToken) -> Self {
        self.broker = Some((broker, ctx));
        self
    }

    /// Provider for `version:latest` in agent queries.
    pub fn version_provider(mut self, provider: Arc<dyn VersionProvider>) -> Self {
        self.versions = Some(provider);
        self
    }

    /// Load the backend, mark surviving agents disconnected and build the indices.
    pub async fn open(self) -> Result<ResourceStore> {
        let mut agents = SearchIndex::new("agents");
        if let Some(p) = self.versions {
            agents = agents.with_version_provider(p);
        }
        let store = ResourceStore {
            backend: self.backend,
            write: Mutex::new(()),
            agents: Arc::new(agents),
            configurations: Arc::new(SearchIndex::new("configurations")),
            updates: Source::named("store"),
            broker: None,
        };
        store.restore()?;

        let Some((broker, ctx)) = self.broker else { return Ok(store) };
        let mut stream = broker.subscribe(&ctx).await?;
        let agents = Arc::clone(&store.agents);
        let configurations = Arc::clone(&store.configurations);
        let updates = store.updates.clone();
        tokio::spawn(async move {
            while let Some(batch) = stream.recv().await {
                index_batch(&agents, &configurations, &batch);
                updates.send(batch).await;
            }
            debug!("broker stream closed");
        });
        Ok(ResourceStore { broker: Some(broker), ..store })
    }
}

pub struct ResourceStore {
    backend: Arc<dyn Backend>,
    write: Mutex<()>,
    agents: Arc<SearchIndex>,
    configurations: Arc<SearchIndex>,
    updates: Source<Updates>,
    broker: Option<Arc<dyn Broker>>,
}

fn decode_resource(kind: Kind, key: &str, value: Json) -> Option<Resource> {
    match serde_json::from_value::<Resource>(value) {
        Ok(r) if r.kind() == kind => Some(r),
        Ok(r) => {
            warn!(%kind, key, found = %r.kind(), "record kind mismatch; skipped");
            None
        }
        Err(e) => {
            warn!(%kind, key, error = %e, "malformed record; skipped");
            None
        }
    }
}

fn decode_agent(key: &str, value: Json) -> Option<Agent> {
    match serde_json::from_value::<Agent>(value) {
        Ok(a) => Some(a),
        Err(e) => {
            warn!(agent_id = key, error = %e, "malformed agent record; skipped");
            None
        }
    }
}

fn put_agent(agent: &Agent) -> Result<Op> {
    Ok(Op::Put { kind: Kind::Agent, key: agent.id.clone(), value: serde_json::to_value(agent)? })
}

fn index_batch(agents: &SearchIndex, configurations: &SearchIndex, updates: &Updates) {
    for (id, e) in updates.agents.iter() {
        if e.event_type == EventType::Remove {
            agents.remove(id);
        } else {
            agents.upsert(&e.item);
        }
    }
    for (name, e) in updates.configurations.iter() {
        if e.event_type == EventType::Remove {
            configurations.remove(name);
        } else {
            configurations.upsert(&e.item);
        }
    }
}

fn is_written(status: &UpdateStatus) -> bool {
    matches!(status, UpdateStatus::Created | UpdateStatus::Configured | UpdateStatus::Deleted)
}

/// Configuration-index field naming references to a resource of `kind`.
fn reference_field(kind: Kind) -> Option<&'static str> {
    match kind {
        Kind::Source => Some("source"),
        Kind::SourceType => Some("sourceType"),
        Kind::Processor => Some("processor"),
        Kind::ProcessorType => Some("processorType"),
        Kind::Destination => Some("destination"),
        Kind::DestinationType => Some("destinationType"),
        Kind::Agent | Kind::Configuration => None,
    }
}

impl ResourceStore {
    pub fn builder(backend: Arc<dyn Backend>) -> StoreBuilder { StoreBuilder { backend, broker: None, versions: None } }

    /// In-memory store with no broker.
    pub async fn in_memory() -> Result<Self> { Self::builder(Arc::new(MemoryBackend::new())).open().await }

    fn restore(&self) -> Result<()> {
        let mut ops = Vec::new();
        for (key, value) in self.backend.list(Kind::Agent)? {
            let Some(mut agent) = decode_agent(&key, value) else { continue };
            if agent.status != AgentStatus::Disconnected {
                agent.disconnect();
                ops.push(put_agent(&agent)?);
            }
            self.agents.upsert(&agent);
        }
        if !ops.is_empty() {
            self.backend.commit(&ops)?;
            info!(count = ops.len(), "agents marked disconnected on startup");
        }
        for r in self.resources(Kind::Configuration)? {
            if let Resource::Configuration(c) = r {
                self.configurations.upsert(&c);
            }
        }
        info!(backend = self.backend.name(), agents = self.agents.len(), configurations = self.configurations.len(), "store opened");
        Ok(())
    }

    fn commit(&self, ops: &[Op]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.backend.commit(ops)
    }

    async fn emit(&self, updates: Updates) {
        if updates.is_empty() {
            return;
        }
        metrics::counter!("store_updates_emitted_total", 1u64);
        match &self.broker {
            Some(broker) => {
                if let Err(e) = broker.publish(updates).await {
                    warn!(error = %e, "publishing updates to broker failed");
                }
            }
            None => {
                index_batch(&self.agents, &self.configurations, &updates);
                self.updates.send(updates).await;
            }
        }
    }

    /// Every decodable resource of `kind`, ordered by name.
    pub(crate) fn resources(&self, kind: Kind) -> Result<Vec<Resource>> {
        Ok(self.backend.list(kind)?.into_iter().filter_map(|(k, v)| decode_resource(kind, &k, v)).collect())
    }

    fn all_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.backend.list(Kind::Agent)?.into_iter().filter_map(|(k, v)| decode_agent(&k, v)).collect())
    }

    fn missing_dependencies(&self, resource: &Resource, pending: &FxHashSet<(Kind, String)>) -> Result<Vec<Dependency>> {
        let mut missing = Vec::new();
        for dep in resource.dependencies() {
            if pending.contains(&(dep.kind, dep.name.clone())) {
                continue;
            }
            if self.backend.get(dep.kind, &dep.name)?.is_none() {
                missing.push(dep);
            }
        }
        Ok(missing)
    }

    /// Resources that refer to `resource`, excluding those in `removed`.
    fn dependents(&self, resource: &Resource, removed: &FxHashSet<(Kind, String)>) -> Result<Vec<Dependency>> {
        let name = resource.name();
        let mut out: Vec<Dependency> = Vec::new();
        if let Some(field) = reference_field(resource.kind()) {
            // The index folds case; confirm each hit against the stored references.
            let wanted = resource.reference();
            for c in self.configurations.field(field, name) {
                let Some(cfg) = self.configuration(&c)? else { continue };
                if Resource::Configuration(cfg).dependencies().contains(&wanted) {
                    out.push(Dependency { kind: Kind::Configuration, name: c });
                }
            }
        }
        let scan = |kind: Kind, refers: &dyn Fn(&Resource) -> bool| -> Result<Vec<Dependency>> {
            Ok(self.resources(kind)?.iter().filter(|r| refers(r)).map(|r| r.reference()).collect())
        };
        match resource.kind() {
            Kind::SourceType => {
                out.extend(scan(Kind::Source, &|r| matches!(r, Resource::Source(s) if s.spec.kind == name))?)
            }
            Kind::DestinationType => out
                .extend(scan(Kind::Destination, &|r| matches!(r, Resource::Destination(d) if d.spec.kind == name))?),
            Kind::ProcessorType => {
                out.extend(scan(Kind::Processor, &|r| matches!(r, Resource::Processor(p) if p.spec.kind == name))?);
                out.extend(scan(Kind::Source, &|r| {
                    matches!(r, Resource::Source(s) if s.processor_types().any(|t| t == name))
                })?);
            }
            Kind::Processor => out.extend(scan(Kind::Source, &|r| {
                matches!(r, Resource::Source(s) if s.processor_names().any(|n| n == name))
            })?),
            _ => {}
        }
        out.retain(|d| !removed.contains(&(d.kind, d.name.clone())));
        out.sort();
        out.dedup();
        Ok(out)
    }

    /// Validate and write each resource. Types are applied before the resources that
    /// use them, so statuses come back in dependency order.
    pub async fn apply(&self, resources: Vec<Resource>) -> Result<Vec<ResourceStatus>> {
        let _guard = self.write.lock().await;
        let started = Instant::now();
        let mut ordered = resources;
        ordered.sort_by_key(|r| std::cmp::Reverse(r.kind().delete_rank()));

        let mut statuses: Vec<ResourceStatus> = Vec::with_capacity(ordered.len());
        let mut ops = Vec::new();
        let mut updates = Updates::new();
        let mut pending: FxHashSet<(Kind, String)> = FxHashSet::default();
        let mut written: Vec<Resource> = Vec::new();

        for mut resource in ordered {
            if let Err(reason) = resource.validate() {
                statuses.push(ResourceStatus::new(resource, UpdateStatus::Invalid(reason)));
                continue;
            }
            match self.missing_dependencies(&resource, &pending) {
                Ok(missing) if !missing.is_empty() => {
                    let list: Vec<String> = missing.iter().map(|d| d.to_string()).collect();
                    let reason = format!("missing {}", list.join(", "));
                    statuses.push(ResourceStatus::new(resource, UpdateStatus::Invalid(reason)));
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    statuses.push(ResourceStatus::new(resource, UpdateStatus::Error(e.to_string())));
                    continue;
                }
            }

            let (kind, name) = (resource.kind(), resource.name().to_string());
            let current = match written.iter().rev().find(|r| r.kind() == kind && r.name() == name) {
                Some(r) => Some(r.clone()),
                None => match self.get(kind, &name) {
                    Ok(r) => r,
                    Err(e) => {
                        statuses.push(ResourceStatus::new(resource, UpdateStatus::Error(e.to_string())));
                        continue;
                    }
                },
            };
            let (status, event_type) = match current {
                Some(cur) => {
                    resource.metadata_mut().id = cur.id().to_string();
                    match resource.same_as(&cur) {
                        Ok(true) => (UpdateStatus::Unchanged, None),
                        Ok(false) => (UpdateStatus::Configured, Some(EventType::Update)),
                        Err(e) => (UpdateStatus::Error(e.to_string()), None),
                    }
                }
                None => {
                    resource.metadata_mut().id = uuid::Uuid::new_v4().to_string();
                    (UpdateStatus::Created, Some(EventType::Insert))
                }
            };
            if let Some(event_type) = event_type {
                match serde_json::to_value(&resource) {
                    Ok(value) => {
                        ops.push(Op::Put { kind, key: name.clone(), value });
                        updates.include_resource(resource.clone(), event_type);
                        pending.insert((kind, name));
                        written.push(resource.clone());
                    }
                    Err(e) => {
                        statuses.push(ResourceStatus::new(resource, UpdateStatus::Error(e.to_string())));
                        continue;
                    }
                }
            }
            statuses.push(ResourceStatus::new(resource, status));
        }

        if let Err(e) = self.commit(&ops) {
            warn!(error = %e, "apply commit failed");
            for s in statuses.iter_mut().filter(|s| is_written(&s.status)) {
                s.status = UpdateStatus::Error(e.to_string());
            }
            updates = Updates::new();
        }
        if let Err(e) = self.expand(&mut updates) {
            warn!(error = %e, "update propagation failed; emitting primary changes only");
        }
        for s in statuses.iter() {
            metrics::counter!("store_apply_total", 1u64, "status" => s.status.label());
        }
        metrics::histogram!("store_apply_ms", started.elapsed().as_secs_f64() * 1_000.0);
        info!(resources = statuses.len(), changed = ops.len(), "apply");
        self.emit(updates).await;
        Ok(statuses)
    }

    /// Remove each resource unless something still refers to it. Missing resources are
    /// left out of the result.
    pub async fn delete(&self, resources: Vec<Resource>) -> Result<Vec<ResourceStatus>> {
        let _guard = self.write.lock().await;
        let mut ordered = resources;
        ordered.sort_by_key(|r| r.kind().delete_rank());

        let mut statuses = Vec::with_capacity(ordered.len());
        let mut ops = Vec::new();
        let mut updates = Updates::new();
        let mut removed: FxHashSet<(Kind, String)> = FxHashSet::default();

        for resource in ordered {
            let (kind, name) = (resource.kind(), resource.name().to_string());
            if removed.contains(&(kind, name.clone())) {
                continue;
            }
            let existing = match self.get(kind, &name) {
                Ok(Some(r)) => r,
                Ok(None) => continue,
                Err(e) => {
                    statuses.push(ResourceStatus::new(resource, UpdateStatus::Error(e.to_string())));
                    continue;
                }
            };
            let dependents = match self.dependents(&existing, &removed) {
                Ok(d) => d,
                Err(e) => {
                    statuses.push(ResourceStatus::new(existing, UpdateStatus::Error(e.to_string())));
                    continue;
                }
            };
            if !dependents.is_empty() {
                let err = Error::ResourceInUse { kind, name, dependents };
                statuses.push(ResourceStatus::new(existing, UpdateStatus::InUse(err.to_string())));
                continue;
            }
            ops.push(Op::Delete { kind, key: name.clone() });
            updates.include_resource(existing.clone(), EventType::Remove);
            removed.insert((kind, name));
            statuses.push(ResourceStatus::new(existing, UpdateStatus::Deleted));
        }

        if let Err(e) = self.commit(&ops) {
            warn!(error = %e, "delete commit failed");
            for s in statuses.iter_mut().filter(|s| is_written(&s.status)) {
                s.status = UpdateStatus::Error(e.to_string());
            }
            updates = Updates::new();
        }
        if let Err(e) = self.expand(&mut updates) {
            warn!(error = %e, "update propagation failed; emitting primary changes only");
        }
        for s in statuses.iter() {
            metrics::counter!("store_delete_total", 1u64, "status" => s.status.label());
        }
        info!(resources = statuses.len(), deleted = ops.len(), "delete");
        self.emit(updates).await;
        Ok(statuses)
    }

    pub fn get(&self, kind: Kind, name: &str) -> Result<Option<Resource>> {
        if kind == Kind::Agent {
            return Err(Error::Invalid("agents are not catalog resources".into()));
        }
        Ok(self.backend.get(kind, name)?.and_then(|v| decode_resource(kind, name, v)))
    }

    fn filtered(&self, kind: Kind, opts: &QueryOptions) -> Result<Vec<Resource>> {
        if kind == Kind::Agent {
            return Err(Error::Invalid("agents are not catalog resources".into()));
        }
        let (field, desc) = opts.sort_key("name");
        if field != "name" {
            return Err(Error::Invalid(format!("{} cannot be sorted by {}", kind, field)));
        }
        let mut items = self.resources(kind)?;
        if let Some(sel) = &opts.selector {
            items.retain(|r| sel.matches(r.labels()));
        }
        if let Some(q) = opts.query.as_deref().filter(|q| !q.trim().is_empty()) {
            let hits: FxHashSet<String> = if kind == Kind::Configuration {
                self.configurations.search(q).into_iter().collect()
            } else {
                let scratch = SearchIndex::new("scratch");
                for r in items.iter() {
                    scratch.upsert(r);
                }
                scratch.search(q).into_iter().collect()
            };
            items.retain(|r| hits.contains(r.name()));
        }
        items.sort_by(|a, b| a.name().cmp(b.name()));
        if desc {
            items.reverse();
        }
        Ok(items)
    }

    pub fn list(&self, kind: Kind, opts: &QueryOptions) -> Result<Vec<Resource>> {
        Ok(opts.page(self.filtered(kind, opts)?))
    }

    pub fn count(&self, kind: Kind, opts: &QueryOptions) -> Result<usize> { Ok(self.filtered(kind, opts)?.len()) }

    pub fn configuration(&self, name: &str) -> Result<Option<Configuration>> {
        Ok(match self.get(Kind::Configuration, name)? {
            Some(Resource::Configuration(c)) => Some(c),
            _ => None,
        })
    }

    // ----------------- Agents -----------------

    pub fn agent(&self, id: &str) -> Result<Option<Agent>> {
        Ok(self.backend.get(Kind::Agent, id)?.and_then(|v| decode_agent(id, v)))
    }

    fn filtered_agents(&self, opts: &QueryOptions) -> Result<Vec<Agent>> {
        let (field, desc) = opts.sort_key("name");
        if field != "name" && field != "id" {
            return Err(Error::Invalid(format!("agents cannot be sorted by {}", field)));
        }
        let mut agents = self.all_agents()?;
        if let Some(sel) = &opts.selector {
            agents.retain(|a| sel.matches(&a.labels));
        }
        if let Some(q) = opts.query.as_deref().filter(|q| !q.trim().is_empty()) {
            let hits: FxHashSet<String> = self.agents.search(q).into_iter().collect();
            agents.retain(|a| hits.contains(&a.id));
        }
        if field == "id" {
            agents.sort_by(|a, b| a.id.cmp(&b.id));
        } else {
            agents.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        }
        if desc {
            agents.reverse();
        }
        Ok(agents)
    }

    pub fn agents(&self, opts: &QueryOptions) -> Result<Vec<Agent>> { Ok(opts.page(self.filtered_agents(opts)?)) }

    pub fn agents_count(&self, opts: &QueryOptions) -> Result<usize> { Ok(self.filtered_agents(opts)?.len()) }

    /// Read-modify-write of one agent; `ops` and `updates` collect the change, if any.
    fn upsert_agent_locked<F>(&self, id: &str, updater: F, ops: &mut Vec<Op>, updates: &mut Updates) -> Result<Agent>
    where
        F: FnOnce(&mut Agent),
    {
        let current = self.agent(id)?;
        let mut agent = current.clone().unwrap_or_else(|| Agent::new(id));
        let labels_before = agent.labels.to_string();
        updater(&mut agent);
        agent.id = id.to_string();
        agent.ensure_reserved_labels();
        if current.as_ref() == Some(&agent) {
            return Ok(agent);
        }
        let event_type = if current.is_none() {
            EventType::Insert
        } else if labels_before != agent.labels.to_string() {
            EventType::Label
        } else {
            EventType::Update
        };
        ops.push(put_agent(&agent)?);
        updates.include_agent(agent.clone(), event_type);
        Ok(agent)
    }

    /// Create or update the agent `id` with `updater`. An update that changes nothing
    /// writes and emits nothing.
    pub async fn upsert_agent<F>(&self, id: &str, updater: F) -> Result<Agent>
    where
        F: FnOnce(&mut Agent) + Send,
    {
        let _guard = self.write.lock().await;
        let mut ops = Vec::new();
        let mut updates = Updates::new();
        let agent = self.upsert_agent_locked(id, updater, &mut ops, &mut updates)?;
        self.commit(&ops)?;
        self.emit(updates).await;
        Ok(agent)
    }

    pub async fn upsert_agents<F>(&self, ids: &[String], mut updater: F) -> Result<Vec<Agent>>
    where
        F: FnMut(&mut Agent) + Send,
    {
        let _guard = self.write.lock().await;
        let mut ops = Vec::new();
        let mut updates = Updates::new();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.upsert_agent_locked(id, &mut updater, &mut ops, &mut updates)?);
        }
        self.commit(&ops)?;
        self.emit(updates).await;
        Ok(out)
    }

    /// Merge user labels into the agent. Without `overwrite`, changing the value of an
    /// existing key fails with `Conflict` and nothing is written.
    pub async fn apply_agent_labels(&self, id: &str, labels: &Labels, overwrite: bool) -> Result<Agent> {
        if let Some((k, _)) = labels.iter().find(|(k, _)| fleet_core::labels::is_reserved(k)) {
            return Err(Error::Invalid(format!("label '{}' is reserved", k)));
        }
        labels.validate()?;
        let _guard = self.write.lock().await;
        let Some(current) = self.agent(id)? else {
            return Err(Error::ResourceMissing { kind: Kind::Agent, name: id.to_string() });
        };
        if !overwrite && current.labels.conflicts(labels) {
            let keys = current.labels.conflicting_keys(labels).join(", ");
            return Err(Error::Conflict(format!("labels {} already set on agent {}", keys, id)));
        }
        let next = current.labels.custom().merged(labels);
        let mut ops = Vec::new();
        let mut updates = Updates::new();
        let agent = self.upsert_agent_locked(id, |a| a.set_custom_labels(&next), &mut ops, &mut updates)?;
        self.commit(&ops)?;
        self.emit(updates).await;
        Ok(agent)
    }

    fn delete_agents_locked(&self, ids: &[String]) -> Result<(Vec<Agent>, Vec<Op>, Updates)> {
        let mut out = Vec::new();
        let mut ops = Vec::new();
        let mut updates = Updates::new();
        for id in ids {
            let Some(mut agent) = self.agent(id)? else { continue };
            agent.status = AgentStatus::Deleted;
            ops.push(Op::Delete { kind: Kind::Agent, key: id.clone() });
            updates.include_agent(agent.clone(), EventType::Remove);
            out.push(agent);
        }
        Ok((out, ops, updates))
    }

    /// Remove agents; the returned copies carry status `Deleted`.
    pub async fn delete_agents(&self, ids: &[String]) -> Result<Vec<Agent>> {
        let _guard = self.write.lock().await;
        let (out, ops, updates) = self.delete_agents_locked(ids)?;
        self.commit(&ops)?;
        info!(count = out.len(), "agents deleted");
        self.emit(updates).await;
        Ok(out)
    }

    /// Remove agents disconnected before `since`.
    pub async fn cleanup_disconnected_agents(&self, since: DateTime<Utc>) -> Result<Vec<Agent>> {
        let _guard = self.write.lock().await;
        let ids: Vec<String> = self
            .all_agents()?
            .into_iter()
            .filter(|a| !a.is_connected() && a.disconnected_at.map(|t| t < since).unwrap_or(false))
            .map(|a| a.id)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let (out, ops, updates) = self.delete_agents_locked(&ids)?;
        self.commit(&ops)?;
        info!(count = out.len(), %since, "disconnected agents cleaned up");
        self.emit(updates).await;
        Ok(out)
    }

    /// Configuration the agent should run: the one named by its `configuration` label,
    /// otherwise the first by name whose selector matches.
    pub fn agent_configuration(&self, agent_id: &str) -> Result<Option<Configuration>> {
        let Some(agent) = self.agent(agent_id)? else { return Ok(None) };
        self.configuration_for(&agent)
    }

    pub fn configuration_for(&self, agent: &Agent) -> Result<Option<Configuration>> {
        if let Some(name) = agent.configuration_name() {
            return self.configuration(name);
        }
        for r in self.resources(Kind::Configuration)? {
            if let Resource::Configuration(c) = r {
                if c.matches(&agent.labels) {
                    return Ok(Some(c));
                }
            }
        }
        Ok(None)
    }

    /// Ids of agents that run `cfg`: pinned through the `configuration` label, or matched
    /// by its selector and not pinned elsewhere.
    pub fn agents_ids_matching_configuration(&self, cfg: &Configuration) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        let selector = &cfg.spec.selector.match_labels;
        if !selector.is_empty() {
            let pinned: FxHashSet<String> = self.agents.labeled(CONFIGURATION_LABEL).into_iter().collect();
            ids.extend(self.agents.select(selector).into_iter().filter(|id| !pinned.contains(id)));
        }
        let mut by_label = Labels::new();
        by_label.insert(CONFIGURATION_LABEL, cfg.name());
        ids.extend(self.agents.select(&by_label));
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn updates(&self) -> &Source<Updates> { &self.updates }
    pub fn agent_index(&self) -> &Arc<SearchIndex> { &self.agents }
    pub fn configuration_index(&self) -> &Arc<SearchIndex> { &self.configurations }
}
