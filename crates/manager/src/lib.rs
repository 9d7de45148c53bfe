//! Fleet manager: turns store updates into per-agent pushes through the registered
//! protocol adapters.
//!
//! The manager subscribes to the store with the unbounded option so mutations never wait on
//! reconciliation. Each received batch (plus anything already queued behind it) is folded
//! into one `AgentUpdates` per agent and handed to a short-lived worker pool.

#![forbid(unsafe_code)]

pub mod protocol;
pub mod relayer;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_bus::SubscriptionOptions;
use fleet_core::{Agent, EventType, Result, Updates};
use fleet_store::ResourceStore;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

pub use protocol::{agent_updates, AgentUpdates, Protocol};
pub use relayer::{LiveTailConfigurer, LiveTailMessage, LiveTailSession, LiveTailSubscription, Relayer};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Upper bound on concurrent dispatch workers.
    pub max_workers: usize,
    /// Flush period of the manager's unbounded store subscription.
    pub updates_interval: Duration,
    pub cleanup_interval: Duration,
    /// Disconnected agents older than this are removed. `None` disables cleanup.
    pub cleanup_ttl: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            updates_interval: Duration::from_millis(100),
            cleanup_interval: Duration::from_secs(60),
            cleanup_ttl: None,
        }
    }
}

/// Workers used for `pending` per-agent updates.
pub fn worker_count(pending: usize, max_workers: usize) -> usize { (pending / 4 + 1).min(max_workers.max(1)) }

pub struct Manager {
    store: Arc<ResourceStore>,
    protocols: RwLock<Vec<Arc<dyn Protocol>>>,
    config: ManagerConfig,
}

impl Manager {
    pub fn new(store: Arc<ResourceStore>, config: ManagerConfig) -> Self {
        Self { store, protocols: RwLock::new(Vec::new()), config }
    }

    pub fn store(&self) -> &Arc<ResourceStore> { &self.store }

    pub fn add_protocol(&self, protocol: Arc<dyn Protocol>) {
        info!(protocol = protocol.name(), "protocol registered");
        self.protocols.write().push(protocol);
    }

    pub fn protocols(&self) -> Vec<Arc<dyn Protocol>> { self.protocols.read().clone() }

    /// True if any adapter holds a session for the agent.
    pub fn connected(&self, agent_id: &str) -> bool { self.protocols.read().iter().any(|p| p.connected(agent_id)) }

    pub async fn connected_agent_ids(&self, ctx: &CancellationToken) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for p in self.protocols() {
            ids.extend(p.connected_agent_ids(ctx).await?);
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Desired labels and configuration for `agent`.
    pub fn agent_updates(&self, agent: &Agent) -> Result<AgentUpdates> { agent_updates(&self.store, agent) }

    /// Subscribe to the store and reconcile until `ctx` is cancelled. Also starts the
    /// disconnected-agent cleanup loop when a TTL is configured.
    pub async fn start(self: &Arc<Self>, ctx: CancellationToken) -> JoinHandle<()> {
        let (mut stream, unsubscribe) = self
            .store
            .updates()
            .subscribe(Some(&ctx), SubscriptionOptions::unbounded(self.config.updates_interval))
            .await;
        if let Some(ttl) = self.config.cleanup_ttl {
            let this = Arc::clone(self);
            let ctx = ctx.clone();
            tokio::spawn(async move { this.cleanup_loop(ctx, ttl).await });
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            info!(max_workers = this.config.max_workers, "manager started");
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    next = stream.recv() => {
                        let Some(mut updates) = next else { break };
                        while let Some(more) = stream.try_recv() {
                            updates.merge(more);
                        }
                        this.handle_updates(&ctx, updates).await;
                    }
                }
            }
            unsubscribe.unsubscribe().await;
            info!("manager stopped");
        })
    }

    /// Work out which agents a batch touches and push to them.
    pub async fn handle_updates(&self, ctx: &CancellationToken, updates: Updates) {
        let protocols = self.protocols();
        let mut pending: BTreeMap<String, AgentUpdates> = BTreeMap::new();

        for (id, event) in updates.agents.iter() {
            match event.event_type {
                EventType::Remove => {
                    for p in protocols.iter() {
                        if p.disconnect(id).await {
                            debug!(agent_id = %id, protocol = p.name(), "removed agent disconnected");
                        }
                    }
                }
                EventType::Label if protocols.iter().any(|p| p.connected(id)) => {
                    pending.entry(id.clone()).or_default().merge(AgentUpdates::labels(event.item.labels.clone()));
                }
                _ => {}
            }
        }

        for (name, event) in updates.configurations.iter() {
            let ids = self.store.agents_ids_matching_configuration(&event.item);
            for id in ids.into_iter().filter(|id| protocols.iter().any(|p| p.connected(id))) {
                let agent = match self.store.agent(&id) {
                    Ok(Some(agent)) => agent,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(agent_id = %id, error = %e, "agent lookup failed");
                        continue;
                    }
                };
                let update = if event.event_type == EventType::Remove {
                    // The agent keeps running what it has; only its labels are refreshed.
                    AgentUpdates::labels(agent.labels)
                } else {
                    // Agents pinned or matched elsewhere keep the configuration they resolve to.
                    match self.store.configuration_for(&agent) {
                        Ok(Some(c)) if c.name() == name.as_str() => AgentUpdates::configuration(event.item.clone()),
                        Ok(resolved) => {
                            let resolved = resolved.map(|c| c.metadata.name);
                            debug!(agent_id = %id, configuration = %name, ?resolved, "agent runs another configuration");
                            continue;
                        }
                        Err(e) => {
                            warn!(agent_id = %id, error = %e, "configuration lookup failed");
                            continue;
                        }
                    }
                };
                debug!(agent_id = %id, configuration = %name, event = ?event.event_type, "agent queued");
                pending.entry(id).or_default().merge(update);
            }
        }

        self.dispatch(ctx, pending).await;
    }

    /// Push `pending` through a pool of `worker_count` workers and wait for all of them.
    pub async fn dispatch(&self, ctx: &CancellationToken, pending: BTreeMap<String, AgentUpdates>) {
        if pending.is_empty() {
            return;
        }
        let workers = worker_count(pending.len(), self.config.max_workers);
        gauge!("manager_workers", workers as f64);
        debug!(agents = pending.len(), workers, "dispatching agent updates");

        let (tx, rx) = mpsc::channel::<(String, AgentUpdates)>(workers * 2);
        let rx = Arc::new(Mutex::new(rx));
        let protocols = Arc::new(self.protocols());
        let mut set = JoinSet::new();
        for _ in 0..workers {
            let rx = Arc::clone(&rx);
            let store = Arc::clone(&self.store);
            let protocols = Arc::clone(&protocols);
            let ctx = ctx.clone();
            set.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some((id, updates)) = next else { break };
                    if ctx.is_cancelled() {
                        break;
                    }
                    update_agent(&ctx, &store, &protocols, &id, &updates).await;
                }
            });
        }
        for item in pending {
            if tx.send(item).await.is_err() {
                break;
            }
        }
        drop(tx);
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "dispatch worker panicked");
            }
        }
        gauge!("manager_workers", 0.0);
    }

    /// Remove agents disconnected for longer than `ttl`.
    pub async fn cleanup_disconnected(&self, ttl: Duration) -> Result<usize> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let removed = self.store.cleanup_disconnected_agents(Utc::now() - ttl).await?;
        Ok(removed.len())
    }

    async fn cleanup_loop(&self, ctx: CancellationToken, ttl: Duration) {
        let mut tick = tokio::time::interval(self.config.cleanup_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tick.tick() => {
                    match self.cleanup_disconnected(ttl).await {
                        Ok(0) => {}
                        Ok(n) => info!(removed = n, "cleanup removed disconnected agents"),
                        Err(e) => warn!(error = %e, "agent cleanup failed"),
                    }
                }
            }
        }
    }
}

async fn update_agent(
    ctx: &CancellationToken,
    store: &ResourceStore,
    protocols: &[Arc<dyn Protocol>],
    id: &str,
    updates: &AgentUpdates,
) {
    if updates.is_empty() {
        return;
    }
    let agent = match store.agent(id) {
        Ok(Some(agent)) => agent,
        Ok(None) => {
            debug!(agent_id = %id, "agent gone before dispatch");
            return;
        }
        Err(e) => {
            warn!(agent_id = %id, error = %e, "agent lookup failed");
            return;
        }
    };
    for p in protocols {
        let span = info_span!("update_agent", agent_id = %id, protocol = p.name());
        let res = p.update_agent(ctx, &agent, updates).instrument(span).await;
        counter!("manager_dispatch_total", 1u64, "protocol" => p.name());
        if let Err(e) = res {
            counter!("manager_dispatch_errors_total", 1u64, "protocol" => p.name());
            warn!(agent_id = %id, protocol = p.name(), error = %e, "agent update failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_scales_with_backlog() {
        assert_eq!(worker_count(1, 10), 1);
        assert_eq!(worker_count(4, 10), 2);
        assert_eq!(worker_count(11, 10), 3);
        assert_eq!(worker_count(1000, 10), 10);
        assert_eq!(worker_count(1000, 0), 1);
    }
}
