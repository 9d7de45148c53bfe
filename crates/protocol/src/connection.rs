//! Live agent sessions and the connection <-> agent table.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{Error, Result};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;

use crate::messages::ServerToAgent;

/// One agent session as seen by the protocol adapter. Implemented by the transport.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Identifier unique among live connections.
    fn id(&self) -> u64;

    fn remote_addr(&self) -> String { String::new() }

    async fn send(&self, message: &ServerToAgent) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

struct Entry {
    agent_id: String,
    connection: Arc<dyn Connection>,
    send: Arc<Mutex<()>>,
}

/// Bidirectional map between connections and agent ids. Every connection carries a send
/// mutex so frames to one socket never interleave.
#[derive(Default)]
pub struct ConnectionTable {
    inner: RwLock<Tables>,
}

#[derive(Default)]
struct Tables {
    by_connection: FxHashMap<u64, Entry>,
    by_agent: FxHashMap<String, u64>,
}

impl ConnectionTable {
    pub fn new() -> Self { Self::default() }

    /// Bind `connection` to `agent_id`. Returns true when the binding is new. A previous
    /// connection of the same agent is unbound and returned so the caller can close it.
    pub fn register(&self, connection: &Arc<dyn Connection>, agent_id: &str) -> (bool, Option<Arc<dyn Connection>>) {
        let id = connection.id();
        let mut t = self.inner.write();
        if t.by_connection.get(&id).map(|e| e.agent_id == agent_id).unwrap_or(false) {
            return (false, None);
        }
        let mut replaced = None;
        if let Some(old) = t.by_agent.insert(agent_id.to_string(), id) {
            if old != id {
                replaced = t.by_connection.remove(&old).map(|e| e.connection);
            }
        }
        if let Some(prev) = t.by_connection.insert(
            id,
            Entry { agent_id: agent_id.to_string(), connection: Arc::clone(connection), send: Arc::new(Mutex::new(())) },
        ) {
            // Connection switched agent ids.
            if t.by_agent.get(&prev.agent_id) == Some(&id) {
                t.by_agent.remove(&prev.agent_id);
            }
        }
        (true, replaced)
    }

    /// Forget a connection, returning the agent it served.
    pub fn remove_connection(&self, connection_id: u64) -> Option<String> {
        let mut t = self.inner.write();
        let entry = t.by_connection.remove(&connection_id)?;
        if t.by_agent.get(&entry.agent_id) == Some(&connection_id) {
            t.by_agent.remove(&entry.agent_id);
        }
        Some(entry.agent_id)
    }

    /// Forget the agent's connection and return it.
    pub fn remove_agent(&self, agent_id: &str) -> Option<Arc<dyn Connection>> {
        let mut t = self.inner.write();
        let id = t.by_agent.remove(agent_id)?;
        t.by_connection.remove(&id).map(|e| e.connection)
    }

    pub fn agent_id(&self, connection_id: u64) -> Option<String> {
        self.inner.read().by_connection.get(&connection_id).map(|e| e.agent_id.clone())
    }

    pub fn connected(&self, agent_id: &str) -> bool { self.inner.read().by_agent.contains_key(agent_id) }

    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().by_agent.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize { self.inner.read().by_connection.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn lookup(&self, agent_id: &str) -> Option<(Arc<dyn Connection>, Arc<Mutex<()>>)> {
        let t = self.inner.read();
        let id = t.by_agent.get(agent_id)?;
        t.by_connection.get(id).map(|e| (Arc::clone(&e.connection), Arc::clone(&e.send)))
    }

    fn lookup_connection(&self, connection_id: u64) -> Option<(Arc<dyn Connection>, Arc<Mutex<()>>)> {
        self.inner
            .read()
            .by_connection
            .get(&connection_id)
            .map(|e| (Arc::clone(&e.connection), Arc::clone(&e.send)))
    }

    /// Send to the agent's connection under its send mutex. `Ok(false)` if not connected.
    pub async fn send_to_agent(&self, agent_id: &str, message: &ServerToAgent, timeout: Duration) -> Result<bool> {
        let Some((conn, lock)) = self.lookup(agent_id) else { return Ok(false) };
        guarded_send(conn, lock, message, timeout).await?;
        Ok(true)
    }

    /// Send on a connection under its send mutex; unregistered connections send unguarded.
    pub async fn send_on(&self, connection: &Arc<dyn Connection>, message: &ServerToAgent, timeout: Duration) -> Result<()> {
        match self.lookup_connection(connection.id()) {
            Some((conn, lock)) => guarded_send(conn, lock, message, timeout).await,
            None => with_timeout(connection.send(message), timeout).await,
        }
    }
}

async fn guarded_send(
    conn: Arc<dyn Connection>,
    lock: Arc<Mutex<()>>,
    message: &ServerToAgent,
    timeout: Duration,
) -> Result<()> {
    let _guard = lock.lock().await;
    with_timeout(conn.send(message), timeout).await
}

async fn with_timeout(fut: impl std::future::Future<Output = Result<()>>, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Transport(format!("send timed out after {:?}", timeout))),
    }
}
