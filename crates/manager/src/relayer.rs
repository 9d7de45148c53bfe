//! Live-tail relay: session subscriptions per agent, fan-out of tail messages to the
//! sessions they name.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_bus::{Source, Stream, SubscriptionOptions, Unsubscribe};
use fleet_core::Result;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveTailSession {
    pub id: String,
    #[serde(default)]
    pub filters: Vec<String>,
}

/// A batch of samples sent by an agent on its live socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveTailMessage {
    pub agent_id: String,
    pub sessions: Vec<String>,
    #[serde(default)]
    pub records: Json,
}

/// Pushes an agent's current session list to it. Implemented by the protocol adapter.
#[async_trait]
pub trait LiveTailConfigurer: Send + Sync {
    async fn configure_live_tail(&self, agent_id: &str, sessions: &[LiveTailSession]) -> Result<()>;
}

pub struct LiveTailSubscription {
    pub id: String,
    pub stream: Stream<LiveTailMessage>,
}

#[derive(Default)]
struct Sessions {
    /// agent id -> sessions attached to it
    agents: FxHashMap<String, Vec<LiveTailSession>>,
    /// session id -> subscription handle
    subscribers: FxHashMap<String, Unsubscribe>,
}

pub struct Relayer {
    configurer: Arc<dyn LiveTailConfigurer>,
    messages: Source<LiveTailMessage>,
    sessions: Mutex<Sessions>,
    flush_interval: Duration,
}

impl Relayer {
    pub fn new(configurer: Arc<dyn LiveTailConfigurer>) -> Self {
        Self {
            configurer,
            messages: Source::named("live_tail"),
            sessions: Mutex::new(Sessions::default()),
            flush_interval: Duration::from_millis(50),
        }
    }

    /// Attach a new session to `agent_ids` and return the stream of messages addressed to it.
    /// Cancelling `ctx` closes the stream but leaves the agents configured until
    /// `remove_subscription` is called.
    pub async fn add_subscription(
        &self,
        ctx: Option<&CancellationToken>,
        agent_ids: &[String],
        filters: Vec<String>,
    ) -> LiveTailSubscription {
        let id = uuid::Uuid::new_v4().to_string();
        let session_id = id.clone();
        let (stream, unsubscribe) = self
            .messages
            .subscribe_with_filter(ctx, SubscriptionOptions::unbounded(self.flush_interval), move |m: &LiveTailMessage| {
                m.sessions.iter().any(|s| *s == session_id).then(|| m.clone())
            })
            .await;

        let session = LiveTailSession { id: id.clone(), filters };
        let touched: Vec<(String, Vec<LiveTailSession>)> = {
            let mut s = self.sessions.lock();
            s.subscribers.insert(id.clone(), unsubscribe);
            agent_ids
                .iter()
                .map(|agent_id| {
                    let list = s.agents.entry(agent_id.clone()).or_default();
                    list.push(session.clone());
                    (agent_id.clone(), list.clone())
                })
                .collect()
        };
        info!(session = %id, agents = agent_ids.len(), "live tail session added");
        self.push(touched).await;
        LiveTailSubscription { id, stream }
    }

    /// Detach the session from every agent. Agents left without sessions are forgotten.
    pub async fn remove_subscription(&self, session_id: &str) {
        let (touched, unsubscribe) = {
            let mut s = self.sessions.lock();
            let unsubscribe = s.subscribers.remove(session_id);
            let mut touched = Vec::new();
            s.agents.retain(|agent_id, list| {
                let before = list.len();
                list.retain(|sess| sess.id != session_id);
                if list.len() != before {
                    touched.push((agent_id.clone(), list.clone()));
                }
                !list.is_empty()
            });
            (touched, unsubscribe)
        };
        if let Some(u) = unsubscribe {
            u.unsubscribe().await;
        }
        info!(session = %session_id, agents = touched.len(), "live tail session removed");
        self.push(touched).await;
    }

    /// Sessions currently attached to `agent_id`.
    pub fn sessions(&self, agent_id: &str) -> Vec<LiveTailSession> {
        self.sessions.lock().agents.get(agent_id).cloned().unwrap_or_default()
    }

    /// Forward a message from an agent to the sessions it names.
    pub async fn relay(&self, message: LiveTailMessage) {
        debug!(agent_id = %message.agent_id, sessions = message.sessions.len(), "live tail message");
        self.messages.send(message).await;
    }

    async fn push(&self, touched: Vec<(String, Vec<LiveTailSession>)>) {
        for (agent_id, sessions) in touched {
            if let Err(e) = self.configurer.configure_live_tail(&agent_id, &sessions).await {
                warn!(agent_id = %agent_id, error = %e, "live tail configuration failed");
            }
        }
    }
}
