//! External pub/sub used by the distributed store variant.

use std::time::Duration;

use async_trait::async_trait;
use fleet_bus::{Source, Stream, SubscriptionOptions};
use fleet_core::{Result, Updates};
use tokio_util::sync::CancellationToken;

/// Carries committed batches between store nodes. Every subscriber, the publisher
/// included, receives every published batch.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, updates: Updates) -> Result<()>;
    /// Stream of batches until `ctx` is cancelled.
    async fn subscribe(&self, ctx: &CancellationToken) -> Result<Stream<Updates>>;
}

/// In-process broker for tests and multi-node setups sharing one host.
pub struct LocalBroker {
    topic: Source<Updates>,
    interval: Duration,
}

impl Default for LocalBroker {
    fn default() -> Self { Self::new(Duration::from_millis(10)) }
}

impl LocalBroker {
    /// `interval` is the flush period of each node's receive buffer.
    pub fn new(interval: Duration) -> Self { Self { topic: Source::named("broker"), interval } }

    pub fn nodes(&self) -> usize { self.topic.subscribers() }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn publish(&self, updates: Updates) -> Result<()> {
        self.topic.send(updates).await;
        Ok(())
    }

    async fn subscribe(&self, ctx: &CancellationToken) -> Result<Stream<Updates>> {
        let (stream, _unsubscribe) =
            self.topic.subscribe(Some(ctx), SubscriptionOptions::unbounded(self.interval)).await;
        Ok(stream)
    }
}
