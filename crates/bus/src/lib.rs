//! Fleet bus: typed in-process event source with per-subscriber fan-out.
//!
//! `Source::send` delivers to every subscriber in turn under a read lock; membership changes
//! take the write lock. Bounded subscribers apply backpressure to the sender when full, the
//! unbounded option buffers without limit and flushes on a coalescing interval.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Capacity of a subscriber stream when no option is given.
pub const DEFAULT_CAPACITY: usize = 10;

/// How a subscription buffers events.
pub enum Buffer<R> {
    /// Bounded stream; a full stream blocks `send`.
    Bounded(usize),
    /// Caller-supplied channel with caller-chosen capacity.
    Channel(mpsc::Sender<R>, mpsc::Receiver<R>),
    /// Growable buffer flushed every interval; never blocks `send`.
    Unbounded(Duration),
}

pub struct SubscriptionOptions<R> {
    buffer: Buffer<R>,
}

impl<R> Default for SubscriptionOptions<R> {
    fn default() -> Self { Self { buffer: Buffer::Bounded(DEFAULT_CAPACITY) } }
}

impl<R> SubscriptionOptions<R> {
    pub fn bounded(capacity: usize) -> Self { Self { buffer: Buffer::Bounded(capacity) } }
    pub fn channel(tx: mpsc::Sender<R>, rx: mpsc::Receiver<R>) -> Self { Self { buffer: Buffer::Channel(tx, rx) } }
    pub fn unbounded(interval: Duration) -> Self { Self { buffer: Buffer::Unbounded(interval) } }
}

#[async_trait]
trait Subscriber<T>: Send + Sync {
    async fn deliver(&self, item: &T);
    fn close(&self);
}

type Filter<T, R> = Box<dyn Fn(&T) -> Option<R> + Send + Sync>;

struct BoundedSubscriber<T, R> {
    filter: Filter<T, R>,
    tx: mpsc::Sender<R>,
    closed: CancellationToken,
}

#[async_trait]
impl<T, R> Subscriber<T> for BoundedSubscriber<T, R>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
{
    async fn deliver(&self, item: &T) {
        let Some(mapped) = (self.filter)(item) else { return };
        tokio::select! {
            res = self.tx.send(mapped) => {
                if res.is_err() { trace!("subscriber stream dropped; event discarded"); }
            }
            _ = self.closed.cancelled() => {}
        }
    }

    fn close(&self) { self.closed.cancel(); }
}

struct UnboundedSubscriber<T, R> {
    filter: Filter<T, R>,
    tx: mpsc::UnboundedSender<R>,
    closed: CancellationToken,
}

#[async_trait]
impl<T, R> Subscriber<T> for UnboundedSubscriber<T, R>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
{
    async fn deliver(&self, item: &T) {
        if let Some(mapped) = (self.filter)(item) {
            let _ = self.tx.send(mapped);
        }
    }

    fn close(&self) { self.closed.cancel(); }
}

/// Moves events from the unbounded intake to the subscriber stream every `interval`.
async fn pump<R>(
    mut input: mpsc::UnboundedReceiver<R>,
    out: mpsc::Sender<R>,
    interval: Duration,
    closed: CancellationToken,
) {
    let mut buffer: VecDeque<R> = VecDeque::new();
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => return,
            maybe = input.recv() => match maybe {
                Some(item) => buffer.push_back(item),
                None => break,
            },
            _ = ticker.tick() => {
                if !flush(&mut buffer, &out) { return; }
            }
        }
    }
    // Source dropped without an unsubscribe: hand over what is left.
    for item in buffer {
        tokio::select! {
            res = out.send(item) => if res.is_err() { return },
            _ = closed.cancelled() => return,
        }
    }
}

fn flush<R>(buffer: &mut VecDeque<R>, out: &mpsc::Sender<R>) -> bool {
    while let Some(item) = buffer.pop_front() {
        match out.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                buffer.push_front(item);
                break;
            }
            Err(TrySendError::Closed(_)) => return false,
        }
    }
    true
}

#[async_trait]
trait Registry: Send + Sync {
    async fn remove(&self, id: u64);
}

struct Inner<T> {
    name: &'static str,
    subscribers: RwLock<FxHashMap<u64, Box<dyn Subscriber<T>>>>,
    next_id: AtomicU64,
    count: AtomicUsize,
}

impl<T> Inner<T> {
    fn record_count(&self, n: usize) {
        self.count.store(n, Ordering::Relaxed);
        metrics::gauge!("bus_subscribers", n as f64, "source" => self.name);
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Registry for Inner<T> {
    async fn remove(&self, id: u64) {
        let mut subs = self.subscribers.write().await;
        if let Some(sub) = subs.remove(&id) {
            sub.close();
            self.record_count(subs.len());
            debug!(source = self.name, id, "unsubscribed");
        }
    }
}

/// Typed event source.
pub struct Source<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<T: Clone + Send + Sync + 'static> Default for Source<T> {
    fn default() -> Self { Self::new() }
}

impl<T: Clone + Send + Sync + 'static> Source<T> {
    pub fn new() -> Self { Self::named("events") }

    /// Source whose name is attached to its metrics and logs.
    pub fn named(name: &'static str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                subscribers: RwLock::new(FxHashMap::default()),
                next_id: AtomicU64::new(1),
                count: AtomicUsize::new(0),
            }),
        }
    }

    /// Deliver `item` to every current subscriber. Awaits bounded subscribers that are full.
    pub async fn send(&self, item: T) {
        let subs = self.inner.subscribers.read().await;
        for sub in subs.values() {
            sub.deliver(&item).await;
        }
    }

    /// Subscribe to every event.
    pub async fn subscribe(
        &self,
        ctx: Option<&CancellationToken>,
        opts: SubscriptionOptions<T>,
    ) -> (Stream<T>, Unsubscribe) {
        self.subscribe_with_filter(ctx, opts, |item: &T| Some(item.clone())).await
    }

    /// Subscribe to the events accepted by `filter`, mapped to `R`. The filter runs on the
    /// sender's side before anything is enqueued. When `ctx` is given its cancellation
    /// unsubscribes.
    pub async fn subscribe_with_filter<R, F>(
        &self,
        ctx: Option<&CancellationToken>,
        opts: SubscriptionOptions<R>,
        filter: F,
    ) -> (Stream<R>, Unsubscribe)
    where
        R: Send + 'static,
        F: Fn(&T) -> Option<R> + Send + Sync + 'static,
    {
        let closed = CancellationToken::new();
        let filter: Filter<T, R> = Box::new(filter);
        let (sub, rx): (Box<dyn Subscriber<T>>, mpsc::Receiver<R>) = match opts.buffer {
            Buffer::Bounded(cap) => {
                let (tx, rx) = mpsc::channel(cap.max(1));
                (Box::new(BoundedSubscriber { filter, tx, closed: closed.clone() }), rx)
            }
            Buffer::Channel(tx, rx) => (Box::new(BoundedSubscriber { filter, tx, closed: closed.clone() }), rx),
            Buffer::Unbounded(interval) => {
                let (in_tx, in_rx) = mpsc::unbounded_channel();
                let (out_tx, out_rx) = mpsc::channel(DEFAULT_CAPACITY);
                tokio::spawn(pump(in_rx, out_tx, interval, closed.clone()));
                (Box::new(UnboundedSubscriber { filter, tx: in_tx, closed: closed.clone() }), out_rx)
            }
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut subs = self.inner.subscribers.write().await;
            subs.insert(id, sub);
            self.inner.record_count(subs.len());
        }
        debug!(source = self.inner.name, id, "subscribed");

        let registry: Weak<dyn Registry> = Arc::downgrade(&self.inner) as Weak<dyn Registry>;
        let unsubscribe = Unsubscribe { id, closed: closed.clone(), done: Arc::new(AtomicBool::new(false)), registry };

        if let Some(ctx) = ctx {
            let ctx = ctx.clone();
            let unsub = unsubscribe.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = ctx.cancelled() => unsub.unsubscribe().await,
                    _ = closed.cancelled() => {}
                }
            });
        }

        (Stream { rx }, unsubscribe)
    }

    /// Current number of subscribers.
    pub fn subscribers(&self) -> usize { self.inner.count.load(Ordering::Relaxed) }

    /// Drop every subscriber, closing their streams.
    pub async fn close(&self) {
        let mut subs = self.inner.subscribers.write().await;
        for (_, sub) in subs.drain() {
            sub.close();
        }
        self.inner.record_count(0);
    }
}

/// Handle that removes one subscription. Idempotent and cheap to clone.
#[derive(Clone)]
pub struct Unsubscribe {
    id: u64,
    closed: CancellationToken,
    done: Arc<AtomicBool>,
    registry: Weak<dyn Registry>,
}

impl Unsubscribe {
    pub async fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        // Cancel first so a sender blocked on this subscriber lets go of the read lock.
        self.closed.cancel();
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id).await;
        }
    }

    pub fn is_unsubscribed(&self) -> bool { self.done.load(Ordering::Acquire) }
}

/// Receiving side of a subscription.
pub struct Stream<R> {
    rx: mpsc::Receiver<R>,
}

impl<R> Stream<R> {
    /// Next event, `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<R> { self.rx.recv().await }

    pub fn try_recv(&mut self) -> Option<R> { self.rx.try_recv().ok() }
}

impl<R> futures::Stream for Stream<R> {
    type Item = R;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<R>> { self.rx.poll_recv(cx) }
}

/// Forward every event from `src` to `dst` until `ctx` is cancelled or `src` closes.
pub async fn relay<T>(ctx: CancellationToken, src: &Source<T>, dst: &Source<T>)
where
    T: Clone + Send + Sync + 'static,
{
    let (mut stream, unsub) = src.subscribe(Some(&ctx), SubscriptionOptions::default()).await;
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            maybe = stream.recv() => match maybe {
                Some(item) => dst.send(item).await,
                None => break,
            },
        }
    }
    unsub.unsubscribe().await;
    debug!("relay stopped");
}

/// Spawn [`relay`] on the runtime.
pub fn spawn_relay<T>(ctx: CancellationToken, src: Source<T>, dst: Source<T>) -> tokio::task::JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move { relay(ctx, &src, &dst).await })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_to_all_subscribers() {
        let src: Source<u32> = Source::new();
        let (mut a, _ua) = src.subscribe(None, SubscriptionOptions::default()).await;
        let (mut b, _ub) = src.subscribe(None, SubscriptionOptions::default()).await;
        assert_eq!(src.subscribers(), 2);
        src.send(1).await;
        src.send(2).await;
        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[tokio::test]
    async fn filter_maps_and_drops() {
        let src: Source<u32> = Source::new();
        let (mut evens, _u) = src
            .subscribe_with_filter(None, SubscriptionOptions::default(), |n: &u32| {
                if n % 2 == 0 { Some(format!("even-{}", n)) } else { None }
            })
            .await;
        for n in 1..=4 { src.send(n).await; }
        assert_eq!(evens.recv().await.as_deref(), Some("even-2"));
        assert_eq!(evens.recv().await.as_deref(), Some("even-4"));
        assert!(evens.try_recv().is_none());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_closes() {
        let src: Source<u32> = Source::new();
        let (mut s, unsub) = src.subscribe(None, SubscriptionOptions::default()).await;
        unsub.unsubscribe().await;
        unsub.unsubscribe().await;
        assert!(unsub.is_unsubscribed());
        assert_eq!(src.subscribers(), 0);
        src.send(7).await;
        assert_eq!(s.recv().await, None);
    }

    #[tokio::test]
    async fn caller_supplied_channel() {
        let src: Source<u32> = Source::new();
        let (tx, rx) = mpsc::channel(1);
        let (mut s, _u) = src.subscribe(None, SubscriptionOptions::channel(tx, rx)).await;
        src.send(3).await;
        assert_eq!(s.recv().await, Some(3));
    }
}
