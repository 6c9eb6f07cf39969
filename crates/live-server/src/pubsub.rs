//! Rate-limited broadcast across engines.
//!
//! `PubSub` routes events published under a topic to every engine
//! subscribed to it. Subscribing an engine redirects its `broadcast`
//! through the transport, so one broadcast reaches every engine on the
//! topic, whichever process it lives in.
//!
//! Delivery through a transport is at-least-once. Self handlers must
//! tolerate duplicates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use futures::future::{self, BoxFuture, FutureExt};
use live_protocol::Event;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::error::LiveError;
use crate::limiter::RateLimiter;
use crate::shutdown::Shutdown;
use crate::types::BroadcastHook;

/// Something that receives broadcasts for a topic. Implemented by
/// `Engine`.
pub trait Subscriber: Send + Sync {
    /// Deliver an event to every local socket.
    fn receive(&self, event: Event);

    /// Route future broadcasts through `hook` instead of local fan-out.
    fn redirect_broadcasts(&self, hook: BroadcastHook);
}

/// Envelope carried by a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub topic: String,
    pub event: Event,
}

/// Moves envelopes between `PubSub` routers.
///
/// `listen` runs until `shutdown` fires, handing every inbound envelope
/// to `router.receive`.
pub trait Transport: Send + Sync + 'static {
    fn publish(&self, message: TransportMessage) -> BoxFuture<'_, Result<(), LiveError>>;

    fn listen(
        self: Arc<Self>,
        router: Arc<PubSub>,
        shutdown: Shutdown,
    ) -> BoxFuture<'static, Result<(), LiveError>>;
}

pub struct PubSub {
    transport: Arc<dyn Transport>,
    topics: RwLock<HashMap<String, Vec<Weak<dyn Subscriber>>>>,
    limiter: RateLimiter,
    shutdown: Shutdown,
}

impl PubSub {
    /// Build a router and spawn the transport's listener.
    pub fn new(transport: Arc<dyn Transport>, limiter: RateLimiter, shutdown: Shutdown) -> Arc<Self> {
        let router = Arc::new(PubSub {
            transport: transport.clone(),
            topics: RwLock::new(HashMap::new()),
            limiter,
            shutdown: shutdown.clone(),
        });

        let listener = transport.listen(router.clone(), shutdown);
        tokio::spawn(async move {
            match listener.await {
                Ok(()) => debug!("pubsub listener stopped"),
                Err(err) => error!(error = %err, "pubsub listener failed"),
            }
        });
        router
    }

    /// Router rate-limited by the engine's broadcast settings.
    pub fn from_config(transport: Arc<dyn Transport>, config: &EngineConfig, shutdown: Shutdown) -> Arc<Self> {
        let limiter = RateLimiter::new(config.broadcast_interval(), config.broadcast_burst);
        Self::new(transport, limiter, shutdown)
    }

    /// Send `event` to every subscriber of `topic`. Waits for a rate
    /// limiter token; fails with `Cancelled` on shutdown.
    pub async fn publish(&self, topic: &str, event: Event) -> Result<(), LiveError> {
        let mut shutdown = self.shutdown.clone();
        self.limiter.acquire(&mut shutdown).await?;
        debug!(topic, event = %event.kind, "publishing");
        self.transport
            .publish(TransportMessage {
                topic: topic.to_string(),
                event,
            })
            .await
    }

    /// Subscribe to `topic` and redirect the subscriber's broadcasts
    /// through this router.
    pub fn subscribe(self: &Arc<Self>, topic: impl Into<String>, subscriber: Arc<dyn Subscriber>) {
        let topic = topic.into();
        let router = Arc::downgrade(self);
        let hook_topic = topic.clone();
        subscriber.redirect_broadcasts(Arc::new(move |event: Event| {
            let router = router.clone();
            let topic = hook_topic.clone();
            async move {
                let router = router
                    .upgrade()
                    .ok_or_else(|| LiveError::PubSub("router dropped".into()))?;
                router.publish(&topic, event).await
            }
            .boxed()
        }));

        info!(topic = %topic, "subscribed");
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic)
            .or_default()
            .push(Arc::downgrade(&subscriber));
    }

    /// Fan an inbound envelope out to the topic's live subscribers.
    /// Dropped subscribers are pruned on the way.
    pub fn receive(&self, message: TransportMessage) {
        let subscribers: Vec<Arc<dyn Subscriber>> = {
            let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
            let Some(list) = topics.get_mut(&message.topic) else {
                debug!(topic = %message.topic, "no subscribers");
                return;
            };
            list.retain(|s| s.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };
        for subscriber in subscribers {
            subscriber.receive(message.event.clone());
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, |list| list.iter().filter(|s| s.strong_count() > 0).count())
    }
}

/// In-process transport over an unbounded channel. Only routers in the
/// same process see its messages.
pub struct LocalTransport {
    tx: mpsc::UnboundedSender<TransportMessage>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<TransportMessage>>>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(LocalTransport {
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }
}

impl Transport for LocalTransport {
    fn publish(&self, message: TransportMessage) -> BoxFuture<'_, Result<(), LiveError>> {
        let sent = self
            .tx
            .send(message)
            .map_err(|_| LiveError::PubSub("local transport closed".into()));
        future::ready(sent).boxed()
    }

    fn listen(
        self: Arc<Self>,
        router: Arc<PubSub>,
        mut shutdown: Shutdown,
    ) -> BoxFuture<'static, Result<(), LiveError>> {
        async move {
            let taken = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take();
            let Some(mut rx) = taken else {
                return Err(LiveError::PubSub("local transport already has a listener".into()));
            };
            loop {
                tokio::select! {
                    message = rx.recv() => match message {
                        Some(message) => router.receive(message),
                        None => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            Ok(())
        }
        .boxed()
    }
}
