pub mod ohlcv;
pub mod registry;
pub mod router;
pub mod session;
pub mod watcher;

pub use ohlcv::CandleAggregator;
pub use registry::{Registration, SubscribeError, SubscriptionRegistry};
pub use router::EventRouter;
pub use session::{SessionCache, SessionKey};
pub use watcher::WatcherSupervisor;

use std::sync::Arc;
use std::time::Duration;
use streamgate_core::{
    Credentials, ExchangeClient, ExchangeClientFactory, ExchangeError, StreamKind, SubscriberId,
    Timeframe, Topic, Transport, UserId,
};

/// Tuning for the engine's session caches.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    /// Sliding TTL for shared public connections; `None` keeps them until
    /// process exit.
    pub public_session_ttl: Option<Duration>,
    /// Sliding TTL for per-user trading connections.
    pub private_session_ttl: Option<Duration>,
}

/// Front door of the streaming core: subscription multiplexing, watcher
/// lifecycle, candle aggregation, and session management behind one
/// handle.
///
/// Any number of subscribers share one upstream watcher per topic; the
/// first subscribe starts it, the last unsubscribe stops it, and every
/// failure surfaces to the caller instead of leaving dangling state.
pub struct StreamEngine {
    registry: SubscriptionRegistry,
    supervisor: WatcherSupervisor,
    aggregator: CandleAggregator,
    private_sessions: Arc<SessionCache<Arc<dyn ExchangeClient>>>,
    factory: Arc<dyn ExchangeClientFactory>,
}

impl StreamEngine {
    pub fn new(
        factory: Arc<dyn ExchangeClientFactory>,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> Self {
        let registry = SubscriptionRegistry::new();
        let aggregator = CandleAggregator::new();
        let router = EventRouter::new(transport);
        let private_sessions = Arc::new(SessionCache::new(config.private_session_ttl));
        let supervisor = WatcherSupervisor::new(
            factory.clone(),
            SessionCache::new(config.public_session_ttl),
            private_sessions.clone(),
            registry.clone(),
            router,
            aggregator.clone(),
        );
        Self {
            registry,
            supervisor,
            aggregator,
            private_sessions,
            factory,
        }
    }

    /// Register a subscriber on a topic, starting the topic's watcher if
    /// this is its first subscriber.
    ///
    /// OHLCV topics require a timeframe; re-subscribing with a different
    /// timeframe switches the subscriber's candle stream without duplicate
    /// emissions. Concurrent subscribes for the same new topic share a
    /// single watcher start and all observe its outcome.
    pub async fn subscribe(
        &self,
        subscriber: SubscriberId,
        topic: Topic,
        timeframe: Option<Timeframe>,
    ) -> Result<(), SubscribeError> {
        if topic.kind() == StreamKind::Ohlcv {
            let timeframe = timeframe.ok_or(SubscribeError::MissingTimeframe)?;
            self.aggregator
                .set_timeframe(&topic, subscriber, timeframe)
                .await;
        }

        let result = match self.registry.register(subscriber, &topic).await {
            Registration::Active => Ok(()),
            Registration::Pending(waiter) => waiter.wait().await,
            Registration::StartRequired => {
                let result = self.supervisor.start(&topic).await;
                self.registry.settle(&topic, result.clone()).await;
                result
            }
        };
        if result.is_err() {
            // A failed start rolled back every registration for the topic;
            // drop its aggregation state too so a retry begins clean.
            self.aggregator.remove_topic(&topic).await;
        }
        result
    }

    /// Drop a subscriber's interest in a topic. The last unsubscribe
    /// deletes the topic and signals its watcher to stop.
    pub async fn unsubscribe(&self, subscriber: &SubscriberId, topic: &Topic) {
        let removed = self.registry.unsubscribe(subscriber, topic).await;
        if topic.kind() == StreamKind::Ohlcv {
            self.aggregator.remove_subscriber(topic, subscriber).await;
        }
        if removed {
            self.supervisor.stop(topic).await;
            self.aggregator.remove_topic(topic).await;
        }
    }

    /// Drop every subscription the subscriber holds (connection closed).
    pub async fn disconnect(&self, subscriber: &SubscriberId) {
        for (topic, removed) in self.registry.disconnect(subscriber).await {
            if topic.kind() == StreamKind::Ohlcv {
                self.aggregator.remove_subscriber(&topic, subscriber).await;
            }
            if removed {
                self.supervisor.stop(&topic).await;
                self.aggregator.remove_topic(&topic).await;
            }
        }
    }

    /// Establish (or refresh) a user's private trading connection. The
    /// handle is cached under `(user, exchange)` and shared by all of the
    /// user's private watchers.
    pub async fn connect_exchange(
        &self,
        user: &UserId,
        exchange: &str,
        credentials: &Credentials,
    ) -> Result<(), ExchangeError> {
        let key = SessionKey::private(user, exchange);
        if self.private_sessions.get(&key).await.is_some() {
            return Ok(());
        }
        tracing::info!(user = %user, exchange, "creating private exchange connection");
        let client = self.factory.create(exchange, Some(credentials)).await?;
        client.load_markets().await?;
        self.private_sessions.set(key, client).await;
        Ok(())
    }

    /// Tear down a user's private trading connection, releasing exchange
    /// side resources. Returns false if no connection existed.
    pub async fn disconnect_exchange(&self, user: &UserId, exchange: &str) -> bool {
        let key = SessionKey::private(user, exchange);
        match self.private_sessions.remove(&key).await {
            Some(client) => {
                if let Err(err) = client.close().await {
                    tracing::warn!(user = %user, exchange, error = %err, "error closing private connection");
                }
                true
            }
            None => false,
        }
    }

    pub async fn active_topic_count(&self) -> usize {
        self.registry.topic_count().await
    }

    pub async fn active_watcher_count(&self) -> usize {
        self.supervisor.watcher_count().await
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &WatcherSupervisor {
        &self.supervisor
    }
}
