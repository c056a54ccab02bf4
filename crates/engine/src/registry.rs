use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use streamgate_core::{ErrorCode, ExchangeError, StreamKind, SubscriberId, TimeframeError, Topic, TopicError};
use tokio::sync::{watch, Mutex};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a subscription could not be established.
///
/// Every variant reaches the originating subscriber as an explicit error
/// event; a failed subscribe is never silent.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubscribeError {
    #[error("exchange `{exchange}` does not support {kind} streams")]
    UnsupportedStream { exchange: String, kind: StreamKind },
    #[error("no trading connection for user `{user}` on `{exchange}`; connect first")]
    MissingSession { user: String, exchange: String },
    #[error("ohlcv subscriptions require a timeframe")]
    MissingTimeframe,
    #[error(transparent)]
    InvalidTimeframe(#[from] TimeframeError),
    #[error(transparent)]
    InvalidTopic(#[from] TopicError),
    #[error("watcher start failed: {0}")]
    Exchange(#[from] ExchangeError),
}

impl SubscribeError {
    /// The machine-readable code delivered with the error event.
    pub fn code(&self) -> ErrorCode {
        match self {
            SubscribeError::UnsupportedStream { .. } => ErrorCode::UnsupportedStream,
            SubscribeError::MissingSession { .. } => ErrorCode::MissingSession,
            SubscribeError::MissingTimeframe | SubscribeError::InvalidTimeframe(_) => {
                ErrorCode::InvalidTimeframe
            }
            SubscribeError::InvalidTopic(_) => ErrorCode::InvalidTopic,
            SubscribeError::Exchange(ExchangeError::Unsupported { .. }) => {
                ErrorCode::UnsupportedStream
            }
            SubscribeError::Exchange(_) => ErrorCode::UpstreamFailure,
        }
    }
}

// ---------------------------------------------------------------------------
// Registration outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum StartState {
    Pending,
    Settled(Result<(), SubscribeError>),
}

/// Handed to callers that registered while a watcher start was already in
/// flight; resolves to that start's outcome.
pub struct StartWaiter {
    rx: watch::Receiver<StartState>,
}

impl StartWaiter {
    pub async fn wait(mut self) -> Result<(), SubscribeError> {
        loop {
            if let StartState::Settled(result) = &*self.rx.borrow_and_update() {
                return result.clone();
            }
            if self.rx.changed().await.is_err() {
                // Starter dropped without settling; treat as a failed start.
                return Err(SubscribeError::Exchange(ExchangeError::Other(
                    "watcher start abandoned".to_string(),
                )));
            }
        }
    }
}

/// Outcome of registering a subscriber on a topic.
pub enum Registration {
    /// The topic already has a watcher; the subscriber was added.
    Active,
    /// A start is in flight; the subscriber was added and the caller must
    /// await its outcome.
    Pending(StartWaiter),
    /// This registration transitioned the topic from absent to present.
    /// The caller must start the watcher and report the outcome via
    /// [`SubscriptionRegistry::settle`].
    StartRequired,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    /// topic → subscribers. A topic with no subscribers is deleted, never
    /// left empty; absence is what tells the watcher to exit.
    topics: HashMap<Topic, HashSet<SubscriberId>>,
    /// subscriber → topics, the exact inverse of `topics`.
    subscriptions: HashMap<SubscriberId, HashSet<Topic>>,
    /// Topics whose watcher start has not settled yet. At most one start
    /// is in flight per topic.
    starting: HashMap<Topic, watch::Sender<StartState>>,
}

impl Inner {
    fn insert(&mut self, subscriber: SubscriberId, topic: &Topic) {
        self.topics
            .entry(topic.clone())
            .or_default()
            .insert(subscriber);
        self.subscriptions
            .entry(subscriber)
            .or_default()
            .insert(topic.clone());
    }

    /// Remove one registration; returns true when that emptied the topic
    /// and deleted it.
    fn remove(&mut self, subscriber: &SubscriberId, topic: &Topic) -> bool {
        if let Some(subs) = self.subscriptions.get_mut(subscriber) {
            subs.remove(topic);
            if subs.is_empty() {
                self.subscriptions.remove(subscriber);
            }
        }
        match self.topics.get_mut(topic) {
            Some(set) => {
                set.remove(subscriber);
                if set.is_empty() {
                    self.topics.remove(topic);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Delete a topic outright, dropping every registration it holds.
    fn remove_topic(&mut self, topic: &Topic) -> HashSet<SubscriberId> {
        let subscribers = self.topics.remove(topic).unwrap_or_default();
        for subscriber in &subscribers {
            if let Some(subs) = self.subscriptions.get_mut(subscriber) {
                subs.remove(topic);
                if subs.is_empty() {
                    self.subscriptions.remove(subscriber);
                }
            }
        }
        subscribers
    }
}

/// Reference-counted mapping from topic to subscribers and back.
///
/// The registry owns the decision of when a watcher starts and stops: the
/// registration that creates a topic gets [`Registration::StartRequired`]
/// exactly once, concurrent registrations for the same new topic block on
/// the in-flight start instead of racing it, and the removal that empties
/// a topic deletes it so the watcher sees the absence and exits.
///
/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `subscriber`'s interest in `topic`.
    pub async fn register(&self, subscriber: SubscriberId, topic: &Topic) -> Registration {
        let mut inner = self.inner.lock().await;
        if let Some(tx) = inner.starting.get(topic) {
            let rx = tx.subscribe();
            inner.insert(subscriber, topic);
            return Registration::Pending(StartWaiter { rx });
        }
        if inner.topics.contains_key(topic) {
            inner.insert(subscriber, topic);
            return Registration::Active;
        }
        let (tx, _rx) = watch::channel(StartState::Pending);
        inner.starting.insert(topic.clone(), tx);
        inner.insert(subscriber, topic);
        Registration::StartRequired
    }

    /// Report the outcome of a watcher start. A failed start rolls the
    /// registration back: the topic and every interest recorded while the
    /// start was in flight are removed before waiters observe the error.
    pub async fn settle(&self, topic: &Topic, result: Result<(), SubscribeError>) {
        let mut inner = self.inner.lock().await;
        let gate = inner.starting.remove(topic);
        if result.is_err() {
            inner.remove_topic(topic);
        }
        drop(inner);
        if let Some(tx) = gate {
            let _ = tx.send(StartState::Settled(result));
        }
    }

    /// Remove one subscriber's interest. Returns true when this was the
    /// last subscriber and the topic was deleted.
    pub async fn unsubscribe(&self, subscriber: &SubscriberId, topic: &Topic) -> bool {
        self.inner.lock().await.remove(subscriber, topic)
    }

    /// Remove every topic the subscriber holds. Returns each dropped topic
    /// paired with whether dropping it deleted the topic.
    pub async fn disconnect(&self, subscriber: &SubscriberId) -> Vec<(Topic, bool)> {
        let mut inner = self.inner.lock().await;
        let topics = inner.subscriptions.remove(subscriber).unwrap_or_default();
        topics
            .into_iter()
            .map(|topic| {
                let removed = match inner.topics.get_mut(&topic) {
                    Some(set) => {
                        set.remove(subscriber);
                        if set.is_empty() {
                            inner.topics.remove(&topic);
                            true
                        } else {
                            false
                        }
                    }
                    None => false,
                };
                (topic, removed)
            })
            .collect()
    }

    /// Tear a topic down regardless of remaining interest (fatal upstream
    /// failure). Returns the subscribers that were registered.
    pub async fn remove_topic(&self, topic: &Topic) -> HashSet<SubscriberId> {
        self.inner.lock().await.remove_topic(topic)
    }

    /// Whether the topic currently has any registered subscriber. Watcher
    /// loops poll this once per iteration as their exit condition.
    pub async fn has_subscribers(&self, topic: &Topic) -> bool {
        self.inner.lock().await.topics.contains_key(topic)
    }

    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner
            .lock()
            .await
            .topics
            .get(topic)
            .map_or(0, HashSet::len)
    }

    pub async fn topic_count(&self) -> usize {
        self.inner.lock().await.topics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker_topic(symbol: &str) -> Topic {
        Topic::public(StreamKind::Ticker, "binance", vec![symbol.to_string()]).unwrap()
    }

    /// Forward and inverse maps must describe the same set of edges.
    async fn assert_mutual_inverse(registry: &SubscriptionRegistry) {
        let inner = registry.inner.lock().await;
        for (topic, subs) in &inner.topics {
            assert!(!subs.is_empty(), "topic {topic} left with empty subscriber set");
            for sub in subs {
                assert!(
                    inner.subscriptions[sub].contains(topic),
                    "forward edge {topic} -> {sub} missing from inverse map"
                );
            }
        }
        for (sub, topics) in &inner.subscriptions {
            assert!(!topics.is_empty());
            for topic in topics {
                assert!(
                    inner.topics[topic].contains(sub),
                    "inverse edge {sub} -> {topic} missing from forward map"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_first_registration_requires_start() {
        let registry = SubscriptionRegistry::new();
        let a = SubscriberId::new();
        let topic = ticker_topic("BTC/USDT");

        assert!(matches!(
            registry.register(a, &topic).await,
            Registration::StartRequired
        ));
        registry.settle(&topic, Ok(())).await;

        let b = SubscriberId::new();
        assert!(matches!(
            registry.register(b, &topic).await,
            Registration::Active
        ));
        assert_eq!(registry.subscriber_count(&topic).await, 2);
        assert_mutual_inverse(&registry).await;
    }

    #[tokio::test]
    async fn test_concurrent_registration_awaits_inflight_start() {
        let registry = SubscriptionRegistry::new();
        let topic = ticker_topic("BTC/USDT");
        let a = SubscriberId::new();
        let b = SubscriberId::new();

        assert!(matches!(
            registry.register(a, &topic).await,
            Registration::StartRequired
        ));
        // B races in while the start is unsettled: no second start.
        let waiter = match registry.register(b, &topic).await {
            Registration::Pending(waiter) => waiter,
            _ => panic!("expected pending registration"),
        };

        let settle = {
            let registry = registry.clone();
            let topic = topic.clone();
            tokio::spawn(async move { registry.settle(&topic, Ok(())).await })
        };
        waiter.wait().await.unwrap();
        settle.await.unwrap();
        assert_eq!(registry.subscriber_count(&topic).await, 2);
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back_all_registrations() {
        let registry = SubscriptionRegistry::new();
        let topic = ticker_topic("BTC/USDT");
        let a = SubscriberId::new();
        let b = SubscriberId::new();

        registry.register(a, &topic).await;
        let waiter = match registry.register(b, &topic).await {
            Registration::Pending(waiter) => waiter,
            _ => panic!("expected pending registration"),
        };

        registry
            .settle(
                &topic,
                Err(SubscribeError::UnsupportedStream {
                    exchange: "binance".to_string(),
                    kind: StreamKind::Ticker,
                }),
            )
            .await;

        assert!(matches!(
            waiter.wait().await,
            Err(SubscribeError::UnsupportedStream { .. })
        ));
        assert_eq!(registry.topic_count().await, 0);
        assert_mutual_inverse(&registry).await;

        // A fresh subscribe starts clean.
        assert!(matches!(
            registry.register(a, &topic).await,
            Registration::StartRequired
        ));
    }

    #[tokio::test]
    async fn test_last_unsubscribe_deletes_topic() {
        let registry = SubscriptionRegistry::new();
        let topic = ticker_topic("BTC/USDT");
        let a = SubscriberId::new();
        let b = SubscriberId::new();

        registry.register(a, &topic).await;
        registry.settle(&topic, Ok(())).await;
        registry.register(b, &topic).await;

        assert!(!registry.unsubscribe(&a, &topic).await);
        assert!(registry.has_subscribers(&topic).await);
        assert!(registry.unsubscribe(&b, &topic).await);
        assert!(!registry.has_subscribers(&topic).await);
        assert_eq!(registry.topic_count().await, 0);
        assert_mutual_inverse(&registry).await;
    }

    #[tokio::test]
    async fn test_disconnect_drops_every_topic() {
        let registry = SubscriptionRegistry::new();
        let a = SubscriberId::new();
        let b = SubscriberId::new();
        let btc = ticker_topic("BTC/USDT");
        let eth = ticker_topic("ETH/USDT");

        registry.register(a, &btc).await;
        registry.settle(&btc, Ok(())).await;
        registry.register(a, &eth).await;
        registry.settle(&eth, Ok(())).await;
        registry.register(b, &btc).await;

        let mut dropped = registry.disconnect(&a).await;
        dropped.sort_by_key(|(topic, _)| topic.room_name());
        assert_eq!(dropped.len(), 2);
        // BTC keeps b; ETH emptied.
        assert_eq!(dropped[0], (btc.clone(), false));
        assert_eq!(dropped[1], (eth.clone(), true));
        assert!(registry.has_subscribers(&btc).await);
        assert!(!registry.has_subscribers(&eth).await);
        assert_mutual_inverse(&registry).await;
    }

    #[tokio::test]
    async fn test_remove_topic_clears_inverse_entries() {
        let registry = SubscriptionRegistry::new();
        let a = SubscriberId::new();
        let topic = ticker_topic("BTC/USDT");

        registry.register(a, &topic).await;
        registry.settle(&topic, Ok(())).await;
        let subscribers = registry.remove_topic(&topic).await;
        assert_eq!(subscribers.len(), 1);
        assert!(subscribers.contains(&a));
        assert_eq!(registry.topic_count().await, 0);
        assert_mutual_inverse(&registry).await;
    }

    #[test]
    fn test_error_codes() {
        let err = SubscribeError::MissingSession {
            user: "u1".to_string(),
            exchange: "binance".to_string(),
        };
        assert_eq!(err.code(), ErrorCode::MissingSession);
        let err = SubscribeError::Exchange(ExchangeError::Unsupported {
            exchange: "binance".to_string(),
            kind: StreamKind::OrderBook,
        });
        assert_eq!(err.code(), ErrorCode::UnsupportedStream);
        let err = SubscribeError::Exchange(ExchangeError::ConnectionLost("eof".to_string()));
        assert_eq!(err.code(), ErrorCode::UpstreamFailure);
    }
}
