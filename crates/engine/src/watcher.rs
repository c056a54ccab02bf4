use crate::ohlcv::CandleAggregator;
use crate::registry::{SubscribeError, SubscriptionRegistry};
use crate::router::EventRouter;
use crate::session::{SessionCache, SessionKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use streamgate_core::{
    Capabilities, ErrorCode, ExchangeClient, ExchangeClientFactory, ExchangeError, OutboundEvent,
    StreamKind, Topic, Trade,
};
use tokio::sync::{watch, Mutex};

/// One running watcher; owns the cooperative stop signal. The epoch ties
/// the handle to one run of the loop, so a finished run never removes the
/// handle of a successor started for the same topic.
struct WatcherHandle {
    stop: watch::Sender<bool>,
    epoch: u64,
}

/// What one suspending upstream read produced.
enum Reading {
    /// Fans out to the topic's room as-is.
    Publish(OutboundEvent),
    /// Raw trades feeding the candle aggregator.
    Trades(Vec<Trade>),
}

enum Outcome {
    Stopped,
    Failed(ExchangeError),
}

struct SupervisorInner {
    factory: Arc<dyn ExchangeClientFactory>,
    public_sessions: SessionCache<Arc<dyn ExchangeClient>>,
    private_sessions: Arc<SessionCache<Arc<dyn ExchangeClient>>>,
    registry: SubscriptionRegistry,
    router: EventRouter,
    aggregator: CandleAggregator,
    watchers: Mutex<HashMap<Topic, WatcherHandle>>,
    epochs: AtomicU64,
}

/// Runs one long-lived read loop per active topic.
///
/// Starting a watcher acquires (public: get-or-create, private: require)
/// the session handle and checks the capability descriptor; unsupported
/// stream kinds fail the start and never reach the loop. The loop performs
/// the suspending read, routes the decoded payload, and exits when the
/// topic leaves the registry or the stop signal fires. Transient read
/// failures are logged and the loop continues; a fatal failure tears the
/// topic down, notifies its room once, and is never retried here.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WatcherSupervisor {
    inner: Arc<SupervisorInner>,
}

impl WatcherSupervisor {
    pub fn new(
        factory: Arc<dyn ExchangeClientFactory>,
        public_sessions: SessionCache<Arc<dyn ExchangeClient>>,
        private_sessions: Arc<SessionCache<Arc<dyn ExchangeClient>>>,
        registry: SubscriptionRegistry,
        router: EventRouter,
        aggregator: CandleAggregator,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                factory,
                public_sessions,
                private_sessions,
                registry,
                router,
                aggregator,
                watchers: Mutex::new(HashMap::new()),
                epochs: AtomicU64::new(0),
            }),
        }
    }

    /// Start the watcher for a topic that just entered the registry.
    pub async fn start(&self, topic: &Topic) -> Result<(), SubscribeError> {
        let client = self.acquire_client(topic).await?;
        let caps = client.capabilities().clone();
        let kind = topic.kind();
        if !caps.supports(kind) {
            return Err(SubscribeError::UnsupportedStream {
                exchange: topic.exchange().to_string(),
                kind,
            });
        }
        let batched = matches!(kind, StreamKind::Ticker | StreamKind::OrderBook)
            && topic.symbols().len() > 1;
        if batched && !caps.supports_multi(kind) {
            return Err(SubscribeError::UnsupportedStream {
                exchange: topic.exchange().to_string(),
                kind,
            });
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let epoch = self.inner.epochs.fetch_add(1, Ordering::Relaxed);
        {
            let mut watchers = self.inner.watchers.lock().await;
            if watchers.contains_key(topic) {
                tracing::warn!(topic = %topic, "watcher already running");
                return Ok(());
            }
            watchers.insert(
                topic.clone(),
                WatcherHandle {
                    stop: stop_tx,
                    epoch,
                },
            );
        }

        let supervisor = self.clone();
        let topic = topic.clone();
        tokio::spawn(async move {
            supervisor.run(topic, client, caps, stop_rx, epoch).await;
        });
        Ok(())
    }

    /// Signal a topic's watcher to stop; it finishes its current read and
    /// exits.
    pub async fn stop(&self, topic: &Topic) {
        let handle = self.inner.watchers.lock().await.remove(topic);
        if let Some(handle) = handle {
            let _ = handle.stop.send(true);
        }
    }

    pub async fn watcher_count(&self) -> usize {
        self.inner.watchers.lock().await.len()
    }

    pub async fn is_watching(&self, topic: &Topic) -> bool {
        self.inner.watchers.lock().await.contains_key(topic)
    }

    async fn acquire_client(
        &self,
        topic: &Topic,
    ) -> Result<Arc<dyn ExchangeClient>, SubscribeError> {
        match topic.user() {
            None => {
                let key = SessionKey::public(topic.exchange());
                if let Some(client) = self.inner.public_sessions.get(&key).await {
                    return Ok(client);
                }
                tracing::info!(exchange = topic.exchange(), "creating public exchange connection");
                let client = self.inner.factory.create(topic.exchange(), None).await?;
                client.load_markets().await?;
                self.inner.public_sessions.set(key, client.clone()).await;
                Ok(client)
            }
            Some(user) => {
                let key = SessionKey::private(user, topic.exchange());
                self.inner.private_sessions.get(&key).await.ok_or_else(|| {
                    SubscribeError::MissingSession {
                        user: user.to_string(),
                        exchange: topic.exchange().to_string(),
                    }
                })
            }
        }
    }

    async fn run(
        self,
        topic: Topic,
        client: Arc<dyn ExchangeClient>,
        caps: Capabilities,
        mut stop: watch::Receiver<bool>,
        epoch: u64,
    ) {
        tracing::info!(topic = %topic, "watcher started");
        let outcome = loop {
            if *stop.borrow() {
                break Outcome::Stopped;
            }
            // Topic absence in the registry is the regular exit condition;
            // the last unsubscribe deleted it.
            if !self.inner.registry.has_subscribers(&topic).await {
                break Outcome::Stopped;
            }
            let reading = tokio::select! {
                _ = stop.changed() => continue,
                reading = read_upstream(client.as_ref(), &topic) => reading,
            };
            match reading {
                Ok(Reading::Publish(event)) => {
                    self.inner.router.publish(&topic, &event).await;
                }
                Ok(Reading::Trades(trades)) => {
                    let emissions = self.inner.aggregator.ingest(&topic, trades).await;
                    for (subscriber, update) in emissions {
                        self.inner
                            .router
                            .send(&subscriber, &topic, &OutboundEvent::Ohlcv(update))
                            .await;
                    }
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(topic = %topic, error = %err, "transient upstream error");
                }
                Err(err) => break Outcome::Failed(err),
            }
        };

        // Release this run's handle before any teardown that would let a
        // fresh subscribe start a successor for the same topic.
        {
            let mut watchers = self.inner.watchers.lock().await;
            if watchers.get(&topic).is_some_and(|h| h.epoch == epoch) {
                watchers.remove(&topic);
            }
        }

        if let Outcome::Failed(err) = &outcome {
            tracing::error!(topic = %topic, error = %err, "watcher failed, tearing topic down");
            self.inner
                .router
                .publish(
                    &topic,
                    &OutboundEvent::error(ErrorCode::UpstreamFailure, err.to_string()),
                )
                .await;
            self.inner.registry.remove_topic(&topic).await;
            self.inner.aggregator.remove_topic(&topic).await;
        }

        if caps.can_unwatch(topic.kind()) {
            if let Err(err) = client.unwatch(topic.kind(), topic.symbols()).await {
                tracing::warn!(topic = %topic, error = %err, "upstream unwatch failed");
            }
        }
        tracing::info!(topic = %topic, "watcher stopped");
    }
}

async fn read_upstream(client: &dyn ExchangeClient, topic: &Topic) -> Result<Reading, ExchangeError> {
    let symbols = topic.symbols();
    match topic.kind() {
        StreamKind::Ticker if symbols.len() == 1 => client
            .watch_ticker(&symbols[0])
            .await
            .map(|t| Reading::Publish(OutboundEvent::Ticker(t))),
        StreamKind::Ticker => client
            .watch_tickers(symbols)
            .await
            .map(|t| Reading::Publish(OutboundEvent::Tickers(t))),
        StreamKind::OrderBook if symbols.len() == 1 => client
            .watch_order_book(&symbols[0])
            .await
            .map(|b| Reading::Publish(OutboundEvent::OrderBook(b))),
        StreamKind::OrderBook => client
            .watch_order_book_for_symbols(symbols)
            .await
            .map(|b| Reading::Publish(OutboundEvent::OrderBooks(b))),
        StreamKind::Ohlcv => client.watch_trades(&symbols[0]).await.map(Reading::Trades),
        StreamKind::Balance => client
            .watch_balance()
            .await
            .map(|b| Reading::Publish(OutboundEvent::Balance(b))),
        StreamKind::Orders => client
            .watch_orders(symbols.first().map(String::as_str))
            .await
            .map(|o| Reading::Publish(OutboundEvent::Orders(o))),
        StreamKind::MyTrades => client
            .watch_my_trades(symbols.first().map(String::as_str))
            .await
            .map(|t| Reading::Publish(OutboundEvent::MyTrades(t))),
        StreamKind::Positions => client
            .watch_positions(if symbols.is_empty() {
                None
            } else {
                Some(symbols)
            })
            .await
            .map(|p| Reading::Publish(OutboundEvent::Positions(p))),
    }
}
