use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamgate_core::{
    Capabilities, CandleUpdate, Credentials, ErrorCode, ExchangeError, OutboundEvent, StreamKind,
    SubscriberId, Ticker, Timeframe, Topic, Trade, Transport, UserId,
};
use streamgate_engine::{EngineConfig, StreamEngine, SubscribeError};
use streamgate_exchanges::{ScriptedExchange, ScriptedExchangeFactory};

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Recorded {
    Publish {
        room: String,
        event: OutboundEvent,
    },
    Send {
        subscriber: SubscriberId,
        room: String,
        event: OutboundEvent,
    },
}

/// Transport double that records every delivery.
#[derive(Default)]
struct RecordingTransport {
    events: Mutex<Vec<Recorded>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn publish(&self, room: &str, event: &OutboundEvent) {
        self.events.lock().unwrap().push(Recorded::Publish {
            room: room.to_string(),
            event: event.clone(),
        });
    }

    async fn send(&self, subscriber: &SubscriberId, room: &str, event: &OutboundEvent) {
        self.events.lock().unwrap().push(Recorded::Send {
            subscriber: *subscriber,
            room: room.to_string(),
            event: event.clone(),
        });
    }
}

impl RecordingTransport {
    fn snapshot(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    async fn wait_until(&self, what: &str, predicate: impl Fn(&[Recorded]) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if predicate(&self.events.lock().unwrap()) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}; recorded: {:?}",
                self.snapshot()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

async fn wait_for<F, Fut>(what: &str, predicate: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

struct Harness {
    engine: StreamEngine,
    transport: Arc<RecordingTransport>,
    exchange: Arc<ScriptedExchange>,
}

fn harness(exchange: ScriptedExchange) -> Harness {
    let exchange = Arc::new(exchange);
    let factory = Arc::new(ScriptedExchangeFactory::new());
    factory.register(exchange.clone());
    let transport = Arc::new(RecordingTransport::default());
    let engine = StreamEngine::new(factory, transport.clone(), EngineConfig::default());
    Harness {
        engine,
        transport,
        exchange,
    }
}

fn ticker(symbol: &str, last: i64) -> Ticker {
    Ticker {
        symbol: symbol.to_string(),
        timestamp: Utc::now(),
        bid: None,
        ask: None,
        last: Some(last.into()),
        base_volume: None,
        quote_volume: None,
    }
}

fn trade(id: &str, ms: i64, price: i64) -> Trade {
    Trade {
        id: Some(id.to_string()),
        symbol: "BTC/USDT".to_string(),
        timestamp: Utc.timestamp_millis_opt(ms).unwrap(),
        side: None,
        price: price.into(),
        amount: dec!(1),
    }
}

fn btc_ticker_topic() -> Topic {
    Topic::public(StreamKind::Ticker, "binance", vec!["BTC/USDT".to_string()]).unwrap()
}

fn btc_ohlcv_topic() -> Topic {
    Topic::public(StreamKind::Ohlcv, "binance", vec!["BTC/USDT".to_string()]).unwrap()
}

fn ticker_publishes(events: &[Recorded], room: &str) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(e, Recorded::Publish { room: r, event: OutboundEvent::Ticker(_) } if r == room)
        })
        .count()
}

fn candle_sends(events: &[Recorded], subscriber: &SubscriberId) -> Vec<CandleUpdate> {
    events
        .iter()
        .filter_map(|e| match e {
            Recorded::Send {
                subscriber: s,
                event: OutboundEvent::Ohlcv(update),
                ..
            } if s == subscriber => Some(update.clone()),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_two_subscribers_share_one_ticker_watcher() {
    let h = harness(ScriptedExchange::new("binance"));
    let topic = btc_ticker_topic();
    let room = topic.room_name();
    let a = SubscriberId::new();
    let b = SubscriberId::new();

    h.exchange.push_ticker(ticker("BTC/USDT", 100));
    h.engine.subscribe(a, topic.clone(), None).await.unwrap();
    h.transport
        .wait_until("first ticker publish", |e| ticker_publishes(e, &room) >= 1)
        .await;
    assert_eq!(h.engine.active_watcher_count().await, 1);

    // Second subscriber rides the same watcher.
    h.engine.subscribe(b, topic.clone(), None).await.unwrap();
    assert_eq!(h.engine.active_watcher_count().await, 1);
    assert_eq!(h.engine.active_topic_count().await, 1);

    // One upstream update, one room-level publish shared by both.
    h.exchange.push_ticker(ticker("BTC/USDT", 101));
    h.transport
        .wait_until("second ticker publish", |e| ticker_publishes(e, &room) >= 2)
        .await;
    assert_eq!(ticker_publishes(&h.transport.snapshot(), &room), 2);

    // First unsubscribe leaves the topic alive.
    h.engine.unsubscribe(&a, &topic).await;
    assert_eq!(h.engine.active_topic_count().await, 1);
    assert_eq!(h.engine.active_watcher_count().await, 1);

    // Last unsubscribe removes the topic and stops the watcher, which
    // releases the upstream subscription on its way out.
    h.engine.unsubscribe(&b, &topic).await;
    assert_eq!(h.engine.active_topic_count().await, 0);
    wait_for("upstream unwatch", || async {
        !h.exchange.unwatch_calls().is_empty()
    })
    .await;
    assert_eq!(
        h.exchange.unwatch_calls(),
        vec![(StreamKind::Ticker, vec!["BTC/USDT".to_string()])]
    );
    assert_eq!(h.engine.active_watcher_count().await, 0);
}

#[tokio::test]
async fn test_concurrent_subscribes_start_exactly_one_watcher() {
    let h = harness(ScriptedExchange::new("binance"));
    let engine = Arc::new(h.engine);
    let topic = btc_ticker_topic();

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let engine = engine.clone();
            let topic = topic.clone();
            tokio::spawn(async move { engine.subscribe(SubscriberId::new(), topic, None).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(engine.active_watcher_count().await, 1);
    assert_eq!(engine.registry().subscriber_count(&topic).await, 10);
}

#[tokio::test]
async fn test_unsupported_stream_fails_subscribe_and_leaves_no_state() {
    let exchange = ScriptedExchange::with_capabilities(
        "binance",
        Capabilities {
            streams: [StreamKind::Ticker].into_iter().collect(),
            ..Default::default()
        },
    );
    let h = harness(exchange);
    let topic =
        Topic::public(StreamKind::OrderBook, "binance", vec!["BTC/USDT".to_string()]).unwrap();

    let err = h
        .engine
        .subscribe(SubscriberId::new(), topic, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SubscribeError::UnsupportedStream { .. }));
    assert_eq!(err.code(), ErrorCode::UnsupportedStream);
    assert_eq!(h.engine.active_topic_count().await, 0);
    assert_eq!(h.engine.active_watcher_count().await, 0);
}

#[tokio::test]
async fn test_private_topic_requires_established_session() {
    let h = harness(ScriptedExchange::new("kraken"));
    let user = UserId::from("u1");
    let topic = Topic::private(StreamKind::Balance, "kraken", vec![], user.clone()).unwrap();
    let sub = SubscriberId::new();

    let err = h
        .engine
        .subscribe(sub, topic.clone(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SubscribeError::MissingSession { .. }));
    assert_eq!(h.engine.active_watcher_count().await, 0);

    // After the trading connection is established the same subscribe
    // succeeds and the balance stream flows.
    let credentials = Credentials {
        api_key: "key".to_string(),
        secret: "secret".to_string(),
        password: None,
    };
    h.engine
        .connect_exchange(&user, "kraken", &credentials)
        .await
        .unwrap();
    h.exchange.push_balance(streamgate_core::BalanceSnapshot {
        timestamp: Utc::now(),
        balances: Default::default(),
    });
    h.engine.subscribe(sub, topic.clone(), None).await.unwrap();
    h.transport
        .wait_until("balance publish", |events| {
            events.iter().any(|e| {
                matches!(
                    e,
                    Recorded::Publish { room, event: OutboundEvent::Balance(_) }
                        if room == "private:u1:balance:kraken"
                )
            })
        })
        .await;

    h.engine.unsubscribe(&sub, &topic).await;
    assert!(h.engine.disconnect_exchange(&user, "kraken").await);
    wait_for("private connection closed", || async {
        h.exchange.close_calls() == 1
    })
    .await;
}

#[tokio::test]
async fn test_ohlcv_candles_per_subscriber_with_timeframe_switch() {
    let h = harness(ScriptedExchange::new("binance"));
    let topic = btc_ohlcv_topic();
    let sub = SubscriberId::new();
    const MIN: i64 = 60_000;

    h.engine
        .subscribe(sub, topic.clone(), Some(Timeframe::parse("1m").unwrap()))
        .await
        .unwrap();
    h.exchange
        .push_trades(vec![trade("1", 1_000, 100), trade("2", MIN + 1_000, 101)]);
    h.transport
        .wait_until("1m candle emissions", |e| candle_sends(e, &sub).len() >= 2)
        .await;
    let updates = candle_sends(&h.transport.snapshot(), &sub);
    assert!(updates[0].closed);
    assert_eq!(updates[0].candle.timestamp.timestamp_millis(), 0);
    assert!(!updates[1].closed);
    assert_eq!(updates[1].candle.timestamp.timestamp_millis(), MIN);

    // Re-subscribing at 5m switches the stream; later emissions bucket on
    // the new timeframe only and the old closed markers do not replay.
    h.engine
        .subscribe(sub, topic.clone(), Some(Timeframe::parse("5m").unwrap()))
        .await
        .unwrap();
    assert_eq!(h.engine.active_watcher_count().await, 1);
    let before = candle_sends(&h.transport.snapshot(), &sub).len();
    h.exchange.push_trades(vec![trade("3", MIN + 2_000, 102)]);
    h.transport
        .wait_until("5m candle emission", |e| candle_sends(e, &sub).len() > before)
        .await;
    let updates = candle_sends(&h.transport.snapshot(), &sub);
    let after = &updates[before..];
    assert!(after.iter().all(|u| !u.closed));
    assert!(after
        .iter()
        .all(|u| u.candle.timestamp.timestamp_millis() % (5 * MIN) == 0));
}

#[tokio::test]
async fn test_same_timeframe_subscribers_get_identical_candles() {
    let h = harness(ScriptedExchange::new("binance"));
    let topic = btc_ohlcv_topic();
    let a = SubscriberId::new();
    let b = SubscriberId::new();
    const MIN: i64 = 60_000;

    for sub in [a, b] {
        h.engine
            .subscribe(sub, topic.clone(), Some(Timeframe::parse("1m").unwrap()))
            .await
            .unwrap();
    }
    h.exchange
        .push_trades(vec![trade("1", 1_000, 100), trade("2", MIN + 1_000, 101)]);
    h.transport
        .wait_until("candles for both subscribers", |e| {
            candle_sends(e, &a).len() >= 2 && candle_sends(e, &b).len() >= 2
        })
        .await;

    let events = h.transport.snapshot();
    let summary = |sub: &SubscriberId| {
        candle_sends(&events, sub)
            .iter()
            .map(|u| (u.candle.clone(), u.closed))
            .collect::<Vec<_>>()
    };
    assert_eq!(summary(&a), summary(&b));
}

#[tokio::test]
async fn test_fatal_upstream_error_tears_topic_down_once() {
    let h = harness(ScriptedExchange::new("binance"));
    let topic = btc_ticker_topic();
    let room = topic.room_name();
    let sub = SubscriberId::new();

    h.exchange.push_ticker(ticker("BTC/USDT", 100));
    h.exchange
        .push_ticker_error(ExchangeError::ConnectionLost("stream reset".to_string()));
    h.engine.subscribe(sub, topic.clone(), None).await.unwrap();

    h.transport
        .wait_until("upstream failure event", |events| {
            events.iter().any(|e| {
                matches!(e, Recorded::Publish { room: r, event: OutboundEvent::Error(err) }
                    if r == &room && err.code == ErrorCode::UpstreamFailure)
            })
        })
        .await;
    wait_for("topic teardown", || async {
        h.engine.active_topic_count().await == 0 && h.engine.active_watcher_count().await == 0
    })
    .await;

    // No automatic restart: a fresh subscribe is what brings it back.
    h.exchange.push_ticker(ticker("BTC/USDT", 102));
    h.engine.subscribe(sub, topic.clone(), None).await.unwrap();
    assert_eq!(h.engine.active_watcher_count().await, 1);
}

#[tokio::test]
async fn test_transient_upstream_error_keeps_the_loop_running() {
    let h = harness(ScriptedExchange::new("binance"));
    let topic = btc_ticker_topic();
    let room = topic.room_name();
    let sub = SubscriberId::new();

    h.exchange.push_ticker(ticker("BTC/USDT", 100));
    h.exchange
        .push_ticker_error(ExchangeError::Transient("timeout".to_string()));
    h.exchange.push_ticker(ticker("BTC/USDT", 101));
    h.engine.subscribe(sub, topic.clone(), None).await.unwrap();

    h.transport
        .wait_until("publish after transient error", |e| {
            ticker_publishes(e, &room) >= 2
        })
        .await;
    assert_eq!(h.engine.active_watcher_count().await, 1);
    // The transient failure never surfaced to subscribers.
    assert!(!h
        .transport
        .snapshot()
        .iter()
        .any(|e| matches!(e, Recorded::Publish { event: OutboundEvent::Error(_), .. })));
}

#[tokio::test]
async fn test_disconnect_releases_every_subscription() {
    let h = harness(ScriptedExchange::new("binance"));
    let ticker_topic = btc_ticker_topic();
    let ohlcv_topic = btc_ohlcv_topic();
    let a = SubscriberId::new();
    let b = SubscriberId::new();

    h.engine
        .subscribe(a, ticker_topic.clone(), None)
        .await
        .unwrap();
    h.engine
        .subscribe(a, ohlcv_topic.clone(), Some(Timeframe::parse("1m").unwrap()))
        .await
        .unwrap();
    h.engine.subscribe(b, ticker_topic.clone(), None).await.unwrap();
    assert_eq!(h.engine.active_topic_count().await, 2);

    h.engine.disconnect(&a).await;
    // The shared ticker topic survives via b; the ohlcv topic is gone.
    assert_eq!(h.engine.active_topic_count().await, 1);
    assert!(h.engine.registry().has_subscribers(&ticker_topic).await);
    assert!(!h.engine.registry().has_subscribers(&ohlcv_topic).await);
    wait_for("ohlcv watcher stopped", || async {
        h.engine.active_watcher_count().await == 1
    })
    .await;
}
