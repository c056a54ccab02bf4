use chrono::DateTime;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use streamgate_core::{Candle, CandleUpdate, SubscriberId, Timeframe, Topic, Trade};
use tokio::sync::Mutex;

/// How many candles of the largest requested timeframe the trade history
/// retains, measured back from the newest trade.
const HISTORY_CANDLES: i64 = 100;

struct SubscriberState {
    timeframe: Timeframe,
    /// Bucket timestamp of the newest candle emitted `closed=true` to this
    /// subscriber; closed candles are emitted exactly once per timestamp.
    last_closed_ms: Option<i64>,
}

#[derive(Default)]
struct TopicState {
    trades: VecDeque<Trade>,
    subscribers: HashMap<SubscriberId, SubscriberState>,
}

impl TopicState {
    fn append_new_trades(&mut self, incoming: Vec<Trade>) {
        for trade in incoming {
            if self.is_new(&trade) {
                self.trades.push_back(trade);
            }
        }
    }

    /// Streaming trade reads overlap batch boundaries; keep a trade only
    /// if it is strictly newer than the history tail, or carries an id not
    /// yet seen at the tail timestamp.
    fn is_new(&self, trade: &Trade) -> bool {
        let Some(last) = self.trades.back() else {
            return true;
        };
        let ms = trade.timestamp.timestamp_millis();
        let last_ms = last.timestamp.timestamp_millis();
        if ms != last_ms {
            return ms > last_ms;
        }
        match &trade.id {
            Some(id) => self
                .trades
                .iter()
                .rev()
                .take_while(|t| t.timestamp.timestamp_millis() == ms)
                .all(|t| t.id.as_deref() != Some(id.as_str())),
            None => false,
        }
    }

    fn prune(&mut self, max_timeframe_ms: i64) {
        let Some(newest) = self.trades.back() else {
            return;
        };
        let min_ms = newest.timestamp.timestamp_millis() - max_timeframe_ms * HISTORY_CANDLES;
        while self
            .trades
            .front()
            .is_some_and(|t| t.timestamp.timestamp_millis() < min_ms)
        {
            self.trades.pop_front();
        }
    }
}

/// Build the candle sequence for one timeframe from a time-ordered trade
/// history. Bucket boundaries are integer multiples of the timeframe
/// duration in epoch milliseconds; all candles but the last cover complete
/// buckets.
pub fn build_candles<'a>(
    trades: impl IntoIterator<Item = &'a Trade>,
    timeframe_ms: i64,
) -> Vec<Candle> {
    let mut candles: Vec<Candle> = Vec::new();
    for trade in trades {
        let ms = trade.timestamp.timestamp_millis();
        let bucket_ms = ms - ms.rem_euclid(timeframe_ms);
        match candles.last_mut() {
            Some(candle) if candle.timestamp.timestamp_millis() == bucket_ms => {
                candle.high = candle.high.max(trade.price);
                candle.low = candle.low.min(trade.price);
                candle.close = trade.price;
                candle.volume += trade.amount;
            }
            _ => {
                let Some(timestamp) = DateTime::from_timestamp_millis(bucket_ms) else {
                    continue;
                };
                candles.push(Candle {
                    timestamp,
                    open: trade.price,
                    high: trade.price,
                    low: trade.price,
                    close: trade.price,
                    volume: trade.amount,
                });
            }
        }
    }
    candles
}

/// Derives per-subscriber candle streams from the raw trades of a shared
/// OHLCV watcher.
///
/// One trade history is kept per topic and one candle sequence is built
/// per distinct timeframe, no matter how many subscribers requested it.
/// Closed candles are emitted once per subscriber; the in-progress candle
/// is re-emitted on every batch.
///
/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct CandleAggregator {
    topics: Arc<Mutex<HashMap<Topic, TopicState>>>,
}

impl CandleAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or change) a subscriber's requested timeframe for a topic.
    ///
    /// A changed timeframe resets the subscriber's emission marker, as a
    /// logical re-subscribe; re-requesting the current timeframe keeps it,
    /// so no closed candle is delivered twice.
    pub async fn set_timeframe(&self, topic: &Topic, subscriber: SubscriberId, timeframe: Timeframe) {
        let mut topics = self.topics.lock().await;
        let state = topics.entry(topic.clone()).or_default();
        match state.subscribers.get_mut(&subscriber) {
            Some(existing) if existing.timeframe == timeframe => {}
            _ => {
                state.subscribers.insert(
                    subscriber,
                    SubscriberState {
                        timeframe,
                        last_closed_ms: None,
                    },
                );
            }
        }
    }

    pub async fn remove_subscriber(&self, topic: &Topic, subscriber: &SubscriberId) {
        let mut topics = self.topics.lock().await;
        if let Some(state) = topics.get_mut(topic) {
            state.subscribers.remove(subscriber);
        }
    }

    pub async fn remove_topic(&self, topic: &Topic) {
        self.topics.lock().await.remove(topic);
    }

    /// Fold a batch of raw trades into the topic's history and derive the
    /// candle emissions due to each subscriber.
    pub async fn ingest(
        &self,
        topic: &Topic,
        trades: Vec<Trade>,
    ) -> Vec<(SubscriberId, CandleUpdate)> {
        let mut topics = self.topics.lock().await;
        let Some(state) = topics.get_mut(topic) else {
            return Vec::new();
        };
        state.append_new_trades(trades);
        if state.trades.is_empty() || state.subscribers.is_empty() {
            return Vec::new();
        }

        let max_timeframe_ms = state
            .subscribers
            .values()
            .map(|s| s.timeframe.duration_ms())
            .max()
            .unwrap_or_default();
        state.prune(max_timeframe_ms);

        let mut groups: HashMap<Timeframe, Vec<SubscriberId>> = HashMap::new();
        for (id, sub) in &state.subscribers {
            groups.entry(sub.timeframe.clone()).or_default().push(*id);
        }

        let mut emissions = Vec::new();
        for (timeframe, subscribers) in groups {
            // One sequence per timeframe, shared by every subscriber that
            // requested it.
            let candles = build_candles(state.trades.iter(), timeframe.duration_ms());
            let Some((in_progress, closed)) = candles.split_last() else {
                continue;
            };
            for id in subscribers {
                let Some(sub) = state.subscribers.get_mut(&id) else {
                    continue;
                };
                for candle in closed {
                    let ms = candle.timestamp.timestamp_millis();
                    if sub.last_closed_ms.map_or(true, |last| ms > last) {
                        emissions.push((
                            id,
                            CandleUpdate {
                                candle: candle.clone(),
                                closed: true,
                            },
                        ));
                        sub.last_closed_ms = Some(ms);
                    }
                }
                emissions.push((
                    id,
                    CandleUpdate {
                        candle: in_progress.clone(),
                        closed: false,
                    },
                ));
            }
        }
        emissions
    }
}
