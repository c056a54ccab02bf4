use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamgate_core::{
    AssetBalance, BalanceSnapshot, Capabilities, Credentials, ExchangeClient,
    ExchangeClientFactory, ExchangeError, OrderBook, OrderStatus, OrderUpdate, PositionUpdate,
    PriceLevel, Side, StreamKind, Ticker, Trade,
};
use tokio::time::sleep;

/// Configuration for the simulated exchange feed.
#[derive(Debug, Clone)]
pub struct SimulatedExchangeConfig {
    /// Delay between consecutive stream updates.
    pub tick_interval: Duration,
    /// Starting price for every symbol's random walk.
    pub initial_price: Decimal,
    /// Maximum per-tick move, in basis points of the current price.
    pub volatility_bps: i64,
    /// Seed for the per-symbol walk; a fixed seed makes runs reproducible.
    pub seed: u64,
    /// Price levels per order book side.
    pub book_depth: usize,
}

impl Default for SimulatedExchangeConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(250),
            initial_price: Decimal::new(100, 0),
            volatility_bps: 20,
            seed: 42,
            book_depth: 10,
        }
    }
}

struct MarketState {
    rng: StdRng,
    price: Decimal,
}

/// An exchange connection backed by a deterministic random walk instead
/// of a real upstream, for demo serving and local development.
///
/// A handle created without credentials streams public market data; one
/// created with credentials also serves the account streams with
/// synthetic balances, orders, and positions.
pub struct SimulatedExchange {
    id: String,
    config: SimulatedExchangeConfig,
    capabilities: Capabilities,
    markets: Mutex<HashMap<String, MarketState>>,
    trade_seq: AtomicU64,
}

impl SimulatedExchange {
    pub fn new(id: &str, config: SimulatedExchangeConfig, private: bool) -> Self {
        let mut streams: Vec<StreamKind> = vec![
            StreamKind::Ticker,
            StreamKind::OrderBook,
            StreamKind::Ohlcv,
        ];
        if private {
            streams.extend([
                StreamKind::Balance,
                StreamKind::Orders,
                StreamKind::MyTrades,
                StreamKind::Positions,
            ]);
        }
        let capabilities = Capabilities {
            streams: streams.iter().copied().collect(),
            multi_symbol: [StreamKind::Ticker, StreamKind::OrderBook]
                .into_iter()
                .collect(),
            unwatch: streams.into_iter().collect(),
        };
        Self {
            id: id.to_string(),
            config,
            capabilities,
            markets: Mutex::new(HashMap::new()),
            trade_seq: AtomicU64::new(0),
        }
    }

    /// Advance the symbol's walk one step and return the new price.
    fn step(&self, symbol: &str) -> Decimal {
        let mut markets = self.markets.lock().expect("market state poisoned");
        let state = markets.entry(symbol.to_string()).or_insert_with(|| {
            let mut hasher = DefaultHasher::new();
            symbol.hash(&mut hasher);
            MarketState {
                rng: StdRng::seed_from_u64(self.config.seed ^ hasher.finish()),
                price: self.config.initial_price,
            }
        });
        let bps = state
            .rng
            .gen_range(-self.config.volatility_bps..=self.config.volatility_bps);
        let next = state.price + state.price * Decimal::new(bps, 4);
        if next > Decimal::ZERO {
            state.price = next;
        }
        state.price
    }

    fn amount(&self, symbol: &str) -> Decimal {
        let mut markets = self.markets.lock().expect("market state poisoned");
        match markets.get_mut(symbol) {
            Some(state) => Decimal::new(state.rng.gen_range(1..=500), 2),
            None => Decimal::ONE,
        }
    }

    fn ticker(&self, symbol: &str) -> Ticker {
        let price = self.step(symbol);
        let spread = price * Decimal::new(1, 4);
        Ticker {
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            bid: Some(price - spread),
            ask: Some(price + spread),
            last: Some(price),
            base_volume: Some(self.amount(symbol) * Decimal::new(100, 0)),
            quote_volume: None,
        }
    }

    fn order_book(&self, symbol: &str) -> OrderBook {
        let price = self.step(symbol);
        let step = price * Decimal::new(1, 4);
        let mut bids = Vec::with_capacity(self.config.book_depth);
        let mut asks = Vec::with_capacity(self.config.book_depth);
        for i in 1..=self.config.book_depth {
            let offset = step * Decimal::from(i as i64);
            bids.push(PriceLevel {
                price: price - offset,
                amount: self.amount(symbol),
            });
            asks.push(PriceLevel {
                price: price + offset,
                amount: self.amount(symbol),
            });
        }
        OrderBook {
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            bids,
            asks,
        }
    }

    fn trades(&self, symbol: &str) -> Vec<Trade> {
        let count = {
            let mut markets = self.markets.lock().expect("market state poisoned");
            match markets.get_mut(symbol) {
                Some(state) => state.rng.gen_range(1..=3),
                None => 1,
            }
        };
        (0..count)
            .map(|_| {
                let price = self.step(symbol);
                let seq = self.trade_seq.fetch_add(1, Ordering::Relaxed);
                Trade {
                    id: Some(format!("sim-{seq}")),
                    symbol: symbol.to_string(),
                    timestamp: Utc::now(),
                    side: Some(if seq % 2 == 0 { Side::Buy } else { Side::Sell }),
                    price,
                    amount: self.amount(symbol),
                }
            })
            .collect()
    }
}

#[async_trait]
impl ExchangeClient for SimulatedExchange {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn load_markets(&self) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn watch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        sleep(self.config.tick_interval).await;
        Ok(self.ticker(symbol))
    }

    async fn watch_tickers(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, Ticker>, ExchangeError> {
        sleep(self.config.tick_interval).await;
        Ok(symbols
            .iter()
            .map(|s| (s.clone(), self.ticker(s)))
            .collect())
    }

    async fn watch_order_book(&self, symbol: &str) -> Result<OrderBook, ExchangeError> {
        sleep(self.config.tick_interval).await;
        Ok(self.order_book(symbol))
    }

    async fn watch_order_book_for_symbols(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, OrderBook>, ExchangeError> {
        sleep(self.config.tick_interval).await;
        Ok(symbols
            .iter()
            .map(|s| (s.clone(), self.order_book(s)))
            .collect())
    }

    async fn watch_trades(&self, symbol: &str) -> Result<Vec<Trade>, ExchangeError> {
        sleep(self.config.tick_interval).await;
        Ok(self.trades(symbol))
    }

    async fn watch_balance(&self) -> Result<BalanceSnapshot, ExchangeError> {
        sleep(self.config.tick_interval * 4).await;
        let jitter = self.amount("USDT");
        let mut balances = HashMap::new();
        balances.insert(
            "USDT".to_string(),
            AssetBalance {
                free: Decimal::new(10_000, 0) + jitter,
                used: Decimal::new(2_500, 0),
                total: Decimal::new(12_500, 0) + jitter,
            },
        );
        balances.insert(
            "BTC".to_string(),
            AssetBalance {
                free: Decimal::new(5, 1),
                used: Decimal::ZERO,
                total: Decimal::new(5, 1),
            },
        );
        Ok(BalanceSnapshot {
            timestamp: Utc::now(),
            balances,
        })
    }

    async fn watch_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderUpdate>, ExchangeError> {
        sleep(self.config.tick_interval * 8).await;
        let symbol = symbol.unwrap_or("BTC/USDT");
        let price = self.step(symbol);
        let seq = self.trade_seq.fetch_add(1, Ordering::Relaxed);
        Ok(vec![OrderUpdate {
            id: format!("sim-order-{seq}"),
            symbol: symbol.to_string(),
            side: if seq % 2 == 0 { Side::Buy } else { Side::Sell },
            price: Some(price),
            amount: Decimal::ONE,
            filled: if seq % 3 == 0 { Decimal::ONE } else { Decimal::ZERO },
            status: if seq % 3 == 0 {
                OrderStatus::Closed
            } else {
                OrderStatus::Open
            },
            timestamp: Utc::now(),
        }])
    }

    async fn watch_my_trades(&self, symbol: Option<&str>) -> Result<Vec<Trade>, ExchangeError> {
        sleep(self.config.tick_interval * 8).await;
        Ok(self.trades(symbol.unwrap_or("BTC/USDT")))
    }

    async fn watch_positions(
        &self,
        symbols: Option<&[String]>,
    ) -> Result<Vec<PositionUpdate>, ExchangeError> {
        sleep(self.config.tick_interval * 4).await;
        let default = ["BTC/USDT".to_string()];
        let symbols = symbols.filter(|s| !s.is_empty()).unwrap_or(&default);
        Ok(symbols
            .iter()
            .map(|symbol| {
                let price = self.step(symbol);
                PositionUpdate {
                    symbol: symbol.clone(),
                    side: Side::Buy,
                    contracts: Decimal::ONE,
                    entry_price: Some(self.config.initial_price),
                    unrealized_pnl: Some(price - self.config.initial_price),
                    timestamp: Utc::now(),
                }
            })
            .collect())
    }
}

/// Creates [`SimulatedExchange`] handles for any exchange id, or only the
/// ids it was restricted to.
pub struct SimulatedExchangeFactory {
    config: SimulatedExchangeConfig,
    known: Option<Vec<String>>,
}

impl SimulatedExchangeFactory {
    pub fn new(config: SimulatedExchangeConfig) -> Self {
        Self {
            config,
            known: None,
        }
    }

    /// Restrict the factory to a fixed set of exchange ids; anything else
    /// fails with an unknown-exchange error.
    pub fn with_exchanges(mut self, exchanges: impl IntoIterator<Item = String>) -> Self {
        self.known = Some(exchanges.into_iter().map(|e| e.to_lowercase()).collect());
        self
    }
}

impl Default for SimulatedExchangeFactory {
    fn default() -> Self {
        Self::new(SimulatedExchangeConfig::default())
    }
}

#[async_trait]
impl ExchangeClientFactory for SimulatedExchangeFactory {
    async fn create(
        &self,
        exchange_id: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn ExchangeClient>, ExchangeError> {
        if let Some(known) = &self.known {
            if !known.iter().any(|k| k == exchange_id) {
                return Err(ExchangeError::UnknownExchange(exchange_id.to_string()));
            }
        }
        Ok(Arc::new(SimulatedExchange::new(
            exchange_id,
            self.config.clone(),
            credentials.is_some(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> SimulatedExchangeConfig {
        SimulatedExchangeConfig {
            tick_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_walk_is_deterministic_per_seed() {
        let a = SimulatedExchange::new("binance", fast_config(), false);
        let b = SimulatedExchange::new("binance", fast_config(), false);
        let walk_a: Vec<Decimal> = (0..10).map(|_| a.step("BTC/USDT")).collect();
        let walk_b: Vec<Decimal> = (0..10).map(|_| b.step("BTC/USDT")).collect();
        assert_eq!(walk_a, walk_b);
        // A different symbol walks differently.
        let walk_c: Vec<Decimal> = (0..10).map(|_| a.step("ETH/USDT")).collect();
        assert_ne!(walk_a, walk_c);
    }

    #[test]
    fn test_private_handles_advertise_account_streams() {
        let public = SimulatedExchange::new("binance", fast_config(), false);
        let private = SimulatedExchange::new("binance", fast_config(), true);
        assert!(!public.capabilities().supports(StreamKind::Balance));
        assert!(private.capabilities().supports(StreamKind::Balance));
        assert!(private.capabilities().supports(StreamKind::Positions));
        assert!(public.capabilities().supports(StreamKind::Ticker));
        assert!(public.capabilities().supports_multi(StreamKind::Ticker));
    }

    #[tokio::test]
    async fn test_trades_carry_unique_increasing_ids() {
        let exchange = SimulatedExchange::new("binance", fast_config(), false);
        let first = exchange.watch_trades("BTC/USDT").await.unwrap();
        let second = exchange.watch_trades("BTC/USDT").await.unwrap();
        let mut ids: Vec<String> = first
            .iter()
            .chain(second.iter())
            .filter_map(|t| t.id.clone())
            .collect();
        let len = ids.len();
        ids.dedup();
        assert_eq!(ids.len(), len);
    }

    #[tokio::test]
    async fn test_factory_rejects_unknown_exchange() {
        let factory = SimulatedExchangeFactory::new(fast_config())
            .with_exchanges(["binance".to_string(), "kraken".to_string()]);
        assert!(factory.create("binance", None).await.is_ok());
        assert!(matches!(
            factory.create("bitmex", None).await,
            Err(ExchangeError::UnknownExchange(_))
        ));
    }

    #[tokio::test]
    async fn test_order_book_sides_are_sorted_best_first() {
        let exchange = SimulatedExchange::new("binance", fast_config(), false);
        let book = exchange.watch_order_book("BTC/USDT").await.unwrap();
        assert!(book.bids.windows(2).all(|w| w[0].price >= w[1].price));
        assert!(book.asks.windows(2).all(|w| w[0].price <= w[1].price));
    }
}
