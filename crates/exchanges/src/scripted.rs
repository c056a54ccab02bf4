use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use streamgate_core::{
    BalanceSnapshot, Capabilities, Credentials, ExchangeClient, ExchangeClientFactory,
    ExchangeError, OrderBook, OrderUpdate, PositionUpdate, StreamKind, Ticker, Trade,
};
use tokio::sync::Notify;

/// A queue of scripted stream results. `next` suspends while the queue is
/// empty, like a real upstream read with no fresh data.
struct Feed<T> {
    queue: Mutex<VecDeque<Result<T, ExchangeError>>>,
    notify: Notify,
}

impl<T> Default for Feed<T> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

impl<T> Feed<T> {
    fn push(&self, item: Result<T, ExchangeError>) {
        self.queue.lock().expect("feed poisoned").push_back(item);
        self.notify.notify_one();
    }

    async fn next(&self) -> Result<T, ExchangeError> {
        loop {
            if let Some(item) = self.queue.lock().expect("feed poisoned").pop_front() {
                return item;
            }
            self.notify.notified().await;
        }
    }
}

/// An exchange connection that replays exactly the responses a test
/// scripted for it, and records the unwatch/close calls made against it.
pub struct ScriptedExchange {
    id: String,
    capabilities: Capabilities,
    tickers: Feed<Ticker>,
    ticker_maps: Feed<HashMap<String, Ticker>>,
    order_books: Feed<OrderBook>,
    order_book_maps: Feed<HashMap<String, OrderBook>>,
    trades: Feed<Vec<Trade>>,
    balances: Feed<BalanceSnapshot>,
    orders: Feed<Vec<OrderUpdate>>,
    my_trades: Feed<Vec<Trade>>,
    positions: Feed<Vec<PositionUpdate>>,
    unwatch_calls: Mutex<Vec<(StreamKind, Vec<String>)>>,
    close_calls: Mutex<usize>,
}

impl ScriptedExchange {
    /// A scripted exchange advertising every stream kind, with unwatch
    /// support across the board.
    pub fn new(id: &str) -> Self {
        let all = [
            StreamKind::Ticker,
            StreamKind::OrderBook,
            StreamKind::Ohlcv,
            StreamKind::Balance,
            StreamKind::Orders,
            StreamKind::MyTrades,
            StreamKind::Positions,
        ];
        Self::with_capabilities(
            id,
            Capabilities {
                streams: all.into_iter().collect(),
                multi_symbol: [StreamKind::Ticker, StreamKind::OrderBook]
                    .into_iter()
                    .collect(),
                unwatch: all.into_iter().collect(),
            },
        )
    }

    pub fn with_capabilities(id: &str, capabilities: Capabilities) -> Self {
        Self {
            id: id.to_string(),
            capabilities,
            tickers: Feed::default(),
            ticker_maps: Feed::default(),
            order_books: Feed::default(),
            order_book_maps: Feed::default(),
            trades: Feed::default(),
            balances: Feed::default(),
            orders: Feed::default(),
            my_trades: Feed::default(),
            positions: Feed::default(),
            unwatch_calls: Mutex::new(Vec::new()),
            close_calls: Mutex::new(0),
        }
    }

    pub fn push_ticker(&self, ticker: Ticker) {
        self.tickers.push(Ok(ticker));
    }

    pub fn push_ticker_error(&self, error: ExchangeError) {
        self.tickers.push(Err(error));
    }

    pub fn push_tickers(&self, tickers: HashMap<String, Ticker>) {
        self.ticker_maps.push(Ok(tickers));
    }

    pub fn push_order_book(&self, book: OrderBook) {
        self.order_books.push(Ok(book));
    }

    pub fn push_order_books(&self, books: HashMap<String, OrderBook>) {
        self.order_book_maps.push(Ok(books));
    }

    pub fn push_trades(&self, trades: Vec<Trade>) {
        self.trades.push(Ok(trades));
    }

    pub fn push_trades_error(&self, error: ExchangeError) {
        self.trades.push(Err(error));
    }

    pub fn push_balance(&self, balance: BalanceSnapshot) {
        self.balances.push(Ok(balance));
    }

    pub fn push_orders(&self, orders: Vec<OrderUpdate>) {
        self.orders.push(Ok(orders));
    }

    pub fn push_my_trades(&self, trades: Vec<Trade>) {
        self.my_trades.push(Ok(trades));
    }

    pub fn push_positions(&self, positions: Vec<PositionUpdate>) {
        self.positions.push(Ok(positions));
    }

    /// The `(kind, symbols)` pairs unwatched so far.
    pub fn unwatch_calls(&self) -> Vec<(StreamKind, Vec<String>)> {
        self.unwatch_calls.lock().expect("calls poisoned").clone()
    }

    pub fn close_calls(&self) -> usize {
        *self.close_calls.lock().expect("calls poisoned")
    }
}

#[async_trait]
impl ExchangeClient for ScriptedExchange {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn load_markets(&self) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn watch_ticker(&self, _symbol: &str) -> Result<Ticker, ExchangeError> {
        self.tickers.next().await
    }

    async fn watch_tickers(
        &self,
        _symbols: &[String],
    ) -> Result<HashMap<String, Ticker>, ExchangeError> {
        self.ticker_maps.next().await
    }

    async fn watch_order_book(&self, _symbol: &str) -> Result<OrderBook, ExchangeError> {
        self.order_books.next().await
    }

    async fn watch_order_book_for_symbols(
        &self,
        _symbols: &[String],
    ) -> Result<HashMap<String, OrderBook>, ExchangeError> {
        self.order_book_maps.next().await
    }

    async fn watch_trades(&self, _symbol: &str) -> Result<Vec<Trade>, ExchangeError> {
        self.trades.next().await
    }

    async fn watch_balance(&self) -> Result<BalanceSnapshot, ExchangeError> {
        self.balances.next().await
    }

    async fn watch_orders(&self, _symbol: Option<&str>) -> Result<Vec<OrderUpdate>, ExchangeError> {
        self.orders.next().await
    }

    async fn watch_my_trades(&self, _symbol: Option<&str>) -> Result<Vec<Trade>, ExchangeError> {
        self.my_trades.next().await
    }

    async fn watch_positions(
        &self,
        _symbols: Option<&[String]>,
    ) -> Result<Vec<PositionUpdate>, ExchangeError> {
        self.positions.next().await
    }

    async fn unwatch(&self, kind: StreamKind, symbols: &[String]) -> Result<(), ExchangeError> {
        self.unwatch_calls
            .lock()
            .expect("calls poisoned")
            .push((kind, symbols.to_vec()));
        Ok(())
    }

    async fn close(&self) -> Result<(), ExchangeError> {
        *self.close_calls.lock().expect("calls poisoned") += 1;
        Ok(())
    }
}

/// Hands out pre-registered [`ScriptedExchange`] handles by exchange id.
#[derive(Default)]
pub struct ScriptedExchangeFactory {
    clients: Mutex<HashMap<String, Arc<ScriptedExchange>>>,
}

impl ScriptedExchangeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client: Arc<ScriptedExchange>) {
        self.clients
            .lock()
            .expect("clients poisoned")
            .insert(client.id().to_string(), client);
    }
}

#[async_trait]
impl ExchangeClientFactory for ScriptedExchangeFactory {
    async fn create(
        &self,
        exchange_id: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn ExchangeClient>, ExchangeError> {
        self.clients
            .lock()
            .expect("clients poisoned")
            .get(exchange_id)
            .cloned()
            .map(|client| client as Arc<dyn ExchangeClient>)
            .ok_or_else(|| ExchangeError::UnknownExchange(exchange_id.to_string()))
    }
}
