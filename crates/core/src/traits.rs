use crate::events::OutboundEvent;
use crate::models::{
    BalanceSnapshot, OrderBook, OrderUpdate, PositionUpdate, SubscriberId, Ticker, Trade, UserId,
};
use crate::topic::StreamKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Exchange Client
// ---------------------------------------------------------------------------

/// Errors surfaced by an exchange connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExchangeError {
    /// A recoverable read failure; the connection stays usable and the
    /// caller may keep reading.
    #[error("transient exchange error: {0}")]
    Transient(String),
    #[error("exchange `{exchange}` does not support {kind} streams")]
    Unsupported { exchange: String, kind: StreamKind },
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("exchange error: {0}")]
    Other(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }
}

/// Which streaming reads a connection supports, resolved once at handle
/// creation.
///
/// `Ohlcv` in `streams` means the exchange can stream raw trades, which is
/// what candle aggregation consumes. `multi_symbol` marks kinds with a
/// batched variant (`watch_tickers`, `watch_order_book_for_symbols`), and
/// `unwatch` marks kinds whose upstream subscription can be released.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub streams: HashSet<StreamKind>,
    pub multi_symbol: HashSet<StreamKind>,
    pub unwatch: HashSet<StreamKind>,
}

impl Capabilities {
    pub fn supports(&self, kind: StreamKind) -> bool {
        self.streams.contains(&kind)
    }

    pub fn supports_multi(&self, kind: StreamKind) -> bool {
        self.multi_symbol.contains(&kind)
    }

    pub fn can_unwatch(&self, kind: StreamKind) -> bool {
        self.unwatch.contains(&kind)
    }
}

/// API credentials for a private exchange connection.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub api_key: String,
    pub secret: String,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("secret", &"***")
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// A handle to one upstream exchange connection.
///
/// Streaming reads suspend until the exchange delivers the next update, or
/// fail with an [`ExchangeError`]. Reconnection and retry policy live behind
/// this trait; the engine never retries on its own. Every `watch_*` method
/// defaults to `Unsupported` so implementations only override what their
/// capability descriptor advertises.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn id(&self) -> &str;

    fn capabilities(&self) -> &Capabilities;

    /// The `Unsupported` error for this exchange, used by the default
    /// `watch_*` implementations.
    fn unsupported(&self, kind: StreamKind) -> ExchangeError {
        ExchangeError::Unsupported {
            exchange: self.id().to_string(),
            kind,
        }
    }

    async fn load_markets(&self) -> Result<(), ExchangeError>;

    async fn watch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let _ = symbol;
        Err(self.unsupported(StreamKind::Ticker))
    }

    async fn watch_tickers(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, Ticker>, ExchangeError> {
        let _ = symbols;
        Err(self.unsupported(StreamKind::Ticker))
    }

    async fn watch_order_book(&self, symbol: &str) -> Result<OrderBook, ExchangeError> {
        let _ = symbol;
        Err(self.unsupported(StreamKind::OrderBook))
    }

    async fn watch_order_book_for_symbols(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, OrderBook>, ExchangeError> {
        let _ = symbols;
        Err(self.unsupported(StreamKind::OrderBook))
    }

    async fn watch_trades(&self, symbol: &str) -> Result<Vec<Trade>, ExchangeError> {
        let _ = symbol;
        Err(self.unsupported(StreamKind::Ohlcv))
    }

    async fn watch_balance(&self) -> Result<BalanceSnapshot, ExchangeError> {
        Err(self.unsupported(StreamKind::Balance))
    }

    async fn watch_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderUpdate>, ExchangeError> {
        let _ = symbol;
        Err(self.unsupported(StreamKind::Orders))
    }

    async fn watch_my_trades(&self, symbol: Option<&str>) -> Result<Vec<Trade>, ExchangeError> {
        let _ = symbol;
        Err(self.unsupported(StreamKind::MyTrades))
    }

    async fn watch_positions(
        &self,
        symbols: Option<&[String]>,
    ) -> Result<Vec<PositionUpdate>, ExchangeError> {
        let _ = symbols;
        Err(self.unsupported(StreamKind::Positions))
    }

    /// Best-effort release of an upstream subscription. Only called when the
    /// capability descriptor advertises unwatch support for `kind`.
    async fn unwatch(&self, kind: StreamKind, symbols: &[String]) -> Result<(), ExchangeError> {
        let _ = (kind, symbols);
        Ok(())
    }

    /// Release every resource held by this connection.
    async fn close(&self) -> Result<(), ExchangeError> {
        Ok(())
    }
}

/// Creates exchange connection handles. Credentials make the handle a
/// private (per-user) connection.
#[async_trait]
pub trait ExchangeClientFactory: Send + Sync {
    async fn create(
        &self,
        exchange_id: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn ExchangeClient>, ExchangeError>;
}

// ---------------------------------------------------------------------------
// Identity Verifier
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing or malformed credential")]
    Malformed,
    #[error("credential rejected: {0}")]
    Rejected(String),
}

/// Turns a bearer credential into a stable user identifier.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<UserId, AuthError>;
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Delivers outbound events to connected clients.
///
/// `publish` fans out to every connection joined to a room; `send` targets
/// one connection (candle fan-out and error reporting are per-subscriber).
/// The `room` passed to `send` is delivery context for the client, not an
/// addressing mechanism.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, room: &str, event: &OutboundEvent);

    async fn send(&self, subscriber: &SubscriberId, room: &str, event: &OutboundEvent);
}
