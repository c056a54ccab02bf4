use crate::models::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Stream Kinds
// ---------------------------------------------------------------------------

/// Whether a stream reads from the shared public connection or from a
/// user's private trading connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

/// The kind of upstream stream a topic multiplexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Ticker,
    OrderBook,
    Ohlcv,
    Balance,
    Orders,
    MyTrades,
    Positions,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Ticker => "ticker",
            StreamKind::OrderBook => "orderbook",
            StreamKind::Ohlcv => "ohlcv",
            StreamKind::Balance => "balance",
            StreamKind::Orders => "orders",
            StreamKind::MyTrades => "mytrades",
            StreamKind::Positions => "positions",
        }
    }

    /// Account streams read a user's own data and exist only on the
    /// private channel.
    pub fn is_account_stream(&self) -> bool {
        matches!(
            self,
            StreamKind::Balance | StreamKind::Orders | StreamKind::MyTrades | StreamKind::Positions
        )
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("exchange id must not be empty")]
    EmptyExchange,
    #[error("{0} subscriptions require at least one symbol")]
    MissingSymbols(StreamKind),
    #[error("{0} subscriptions take exactly one symbol")]
    SingleSymbolOnly(StreamKind),
    #[error("{0} streams are only available on the private channel")]
    PrivateOnly(StreamKind),
}

/// A subscription topic: one logical upstream stream that any number of
/// subscribers can share.
///
/// Construction canonicalises the fields (exchange lowercased, symbols
/// sorted and deduplicated) so that two logically identical subscription
/// requests compare equal and collapse onto the same watcher. Topics are
/// immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    visibility: Visibility,
    kind: StreamKind,
    exchange: String,
    symbols: Vec<String>,
    user: Option<UserId>,
}

impl Topic {
    /// Build a public topic.
    pub fn public(
        kind: StreamKind,
        exchange: &str,
        symbols: Vec<String>,
    ) -> Result<Self, TopicError> {
        if kind.is_account_stream() {
            return Err(TopicError::PrivateOnly(kind));
        }
        Self::build(Visibility::Public, kind, exchange, symbols, None)
    }

    /// Build a private topic, bound to the verified user.
    pub fn private(
        kind: StreamKind,
        exchange: &str,
        symbols: Vec<String>,
        user: UserId,
    ) -> Result<Self, TopicError> {
        Self::build(Visibility::Private, kind, exchange, symbols, Some(user))
    }

    fn build(
        visibility: Visibility,
        kind: StreamKind,
        exchange: &str,
        mut symbols: Vec<String>,
        user: Option<UserId>,
    ) -> Result<Self, TopicError> {
        let exchange = exchange.trim().to_lowercase();
        if exchange.is_empty() {
            return Err(TopicError::EmptyExchange);
        }
        symbols.sort();
        symbols.dedup();
        match kind {
            StreamKind::Ticker | StreamKind::OrderBook if symbols.is_empty() => {
                return Err(TopicError::MissingSymbols(kind));
            }
            StreamKind::Ohlcv if symbols.len() != 1 => {
                return Err(if symbols.is_empty() {
                    TopicError::MissingSymbols(kind)
                } else {
                    TopicError::SingleSymbolOnly(kind)
                });
            }
            StreamKind::Orders | StreamKind::MyTrades if symbols.len() > 1 => {
                return Err(TopicError::SingleSymbolOnly(kind));
            }
            _ => {}
        }
        Ok(Topic {
            visibility,
            kind,
            exchange,
            symbols,
            user,
        })
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn user(&self) -> Option<&UserId> {
        self.user.as_ref()
    }

    /// Canonical room name for this topic: a pure function of the topic's
    /// fields, stable across restarts and injective on distinct topics.
    ///
    /// Public:  `{kind}:{exchange}:{symbols}`
    /// Private: `private:{user}:{kind}:{exchange}:{symbols}`
    ///
    /// Account-wide streams (no symbol) omit the trailing segment.
    pub fn room_name(&self) -> String {
        let mut name = String::new();
        if let Some(user) = &self.user {
            name.push_str("private:");
            name.push_str(&user.0);
            name.push(':');
        }
        name.push_str(self.kind.as_str());
        name.push(':');
        name.push_str(&self.exchange);
        if !self.symbols.is_empty() {
            name.push(':');
            name.push_str(&self.symbols.join(","));
        }
        name
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.room_name())
    }
}
