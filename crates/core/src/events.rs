use crate::models::{BalanceSnapshot, Candle, OrderBook, OrderUpdate, PositionUpdate, Ticker, Trade};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One candle emission: the candle itself plus whether its bucket is
/// complete. In-progress candles (`closed == false`) are re-sent on every
/// tick so clients can render a live-updating bar.
#[derive(Debug, Clone, Serialize)]
pub struct CandleUpdate {
    pub candle: Candle,
    pub closed: bool,
}

/// Machine-readable failure codes surfaced to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnsupportedStream,
    MissingSession,
    InvalidTimeframe,
    InvalidTopic,
    UpstreamFailure,
    Unauthorized,
    BadRequest,
}

/// An error event delivered to the subscriber(s) a failure concerns.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub code: ErrorCode,
    pub message: String,
}

/// Acknowledgement that a subscription was added or removed.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionAck {
    pub room: String,
}

/// Acknowledgement that a private exchange connection was established or
/// torn down.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeAck {
    pub exchange: String,
}

/// Typed outbound payload delivered through the transport.
///
/// Each variant corresponds to one client-facing event name; the enum
/// serialises as the bare payload and the transport wraps it in its
/// delivery envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundEvent {
    Ticker(Ticker),
    Tickers(HashMap<String, Ticker>),
    OrderBook(OrderBook),
    OrderBooks(HashMap<String, OrderBook>),
    Ohlcv(CandleUpdate),
    Balance(BalanceSnapshot),
    Orders(Vec<OrderUpdate>),
    MyTrades(Vec<Trade>),
    Positions(Vec<PositionUpdate>),
    Subscribed(SubscriptionAck),
    Unsubscribed(SubscriptionAck),
    Connected(ExchangeAck),
    Disconnected(ExchangeAck),
    Error(ErrorEvent),
}

impl OutboundEvent {
    /// The client-facing event name this payload is delivered under.
    pub fn event_name(&self) -> &'static str {
        match self {
            OutboundEvent::Ticker(_) => "ticker",
            OutboundEvent::Tickers(_) => "tickers",
            OutboundEvent::OrderBook(_) => "orderbook",
            OutboundEvent::OrderBooks(_) => "orderbooks",
            OutboundEvent::Ohlcv(_) => "ohlcv",
            OutboundEvent::Balance(_) => "balance",
            OutboundEvent::Orders(_) => "orders",
            OutboundEvent::MyTrades(_) => "myTrades",
            OutboundEvent::Positions(_) => "positions",
            OutboundEvent::Subscribed(_) => "subscribed",
            OutboundEvent::Unsubscribed(_) => "unsubscribed",
            OutboundEvent::Connected(_) => "connected",
            OutboundEvent::Disconnected(_) => "disconnected",
            OutboundEvent::Error(_) => "error",
        }
    }

    pub fn subscribed(room: impl Into<String>) -> Self {
        OutboundEvent::Subscribed(SubscriptionAck { room: room.into() })
    }

    pub fn unsubscribed(room: impl Into<String>) -> Self {
        OutboundEvent::Unsubscribed(SubscriptionAck { room: room.into() })
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        OutboundEvent::Error(ErrorEvent {
            code,
            message: message.into(),
        })
    }
}
