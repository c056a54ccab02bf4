use serde::Deserialize;
use streamgate_core::Credentials;

/// Inbound control messages, tagged by `op`.
///
/// Market-data ops are honoured on both channels: on the public channel
/// they watch the shared connection, on the private channel the caller's
/// own trading connection. Account ops (`connect` onwards) require the
/// private channel.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    WatchTicker { exchange_id: String, symbol: String },
    #[serde(rename_all = "camelCase")]
    UnWatchTicker { exchange_id: String, symbol: String },
    #[serde(rename_all = "camelCase")]
    WatchTickers {
        exchange_id: String,
        symbols: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    UnWatchTickers {
        exchange_id: String,
        symbols: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    WatchOrderBook { exchange_id: String, symbol: String },
    #[serde(rename_all = "camelCase")]
    UnWatchOrderBook { exchange_id: String, symbol: String },
    #[serde(rename_all = "camelCase")]
    WatchOrderBookForSymbols {
        exchange_id: String,
        symbols: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    UnWatchOrderBookForSymbols {
        exchange_id: String,
        symbols: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    WatchOhlcv {
        exchange_id: String,
        symbol: String,
        timeframe: String,
    },
    #[serde(rename_all = "camelCase")]
    UnWatchOhlcv { exchange_id: String, symbol: String },
    #[serde(rename_all = "camelCase")]
    Connect {
        exchange_id: String,
        credentials: Credentials,
    },
    #[serde(rename_all = "camelCase")]
    DisconnectExchange { exchange_id: String },
    #[serde(rename_all = "camelCase")]
    WatchBalance { exchange_id: String },
    #[serde(rename_all = "camelCase")]
    UnWatchBalance { exchange_id: String },
    #[serde(rename_all = "camelCase")]
    WatchOrders {
        exchange_id: String,
        symbol: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    UnWatchOrders {
        exchange_id: String,
        symbol: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    WatchMyTrades {
        exchange_id: String,
        symbol: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    UnWatchMyTrades {
        exchange_id: String,
        symbol: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    WatchPositions {
        exchange_id: String,
        symbols: Option<Vec<String>>,
    },
    #[serde(rename_all = "camelCase")]
    UnWatchPositions {
        exchange_id: String,
        symbols: Option<Vec<String>>,
    },
}
