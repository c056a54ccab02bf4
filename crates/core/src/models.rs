use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// Stable identity of an authenticated user, as produced by the identity
/// verifier. Never client-supplied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.to_string())
    }
}

/// Opaque identity of a single transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        SubscriberId(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Market Data
// ---------------------------------------------------------------------------

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

/// Snapshot of a market's current prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub last: Option<Decimal>,
    pub base_volume: Option<Decimal>,
    pub quote_volume: Option<Decimal>,
}

/// A single bid or ask level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub amount: Decimal,
}

/// Order book snapshot. Bids are sorted best-first (descending price),
/// asks best-first (ascending price).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// A single executed trade as reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Exchange-assigned trade id, when the exchange provides one.
    pub id: Option<String>,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub side: Option<Side>,
    pub price: Decimal,
    pub amount: Decimal,
}

/// One OHLCV candle. Serialises to the wire format
/// `[timestamp_ms, open, high, low, close, volume]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Serialize for Candle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(6)?;
        tup.serialize_element(&self.timestamp.timestamp_millis())?;
        tup.serialize_element(&self.open)?;
        tup.serialize_element(&self.high)?;
        tup.serialize_element(&self.low)?;
        tup.serialize_element(&self.close)?;
        tup.serialize_element(&self.volume)?;
        tup.end()
    }
}

// ---------------------------------------------------------------------------
// Account Data
// ---------------------------------------------------------------------------

/// Per-asset balance breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: Decimal,
    pub used: Decimal,
    pub total: Decimal,
}

/// Snapshot of a user's account balances on one exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub balances: HashMap<String, AssetBalance>,
}

/// The lifecycle state of an order as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Closed,
    Canceled,
    Rejected,
    Expired,
}

/// An order state change on a user's private stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub price: Option<Decimal>,
    pub amount: Decimal,
    pub filled: Decimal,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
}

/// A position state change on a user's private stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub symbol: String,
    pub side: Side,
    pub contracts: Decimal,
    pub entry_price: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Timeframe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeframeError {
    #[error("invalid timeframe `{0}`: expected a number followed by one of s, m, h, d, w, M, y")]
    Invalid(String),
}

/// A validated candle timeframe such as `1m`, `4h`, or `1d`.
///
/// Months count as 30 days and years as 365, matching the upstream
/// exchange convention for candle bucketing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Timeframe {
    spec: String,
    duration_ms: i64,
}

impl Timeframe {
    pub fn parse(spec: &str) -> Result<Self, TimeframeError> {
        if spec.len() < 2 || !spec.is_ascii() {
            return Err(TimeframeError::Invalid(spec.to_string()));
        }
        let (count, unit) = spec.split_at(spec.len() - 1);
        if count.is_empty() || !count.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TimeframeError::Invalid(spec.to_string()));
        }
        let n: i64 = count
            .parse()
            .map_err(|_| TimeframeError::Invalid(spec.to_string()))?;
        if n == 0 {
            return Err(TimeframeError::Invalid(spec.to_string()));
        }
        let unit_ms: i64 = match unit {
            "s" => 1_000,
            "m" => 60 * 1_000,
            "h" => 60 * 60 * 1_000,
            "d" => 24 * 60 * 60 * 1_000,
            "w" => 7 * 24 * 60 * 60 * 1_000,
            "M" => 30 * 24 * 60 * 60 * 1_000,
            "y" => 365 * 24 * 60 * 60 * 1_000,
            _ => return Err(TimeframeError::Invalid(spec.to_string())),
        };
        Ok(Timeframe {
            spec: spec.to_string(),
            duration_ms: n * unit_ms,
        })
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_ms
    }

    pub fn as_str(&self) -> &str {
        &self.spec
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spec)
    }
}

impl std::str::FromStr for Timeframe {
    type Err = TimeframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::parse(s)
    }
}

impl Serialize for Timeframe {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.spec)
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Timeframe::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_timeframe_parse() {
        assert_eq!(Timeframe::parse("1m").unwrap().duration_ms(), 60_000);
        assert_eq!(Timeframe::parse("30s").unwrap().duration_ms(), 30_000);
        assert_eq!(Timeframe::parse("4h").unwrap().duration_ms(), 14_400_000);
        assert_eq!(Timeframe::parse("1d").unwrap().duration_ms(), 86_400_000);
        assert_eq!(
            Timeframe::parse("1w").unwrap().duration_ms(),
            7 * 86_400_000
        );
        assert_eq!(
            Timeframe::parse("1M").unwrap().duration_ms(),
            30 * 86_400_000
        );
        assert_eq!(Timeframe::parse("2m").unwrap().as_str(), "2m");
    }

    #[test]
    fn test_timeframe_rejects_garbage() {
        for bad in ["", "m", "1", "0m", "1x", "m1", "1mm", "-1m", "1 m"] {
            assert!(Timeframe::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_candle_serialises_as_array() {
        let candle = Candle {
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            open: dec!(100),
            high: dec!(110),
            low: dec!(95),
            close: dec!(105),
            volume: dec!(12.5),
        };
        let json = serde_json::to_value(&candle).unwrap();
        assert_eq!(
            json,
            serde_json::json!([1_700_000_000_000i64, "100", "110", "95", "105", "12.5"])
        );
    }
}
