//! Core data types shared by every scanner component.

use chrono::{DateTime, TimeDelta, Utc};
use derive_more::{Constructor, Display};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::str::FromStr;

/// Exchange coin identifier (e.g., "BTC", "ETH").
pub type Symbol = SmolStr;

/// Latest mid price per symbol, as pushed by the live price feed.
pub type MidPrices = FnvHashMap<Symbol, f64>;

/// Aggressor side of a trade (Buy or Sell)
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Convert to display string
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// Check if this is a buy
    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }

    /// Check if this is a sell
    pub fn is_sell(&self) -> bool {
        matches!(self, Side::Sell)
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single public trade execution.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct Trade {
    /// Execution time reported by the exchange
    pub time: DateTime<Utc>,
    pub symbol: Symbol,
    /// Aggressor side
    pub side: Side,
    pub price: f64,
    /// Size in base units
    pub size: f64,
}

impl Trade {
    /// USD notional of the trade (`price * size`).
    pub fn notional(&self) -> f64 {
        self.price * self.size
    }
}

/// OHLCV candle for one timeframe bucket.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize, Constructor)]
pub struct Candle {
    /// Bucket open time
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Candle timeframes scanned for support/resistance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, Display,
)]
pub enum Timeframe {
    #[serde(rename = "5m")]
    #[display("5m")]
    M5,
    #[serde(rename = "15m")]
    #[display("15m")]
    M15,
    #[serde(rename = "30m")]
    #[display("30m")]
    M30,
    #[serde(rename = "1h")]
    #[display("1h")]
    H1,
    #[serde(rename = "4h")]
    #[display("4h")]
    H4,
    #[serde(rename = "12h")]
    #[display("12h")]
    H12,
    #[serde(rename = "1d")]
    #[display("1d")]
    D1,
}

impl Timeframe {
    /// Every supported timeframe, shortest first.
    pub const ALL: [Timeframe; 7] = [
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::H12,
        Timeframe::D1,
    ];

    /// Wire label used by the exchange candle endpoint.
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
        }
    }

    /// Importance of a level detected on this timeframe. Longer timeframes win tie-breaks.
    pub fn weight(&self) -> u32 {
        match self {
            Timeframe::M5 => 1,
            Timeframe::M15 => 2,
            Timeframe::M30 => 3,
            Timeframe::H1 => 4,
            Timeframe::H4 => 6,
            Timeframe::H12 => 8,
            Timeframe::D1 => 10,
        }
    }

    /// Length of one candle.
    pub fn duration(&self) -> TimeDelta {
        match self {
            Timeframe::M5 => TimeDelta::minutes(5),
            Timeframe::M15 => TimeDelta::minutes(15),
            Timeframe::M30 => TimeDelta::minutes(30),
            Timeframe::H1 => TimeDelta::hours(1),
            Timeframe::H4 => TimeDelta::hours(4),
            Timeframe::H12 => TimeDelta::hours(12),
            Timeframe::D1 => TimeDelta::days(1),
        }
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .into_iter()
            .find(|timeframe| timeframe.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unsupported timeframe: {s}"))
    }
}

/// Raw per-symbol row of the batched universe query, before parsing.
///
/// Fields stay as upstream strings so one malformed value only excludes its own symbol.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct AssetContext {
    pub symbol: Symbol,
    /// 24h notional volume in USD
    pub day_notional_volume: Option<String>,
    /// Current mark price
    pub mark_price: Option<String>,
    /// Previous day close
    pub prev_day_price: Option<String>,
}

/// A parsed and filtered member of the scanner universe.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct TokenDescriptor {
    pub symbol: Symbol,
    /// Mark price at selection time
    pub price: f64,
    /// 24h notional volume in USD
    pub volume_24h: f64,
    /// 24h change in percent
    pub change_24h_pct: f64,
}
