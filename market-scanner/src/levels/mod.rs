//! Multi-timeframe support/resistance.
//!
//! [`detect_levels`] clusters candle highs and lows into price zones per timeframe and
//! keeps zones touched at least twice. [`resolve_closest`] aggregates across timeframes
//! into the single nearest actionable level plus the strongest support and resistance.

use crate::types::Timeframe;
use serde::{Deserialize, Serialize};

pub mod detector;
pub mod resolver;

pub use detector::detect_levels;
pub use resolver::resolve_closest;

/// Which side of the current price a level sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelKind {
    Support,
    Resistance,
}

/// A price zone touched often enough to be actionable.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Level {
    pub price: f64,
    pub timeframe: Timeframe,
    #[serde(rename = "type")]
    pub kind: LevelKind,
    /// Candle highs plus lows that landed in the zone
    pub touches: u32,
    /// Importance of `timeframe`
    pub weight: u32,
}

impl Level {
    pub fn new(price: f64, timeframe: Timeframe, kind: LevelKind, touches: u32) -> Self {
        Self {
            price,
            timeframe,
            kind,
            touches,
            weight: timeframe.weight(),
        }
    }

    /// Distance from `current_price` in percent.
    pub fn distance_pct(&self, current_price: f64) -> f64 {
        (self.price - current_price).abs() / current_price * 100.0
    }
}

/// Levels detected on one timeframe, replaced wholesale on every refresh.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct TimeframeLevels {
    /// Nearest level below the current price
    pub support: Option<Level>,
    /// Nearest level at or above the current price
    pub resistance: Option<Level>,
    /// Every level, ascending by price
    pub levels: Vec<Level>,
}

impl TimeframeLevels {
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Side label of the closest level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClosestKind {
    /// Resistance above
    High,
    /// Support below
    Low,
}

impl From<LevelKind> for ClosestKind {
    fn from(kind: LevelKind) -> Self {
        match kind {
            LevelKind::Support => ClosestKind::Low,
            LevelKind::Resistance => ClosestKind::High,
        }
    }
}

/// The single nearest actionable level across timeframes.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ClosestLevel {
    pub price: f64,
    pub timeframe: Timeframe,
    #[serde(rename = "type")]
    pub kind: ClosestKind,
    pub distance_pct: f64,
}

/// Cross-timeframe summary for one symbol.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct LevelSummary {
    pub closest: Option<ClosestLevel>,
    /// Support from the heaviest timeframe
    pub strongest_support: Option<Level>,
    /// Resistance from the heaviest timeframe
    pub strongest_resistance: Option<Level>,
}
