//! Trade-tape flow analysis.
//!
//! A [`TradeBuffer`] keeps the most recent trades per symbol; [`analyze`] folds them into
//! a [`LiquiditySnapshot`] of directional flow.

use crate::types::Trade;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// `|net flow|` above which intensity is extreme (USD).
pub const EXTREME_FLOW_USD: f64 = 5_000_000.0;
/// `|net flow|` above which intensity is high (USD).
pub const HIGH_FLOW_USD: f64 = 2_000_000.0;
/// `|net flow|` above which intensity is medium (USD).
pub const MEDIUM_FLOW_USD: f64 = 500_000.0;
/// Price impact (percent) beyond which flow has a direction.
pub const DIRECTION_THRESHOLD_PCT: f64 = 0.05;

/// Magnitude bucket of net flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowIntensity {
    Low,
    Medium,
    High,
    Extreme,
}

impl FlowIntensity {
    pub fn from_net_flow(net_flow: f64) -> Self {
        match net_flow.abs() {
            flow if flow > EXTREME_FLOW_USD => FlowIntensity::Extreme,
            flow if flow > HIGH_FLOW_USD => FlowIntensity::High,
            flow if flow > MEDIUM_FLOW_USD => FlowIntensity::Medium,
            _ => FlowIntensity::Low,
        }
    }
}

/// Which side dominates the tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowDirection {
    Bullish,
    Bearish,
    Neutral,
}

impl FlowDirection {
    pub fn from_price_impact(price_impact_pct: f64) -> Self {
        if price_impact_pct > DIRECTION_THRESHOLD_PCT {
            FlowDirection::Bullish
        } else if price_impact_pct < -DIRECTION_THRESHOLD_PCT {
            FlowDirection::Bearish
        } else {
            FlowDirection::Neutral
        }
    }
}

/// Directional flow over the current trade buffer.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct LiquiditySnapshot {
    /// Buy notional minus sell notional (USD)
    pub net_flow: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub buy_count: usize,
    pub sell_count: usize,
    /// Share of notional that was bought, in `[0, 1]`
    pub flow_ratio: f64,
    pub avg_buy_size: f64,
    pub avg_sell_size: f64,
    pub intensity: FlowIntensity,
    /// Net flow as a percentage of total notional
    pub price_impact_pct: f64,
    pub flow_direction: FlowDirection,
}

/// Fold `trades` into flow metrics. `None` when there are no trades.
pub fn analyze<'a>(trades: impl IntoIterator<Item = &'a Trade>) -> Option<LiquiditySnapshot> {
    let mut buy_volume = 0.0;
    let mut sell_volume = 0.0;
    let mut buy_count = 0usize;
    let mut sell_count = 0usize;

    for trade in trades {
        let notional = trade.notional();
        if trade.side.is_buy() {
            buy_volume += notional;
            buy_count += 1;
        } else {
            sell_volume += notional;
            sell_count += 1;
        }
    }

    if buy_count + sell_count == 0 {
        return None;
    }

    let total = buy_volume + sell_volume;
    let net_flow = buy_volume - sell_volume;
    let (flow_ratio, price_impact_pct) = if total > 0.0 {
        ((buy_volume / total).clamp(0.0, 1.0), net_flow / total * 100.0)
    } else {
        (0.5, 0.0)
    };

    Some(LiquiditySnapshot {
        net_flow,
        buy_volume,
        sell_volume,
        buy_count,
        sell_count,
        flow_ratio,
        avg_buy_size: average(buy_volume, buy_count),
        avg_sell_size: average(sell_volume, sell_count),
        intensity: FlowIntensity::from_net_flow(net_flow),
        price_impact_pct,
        flow_direction: FlowDirection::from_price_impact(price_impact_pct),
    })
}

fn average(volume: f64, count: usize) -> f64 {
    if count == 0 { 0.0 } else { volume / count as f64 }
}

/// Fixed-capacity ring of trades in arrival order.
#[derive(Debug, Clone)]
pub struct TradeBuffer {
    capacity: usize,
    trades: VecDeque<Trade>,
}

impl TradeBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            trades: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a trade, evicting the oldest when full.
    pub fn push(&mut self, trade: Trade) {
        if self.trades.len() >= self.capacity {
            self.trades.pop_front();
        }
        self.trades.push_back(trade);
    }

    pub fn extend(&mut self, trades: impl IntoIterator<Item = Trade>) {
        for trade in trades {
            self.push(trade);
        }
    }

    /// Append only the trades newer than the latest buffered one.
    ///
    /// Used when re-seeding from a trade tape that may overlap what is already buffered.
    pub fn extend_newer(&mut self, trades: impl IntoIterator<Item = Trade>) {
        let latest = self.latest_time();
        self.extend(
            trades
                .into_iter()
                .filter(|trade| latest.is_none_or(|latest| trade.time > latest)),
        );
    }

    /// Time of the most recently buffered trade.
    pub fn latest_time(&self) -> Option<DateTime<Utc>> {
        self.trades.back().map(|trade| trade.time)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trade> {
        self.trades.iter()
    }

    /// Flow metrics over the buffered trades.
    pub fn snapshot(&self) -> Option<LiquiditySnapshot> {
        analyze(&self.trades)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, Symbol};
    use chrono::TimeDelta;

    fn trade(side: Side, price: f64, size: f64) -> Trade {
        Trade::new(Utc::now(), Symbol::new("BTC"), side, price, size)
    }

    #[test]
    fn test_intensity_thresholds() {
        struct TestCase {
            net_flow: f64,
            expected: FlowIntensity,
        }

        let tests = vec![
            TestCase {
                // TC0: just above extreme
                net_flow: 5_000_001.0,
                expected: FlowIntensity::Extreme,
            },
            TestCase {
                // TC1: exactly extreme threshold is high
                net_flow: 5_000_000.0,
                expected: FlowIntensity::High,
            },
            TestCase {
                // TC2: negative flow uses magnitude
                net_flow: -2_500_000.0,
                expected: FlowIntensity::High,
            },
            TestCase {
                // TC3: exactly medium threshold is low
                net_flow: 500_000.0,
                expected: FlowIntensity::Low,
            },
            TestCase {
                // TC4: medium
                net_flow: 500_001.0,
                expected: FlowIntensity::Medium,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = FlowIntensity::from_net_flow(test.net_flow);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_analyze_all_buys() {
        let trades = vec![trade(Side::Buy, 100.0, 2.0), trade(Side::Buy, 100.0, 3.0)];
        let snapshot = analyze(&trades).unwrap();

        assert_eq!(snapshot.flow_ratio, 1.0);
        assert_eq!(snapshot.buy_volume, 500.0);
        assert_eq!(snapshot.sell_volume, 0.0);
        assert_eq!(snapshot.buy_count, 2);
        assert_eq!(snapshot.avg_buy_size, 250.0);
        assert_eq!(snapshot.avg_sell_size, 0.0);
        assert_eq!(snapshot.price_impact_pct, 100.0);
        assert_eq!(snapshot.flow_direction, FlowDirection::Bullish);
        assert_eq!(snapshot.intensity, FlowIntensity::Low);
    }

    #[test]
    fn test_analyze_mixed_flow() {
        let trades = vec![
            trade(Side::Buy, 50_000.0, 10.0),
            trade(Side::Sell, 50_000.0, 130.0),
        ];
        let snapshot = analyze(&trades).unwrap();

        assert_eq!(snapshot.net_flow, -6_000_000.0);
        assert_eq!(snapshot.intensity, FlowIntensity::Extreme);
        assert_eq!(snapshot.flow_direction, FlowDirection::Bearish);
        assert!((0.0..=1.0).contains(&snapshot.flow_ratio));
    }

    #[test]
    fn test_analyze_edge_cases() {
        assert!(analyze(&Vec::<Trade>::new()).is_none());

        // Zero notional keeps the ratio centred
        let snapshot = analyze(&[trade(Side::Sell, 0.0, 1.0)]).unwrap();
        assert_eq!(snapshot.flow_ratio, 0.5);
        assert_eq!(snapshot.price_impact_pct, 0.0);
        assert_eq!(snapshot.flow_direction, FlowDirection::Neutral);
    }

    #[test]
    fn test_buffer_evicts_oldest() {
        let mut buffer = TradeBuffer::new(3);
        for size in 1..=5 {
            buffer.push(trade(Side::Buy, 1.0, size as f64));
        }

        assert_eq!(buffer.len(), 3);
        let sizes: Vec<f64> = buffer.iter().map(|trade| trade.size).collect();
        assert_eq!(sizes, vec![3.0, 4.0, 5.0]);
        assert_eq!(buffer.snapshot().map(|snapshot| snapshot.buy_volume), Some(12.0));
    }

    #[test]
    fn test_extend_newer_skips_overlap() {
        let start = Utc::now();
        let at = |seconds: i64, size: f64| Trade {
            time: start + TimeDelta::seconds(seconds),
            ..trade(Side::Buy, 10.0, size)
        };

        let mut buffer = TradeBuffer::new(10);
        buffer.extend_newer(vec![at(0, 1.0), at(1, 2.0)]);
        assert_eq!(buffer.len(), 2);

        // Tape overlaps the buffer; only the later trade is new
        buffer.extend_newer(vec![at(0, 1.0), at(1, 2.0), at(2, 3.0)]);
        let sizes: Vec<f64> = buffer.iter().map(|trade| trade.size).collect();
        assert_eq!(sizes, vec![1.0, 2.0, 3.0]);
        assert_eq!(buffer.latest_time(), Some(start + TimeDelta::seconds(2)));
    }
}
