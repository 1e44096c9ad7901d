use super::{Level, LevelKind, TimeframeLevels};
use crate::types::{Candle, Timeframe};
use itertools::Itertools;

/// Maximum relative distance (to the current price) for a touch to join a zone.
pub const ZONE_TOLERANCE: f64 = 0.005;

/// Touches a zone needs to become a level.
pub const MIN_TOUCHES: u32 = 2;

/// Recent candles used for the high/low fallback.
pub const FALLBACK_CANDLES: usize = 20;

/// Transient cluster of candle extremes around a fixed price.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PriceZone {
    price: f64,
    high_touches: u32,
    low_touches: u32,
}

impl PriceZone {
    fn new(price: f64) -> Self {
        Self {
            price,
            high_touches: 0,
            low_touches: 0,
        }
    }

    fn total_touches(&self) -> u32 {
        self.high_touches + self.low_touches
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Touch {
    High,
    Low,
}

/// Detect support/resistance on one timeframe by touch counting.
///
/// Every candle high and low joins the nearest zone within [`ZONE_TOLERANCE`] of the
/// current price, or opens a new zone at its own price. Zones touched fewer than
/// [`MIN_TOUCHES`] times are dropped. If nothing survives and at least
/// [`FALLBACK_CANDLES`] candles exist, the recent extreme high and low are used as
/// single-touch resistance and support.
pub fn detect_levels(candles: &[Candle], timeframe: Timeframe, current_price: f64) -> TimeframeLevels {
    if !current_price.is_finite() || current_price <= 0.0 {
        return TimeframeLevels::default();
    }

    let mut zones: Vec<PriceZone> = Vec::new();
    for candle in candles
        .iter()
        .filter(|candle| candle.high.is_finite() && candle.low.is_finite())
    {
        assign_touch(&mut zones, candle.high, current_price, Touch::High);
        assign_touch(&mut zones, candle.low, current_price, Touch::Low);
    }

    let levels: Vec<Level> = zones
        .into_iter()
        .filter(|zone| zone.total_touches() >= MIN_TOUCHES)
        .map(|zone| {
            let kind = if zone.price < current_price {
                LevelKind::Support
            } else {
                LevelKind::Resistance
            };
            Level::new(zone.price, timeframe, kind, zone.total_touches())
        })
        .sorted_by(|a, b| a.price.total_cmp(&b.price))
        .collect();

    if levels.is_empty() {
        return fallback_levels(candles, timeframe);
    }

    let support = levels
        .iter()
        .filter(|level| level.price < current_price)
        .max_by(|a, b| a.price.total_cmp(&b.price))
        .copied();
    let resistance = levels
        .iter()
        .filter(|level| level.price >= current_price)
        .min_by(|a, b| a.price.total_cmp(&b.price))
        .copied();

    TimeframeLevels {
        support,
        resistance,
        levels,
    }
}

fn assign_touch(zones: &mut Vec<PriceZone>, price: f64, current_price: f64, touch: Touch) {
    let nearest = zones
        .iter()
        .enumerate()
        .map(|(index, zone)| (index, (zone.price - price).abs()))
        .filter(|(_, distance)| distance / current_price <= ZONE_TOLERANCE)
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(index, _)| index);

    let index = match nearest {
        Some(index) => index,
        None => {
            zones.push(PriceZone::new(price));
            zones.len() - 1
        }
    };

    let zone = &mut zones[index];
    match touch {
        Touch::High => zone.high_touches += 1,
        Touch::Low => zone.low_touches += 1,
    }
}

fn fallback_levels(candles: &[Candle], timeframe: Timeframe) -> TimeframeLevels {
    let recent: Vec<&Candle> = candles
        .iter()
        .filter(|candle| candle.high.is_finite() && candle.low.is_finite())
        .collect();
    if recent.len() < FALLBACK_CANDLES {
        return TimeframeLevels::default();
    }
    let recent = &recent[recent.len() - FALLBACK_CANDLES..];

    let high = recent.iter().map(|candle| candle.high).fold(f64::MIN, f64::max);
    let low = recent.iter().map(|candle| candle.low).fold(f64::MAX, f64::min);

    let resistance = Level::new(high, timeframe, LevelKind::Resistance, 1);
    let support = Level::new(low, timeframe, LevelKind::Support, 1);

    TimeframeLevels {
        support: Some(support),
        resistance: Some(resistance),
        levels: vec![support, resistance],
    }
}
