//! Scanner configuration.
//!
//! Defaults match the production dashboard; every value can be overridden from the
//! environment (`SCANNER_*`) or with the `with_*` builders.

use crate::{circuit::CircuitBreakerConfig, fetcher::RetryPolicy, types::Timeframe};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr, time::Duration};
use tracing::warn;

/// Shortest period the refresh loops will tick at.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Which analysis the scanner runs for its watch-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScannerMode {
    /// Live trade-tape flow analysis
    #[default]
    Liquidity,
    /// Multi-timeframe support/resistance
    Levels,
}

impl FromStr for ScannerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "liquidity" => Ok(ScannerMode::Liquidity),
            "levels" => Ok(ScannerMode::Levels),
            other => Err(format!("unsupported scanner mode: {other}")),
        }
    }
}

/// Scanner configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ScannerConfig {
    pub mode: ScannerMode,
    /// Minimum 24h notional volume (USD) for a symbol to be watched
    pub min_volume: f64,
    /// Decline floor in percent; symbols with `change% <= floor` are excluded
    pub max_decline_pct: f64,
    /// Watch-list bound in liquidity mode
    pub liquidity_watchlist_limit: usize,
    /// Watch-list bound in levels mode
    pub levels_watchlist_limit: usize,
    /// Watch-list cache TTL
    pub watchlist_ttl: Duration,
    /// Candle cache TTL (candles only change on close)
    pub level_cache_ttl: Duration,
    pub watchlist_refresh_interval: Duration,
    pub level_refresh_interval: Duration,
    /// Trade ring buffer capacity per symbol
    pub trade_buffer_capacity: usize,
    /// Delay between consecutive trade subscriptions
    pub trade_subscription_stagger: Duration,
    /// Delay between consecutive symbols in a level refresh
    pub level_symbol_stagger: Duration,
    /// Delay between network-bound timeframe fetches of one symbol
    pub level_timeframe_stagger: Duration,
    /// Timeframes scanned for levels
    pub timeframes: Vec<Timeframe>,
    /// Candles requested per timeframe
    pub candle_lookback: usize,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            mode: ScannerMode::default(),
            min_volume: 10_000_000.0,
            max_decline_pct: -10.0,
            liquidity_watchlist_limit: 15,
            levels_watchlist_limit: 10,
            watchlist_ttl: Duration::from_secs(30),
            level_cache_ttl: Duration::from_secs(300),
            watchlist_refresh_interval: Duration::from_secs(30),
            level_refresh_interval: Duration::from_secs(60),
            trade_buffer_capacity: 100,
            trade_subscription_stagger: Duration::from_millis(100),
            level_symbol_stagger: Duration::from_millis(500),
            level_timeframe_stagger: Duration::from_millis(200),
            timeframes: Timeframe::ALL.to_vec(),
            candle_lookback: 100,
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ScannerConfig {
    /// Build a configuration from `SCANNER_*` environment variables.
    ///
    /// Unset variables keep their defaults; unparsable ones are logged and ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let timeframes = std::env::var("SCANNER_TIMEFRAMES")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .filter(|s| !s.trim().is_empty())
                    .filter_map(|s| match s.parse::<Timeframe>() {
                        Ok(timeframe) => Some(timeframe),
                        Err(error) => {
                            warn!(%error, "Ignoring SCANNER_TIMEFRAMES entry");
                            None
                        }
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|timeframes| !timeframes.is_empty())
            .unwrap_or(defaults.timeframes.clone());

        Self {
            mode: env_or("SCANNER_MODE", defaults.mode),
            min_volume: env_or("SCANNER_MIN_VOLUME", defaults.min_volume),
            max_decline_pct: env_or("SCANNER_MAX_DECLINE_PCT", defaults.max_decline_pct),
            liquidity_watchlist_limit: env_or(
                "SCANNER_LIQUIDITY_LIMIT",
                defaults.liquidity_watchlist_limit,
            ),
            levels_watchlist_limit: env_or("SCANNER_LEVELS_LIMIT", defaults.levels_watchlist_limit),
            watchlist_ttl: env_secs_or("SCANNER_WATCHLIST_TTL_SECS", defaults.watchlist_ttl),
            level_cache_ttl: env_secs_or("SCANNER_LEVEL_CACHE_TTL_SECS", defaults.level_cache_ttl),
            watchlist_refresh_interval: env_interval_or(
                "SCANNER_WATCHLIST_REFRESH_SECS",
                defaults.watchlist_refresh_interval,
            ),
            level_refresh_interval: env_interval_or(
                "SCANNER_LEVEL_REFRESH_SECS",
                defaults.level_refresh_interval,
            ),
            trade_buffer_capacity: env_or(
                "SCANNER_TRADE_BUFFER",
                defaults.trade_buffer_capacity,
            )
            .max(1),
            candle_lookback: env_or("SCANNER_CANDLE_LOOKBACK", defaults.candle_lookback).max(1),
            timeframes,
            ..defaults
        }
    }

    /// Watch-list bound for the active mode.
    pub fn watchlist_limit(&self) -> usize {
        match self.mode {
            ScannerMode::Liquidity => self.liquidity_watchlist_limit,
            ScannerMode::Levels => self.levels_watchlist_limit,
        }
    }

    /// Set scanner mode
    pub fn with_mode(mut self, mode: ScannerMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set minimum 24h volume
    pub fn with_min_volume(mut self, min_volume: f64) -> Self {
        self.min_volume = min_volume;
        self
    }

    /// Set decline floor in percent
    pub fn with_max_decline_pct(mut self, max_decline_pct: f64) -> Self {
        self.max_decline_pct = max_decline_pct;
        self
    }

    /// Set scanned timeframes
    pub fn with_timeframes(mut self, timeframes: impl IntoIterator<Item = Timeframe>) -> Self {
        self.timeframes = timeframes.into_iter().collect();
        self
    }

    /// Set retry policy for upstream calls
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set circuit breaker configuration
    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    /// Set trade ring buffer capacity
    pub fn with_trade_buffer_capacity(mut self, capacity: usize) -> Self {
        self.trade_buffer_capacity = capacity.max(1);
        self
    }

    /// Set every stagger delay at once
    pub fn with_staggers(mut self, trade: Duration, level_symbol: Duration, level_timeframe: Duration) -> Self {
        self.trade_subscription_stagger = trade;
        self.level_symbol_stagger = level_symbol;
        self.level_timeframe_stagger = level_timeframe;
        self
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(error) => {
                warn!(key, %raw, %error, "Invalid environment override, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_secs_or(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs()))
}

fn env_interval_or(key: &str, default: Duration) -> Duration {
    non_zero_or(key, env_secs_or(key, default), default)
}

fn non_zero_or(key: &str, interval: Duration, default: Duration) -> Duration {
    if interval.is_zero() {
        warn!(key, "Refresh interval must be non-zero, using default");
        default
    } else {
        interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ScannerConfig::default();
        assert_eq!(config.mode, ScannerMode::Liquidity);
        assert_eq!(config.watchlist_limit(), 15);
        assert_eq!(config.max_decline_pct, -10.0);
        assert_eq!(config.watchlist_ttl, Duration::from_secs(30));
        assert_eq!(config.level_cache_ttl, Duration::from_secs(300));
        assert_eq!(config.trade_buffer_capacity, 100);
        assert_eq!(config.timeframes.len(), 7);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
    }

    #[test]
    fn test_config_builder() {
        let config = ScannerConfig::default()
            .with_mode(ScannerMode::Levels)
            .with_min_volume(5_000_000.0)
            .with_max_decline_pct(-20.0)
            .with_timeframes([Timeframe::H1, Timeframe::H4])
            .with_trade_buffer_capacity(0);

        assert_eq!(config.watchlist_limit(), 10);
        assert_eq!(config.min_volume, 5_000_000.0);
        assert_eq!(config.max_decline_pct, -20.0);
        assert_eq!(config.timeframes, vec![Timeframe::H1, Timeframe::H4]);
        assert_eq!(config.trade_buffer_capacity, 1);
    }

    #[test]
    fn test_zero_refresh_interval_falls_back() {
        struct TestCase {
            interval: Duration,
            expected: Duration,
        }

        let tests = vec![
            TestCase {
                // TC0: zero is rejected
                interval: Duration::ZERO,
                expected: Duration::from_secs(30),
            },
            TestCase {
                // TC1: non-zero is kept
                interval: Duration::from_secs(5),
                expected: Duration::from_secs(5),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = non_zero_or("SCANNER_WATCHLIST_REFRESH_SECS", test.interval, Duration::from_secs(30));
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("Levels".parse::<ScannerMode>(), Ok(ScannerMode::Levels));
        assert_eq!(" liquidity ".parse::<ScannerMode>(), Ok(ScannerMode::Liquidity));
        assert!("backtest".parse::<ScannerMode>().is_err());
    }
}
