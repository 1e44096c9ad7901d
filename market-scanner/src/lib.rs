//! Market Scanner - Shared Library
//!
//! Continuously selects a bounded universe of liquid perpetuals and, per symbol:
//! - liquidity mode: folds the live trade tape into directional flow metrics
//! - levels mode: detects multi-timeframe support/resistance by touch counting
//!
//! Upstream access goes through a [`ResilientFetcher`] (stagger, retry, circuit
//! breaker, TTL caches with stale fallback) and the [`ScannerCoordinator`]
//! publishes immutable [`ScannerSnapshot`]s for presentation layers.
pub mod cache;
pub mod circuit;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod exchange;
pub mod fetcher;
pub mod levels;
pub mod liquidity;
pub mod types;
pub mod universe;

// Re-export commonly used types for convenience
pub use types::{AssetContext, Candle, MidPrices, Side, Symbol, Timeframe, TokenDescriptor, Trade};

pub use cache::TtlCache;
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{ScannerConfig, ScannerMode};
pub use error::ScannerError;
pub use exchange::{
    ActiveFlag, MarketDataSource, Subscription, SubscriptionHandle,
    hyperliquid::{HyperliquidClient, HyperliquidConfig},
};
pub use fetcher::{FetchSource, Fetched, ResilientFetcher, RetryPolicy, staggered};
pub use levels::{
    ClosestKind, ClosestLevel, Level, LevelKind, LevelSummary, TimeframeLevels, detect_levels,
    resolve_closest,
};
pub use liquidity::{FlowDirection, FlowIntensity, LiquiditySnapshot, TradeBuffer, analyze};
pub use universe::TokenUniverseSelector;

// Coordinator (shared across all presentation consumers)
pub use coordinator::{ScannerCoordinator, ScannerSnapshot, ScannerToken, SymbolPhase, TokenLevels};
