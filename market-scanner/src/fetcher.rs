//! Resilient upstream access: staggered scheduling, retry with backoff, a circuit breaker
//! for the level pipeline and a candle cache with stale fallback.

use crate::{
    cache::TtlCache,
    circuit::CircuitBreaker,
    config::ScannerConfig,
    error::ScannerError,
    exchange::MarketDataSource,
    types::{AssetContext, Candle, Symbol, Timeframe, Trade},
};
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Retry policy for one upstream operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Backoff unit
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Wait after failed attempt number `attempt` (1-based).
    ///
    /// Rate limits back off exponentially, everything else linearly in the attempts left.
    pub fn delay_after(&self, attempt: u32, error: &ScannerError) -> Duration {
        let factor = if error.is_rate_limit() {
            2u32.saturating_pow(attempt.saturating_sub(1))
        } else {
            self.max_attempts.saturating_sub(attempt)
        };
        self.base_delay.checked_mul(factor).unwrap_or(Duration::MAX)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or the attempts
    /// are exhausted.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, ScannerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ScannerError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if !error.is_retryable() || attempt >= self.max_attempts => {
                    return Err(error);
                }
                Err(error) => {
                    let delay = self.delay_after(attempt, &error);
                    debug!(
                        label,
                        attempt,
                        max_attempts = self.max_attempts,
                        %error,
                        "Upstream call failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Run `f` over `items`, starting the i-th job after `i * stagger`, and collect the
/// outputs in input order.
pub async fn staggered<I, F, Fut>(items: I, stagger: Duration, mut f: F) -> Vec<Fut::Output>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future,
{
    let jobs = items.into_iter().enumerate().map(|(index, item)| {
        let delay = stagger * u32::try_from(index).unwrap_or(u32::MAX);
        let job = f(item);
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            job.await
        }
    });

    join_all(jobs).await
}

/// Where a fetched value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    /// Fetched from upstream just now
    Fresh,
    /// Served from cache within TTL
    Cached,
    /// Upstream failed or was suppressed, served from an expired cache entry
    Stale,
}

/// Shared payload plus its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub value: Arc<T>,
    pub source: FetchSource,
}

impl<T> Fetched<T> {
    pub fn new(value: Arc<T>, source: FetchSource) -> Self {
        Self { value, source }
    }

    /// True when the value was served without going to upstream within TTL.
    pub fn is_cached(&self) -> bool {
        self.source == FetchSource::Cached
    }
}

/// Upstream access wrapper owned by the coordinator.
#[derive(Debug)]
pub struct ResilientFetcher<S> {
    source: Arc<S>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    candles: TtlCache<(Symbol, Timeframe), Vec<Candle>>,
    candle_lookback: usize,
}

impl<S> ResilientFetcher<S>
where
    S: MarketDataSource,
{
    pub fn new(source: Arc<S>, config: &ScannerConfig) -> Self {
        Self {
            source,
            retry: config.retry,
            breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            candles: TtlCache::new(config.level_cache_ttl),
            candle_lookback: config.candle_lookback.max(1),
        }
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Batched universe snapshot with retry. The breaker only guards the level pipeline.
    pub async fn universe_snapshot(&self) -> Result<Vec<AssetContext>, ScannerError> {
        self.retry
            .run("universe_snapshot", move || self.source.universe_snapshot())
            .await
    }

    /// Recent trade tape for seeding a trade buffer. Degrades to an empty tape.
    pub async fn recent_trades(&self, symbol: &str, limit: usize) -> Vec<Trade> {
        match self
            .retry
            .run("recent_trades", move || self.source.recent_trades(symbol, limit))
            .await
        {
            Ok(trades) => trades,
            Err(error) => {
                warn!(%symbol, %error, "Failed to fetch recent trades, starting with empty tape");
                Vec::new()
            }
        }
    }

    /// Candles for `symbol` on `timeframe` covering the configured lookback.
    ///
    /// Served from cache within TTL. Otherwise fetched with retry unless the breaker is
    /// open; a failed or suppressed fetch falls back to the last cached value.
    pub async fn candles(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
    ) -> Result<Fetched<Vec<Candle>>, ScannerError> {
        let key = (symbol.clone(), timeframe);

        if let Some(candles) = self.candles.get_fresh(&key) {
            return Ok(Fetched::new(candles, FetchSource::Cached));
        }

        if !self.breaker.is_allowed() {
            debug!(%symbol, %timeframe, "Circuit open, skipping candle fetch");
            return self.stale_or(&key, ScannerError::CircuitOpen);
        }

        let (start, end) = self.candle_window(timeframe, Utc::now());
        let result = self
            .retry
            .run("candles", move || {
                self.source.candles(symbol, timeframe, start, end)
            })
            .await;

        match result {
            Ok(candles) => {
                self.breaker.record_success();
                Ok(Fetched::new(
                    self.candles.insert(key, candles),
                    FetchSource::Fresh,
                ))
            }
            Err(error) => {
                if error.counts_against_breaker() {
                    self.breaker.record_failure();
                }
                warn!(%symbol, %timeframe, %error, "Candle fetch failed");
                self.stale_or(&key, error)
            }
        }
    }

    /// Drop cached candles for symbols no longer watched.
    pub fn retain_symbols(&self, mut keep: impl FnMut(&Symbol) -> bool) {
        self.candles.retain(|(symbol, _)| keep(symbol));
    }

    fn candle_window(&self, timeframe: Timeframe, end: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let count = i32::try_from(self.candle_lookback).unwrap_or(i32::MAX);
        let span = timeframe
            .duration()
            .checked_mul(count)
            .unwrap_or(TimeDelta::MAX);
        let start = end.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC);
        (start, end)
    }

    fn stale_or(
        &self,
        key: &(Symbol, Timeframe),
        error: ScannerError,
    ) -> Result<Fetched<Vec<Candle>>, ScannerError> {
        match self.candles.get_stale(key) {
            Some(candles) => {
                debug!(symbol = %key.0, timeframe = %key.1, "Serving stale candles");
                Ok(Fetched::new(candles, FetchSource::Stale))
            }
            None => Err(error),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        exchange::{Subscription, SubscriptionHandle},
        types::{MidPrices, Side},
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    /// Scriptable source counting every upstream call.
    #[derive(Debug)]
    pub(crate) struct MockSource {
        pub universe: Mutex<Result<Vec<AssetContext>, ScannerError>>,
        pub candles: Mutex<Result<Vec<Candle>, ScannerError>>,
        pub trades: Mutex<Result<Vec<Trade>, ScannerError>>,
        pub universe_calls: AtomicUsize,
        pub candle_calls: AtomicUsize,
    }

    impl Default for MockSource {
        fn default() -> Self {
            Self {
                universe: Mutex::new(Ok(Vec::new())),
                candles: Mutex::new(Ok(Vec::new())),
                trades: Mutex::new(Ok(Vec::new())),
                universe_calls: AtomicUsize::new(0),
                candle_calls: AtomicUsize::new(0),
            }
        }
    }

    impl MockSource {
        pub fn with_candles(candles: Result<Vec<Candle>, ScannerError>) -> Self {
            let source = Self::default();
            source.set_candles(candles);
            source
        }

        pub fn set_candles(&self, candles: Result<Vec<Candle>, ScannerError>) {
            *self.candles.lock() = candles;
        }

        pub fn set_universe(&self, universe: Result<Vec<AssetContext>, ScannerError>) {
            *self.universe.lock() = universe;
        }

        pub fn candle_calls(&self) -> usize {
            self.candle_calls.load(Ordering::SeqCst)
        }

        pub fn universe_calls(&self) -> usize {
            self.universe_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MarketDataSource for MockSource {
        async fn universe_snapshot(&self) -> Result<Vec<AssetContext>, ScannerError> {
            self.universe_calls.fetch_add(1, Ordering::SeqCst);
            self.universe.lock().clone()
        }

        async fn candles(
            &self,
            _: &str,
            _: Timeframe,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<Vec<Candle>, ScannerError> {
            self.candle_calls.fetch_add(1, Ordering::SeqCst);
            self.candles.lock().clone()
        }

        async fn recent_trades(&self, _: &str, _: usize) -> Result<Vec<Trade>, ScannerError> {
            self.trades.lock().clone()
        }

        fn subscribe_mid_prices(&self) -> Subscription<MidPrices> {
            let (_tx, rx) = mpsc::channel(1);
            Subscription::new(rx, SubscriptionHandle::new(None))
        }

        fn subscribe_trades(&self, _: &str) -> Subscription<Vec<Trade>> {
            let (_tx, rx) = mpsc::channel(1);
            Subscription::new(rx, SubscriptionHandle::new(None))
        }
    }

    fn candle(close: f64) -> Candle {
        Candle::new(Utc::now(), close, close + 1.0, close - 1.0, close, 10.0)
    }

    fn transport_error() -> ScannerError {
        ScannerError::Transport("connection reset".to_string())
    }

    fn fetcher(source: Arc<MockSource>) -> ResilientFetcher<MockSource> {
        ResilientFetcher::new(source, &ScannerConfig::default())
    }

    #[test]
    fn test_retry_delay_after() {
        struct TestCase {
            attempt: u32,
            error: ScannerError,
            expected: Duration,
        }

        let policy = RetryPolicy::default();
        let tests = vec![
            TestCase {
                // TC0: first failure waits for two remaining attempts
                attempt: 1,
                error: transport_error(),
                expected: Duration::from_secs(4),
            },
            TestCase {
                // TC1: second failure waits for one remaining attempt
                attempt: 2,
                error: transport_error(),
                expected: Duration::from_secs(2),
            },
            TestCase {
                // TC2: rate limit backs off exponentially
                attempt: 1,
                error: ScannerError::RateLimited("429".to_string()),
                expected: Duration::from_secs(2),
            },
            TestCase {
                // TC3: rate limit on second attempt
                attempt: 2,
                error: ScannerError::RateLimited("429".to_string()),
                expected: Duration::from_secs(4),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = policy.delay_after(test.attempt, &test.error);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Result<(), _> = RetryPolicy::default()
            .run("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(transport_error())
            })
            .await;

        assert_eq!(result, Err(transport_error()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_does_not_retry_parse_errors() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Result<(), _> = RetryPolicy::default()
            .run("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ScannerError::parse("ETH", "markPx", "abc"))
            })
            .await;

        assert_eq!(result, Err(ScannerError::parse("ETH", "markPx", "abc")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_staggered_preserves_order_and_spacing() {
        let started = tokio::time::Instant::now();
        let offsets = staggered(0..3u32, Duration::from_millis(100), |index| async move {
            (index, started.elapsed())
        })
        .await;

        assert_eq!(offsets.len(), 3);
        for (item, offset) in offsets {
            assert_eq!(offset, Duration::from_millis(100) * item);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_candles_cached_within_ttl() {
        let source = Arc::new(MockSource::with_candles(Ok(vec![candle(100.0)])));
        let fetcher = fetcher(Arc::clone(&source));
        let symbol = Symbol::new("BTC");

        let first = assert_ok!(fetcher.candles(&symbol, Timeframe::H1).await);
        let second = assert_ok!(fetcher.candles(&symbol, Timeframe::H1).await);

        assert_eq!(first.source, FetchSource::Fresh);
        assert_eq!(second.source, FetchSource::Cached);
        assert!(Arc::ptr_eq(&first.value, &second.value));
        assert_eq!(source.candle_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_suppresses_network_after_five_failures() {
        let source = Arc::new(MockSource::with_candles(Ok(vec![candle(64_000.0)])));
        let fetcher = fetcher(Arc::clone(&source)).with_retry(RetryPolicy::new(1, Duration::ZERO));
        let cached = Symbol::new("BTC");
        let symbol = Symbol::new("ETH");

        // BTC has an expired cache entry by the time the breaker trips
        assert_ok!(fetcher.candles(&cached, Timeframe::H1).await);
        tokio::time::advance(Duration::from_secs(301)).await;
        source.set_candles(Err(transport_error()));

        for _ in 0..5 {
            assert_err!(fetcher.candles(&symbol, Timeframe::M5).await);
        }
        assert_eq!(source.candle_calls(), 6);

        // Sixth fetch makes no network call
        let suppressed = fetcher.candles(&symbol, Timeframe::M5).await;
        assert_eq!(suppressed, Err(ScannerError::CircuitOpen));
        assert_eq!(source.candle_calls(), 6);

        // Open circuit still serves what is cached
        let stale = assert_ok!(fetcher.candles(&cached, Timeframe::H1).await);
        assert_eq!(stale.source, FetchSource::Stale);
        assert_eq!(stale.value[0].close, 64_000.0);
        assert_eq!(source.candle_calls(), 6);

        // After the cooldown the trial call goes through and closes the circuit
        tokio::time::advance(Duration::from_secs(60)).await;
        source.set_candles(Ok(vec![candle(10.0)]));
        let trial = assert_ok!(fetcher.candles(&symbol, Timeframe::M5).await);
        assert_eq!(trial.source, FetchSource::Fresh);
        assert_eq!(source.candle_calls(), 7);
        assert!(fetcher.breaker().is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_candles_served_after_retries_fail() {
        let source = Arc::new(MockSource::with_candles(Ok(vec![candle(42.0)])));
        let fetcher = fetcher(Arc::clone(&source));
        let symbol = Symbol::new("SOL");

        fetcher.candles(&symbol, Timeframe::H4).await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        source.set_candles(Err(transport_error()));

        let stale = assert_ok!(fetcher.candles(&symbol, Timeframe::H4).await);
        assert_eq!(stale.source, FetchSource::Stale);
        assert_eq!(stale.value.len(), 1);
        assert_eq!(stale.value[0].close, 42.0);
        // One success plus three failed attempts
        assert_eq!(source.candle_calls(), 4);
        assert_eq!(fetcher.breaker().consecutive_errors(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_trades_degrade_to_empty() {
        let source = Arc::new(MockSource::default());
        let fetcher = fetcher(Arc::clone(&source));

        *source.trades.lock() = Ok(vec![Trade::new(
            Utc::now(),
            Symbol::new("BTC"),
            Side::Buy,
            100.0,
            1.0,
        )]);
        assert_eq!(fetcher.recent_trades("BTC", 100).await.len(), 1);

        *source.trades.lock() = Err(transport_error());
        assert!(fetcher.recent_trades("BTC", 100).await.is_empty());
    }
}
