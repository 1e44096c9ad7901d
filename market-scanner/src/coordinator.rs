//! Scanner coordinator.
//!
//! Owns the watch-list and the latest state per symbol, fans out live subscriptions and
//! level refreshes, and publishes every change as an immutable [`ScannerSnapshot`] on a
//! watch channel. State lives behind a short synchronous lock that is never held across
//! an `.await`, so readers only ever see whole per-symbol updates.

use crate::{
    config::{MIN_REFRESH_INTERVAL, ScannerConfig, ScannerMode},
    error::ScannerError,
    exchange::{MarketDataSource, Subscription, SubscriptionHandle},
    fetcher::{ResilientFetcher, staggered},
    levels::{LevelSummary, TimeframeLevels, detect_levels, resolve_closest},
    liquidity::{LiquiditySnapshot, TradeBuffer},
    types::{MidPrices, Symbol, Timeframe, TokenDescriptor, Trade},
    universe::TokenUniverseSelector,
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info, warn};

/// Lifecycle of one watched symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolPhase {
    /// Selected but no live price yet
    Uninitialized,
    /// At least one live price tick received
    Priced,
}

/// Levels for one symbol across timeframes.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TokenLevels {
    pub by_timeframe: BTreeMap<Timeframe, TimeframeLevels>,
    #[serde(flatten)]
    pub summary: LevelSummary,
    pub updated_at: DateTime<Utc>,
}

/// Presentation view of one watched symbol.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScannerToken {
    pub symbol: Symbol,
    pub price: f64,
    pub volume_24h: f64,
    pub change_24h_pct: f64,
    pub phase: SymbolPhase,
    pub liquidity_ready: bool,
    pub levels_ready: bool,
    pub liquidity: Option<LiquiditySnapshot>,
    pub levels: Option<TokenLevels>,
}

impl ScannerToken {
    fn new(descriptor: &TokenDescriptor) -> Self {
        Self {
            symbol: descriptor.symbol.clone(),
            price: descriptor.price,
            volume_24h: descriptor.volume_24h,
            change_24h_pct: descriptor.change_24h_pct,
            phase: SymbolPhase::Uninitialized,
            liquidity_ready: false,
            levels_ready: false,
            liquidity: None,
            levels: None,
        }
    }

    /// Take the new 24h stats; keep the live price once one has arrived.
    fn update_descriptor(&mut self, descriptor: &TokenDescriptor) {
        self.volume_24h = descriptor.volume_24h;
        self.change_24h_pct = descriptor.change_24h_pct;
        if self.phase == SymbolPhase::Uninitialized {
            self.price = descriptor.price;
        }
    }
}

/// Immutable view of the whole scanner, published after every state change.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScannerSnapshot {
    pub mode: ScannerMode,
    /// Watched tokens in watch-list rank order
    pub tokens: Vec<ScannerToken>,
    /// True until the first watch-list refresh completes
    pub loading: bool,
    /// Set only when the watch-list is unavailable even from cache
    pub last_error: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
}

impl ScannerSnapshot {
    fn initial(mode: ScannerMode) -> Self {
        Self {
            mode,
            tokens: Vec::new(),
            loading: true,
            last_error: None,
            last_update: None,
        }
    }

    pub fn token(&self, symbol: &str) -> Option<&ScannerToken> {
        self.tokens.iter().find(|token| token.symbol.as_str() == symbol)
    }
}

/// Live subscription plus the task consuming it. Dropping it tears both down.
#[derive(Debug)]
struct LiveFeed {
    handle: SubscriptionHandle,
    consumer: JoinHandle<()>,
}

impl LiveFeed {
    fn is_finished(&self) -> bool {
        self.consumer.is_finished()
    }
}

impl Drop for LiveFeed {
    fn drop(&mut self) {
        self.handle.cancel();
        self.consumer.abort();
    }
}

#[derive(Debug)]
struct SymbolState {
    token: ScannerToken,
    trades: TradeBuffer,
    trade_feed: Option<LiveFeed>,
}

impl SymbolState {
    fn needs_trade_feed(&self) -> bool {
        self.trade_feed.as_ref().is_none_or(LiveFeed::is_finished)
    }

    fn push_trades(&mut self, trades: impl IntoIterator<Item = Trade>) {
        self.trades.extend(trades);
        self.refresh_liquidity();
    }

    /// Seed from the recent trade tape. A restarted feed keeps its buffer, so only trades
    /// newer than the buffered ones are taken.
    fn seed_trades(&mut self, trades: Vec<Trade>) {
        self.trades.extend_newer(trades);
        self.refresh_liquidity();
    }

    fn refresh_liquidity(&mut self) {
        self.token.liquidity = self.trades.snapshot();
        self.token.liquidity_ready = self.token.liquidity.is_some();
    }
}

#[derive(Debug)]
struct CoordinatorState {
    mode: ScannerMode,
    symbols: IndexMap<Symbol, SymbolState>,
    mid_feed: Option<LiveFeed>,
    loading: bool,
    last_error: Option<String>,
    last_update: Option<DateTime<Utc>>,
    shutdown: bool,
}

impl CoordinatorState {
    fn snapshot(&self) -> ScannerSnapshot {
        ScannerSnapshot {
            mode: self.mode,
            tokens: self
                .symbols
                .values()
                .map(|symbol| symbol.token.clone())
                .collect(),
            loading: self.loading,
            last_error: self.last_error.clone(),
            last_update: self.last_update,
        }
    }
}

/// State shared with the subscription consumer tasks.
#[derive(Debug)]
struct Shared {
    state: RwLock<CoordinatorState>,
    snapshots: watch::Sender<Arc<ScannerSnapshot>>,
}

impl Shared {
    fn publish(&self, state: &CoordinatorState) {
        self.snapshots.send_replace(Arc::new(state.snapshot()));
    }
}

/// Drives the watch-list, live feeds and level refreshes for one scanner mode.
#[derive(Debug)]
pub struct ScannerCoordinator<S> {
    config: ScannerConfig,
    fetcher: Arc<ResilientFetcher<S>>,
    selector: TokenUniverseSelector<S>,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
}

impl<S> ScannerCoordinator<S>
where
    S: MarketDataSource,
{
    pub fn new(source: Arc<S>, config: ScannerConfig) -> Self {
        let fetcher = Arc::new(ResilientFetcher::new(source, &config));
        let selector = TokenUniverseSelector::new(Arc::clone(&fetcher), config.watchlist_ttl);
        let (snapshots, _) = watch::channel(Arc::new(ScannerSnapshot::initial(config.mode)));
        let (shutdown_tx, _) = watch::channel(false);

        let state = CoordinatorState {
            mode: config.mode,
            symbols: IndexMap::new(),
            mid_feed: None,
            loading: true,
            last_error: None,
            last_update: None,
            shutdown: false,
        };

        Self {
            config,
            fetcher,
            selector,
            shared: Arc::new(Shared {
                state: RwLock::new(state),
                snapshots,
            }),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    pub fn fetcher(&self) -> &Arc<ResilientFetcher<S>> {
        &self.fetcher
    }

    pub fn selector(&self) -> &TokenUniverseSelector<S> {
        &self.selector
    }

    /// Receiver of every published snapshot, starting with the latest.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ScannerSnapshot>> {
        self.shared.snapshots.subscribe()
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<ScannerSnapshot> {
        Arc::clone(&self.shared.snapshots.borrow())
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Select the universe, apply the diff to the watched set and (re)start live feeds.
    ///
    /// Fails only when no watch-list can be obtained even from cache; the error is also
    /// recorded in the published snapshot.
    pub async fn refresh_watchlist(&self) -> Result<(), ScannerError> {
        if self.is_shutdown() {
            return Ok(());
        }

        let selected = self
            .selector
            .try_select_universe(
                self.config.min_volume,
                self.config.max_decline_pct,
                self.config.watchlist_limit(),
            )
            .await;

        let descriptors = match selected {
            Ok(descriptors) => descriptors,
            Err(error) => {
                error!(%error, "Watch-list unavailable");
                let mut state = self.shared.state.write();
                state.loading = false;
                state.last_error = Some(error.to_string());
                self.shared.publish(&state);
                return Err(error);
            }
        };

        let needs_feed = {
            let mut state = self.shared.state.write();
            if state.shutdown {
                return Ok(());
            }
            let (added, removed) = apply_watchlist(&mut state, &descriptors, self.config.trade_buffer_capacity);
            state.loading = false;
            state.last_error = None;
            state.last_update = Some(Utc::now());
            self.shared.publish(&state);

            if !added.is_empty() || !removed.is_empty() {
                info!(?added, ?removed, watched = state.symbols.len(), "Watch-list updated");
            }

            match self.config.mode {
                ScannerMode::Liquidity => state
                    .symbols
                    .iter()
                    .filter(|(_, symbol)| symbol.needs_trade_feed())
                    .map(|(symbol, _)| symbol.clone())
                    .collect::<Vec<_>>(),
                ScannerMode::Levels => Vec::new(),
            }
        };

        let watched: Vec<Symbol> = descriptors.iter().map(|token| token.symbol.clone()).collect();
        self.fetcher.retain_symbols(|symbol| watched.contains(symbol));

        self.ensure_mid_feed();

        staggered(needs_feed, self.config.trade_subscription_stagger, |symbol| {
            self.start_trade_feed(symbol)
        })
        .await;

        Ok(())
    }

    /// Fetch candles, detect and resolve levels for every watched symbol.
    ///
    /// Symbols are staggered; failures stay isolated to one symbol and timeframe.
    pub async fn refresh_levels(&self) {
        if self.is_shutdown() {
            return;
        }

        let symbols: Vec<Symbol> = self.shared.state.read().symbols.keys().cloned().collect();
        debug!(symbols = symbols.len(), "Refreshing levels");

        staggered(symbols, self.config.level_symbol_stagger, |symbol| {
            self.refresh_symbol_levels(symbol)
        })
        .await;
    }

    /// Refresh the watch-list every `watchlist_refresh_interval` and, in levels mode, the
    /// levels every `level_refresh_interval`, until [`Self::shutdown`].
    pub async fn run(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }

        info!(mode = ?self.config.mode, "Scanner coordinator running");
        let mut watchlist_tick = interval(self.config.watchlist_refresh_interval.max(MIN_REFRESH_INTERVAL));
        watchlist_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut level_tick = interval(self.config.level_refresh_interval.max(MIN_REFRESH_INTERVAL));
        level_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let levels_mode = self.config.mode == ScannerMode::Levels;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                _ = watchlist_tick.tick() => {
                    if let Err(error) = self.refresh_watchlist().await {
                        warn!(%error, "Watch-list refresh failed");
                    }
                }

                _ = level_tick.tick(), if levels_mode => {
                    self.refresh_levels().await;
                }
            }
        }

        info!("Scanner coordinator stopped");
    }

    /// Stop [`Self::run`] and cancel every subscription. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }

        let (mid_feed, trade_feeds) = {
            let mut state = self.shared.state.write();
            state.shutdown = true;
            let trade_feeds: Vec<LiveFeed> = state
                .symbols
                .values_mut()
                .filter_map(|symbol| symbol.trade_feed.take())
                .collect();
            (state.mid_feed.take(), trade_feeds)
        };

        info!(trade_feeds = trade_feeds.len(), "Scanner coordinator shutting down");
        drop(mid_feed);
        drop(trade_feeds);
    }

    fn ensure_mid_feed(&self) {
        let running = self
            .shared
            .state
            .read()
            .mid_feed
            .as_ref()
            .is_some_and(|feed| !feed.is_finished());
        if running {
            return;
        }

        let subscription = self.fetcher.source().subscribe_mid_prices();
        let mut state = self.shared.state.write();
        if state.shutdown {
            return;
        }
        debug!("Starting mid-price feed");
        state.mid_feed = Some(spawn_consumer(
            Arc::clone(&self.shared),
            subscription,
            apply_mid_prices,
        ));
    }

    async fn start_trade_feed(&self, symbol: Symbol) {
        if self.is_shutdown() {
            return;
        }

        let seed = self
            .fetcher
            .recent_trades(&symbol, self.config.trade_buffer_capacity)
            .await;
        let subscription = self.fetcher.source().subscribe_trades(&symbol);

        let mut state = self.shared.state.write();
        if state.shutdown {
            return;
        }
        let Some(entry) = state.symbols.get_mut(&symbol) else {
            debug!(%symbol, "Symbol left the watch-list before its trade feed started");
            return;
        };

        entry.seed_trades(seed);
        let feed_symbol = symbol.clone();
        entry.trade_feed = Some(spawn_consumer(
            Arc::clone(&self.shared),
            subscription,
            move |state: &mut CoordinatorState, trades: Vec<Trade>| {
                apply_trades(state, &feed_symbol, trades)
            },
        ));
        debug!(%symbol, "Trade feed started");
        self.shared.publish(&state);
    }

    async fn refresh_symbol_levels(&self, symbol: Symbol) {
        if self.is_shutdown() {
            return;
        }
        let Some(price) = self
            .shared
            .state
            .read()
            .symbols
            .get(&symbol)
            .map(|entry| entry.token.price)
        else {
            return;
        };

        let mut by_timeframe = BTreeMap::new();
        let mut previous_hit_network = false;
        for &timeframe in &self.config.timeframes {
            if previous_hit_network && !self.config.level_timeframe_stagger.is_zero() {
                tokio::time::sleep(self.config.level_timeframe_stagger).await;
            }

            match self.fetcher.candles(&symbol, timeframe).await {
                Ok(fetched) => {
                    previous_hit_network = !fetched.is_cached();
                    by_timeframe.insert(timeframe, detect_levels(&fetched.value, timeframe, price));
                }
                Err(error) => {
                    previous_hit_network = error != ScannerError::CircuitOpen;
                    debug!(%symbol, %timeframe, %error, "No candles for timeframe");
                }
            }
        }

        if by_timeframe.is_empty() {
            warn!(%symbol, "Level refresh produced no data, keeping previous levels");
            return;
        }

        let summary = resolve_closest(by_timeframe.values(), price);
        let levels = TokenLevels {
            by_timeframe,
            summary,
            updated_at: Utc::now(),
        };

        let mut state = self.shared.state.write();
        if state.shutdown {
            return;
        }
        if let Some(entry) = state.symbols.get_mut(&symbol) {
            entry.token.levels = Some(levels);
            entry.token.levels_ready = true;
            self.shared.publish(&state);
        }
    }
}

impl<S> Drop for ScannerCoordinator<S> {
    fn drop(&mut self) {
        if !self.shutdown_tx.send_replace(true) {
            let mut state = self.shared.state.write();
            state.shutdown = true;
            state.mid_feed = None;
            state.symbols.clear();
        }
    }
}

/// Replace the watched set with `descriptors`, keeping state of retained symbols.
///
/// Returns the added and removed symbols; removed symbols' feeds are dropped.
fn apply_watchlist(
    state: &mut CoordinatorState,
    descriptors: &[TokenDescriptor],
    trade_buffer_capacity: usize,
) -> (Vec<Symbol>, Vec<Symbol>) {
    let mut previous = std::mem::take(&mut state.symbols);
    let mut added = Vec::new();

    for descriptor in descriptors {
        let entry = match previous.shift_remove(&descriptor.symbol) {
            Some(mut entry) => {
                entry.token.update_descriptor(descriptor);
                entry
            }
            None => {
                added.push(descriptor.symbol.clone());
                SymbolState {
                    token: ScannerToken::new(descriptor),
                    trades: TradeBuffer::new(trade_buffer_capacity),
                    trade_feed: None,
                }
            }
        };
        state.symbols.insert(descriptor.symbol.clone(), entry);
    }

    let removed = previous.keys().cloned().collect();
    (added, removed)
}

fn apply_mid_prices(state: &mut CoordinatorState, mids: MidPrices) -> bool {
    let mut changed = false;
    for (symbol, entry) in state.symbols.iter_mut() {
        if let Some(&price) = mids.get(symbol) {
            entry.token.price = price;
            entry.token.phase = SymbolPhase::Priced;
            changed = true;
        }
    }
    if changed {
        state.last_update = Some(Utc::now());
    }
    changed
}

fn apply_trades(state: &mut CoordinatorState, symbol: &Symbol, trades: Vec<Trade>) -> bool {
    match state.symbols.get_mut(symbol) {
        Some(entry) => {
            entry.push_trades(trades);
            true
        }
        None => false,
    }
}

/// Consume `subscription` in order on one task, applying each update under the state lock
/// and publishing when `apply` reports a change.
fn spawn_consumer<T, F>(shared: Arc<Shared>, subscription: Subscription<T>, mut apply: F) -> LiveFeed
where
    T: Send + 'static,
    F: FnMut(&mut CoordinatorState, T) -> bool + Send + 'static,
{
    let Subscription {
        mut updates,
        handle,
    } = subscription;
    let active = handle.flag();

    let consumer = tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            let mut state = shared.state.write();
            if !active.is_active() || state.shutdown {
                break;
            }
            if apply(&mut state, update) {
                shared.publish(&state);
            }
        }
    });

    LiveFeed { handle, consumer }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(symbol: &str, price: f64, volume: f64) -> TokenDescriptor {
        TokenDescriptor::new(Symbol::new(symbol), price, volume, 1.0)
    }

    fn state() -> CoordinatorState {
        CoordinatorState {
            mode: ScannerMode::Liquidity,
            symbols: IndexMap::new(),
            mid_feed: None,
            loading: true,
            last_error: None,
            last_update: None,
            shutdown: false,
        }
    }

    #[test]
    fn test_apply_watchlist_diff() {
        let mut state = state();
        let (added, removed) = apply_watchlist(
            &mut state,
            &[descriptor("BTC", 64_000.0, 9e8), descriptor("ETH", 3_000.0, 3e8)],
            100,
        );
        assert_eq!(added.len(), 2);
        assert!(removed.is_empty());

        // BTC gets a live price, ETH drops out, SOL joins
        apply_mid_prices(&mut state, MidPrices::from_iter([(Symbol::new("BTC"), 65_000.0)]));
        let (added, removed) = apply_watchlist(
            &mut state,
            &[descriptor("SOL", 150.0, 5e8), descriptor("BTC", 63_000.0, 9.5e8)],
            100,
        );

        assert_eq!(added, vec![Symbol::new("SOL")]);
        assert_eq!(removed, vec![Symbol::new("ETH")]);
        let order: Vec<&str> = state.symbols.keys().map(Symbol::as_str).collect();
        assert_eq!(order, vec!["SOL", "BTC"]);

        let btc = &state.symbols["BTC"].token;
        assert_eq!(btc.phase, SymbolPhase::Priced);
        assert_eq!(btc.price, 65_000.0);
        assert_eq!(btc.volume_24h, 9.5e8);
        assert_eq!(state.symbols["SOL"].token.phase, SymbolPhase::Uninitialized);
    }

    #[test]
    fn test_apply_mid_prices_ignores_unwatched() {
        let mut state = state();
        apply_watchlist(&mut state, &[descriptor("BTC", 64_000.0, 9e8)], 100);

        let unrelated = MidPrices::from_iter([(Symbol::new("DOGE"), 0.1)]);
        assert!(!apply_mid_prices(&mut state, unrelated));
        assert_eq!(state.last_update, None);
        assert_eq!(state.symbols["BTC"].token.phase, SymbolPhase::Uninitialized);
    }

    #[test]
    fn test_snapshot_serializes_levels_by_timeframe() {
        let mut state = state();
        apply_watchlist(&mut state, &[descriptor("BTC", 100.0, 9e8)], 100);
        let entry = state.symbols.get_mut("BTC").unwrap();
        entry.token.levels = Some(TokenLevels {
            by_timeframe: BTreeMap::from([(Timeframe::H1, TimeframeLevels::default())]),
            summary: LevelSummary::default(),
            updated_at: Utc::now(),
        });

        let json = serde_json::to_value(state.snapshot()).unwrap();
        assert_eq!(json["mode"], "liquidity");
        assert_eq!(json["tokens"][0]["phase"], "uninitialized");
        assert!(json["tokens"][0]["levels"]["by_timeframe"]["1h"].is_object());
    }
}
