//! Token universe selection.
//!
//! One batched upstream call yields every listed symbol. Parsed rows are ranked by 24h
//! notional volume and cached; filters and the watch-list bound are applied on read so
//! callers with different limits share the same upstream call.

use crate::{
    cache::TtlCache,
    error::ScannerError,
    exchange::MarketDataSource,
    fetcher::ResilientFetcher,
    types::{AssetContext, TokenDescriptor},
};
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Selects and caches the ranked token universe.
#[derive(Debug)]
pub struct TokenUniverseSelector<S> {
    fetcher: Arc<ResilientFetcher<S>>,
    cache: TtlCache<(), Vec<TokenDescriptor>>,
    refresh: Mutex<()>,
}

impl<S> TokenUniverseSelector<S>
where
    S: MarketDataSource,
{
    pub fn new(fetcher: Arc<ResilientFetcher<S>>, ttl: Duration) -> Self {
        Self {
            fetcher,
            cache: TtlCache::new(ttl),
            refresh: Mutex::new(()),
        }
    }

    /// Bounded watch-list, never failing: an empty list is returned when nothing was
    /// ever fetched.
    pub async fn select_universe(
        &self,
        min_volume: f64,
        max_decline_pct: f64,
        limit: usize,
    ) -> Vec<TokenDescriptor> {
        self.try_select_universe(min_volume, max_decline_pct, limit)
            .await
            .unwrap_or_default()
    }

    /// Bounded watch-list, failing only when upstream is down and no list was ever cached.
    pub async fn try_select_universe(
        &self,
        min_volume: f64,
        max_decline_pct: f64,
        limit: usize,
    ) -> Result<Vec<TokenDescriptor>, ScannerError> {
        let universe = self.universe().await?;
        Ok(filter_universe(&universe, min_volume, max_decline_pct, limit))
    }

    /// Drop the cached universe so the next read refetches.
    pub fn invalidate(&self) {
        self.cache.clear();
    }

    async fn universe(&self) -> Result<Arc<Vec<TokenDescriptor>>, ScannerError> {
        if let Some(universe) = self.cache.get_fresh(&()) {
            return Ok(universe);
        }

        // Single flight: whoever waited on the lock reuses the winner's result
        let _refresh = self.refresh.lock().await;
        if let Some(universe) = self.cache.get_fresh(&()) {
            return Ok(universe);
        }

        match self.fetcher.universe_snapshot().await {
            Ok(contexts) => {
                let universe = parse_universe(&contexts);
                info!(
                    listed = contexts.len(),
                    parsed = universe.len(),
                    "Refreshed token universe"
                );
                Ok(self.cache.insert((), universe))
            }
            Err(fetch_error) => match self.cache.get_stale(&()) {
                Some(stale) => {
                    warn!(%fetch_error, "Universe refresh failed, serving stale watch-list");
                    Ok(stale)
                }
                None => {
                    error!(%fetch_error, "Universe refresh failed with no cached watch-list");
                    Err(ScannerError::UpstreamUnavailable(format!(
                        "token universe unavailable: {fetch_error}"
                    )))
                }
            },
        }
    }
}

/// Parse raw rows into descriptors ranked by 24h volume, descending.
///
/// A row with a missing or non-numeric field, or a non-positive previous close, is
/// excluded on its own.
pub fn parse_universe(contexts: &[AssetContext]) -> Vec<TokenDescriptor> {
    let mut universe: Vec<TokenDescriptor> = contexts
        .iter()
        .filter_map(|context| match parse_descriptor(context) {
            Ok(descriptor) => Some(descriptor),
            Err(error) => {
                debug!(%error, "Excluding symbol from universe");
                None
            }
        })
        .collect();

    universe.sort_by(|a, b| b.volume_24h.total_cmp(&a.volume_24h));
    universe
}

/// Apply the volume floor and decline floor to a ranked universe and bound it to `limit`.
pub fn filter_universe(
    universe: &[TokenDescriptor],
    min_volume: f64,
    max_decline_pct: f64,
    limit: usize,
) -> Vec<TokenDescriptor> {
    universe
        .iter()
        .filter(|token| token.volume_24h >= min_volume && token.change_24h_pct > max_decline_pct)
        .take(limit)
        .cloned()
        .collect()
}

fn parse_descriptor(context: &AssetContext) -> Result<TokenDescriptor, ScannerError> {
    let volume = parse_field(context, "dayNtlVlm", context.day_notional_volume.as_deref())?;
    let mark = parse_field(context, "markPx", context.mark_price.as_deref())?;
    let prev_close = parse_field(context, "prevDayPx", context.prev_day_price.as_deref())?;

    if prev_close <= 0.0 {
        return Err(ScannerError::parse(
            context.symbol.clone(),
            "prevDayPx",
            prev_close.to_string(),
        ));
    }

    let change_pct = (mark - prev_close) / prev_close * 100.0;
    Ok(TokenDescriptor::new(
        context.symbol.clone(),
        mark,
        volume,
        change_pct,
    ))
}

fn parse_field(context: &AssetContext, field: &str, raw: Option<&str>) -> Result<f64, ScannerError> {
    raw.and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .ok_or_else(|| ScannerError::parse(context.symbol.clone(), field, raw.unwrap_or_default()))
}
