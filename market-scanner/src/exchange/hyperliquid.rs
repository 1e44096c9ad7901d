//! Hyperliquid info API transport.
//!
//! REST: `POST /info` with `metaAndAssetCtxs`, `candleSnapshot` and `recentTrades`.
//! WebSocket: `allMids` for live mid prices and `trades` per coin.
//! See docs: <https://hyperliquid.gitbook.io/hyperliquid-docs/for-developers/api>

use super::{
    MarketDataSource, Subscription,
    feed::{FeedConfig, spawn_feed},
};
use crate::{
    error::ScannerError,
    types::{AssetContext, Candle, MidPrices, Side, Symbol, Timeframe, Trade},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use std::{collections::HashMap, time::Duration};
use tracing::{debug, warn};
use url::Url;

pub const HYPERLIQUID_INFO_URL: &str = "https://api.hyperliquid.xyz/info";
pub const HYPERLIQUID_WS_URL: &str = "wss://api.hyperliquid.xyz/ws";

/// Hyperliquid transport configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HyperliquidConfig {
    /// REST info endpoint
    pub info_url: String,
    /// Live feed settings (endpoint, reconnect policy)
    pub feed: FeedConfig,
    /// Per-request timeout for REST calls
    pub request_timeout: Duration,
}

impl Default for HyperliquidConfig {
    fn default() -> Self {
        Self {
            info_url: HYPERLIQUID_INFO_URL.to_string(),
            feed: FeedConfig::new(HYPERLIQUID_WS_URL),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl HyperliquidConfig {
    /// Build from `HYPERLIQUID_INFO_URL` / `HYPERLIQUID_WS_URL`, falling back to mainnet.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let info_url = env_url("HYPERLIQUID_INFO_URL").unwrap_or(defaults.info_url);
        let feed = env_url("HYPERLIQUID_WS_URL")
            .map(FeedConfig::new)
            .unwrap_or(defaults.feed);

        Self {
            info_url,
            feed,
            request_timeout: defaults.request_timeout,
        }
    }

    /// Set REST request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set live feed configuration
    pub fn with_feed(mut self, feed: FeedConfig) -> Self {
        self.feed = feed;
        self
    }
}

/// [`MarketDataSource`] backed by the Hyperliquid public API.
#[derive(Debug, Clone)]
pub struct HyperliquidClient {
    http: reqwest::Client,
    config: HyperliquidConfig,
}

impl HyperliquidClient {
    pub fn new(config: HyperliquidConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// POST one info request and decode the JSON body.
    async fn post_info<T>(&self, body: serde_json::Value) -> Result<T, ScannerError>
    where
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(self.config.info_url.as_str())
            .timeout(self.config.request_timeout)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        response.json::<T>().await.map_err(|error| {
            ScannerError::UpstreamUnavailable(format!("malformed {} response: {error}", body["type"]))
        })
    }
}

impl Default for HyperliquidClient {
    fn default() -> Self {
        Self::new(HyperliquidConfig::default())
    }
}

#[async_trait]
impl MarketDataSource for HyperliquidClient {
    async fn universe_snapshot(&self) -> Result<Vec<AssetContext>, ScannerError> {
        let (meta, contexts): (HyperliquidMeta, Vec<HyperliquidAssetCtx>) =
            self.post_info(json!({ "type": "metaAndAssetCtxs" })).await?;

        Ok(meta
            .universe
            .into_iter()
            .zip(contexts)
            .filter(|(asset, _)| !asset.is_delisted)
            .map(|(asset, ctx)| AssetContext {
                symbol: Symbol::from(asset.name),
                day_notional_volume: ctx.day_ntl_vlm,
                mark_price: ctx.mark_px,
                prev_day_price: ctx.prev_day_px,
            })
            .collect())
    }

    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ScannerError> {
        let raw: Vec<HyperliquidCandle> = self
            .post_info(json!({
                "type": "candleSnapshot",
                "req": {
                    "coin": symbol,
                    "interval": timeframe.as_str(),
                    "startTime": start.timestamp_millis(),
                    "endTime": end.timestamp_millis(),
                }
            }))
            .await?;

        Ok(raw
            .into_iter()
            .filter_map(|candle| match candle.to_candle(symbol) {
                Ok(candle) => Some(candle),
                Err(error) => {
                    debug!(%error, "Skipping malformed candle");
                    None
                }
            })
            .collect())
    }

    async fn recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>, ScannerError> {
        let raw: Vec<HyperliquidTrade> = self
            .post_info(json!({ "type": "recentTrades", "coin": symbol }))
            .await?;

        let mut trades: Vec<Trade> = raw
            .into_iter()
            .filter_map(|trade| trade.to_trade().ok())
            .collect();
        trades.sort_by_key(|trade| trade.time);

        let skip = trades.len().saturating_sub(limit);
        Ok(trades.split_off(skip))
    }

    fn subscribe_mid_prices(&self) -> Subscription<MidPrices> {
        spawn_feed(
            self.config.feed.clone(),
            json!({ "method": "subscribe", "subscription": { "type": "allMids" } }),
            parse_all_mids,
        )
    }

    fn subscribe_trades(&self, symbol: &str) -> Subscription<Vec<Trade>> {
        let coin = Symbol::from(symbol);
        spawn_feed(
            self.config.feed.clone(),
            json!({ "method": "subscribe", "subscription": { "type": "trades", "coin": symbol } }),
            move |text| parse_trades(text, &coin),
        )
    }
}

/// ### Raw Payload Examples
/// `metaAndAssetCtxs` returns a two element array:
///```json
/// [
///   { "universe": [ { "name": "BTC", "szDecimals": 5, "maxLeverage": 40 } ] },
///   [ { "dayNtlVlm": "1169046.29", "markPx": "14.3161", "prevDayPx": "15.322", "funding": "0.0000125" } ]
/// ]
///```
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct HyperliquidMeta {
    universe: Vec<HyperliquidAsset>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HyperliquidAsset {
    name: String,
    #[serde(default)]
    is_delisted: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HyperliquidAssetCtx {
    #[serde(default)]
    day_ntl_vlm: Option<String>,
    #[serde(default)]
    mark_px: Option<String>,
    #[serde(default)]
    prev_day_px: Option<String>,
}

/// ```json
/// { "t": 1681923600000, "T": 1681924499999, "s": "BTC", "i": "15m",
///   "o": "29295.0", "c": "29258.0", "h": "29309.0", "l": "29250.0", "v": "0.98639", "n": 189 }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct HyperliquidCandle {
    t: i64,
    o: String,
    h: String,
    l: String,
    c: String,
    v: String,
}

impl HyperliquidCandle {
    fn to_candle(&self, symbol: &str) -> Result<Candle, ScannerError> {
        let time = DateTime::from_timestamp_millis(self.t)
            .ok_or_else(|| ScannerError::parse(symbol, "t", self.t.to_string()))?;
        Ok(Candle::new(
            time,
            parse_decimal(symbol, "o", &self.o)?,
            parse_decimal(symbol, "h", &self.h)?,
            parse_decimal(symbol, "l", &self.l)?,
            parse_decimal(symbol, "c", &self.c)?,
            parse_decimal(symbol, "v", &self.v)?,
        ))
    }
}

/// ```json
/// { "coin": "BTC", "side": "B", "px": "64210.0", "sz": "0.015", "time": 1717000000000,
///   "hash": "0x..", "tid": 123456789 }
/// ```
/// `side` is `B` when the buyer was the aggressor and `A` when the seller was.
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct HyperliquidTrade {
    coin: String,
    side: String,
    px: String,
    sz: String,
    time: i64,
}

impl HyperliquidTrade {
    fn to_trade(&self) -> Result<Trade, ScannerError> {
        let side = match self.side.as_str() {
            "B" => Side::Buy,
            "A" => Side::Sell,
            other => return Err(ScannerError::parse(self.coin.as_str(), "side", other)),
        };
        let time = DateTime::from_timestamp_millis(self.time)
            .ok_or_else(|| ScannerError::parse(self.coin.as_str(), "time", self.time.to_string()))?;

        Ok(Trade::new(
            time,
            Symbol::from(self.coin.as_str()),
            side,
            parse_decimal(&self.coin, "px", &self.px)?,
            parse_decimal(&self.coin, "sz", &self.sz)?,
        ))
    }
}

/// Envelope of every WebSocket frame: `{ "channel": "...", "data": ... }`.
#[derive(Debug, Deserialize)]
struct WsEnvelope {
    channel: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AllMidsData {
    mids: HashMap<String, String>,
}

/// Read a URL override, ignoring values that do not parse.
fn env_url(key: &str) -> Option<String> {
    let raw = std::env::var(key).ok()?;
    match Url::parse(&raw) {
        Ok(url) => Some(url.into()),
        Err(error) => {
            warn!(key, %raw, %error, "Invalid URL override, using default");
            None
        }
    }
}

fn parse_decimal(symbol: &str, field: &str, raw: &str) -> Result<f64, ScannerError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| ScannerError::parse(symbol, field, raw))
}

/// Parse an `allMids` frame; other channels are ignored.
fn parse_all_mids(text: &str) -> Option<MidPrices> {
    let envelope = serde_json::from_str::<WsEnvelope>(text).ok()?;
    if envelope.channel != "allMids" {
        return None;
    }
    let data = serde_json::from_value::<AllMidsData>(envelope.data).ok()?;

    Some(
        data.mids
            .into_iter()
            // Spot pairs are keyed "@123"; only perp coins are scanned
            .filter(|(coin, _)| !coin.starts_with('@'))
            .filter_map(|(coin, raw)| {
                let price = parse_decimal(&coin, "mid", &raw).ok()?;
                Some((Symbol::from(coin), price))
            })
            .collect(),
    )
}

/// Parse a `trades` frame for `coin`; frames for other coins or channels are ignored.
fn parse_trades(text: &str, coin: &str) -> Option<Vec<Trade>> {
    let envelope = serde_json::from_str::<WsEnvelope>(text).ok()?;
    if envelope.channel != "trades" {
        return None;
    }
    let raw = serde_json::from_value::<Vec<HyperliquidTrade>>(envelope.data).ok()?;

    let trades: Vec<Trade> = raw
        .iter()
        .filter(|trade| trade.coin == coin)
        .filter_map(|trade| match trade.to_trade() {
            Ok(trade) => Some(trade),
            Err(error) => {
                debug!(%error, "Skipping malformed trade");
                None
            }
        })
        .collect();

    (!trades.is_empty()).then_some(trades)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_and_asset_ctxs_decode() {
        let input = r#"
            [
                { "universe": [
                    { "name": "BTC", "szDecimals": 5, "maxLeverage": 40 },
                    { "name": "OLD", "szDecimals": 0, "maxLeverage": 3, "isDelisted": true }
                ] },
                [
                    { "dayNtlVlm": "80000000.0", "markPx": "95.0", "prevDayPx": "100.0", "funding": "0.00001" },
                    { "dayNtlVlm": "0.0", "markPx": null, "prevDayPx": "1.0" }
                ]
            ]
        "#;

        let (meta, contexts): (HyperliquidMeta, Vec<HyperliquidAssetCtx>) =
            serde_json::from_str(input).unwrap();

        assert_eq!(meta.universe.len(), 2);
        assert!(meta.universe[1].is_delisted);
        assert_eq!(contexts[0].mark_px.as_deref(), Some("95.0"));
        assert_eq!(contexts[1].mark_px, None);
    }

    #[test]
    fn test_candle_conversion() {
        struct TestCase {
            input: &'static str,
            expected_ok: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: valid candle
                input: r#"{"t":1681923600000,"T":1681924499999,"s":"BTC","i":"15m","o":"29295.0","c":"29258.0","h":"29309.0","l":"29250.0","v":"0.98639","n":189}"#,
                expected_ok: true,
            },
            TestCase {
                // TC1: non-numeric high
                input: r#"{"t":1681923600000,"o":"1","c":"1","h":"oops","l":"1","v":"1"}"#,
                expected_ok: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let raw = serde_json::from_str::<HyperliquidCandle>(test.input).unwrap();
            let actual = raw.to_candle("BTC");
            assert_eq!(actual.is_ok(), test.expected_ok, "TC{} failed", index);
        }

        let candle = serde_json::from_str::<HyperliquidCandle>(
            r#"{"t":1681923600000,"o":"29295.0","c":"29258.0","h":"29309.0","l":"29250.0","v":"0.98639"}"#,
        )
        .unwrap()
        .to_candle("BTC")
        .unwrap();
        assert_eq!(candle.high, 29309.0);
        assert_eq!(candle.low, 29250.0);
        assert_eq!(candle.time.timestamp_millis(), 1681923600000);
    }

    #[test]
    fn test_parse_trades_frame() {
        let frame = r#"
            {
                "channel": "trades",
                "data": [
                    { "coin": "ETH", "side": "B", "px": "3000.5", "sz": "2.0", "time": 1717000000000, "hash": "0x1", "tid": 1 },
                    { "coin": "ETH", "side": "A", "px": "3000.0", "sz": "1.5", "time": 1717000000100, "hash": "0x2", "tid": 2 },
                    { "coin": "ETH", "side": "X", "px": "3000.0", "sz": "1.5", "time": 1717000000200, "hash": "0x3", "tid": 3 }
                ]
            }
        "#;

        let trades = parse_trades(frame, "ETH").unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].side, Side::Buy);
        assert_eq!(trades[0].price, 3000.5);
        assert_eq!(trades[1].side, Side::Sell);

        assert!(parse_trades(frame, "BTC").is_none());
        assert!(parse_trades(r#"{"channel":"pong"}"#, "ETH").is_none());
        assert!(parse_trades(r#"{"channel":"subscriptionResponse","data":{}}"#, "ETH").is_none());
    }

    #[test]
    fn test_parse_all_mids_frame() {
        let frame = r#"
            { "channel": "allMids", "data": { "mids": { "BTC": "64210.5", "ETH": "3001", "@107": "1.2", "BAD": "n/a" } } }
        "#;

        let mids = parse_all_mids(frame).unwrap();
        assert_eq!(mids.len(), 2);
        assert_eq!(mids.get("BTC"), Some(&64210.5));
        assert_eq!(mids.get("ETH"), Some(&3001.0));
        assert!(parse_all_mids(r#"{"channel":"trades","data":[]}"#).is_none());
    }
}
