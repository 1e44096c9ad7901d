//! Exchange collaborator interface.
//!
//! The scanner core only talks to a [`MarketDataSource`]; transports live in the
//! submodules.

use crate::{
    error::ScannerError,
    types::{AssetContext, Candle, MidPrices, Timeframe, Trade},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::{sync::mpsc, task::AbortHandle};

pub mod feed;
pub mod hyperliquid;

/// Upstream market data used by the scanner.
#[async_trait]
pub trait MarketDataSource: Send + Sync + 'static {
    /// Batched snapshot of every listed symbol (one call for all symbols).
    async fn universe_snapshot(&self) -> Result<Vec<AssetContext>, ScannerError>;

    /// Historical candles for `symbol` between `start` and `end`.
    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ScannerError>;

    /// Most recent public trades for `symbol`.
    async fn recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>, ScannerError>;

    /// Live mid prices for all symbols.
    fn subscribe_mid_prices(&self) -> Subscription<MidPrices>;

    /// Live trades for one symbol, in exchange order.
    fn subscribe_trades(&self, symbol: &str) -> Subscription<Vec<Trade>>;
}

/// Clonable view of a subscription's "still active" flag, captured by callbacks.
#[derive(Debug, Clone)]
pub struct ActiveFlag(Arc<AtomicBool>);

impl ActiveFlag {
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Owner of a live subscription. Cancelling is idempotent and also happens on drop.
#[derive(Debug)]
pub struct SubscriptionHandle {
    active: Arc<AtomicBool>,
    task: Option<AbortHandle>,
}

impl SubscriptionHandle {
    /// Create a handle, optionally owning the transport task that feeds it.
    pub fn new(task: Option<AbortHandle>) -> Self {
        Self {
            active: Arc::new(AtomicBool::new(true)),
            task,
        }
    }

    /// Attach the transport task once it has been spawned with this handle's flag.
    pub fn with_task(mut self, task: AbortHandle) -> Self {
        self.task = Some(task);
        self
    }

    pub fn flag(&self) -> ActiveFlag {
        ActiveFlag(Arc::clone(&self.active))
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop the subscription. Safe to call more than once.
    pub fn cancel(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(task) = &self.task {
                task.abort();
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Push updates of `T` plus the handle that tears them down.
#[derive(Debug)]
pub struct Subscription<T> {
    pub updates: mpsc::Receiver<T>,
    pub handle: SubscriptionHandle,
}

impl<T> Subscription<T> {
    pub fn new(updates: mpsc::Receiver<T>, handle: SubscriptionHandle) -> Self {
        Self { updates, handle }
    }
}
