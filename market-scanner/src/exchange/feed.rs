//! WebSocket live feed with bounded reconnect-with-backoff.
//!
//! Each feed owns one connection: it sends a subscribe frame, keeps the socket alive with
//! application pings, parses text frames into updates and forwards them in order. The
//! scanner layer above never re-implements reconnection.

use super::{ActiveFlag, Subscription, SubscriptionHandle};
use crate::error::ScannerError;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Live feed transport configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    /// WebSocket endpoint
    pub url: String,
    /// Application-level ping interval to keep the connection alive
    pub ping_interval: Duration,
    /// Text frame sent on every ping tick
    pub ping_message: String,
    /// Base delay between reconnect attempts (multiplied by the attempt number)
    pub reconnect_delay: Duration,
    /// Fixed timeout for each connection attempt
    pub connect_timeout: Duration,
    /// Consecutive failed attempts before the feed gives up
    pub max_reconnect_attempts: u32,
    /// Maximum channel buffer size for updates
    pub channel_buffer_size: usize,
}

impl FeedConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_interval: Duration::from_secs(30),
            ping_message: r#"{"method":"ping"}"#.to_string(),
            reconnect_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            channel_buffer_size: 1000,
        }
    }

    /// Set ping interval
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set reconnect delay
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set maximum reconnect attempts
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set channel buffer size
    pub fn with_channel_buffer_size(mut self, size: usize) -> Self {
        self.channel_buffer_size = size.max(1);
        self
    }

    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.reconnect_delay * attempt.max(1)
    }
}

/// Why a single connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedExit {
    Disconnected,
    ReceiverDropped,
    Cancelled,
}

/// Spawn a live feed task and return its [`Subscription`].
///
/// `parse` maps one text frame to an update, or `None` for frames to ignore
/// (acks, pongs, other channels).
pub fn spawn_feed<T, P>(config: FeedConfig, subscribe: serde_json::Value, parse: P) -> Subscription<T>
where
    T: Send + 'static,
    P: FnMut(&str) -> Option<T> + Send + 'static,
{
    let (update_tx, update_rx) = mpsc::channel(config.channel_buffer_size);
    let handle = SubscriptionHandle::new(None);
    let active = handle.flag();

    let task = tokio::spawn(async move {
        run_feed_loop(config, subscribe, parse, update_tx, active).await;
    });

    Subscription::new(update_rx, handle.with_task(task.abort_handle()))
}

/// Connection loop with bounded auto-reconnect
async fn run_feed_loop<T, P>(
    config: FeedConfig,
    subscribe: serde_json::Value,
    mut parse: P,
    update_tx: mpsc::Sender<T>,
    active: ActiveFlag,
) where
    P: FnMut(&str) -> Option<T>,
{
    info!(url = %config.url, %subscribe, "Starting live feed");
    let mut failed_attempts = 0u32;

    while active.is_active() {
        let (exit, connected) =
            match stream_once(&config, &subscribe, &mut parse, &update_tx, &active).await {
                Ok(exit) => (exit, true),
                Err(error) => {
                    warn!(url = %config.url, %error, "Live feed connection failed");
                    (FeedExit::Disconnected, false)
                }
            };

        match exit {
            FeedExit::Cancelled => {
                debug!(url = %config.url, "Live feed cancelled");
                return;
            }
            FeedExit::ReceiverDropped => {
                warn!(url = %config.url, "Update receiver dropped, stopping feed");
                return;
            }
            FeedExit::Disconnected => {}
        }

        failed_attempts = if connected { 1 } else { failed_attempts + 1 };
        if failed_attempts > config.max_reconnect_attempts {
            error!(
                url = %config.url,
                attempts = failed_attempts - 1,
                "Live feed giving up after repeated reconnect failures"
            );
            return;
        }

        let delay = config.backoff(failed_attempts);
        debug!("Waiting {:?} before reconnecting...", delay);
        tokio::time::sleep(delay).await;
    }
}

/// One connection lifetime: connect, subscribe, forward until the socket ends.
async fn stream_once<T, P>(
    config: &FeedConfig,
    subscribe: &serde_json::Value,
    parse: &mut P,
    update_tx: &mpsc::Sender<T>,
    active: &ActiveFlag,
) -> Result<FeedExit, ScannerError>
where
    P: FnMut(&str) -> Option<T>,
{
    let (ws_stream, _) = tokio::time::timeout(config.connect_timeout, connect_async(config.url.as_str()))
        .await
        .map_err(|_| {
            ScannerError::Transport(format!(
                "connect to {} timed out after {:?}",
                config.url, config.connect_timeout
            ))
        })??;

    info!(url = %config.url, "Connected to live feed");
    let (mut write, mut read) = ws_stream.split();
    write.send(Message::Text(subscribe.to_string().into())).await?;

    let mut ping = tokio::time::interval(config.ping_interval);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if write.send(Message::Text(config.ping_message.clone().into())).await.is_err() {
                    debug!("Failed to send ping, connection likely dead");
                    return Ok(FeedExit::Disconnected);
                }
            }
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if !active.is_active() {
                        return Ok(FeedExit::Cancelled);
                    }
                    if let Some(update) = parse(text.as_str()) {
                        if update_tx.send(update).await.is_err() {
                            return Ok(FeedExit::ReceiverDropped);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(url = %config.url, "Live feed closed by server");
                    return Ok(FeedExit::Disconnected);
                }
                Some(Ok(_)) => {
                    // Ping/Pong/Binary frames - tungstenite answers pings automatically
                }
                Some(Err(error)) => {
                    error!(url = %config.url, %error, "Live feed error");
                    return Ok(FeedExit::Disconnected);
                }
            }
        }
    }
}
