use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use market_scanner::{HyperliquidClient, HyperliquidConfig, ScannerConfig, ScannerCoordinator, ScannerSnapshot};
use rustls::crypto::ring::default_provider;
use serde::Serialize;
use std::{error::Error, net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tokio_stream::wrappers::WatchStream;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const DEFAULT_WS_ADDR: &str = "0.0.0.0:9002";

/// Frames sent to presentation clients
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerMessage<'a> {
    Welcome {
        message: &'static str,
        timestamp: DateTime<Utc>,
    },
    Snapshot(&'a ScannerSnapshot),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    init_logging();

    // REST and WSS to the exchange both go through rustls
    let _ = default_provider().install_default();

    let config = ScannerConfig::from_env();
    info!(
        mode = ?config.mode,
        watchlist_limit = config.watchlist_limit(),
        min_volume = config.min_volume,
        max_decline_pct = config.max_decline_pct,
        "Starting market-scanner server"
    );

    let source = Arc::new(HyperliquidClient::new(HyperliquidConfig::from_env()));
    let coordinator = Arc::new(ScannerCoordinator::new(source, config));

    // Configurable via SCANNER_WS_ADDR (default: 0.0.0.0:9002)
    let server_addr = std::env::var("SCANNER_WS_ADDR")
        .ok()
        .and_then(|raw| match raw.parse::<SocketAddr>() {
            Ok(addr) => Some(addr),
            Err(error) => {
                warn!(%raw, %error, "Invalid SCANNER_WS_ADDR, using default");
                None
            }
        })
        .map_or_else(|| DEFAULT_WS_ADDR.parse::<SocketAddr>(), Ok)?;

    let listener = TcpListener::bind(server_addr).await?;
    info!("WebSocket server listening on ws://{}", server_addr);

    let runner = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.run().await }
    });

    let snapshots = coordinator.subscribe();
    tokio::select! {
        _ = accept_clients(listener, snapshots) => {
            error!("WebSocket listener stopped");
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(error) = signal {
                error!(%error, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        }
    }

    coordinator.shutdown();
    if let Err(error) = runner.await {
        error!(%error, "Coordinator task failed");
    }

    info!("market-scanner server stopped");
    Ok(())
}

/// Accept WebSocket clients until the listener fails
async fn accept_clients(listener: TcpListener, snapshots: watch::Receiver<Arc<ScannerSnapshot>>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!("New WebSocket connection from {}", peer_addr);
                tokio::spawn(handle_client(stream, peer_addr, snapshots.clone()));
            }
            Err(error) => {
                error!(%error, "Failed to accept connection");
                return;
            }
        }
    }
}

/// Stream every snapshot to one client, starting with the latest
async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    snapshots: watch::Receiver<Arc<ScannerSnapshot>>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", peer_addr, e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let welcome = ServerMessage::Welcome {
        message: "Connected to market-scanner snapshot feed",
        timestamp: Utc::now(),
    };
    if let Ok(msg) = serde_json::to_string(&welcome) {
        if ws_sender.send(Message::Text(msg.into())).await.is_err() {
            return;
        }
    }

    // Slow clients skip intermediate snapshots and always receive the latest
    let mut send_task = tokio::spawn(async move {
        let mut updates = WatchStream::new(snapshots);
        while let Some(snapshot) = updates.next().await {
            let json = match serde_json::to_string(&ServerMessage::Snapshot(&snapshot)) {
                Ok(json) => json,
                Err(error) => {
                    warn!(%error, "Failed to serialise snapshot");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Text(text)) => {
                    debug!("Received text from {}: {}", peer_addr, text);
                }
                Err(e) => {
                    warn!("WebSocket error for {}: {}", peer_addr, e);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("WebSocket connection closed for {}", peer_addr);
}

/// Initialize logging. `LOG_FORMAT=json` switches to structured JSON lines.
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
