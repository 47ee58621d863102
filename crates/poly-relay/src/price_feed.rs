//! Display-only market price feed.
//!
//! Streams last-trade prices for the bound market's tokens and logs them.
//! Nothing downstream consumes these ticks; order pricing always comes from
//! the signal. The feed exists so the operator can eyeball signal prices
//! against the venue.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use crate::types::ResolvedMarket;

/// Default CLOB market data WebSocket URL.
const DEFAULT_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";

/// Something that follows the bound market. Retargeting with `None` stops
/// the current stream.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn retarget(&self, market: Option<ResolvedMarket>);
}

/// Feed that ignores retargets. Used when the feed is disabled in config
/// and throughout the tests.
pub struct NoopPriceFeed;

#[async_trait]
impl PriceFeed for NoopPriceFeed {
    async fn retarget(&self, _market: Option<ResolvedMarket>) {}
}

/// Live CLOB market-channel feed.
///
/// The connection task follows a watch channel: whenever the target market
/// changes, the current session ends and a new one subscribes to the new
/// token pair. Connection errors back off exponentially up to 60s.
pub struct ClobPriceFeed {
    target_tx: watch::Sender<Option<ResolvedMarket>>,
}

impl ClobPriceFeed {
    /// Spawn the feed task. It runs until shutdown.
    pub fn spawn(ws_url: Option<String>, shutdown_tx: &broadcast::Sender<()>) -> Self {
        let url = ws_url.unwrap_or_else(|| DEFAULT_WS_URL.to_string());
        let (target_tx, target_rx) = watch::channel(None);
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(run_feed(url, target_rx, shutdown));
        Self { target_tx }
    }
}

#[async_trait]
impl PriceFeed for ClobPriceFeed {
    async fn retarget(&self, market: Option<ResolvedMarket>) {
        // A send only fails when the feed task is gone, which means we are
        // shutting down anyway.
        let _ = self.target_tx.send(market);
    }
}

async fn run_feed(
    url: String,
    mut target_rx: watch::Receiver<Option<ResolvedMarket>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut reconnect_delay = Duration::from_secs(1);
    let max_reconnect_delay = Duration::from_secs(60);

    loop {
        let market = target_rx.borrow_and_update().clone();
        let Some(market) = market else {
            // No target: sleep until one arrives.
            tokio::select! {
                changed = target_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
                _ = shutdown.recv() => return,
            }
        };

        match run_session(&url, &market, &mut target_rx, &mut shutdown).await {
            Ok(SessionEnd::Shutdown) => return,
            Ok(SessionEnd::Retargeted) => {
                reconnect_delay = Duration::from_secs(1);
            }
            Err(e) => {
                warn!(
                    market = %market.slug,
                    "Price feed error: {}, reconnecting in {:?}",
                    e, reconnect_delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(reconnect_delay) => {}
                    _ = shutdown.recv() => return,
                }
                reconnect_delay = (reconnect_delay * 2).min(max_reconnect_delay);
            }
        }
    }
}

enum SessionEnd {
    Shutdown,
    Retargeted,
}

async fn run_session(
    url: &str,
    market: &ResolvedMarket,
    target_rx: &mut watch::Receiver<Option<ResolvedMarket>>,
    shutdown: &mut broadcast::Receiver<()>,
) -> anyhow::Result<SessionEnd> {
    let (ws_stream, _) = connect_async(url).await?;
    let (mut write, mut read) = ws_stream.split();

    let subscribe = json!({
        "type": "market",
        "assets_ids": [market.up_token_id, market.down_token_id],
    });
    write.send(Message::Text(subscribe.to_string())).await?;
    info!(market = %market.slug, "Price feed subscribed");

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => log_tick(market, &text),
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        anyhow::bail!("price feed stream closed");
                    }
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(_)) => {}
                }
            }
            changed = target_rx.changed() => {
                if changed.is_err() {
                    return Ok(SessionEnd::Shutdown);
                }
                info!(market = %market.slug, "Price feed retargeted");
                return Ok(SessionEnd::Retargeted);
            }
            _ = shutdown.recv() => {
                return Ok(SessionEnd::Shutdown);
            }
        }
    }
}

/// Log a last-trade tick for whichever side the asset id matches.
fn log_tick(market: &ResolvedMarket, text: &str) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return;
    };
    if value.get("event_type").and_then(|v| v.as_str()) != Some("last_trade_price") {
        return;
    }
    let asset_id = value.get("asset_id").and_then(|v| v.as_str()).unwrap_or("");
    let price = value.get("price").and_then(|v| v.as_str()).unwrap_or("?");
    let side = if asset_id == market.up_token_id {
        "UP"
    } else if asset_id == market.down_token_id {
        "DOWN"
    } else {
        debug!(asset_id = %asset_id, "Tick for unsubscribed asset");
        return;
    };
    info!(market = %market.slug, side = %side, price = %price, "Last trade");
}
