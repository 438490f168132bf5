// =============================================================================
// Feed Connection — resilient multiplexed WebSocket to the market-data provider
// =============================================================================
//
// One connection carries all subscribed symbols.  The connection task:
//   1. Connects to the provider's combined-stream endpoint (TLS).
//   2. Replays the full subscription list.
//   3. Extracts raw ticks from 24h ticker payloads and forwards them.
//   4. Reconnects on failure with exponential backoff + jitter.
//
// `disconnect()` is idempotent and suppresses any further reconnect.
// Malformed payloads are dropped and logged; they never crash the process.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Base delay for the first reconnect attempt.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Ceiling for the reconnect delay.
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Bound on a single connect handshake.  A provider that accepts TCP but
/// never answers the upgrade must not stall shutdown or reconnection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A single raw tick in provider-native format.
///
/// Numeric fields stay string-encoded exactly as the provider sent them; the
/// hub's normalization step is the compatibility boundary that parses them.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTick {
    pub symbol: String,
    pub price: String,
    pub volume: String,
    pub price_change: String,
    pub price_change_percent: String,
    pub high: String,
    pub low: String,
    /// Provider event time in milliseconds; receipt time when absent.
    pub event_time: i64,
}

/// Observable connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// Reconnect delay as a pure function of the retry count: `base * 2^retry`,
/// capped at [`BACKOFF_CAP`]. Jitter is applied separately by
/// [`with_jitter`].
pub fn backoff_delay(retry: u32) -> Duration {
    let exp = retry.min(10);
    let delay = BACKOFF_BASE.saturating_mul(1u32 << exp);
    delay.min(BACKOFF_CAP)
}

/// Add up to 25 % random jitter so reconnecting clients do not stampede.
fn with_jitter(delay: Duration) -> Duration {
    let jitter_ms = (delay.as_millis() as f64 * 0.25 * rand::random::<f64>()) as u64;
    delay + Duration::from_millis(jitter_ms)
}

/// Stream name for a symbol on the combined endpoint.
fn stream_name(symbol: &str) -> String {
    format!("{}@ticker", symbol.to_lowercase())
}

/// Build a SUBSCRIBE / UNSUBSCRIBE frame for the given streams.
fn control_frame(method: &str, streams: &[String], id: u64) -> String {
    json!({
        "method": method,
        "params": streams,
        "id": id,
    })
    .to_string()
}

/// Extract a raw tick from a provider message.
///
/// Returns `Ok(None)` for non-tick control messages (subscription acks);
/// `Err` for malformed payloads, which the caller drops with a warning.
///
/// Expected tick shape (combined-stream envelope or bare payload):
/// ```json
/// { "stream": "btcusdt@ticker",
///   "data": { "e": "24hrTicker", "s": "BTCUSDT", "c": "65000.5",
///             "v": "10", "p": "120.5", "P": "0.19",
///             "h": "65500.0", "l": "64000.0", "E": 1700000000000 } }
/// ```
fn parse_feed_message(text: &str) -> Result<Option<RawTick>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse feed JSON")?;

    // Subscription ack: {"result":null,"id":1}
    if root.get("id").is_some() && root.get("stream").is_none() && root.get("e").is_none() {
        return Ok(None);
    }

    // Support both combined-stream envelope and direct payload.
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    match data["e"].as_str() {
        Some("24hrTicker") => {}
        Some(_) => return Ok(None),
        None => anyhow::bail!("message has no event type"),
    }

    let field = |name: &str| -> Result<String> {
        data[name]
            .as_str()
            .map(str::to_string)
            .with_context(|| format!("missing field {name}"))
    };

    let event_time = data["E"]
        .as_i64()
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    Ok(Some(RawTick {
        symbol: data["s"]
            .as_str()
            .context("missing field s")?
            .to_uppercase(),
        price: field("c")?,
        volume: field("v")?,
        price_change: field("p")?,
        price_change_percent: field("P")?,
        high: field("h")?,
        low: field("l")?,
        event_time,
    }))
}

// ---------------------------------------------------------------------------
// FeedConnection
// ---------------------------------------------------------------------------

/// Handle to the running connection task.
pub struct FeedConnection {
    symbols: Arc<RwLock<HashSet<String>>>,
    outbound_tx: mpsc::UnboundedSender<String>,
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ConnState>,
    task: Option<tokio::task::JoinHandle<()>>,
    next_req_id: AtomicU64,
}

impl FeedConnection {
    /// Establish the upstream stream and start emitting raw ticks on
    /// `tick_tx`.  The task keeps reconnecting until [`disconnect`] is
    /// called.
    ///
    /// [`disconnect`]: FeedConnection::disconnect
    pub fn connect(url: impl Into<String>, tick_tx: mpsc::UnboundedSender<RawTick>) -> Self {
        let url = url.into();
        let symbols: Arc<RwLock<HashSet<String>>> = Arc::new(RwLock::new(HashSet::new()));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnState::Disconnected);

        let loop_symbols = symbols.clone();
        let task = tokio::spawn(async move {
            connection_loop(url, loop_symbols, tick_tx, outbound_rx, shutdown_rx, state_tx).await;
        });

        Self {
            symbols,
            outbound_tx,
            shutdown_tx,
            state_rx,
            task: Some(task),
            next_req_id: AtomicU64::new(1),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        *self.state_rx.borrow()
    }

    /// Add `symbol` to the upstream stream.  Takes effect within one feed
    /// round trip while connected; otherwise on the next (re)connect, because
    /// the full desired set is replayed after every handshake.
    pub fn subscribe_symbol(&self, symbol: &str) {
        let stream = stream_name(symbol);
        let inserted = self.symbols.write().insert(stream.clone());
        if inserted {
            let id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
            // Best effort: the frame is lost if not connected, which is fine
            // because reconnect replays the desired set.
            let _ = self
                .outbound_tx
                .send(control_frame("SUBSCRIBE", &[stream], id));
        }
    }

    /// Stop streaming `symbol` upstream.  No-op for unknown symbols.
    pub fn unsubscribe_symbol(&self, symbol: &str) {
        let stream = stream_name(symbol);
        let removed = self.symbols.write().remove(&stream);
        if removed {
            let id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
            let _ = self
                .outbound_tx
                .send(control_frame("UNSUBSCRIBE", &[stream], id));
        }
    }

    /// Tear the connection down.  Idempotent; after this the task never
    /// reconnects.
    pub async fn disconnect(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
            info!("feed connection stopped");
        }
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

async fn connection_loop(
    url: String,
    symbols: Arc<RwLock<HashSet<String>>>,
    tick_tx: mpsc::UnboundedSender<RawTick>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<ConnState>,
) {
    let mut retry: u32 = 0;
    let mut req_id: u64 = 1_000_000; // ids for replayed subscriptions

    loop {
        if *shutdown_rx.borrow() {
            let _ = state_tx.send(ConnState::Disconnected);
            return;
        }

        let _ = state_tx.send(ConnState::Connecting);
        info!(url = %url, "connecting to market-data feed");

        // The handshake races against shutdown and carries its own timeout,
        // so a stalled connect blocks neither disconnect() nor the retry
        // loop.
        let attempt = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&url));
        let result = tokio::select! {
            res = attempt => res,
            _ = shutdown_rx.changed() => {
                let _ = state_tx.send(ConnState::Disconnected);
                return;
            }
        };

        let connected = match result {
            Ok(Ok((s, _response))) => Ok(s),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "handshake timed out after {}s",
                CONNECT_TIMEOUT.as_secs()
            )),
        };

        let ws_stream = match connected {
            Ok(s) => {
                retry = 0;
                let _ = state_tx.send(ConnState::Connected);
                info!("market-data feed connected");
                s
            }
            Err(e) => {
                let delay = with_jitter(backoff_delay(retry));
                error!(error = %e, retry, delay_ms = delay.as_millis() as u64, "feed connection failed");
                let _ = state_tx.send(ConnState::Disconnected);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    _ = shutdown_rx.changed() => return,
                }
                retry += 1;
                continue;
            }
        };

        let (mut ws_write, mut ws_read) = ws_stream.split();

        // Replay the full desired subscription list.
        let streams: Vec<String> = symbols.read().iter().cloned().collect();
        if !streams.is_empty() {
            req_id += 1;
            let frame = control_frame("SUBSCRIBE", &streams, req_id);
            debug!(count = streams.len(), "replaying subscriptions");
            if let Err(e) = ws_write.send(Message::Text(frame)).await {
                error!(error = %e, "subscription replay failed");
                continue;
            }
        }

        // Main read/write loop.
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("feed shutdown requested");
                    let _ = ws_write.close().await;
                    let _ = state_tx.send(ConnState::Disconnected);
                    return;
                }

                msg = ws_read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match parse_feed_message(&text) {
                                Ok(Some(tick)) => {
                                    if tick_tx.send(tick).is_err() {
                                        // Hub dispatch is gone; nothing left to feed.
                                        let _ = state_tx.send(ConnState::Disconnected);
                                        return;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    warn!(error = %e, "dropping malformed feed payload");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws_write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            warn!("feed sent close frame");
                            break;
                        }
                        Some(Ok(_)) => {} // Binary / Pong / Frame — ignore
                        Some(Err(e)) => {
                            error!(error = %e, "feed read error");
                            break;
                        }
                        None => {
                            warn!("feed stream ended");
                            break;
                        }
                    }
                }

                Some(frame) = outbound_rx.recv() => {
                    if let Err(e) = ws_write.send(Message::Text(frame)).await {
                        error!(error = %e, "feed send error");
                        break;
                    }
                }
            }
        }

        // Disconnected unexpectedly — back off, then reconnect.
        let _ = state_tx.send(ConnState::Disconnected);
        let delay = with_jitter(backoff_delay(retry));
        warn!(retry, delay_ms = delay.as_millis() as u64, "feed disconnected, reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = shutdown_rx.changed() => return,
        }
        retry += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
