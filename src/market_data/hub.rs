// =============================================================================
// Market Data Hub — normalization, per-symbol state, and subscriber fan-out
// =============================================================================
//
// The hub owns the feed connection, converts provider-native ticks into
// canonical `MarketUpdate`s, keeps the last-known state per symbol, and fans
// updates out to registered handlers.  A single dispatch task consumes the
// tick channel, which serialises delivery: a given handler observes updates
// for a given symbol in arrival order (FIFO per symbol-handler pair).
//
// Registration policy: registering the same handler (same `Arc`) twice for a
// symbol is a no-op; unsubscribing an unknown handler is a no-op.
// =============================================================================

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::gateway::HistoricalDataGateway;
use crate::market_data::feed::{ConnState, FeedConnection, RawTick};
use crate::types::{HistoricalBar, MarketUpdate};

/// Handler invoked for every normalized update of a subscribed symbol.
///
/// Identity for dedupe and unsubscribe purposes is the `Arc` pointer itself.
pub type UpdateHandler = Arc<dyn Fn(&MarketUpdate) + Send + Sync>;

struct HubInner {
    stream_url: String,
    gateway: Arc<dyn HistoricalDataGateway>,
    subscribers: RwLock<HashMap<String, Vec<UpdateHandler>>>,
    last_updates: RwLock<HashMap<String, MarketUpdate>>,
    feed: Mutex<Option<FeedConnection>>,
    dispatch: Mutex<Option<tokio::task::JoinHandle<()>>>,
    enabled: AtomicBool,
    terminated: AtomicBool,
    dropped_ticks: AtomicU64,
}

/// The real-time market-data distribution service.
#[derive(Clone)]
pub struct MarketDataHub {
    inner: Arc<HubInner>,
}

impl MarketDataHub {
    pub fn new(stream_url: impl Into<String>, gateway: Arc<dyn HistoricalDataGateway>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                stream_url: stream_url.into(),
                gateway,
                subscribers: RwLock::new(HashMap::new()),
                last_updates: RwLock::new(HashMap::new()),
                feed: Mutex::new(None),
                dispatch: Mutex::new(None),
                enabled: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                dropped_ticks: AtomicU64::new(0),
            }),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Start the feed connection and the dispatch task.  Idempotent: calling
    /// `enable` while already enabled is a no-op.  No-op after [`cleanup`].
    ///
    /// [`cleanup`]: MarketDataHub::cleanup
    pub fn enable(&self) {
        if self.inner.terminated.load(Ordering::SeqCst) {
            warn!("enable() called on a cleaned-up hub — ignored");
            return;
        }
        if self.inner.enabled.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let feed = FeedConnection::connect(self.inner.stream_url.clone(), tick_tx);

        // The feed must carry every symbol that already has subscribers.
        for symbol in self.inner.subscribers.read().keys() {
            feed.subscribe_symbol(symbol);
        }

        *self.inner.feed.lock() = Some(feed);

        let hub = self.clone();
        let dispatch = tokio::spawn(async move {
            hub.dispatch_loop(tick_rx).await;
        });
        *self.inner.dispatch.lock() = Some(dispatch);

        info!("market data hub enabled");
    }

    /// Stop the feed and release its resources while preserving the
    /// subscriber registry.  Idempotent.  Ticks still buffered when this is
    /// called are discarded, never delivered late.
    pub async fn disable(&self) {
        if !self.inner.enabled.swap(false, Ordering::SeqCst) {
            return;
        }

        let feed = self.inner.feed.lock().take();
        if let Some(mut feed) = feed {
            feed.disconnect().await;
        }

        // Stop the dispatch task and wait it out, so a later enable() cannot
        // run two dispatchers over the same registry.  `process_tick` has no
        // await points, so an in-flight delivery completes before the task
        // ends.
        let dispatch = self.inner.dispatch.lock().take();
        if let Some(task) = dispatch {
            task.abort();
            let _ = task.await;
        }

        info!("market data hub disabled");
    }

    /// Release all subscriptions and stop the feed.  Terminal: the hub is not
    /// reusable afterward — construct a new instance to restart.
    pub async fn cleanup(&self) {
        self.inner.terminated.store(true, Ordering::SeqCst);
        self.disable().await;
        self.inner.subscribers.write().clear();
        self.inner.last_updates.write().clear();
        info!("market data hub cleaned up");
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    /// Register `handler` for updates of `symbol`.
    ///
    /// The first subscriber to a symbol triggers the upstream subscribe;
    /// registering the same `Arc` twice is a no-op.
    pub fn subscribe(&self, symbol: &str, handler: UpdateHandler) {
        let symbol = symbol.to_uppercase();

        let first_for_symbol = {
            let mut subs = self.inner.subscribers.write();
            let handlers = subs.entry(symbol.clone()).or_default();
            if handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
                debug!(symbol = %symbol, "duplicate handler registration ignored");
                return;
            }
            let first = handlers.is_empty();
            handlers.push(handler);
            first
        };

        if first_for_symbol {
            if let Some(feed) = self.inner.feed.lock().as_ref() {
                feed.subscribe_symbol(&symbol);
            }
        }
    }

    /// Remove `handler` from `symbol`.  Unknown handlers are a no-op.  The
    /// last handler for a symbol stops the upstream stream for that symbol
    /// without affecting other symbols.
    pub fn unsubscribe(&self, symbol: &str, handler: &UpdateHandler) {
        let symbol = symbol.to_uppercase();

        let last_for_symbol = {
            let mut subs = self.inner.subscribers.write();
            match subs.get_mut(&symbol) {
                Some(handlers) => {
                    handlers.retain(|h| !Arc::ptr_eq(h, handler));
                    if handlers.is_empty() {
                        subs.remove(&symbol);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if last_for_symbol {
            if let Some(feed) = self.inner.feed.lock().as_ref() {
                feed.unsubscribe_symbol(&symbol);
            }
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Last known price for `symbol`, or `None` if no update has ever been
    /// received for it.
    pub fn get_price(&self, symbol: &str) -> Option<f64> {
        self.inner
            .last_updates
            .read()
            .get(&symbol.to_uppercase())
            .map(|u| u.price)
    }

    /// Full last-known update for `symbol`.
    pub fn last_update(&self, symbol: &str) -> Option<MarketUpdate> {
        self.inner
            .last_updates
            .read()
            .get(&symbol.to_uppercase())
            .cloned()
    }

    /// Feed connection state; `Disconnected` while the hub is disabled.
    pub fn connection_state(&self) -> ConnState {
        self.inner
            .feed
            .lock()
            .as_ref()
            .map(|f| f.state())
            .unwrap_or(ConnState::Disconnected)
    }

    /// Fetch up to `limit` historical bars, oldest first.
    ///
    /// Degrades gracefully: when the gateway is unreachable or times out this
    /// resolves to an empty sequence, so callers must treat empty as "try
    /// again later" rather than "no data exists".
    pub async fn get_historical_data(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Vec<HistoricalBar> {
        match self.inner.gateway.fetch_klines(symbol, timeframe, limit).await {
            Ok(bars) => bars,
            Err(e) => {
                warn!(symbol, timeframe, error = %e, "historical data fetch failed — returning empty");
                Vec::new()
            }
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    async fn dispatch_loop(&self, mut tick_rx: mpsc::UnboundedReceiver<RawTick>) {
        while let Some(tick) = tick_rx.recv().await {
            self.process_tick(tick);
        }
        debug!("hub dispatch loop ended");
    }

    /// Normalize one raw tick and fan it out.  Runs on the dispatch task.
    pub(crate) fn process_tick(&self, tick: RawTick) {
        let update = match normalize_tick(tick) {
            Ok(update) => update,
            Err(e) => {
                self.inner.dropped_ticks.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "dropping unparseable tick");
                return;
            }
        };

        self.inner
            .last_updates
            .write()
            .insert(update.symbol.clone(), update.clone());

        // Snapshot the handler list so subscribe/unsubscribe during fan-out
        // only affects the next delivery.
        let handlers: Vec<UpdateHandler> = match self.inner.subscribers.read().get(&update.symbol)
        {
            Some(handlers) => handlers.clone(),
            None => return,
        };

        for handler in &handlers {
            // A panicking handler must not prevent delivery to the rest.
            let result =
                std::panic::catch_unwind(AssertUnwindSafe(|| handler(&update)));
            if result.is_err() {
                warn!(symbol = %update.symbol, "update handler panicked — isolated");
            }
        }
    }

    /// Number of ticks dropped by normalization since startup.
    pub fn dropped_ticks(&self) -> u64 {
        self.inner.dropped_ticks.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn handler_count(&self, symbol: &str) -> usize {
        self.inner
            .subscribers
            .read()
            .get(&symbol.to_uppercase())
            .map_or(0, |h| h.len())
    }
}

/// Parse a provider-native tick into a canonical update.
///
/// A tick whose price or volume fails to parse (or is non-finite) is rejected
/// so that partial or garbage data never reaches subscribers.
fn normalize_tick(tick: RawTick) -> Result<MarketUpdate, CoreError> {
    let price = parse_finite("price", &tick.price)?;
    let volume = parse_finite("volume", &tick.volume)?;

    // Secondary fields degrade to zero rather than dropping the tick.
    let price_change = tick.price_change.parse().unwrap_or(0.0);
    let price_change_percent = tick.price_change_percent.parse().unwrap_or(0.0);
    let high = tick.high.parse().unwrap_or(price);
    let low = tick.low.parse().unwrap_or(price);

    Ok(MarketUpdate {
        symbol: tick.symbol,
        price,
        volume,
        price_change,
        price_change_percent,
        high,
        low,
        timestamp: tick.event_time,
    })
}

fn parse_finite(name: &str, raw: &str) -> Result<f64, CoreError> {
    let value: f64 = raw
        .parse()
        .map_err(|e| CoreError::parse(name, format!("'{raw}' is not a number: {e}")))?;
    if !value.is_finite() {
        return Err(CoreError::parse(name, format!("'{raw}' is not finite")));
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
