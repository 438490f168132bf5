// =============================================================================
// Signal Engine — per-symbol detection with gated, rate-limited emission
// =============================================================================
//
// For every tracked symbol the engine keeps a bounded rolling window of
// updates, runs the detector on each arrival, and emits a `TradeSignal` only
// when all gates hold: confidence, update volume, risk/reward, and the
// sliding-hour emission cap.  Candidates failing a gate are silently
// discarded — never queued or retried.
//
// Evaluation runs on the hub's dispatch task (the engine's hub handler), so
// per-symbol state is only ever mutated from one task at a time.
// =============================================================================

pub mod detector;
pub mod rate_window;

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::market_data::{MarketDataHub, UpdateHandler};
use crate::types::{MarketUpdate, SignalMetadata, TradeSignal};
use detector::{SignalDetector, WaveDetector};
use rate_window::RateWindow;

/// Updates retained per tracked symbol — enough for the detection window.
const WINDOW_LEN: usize = 120;

/// Callback invoked for every emitted signal of a subscribed symbol.
pub type SignalHandler = Arc<dyn Fn(&TradeSignal) + Send + Sync>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Live thresholds applied to every candidate signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Minimum confidence score (0-100) a candidate must reach.
    pub min_confidence: f64,
    /// Sliding-hour emission cap, enforced per symbol.
    pub max_signals_per_hour: u32,
    /// Minimum volume on the triggering update.
    pub min_volume: f64,
    /// Minimum risk/reward ratio to the first target.
    pub min_risk_reward: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            min_confidence: 70.0,
            max_signals_per_hour: 5,
            min_volume: 100.0,
            min_risk_reward: 1.5,
        }
    }
}

/// Partial config update: only `Some` fields are merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalConfigUpdate {
    pub min_confidence: Option<f64>,
    pub max_signals_per_hour: Option<u32>,
    pub min_volume: Option<f64>,
    pub min_risk_reward: Option<f64>,
}

impl SignalConfigUpdate {
    /// Reject out-of-range values before any field is merged, so an invalid
    /// update leaves the prior config fully intact.
    fn validate(&self) -> Result<(), CoreError> {
        if let Some(c) = self.min_confidence {
            if !(0.0..=100.0).contains(&c) {
                return Err(CoreError::Config(format!(
                    "min_confidence must be within 0-100, got {c}"
                )));
            }
        }
        if let Some(v) = self.min_volume {
            if !v.is_finite() || v < 0.0 {
                return Err(CoreError::Config(format!(
                    "min_volume must be non-negative, got {v}"
                )));
            }
        }
        if let Some(r) = self.min_risk_reward {
            if !r.is_finite() || r < 0.0 {
                return Err(CoreError::Config(format!(
                    "min_risk_reward must be non-negative, got {r}"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct TrackedSymbol {
    window: VecDeque<MarketUpdate>,
    rate: RateWindow,
    /// The handler registered with the hub, kept for identity-matched
    /// unsubscribe.
    hub_handler: UpdateHandler,
}

struct EngineInner {
    hub: MarketDataHub,
    detector: Box<dyn SignalDetector>,
    timeframe: String,
    config: RwLock<SignalConfig>,
    tracked: RwLock<HashMap<String, TrackedSymbol>>,
    subscribers: RwLock<HashMap<String, HashMap<u64, SignalHandler>>>,
    next_sub_id: AtomicU64,
    terminated: AtomicBool,
}

/// The per-symbol signal-generation pipeline.
///
/// Dropping the last handle releases the engine's hub registrations, so an
/// engine that goes away without [`cleanup`] leaves nothing behind in the
/// hub's registry.
///
/// [`cleanup`]: SignalEngine::cleanup
#[derive(Clone)]
pub struct SignalEngine {
    inner: Arc<EngineInner>,
}

/// Capability-scoped handle returned by [`SignalEngine::subscribe`].
///
/// Cancelling does not require the original callback: the handle itself
/// identifies the registration.  Dropping the handle without calling
/// [`cancel`] leaves the subscription active until [`SignalEngine::cleanup`].
///
/// [`cancel`]: SignalSubscription::cancel
pub struct SignalSubscription {
    engine: Weak<EngineInner>,
    symbol: String,
    id: u64,
}

impl SignalSubscription {
    /// Remove this subscription.  No-op if the engine is gone.
    pub fn cancel(self) {
        if let Some(inner) = self.engine.upgrade() {
            let mut subs = inner.subscribers.write();
            if let Some(handlers) = subs.get_mut(&self.symbol) {
                handlers.remove(&self.id);
                if handlers.is_empty() {
                    subs.remove(&self.symbol);
                }
            }
        }
    }
}

impl SignalEngine {
    pub fn new(hub: MarketDataHub, config: SignalConfig, timeframe: impl Into<String>) -> Self {
        Self::with_detector(hub, config, timeframe, Box::new(WaveDetector::default()))
    }

    /// Construct with a custom detection capability.
    pub fn with_detector(
        hub: MarketDataHub,
        config: SignalConfig,
        timeframe: impl Into<String>,
        detector: Box<dyn SignalDetector>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                hub,
                detector,
                timeframe: timeframe.into(),
                config: RwLock::new(config),
                tracked: RwLock::new(HashMap::new()),
                subscribers: RwLock::new(HashMap::new()),
                next_sub_id: AtomicU64::new(1),
                terminated: AtomicBool::new(false),
            }),
        }
    }

    // ── Symbol lifecycle ────────────────────────────────────────────────

    /// Start tracking `symbol`: idle → tracking.  Idempotent.
    pub fn add_symbol(&self, symbol: &str) {
        if self.inner.terminated.load(Ordering::SeqCst) {
            warn!("add_symbol() called on a cleaned-up engine — ignored");
            return;
        }
        let symbol = symbol.to_uppercase();
        if self.inner.tracked.read().contains_key(&symbol) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let handler_symbol = symbol.clone();
        let hub_handler: UpdateHandler = Arc::new(move |update: &MarketUpdate| {
            if let Some(inner) = weak.upgrade() {
                inner.on_update(&handler_symbol, update);
            }
        });

        self.inner.tracked.write().insert(
            symbol.clone(),
            TrackedSymbol {
                window: VecDeque::with_capacity(WINDOW_LEN),
                rate: RateWindow::new(),
                hub_handler: hub_handler.clone(),
            },
        );
        self.inner.hub.subscribe(&symbol, hub_handler);
        info!(symbol = %symbol, "tracking symbol");
    }

    /// Stop tracking `symbol` and discard its window state: tracking → idle.
    /// Signal subscriptions for the symbol stay registered; they simply see
    /// no further emissions until the symbol is tracked again.
    pub fn remove_symbol(&self, symbol: &str) {
        let symbol = symbol.to_uppercase();
        let state = self.inner.tracked.write().remove(&symbol);
        if let Some(state) = state {
            self.inner.hub.unsubscribe(&symbol, &state.hub_handler);
            info!(symbol = %symbol, "stopped tracking symbol");
        }
    }

    /// Symbols currently in the tracking state.
    pub fn tracked_symbols(&self) -> Vec<String> {
        self.inner.tracked.read().keys().cloned().collect()
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    /// Register `callback` for signals of `symbol` and return a cancel
    /// handle.
    pub fn subscribe(&self, symbol: &str, callback: SignalHandler) -> SignalSubscription {
        let symbol = symbol.to_uppercase();
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .entry(symbol.clone())
            .or_default()
            .insert(id, callback);

        SignalSubscription {
            engine: Arc::downgrade(&self.inner),
            symbol,
            id,
        }
    }

    // ── Configuration ───────────────────────────────────────────────────

    /// Merge a partial update into the live config.  Subsequent evaluations
    /// use the new values; in-flight evaluations are unaffected.
    pub fn update_config(&self, update: SignalConfigUpdate) -> Result<(), CoreError> {
        update.validate()?;

        let mut config = self.inner.config.write();
        if let Some(c) = update.min_confidence {
            config.min_confidence = c;
        }
        if let Some(m) = update.max_signals_per_hour {
            config.max_signals_per_hour = m;
        }
        if let Some(v) = update.min_volume {
            config.min_volume = v;
        }
        if let Some(r) = update.min_risk_reward {
            config.min_risk_reward = r;
        }
        debug!(?config, "signal config updated");
        Ok(())
    }

    /// Snapshot of the live config.
    pub fn config(&self) -> SignalConfig {
        self.inner.config.read().clone()
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Unsubscribe from all tracked symbols and clear engine state.
    /// Terminal: construct a new engine to restart.
    pub fn cleanup(&self) {
        self.inner.terminated.store(true, Ordering::SeqCst);

        let tracked: Vec<(String, TrackedSymbol)> =
            self.inner.tracked.write().drain().collect();
        for (symbol, state) in tracked {
            self.inner.hub.unsubscribe(&symbol, &state.hub_handler);
        }
        self.inner.subscribers.write().clear();
        info!("signal engine cleaned up");
    }
}

impl EngineInner {
    /// Evaluate one incoming update for a tracked symbol.  Runs on the hub's
    /// dispatch task.
    fn on_update(&self, symbol: &str, update: &MarketUpdate) {
        let config = self.config.read().clone();

        let candidate = {
            let mut tracked = self.tracked.write();
            let Some(state) = tracked.get_mut(symbol) else {
                return;
            };
            state.window.push_back(update.clone());
            while state.window.len() > WINDOW_LEN {
                state.window.pop_front();
            }
            self.detector.evaluate(&state.window)
        };

        let Some(candidate) = candidate else {
            return;
        };

        // Gate checks — all must hold or the candidate is discarded.
        if candidate.confidence < config.min_confidence {
            return;
        }
        if update.volume < config.min_volume {
            return;
        }

        let risk = (candidate.entry_price - candidate.stop_loss).abs();
        let Some(first_target) = candidate.targets.first() else {
            return;
        };
        if risk <= 0.0 {
            return;
        }
        let risk_reward = (first_target - candidate.entry_price).abs() / risk;
        if risk_reward < config.min_risk_reward {
            return;
        }

        // Emission cap: exact sliding hour, per symbol.  Checked last so
        // gate-rejected candidates never consume a slot.
        let admitted = {
            let mut tracked = self.tracked.write();
            match tracked.get_mut(symbol) {
                Some(state) => {
                    let now = Instant::now();
                    let ok = state.rate.try_acquire(now, config.max_signals_per_hour);
                    if !ok {
                        debug!(
                            symbol,
                            in_window = state.rate.count(now),
                            "signal discarded by sliding-hour cap"
                        );
                    }
                    ok
                }
                None => false,
            }
        };
        if !admitted {
            return;
        }

        let signal = TradeSignal {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            direction: candidate.direction,
            entry_price: candidate.entry_price,
            stop_loss: candidate.stop_loss,
            targets: candidate.targets,
            confidence: candidate.confidence,
            wave: candidate.wave,
            timeframe: self.timeframe.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            metadata: SignalMetadata {
                volume: update.volume,
                volatility: candidate.volatility,
                momentum: candidate.momentum,
                risk_reward_ratio: risk_reward,
            },
        };

        info!(
            symbol,
            direction = %signal.direction,
            confidence = signal.confidence,
            entry = signal.entry_price,
            "signal emitted"
        );
        self.emit(symbol, &signal);
    }

    fn emit(&self, symbol: &str, signal: &TradeSignal) {
        let handlers: Vec<SignalHandler> = match self.subscribers.read().get(symbol) {
            Some(handlers) => handlers.values().cloned().collect(),
            None => return,
        };

        for handler in &handlers {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(signal)));
            if result.is_err() {
                warn!(symbol, "signal handler panicked — isolated");
            }
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        // The hub handlers only hold a Weak back-reference, so the engine can
        // go away while still registered; take the registrations with it.
        for (symbol, state) in self.tracked.get_mut().drain() {
            self.hub.unsubscribe(&symbol, &state.hub_handler);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::HistoricalDataGateway;
    use crate::market_data::RawTick;
    use crate::types::{Direction, HistoricalBar, WaveClass};
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct EmptyGateway;

    #[async_trait]
    impl HistoricalDataGateway for EmptyGateway {
        async fn fetch_klines(&self, _: &str, _: &str, _: u32) -> Result<Vec<HistoricalBar>> {
            Ok(Vec::new())
        }
    }

    /// Detector stub emitting a fixed-confidence candidate on every update.
    struct FixedDetector {
        confidence: f64,
    }

    impl SignalDetector for FixedDetector {
        fn evaluate(&self, window: &VecDeque<MarketUpdate>) -> Option<detector::Candidate> {
            let last = window.back()?;
            Some(detector::Candidate {
                direction: Direction::Buy,
                entry_price: last.price,
                stop_loss: last.price * 0.99,
                targets: vec![last.price * 1.02, last.price * 1.03],
                confidence: self.confidence,
                wave: WaveClass {
                    wave: 3,
                    sub_wave: "iii".into(),
                    pattern: "impulse".into(),
                },
                volatility: 0.01,
                momentum: 0.02,
            })
        }
    }

    fn test_hub() -> MarketDataHub {
        MarketDataHub::new("wss://127.0.0.1:1/stream", Arc::new(EmptyGateway))
    }

    fn engine_with_confidence(hub: &MarketDataHub, confidence: f64) -> SignalEngine {
        SignalEngine::with_detector(
            hub.clone(),
            SignalConfig::default(),
            "1h",
            Box::new(FixedDetector { confidence }),
        )
    }

    fn tick(symbol: &str, price: f64, volume: f64) -> RawTick {
        RawTick {
            symbol: symbol.to_string(),
            price: price.to_string(),
            volume: volume.to_string(),
            price_change: "0".into(),
            price_change_percent: "0".into(),
            high: price.to_string(),
            low: price.to_string(),
            event_time: 1_700_000_000_000,
        }
    }

    fn collecting_handler() -> (SignalHandler, Arc<Mutex<Vec<TradeSignal>>>) {
        let seen: Arc<Mutex<Vec<TradeSignal>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: SignalHandler = Arc::new(move |s: &TradeSignal| {
            sink.lock().push(s.clone());
        });
        (handler, seen)
    }

    #[test]
    fn confident_candidate_flows_through() {
        let hub = test_hub();
        let engine = engine_with_confidence(&hub, 95.0);
        engine.add_symbol("BTCUSDT");
        let (handler, seen) = collecting_handler();
        let _sub = engine.subscribe("BTCUSDT", handler);

        hub.process_tick(tick("BTCUSDT", 65000.5, 500.0));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].symbol, "BTCUSDT");
        assert_eq!(seen[0].direction, Direction::Buy);
        assert!((seen[0].metadata.risk_reward_ratio - 2.0).abs() < 1e-6);
    }

    #[test]
    fn confidence_gate_applies_from_next_evaluation() {
        let hub = test_hub();
        let engine = engine_with_confidence(&hub, 80.0);
        engine.add_symbol("BTCUSDT");
        let (handler, seen) = collecting_handler();
        let _sub = engine.subscribe("BTCUSDT", handler);

        engine
            .update_config(SignalConfigUpdate {
                min_confidence: Some(90.0),
                ..Default::default()
            })
            .unwrap();

        // Confidence 80 < 90 — discarded.
        hub.process_tick(tick("BTCUSDT", 65000.0, 500.0));
        assert!(seen.lock().is_empty());

        // A later, stronger candidate passes.
        let strong = engine_with_confidence(&hub, 95.0);
        strong.add_symbol("ETHUSDT");
        let (handler2, seen2) = collecting_handler();
        let _sub2 = strong.subscribe("ETHUSDT", handler2);
        strong
            .update_config(SignalConfigUpdate {
                min_confidence: Some(90.0),
                ..Default::default()
            })
            .unwrap();
        hub.process_tick(tick("ETHUSDT", 3500.0, 500.0));
        assert_eq!(seen2.lock().len(), 1);
    }

    #[test]
    fn volume_gate_discards_thin_updates() {
        let hub = test_hub();
        let engine = engine_with_confidence(&hub, 95.0);
        engine.add_symbol("BTCUSDT");
        let (handler, seen) = collecting_handler();
        let _sub = engine.subscribe("BTCUSDT", handler);

        hub.process_tick(tick("BTCUSDT", 65000.0, 1.0)); // below min_volume 100
        assert!(seen.lock().is_empty());

        hub.process_tick(tick("BTCUSDT", 65000.0, 500.0));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn risk_reward_gate() {
        let hub = test_hub();
        let engine = engine_with_confidence(&hub, 95.0);
        engine.add_symbol("BTCUSDT");
        let (handler, seen) = collecting_handler();
        let _sub = engine.subscribe("BTCUSDT", handler);

        // FixedDetector yields rr = 2.0; raise the floor above it.
        engine
            .update_config(SignalConfigUpdate {
                min_risk_reward: Some(3.0),
                ..Default::default()
            })
            .unwrap();
        hub.process_tick(tick("BTCUSDT", 65000.0, 500.0));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn sliding_hour_cap_is_never_exceeded() {
        let hub = test_hub();
        let engine = engine_with_confidence(&hub, 95.0);
        engine.add_symbol("BTCUSDT");
        let (handler, seen) = collecting_handler();
        let _sub = engine.subscribe("BTCUSDT", handler);

        engine
            .update_config(SignalConfigUpdate {
                max_signals_per_hour: Some(3),
                ..Default::default()
            })
            .unwrap();

        for i in 0..20 {
            hub.process_tick(tick("BTCUSDT", 65000.0 + i as f64, 500.0));
        }
        assert_eq!(seen.lock().len(), 3);
    }

    #[test]
    fn cap_is_per_symbol() {
        let hub = test_hub();
        let engine = engine_with_confidence(&hub, 95.0);
        engine.add_symbol("BTCUSDT");
        engine.add_symbol("ETHUSDT");
        let (btc_handler, btc_seen) = collecting_handler();
        let (eth_handler, eth_seen) = collecting_handler();
        let _s1 = engine.subscribe("BTCUSDT", btc_handler);
        let _s2 = engine.subscribe("ETHUSDT", eth_handler);

        engine
            .update_config(SignalConfigUpdate {
                max_signals_per_hour: Some(1),
                ..Default::default()
            })
            .unwrap();

        for i in 0..5 {
            hub.process_tick(tick("BTCUSDT", 65000.0 + i as f64, 500.0));
            hub.process_tick(tick("ETHUSDT", 3500.0 + i as f64, 500.0));
        }
        assert_eq!(btc_seen.lock().len(), 1);
        assert_eq!(eth_seen.lock().len(), 1);
    }

    #[test]
    fn cancel_stops_deliveries() {
        let hub = test_hub();
        let engine = engine_with_confidence(&hub, 95.0);
        engine.add_symbol("BTCUSDT");
        let (handler, seen) = collecting_handler();
        let sub = engine.subscribe("BTCUSDT", handler);
        sub.cancel();

        hub.process_tick(tick("BTCUSDT", 65000.0, 500.0));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn remove_symbol_discards_state() {
        let hub = test_hub();
        let engine = engine_with_confidence(&hub, 95.0);
        engine.add_symbol("BTCUSDT");
        let (handler, seen) = collecting_handler();
        let _sub = engine.subscribe("BTCUSDT", handler);

        engine.remove_symbol("BTCUSDT");
        engine.remove_symbol("BTCUSDT"); // idempotent

        hub.process_tick(tick("BTCUSDT", 65000.0, 500.0));
        assert!(seen.lock().is_empty());
        assert!(engine.tracked_symbols().is_empty());
    }

    #[test]
    fn dropping_the_engine_releases_hub_registrations() {
        let hub = test_hub();
        {
            let engine = engine_with_confidence(&hub, 95.0);
            engine.add_symbol("BTCUSDT");
            assert_eq!(hub.handler_count("BTCUSDT"), 1);
        }
        assert_eq!(hub.handler_count("BTCUSDT"), 0);

        // Nothing stale left to receive a tick.
        hub.process_tick(tick("BTCUSDT", 65000.0, 500.0));
    }

    #[test]
    fn invalid_update_leaves_config_untouched() {
        let hub = test_hub();
        let engine = engine_with_confidence(&hub, 95.0);

        let err = engine
            .update_config(SignalConfigUpdate {
                min_confidence: Some(150.0),
                min_volume: Some(50.0),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));

        // Neither field was merged — including the valid one.
        let config = engine.config();
        assert!((config.min_confidence - 70.0).abs() < f64::EPSILON);
        assert!((config.min_volume - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_update_merges_only_given_fields() {
        let hub = test_hub();
        let engine = engine_with_confidence(&hub, 95.0);

        engine
            .update_config(SignalConfigUpdate {
                max_signals_per_hour: Some(10),
                ..Default::default()
            })
            .unwrap();

        let config = engine.config();
        assert_eq!(config.max_signals_per_hour, 10);
        assert!((config.min_confidence - 70.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cleanup_is_terminal() {
        let hub = test_hub();
        let engine = engine_with_confidence(&hub, 95.0);
        engine.add_symbol("BTCUSDT");
        let (handler, seen) = collecting_handler();
        let _sub = engine.subscribe("BTCUSDT", handler);

        engine.cleanup();
        hub.process_tick(tick("BTCUSDT", 65000.0, 500.0));
        assert!(seen.lock().is_empty());

        engine.add_symbol("ETHUSDT"); // ignored after cleanup
        assert!(engine.tracked_symbols().is_empty());
    }

    #[test]
    fn wave_detector_end_to_end() {
        // The default detector wired through the whole pipeline: a steady
        // rise with healthy volume produces a buy signal.
        let hub = test_hub();
        let engine = SignalEngine::new(hub.clone(), SignalConfig::default(), "1h");
        engine.add_symbol("BTCUSDT");
        let (handler, seen) = collecting_handler();
        let _sub = engine.subscribe("BTCUSDT", handler);

        for i in 0..30 {
            hub.process_tick(tick("BTCUSDT", 65000.0 + i as f64 * 130.0, 500.0));
        }

        let seen = seen.lock();
        assert!(!seen.is_empty());
        assert_eq!(seen[0].direction, Direction::Buy);
        assert_eq!(seen[0].timeframe, "1h");
        assert!(seen[0].confidence >= 70.0);
    }
}
