// =============================================================================
// MarketPulse — Main Entry Point
// =============================================================================
//
// Wires the pieces together: the historical-data gateway, the market-data hub
// with its resilient feed connection, and the signal engine tracking the
// configured symbols.  Runs until Ctrl-C, then tears everything down.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod error;
mod gateway;
mod market_data;
mod service_config;
mod signal_engine;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::gateway::BinanceKlineGateway;
use crate::market_data::MarketDataHub;
use crate::service_config::ServiceConfig;
use crate::signal_engine::{SignalConfig, SignalEngine, SignalHandler};
use crate::types::TradeSignal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("MarketPulse starting up");

    let mut config = ServiceConfig::load("service_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        ServiceConfig::default()
    });

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("MARKETPULSE_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.symbols.is_empty() {
        config.symbols = vec!["BTCUSDT".into(), "ETHUSDT".into(), "SOLUSDT".into()];
    }

    info!(symbols = ?config.symbols, timeframe = %config.timeframe, "configured symbols");

    // ── 2. Build the hub and the engine ──────────────────────────────────
    let gateway = Arc::new(BinanceKlineGateway::new(config.rest_url.clone()));
    let hub = MarketDataHub::new(config.stream_url.clone(), gateway);

    let signal_config = SignalConfig {
        min_confidence: config.signal_defaults.min_confidence,
        max_signals_per_hour: config.signal_defaults.max_signals_per_hour,
        min_volume: config.signal_defaults.min_volume,
        min_risk_reward: config.signal_defaults.min_risk_reward,
    };
    let engine = SignalEngine::new(hub.clone(), signal_config, config.timeframe.clone());

    // ── 3. Start streaming ───────────────────────────────────────────────
    if config.enable_public_stream {
        hub.enable();
    } else {
        warn!("public stream disabled by config — no live updates will flow");
    }

    let mut signal_subs = Vec::new();
    if config.enable_signals {
        let log_signal: SignalHandler = Arc::new(|s: &TradeSignal| {
            info!(
                id = %s.id,
                symbol = %s.symbol,
                direction = %s.direction,
                entry = s.entry_price,
                stop = s.stop_loss,
                confidence = s.confidence,
                pattern = %s.wave.pattern,
                "signal"
            );
        });
        for symbol in &config.symbols {
            engine.add_symbol(symbol);
            signal_subs.push(engine.subscribe(symbol, log_signal.clone()));
        }
        info!(
            tracked = ?engine.tracked_symbols(),
            config = ?engine.config(),
            "signal engine ready"
        );
    }

    // Periodic status line per symbol, plus feed health at debug level.
    {
        let hub = hub.clone();
        let symbols = config.symbols.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                for symbol in &symbols {
                    let price = hub.get_price(symbol);
                    let change = hub.last_update(symbol).map(|u| u.price_change_percent);
                    info!(symbol = %symbol, price = ?price, change_pct = ?change, "status");
                }
                debug!(
                    state = ?hub.connection_state(),
                    dropped = hub.dropped_ticks(),
                    "feed status"
                );
            }
        });
    }

    // Warm-up check: confirm historical data is reachable for the first
    // symbol.  Degrades to empty when the gateway is down.
    if let Some(first) = config.symbols.first() {
        let bars = hub.get_historical_data(first, &config.timeframe, 50).await;
        info!(symbol = %first, bars = bars.len(), "historical warm-up fetch");
    }

    // ── 4. Run until interrupted ─────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!(dropped_ticks = hub.dropped_ticks(), "shutdown requested");

    for sub in signal_subs {
        sub.cancel();
    }
    engine.cleanup();
    hub.cleanup().await;

    info!("MarketPulse stopped");
    Ok(())
}
