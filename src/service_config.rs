// =============================================================================
// Service Configuration — externally supplied process settings
// =============================================================================
//
// The core persists nothing itself: configuration is read once at startup from
// a JSON file (plus env overrides applied in main.rs).  Every field carries a
// serde default so that older config files keep loading as new fields appear.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_stream_url() -> String {
    "wss://stream.binance.com:9443/stream".to_string()
}

fn default_rest_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_timeframe() -> String {
    "1h".to_string()
}

fn default_min_confidence() -> f64 {
    70.0
}

fn default_max_signals_per_hour() -> u32 {
    5
}

fn default_min_volume() -> f64 {
    100.0
}

fn default_min_risk_reward() -> f64 {
    1.5
}

/// Initial signal-engine thresholds, adjustable later via `update_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalDefaults {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_max_signals_per_hour")]
    pub max_signals_per_hour: u32,
    #[serde(default = "default_min_volume")]
    pub min_volume: f64,
    #[serde(default = "default_min_risk_reward")]
    pub min_risk_reward: f64,
}

impl Default for SignalDefaults {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            max_signals_per_hour: default_max_signals_per_hour(),
            min_volume: default_min_volume(),
            min_risk_reward: default_min_risk_reward(),
        }
    }
}

/// Top-level configuration consumed by the Marketpulse core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Symbols the engine tracks at startup.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Feature flag: start the public market-data stream on boot.
    #[serde(default = "default_true")]
    pub enable_public_stream: bool,

    /// Feature flag: run the signal engine on tracked symbols.
    #[serde(default = "default_true")]
    pub enable_signals: bool,

    /// Combined-stream WebSocket endpoint of the market-data provider.
    #[serde(default = "default_stream_url")]
    pub stream_url: String,

    /// REST endpoint for historical kline fetches.
    #[serde(default = "default_rest_url")]
    pub rest_url: String,

    /// Timeframe stamped onto emitted signals.
    #[serde(default = "default_timeframe")]
    pub timeframe: String,

    /// Initial signal-engine thresholds.
    #[serde(default)]
    pub signal_defaults: SignalDefaults,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            enable_public_stream: true,
            enable_signals: true,
            stream_url: default_stream_url(),
            rest_url: default_rest_url(),
            timeframe: default_timeframe(),
            signal_defaults: SignalDefaults::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read service config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse service config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            stream = config.enable_public_stream,
            signals = config.enable_signals,
            "service config loaded"
        );

        Ok(config)
    }
}
