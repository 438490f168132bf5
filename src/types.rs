// =============================================================================
// Canonical data model shared across the Marketpulse core
// =============================================================================

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Latest known state of one symbol, produced by the hub's normalization step.
///
/// An update is an immutable snapshot: it is superseded by the next update for
/// the same symbol and is never mutated after creation. Subscribers receive it
/// by reference and must clone if they need to keep it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketUpdate {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub price_change: f64,
    pub price_change_percent: f64,
    pub high: f64,
    pub low: f64,
    /// Provider event time in milliseconds; receipt time when absent upstream.
    pub timestamp: i64,
}

/// One OHLCV bar from the historical-data gateway.
///
/// Sequences of bars are ordered by `time` ascending with no duplicate
/// timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoricalBar {
    /// Bar open time in milliseconds.
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Trade direction of an emitted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Wave classification attached to a signal by the detector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaveClass {
    /// Wave number within the detected structure (1-5 impulse, 1-3 corrective).
    pub wave: u8,
    pub sub_wave: String,
    pub pattern: String,
}

/// Auxiliary measurements captured at signal creation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalMetadata {
    pub volume: f64,
    pub volatility: f64,
    pub momentum: f64,
    pub risk_reward_ratio: f64,
}

/// A confidence-scored trade signal emitted by the signal engine.
///
/// Signals are immutable once emitted and are consumed by zero or more
/// subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: f64,
    /// Target prices ordered nearest-first.
    pub targets: Vec<f64>,
    /// Confidence score in the 0-100 range.
    pub confidence: f64,
    pub wave: WaveClass,
    pub timeframe: String,
    /// Emission time in milliseconds.
    pub timestamp: i64,
    pub metadata: SignalMetadata,
}
