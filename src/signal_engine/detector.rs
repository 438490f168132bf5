// =============================================================================
// Signal Detection — pluggable pattern/wave classification
// =============================================================================
//
// The engine treats detection as a capability it calls: anything implementing
// `SignalDetector` can score a rolling window of updates.  The default
// `WaveDetector` classifies directional structure (impulse vs corrective,
// wave number from zigzag legs) and derives entry/stop/target levels from
// recent volatility.  It is deterministic for a given window.
// =============================================================================

use std::collections::VecDeque;

use crate::types::{Direction, MarketUpdate, WaveClass};

/// Risk multiples used for the target ladder (nearest-first).
const TARGET_MULTIPLES: [f64; 3] = [1.618, 2.618, 4.236];

/// Floor on the stop distance as a fraction of entry, so a flat window cannot
/// produce a zero-width stop.
const MIN_STOP_FRACTION: f64 = 0.002;

/// A candidate signal produced by a detector, before the engine's gate checks.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub targets: Vec<f64>,
    /// Confidence score in the 0-100 range.
    pub confidence: f64,
    pub wave: WaveClass,
    pub volatility: f64,
    pub momentum: f64,
}

/// A scoring function over the rolling update window of one symbol.
pub trait SignalDetector: Send + Sync {
    /// Evaluate the window (oldest first) and return a candidate, or `None`
    /// when no actionable structure is present.
    fn evaluate(&self, window: &VecDeque<MarketUpdate>) -> Option<Candidate>;
}

/// Default detector: momentum plus zigzag-leg wave classification.
pub struct WaveDetector {
    /// Minimum number of updates before any evaluation fires.
    min_window: usize,
    /// Momentum magnitude below which the window is considered noise.
    momentum_floor: f64,
}

impl WaveDetector {
    pub fn new(min_window: usize) -> Self {
        Self {
            min_window,
            momentum_floor: 0.0005,
        }
    }
}

impl Default for WaveDetector {
    fn default() -> Self {
        Self::new(12)
    }
}

impl SignalDetector for WaveDetector {
    fn evaluate(&self, window: &VecDeque<MarketUpdate>) -> Option<Candidate> {
        if window.len() < self.min_window {
            return None;
        }

        let first = window.front()?;
        let last = window.back()?;
        if first.price <= 0.0 || last.price <= 0.0 {
            return None;
        }

        let momentum = (last.price - first.price) / first.price;
        if momentum.abs() < self.momentum_floor {
            return None;
        }

        let direction = if momentum > 0.0 {
            Direction::Buy
        } else {
            Direction::Sell
        };

        // Window-wide price range as a volatility proxy.
        let max_price = window.iter().map(|u| u.price).fold(f64::MIN, f64::max);
        let min_price = window.iter().map(|u| u.price).fold(f64::MAX, f64::min);
        let volatility = (max_price - min_price) / last.price;

        // Zigzag legs: one leg per change of delta sign across the window.
        let deltas: Vec<f64> = window
            .iter()
            .zip(window.iter().skip(1))
            .map(|(a, b)| b.price - a.price)
            .collect();
        let legs = 1 + deltas
            .windows(2)
            .filter(|pair| pair[0].signum() != pair[1].signum() && pair[1] != 0.0)
            .count();

        // Fraction of deltas agreeing with the dominant direction.
        let agreeing = deltas
            .iter()
            .filter(|d| d.signum() == momentum.signum())
            .count();
        let consistency = agreeing as f64 / deltas.len().max(1) as f64;

        // Strong one-way moves read as impulse waves (1-5), choppy structure
        // as a corrective (a-b-c).
        let (pattern, wave) = if consistency >= 0.6 {
            ("impulse", (legs as u8 - 1) % 5 + 1)
        } else {
            ("corrective", (legs as u8 - 1) % 3 + 1)
        };
        let sub_wave = match wave {
            1 => "i",
            2 => "ii",
            3 => "iii",
            4 => "iv",
            _ => "v",
        };

        let confidence =
            (100.0 * (0.4 * consistency + 0.6 * (momentum.abs() / 0.01).min(1.0))).clamp(0.0, 100.0);

        let entry_price = last.price;
        let stop_fraction = (volatility * 0.5).max(MIN_STOP_FRACTION);
        let (stop_loss, risk) = match direction {
            Direction::Buy => {
                let stop = entry_price * (1.0 - stop_fraction);
                (stop, entry_price - stop)
            }
            Direction::Sell => {
                let stop = entry_price * (1.0 + stop_fraction);
                (stop, stop - entry_price)
            }
        };

        let targets = TARGET_MULTIPLES
            .iter()
            .map(|m| match direction {
                Direction::Buy => entry_price + m * risk,
                Direction::Sell => entry_price - m * risk,
            })
            .collect();

        Some(Candidate {
            direction,
            entry_price,
            stop_loss,
            targets,
            confidence,
            wave: WaveClass {
                wave,
                sub_wave: sub_wave.to_string(),
                pattern: pattern.to_string(),
            },
            volatility,
            momentum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(price: f64) -> MarketUpdate {
        MarketUpdate {
            symbol: "BTCUSDT".into(),
            price,
            volume: 500.0,
            price_change: 0.0,
            price_change_percent: 0.0,
            high: price * 1.001,
            low: price * 0.999,
            timestamp: 1_700_000_000_000,
        }
    }

    fn window_of(prices: &[f64]) -> VecDeque<MarketUpdate> {
        prices.iter().map(|&p| update(p)).collect()
    }

    #[test]
    fn short_window_yields_nothing() {
        let detector = WaveDetector::default();
        let window = window_of(&[100.0, 101.0, 102.0]);
        assert!(detector.evaluate(&window).is_none());
    }

    #[test]
    fn flat_window_yields_nothing() {
        let detector = WaveDetector::default();
        let window = window_of(&[100.0; 20]);
        assert!(detector.evaluate(&window).is_none());
    }

    #[test]
    fn steady_rise_is_a_confident_buy_impulse() {
        let detector = WaveDetector::default();
        let prices: Vec<f64> = (0..20).map(|i| 100.0 + i as f64 * 0.2).collect();
        let candidate = detector.evaluate(&window_of(&prices)).unwrap();

        assert_eq!(candidate.direction, Direction::Buy);
        assert_eq!(candidate.wave.pattern, "impulse");
        assert!(candidate.confidence > 90.0);
        assert!(candidate.momentum > 0.03);
        assert!(candidate.stop_loss < candidate.entry_price);
        assert_eq!(candidate.targets.len(), 3);
        assert!(candidate.targets[0] > candidate.entry_price);
        assert!(candidate.targets[0] < candidate.targets[1]);
        assert!(candidate.targets[1] < candidate.targets[2]);
    }

    #[test]
    fn steady_fall_is_a_sell() {
        let detector = WaveDetector::default();
        let prices: Vec<f64> = (0..20).map(|i| 100.0 - i as f64 * 0.2).collect();
        let candidate = detector.evaluate(&window_of(&prices)).unwrap();

        assert_eq!(candidate.direction, Direction::Sell);
        assert!(candidate.stop_loss > candidate.entry_price);
        assert!(candidate.targets[0] < candidate.entry_price);
    }

    #[test]
    fn choppy_drift_is_corrective_with_lower_confidence() {
        let detector = WaveDetector::default();
        // Alternating up/down with a slight upward drift.
        let prices: Vec<f64> = (0..20)
            .map(|i| 100.0 + (i as f64 * 0.05) + if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        let candidate = detector.evaluate(&window_of(&prices)).unwrap();

        assert_eq!(candidate.wave.pattern, "corrective");
        let steady: Vec<f64> = (0..20).map(|i| 100.0 + i as f64 * 0.2).collect();
        let steady_conf = detector.evaluate(&window_of(&steady)).unwrap().confidence;
        assert!(candidate.confidence < steady_conf);
    }

    #[test]
    fn first_target_beats_default_risk_reward_floor() {
        let detector = WaveDetector::default();
        let prices: Vec<f64> = (0..20).map(|i| 100.0 + i as f64 * 0.2).collect();
        let c = detector.evaluate(&window_of(&prices)).unwrap();

        let risk = c.entry_price - c.stop_loss;
        let reward = c.targets[0] - c.entry_price;
        assert!(reward / risk > 1.5);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let detector = WaveDetector::default();
        let prices: Vec<f64> = (0..20).map(|i| 100.0 + i as f64 * 0.2).collect();
        let a = detector.evaluate(&window_of(&prices)).unwrap();
        let b = detector.evaluate(&window_of(&prices)).unwrap();
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.wave, b.wave);
        assert_eq!(a.targets, b.targets);
    }
}
