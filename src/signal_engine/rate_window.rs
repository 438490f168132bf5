// =============================================================================
// Sliding-window emission limiter
// =============================================================================
//
// Exact sliding-window semantics: a deque of emission instants per symbol,
// pruned lazily on each check.  This never approximates with fixed calendar
// buckets — the count is always relative to "now minus the window".
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Length of the trailing window.
pub const WINDOW: Duration = Duration::from_secs(60 * 60);

/// Tracks recent emissions and enforces an at-most-N-per-window cap.
#[derive(Debug)]
pub struct RateWindow {
    emitted: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new() -> Self {
        Self {
            emitted: VecDeque::new(),
        }
    }

    /// Record an emission at `now` if fewer than `max` emissions fall inside
    /// the trailing window.  Returns whether the emission was admitted.
    pub fn try_acquire(&mut self, now: Instant, max: u32) -> bool {
        self.prune(now);
        if self.emitted.len() >= max as usize {
            return false;
        }
        self.emitted.push_back(now);
        true
    }

    /// Number of emissions inside the trailing window as of `now`.
    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.emitted.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.emitted.front() {
            if now.duration_since(front) >= WINDOW {
                self.emitted.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for RateWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_max_then_refuses() {
        let mut w = RateWindow::new();
        let now = Instant::now();
        assert!(w.try_acquire(now, 3));
        assert!(w.try_acquire(now, 3));
        assert!(w.try_acquire(now, 3));
        assert!(!w.try_acquire(now, 3));
        assert_eq!(w.count(now), 3);
    }

    #[test]
    fn window_slides_rather_than_resetting() {
        let mut w = RateWindow::new();
        let start = Instant::now();

        // Two emissions 30 minutes apart.
        assert!(w.try_acquire(start, 2));
        assert!(w.try_acquire(start + Duration::from_secs(1800), 2));

        // Just before the first expires the window is still full.
        let almost = start + WINDOW - Duration::from_secs(1);
        assert!(!w.try_acquire(almost, 2));

        // Once the first emission ages out, one slot opens — but only one.
        let after = start + WINDOW;
        assert!(w.try_acquire(after, 2));
        assert!(!w.try_acquire(after, 2));
    }

    #[test]
    fn zero_max_blocks_everything() {
        let mut w = RateWindow::new();
        assert!(!w.try_acquire(Instant::now(), 0));
    }

    #[test]
    fn count_never_exceeds_max_over_any_trailing_window() {
        let mut w = RateWindow::new();
        let start = Instant::now();
        let max = 5u32;

        // Offer an emission every minute for three hours.
        let mut admitted: Vec<Instant> = Vec::new();
        for minute in 0..180u64 {
            let t = start + Duration::from_secs(minute * 60);
            if w.try_acquire(t, max) {
                admitted.push(t);
            }
        }

        // Check the invariant over every trailing window ending at an
        // admission point.
        for &end in &admitted {
            let in_window = admitted
                .iter()
                .filter(|&&t| t <= end && end.duration_since(t) < WINDOW)
                .count();
            assert!(in_window <= max as usize);
        }
    }
}
