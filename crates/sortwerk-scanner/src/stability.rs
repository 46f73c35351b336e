// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Deciding when a card has settled under the camera.

use std::time::Duration;

use tokio::time::Instant;

/// Consecutive positive detections required before a card counts as settled.
pub const DEFAULT_STABLE_FRAMES: u32 = 5;

/// Counts consecutive positive detection ticks.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    count: u32,
    threshold: u32,
}

impl Default for StabilityTracker {
    fn default() -> Self {
        Self::new(DEFAULT_STABLE_FRAMES)
    }
}

impl StabilityTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            count: 0,
            threshold: threshold.max(1),
        }
    }

    /// Record one detection tick and return whether the card is now stable.
    /// A single miss resets the count.
    pub fn observe(&mut self, detected: bool) -> bool {
        if detected {
            self.count = self.count.saturating_add(1);
        } else {
            self.count = 0;
        }
        self.is_stable()
    }

    pub fn is_stable(&self) -> bool {
        self.count >= self.threshold
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

/// Lets at most one detection tick through per interval, however often the
/// frame loop polls.
///
/// Polls only land on multiples of the poll period, so a poll that falls
/// within `tolerance` of the interval is let through rather than waiting a
/// whole extra poll.
#[derive(Debug, Clone)]
pub struct TickGate {
    interval: Duration,
    tolerance: Duration,
    last: Option<Instant>,
}

impl TickGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            tolerance: Duration::ZERO,
            last: None,
        }
    }

    /// Accept ticks up to `tolerance` early (capped at half the interval).
    /// Half the poll period keeps the average spacing at the interval.
    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance.min(self.interval / 2);
        self
    }

    /// Returns `true` and arms the gate if an interval (less the tolerance)
    /// has passed since the last accepted tick.
    pub fn try_pass(&mut self, now: Instant) -> bool {
        let due = self.interval - self.tolerance;
        let open = self
            .last
            .is_none_or(|last| now.saturating_duration_since(last) >= due);
        if open {
            self.last = Some(now);
        }
        open
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_after_exactly_five_hits() {
        let mut tracker = StabilityTracker::default();
        for _ in 0..4 {
            assert!(!tracker.observe(true));
        }
        assert!(tracker.observe(true));
        assert_eq!(tracker.count(), 5);
        assert!(tracker.observe(true));
    }

    #[test]
    fn single_miss_resets() {
        let mut tracker = StabilityTracker::default();
        for _ in 0..7 {
            tracker.observe(true);
        }
        assert!(!tracker.observe(false));
        assert_eq!(tracker.count(), 0);
        for _ in 0..4 {
            assert!(!tracker.observe(true));
        }
    }

    #[test]
    fn zero_threshold_is_raised_to_one() {
        let mut tracker = StabilityTracker::new(0);
        assert!(!tracker.is_stable());
        assert!(tracker.observe(true));
    }

    #[tokio::test(start_paused = true)]
    async fn gate_limits_tick_rate() {
        let mut gate = TickGate::new(Duration::from_millis(100));
        assert!(gate.try_pass(Instant::now()));

        tokio::time::advance(Duration::from_millis(33)).await;
        assert!(!gate.try_pass(Instant::now()));
        tokio::time::advance(Duration::from_millis(33)).await;
        assert!(!gate.try_pass(Instant::now()));
        tokio::time::advance(Duration::from_millis(34)).await;
        assert!(gate.try_pass(Instant::now()));

        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(!gate.try_pass(Instant::now()));
    }

    /// Advance in `poll` steps for `span` and record when the gate opened.
    async fn passes(gate: &mut TickGate, poll: Duration, span: Duration) -> Vec<u128> {
        let start = Instant::now();
        let mut opened = Vec::new();
        while start.elapsed() <= span {
            if gate.try_pass(Instant::now()) {
                opened.push(start.elapsed().as_millis());
            }
            tokio::time::advance(poll).await;
        }
        opened
    }

    #[tokio::test(start_paused = true)]
    async fn default_polling_ticks_every_interval() {
        let config = sortwerk_core::SorterConfig::default();
        let poll = config.frame_poll_interval();
        let mut gate =
            TickGate::new(config.detection_interval()).with_tolerance(poll / 2);

        let opened = passes(&mut gate, poll, Duration::from_millis(500)).await;
        assert_eq!(opened, vec![0, 100, 200, 300, 400, 500]);
    }

    #[tokio::test(start_paused = true)]
    async fn tolerance_absorbs_uneven_poll_period() {
        let poll = Duration::from_millis(33);
        let mut strict = TickGate::new(Duration::from_millis(100));
        let mut tolerant = TickGate::new(Duration::from_millis(100)).with_tolerance(poll / 2);

        let span = Duration::from_millis(400);
        assert_eq!(passes(&mut strict, poll, span).await, vec![0, 132, 264, 396]);
        assert_eq!(passes(&mut tolerant, poll, span).await, vec![0, 99, 198, 297, 396]);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_reopens_gate() {
        let mut gate = TickGate::new(Duration::from_millis(100));
        assert!(gate.try_pass(Instant::now()));
        gate.reset();
        assert!(gate.try_pass(Instant::now()));
    }
}
