//! Cross-subscriber stall detection.
//!
//! The fast cohort shares one [`StallTracker`]: every fast arrival compares
//! itself against the most recent fast arrival from *any* subscriber, so a
//! gap above the threshold means the whole standard path hiccuped. The slow
//! subscriber only reads (and clears) the flag, which makes its first
//! arrival after a fast-path stall visible in the logs.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Gap between fast-path arrivals above which a stall is recorded
pub const DEFAULT_STALL_THRESHOLD: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct StallState {
    last_arrival: Option<Instant>,
    stalled: bool,
}

/// Shared stall state, injected into subscribers behind an `Arc`
#[derive(Debug)]
pub struct StallTracker {
    threshold: Duration,
    state: Mutex<StallState>,
}

impl StallTracker {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            state: Mutex::new(StallState::default()),
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Record a fast-path arrival at `now`.
    ///
    /// Returns the gap since the previous fast arrival when it exceeds the
    /// threshold (strictly). `last_arrival` is always moved to `now`.
    pub fn record_fast(&self, now: Instant) -> Option<Duration> {
        let mut state = self.lock();

        let stall = state
            .last_arrival
            .map(|last| now.saturating_duration_since(last))
            .filter(|gap| *gap > self.threshold);

        if stall.is_some() {
            state.stalled = true;
        }
        state.last_arrival = Some(now);
        stall
    }

    /// Record a slow-path arrival.
    ///
    /// Returns whether the arrival should be reported: either a fast-path
    /// stall happened since the last report, or `always_log` is set. The
    /// stall flag is cleared whenever a report is due.
    pub fn record_slow(&self, always_log: bool) -> bool {
        let mut state = self.lock();
        if state.stalled || always_log {
            state.stalled = false;
            true
        } else {
            false
        }
    }

    pub fn is_stalled(&self) -> bool {
        self.lock().stalled
    }

    pub fn last_arrival(&self) -> Option<Instant> {
        self.lock().last_arrival
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StallState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for StallTracker {
    fn default() -> Self {
        Self::new(DEFAULT_STALL_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_first_arrival_never_stalls() {
        let tracker = StallTracker::default();
        assert_eq!(tracker.record_fast(Instant::now()), None);
        assert!(!tracker.is_stalled());
        assert!(tracker.last_arrival().is_some());
    }

    #[test]
    fn test_single_stall_in_gap_sequence() {
        let tracker = StallTracker::default();
        let start = Instant::now();

        // Arrivals at 0, 50, 100, 350, 400 -> gaps 50, 50, 250, 50
        let offsets = [0, 50, 100, 350, 400];
        let stalls: Vec<(u64, Duration)> = offsets
            .iter()
            .enumerate()
            .filter_map(|(i, offset)| {
                let received = i as u64 + 1;
                tracker
                    .record_fast(start + ms(*offset))
                    .map(|gap| (received, gap))
            })
            .collect();

        assert_eq!(stalls, vec![(4, ms(250))]);
        assert!(tracker.is_stalled());
    }

    #[test]
    fn test_threshold_is_strict() {
        let tracker = StallTracker::default();
        let start = Instant::now();
        tracker.record_fast(start);
        assert_eq!(tracker.record_fast(start + ms(100)), None);
        assert_eq!(tracker.record_fast(start + ms(201)), Some(ms(101)));
    }

    #[test]
    fn test_slow_arrival_suppressed_without_stall() {
        let tracker = StallTracker::default();
        let start = Instant::now();
        tracker.record_fast(start);
        tracker.record_fast(start + ms(50));

        assert!(!tracker.record_slow(false));
        assert!(!tracker.record_slow(false));
    }

    #[test]
    fn test_slow_arrival_reported_once_after_stall() {
        let tracker = StallTracker::default();
        let start = Instant::now();
        tracker.record_fast(start);
        tracker.record_fast(start + ms(300));
        assert!(tracker.is_stalled());

        assert!(tracker.record_slow(false));
        assert!(!tracker.is_stalled());
        assert!(!tracker.record_slow(false));
    }

    #[test]
    fn test_always_log_reports_every_slow_arrival() {
        let tracker = StallTracker::default();
        assert!(tracker.record_slow(true));
        assert!(tracker.record_slow(true));
        assert!(!tracker.is_stalled());
    }

    #[test]
    fn test_slow_arrival_does_not_move_last_arrival() {
        let tracker = StallTracker::default();
        let start = Instant::now();
        tracker.record_fast(start);
        tracker.record_slow(true);
        assert_eq!(tracker.last_arrival(), Some(start));

        // The gap is still measured from the last fast arrival
        assert_eq!(tracker.record_fast(start + ms(150)), Some(ms(150)));
    }
}
