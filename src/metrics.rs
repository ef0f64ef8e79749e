//! Metrics collection using HdrHistogram for accurate percentile calculations.
//!
//! Counters are plain atomics owned by one component each; latency
//! histograms are shared per cohort (fast / slow) so percentiles describe the
//! whole path rather than a single connection.

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Upper bound for recorded latencies: 10 minutes in microseconds
const MAX_LATENCY_US: u64 = 600_000_000;

/// Publish-to-receive latency histogram (microseconds, 3 significant figures)
#[derive(Debug)]
pub struct LatencyHistogram {
    histogram: Mutex<Histogram<u64>>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            histogram: Mutex::new(
                Histogram::new_with_bounds(1, MAX_LATENCY_US, 3)
                    .expect("static histogram bounds are valid"),
            ),
        }
    }

    pub fn record(&self, latency: Duration) {
        let latency_us = (latency.as_micros() as u64).clamp(1, MAX_LATENCY_US);
        if let Ok(mut hist) = self.histogram.lock() {
            let _ = hist.record(latency_us);
        }
    }

    pub fn count(&self) -> u64 {
        self.histogram.lock().map(|h| h.len()).unwrap_or(0)
    }

    /// Latency percentile in milliseconds
    pub fn percentile(&self, percentile: f64) -> f64 {
        self.histogram
            .lock()
            .map(|h| h.value_at_percentile(percentile) as f64 / 1000.0)
            .unwrap_or(0.0)
    }

    pub fn max(&self) -> f64 {
        self.histogram
            .lock()
            .map(|h| h.max() as f64 / 1000.0)
            .unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            samples: self.count(),
            p50_ms: self.percentile(50.0),
            p95_ms: self.percentile(95.0),
            p99_ms: self.percentile(99.0),
            max_ms: self.max(),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySnapshot {
    pub samples: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// How a sequence number relates to the previous one seen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceEvent {
    First,
    InOrder,
    /// `missing` sequence numbers were skipped
    Gap { missing: u64 },
    Duplicate,
    /// Lower than the highest sequence already seen
    OutOfOrder { highest: u64 },
    /// Sequence 1 opening a new subscription after `previous`; the
    /// broadcaster restarted
    Restarted { previous: u64 },
}

/// Per-subscriber counters. Survive reconnects.
#[derive(Debug, Default)]
pub struct SubscriberMetrics {
    received: AtomicU64,
    stalls: AtomicU64,
    slow_observations: AtomicU64,
    gaps: AtomicU64,
    missed: AtomicU64,
    duplicates: AtomicU64,
    out_of_order: AtomicU64,
    protocol_errors: AtomicU64,
    reconnects: AtomicU64,
    restarts: AtomicU64,
    /// Highest sequence seen, 0 when none
    highest_sequence: AtomicU64,
    /// Set when a subscription opens, cleared by the next sequence
    session_start: AtomicBool,
}

impl SubscriberMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one application payload, returning the new received count
    pub fn record_received(&self) -> u64 {
        self.received.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slow_observation(&self) {
        self.slow_observations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark the start of a new subscription
    pub fn begin_session(&self) {
        self.session_start.store(true, Ordering::Relaxed);
    }

    /// Classify `sequence` against the highest one seen so far.
    ///
    /// The high-water mark only moves forward, except that sequence 1 as the
    /// first delivery of a new subscription resets it to 1. Any other lower
    /// sequence is reported as out of order.
    pub fn record_sequence(&self, sequence: u64) -> SequenceEvent {
        let session_start = self.session_start.swap(false, Ordering::Relaxed);
        if session_start && sequence == 1 {
            return match self.highest_sequence.swap(1, Ordering::Relaxed) {
                0 => SequenceEvent::First,
                1 => {
                    self.duplicates.fetch_add(1, Ordering::Relaxed);
                    SequenceEvent::Duplicate
                }
                previous => {
                    self.restarts.fetch_add(1, Ordering::Relaxed);
                    SequenceEvent::Restarted { previous }
                }
            };
        }

        let highest = self.highest_sequence.fetch_max(sequence, Ordering::Relaxed);

        if highest == 0 {
            return SequenceEvent::First;
        }

        if sequence == highest + 1 {
            SequenceEvent::InOrder
        } else if sequence > highest {
            let missing = sequence - highest - 1;
            self.gaps.fetch_add(1, Ordering::Relaxed);
            self.missed.fetch_add(missing, Ordering::Relaxed);
            SequenceEvent::Gap { missing }
        } else if sequence == highest {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            SequenceEvent::Duplicate
        } else {
            self.out_of_order.fetch_add(1, Ordering::Relaxed);
            SequenceEvent::OutOfOrder { highest }
        }
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn highest_sequence(&self) -> Option<u64> {
        match self.highest_sequence.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            received: self.received(),
            stalls: self.stalls.load(Ordering::Relaxed),
            slow_observations: self.slow_observations.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
            missed: self.missed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            last_sequence: self.highest_sequence(),
        }
    }
}

/// Point-in-time copy of [`SubscriberMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub received: u64,
    pub stalls: u64,
    pub slow_observations: u64,
    pub gaps: u64,
    pub missed: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub protocol_errors: u64,
    pub reconnects: u64,
    /// Times the sequence started over at 1 on a new subscription
    pub restarts: u64,
    pub last_sequence: Option<u64>,
}

/// Broadcaster counters
#[derive(Debug, Default)]
pub struct BroadcasterMetrics {
    published: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    reconnects: AtomicU64,
    last_sequence: AtomicU64,
}

impl BroadcasterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self, sequence: u64) {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.last_sequence.store(sequence, Ordering::Relaxed);
    }

    /// A publish attempt that failed; the sequence number was still consumed
    pub fn record_failed(&self, sequence: u64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.last_sequence.store(sequence, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BroadcasterStats {
        BroadcasterStats {
            published: self.published(),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_sequence: self.last_sequence.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`BroadcasterMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcasterStats {
    pub published: u64,
    pub failed: u64,
    pub skipped: u64,
    pub reconnects: u64,
    pub last_sequence: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_histogram() {
        let histogram = LatencyHistogram::new();
        for ms in [10, 20, 30, 40, 200] {
            histogram.record(Duration::from_millis(ms));
        }

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.samples, 5);
        assert!((snapshot.p50_ms - 30.0).abs() < 0.1);
        assert!((snapshot.max_ms - 200.0).abs() < 0.5);
    }

    #[test]
    fn test_zero_latency_is_recorded() {
        let histogram = LatencyHistogram::new();
        histogram.record(Duration::ZERO);
        assert_eq!(histogram.count(), 1);
    }

    #[test]
    fn test_sequence_classification() {
        let metrics = SubscriberMetrics::new();
        assert_eq!(metrics.record_sequence(1), SequenceEvent::First);
        assert_eq!(metrics.record_sequence(2), SequenceEvent::InOrder);
        assert_eq!(metrics.record_sequence(5), SequenceEvent::Gap { missing: 2 });
        assert_eq!(metrics.record_sequence(5), SequenceEvent::Duplicate);
        assert_eq!(
            metrics.record_sequence(3),
            SequenceEvent::OutOfOrder { highest: 5 }
        );
        assert_eq!(metrics.record_sequence(6), SequenceEvent::InOrder);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.gaps, 1);
        assert_eq!(snapshot.missed, 2);
        assert_eq!(snapshot.duplicates, 1);
        assert_eq!(snapshot.out_of_order, 1);
        assert_eq!(snapshot.last_sequence, Some(6));
    }

    #[test]
    fn test_restart_at_one_resets_only_on_new_session() {
        let metrics = SubscriberMetrics::new();
        metrics.begin_session();
        assert_eq!(metrics.record_sequence(1), SequenceEvent::First);
        assert_eq!(metrics.record_sequence(2), SequenceEvent::InOrder);
        assert_eq!(metrics.record_sequence(3), SequenceEvent::InOrder);

        // Mid-session, a 1 is just late
        assert_eq!(
            metrics.record_sequence(1),
            SequenceEvent::OutOfOrder { highest: 3 }
        );

        metrics.begin_session();
        assert_eq!(
            metrics.record_sequence(1),
            SequenceEvent::Restarted { previous: 3 }
        );
        assert_eq!(metrics.record_sequence(2), SequenceEvent::InOrder);

        // A reconnect that resumes mid-stream keeps the mark
        metrics.begin_session();
        assert_eq!(metrics.record_sequence(4), SequenceEvent::Gap { missing: 1 });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.restarts, 1);
        assert_eq!(snapshot.out_of_order, 1);
        assert_eq!(snapshot.last_sequence, Some(4));
    }

    #[test]
    fn test_first_sequence_may_start_anywhere() {
        let metrics = SubscriberMetrics::new();
        assert_eq!(metrics.record_sequence(42), SequenceEvent::First);
        assert_eq!(metrics.snapshot().gaps, 0);
    }

    #[test]
    fn test_received_counter() {
        let metrics = SubscriberMetrics::new();
        assert_eq!(metrics.record_received(), 1);
        assert_eq!(metrics.record_received(), 2);
        metrics.record_stall();
        metrics.record_protocol_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.stalls, 1);
        assert_eq!(snapshot.protocol_errors, 1);
        assert_eq!(snapshot.last_sequence, None);
    }

    #[test]
    fn test_broadcaster_metrics() {
        let metrics = BroadcasterMetrics::new();
        metrics.record_published(1);
        metrics.record_failed(2);
        metrics.record_skipped();
        metrics.record_published(3);

        let stats = metrics.snapshot();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.last_sequence, 3);
    }
}
