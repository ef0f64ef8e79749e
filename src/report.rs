//! Report generation for harness runs.

use serde::{Deserialize, Serialize};

use crate::broadcaster::BroadcasterState;
use crate::metrics::{BroadcasterStats, LatencySnapshot};
use crate::subscriber::SubscriberSnapshot;

/// Complete harness report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessReport {
    pub elapsed_secs: f64,
    pub stall_threshold_ms: u64,
    /// One row per cohort that had subscribers (fast, then slow)
    pub cohorts: Vec<CohortReport>,
    pub broadcasters: Vec<BroadcasterReport>,
    pub subscribers: Vec<SubscriberSnapshot>,
    /// Whether shutdown hit the grace period before every task finished
    pub shutdown_timed_out: bool,
}

/// Aggregated counters for one cohort
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortReport {
    pub cohort: String,
    pub subscribers: usize,
    pub received: u64,
    pub stalls: u64,
    pub slow_observations: u64,
    pub gaps: u64,
    pub missed: u64,
    pub out_of_order: u64,
    pub protocol_errors: u64,
    pub reconnects: u64,
    pub restarts: u64,
    pub latency: LatencySnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcasterReport {
    pub name: String,
    pub state: BroadcasterState,
    #[serde(flatten)]
    pub stats: BroadcasterStats,
}

impl CohortReport {
    /// Sum the snapshots of one cohort. `None` when the cohort is empty.
    pub fn from_snapshots(
        cohort: &str,
        snapshots: &[&SubscriberSnapshot],
        latency: LatencySnapshot,
    ) -> Option<Self> {
        if snapshots.is_empty() {
            return None;
        }

        let sum = |f: fn(&SubscriberSnapshot) -> u64| snapshots.iter().map(|s| f(s)).sum::<u64>();

        Some(Self {
            cohort: cohort.to_string(),
            subscribers: snapshots.len(),
            received: sum(|s| s.counters.received),
            stalls: sum(|s| s.counters.stalls),
            slow_observations: sum(|s| s.counters.slow_observations),
            gaps: sum(|s| s.counters.gaps),
            missed: sum(|s| s.counters.missed),
            out_of_order: sum(|s| s.counters.out_of_order),
            protocol_errors: sum(|s| s.counters.protocol_errors),
            reconnects: sum(|s| s.counters.reconnects),
            restarts: sum(|s| s.counters.restarts),
            latency,
        })
    }
}

impl HarnessReport {
    pub fn new(
        elapsed_secs: f64,
        stall_threshold_ms: u64,
        subscribers: Vec<SubscriberSnapshot>,
        fast_latency: LatencySnapshot,
        slow_latency: LatencySnapshot,
        broadcasters: Vec<BroadcasterReport>,
        shutdown_timed_out: bool,
    ) -> Self {
        let fast: Vec<&SubscriberSnapshot> = subscribers.iter().filter(|s| !s.slow).collect();
        let slow: Vec<&SubscriberSnapshot> = subscribers.iter().filter(|s| s.slow).collect();

        let cohorts = [
            CohortReport::from_snapshots("fast", &fast, fast_latency),
            CohortReport::from_snapshots("slow", &slow, slow_latency),
        ]
        .into_iter()
        .flatten()
        .collect();

        Self {
            elapsed_secs,
            stall_threshold_ms,
            cohorts,
            broadcasters,
            subscribers,
            shutdown_timed_out,
        }
    }

    pub fn cohort(&self, name: &str) -> Option<&CohortReport> {
        self.cohorts.iter().find(|c| c.cohort == name)
    }

    /// Stalls seen by the fast cohort; zero means the slow path stayed isolated
    pub fn fast_stalls(&self) -> u64 {
        self.cohort("fast").map(|c| c.stalls).unwrap_or(0)
    }

    /// Print the report as an ASCII table
    pub fn print_table(&self) {
        println!();
        println!("╔══════════════════════════════════════════════════════════════════════════════════════════════════╗");
        println!("║                                 BROADCAST BENCHMARK RESULTS                                      ║");
        println!("╚══════════════════════════════════════════════════════════════════════════════════════════════════╝");
        println!();
        println!("┌────────┬──────┬──────────┬────────┬────────┬──────────┬──────────┬──────────┬──────────┬──────────┐");
        println!("│ Cohort │ Subs │ Received │ Stalls │  Gaps  │ Reorders │  p50(ms) │  p95(ms) │  p99(ms) │  max(ms) │");
        println!("├────────┼──────┼──────────┼────────┼────────┼──────────┼──────────┼──────────┼──────────┼──────────┤");

        for cohort in &self.cohorts {
            println!(
                "│ {:<6} │ {:>4} │ {:>8} │ {:>6} │ {:>6} │ {:>8} │ {:>8.1} │ {:>8.1} │ {:>8.1} │ {:>8.1} │",
                cohort.cohort,
                cohort.subscribers,
                cohort.received,
                cohort.stalls,
                cohort.gaps,
                cohort.out_of_order,
                cohort.latency.p50_ms,
                cohort.latency.p95_ms,
                cohort.latency.p99_ms,
                cohort.latency.max_ms,
            );
        }

        println!("└────────┴──────┴──────────┴────────┴────────┴──────────┴──────────┴──────────┴──────────┴──────────┘");

        if !self.broadcasters.is_empty() {
            println!();
            println!("┌──────────────────────┬────────────┬───────────┬────────┬─────────┬────────────┐");
            println!("│ Broadcaster          │   State    │ Published │ Failed │ Skipped │ Reconnects │");
            println!("├──────────────────────┼────────────┼───────────┼────────┼─────────┼────────────┤");
            for broadcaster in &self.broadcasters {
                println!(
                    "│ {:<20} │ {:^10} │ {:>9} │ {:>6} │ {:>7} │ {:>10} │",
                    broadcaster.name,
                    broadcaster.state.to_string(),
                    broadcaster.stats.published,
                    broadcaster.stats.failed,
                    broadcaster.stats.skipped,
                    broadcaster.stats.reconnects,
                );
            }
            println!("└──────────────────────┴────────────┴───────────┴────────┴─────────┴────────────┘");
        }

        println!();
        self.print_summary();
    }

    /// Print a compact summary
    pub fn print_summary(&self) {
        println!(
            "Ran {:.1}s, stall threshold {}ms",
            self.elapsed_secs, self.stall_threshold_ms
        );

        if let Some(slow) = self.cohort("slow") {
            println!(
                "Fast-path stalls: {} | slow-path observations: {}",
                self.fast_stalls(),
                slow.slow_observations
            );
        } else {
            println!("Fast-path stalls: {} (slow subscriber skipped)", self.fast_stalls());
        }

        if self.shutdown_timed_out {
            println!("Warning: shutdown grace period elapsed before every task stopped");
        }
    }

    /// Export the report as JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CounterSnapshot;
    use crate::subscriber::SubscriberState;

    fn snapshot(name: &str, slow: bool, received: u64, stalls: u64) -> SubscriberSnapshot {
        SubscriberSnapshot {
            name: name.to_string(),
            slow,
            state: SubscriberState::Stopped,
            counters: CounterSnapshot {
                received,
                stalls,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_report_generation() {
        let subscribers = vec![
            snapshot("Subscriber: 0", false, 100, 1),
            snapshot("Subscriber: 1", false, 98, 0),
            snapshot("Slow subscriber", true, 97, 0),
        ];
        let broadcasters = vec![BroadcasterReport {
            name: "cable".to_string(),
            state: BroadcasterState::Stopped,
            stats: BroadcasterStats {
                published: 100,
                ..Default::default()
            },
        }];

        let report = HarnessReport::new(
            10.0,
            100,
            subscribers,
            LatencySnapshot::default(),
            LatencySnapshot::default(),
            broadcasters,
            false,
        );

        assert_eq!(report.cohorts.len(), 2);
        let fast = report.cohort("fast").unwrap();
        assert_eq!(fast.subscribers, 2);
        assert_eq!(fast.received, 198);
        assert_eq!(report.fast_stalls(), 1);
        assert_eq!(report.cohort("slow").unwrap().received, 97);
    }

    #[test]
    fn test_empty_cohort_is_omitted() {
        let report = HarnessReport::new(
            1.0,
            100,
            vec![snapshot("Subscriber: 0", false, 5, 0)],
            LatencySnapshot::default(),
            LatencySnapshot::default(),
            Vec::new(),
            false,
        );
        assert_eq!(report.cohorts.len(), 1);
        assert!(report.cohort("slow").is_none());
    }

    #[test]
    fn test_json_export() {
        let report = HarnessReport::new(
            1.0,
            100,
            vec![snapshot("Slow subscriber", true, 5, 0)],
            LatencySnapshot::default(),
            LatencySnapshot::default(),
            Vec::new(),
            true,
        );
        let json: serde_json::Value = serde_json::from_str(&report.to_json()).unwrap();
        assert_eq!(json["cohorts"][0]["cohort"], "slow");
        assert_eq!(json["subscribers"][0]["received"], 5);
        assert_eq!(json["shutdown_timed_out"], true);
    }
}
