//! Subscriber fleet runner.
//!
//! Builds N fast subscribers on the standard endpoint and one slow subscriber
//! on the degraded endpoint, all sharing one [`StallTracker`], optionally
//! alongside broadcasters. Shutdown stops everything and folds the counters
//! into a [`HarnessReport`].

use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::broadcaster::{Broadcaster, BroadcasterHandle};
use crate::config::{BroadcasterConfig, HarnessConfig, SubscriberConfig};
use crate::error::Result;
use crate::metrics::LatencyHistogram;
use crate::report::{BroadcasterReport, HarnessReport};
use crate::stall::StallTracker;
use crate::subscriber::{Subscriber, SubscriberHandle};
use crate::transport::Transport;

pub struct Harness {
    config: HarnessConfig,
    tracker: Arc<StallTracker>,
    fast_latency: Arc<LatencyHistogram>,
    slow_latency: Arc<LatencyHistogram>,
    cancel: CancellationToken,
    subscribers: Vec<SubscriberHandle>,
    broadcasters: Vec<(String, BroadcasterHandle)>,
    started: Instant,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        let tracker = Arc::new(StallTracker::new(config.stall_threshold));

        Ok(Self {
            config,
            tracker,
            fast_latency: Arc::new(LatencyHistogram::new()),
            slow_latency: Arc::new(LatencyHistogram::new()),
            cancel: CancellationToken::new(),
            subscribers: Vec::new(),
            broadcasters: Vec::new(),
            started: Instant::now(),
        })
    }

    /// Spawn the fleet. `make_transport` is called once per subscriber with
    /// that subscriber's options (endpoint, `slow` flag).
    pub fn start<T, F>(&mut self, mut make_transport: F) -> Result<()>
    where
        T: Transport,
        F: FnMut(&SubscriberConfig) -> Result<T>,
    {
        let mut configs: Vec<SubscriberConfig> = (0..self.config.subscribers)
            .map(|i| self.config.fast_subscriber(i))
            .collect();
        if !self.config.skip_slow {
            configs.push(self.config.slow_subscriber());
        }

        // Build every transport first so a bad endpoint spawns nothing
        let transports = configs
            .iter()
            .map(&mut make_transport)
            .collect::<Result<Vec<T>>>()?;

        self.started = Instant::now();
        for (config, transport) in configs.into_iter().zip(transports) {
            let latency = if config.slow {
                self.slow_latency.clone()
            } else {
                self.fast_latency.clone()
            };
            let handle = Subscriber::new(config, transport, self.tracker.clone())
                .with_latency(latency)
                .with_always_log_slow(self.config.log_slow)
                .spawn(&self.cancel);
            self.subscribers.push(handle);
        }

        tracing::info!(
            fast = self.config.subscribers,
            slow = !self.config.skip_slow,
            standard = %self.config.standard,
            degraded = %self.config.degraded,
            "All subscribers are set up and running"
        );
        Ok(())
    }

    /// Run a broadcaster under this harness's lifetime
    pub fn attach_broadcaster<T: Transport>(
        &mut self,
        name: impl Into<String>,
        config: BroadcasterConfig,
        transport: T,
    ) -> BroadcasterHandle {
        let handle = Broadcaster::new(config, transport).spawn(&self.cancel);
        self.broadcasters.push((name.into(), handle.clone()));
        handle
    }

    pub fn tracker(&self) -> Arc<StallTracker> {
        self.tracker.clone()
    }

    pub fn subscribers(&self) -> &[SubscriberHandle] {
        &self.subscribers
    }

    /// Token cancelled at shutdown; children of it stop with the harness
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every broadcaster and subscriber, bounded by the grace period
    pub async fn shutdown(self) -> HarnessReport {
        tracing::info!("Shutting down...");
        self.cancel.cancel();

        let broadcasters = futures::future::join_all(
            self.broadcasters
                .iter()
                .map(|(_, handle)| handle.stop()),
        );
        let subscribers =
            futures::future::join_all(self.subscribers.iter().map(|handle| handle.stop()));

        let timed_out = tokio::time::timeout(
            self.config.shutdown_grace,
            futures::future::join(broadcasters, subscribers),
        )
        .await
        .is_err();

        if timed_out {
            tracing::warn!(
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                "Shutdown grace period elapsed, reporting partial state"
            );
        }

        let subscribers = self.subscribers.iter().map(|h| h.snapshot()).collect();
        let broadcasters = self
            .broadcasters
            .iter()
            .map(|(name, handle)| BroadcasterReport {
                name: name.clone(),
                state: handle.state(),
                stats: handle.stats(),
            })
            .collect();

        HarnessReport::new(
            self.started.elapsed().as_secs_f64(),
            self.config.stall_threshold.as_millis() as u64,
            subscribers,
            self.fast_latency.snapshot(),
            self.slow_latency.snapshot(),
            broadcasters,
            timed_out,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::BroadcasterState;
    use crate::error::BenchError;
    use crate::subscriber::SubscriberState;
    use crate::transport::{MemoryHandle, MemoryHub, MemoryTransport};
    use std::time::Duration;

    fn harness_config(subscribers: usize, skip_slow: bool) -> HarnessConfig {
        HarnessConfig {
            subscribers,
            skip_slow,
            reconnect_interval: Duration::from_millis(500),
            ..Default::default()
        }
    }

    async fn wait_subscribed(harness: &Harness) {
        for handle in harness.subscribers() {
            handle
                .watch_state()
                .wait_for(|s| *s == SubscriberState::Subscribed)
                .await
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let hub = MemoryHub::new();
        let mut faults: Vec<MemoryHandle> = Vec::new();

        let mut harness = Harness::new(harness_config(2, true)).unwrap();
        harness
            .start(|_| {
                let transport = MemoryTransport::new(hub.clone());
                faults.push(transport.handle());
                Ok(transport)
            })
            .unwrap();
        wait_subscribed(&harness).await;

        let publisher = MemoryTransport::new(hub.clone());
        faults.push(publisher.handle());
        let broadcaster = harness.attach_broadcaster(
            "memory",
            BroadcasterConfig {
                broadcast_interval: Duration::from_millis(50),
                ..Default::default()
            },
            publisher,
        );

        tokio::time::sleep(Duration::from_millis(275)).await;
        let report = harness.shutdown().await;

        assert!(!report.shutdown_timed_out);
        assert_eq!(broadcaster.state(), BroadcasterState::Stopped);
        assert!(faults.iter().all(|f| f.is_closed()));
        assert!(report
            .subscribers
            .iter()
            .all(|s| s.state == SubscriberState::Stopped));

        let fast = report.cohort("fast").unwrap();
        assert_eq!(fast.subscribers, 2);
        assert_eq!(fast.received, 10);
        assert_eq!(fast.latency.samples, 10);
        assert_eq!(report.broadcasters[0].stats.published, 5);
        assert!(report.cohort("slow").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fleet_layout() {
        let hub = MemoryHub::new();
        let mut harness = Harness::new(harness_config(3, false)).unwrap();

        let mut seen = Vec::new();
        harness
            .start(|config| {
                seen.push((config.name.clone(), config.endpoint.port, config.slow));
                Ok(MemoryTransport::new(hub.clone()))
            })
            .unwrap();

        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], ("Subscriber: 0".to_string(), 8080, false));
        assert_eq!(seen[3], ("Slow subscriber".to_string(), 8081, true));
        assert_eq!(harness.subscribers().iter().filter(|s| s.is_slow()).count(), 1);

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_transport_error_spawns_nothing() {
        let mut harness = Harness::new(harness_config(2, false)).unwrap();
        let result = harness.start(|config| {
            if config.slow {
                Err(BenchError::InvalidArgument("bad slow endpoint".to_string()))
            } else {
                Ok(MemoryTransport::new(MemoryHub::new()))
            }
        });

        assert!(result.is_err());
        assert!(harness.subscribers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_subscriber_does_not_disturb_fast_cohort() {
        let hub = MemoryHub::new();
        let mut harness = Harness::new(harness_config(3, false)).unwrap();
        harness
            .start(|config| {
                let transport = MemoryTransport::new(hub.clone());
                Ok(if config.slow {
                    transport.with_delivery_delay(Duration::from_millis(300))
                } else {
                    transport
                })
            })
            .unwrap();
        wait_subscribed(&harness).await;

        harness.attach_broadcaster(
            "memory",
            BroadcasterConfig {
                broadcast_interval: Duration::from_millis(50),
                ..Default::default()
            },
            MemoryTransport::new(hub.clone()),
        );

        tokio::time::sleep(Duration::from_millis(1025)).await;
        let report = harness.shutdown().await;

        assert_eq!(report.fast_stalls(), 0);
        assert_eq!(report.cohort("fast").unwrap().received, 60);
        assert!(report.cohort("slow").unwrap().received > 0);
        assert_eq!(report.cohort("slow").unwrap().slow_observations, 0);
    }

    #[test]
    fn test_rejects_empty_fleet() {
        assert!(Harness::new(harness_config(0, true)).is_err());
    }
}
