//! Receive loop with stall detection.
//!
//! Each subscriber owns one transport. Fast subscribers feed the shared
//! [`StallTracker`]; the slow subscriber (routed through the degraded
//! endpoint) only reads it, reporting its first arrival after any fast-path
//! stall.

use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SubscriberConfig;
use crate::metrics::{CounterSnapshot, LatencyHistogram, SequenceEvent, SubscriberMetrics};
use crate::payload::BenchmarkEnvelope;
use crate::stall::StallTracker;
use crate::transport::{Delivery, DeliveryStream, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriberState {
    Idle,
    Connecting,
    Subscribed,
    Stopped,
}

impl std::fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriberState::Idle => write!(f, "idle"),
            SubscriberState::Connecting => write!(f, "connecting"),
            SubscriberState::Subscribed => write!(f, "subscribed"),
            SubscriberState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Final or intermediate view of one subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberSnapshot {
    pub name: String,
    pub slow: bool,
    pub state: SubscriberState,
    #[serde(flatten)]
    pub counters: CounterSnapshot,
}

enum StreamEnd {
    Cancelled,
    Closed,
}

pub struct Subscriber<T: Transport> {
    config: SubscriberConfig,
    transport: T,
    tracker: Arc<StallTracker>,
    latency: Arc<LatencyHistogram>,
    metrics: Arc<SubscriberMetrics>,
    always_log_slow: bool,
    state: watch::Sender<SubscriberState>,
    cancel: CancellationToken,
}

impl<T: Transport> Subscriber<T> {
    pub fn new(config: SubscriberConfig, transport: T, tracker: Arc<StallTracker>) -> Self {
        let (state, _rx) = watch::channel(SubscriberState::Idle);
        Self {
            config,
            transport,
            tracker,
            latency: Arc::new(LatencyHistogram::new()),
            metrics: Arc::new(SubscriberMetrics::new()),
            always_log_slow: false,
            state,
            cancel: CancellationToken::new(),
        }
    }

    /// Record latencies into a histogram shared with the rest of the cohort
    pub fn with_latency(mut self, latency: Arc<LatencyHistogram>) -> Self {
        self.latency = latency;
        self
    }

    /// Report every slow-path arrival, not only the first after a stall
    pub fn with_always_log_slow(mut self, always_log_slow: bool) -> Self {
        self.always_log_slow = always_log_slow;
        self
    }

    /// Connect, subscribe and consume on a background task.
    ///
    /// The task stops when `parent` (or the returned handle) is cancelled.
    pub fn spawn(mut self, parent: &CancellationToken) -> SubscriberHandle {
        self.cancel = parent.child_token();

        let handle = SubscriberHandle {
            name: self.config.name.clone(),
            slow: self.config.slow,
            state: self.state.subscribe(),
            metrics: self.metrics.clone(),
            cancel: self.cancel.clone(),
            task: Arc::new(Mutex::new(None)),
        };

        let task = tokio::spawn(self.run());
        if let Ok(mut slot) = handle.task.lock() {
            *slot = Some(task);
        }
        handle
    }

    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let mut first_attempt = true;

        loop {
            if !first_attempt {
                self.metrics.record_reconnect();
            }
            first_attempt = false;

            self.set_state(SubscriberState::Connecting);

            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                result = Self::open(&mut self.transport, &self.config.channel) => result,
            };

            match subscribed {
                Ok(stream) => {
                    self.set_state(SubscriberState::Subscribed);
                    self.metrics.begin_session();
                    self.log_event(format_args!("Connected to {}", self.config.endpoint));

                    match self.consume(stream).await {
                        StreamEnd::Cancelled => break,
                        StreamEnd::Closed => {
                            self.log_event(format_args!("Connection closed"));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        subscriber = %self.config.name,
                        backend = self.transport.name(),
                        error = %e,
                        "Subscription failed"
                    );
                }
            }

            if !self.config.reconnect {
                break;
            }

            self.set_state(SubscriberState::Connecting);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }

        if let Err(e) = self.transport.close().await {
            tracing::warn!(subscriber = %self.config.name, error = %e, "Error closing transport");
        }
        self.set_state(SubscriberState::Stopped);
    }

    async fn open(transport: &mut T, channel: &str) -> crate::error::Result<DeliveryStream> {
        transport.connect().await?;
        transport.subscribe(channel).await
    }

    async fn consume(&self, mut stream: DeliveryStream) -> StreamEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.on_delivery(delivery),
                Some(Err(e)) => {
                    self.metrics.record_protocol_error();
                    tracing::warn!(subscriber = %self.config.name, error = %e, "Discarding malformed frame");
                }
                None => return StreamEnd::Closed,
            }
        }
    }

    fn on_delivery(&self, delivery: Delivery) {
        let received = self.metrics.record_received();

        let report_slow = if self.config.slow {
            self.tracker.record_slow(self.always_log_slow)
        } else {
            if let Some(delay) = self.tracker.record_fast(delivery.received_at) {
                self.metrics.record_stall();
                tracing::warn!(
                    subscriber = %self.config.name,
                    received,
                    delay_ms = delay.as_millis() as u64,
                    "Got stuck before receiving broadcast"
                );
            }
            false
        };

        let envelope = match BenchmarkEnvelope::from_json(&delivery.payload) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                self.metrics.record_protocol_error();
                tracing::warn!(subscriber = %self.config.name, received, error = %e, "Unparseable payload");
                None
            }
        };
        let sequence = envelope.as_ref().map(|e| e.sequence);

        if report_slow {
            self.metrics.record_slow_observation();
            if self.config.debug {
                tracing::info!(subscriber = %self.config.name, received, sequence = ?sequence, "Received message");
            } else {
                tracing::debug!(subscriber = %self.config.name, received, sequence = ?sequence, "Received message");
            }
        }

        let Some(envelope) = envelope else {
            return;
        };

        match self.metrics.record_sequence(envelope.sequence) {
            SequenceEvent::Gap { missing } => {
                tracing::debug!(
                    subscriber = %self.config.name,
                    sequence = envelope.sequence,
                    missing,
                    "Sequence gap"
                );
            }
            SequenceEvent::OutOfOrder { highest } => {
                tracing::warn!(
                    subscriber = %self.config.name,
                    sequence = envelope.sequence,
                    highest,
                    "Out-of-order delivery"
                );
            }
            SequenceEvent::Restarted { previous } => {
                tracing::info!(
                    subscriber = %self.config.name,
                    previous,
                    "Sequence restarted at 1, broadcaster was restarted"
                );
            }
            SequenceEvent::Duplicate => {
                tracing::debug!(subscriber = %self.config.name, sequence = envelope.sequence, "Duplicate delivery");
            }
            SequenceEvent::First | SequenceEvent::InOrder => {}
        }

        self.latency
            .record(envelope.latency_since_publish(Utc::now()));
    }

    fn log_event(&self, message: std::fmt::Arguments<'_>) {
        let cohort = if self.config.slow { "slow" } else { "normal" };
        if self.config.debug {
            tracing::info!(subscriber = %self.config.name, cohort, "{}", message);
        } else {
            tracing::debug!(subscriber = %self.config.name, cohort, "{}", message);
        }
    }

    fn set_state(&self, state: SubscriberState) {
        self.state.send_replace(state);
    }
}

/// Control handle for a spawned [`Subscriber`]
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    name: String,
    slow: bool,
    state: watch::Receiver<SubscriberState>,
    metrics: Arc<SubscriberMetrics>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SubscriberHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_slow(&self) -> bool {
        self.slow
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> SubscriberSnapshot {
        SubscriberSnapshot {
            name: self.name.clone(),
            slow: self.slow,
            state: self.state(),
            counters: self.metrics.snapshot(),
        }
    }

    /// Cancel the receive loop and any pending reconnect, close the
    /// transport and wait for the task to finish. Safe to call more than once.
    pub async fn stop(&self) -> SubscriberSnapshot {
        self.cancel.cancel();

        let task = self.task.lock().ok().and_then(|mut slot| slot.take());
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    tracing::warn!(subscriber = %self.name, error = %e, "Subscriber task ended abnormally");
                }
            }
            None => {
                let mut state = self.state.clone();
                let _ = state.wait_for(|s| *s == SubscriberState::Stopped).await;
            }
        }

        self.snapshot()
    }
}
