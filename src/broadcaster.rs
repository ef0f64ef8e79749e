//! Timed publisher.
//!
//! A broadcaster owns one transport and publishes a [`BenchmarkEnvelope`]
//! every `broadcast_interval` while the transport is connected. Losing the
//! connection stops the timer; the task then waits `reconnect_delay` and
//! connects again, forever, until stopped.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::BroadcasterConfig;
use crate::metrics::{BroadcasterMetrics, BroadcasterStats};
use crate::payload::BenchmarkEnvelope;
use crate::transport::{ConnectionState, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcasterState {
    Idle,
    Connecting,
    Running,
    Stopped,
}

impl std::fmt::Display for BroadcasterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BroadcasterState::Idle => write!(f, "idle"),
            BroadcasterState::Connecting => write!(f, "connecting"),
            BroadcasterState::Running => write!(f, "running"),
            BroadcasterState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Why the publish loop returned
enum LoopExit {
    Cancelled,
    Disconnected,
}

pub struct Broadcaster<T: Transport> {
    config: BroadcasterConfig,
    transport: T,
    metrics: Arc<BroadcasterMetrics>,
    state: watch::Sender<BroadcasterState>,
    cancel: CancellationToken,
    sequence: u64,
}

impl<T: Transport> Broadcaster<T> {
    pub fn new(config: BroadcasterConfig, transport: T) -> Self {
        let (state, _rx) = watch::channel(BroadcasterState::Idle);
        Self {
            config,
            transport,
            metrics: Arc::new(BroadcasterMetrics::new()),
            state,
            cancel: CancellationToken::new(),
            sequence: 0,
        }
    }

    /// Connect and start publishing on a background task.
    ///
    /// The task stops when `parent` (or the returned handle) is cancelled.
    pub fn spawn(mut self, parent: &CancellationToken) -> BroadcasterHandle {
        self.cancel = parent.child_token();

        let handle = BroadcasterHandle {
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

        tracing::info!(
            backend = self.transport.name(),
            endpoint = %self.config.endpoint,
            channel = %self.config.channel,
            interval_ms = self.config.broadcast_interval.as_millis() as u64,
            "Starting broadcaster"
        );

        loop {
            self.set_state(BroadcasterState::Connecting);
            tracing::debug!(backend = self.transport.name(), "Attempting to connect");

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.transport.connect() => result,
            };

            match connected {
                Ok(()) => {
                    tracing::info!(
                        backend = self.transport.name(),
                        endpoint = %self.config.endpoint,
                        "Connected, broadcast interval started"
                    );
                    self.set_state(BroadcasterState::Running);

                    match self.publish_loop().await {
                        LoopExit::Cancelled => break,
                        LoopExit::Disconnected => {
                            self.set_state(BroadcasterState::Connecting);
                            self.metrics.record_reconnect();
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        backend = self.transport.name(),
                        error = %e,
                        retry_ms = self.config.reconnect_delay.as_millis() as u64,
                        "Connection failed"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        if let Err(e) = self.transport.close().await {
            tracing::warn!(backend = self.transport.name(), error = %e, "Error closing transport");
        }
        self.set_state(BroadcasterState::Stopped);

        let stats = self.metrics.snapshot();
        tracing::info!(
            backend = self.transport.name(),
            published = stats.published,
            failed = stats.failed,
            skipped = stats.skipped,
            reconnects = stats.reconnects,
            "Broadcaster stopped"
        );
    }

    async fn publish_loop(&mut self) -> LoopExit {
        let cancel = self.cancel.clone();
        let interval = self.config.broadcast_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut connection = self.transport.watch_state();
        connection.borrow_and_update();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return LoopExit::Cancelled,
                changed = connection.changed() => {
                    let state = if changed.is_ok() {
                        *connection.borrow_and_update()
                    } else {
                        ConnectionState::Disconnected
                    };
                    if state == ConnectionState::Disconnected {
                        tracing::info!(backend = self.transport.name(), "Connection closed");
                        return LoopExit::Disconnected;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(exit) = self.tick().await {
                        return exit;
                    }
                }
            }
        }
    }

    /// One timer tick. `Err` means the connection is gone or the broadcaster
    /// was stopped mid-publish.
    async fn tick(&mut self) -> Result<(), LoopExit> {
        if self.transport.state() != ConnectionState::Connected {
            self.metrics.record_skipped();
            tracing::debug!(backend = self.transport.name(), "Not connected, skipping broadcast");
            return Ok(());
        }

        self.sequence += 1;
        let sequence = self.sequence;

        let payload = match BenchmarkEnvelope::new(sequence, self.config.filler_size)
            .and_then(|envelope| envelope.to_json())
        {
            Ok(payload) => payload,
            Err(e) => {
                self.metrics.record_failed(sequence);
                tracing::warn!(sequence, error = %e, "Error building envelope");
                return Ok(());
            }
        };

        // A backend that accepts but never answers must not hold up stop()
        let cancel = self.cancel.clone();
        let published = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.transport.publish(&self.config.channel, &payload) => Some(result),
        };
        let Some(published) = published else {
            tracing::debug!(backend = self.transport.name(), sequence, "Publish abandoned on stop");
            return Err(LoopExit::Cancelled);
        };

        match published {
            Ok(()) => {
                self.metrics.record_published(sequence);
                if self.config.debug {
                    tracing::info!(channel = %self.config.channel, sequence, "Broadcasted message");
                } else {
                    tracing::debug!(channel = %self.config.channel, sequence, "Broadcasted message");
                }
                Ok(())
            }
            Err(e) if e.is_transport() => {
                self.metrics.record_failed(sequence);
                tracing::warn!(backend = self.transport.name(), sequence, error = %e, "Connection lost while publishing");
                Err(LoopExit::Disconnected)
            }
            Err(e) => {
                self.metrics.record_failed(sequence);
                tracing::warn!(backend = self.transport.name(), sequence, error = %e, "Error publishing message");
                Ok(())
            }
        }
    }

    fn set_state(&self, state: BroadcasterState) {
        self.state.send_replace(state);
    }
}

/// Control handle for a spawned [`Broadcaster`]
#[derive(Debug, Clone)]
pub struct BroadcasterHandle {
    state: watch::Receiver<BroadcasterState>,
    metrics: Arc<BroadcasterMetrics>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl BroadcasterHandle {
    pub fn state(&self) -> BroadcasterState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<BroadcasterState> {
        self.state.clone()
    }

    pub fn stats(&self) -> BroadcasterStats {
        self.metrics.snapshot()
    }

    /// Cancel the timer and any pending reconnect, close the transport and
    /// wait for the task to finish. Safe to call more than once.
    pub async fn stop(&self) -> BroadcasterStats {
        self.cancel.cancel();

        let task = self.task.lock().ok().and_then(|mut slot| slot.take());
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "Broadcaster task ended abnormally");
                }
            }
            None => {
                let mut state = self.state.clone();
                let _ = state.wait_for(|s| *s == BroadcasterState::Stopped).await;
            }
        }

        self.stats()
    }
}
