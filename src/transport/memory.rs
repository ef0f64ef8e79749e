//! In-process transport built on tokio broadcast channels.
//!
//! Only usable intra-process. Each [`MemoryTransport`] exposes a
//! [`MemoryHandle`] so tests can inject faults: dropping the connection,
//! failing publishes, or delaying every delivery to emulate a degraded link.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use super::{ConnectionState, ConnectionStatus, Delivery, DeliveryStream, Transport};
use crate::error::{BenchError, Result};

/// Per-channel buffer; slower receivers past this lag lose messages
const CHANNEL_CAPACITY: usize = 1024;

/// Shared message hub all memory transports of one "server" talk to
#[derive(Debug, Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

#[derive(Debug)]
struct HubInner {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    available: AtomicBool,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                channels: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// When unavailable, every `connect` and `subscribe` is refused
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self
            .inner
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Fan a payload out to the current subscribers of `channel`.
    /// Returns how many receivers saw it.
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        // No receivers is not an error: delivery is at-most-once
        self.sender(channel).send(payload.to_string()).unwrap_or(0)
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.sender(channel).receiver_count()
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct Shared {
    status: ConnectionStatus,
    session: Mutex<CancellationToken>,
    failing_publishes: AtomicU32,
    published: AtomicU64,
    connects: AtomicU64,
    closed: AtomicBool,
}

/// Fault-injection and inspection handle for one [`MemoryTransport`]
#[derive(Debug, Clone)]
pub struct MemoryHandle {
    shared: Arc<Shared>,
}

impl MemoryHandle {
    /// Drop the current connection as if the peer reset it
    pub fn disconnect(&self) {
        self.shared.session().cancel();
        self.shared.status.set(ConnectionState::Disconnected);
    }

    /// Make the next `n` publish calls fail with a publish error
    pub fn fail_next_publishes(&self, n: u32) {
        self.shared.failing_publishes.store(n, Ordering::SeqCst);
    }

    pub fn published(&self) -> u64 {
        self.shared.published.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> u64 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status.get()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Shared {
    fn session(&self) -> CancellationToken {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn new_session(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token.clone();
        token
    }
}

/// Transport over a [`MemoryHub`]
#[derive(Debug)]
pub struct MemoryTransport {
    hub: MemoryHub,
    shared: Arc<Shared>,
    delivery_delay: Duration,
}

impl MemoryTransport {
    pub fn new(hub: MemoryHub) -> Self {
        Self {
            hub,
            shared: Arc::new(Shared {
                status: ConnectionStatus::new(),
                session: Mutex::new(CancellationToken::new()),
                failing_publishes: AtomicU32::new(0),
                published: AtomicU64::new(0),
                connects: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
            delivery_delay: Duration::ZERO,
        }
    }

    /// Delay every delivery by `delay` (degraded link)
    pub fn with_delivery_delay(mut self, delay: Duration) -> Self {
        self.delivery_delay = delay;
        self
    }

    pub fn handle(&self) -> MemoryHandle {
        MemoryHandle {
            shared: self.shared.clone(),
        }
    }

    fn open_session(&self) -> Result<CancellationToken> {
        self.shared.status.set(ConnectionState::Connecting);
        if !self.hub.is_available() {
            self.shared.status.set(ConnectionState::Disconnected);
            return Err(BenchError::Transport(
                "failed to connect to memory hub: connection refused".to_string(),
            ));
        }

        self.shared.closed.store(false, Ordering::SeqCst);
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let token = self.shared.new_session();
        self.shared.status.set(ConnectionState::Connected);
        Ok(token)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&mut self) -> Result<()> {
        self.open_session().map(|_| ())
    }

    async fn publish(&mut self, channel: &str, payload: &str) -> Result<()> {
        if self.shared.status.get() != ConnectionState::Connected {
            return Err(BenchError::Transport("not connected".to_string()));
        }

        let remaining = self.shared.failing_publishes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.shared
                .failing_publishes
                .store(remaining - 1, Ordering::SeqCst);
            return Err(BenchError::Publish("injected publish failure".to_string()));
        }

        self.hub.publish(channel, payload);
        self.shared.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&mut self, channel: &str) -> Result<DeliveryStream> {
        let session = if self.shared.status.get() == ConnectionState::Connected {
            self.shared.session()
        } else {
            self.open_session()?
        };

        let mut rx = self.hub.sender(channel).subscribe();
        let status = self.shared.status.clone();
        let delay = self.delivery_delay;
        let channel = channel.to_string();

        let stream = async_stream::stream! {
            loop {
                let received = tokio::select! {
                    _ = session.cancelled() => break,
                    received = rx.recv() => received,
                };

                match received {
                    Ok(payload) => {
                        if !delay.is_zero() {
                            tokio::select! {
                                _ = session.cancelled() => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        yield Ok(Delivery::now(payload));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %channel, skipped, "Memory subscriber lagged, messages dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            status.set(ConnectionState::Disconnected);
        };

        Ok(Box::pin(stream))
    }

    async fn close(&mut self) -> Result<()> {
        self.shared.session().cancel();
        self.shared.status.set(ConnectionState::Disconnected);
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn status(&self) -> &ConnectionStatus {
        &self.shared.status
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let hub = MemoryHub::new();
        let mut publisher = MemoryTransport::new(hub.clone());
        let mut subscriber = MemoryTransport::new(hub.clone());

        publisher.connect().await.unwrap();
        let mut stream = subscriber.subscribe("all").await.unwrap();
        assert_eq!(hub.subscriber_count("all"), 1);

        publisher.publish("all", "hello").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.payload, "hello");
        assert_eq!(publisher.handle().published(), 1);
    }

    #[tokio::test]
    async fn test_connect_refused_when_hub_unavailable() {
        let hub = MemoryHub::new();
        hub.set_available(false);
        let mut transport = MemoryTransport::new(hub);

        let err = transport.connect().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_ends_stream() {
        let hub = MemoryHub::new();
        let mut subscriber = MemoryTransport::new(hub);
        let handle = subscriber.handle();

        let mut stream = subscriber.subscribe("all").await.unwrap();
        handle.disconnect();

        assert!(stream.next().await.is_none());
        assert_eq!(subscriber.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_injected_publish_failures() {
        let hub = MemoryHub::new();
        let mut publisher = MemoryTransport::new(hub);
        publisher.connect().await.unwrap();
        publisher.handle().fail_next_publishes(1);

        assert!(matches!(
            publisher.publish("all", "x").await,
            Err(BenchError::Publish(_))
        ));
        assert!(publisher.publish("all", "x").await.is_ok());
        assert_eq!(publisher.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let hub = MemoryHub::new();
        let mut transport = MemoryTransport::new(hub);
        transport.connect().await.unwrap();

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.is_closed());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_delay() {
        let hub = MemoryHub::new();
        let mut subscriber =
            MemoryTransport::new(hub.clone()).with_delivery_delay(Duration::from_millis(300));
        let mut stream = subscriber.subscribe("all").await.unwrap();

        let start = tokio::time::Instant::now();
        hub.publish("all", "late");
        let delivery = stream.next().await.unwrap().unwrap();
        assert!(delivery.received_at - start >= Duration::from_millis(300));
    }
}
