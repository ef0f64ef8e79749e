//! Pluggable pub/sub transports.
//!
//! Every backend under test is wrapped in a [`Transport`]: the broadcaster
//! only ever calls `connect` + `publish`, the subscriber only `connect` +
//! `subscribe`. Backend framing (cable envelopes, Centrifugo commands, Redis
//! pub/sub) never leaks past this module.

pub mod cable;
pub mod centrifugo;
pub mod memory;
pub mod redis;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::Result;

pub use cable::{CableIdentifier, CableTransport};
pub use centrifugo::CentrifugoTransport;
pub use memory::{MemoryHandle, MemoryHub, MemoryTransport};
pub use redis::RedisTransport;

/// Connection lifecycle shared by every transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Observable connection state.
///
/// Cheap to clone; clones share the same underlying watch channel so a
/// subscription stream can flip the state its transport reports.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectionStatus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx: Arc::new(tx) }
    }

    /// Update the state, waking watchers only on an actual change
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// One application payload as it came off the wire
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: String,
    pub received_at: Instant,
}

impl Delivery {
    pub fn now(payload: String) -> Self {
        Self {
            payload,
            received_at: Instant::now(),
        }
    }
}

/// Lazy, infinite, non-restartable sequence of deliveries.
///
/// The stream ends when the underlying connection closes; protocol errors
/// are yielded in place and do not end it.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Capability set every backend adapter implements
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Short backend name used in logs
    fn name(&self) -> &'static str;

    /// Establish the publish-side connection
    async fn connect(&mut self) -> Result<()>;

    /// Deliver one message. Connection-level failures come back as
    /// `BenchError::Transport` and leave the state `Disconnected`.
    async fn publish(&mut self, channel: &str, payload: &str) -> Result<()>;

    /// Open the receive side and wait for the subscription to be confirmed
    async fn subscribe(&mut self, channel: &str) -> Result<DeliveryStream>;

    /// Release every handle. Idempotent.
    async fn close(&mut self) -> Result<()>;

    fn status(&self) -> &ConnectionStatus;

    fn is_closed(&self) -> bool;

    fn state(&self) -> ConnectionState {
        self.status().get()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.status().watch()
    }
}

/// Lets the CLI pick a backend at runtime
#[async_trait]
impl Transport for Box<dyn Transport> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn connect(&mut self) -> Result<()> {
        (**self).connect().await
    }

    async fn publish(&mut self, channel: &str, payload: &str) -> Result<()> {
        (**self).publish(channel, payload).await
    }

    async fn subscribe(&mut self, channel: &str) -> Result<DeliveryStream> {
        (**self).subscribe(channel).await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }

    fn status(&self) -> &ConnectionStatus {
        (**self).status()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_boxed_transport_delegates() {
        let hub = MemoryHub::new();
        let mut transport: Box<dyn Transport> = Box::new(MemoryTransport::new(hub));
        assert_eq!(Transport::name(&transport), "memory");

        transport.connect().await.unwrap();
        assert_eq!(Transport::state(&transport), ConnectionState::Connected);
        transport.close().await.unwrap();
        assert!(Transport::is_closed(&transport));
    }

    #[test]
    fn test_status_starts_disconnected() {
        let status = ConnectionStatus::new();
        assert_eq!(status.get(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_status_clones_share_state() {
        let status = ConnectionStatus::new();
        let clone = status.clone();
        let mut rx = status.watch();

        clone.set(ConnectionState::Connected);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connected);
        assert_eq!(status.get(), ConnectionState::Connected);
    }

    #[test]
    fn test_status_ignores_same_state() {
        let status = ConnectionStatus::new();
        let rx = status.watch();
        status.set(ConnectionState::Disconnected);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
