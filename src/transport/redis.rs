//! Redis pub/sub transport.
//!
//! Publishes with `PUBLISH` over a multiplexed connection and receives through
//! a dedicated pub/sub connection. This is the path the Action Cable Redis
//! adapter reads from, so a Redis broadcaster can feed cable subscribers too.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;

use super::{ConnectionState, ConnectionStatus, Delivery, DeliveryStream, Transport};
use crate::config::Endpoint;
use crate::error::{BenchError, Result};

/// Transport over a Redis server
pub struct RedisTransport {
    client: redis::Client,
    url: String,
    publisher: Option<MultiplexedConnection>,
    status: ConnectionStatus,
    close_token: CancellationToken,
    closed: bool,
}

impl RedisTransport {
    /// Parse the endpoint into a `redis://` URL. Fails fast on bad input.
    pub fn new(endpoint: &Endpoint) -> Result<Self> {
        let url = endpoint.redis_url();
        let client = redis::Client::open(url.as_str()).map_err(|e| {
            BenchError::InvalidArgument(format!("invalid Redis URL {}: {}", url, e))
        })?;

        Ok(Self {
            client,
            url,
            publisher: None,
            status: ConnectionStatus::new(),
            close_token: CancellationToken::new(),
            closed: false,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn reset_if_closed(&mut self) {
        if self.closed {
            self.close_token = CancellationToken::new();
            self.closed = false;
        }
    }
}

/// Whether a Redis error means the connection itself is gone
fn is_connection_error(err: &redis::RedisError) -> bool {
    err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
}

#[async_trait]
impl Transport for RedisTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&mut self) -> Result<()> {
        self.reset_if_closed();
        self.status.set(ConnectionState::Connecting);

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(connection) => {
                self.publisher = Some(connection);
                self.status.set(ConnectionState::Connected);
                tracing::debug!(url = %self.url, "Connected to Redis");
                Ok(())
            }
            Err(e) => {
                self.publisher = None;
                self.status.set(ConnectionState::Disconnected);
                Err(BenchError::Transport(format!(
                    "failed to connect to Redis at {}: {}",
                    self.url, e
                )))
            }
        }
    }

    async fn publish(&mut self, channel: &str, payload: &str) -> Result<()> {
        let Some(connection) = self.publisher.as_mut() else {
            return Err(BenchError::Transport("not connected to Redis".to_string()));
        };

        let result: redis::RedisResult<i64> = connection.publish(channel, payload).await;
        match result {
            Ok(receivers) => {
                tracing::trace!(channel = %channel, receivers, "Published to Redis");
                Ok(())
            }
            Err(e) if is_connection_error(&e) => {
                self.publisher = None;
                self.status.set(ConnectionState::Disconnected);
                Err(BenchError::Transport(format!("Redis connection lost: {}", e)))
            }
            Err(e) => Err(BenchError::Publish(e.to_string())),
        }
    }

    async fn subscribe(&mut self, channel: &str) -> Result<DeliveryStream> {
        self.reset_if_closed();
        self.status.set(ConnectionState::Connecting);

        let mut pubsub = match self.client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                self.status.set(ConnectionState::Disconnected);
                return Err(BenchError::Transport(format!(
                    "failed to open Redis pub/sub connection: {}",
                    e
                )));
            }
        };

        if let Err(e) = pubsub.subscribe(channel).await {
            self.status.set(ConnectionState::Disconnected);
            return Err(BenchError::Transport(format!(
                "failed to subscribe to {}: {}",
                channel, e
            )));
        }

        self.status.set(ConnectionState::Connected);
        tracing::debug!(url = %self.url, channel = %channel, "Redis subscription confirmed");

        let status = self.status.clone();
        let close_token = self.close_token.clone();

        let stream = async_stream::stream! {
            let mut messages = pubsub.into_on_message();
            loop {
                let message = tokio::select! {
                    _ = close_token.cancelled() => break,
                    message = messages.next() => message,
                };

                let Some(message) = message else {
                    break;
                };

                match message.get_payload::<String>() {
                    Ok(payload) => yield Ok(Delivery::now(payload)),
                    Err(e) => yield Err(BenchError::Protocol(format!(
                        "unreadable Redis payload: {}",
                        e
                    ))),
                }
            }
            status.set(ConnectionState::Disconnected);
        };

        Ok(Box::pin(stream))
    }

    async fn close(&mut self) -> Result<()> {
        self.close_token.cancel();
        self.publisher = None;
        self.status.set(ConnectionState::Disconnected);
        self.closed = true;
        Ok(())
    }

    fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_url_from_endpoint() {
        let transport = RedisTransport::new(&Endpoint::new("127.0.0.1", 6380)).unwrap();
        assert_eq!(transport.url(), "redis://127.0.0.1:6380/");
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_publish_before_connect_is_transport_error() {
        let mut transport = RedisTransport::new(&Endpoint::new("127.0.0.1", 6379)).unwrap();
        let err = transport.publish("all", "{}").await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = RedisTransport::new(&Endpoint::new("127.0.0.1", port)).unwrap();
        let err = transport.connect().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut transport = RedisTransport::new(&Endpoint::new("127.0.0.1", 6379)).unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.is_closed());
    }
}
