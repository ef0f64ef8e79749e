//! In-process cable broker for benchmarking without external services.
//!
//! Speaks enough of the AnyCable surface for the harness: `POST /_broadcast`
//! fans a payload out to every `/cable` WebSocket subscribed to the stream.
//! Two listeners share one hub. The degraded listener holds every outbound
//! frame back by a fixed delay, standing in for a latency proxy in front of
//! the real server.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use crate::config::Endpoint;
use crate::error::{BenchError, Result};

/// Fan-out buffer; sockets lagging further than this drop broadcasts
const HUB_CAPACITY: usize = 4096;

/// Mock broker configuration
#[derive(Debug, Clone)]
pub struct MockBrokerConfig {
    /// Port for the standard listener (0 = random)
    pub port: u16,
    /// Port for the degraded listener (0 = random)
    pub degraded_port: u16,
    /// Extra delay applied to every frame on the degraded listener
    pub degraded_delay: Duration,
    pub ping_interval: Duration,
    /// Stream that named channels (`{"channel":"BenchmarkChannel"}`) follow
    pub named_channel_stream: String,
}

impl Default for MockBrokerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            degraded_port: 0,
            degraded_delay: Duration::from_millis(250),
            ping_interval: Duration::from_secs(3),
            named_channel_stream: "all".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Broadcast {
    stream: String,
    data: String,
}

struct BrokerState {
    hub: broadcast::Sender<Broadcast>,
    broadcasts: AtomicU64,
    ping_interval: Duration,
    named_channel_stream: String,
}

#[derive(Clone)]
struct ListenerState {
    broker: Arc<BrokerState>,
    delay: Duration,
}

/// Mock cable broker for benchmarking
pub struct MockBroker {
    config: MockBrokerConfig,
    state: Arc<BrokerState>,
    shutdown_tx: Vec<oneshot::Sender<()>>,
    port: u16,
    degraded_port: u16,
}

impl MockBroker {
    pub fn new(config: MockBrokerConfig) -> Self {
        let (hub, _rx) = broadcast::channel(HUB_CAPACITY);
        let state = Arc::new(BrokerState {
            hub,
            broadcasts: AtomicU64::new(0),
            ping_interval: config.ping_interval,
            named_channel_stream: config.named_channel_stream.clone(),
        });

        Self {
            config,
            state,
            shutdown_tx: Vec::new(),
            port: 0,
            degraded_port: 0,
        }
    }

    /// Start both listeners and return their actual ports
    pub async fn start(&mut self) -> anyhow::Result<(u16, u16)> {
        self.port = self.listen(self.config.port, Duration::ZERO).await?;
        self.degraded_port = self
            .listen(self.config.degraded_port, self.config.degraded_delay)
            .await?;

        tracing::info!(
            port = self.port,
            degraded_port = self.degraded_port,
            degraded_delay_ms = self.config.degraded_delay.as_millis() as u64,
            "Mock broker listening"
        );

        // Give the server a moment to start
        tokio::time::sleep(Duration::from_millis(50)).await;

        Ok((self.port, self.degraded_port))
    }

    async fn listen(&mut self, port: u16, delay: Duration) -> anyhow::Result<u16> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx.push(shutdown_tx);

        let app = Router::new()
            .route("/_broadcast", post(handle_broadcast))
            .route("/cable", get(handle_cable))
            .with_state(ListenerState {
                broker: self.state.clone(),
                delay,
            });

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Ok(port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn degraded_port(&self) -> u16 {
        self.degraded_port
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.port)
    }

    pub fn degraded_endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.degraded_port)
    }

    pub fn url(&self) -> String {
        self.endpoint().http_url("")
    }

    /// Broadcasts accepted so far
    pub fn broadcasts(&self) -> u64 {
        self.state.broadcasts.load(Ordering::Relaxed)
    }

    /// Stop both listeners
    pub fn stop(&mut self) {
        for tx in self.shutdown_tx.drain(..) {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    stream: String,
    data: String,
}

/// Handle `POST /_broadcast`
async fn handle_broadcast(
    State(state): State<ListenerState>,
    body: String,
) -> std::result::Result<StatusCode, BenchError> {
    let request: BroadcastRequest = serde_json::from_str(&body)?;
    if request.stream.is_empty() {
        return Err(BenchError::InvalidArgument("stream must not be empty".to_string()));
    }

    state.broker.broadcasts.fetch_add(1, Ordering::Relaxed);
    let receivers = state
        .broker
        .hub
        .send(Broadcast {
            stream: request.stream,
            data: request.data,
        })
        .unwrap_or(0);
    tracing::trace!(receivers, "Broadcast accepted");

    Ok(StatusCode::CREATED)
}

/// Handle `GET /cable`
async fn handle_cable(ws: WebSocketUpgrade, State(state): State<ListenerState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Debug, Deserialize)]
struct ClientCommand {
    command: String,
    identifier: String,
}

#[derive(Debug, Deserialize)]
struct Identifier {
    channel: String,
    stream_name: Option<String>,
}

/// Resolve the stream a subscribe identifier refers to
fn stream_for(identifier: &str, named_channel_stream: &str) -> Result<String> {
    let parsed: Identifier = serde_json::from_str(identifier)?;
    match (parsed.channel.as_str(), parsed.stream_name) {
        ("$pubsub", Some(stream)) => Ok(stream),
        ("$pubsub", None) => Err(BenchError::Protocol(
            "$pubsub identifier without stream_name".to_string(),
        )),
        _ => Ok(named_channel_stream.to_string()),
    }
}

/// Build the `message` frame for one broadcast
fn message_frame(identifier: &str, data: &str) -> String {
    let message = serde_json::from_str::<Value>(data).unwrap_or_else(|_| Value::String(data.to_string()));
    json!({ "identifier": identifier, "message": message }).to_string()
}

async fn handle_socket(socket: WebSocket, state: ListenerState) {
    let (mut sink, mut incoming) = socket.split();
    let broker = state.broker.clone();
    let mut hub = broker.hub.subscribe();

    // Outbound frames are released `delay` after they were queued, in order
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<(Instant, String)>();
    let delay = state.delay;
    let writer = tokio::spawn(async move {
        while let Some((queued_at, frame)) = out_rx.recv().await {
            tokio::time::sleep_until(queued_at + delay).await;
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });
    let send = |frame: String| out_tx.send((Instant::now(), frame)).is_ok();

    send(json!({"type": "welcome"}).to_string());

    // identifier -> stream
    let mut subscriptions: HashMap<String, String> = HashMap::new();
    let mut ping = tokio::time::interval(broker.ping_interval);
    ping.tick().await;

    loop {
        tokio::select! {
            inbound = incoming.next() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Cable socket error");
                        break;
                    }
                };

                let command: ClientCommand = match serde_json::from_str(text.as_str()) {
                    Ok(command) => command,
                    Err(e) => {
                        tracing::debug!(error = %e, "Ignoring malformed cable command");
                        continue;
                    }
                };

                match command.command.as_str() {
                    "subscribe" => match stream_for(&command.identifier, &broker.named_channel_stream) {
                        Ok(stream) => {
                            tracing::debug!(identifier = %command.identifier, stream = %stream, "Subscription confirmed");
                            send(json!({"identifier": command.identifier, "type": "confirm_subscription"}).to_string());
                            subscriptions.insert(command.identifier, stream);
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "Rejecting subscription");
                            send(json!({"identifier": command.identifier, "type": "reject_subscription"}).to_string());
                        }
                    },
                    "unsubscribe" => {
                        subscriptions.remove(&command.identifier);
                    }
                    other => tracing::debug!(command = %other, "Ignoring cable command"),
                }
            }
            broadcast = hub.recv() => {
                match broadcast {
                    Ok(broadcast) => {
                        for (identifier, stream) in &subscriptions {
                            if *stream == broadcast.stream {
                                send(message_frame(identifier, &broadcast.data));
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Cable socket lagged, broadcasts dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = ping.tick() => {
                send(json!({"type": "ping", "message": chrono::Utc::now().timestamp()}).to_string());
            }
        }
    }

    drop(send);
    drop(out_tx);
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_for_identifiers() {
        let pubsub = json!({"channel": "$pubsub", "stream_name": "all"}).to_string();
        assert_eq!(stream_for(&pubsub, "all").unwrap(), "all");

        let named = json!({"channel": "BenchmarkChannel"}).to_string();
        assert_eq!(stream_for(&named, "benchmark").unwrap(), "benchmark");

        let missing = json!({"channel": "$pubsub"}).to_string();
        assert!(matches!(
            stream_for(&missing, "all"),
            Err(BenchError::Protocol(_))
        ));
        assert!(stream_for("nope", "all").is_err());
    }

    #[test]
    fn test_message_frame_embeds_json_data() {
        let frame: Value = serde_json::from_str(&message_frame("id", r#"{"count":1}"#)).unwrap();
        assert_eq!(frame["identifier"], "id");
        assert_eq!(frame["message"]["count"], 1);

        let frame: Value = serde_json::from_str(&message_frame("id", "plain")).unwrap();
        assert_eq!(frame["message"], "plain");
    }

    #[tokio::test]
    async fn test_broadcast_endpoint() {
        let mut broker = MockBroker::new(MockBrokerConfig::default());
        broker.start().await.unwrap();
        let client = reqwest::Client::new();
        let url = format!("{}/_broadcast", broker.url());

        let response = client
            .post(&url)
            .json(&json!({"stream": "all", "data": "{}"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        assert_eq!(broker.broadcasts(), 1);

        let response = client.post(&url).body("{not json").send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        let response = client
            .post(&url)
            .json(&json!({"stream": "", "data": "{}"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        assert_eq!(broker.broadcasts(), 1);

        broker.stop();
    }
}
