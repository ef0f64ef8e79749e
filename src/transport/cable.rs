//! AnyCable / Action Cable transport.
//!
//! Publishing goes through the HTTP broadcast endpoint (`POST /_broadcast`).
//! Receiving uses the Action Cable WebSocket protocol on `/cable`: wait for
//! `welcome`, send a `subscribe` command, wait for `confirm_subscription`,
//! then forward `message` frames for our identifier. Control frames
//! (`welcome`, `ping`, `confirm_subscription`) never reach the subscriber.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::{ConnectionState, ConnectionStatus, Delivery, DeliveryStream, Transport};
use crate::config::Endpoint;
use crate::error::{BenchError, Result};

const BROADCAST_PATH: &str = "/_broadcast";
const CABLE_PATH: &str = "/cable";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// How the subscription identifier is built
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CableIdentifier {
    /// AnyCable signed-less pub/sub stream: `{"channel":"$pubsub","stream_name":<channel>}`
    PubSub,
    /// A named Action Cable channel class, e.g. `BenchmarkChannel`
    Named(String),
}

impl CableIdentifier {
    pub fn for_channel(&self, channel: &str) -> String {
        match self {
            CableIdentifier::PubSub => {
                json!({"channel": "$pubsub", "stream_name": channel}).to_string()
            }
            CableIdentifier::Named(name) => json!({ "channel": name }).to_string(),
        }
    }
}

/// A decoded inbound cable frame
#[derive(Debug, Clone, PartialEq)]
pub enum CableFrame {
    Welcome,
    Ping,
    Confirm { identifier: String },
    Reject { identifier: String },
    Disconnect { reason: Option<String> },
    Message { identifier: String, payload: String },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    identifier: Option<String>,
    message: Option<Value>,
    reason: Option<String>,
}

/// Decode one server frame
pub fn parse_cable_frame(text: &str) -> Result<CableFrame> {
    let raw: RawFrame = serde_json::from_str(text)?;
    let identifier = raw.identifier.unwrap_or_default();

    match raw.kind.as_deref() {
        Some("welcome") => Ok(CableFrame::Welcome),
        Some("ping") => Ok(CableFrame::Ping),
        Some("confirm_subscription") => Ok(CableFrame::Confirm { identifier }),
        Some("reject_subscription") => Ok(CableFrame::Reject { identifier }),
        Some("disconnect") => Ok(CableFrame::Disconnect { reason: raw.reason }),
        Some(other) => Err(BenchError::Protocol(format!(
            "unexpected cable frame type: {}",
            other
        ))),
        None => match raw.message {
            Some(Value::String(payload)) => Ok(CableFrame::Message {
                identifier,
                payload,
            }),
            Some(message) => Ok(CableFrame::Message {
                identifier,
                payload: message.to_string(),
            }),
            None => Err(BenchError::Protocol(format!(
                "cable frame without type or message: {}",
                text
            ))),
        },
    }
}

/// Build the `POST /_broadcast` body. `data` is the already-serialized payload.
pub fn broadcast_body(stream: &str, data: &str, meta: Option<&Value>) -> Value {
    let mut body = json!({
        "stream": stream,
        "data": data,
    });
    if let Some(meta) = meta {
        body["meta"] = meta.clone();
    }
    body
}

/// Transport for AnyCable's HTTP broadcaster and the Action Cable protocol
pub struct CableTransport {
    client: reqwest::Client,
    broadcast_url: String,
    ws_url: String,
    identifier: CableIdentifier,
    secret: Option<String>,
    status: ConnectionStatus,
    close_token: CancellationToken,
    closed: bool,
}

impl CableTransport {
    /// Both the broadcast endpoint and the WebSocket live on `endpoint`
    pub fn new(endpoint: &Endpoint, identifier: CableIdentifier) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PUBLISH_TIMEOUT)
            .build()
            .map_err(|e| BenchError::InvalidArgument(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            broadcast_url: endpoint.http_url(BROADCAST_PATH),
            ws_url: endpoint.ws_url(CABLE_PATH),
            identifier,
            secret: None,
            status: ConnectionStatus::new(),
            close_token: CancellationToken::new(),
            closed: false,
        })
    }

    /// Send `Authorization: Bearer <secret>` with every broadcast
    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret = secret;
        self
    }

    pub fn broadcast_url(&self) -> &str {
        &self.broadcast_url
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    fn reset_if_closed(&mut self) {
        if self.closed {
            self.close_token = CancellationToken::new();
            self.closed = false;
        }
    }
}

#[async_trait]
impl Transport for CableTransport {
    fn name(&self) -> &'static str {
        "cable"
    }

    async fn connect(&mut self) -> Result<()> {
        // HTTP broadcasting is connectionless; the pooled client is ready as-is
        self.reset_if_closed();
        self.status.set(ConnectionState::Connected);
        Ok(())
    }

    async fn publish(&mut self, channel: &str, payload: &str) -> Result<()> {
        let body = broadcast_body(channel, payload, None);
        let mut request = self.client.post(&self.broadcast_url).json(&body);
        if let Some(secret) = &self.secret {
            request = request.header("Authorization", format!("Bearer {}", secret));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                self.status.set(ConnectionState::Disconnected);
                return Err(BenchError::Transport(format!(
                    "broadcast endpoint {} unreachable: {}",
                    self.broadcast_url, e
                )));
            }
            Err(e) => return Err(BenchError::Publish(e.to_string())),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(BenchError::Publish(format!(
                "Error broadcasting to {}: {}",
                channel, status
            )));
        }

        Ok(())
    }

    async fn subscribe(&mut self, channel: &str) -> Result<DeliveryStream> {
        self.reset_if_closed();
        self.status.set(ConnectionState::Connecting);

        let identifier = self.identifier.for_channel(channel);
        let mut ws = match open_subscription(&self.ws_url, &identifier).await {
            Ok(ws) => ws,
            Err(e) => {
                self.status.set(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        self.status.set(ConnectionState::Connected);
        tracing::debug!(url = %self.ws_url, identifier = %identifier, "Cable subscription confirmed");

        let status = self.status.clone();
        let close_token = self.close_token.clone();

        let stream = async_stream::stream! {
            loop {
                let next = tokio::select! {
                    _ = close_token.cancelled() => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    next = ws.next() => next,
                };

                let text = match next {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(frame = ?frame, "Cable server closed the socket");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Cable socket error");
                        break;
                    }
                    None => break,
                };

                match parse_cable_frame(text.as_str()) {
                    Ok(CableFrame::Message { identifier: from, payload }) if from == identifier => {
                        yield Ok(Delivery::now(payload));
                    }
                    Ok(CableFrame::Disconnect { reason }) => {
                        tracing::info!(reason = ?reason, "Cable server requested disconnect");
                        break;
                    }
                    Ok(CableFrame::Reject { .. }) => {
                        tracing::warn!(identifier = %identifier, "Cable subscription rejected");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => yield Err(e),
                }
            }
            status.set(ConnectionState::Disconnected);
        };

        Ok(Box::pin(stream))
    }

    async fn close(&mut self) -> Result<()> {
        self.close_token.cancel();
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

/// Connect, wait for `welcome`, subscribe, wait for confirmation
async fn open_subscription(url: &str, identifier: &str) -> Result<WsStream> {
    let (mut ws, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| BenchError::Transport(format!("timed out connecting to {}", url)))?
        .map_err(|e| BenchError::Transport(format!("failed to connect to {}: {}", url, e)))?;

    tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut ws, identifier))
        .await
        .map_err(|_| BenchError::Transport("timed out waiting for subscription".to_string()))??;

    Ok(ws)
}

async fn handshake(ws: &mut WsStream, identifier: &str) -> Result<()> {
    let mut subscribed = false;

    while let Some(next) = ws.next().await {
        let message = next.map_err(|e| BenchError::Transport(e.to_string()))?;
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        match parse_cable_frame(text.as_str()) {
            Ok(CableFrame::Welcome) if !subscribed => {
                let command = json!({
                    "command": "subscribe",
                    "identifier": identifier,
                });
                ws.send(Message::text(command.to_string()))
                    .await
                    .map_err(|e| BenchError::Transport(e.to_string()))?;
                subscribed = true;
                tracing::debug!(identifier = %identifier, "Subscribing");
            }
            Ok(CableFrame::Confirm { identifier: confirmed }) if confirmed == identifier => {
                return Ok(());
            }
            Ok(CableFrame::Reject { .. }) => {
                return Err(BenchError::Transport(format!(
                    "subscription rejected for {}",
                    identifier
                )));
            }
            Ok(CableFrame::Disconnect { reason }) => {
                return Err(BenchError::Transport(format!(
                    "server disconnected during handshake: {}",
                    reason.unwrap_or_default()
                )));
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "Ignoring malformed frame during handshake"),
        }
    }

    Err(BenchError::Transport(
        "connection closed before subscription was confirmed".to_string(),
    ))
}
