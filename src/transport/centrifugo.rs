//! Centrifugo transport.
//!
//! Publishing goes through the server API (`POST /api/publish`). Receiving
//! speaks Centrifugo's JSON client protocol over `/connection/websocket`:
//! a `connect` command, a `subscribe` command, then one `push.pub` frame per
//! publication. Server pings are empty objects and are answered in kind.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::cable::WsStream;
use super::{ConnectionState, ConnectionStatus, Delivery, DeliveryStream, Transport};
use crate::config::Endpoint;
use crate::error::{BenchError, Result};

const PUBLISH_PATH: &str = "/api/publish";
const WEBSOCKET_PATH: &str = "/connection/websocket";

const CONNECT_ID: u32 = 1;
const SUBSCRIBE_ID: u32 = 2;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// A decoded inbound Centrifugo frame
#[derive(Debug, Clone, PartialEq)]
pub enum CentrifugoFrame {
    /// Empty object; must be answered with an empty object
    Ping,
    Reply { id: u32, error: Option<String> },
    Publication { channel: String, data: String },
    Disconnect { code: u32, reason: String },
    /// Join/leave and other pushes we do not care about
    Other,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    id: Option<u32>,
    error: Option<RawError>,
    push: Option<RawPush>,
    #[serde(flatten)]
    rest: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawError {
    code: u32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawPush {
    #[serde(default)]
    channel: String,
    #[serde(rename = "pub")]
    publication: Option<RawPublication>,
    disconnect: Option<RawDisconnect>,
}

#[derive(Debug, Deserialize)]
struct RawPublication {
    data: Value,
}

#[derive(Debug, Deserialize)]
struct RawDisconnect {
    code: u32,
    #[serde(default)]
    reason: String,
}

/// Decode one WebSocket text message. Centrifugo may batch several
/// newline-delimited frames into a single message.
pub fn parse_centrifugo_frames(text: &str) -> Vec<Result<CentrifugoFrame>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_frame)
        .collect()
}

fn parse_frame(line: &str) -> Result<CentrifugoFrame> {
    let raw: RawFrame = serde_json::from_str(line)?;

    if let Some(id) = raw.id {
        return Ok(CentrifugoFrame::Reply {
            id,
            error: raw
                .error
                .map(|e| format!("{} (code {})", e.message, e.code)),
        });
    }

    if let Some(push) = raw.push {
        if let Some(publication) = push.publication {
            let data = match publication.data {
                Value::String(data) => data,
                other => other.to_string(),
            };
            return Ok(CentrifugoFrame::Publication {
                channel: push.channel,
                data,
            });
        }
        if let Some(disconnect) = push.disconnect {
            return Ok(CentrifugoFrame::Disconnect {
                code: disconnect.code,
                reason: disconnect.reason,
            });
        }
        return Ok(CentrifugoFrame::Other);
    }

    if raw.error.is_none() && raw.rest.is_empty() {
        return Ok(CentrifugoFrame::Ping);
    }

    Err(BenchError::Protocol(format!(
        "unrecognised centrifugo frame: {}",
        line
    )))
}

/// Transport for Centrifugo's HTTP API and JSON WebSocket protocol
pub struct CentrifugoTransport {
    client: reqwest::Client,
    publish_url: String,
    ws_url: String,
    api_key: Option<String>,
    token: Option<String>,
    status: ConnectionStatus,
    close_token: CancellationToken,
    closed: bool,
}

impl CentrifugoTransport {
    pub fn new(endpoint: &Endpoint) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PUBLISH_TIMEOUT)
            .build()
            .map_err(|e| BenchError::InvalidArgument(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            publish_url: endpoint.http_url(PUBLISH_PATH),
            ws_url: endpoint.ws_url(WEBSOCKET_PATH),
            api_key: None,
            token: None,
            status: ConnectionStatus::new(),
            close_token: CancellationToken::new(),
            closed: false,
        })
    }

    /// Server API key, sent as `X-Api-Key`
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    /// Client connection token, sent in the `connect` command
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    fn reset_if_closed(&mut self) {
        if self.closed {
            self.close_token = CancellationToken::new();
            self.closed = false;
        }
    }
}

#[async_trait]
impl Transport for CentrifugoTransport {
    fn name(&self) -> &'static str {
        "centrifugo"
    }

    async fn connect(&mut self) -> Result<()> {
        self.reset_if_closed();
        self.status.set(ConnectionState::Connected);
        Ok(())
    }

    async fn publish(&mut self, channel: &str, payload: &str) -> Result<()> {
        // The API takes arbitrary JSON as data; keep the envelope structured
        let data = serde_json::from_str::<Value>(payload)
            .unwrap_or_else(|_| Value::String(payload.to_string()));
        let body = json!({ "channel": channel, "data": data });

        let mut request = self.client.post(&self.publish_url).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.header("X-Api-Key", api_key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                self.status.set(ConnectionState::Disconnected);
                return Err(BenchError::Transport(format!(
                    "publish API {} unreachable: {}",
                    self.publish_url, e
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

        // Centrifugo reports API errors with a 200 and an error object
        let reply: Value = response.json().await.unwrap_or(Value::Null);
        if let Some(error) = reply.get("error") {
            return Err(BenchError::Publish(format!(
                "Error broadcasting to {}: {}",
                channel, error
            )));
        }

        Ok(())
    }

    async fn subscribe(&mut self, channel: &str) -> Result<DeliveryStream> {
        self.reset_if_closed();
        self.status.set(ConnectionState::Connecting);

        let mut ws = match open_subscription(&self.ws_url, channel, self.token.as_deref()).await {
            Ok(ws) => ws,
            Err(e) => {
                self.status.set(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        self.status.set(ConnectionState::Connected);
        tracing::debug!(url = %self.ws_url, channel = %channel, "Centrifugo subscription confirmed");

        let status = self.status.clone();
        let close_token = self.close_token.clone();
        let channel = channel.to_string();

        let stream = async_stream::stream! {
            'read: loop {
                let next = tokio::select! {
                    _ = close_token.cancelled() => {
                        let _ = ws.close(None).await;
                        break 'read;
                    }
                    next = ws.next() => next,
                };

                let text = match next {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(frame = ?frame, "Centrifugo closed the socket");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Centrifugo socket error");
                        break;
                    }
                    None => break,
                };

                for frame in parse_centrifugo_frames(text.as_str()) {
                    match frame {
                        Ok(CentrifugoFrame::Publication { channel: from, data }) if from == channel => {
                            yield Ok(Delivery::now(data));
                        }
                        Ok(CentrifugoFrame::Ping) => {
                            if let Err(e) = ws.send(Message::text("{}")).await {
                                tracing::warn!(error = %e, "Failed to answer centrifugo ping");
                                break 'read;
                            }
                        }
                        Ok(CentrifugoFrame::Disconnect { code, reason }) => {
                            tracing::info!(code, reason = %reason, "Centrifugo requested disconnect");
                            break 'read;
                        }
                        Ok(_) => {}
                        Err(e) => yield Err(e),
                    }
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

async fn open_subscription(url: &str, channel: &str, token: Option<&str>) -> Result<WsStream> {
    let (mut ws, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| BenchError::Transport(format!("timed out connecting to {}", url)))?
        .map_err(|e| BenchError::Transport(format!("failed to connect to {}: {}", url, e)))?;

    tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut ws, channel, token))
        .await
        .map_err(|_| BenchError::Transport("timed out waiting for subscription".to_string()))??;

    Ok(ws)
}

async fn handshake(ws: &mut WsStream, channel: &str, token: Option<&str>) -> Result<()> {
    let connect = match token {
        Some(token) => json!({"id": CONNECT_ID, "connect": {"token": token}}),
        None => json!({"id": CONNECT_ID, "connect": {}}),
    };
    let subscribe = json!({"id": SUBSCRIBE_ID, "subscribe": {"channel": channel}});

    ws.send(Message::text(format!("{}\n{}", connect, subscribe)))
        .await
        .map_err(|e| BenchError::Transport(e.to_string()))?;

    while let Some(next) = ws.next().await {
        let message = next.map_err(|e| BenchError::Transport(e.to_string()))?;
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        for frame in parse_centrifugo_frames(text.as_str()) {
            match frame {
                Ok(CentrifugoFrame::Reply {
                    id,
                    error: Some(error),
                }) => {
                    return Err(BenchError::Transport(format!(
                        "centrifugo refused command {}: {}",
                        id, error
                    )));
                }
                Ok(CentrifugoFrame::Reply {
                    id: SUBSCRIBE_ID,
                    error: None,
                }) => return Ok(()),
                Ok(CentrifugoFrame::Ping) => {
                    ws.send(Message::text("{}"))
                        .await
                        .map_err(|e| BenchError::Transport(e.to_string()))?;
                }
                Ok(CentrifugoFrame::Disconnect { code, reason }) => {
                    return Err(BenchError::Transport(format!(
                        "centrifugo disconnected during handshake: {} ({})",
                        reason, code
                    )));
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "Ignoring malformed frame during handshake"),
            }
        }
    }

    Err(BenchError::Transport(
        "connection closed before subscription was confirmed".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_frame() {
        let frames = parse_centrifugo_frames("{}");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap(), &CentrifugoFrame::Ping);
    }

    #[test]
    fn test_replies() {
        let frames = parse_centrifugo_frames(
            "{\"id\":1,\"connect\":{\"client\":\"c1\",\"version\":\"5.4.0\",\"ping\":25,\"pong\":true}}\n{\"id\":2,\"subscribe\":{}}",
        );
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[0].as_ref().unwrap(),
            &CentrifugoFrame::Reply { id: 1, error: None }
        );
        assert_eq!(
            frames[1].as_ref().unwrap(),
            &CentrifugoFrame::Reply { id: 2, error: None }
        );
    }

    #[test]
    fn test_error_reply() {
        let frames =
            parse_centrifugo_frames(r#"{"id":2,"error":{"code":102,"message":"unknown channel"}}"#);
        assert_eq!(
            frames[0].as_ref().unwrap(),
            &CentrifugoFrame::Reply {
                id: 2,
                error: Some("unknown channel (code 102)".into())
            }
        );
    }

    #[test]
    fn test_publication_push() {
        let frames = parse_centrifugo_frames(
            r#"{"push":{"channel":"all","pub":{"data":{"count":9,"value":"00"},"offset":9}}}"#,
        );
        match frames[0].as_ref().unwrap() {
            CentrifugoFrame::Publication { channel, data } => {
                assert_eq!(channel, "all");
                let value: Value = serde_json::from_str(data).unwrap();
                assert_eq!(value["count"], 9);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_and_other_pushes() {
        let frames = parse_centrifugo_frames(
            "{\"push\":{\"disconnect\":{\"code\":3001,\"reason\":\"shutdown\"}}}\n{\"push\":{\"channel\":\"all\",\"join\":{\"info\":{}}}}",
        );
        assert_eq!(
            frames[0].as_ref().unwrap(),
            &CentrifugoFrame::Disconnect {
                code: 3001,
                reason: "shutdown".into()
            }
        );
        assert_eq!(frames[1].as_ref().unwrap(), &CentrifugoFrame::Other);
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        let frames = parse_centrifugo_frames("nope\n{\"surprise\":true}");
        assert!(matches!(frames[0], Err(BenchError::Protocol(_))));
        assert!(matches!(frames[1], Err(BenchError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_publish_sends_structured_data() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/publish")
            .match_header("x-api-key", "key")
            .match_body(mockito::Matcher::Json(json!({
                "channel": "all",
                "data": {"count": 1}
            })))
            .with_status(200)
            .with_body(r#"{"result":{}}"#)
            .create_async()
            .await;

        let endpoint = Endpoint::from_url(&server.url()).unwrap();
        let mut transport = CentrifugoTransport::new(&endpoint)
            .unwrap()
            .with_api_key(Some("key".into()));
        transport.connect().await.unwrap();
        transport.publish("all", r#"{"count":1}"#).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_api_error_body_is_publish_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/publish")
            .with_status(200)
            .with_body(r#"{"error":{"code":102,"message":"unknown channel"}}"#)
            .create_async()
            .await;

        let endpoint = Endpoint::from_url(&server.url()).unwrap();
        let mut transport = CentrifugoTransport::new(&endpoint).unwrap();
        transport.connect().await.unwrap();

        let err = transport.publish("all", "{}").await.unwrap_err();
        assert!(matches!(err, BenchError::Publish(_)));
    }

    #[tokio::test]
    async fn test_subscription_filters_channel_and_answers_pings() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();

            // connect + subscribe arrive batched in one message
            let batch = ws.next().await.unwrap().unwrap();
            let commands: Vec<Value> = batch
                .to_text()
                .unwrap()
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect();
            assert_eq!(commands.len(), 2);
            assert_eq!(commands[0]["id"], 1);
            assert_eq!(commands[0]["connect"]["token"], "client-token");
            assert_eq!(commands[1]["id"], 2);
            assert_eq!(commands[1]["subscribe"]["channel"], "all");

            ws.send(Message::text(
                "{\"id\":1,\"connect\":{\"client\":\"c1\"}}\n{\"id\":2,\"subscribe\":{}}",
            ))
            .await
            .unwrap();
            ws.send(Message::text("{}")).await.unwrap();
            ws.send(Message::text(
                r#"{"push":{"channel":"other","pub":{"data":{"count":1}}}}"#,
            ))
            .await
            .unwrap();
            ws.send(Message::text(
                r#"{"push":{"channel":"all","pub":{"data":{"count":2}}}}"#,
            ))
            .await
            .unwrap();
            ws.send(Message::text(
                r#"{"push":{"disconnect":{"code":3001,"reason":"shutdown"}}}"#,
            ))
            .await
            .unwrap();

            let pong = ws.next().await.unwrap().unwrap();
            pong.to_text().unwrap().to_string()
        });

        let mut transport = CentrifugoTransport::new(&Endpoint::new("127.0.0.1", port))
            .unwrap()
            .with_token(Some("client-token".into()));
        transport.connect().await.unwrap();
        let deliveries = transport.subscribe("all").await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);

        let deliveries: Vec<_> = tokio::time::timeout(Duration::from_secs(5), deliveries.collect())
            .await
            .expect("stream did not end on disconnect push");
        assert_eq!(deliveries.len(), 1);
        let data: Value = serde_json::from_str(&deliveries[0].as_ref().unwrap().payload).unwrap();
        assert_eq!(data["count"], 2);

        let pong = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pong, "{}");
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }
}
