//! WebSocket change channel with reconnect backoff.
//!
//! After connecting, the channel sends `{"type":"subscribe","scope":...}`
//! and then expects change frames of the form
//! `{type, scope, record, old_record, event_id}` where `type` is one of
//! `INSERT`, `UPDATE`, `DELETE`. Other frames (acks, heartbeats) are ignored.
//! Dropped connections are re-established with jittered exponential backoff
//! until the subscription is closed.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};
use syncline_core::{
    ChangeEvent, ChangeKind, ChannelError, EntityId, OwnerScope, RawChangeEvent, SyncResult,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::{ReconnectConfig, SyncConfig};
use crate::remote::{RemoteChannel, Subscription};
use crate::rest::{build_auth_headers, RestClientError};

const EVENT_BUFFER: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone)]
pub struct WsChangeChannel {
    endpoint: String,
    auth_header: HeaderMap,
    reconnect: ReconnectConfig,
}

impl WsChangeChannel {
    pub fn new(config: &SyncConfig) -> Result<Self, RestClientError> {
        Ok(Self {
            endpoint: config.ws_endpoint.clone(),
            auth_header: build_auth_headers(&config.auth)?,
            reconnect: config.reconnect.clone(),
        })
    }

    pub fn reconnect_config(&self) -> &ReconnectConfig {
        &self.reconnect
    }

    async fn connect(&self, scope: OwnerScope) -> Result<WsStream, ChannelError> {
        let connect_failed = |reason: String| ChannelError::ConnectFailed {
            scope: scope.to_string(),
            reason,
        };
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| connect_failed(e.to_string()))?;
        let headers = request.headers_mut();
        for (name, value) in self.auth_header.iter() {
            headers.insert(name, value.clone());
        }
        let (mut stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| connect_failed(e.to_string()))?;

        let subscribe = json!({ "type": "subscribe", "scope": scope }).to_string();
        stream
            .send(Message::Text(subscribe))
            .await
            .map_err(|e| connect_failed(e.to_string()))?;
        Ok(stream)
    }
}

#[async_trait]
impl RemoteChannel for WsChangeChannel {
    async fn open_channel(&self, scope: OwnerScope) -> SyncResult<Subscription> {
        let stream = self.connect(scope).await?;
        info!(scope = %scope, endpoint = %self.endpoint, "websocket connected");

        let (events, receiver) = mpsc::channel(EVENT_BUFFER);
        let (close, closed) = oneshot::channel();
        let channel = self.clone();
        tokio::spawn(async move {
            channel.run(scope, stream, events, closed).await;
        });
        Ok(Subscription::new(scope, receiver, Some(close)))
    }
}

impl WsChangeChannel {
    async fn run(
        &self,
        scope: OwnerScope,
        stream: WsStream,
        events: mpsc::Sender<SyncResult<RawChangeEvent>>,
        mut closed: oneshot::Receiver<()>,
    ) {
        let mut stream = Some(stream);
        let mut attempt = 0u32;
        loop {
            if let Some(mut ws) = stream.take() {
                attempt = 0;
                let keep_going = tokio::select! {
                    _ = &mut closed => false,
                    open = pump(scope, &mut ws, &events) => open,
                };
                let _ = ws.close(None).await;
                if !keep_going {
                    debug!(scope = %scope, "websocket subscription closed");
                    return;
                }
                warn!(scope = %scope, "websocket dropped, reconnecting");
            }

            let delay = self.reconnect.delay(attempt, clock_entropy());
            tokio::select! {
                _ = &mut closed => return,
                _ = tokio::time::sleep(delay) => {}
            }
            attempt = attempt.saturating_add(1);

            match self.connect(scope).await {
                Ok(ws) => {
                    info!(scope = %scope, "websocket reconnected");
                    stream = Some(ws);
                }
                Err(e) => {
                    warn!(
                        scope = %scope,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "websocket reconnect failed"
                    );
                }
            }
        }
    }
}

/// Forward frames until the socket ends. Returns false once the subscriber
/// has gone away.
async fn pump(
    scope: OwnerScope,
    ws: &mut WsStream,
    events: &mpsc::Sender<SyncResult<RawChangeEvent>>,
) -> bool {
    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Some(event) = decode_frame(scope, &text) {
                    if events.send(event).await.is_err() {
                        return false;
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(scope = %scope, error = %e, "websocket error");
                break;
            }
        }
    }
    !events.is_closed()
}

#[derive(Debug, Deserialize)]
struct ChangeFrame {
    #[serde(rename = "type")]
    kind: ChangeKind,
    scope: Option<OwnerScope>,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
    #[serde(default)]
    event_id: Option<String>,
}

/// Decode one text frame received on `scope`'s channel.
///
/// Returns `None` for frames that are not change events.
pub fn decode_frame(scope: OwnerScope, text: &str) -> Option<SyncResult<RawChangeEvent>> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return Some(Err(decode_error(e.to_string()))),
    };
    let is_change = matches!(
        value.get("type").and_then(Value::as_str),
        Some("INSERT" | "UPDATE" | "DELETE")
    );
    if !is_change {
        return None;
    }
    Some(change_event(scope, value))
}

fn change_event(scope: OwnerScope, value: Value) -> SyncResult<RawChangeEvent> {
    let frame: ChangeFrame =
        serde_json::from_value(value).map_err(|e| decode_error(e.to_string()))?;
    let owner_scope = frame.scope.unwrap_or(scope);
    let event = match frame.kind {
        ChangeKind::Insert | ChangeKind::Update => {
            let record = frame
                .record
                .ok_or_else(|| decode_error(format!("{} frame without record", frame.kind.as_str())))?;
            if frame.kind == ChangeKind::Insert {
                ChangeEvent::insert(owner_scope, record)
            } else {
                ChangeEvent::update(owner_scope, record)
            }
        }
        ChangeKind::Delete => {
            let id = frame
                .old_record
                .as_ref()
                .and_then(EntityId::of_row)
                .ok_or_else(|| decode_error("DELETE frame without old_record.id".into()))?;
            ChangeEvent::delete(owner_scope, id)
        }
    };
    Ok(match frame.event_id {
        Some(event_id) => event.with_event_id(event_id),
        None => event,
    })
}

fn decode_error(reason: String) -> syncline_core::SyncError {
    ChannelError::Decode { reason }.into()
}

/// Sub-second clock reading used to spread reconnects of many clients.
fn clock_entropy() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()))
        .unwrap_or(0)
}
