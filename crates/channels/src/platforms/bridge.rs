// Bridge Platform Adapter
//
// Talks JSON text frames over a WebSocket to an external protocol bridge that
// owns the remote service's wire protocol. One WebSocket carries one device.

use crate::adapter::{
    Connection, ConnectionInfo, Connector, InboundTextMessage, MessageHandler, OutgoingMessage,
    TransportError,
};
use async_trait::async_trait;
use base64::Engine;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use wagate_session::TransportState;

/// Close code reported when the socket drops without a close frame
const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Request frame sent to the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub id: u64,
    pub op: String,
    #[serde(default)]
    pub params: JsonValue,
}

/// Response frame for a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub id: u64,
    pub ok: bool,
    #[serde(default)]
    pub result: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BridgeErrorBody>,
}

/// Error details carried by responses and error events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeErrorBody {
    pub kind: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl From<BridgeErrorBody> for TransportError {
    fn from(body: BridgeErrorBody) -> Self {
        match body.kind.as_str() {
            "closed" => TransportError::ConnectionClosed {
                code: body.code.unwrap_or(ABNORMAL_CLOSE_CODE),
                text: body.message,
            },
            "failed" => TransportError::ConnectionFailed(body.message),
            "not_connected" => TransportError::NotConnected,
            "admin_rejected" => TransportError::AdminRejected,
            "timeout" => TransportError::Timeout,
            _ => TransportError::Other(body.message),
        }
    }
}

/// Unsolicited frames pushed by the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum BridgeEvent {
    Qr { data: String },
    Message { message: InboundTextMessage },
    Error { error: BridgeErrorBody },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum InboundFrame {
    Event(BridgeEvent),
    Response(BridgeResponse),
}

/// Connector opening one WebSocket per connection
pub struct BridgeConnector {
    url: String,
}

impl BridgeConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for BridgeConnector {
    async fn connect(&self, timeout: Duration) -> Result<Arc<dyn Connection>, TransportError> {
        let (ws_stream, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(self.url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        tracing::debug!(url = %self.url, "bridge connection established");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split::<Message>();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let shared = Arc::new(Shared {
            writer: out_tx,
            pending: Mutex::new(HashMap::new()),
            handler: RwLock::new(None),
            qr_tx: Mutex::new(None),
            disconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = msg.is_close();
                if let Err(e) = ws_sender.send(msg).await {
                    tracing::debug!("bridge write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader_shared = shared.clone();
        tokio::spawn(async move {
            let mut close = None;
            while let Some(item) = ws_receiver.next().await {
                match item {
                    Ok(Message::Text(text)) => reader_shared.dispatch_frame(text.as_str()).await,
                    Ok(Message::Close(frame)) => {
                        close = frame.map(|f| (u16::from(f.code), f.reason.as_str().to_string()));
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        close = Some((ABNORMAL_CLOSE_CODE, e.to_string()));
                        break;
                    }
                }
            }
            reader_shared.on_closed(close).await;
        });

        Ok(Arc::new(BridgeConnection {
            shared,
            next_id: AtomicU64::new(1),
            request_timeout: timeout,
        }))
    }
}

struct Shared {
    writer: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<u64, oneshot::Sender<BridgeResponse>>>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    qr_tx: Mutex<Option<oneshot::Sender<String>>>,
    disconnecting: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    async fn dispatch_frame(&self, text: &str) {
        let frame = match serde_json::from_str::<InboundFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("unparseable bridge frame: {}", e);
                return;
            }
        };

        match frame {
            InboundFrame::Response(response) => {
                if let Some(tx) = self.pending.lock().await.remove(&response.id) {
                    let _ = tx.send(response);
                }
            }
            InboundFrame::Event(BridgeEvent::Qr { data }) => {
                // Only the first code of a login is forwarded.
                if let Some(tx) = self.qr_tx.lock().await.take() {
                    let _ = tx.send(data);
                }
            }
            InboundFrame::Event(BridgeEvent::Message { message }) => {
                if let Some(handler) = self.handler.read().await.clone() {
                    tokio::spawn(async move { handler.handle_text_message(message).await });
                }
            }
            InboundFrame::Event(BridgeEvent::Error { error }) => {
                self.dispatch_error(error.into()).await;
            }
        }
    }

    async fn dispatch_error(&self, error: TransportError) {
        match self.handler.read().await.clone() {
            Some(handler) => {
                tokio::spawn(async move { handler.handle_error(error).await });
            }
            None => tracing::warn!("bridge error with no handler attached: {}", error),
        }
    }

    async fn on_closed(&self, close: Option<(u16, String)>) {
        // Dropping the senders fails every in-flight request.
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().await.clear();
        self.qr_tx.lock().await.take();

        if self.disconnecting.load(Ordering::SeqCst) {
            tracing::debug!("bridge connection closed after disconnect");
            return;
        }
        let (code, text) = close.unwrap_or((ABNORMAL_CLOSE_CODE, "connection reset".to_string()));
        tracing::warn!(code, "bridge connection closed: {}", text);
        self.dispatch_error(TransportError::ConnectionClosed { code, text })
            .await;
    }
}

/// One device connection through the bridge
///
/// The socket is not redialled. Once it drops, every request, `admin_ping`
/// included, fails with `NotConnected`, so a reconnect attempt after
/// `ConnectionClosed` treats the device as lost. Recovering from a dropped
/// bridge socket means registering the session again.
pub struct BridgeConnection {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl BridgeConnection {
    async fn request(
        &self,
        op: &str,
        params: JsonValue,
        timeout: Option<Duration>,
    ) -> Result<JsonValue, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);
        if self.shared.closed.load(Ordering::SeqCst) {
            self.shared.pending.lock().await.remove(&id);
            return Err(TransportError::NotConnected);
        }

        let frame = serde_json::to_string(&BridgeRequest {
            id,
            op: op.to_string(),
            params,
        })
        .map_err(|e| TransportError::Protocol(e.to_string()))?;

        if self.shared.writer.send(Message::Text(frame.into())).is_err() {
            self.shared.pending.lock().await.remove(&id);
            return Err(TransportError::NotConnected);
        }

        let response = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(result) => result,
                Err(_) => {
                    self.shared.pending.lock().await.remove(&id);
                    return Err(TransportError::Timeout);
                }
            },
            None => rx.await,
        }
        .map_err(|_| TransportError::NotConnected)?;

        if response.ok {
            Ok(response.result)
        } else {
            Err(response
                .error
                .map(TransportError::from)
                .unwrap_or_else(|| TransportError::Protocol(format!("{} failed", op))))
        }
    }

    fn state_from(result: JsonValue) -> TransportState {
        match result {
            JsonValue::Object(mut map) => {
                TransportState::new(map.remove("state").unwrap_or(JsonValue::Null))
            }
            _ => TransportState::default(),
        }
    }
}

#[async_trait]
impl Connection for BridgeConnection {
    async fn send(&self, message: OutgoingMessage) -> Result<String, TransportError> {
        let params = match &message {
            OutgoingMessage::Text { chat_id, text } => json!({
                "type": "text",
                "chat_id": chat_id,
                "text": text,
            }),
            OutgoingMessage::Image {
                chat_id,
                content_type,
                caption,
                bytes,
            } => json!({
                "type": "image",
                "chat_id": chat_id,
                "content_type": content_type,
                "caption": caption,
                "data": base64::engine::general_purpose::STANDARD.encode(bytes),
            }),
        };
        let result = self.request("send", params, Some(self.request_timeout)).await?;
        Ok(result
            .get("id")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string())
    }

    async fn info(&self) -> Result<ConnectionInfo, TransportError> {
        let result = self.request("info", json!({}), Some(self.request_timeout)).await?;
        serde_json::from_value(result).map_err(|e| TransportError::Protocol(e.to_string()))
    }

    async fn admin_ping(&self) -> Result<bool, TransportError> {
        let result = self.request("ping", json!({}), Some(self.request_timeout)).await?;
        result
            .as_bool()
            .ok_or_else(|| TransportError::Protocol("ping result is not a bool".to_string()))
    }

    async fn disconnect(&self) -> Result<TransportState, TransportError> {
        self.shared.disconnecting.store(true, Ordering::SeqCst);
        let result = self
            .request("disconnect", json!({}), Some(self.request_timeout))
            .await;
        let _ = self.shared.writer.send(Message::Close(None));
        result.map(Self::state_from)
    }

    async fn restore_with_session(&self, state: &TransportState) -> Result<(), TransportError> {
        self.request("restore", json!({ "state": state }), Some(self.request_timeout))
            .await
            .map(|_| ())
    }

    async fn login_with_qr(
        &self,
        qr: oneshot::Sender<String>,
    ) -> Result<TransportState, TransportError> {
        *self.shared.qr_tx.lock().await = Some(qr);
        // Waits for the scan; the bridge enforces its own QR expiry.
        let result = self.request("login", json!({}), None).await;
        self.shared.qr_tx.lock().await.take();
        result.map(Self::state_from)
    }

    async fn register_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.shared.handler.write().await = Some(handler);
    }
}
