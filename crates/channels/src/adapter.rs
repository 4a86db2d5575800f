// Connection Interface
//
// Defines the capability a device connection exposes to the gateway, the
// callback interface it drives, and the message and error types shared by
// every transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use wagate_session::TransportState;

/// Metadata of an inbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    /// Message id assigned by the remote service
    pub id: String,
    /// Chat the message belongs to
    pub remote_jid: String,
    /// Author of the message (differs from `remote_jid` in groups)
    #[serde(default)]
    pub sender_jid: String,
    /// Sent by this device (or another device of the same account)
    #[serde(default)]
    pub from_me: bool,
    /// Unix seconds
    pub timestamp: i64,
    #[serde(default)]
    pub push_name: String,
}

/// Inbound text message, serialized as-is for the webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundTextMessage {
    pub info: MessageInfo,
    pub text: String,
}

/// Outgoing message to a chat
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutgoingMessage {
    Text {
        chat_id: String,
        text: String,
    },
    Image {
        chat_id: String,
        content_type: String,
        caption: String,
        #[serde(skip)]
        bytes: Vec<u8>,
    },
}

impl OutgoingMessage {
    pub fn chat_id(&self) -> &str {
        match self {
            Self::Text { chat_id, .. } | Self::Image { chat_id, .. } => chat_id,
        }
    }
}

/// Account details of a live connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub wid: String,
    #[serde(default)]
    pub push_name: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub connected: bool,
}

/// Transport error type
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("connection closed ({code}): {text}")]
    ConnectionClosed { code: u16, text: String },

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("not connected")]
    NotConnected,

    /// The remote side refused the stored credentials for good.
    #[error("admin login responded with 401")]
    AdminRejected,

    #[error("operation timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Other(String),
}

/// Coarse classification driving the reconnect policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Closed,
    Failed,
    Other,
}

impl TransportError {
    pub fn kind(&self) -> TransportErrorKind {
        match self {
            Self::ConnectionClosed { .. } => TransportErrorKind::Closed,
            Self::ConnectionFailed(_) => TransportErrorKind::Failed,
            _ => TransportErrorKind::Other,
        }
    }
}

/// Callbacks a connection drives for inbound traffic.
///
/// Invocations are asynchronous and may run concurrently with each other.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_text_message(&self, message: InboundTextMessage);

    async fn handle_error(&self, error: TransportError);
}

/// A live connection to the remote messaging service for one device
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send a message, returning the id the remote service assigned
    async fn send(&self, message: OutgoingMessage) -> Result<String, TransportError>;

    /// Account details of the logged-in device
    async fn info(&self) -> Result<ConnectionInfo, TransportError>;

    /// Health probe; `Ok(false)` means reachable but logged out
    async fn admin_ping(&self) -> Result<bool, TransportError>;

    /// Close the connection and return the refreshed credentials
    async fn disconnect(&self) -> Result<TransportState, TransportError>;

    /// Log in with previously stored credentials
    async fn restore_with_session(&self, state: &TransportState) -> Result<(), TransportError>;

    /// Log in by QR scan. The first QR payload is delivered on `qr`.
    async fn login_with_qr(
        &self,
        qr: oneshot::Sender<String>,
    ) -> Result<TransportState, TransportError>;

    /// Install the inbound handler, replacing any previous one
    async fn register_handler(&self, handler: Arc<dyn MessageHandler>);
}

/// Factory for fresh connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, timeout: Duration) -> Result<Arc<dyn Connection>, TransportError>;
}
