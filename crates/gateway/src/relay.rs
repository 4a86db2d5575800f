// Webhook Relay
//
// Per-session message handler: forwards fresh inbound messages to the
// session's webhook once, and reacts to transport errors with the reconnect
// policy.

use crate::alerts::{Alert, AlertKind, Alerter};
use crate::supervisor::ConnectionSupervisor;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use wagate_channels::{
    Connection, InboundTextMessage, MessageHandler, TransportError, TransportErrorKind,
};
use wagate_memory::{sent_message_key, DedupError, MessageDedupStore};
use wagate_session::{Session, SessionStore};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("webhook delivery failed: {0}")]
    DeliveryFailed(String),
    #[error("dedup store failed: {0}")]
    DedupStoreFailed(#[from] DedupError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination of relayed messages
#[async_trait]
pub trait WebhookSink: Send + Sync {
    async fn deliver(&self, session_id: &str, message: &InboundTextMessage) -> Result<(), RelayError>;
}

/// POSTs messages as JSON to `{base_url}{session_id}`
pub struct HttpWebhook {
    client: reqwest::Client,
    base_url: String,
}

impl HttpWebhook {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn url_for(&self, session_id: &str) -> String {
        format!("{}{}", self.base_url, session_id)
    }
}

#[async_trait]
impl WebhookSink for HttpWebhook {
    async fn deliver(&self, session_id: &str, message: &InboundTextMessage) -> Result<(), RelayError> {
        let body = serde_json::to_vec(message)?;
        let response = self
            .client
            .post(self.url_for(session_id))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| RelayError::DeliveryFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::DeliveryFailed(format!("webhook responded {}", status)));
        }
        Ok(())
    }
}

/// Delays before re-login, per error kind
#[derive(Debug, Clone, Copy)]
pub struct ReconnectDelays {
    pub closed: Duration,
    pub failed: Duration,
}

impl Default for ReconnectDelays {
    fn default() -> Self {
        Self {
            closed: Duration::from_secs(1),
            failed: Duration::from_secs(30),
        }
    }
}

/// Shared collaborators of every relay handler
#[derive(Clone)]
pub struct RelayContext {
    pub supervisor: Arc<ConnectionSupervisor>,
    pub store: Arc<dyn SessionStore>,
    pub dedup: Arc<dyn MessageDedupStore>,
    pub webhook: Arc<dyn WebhookSink>,
    pub alerter: Arc<dyn Alerter>,
    pub dedup_ttl: Duration,
    pub delays: ReconnectDelays,
}

pub struct RelayHandler {
    session: Session,
    // Weak: the connection owns this handler.
    connection: Weak<dyn Connection>,
    start_timestamp: i64,
    ctx: RelayContext,
    // Message ids between the dedup check and the dedup write.
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Claim on one message id; released on drop.
struct InFlight {
    ids: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl InFlight {
    fn claim(ids: &Arc<Mutex<HashSet<String>>>, id: &str) -> Option<Self> {
        let mut guard = ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !guard.insert(id.to_string()) {
            return None;
        }
        Some(Self {
            ids: ids.clone(),
            id: id.to_string(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut guard = self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.remove(&self.id);
    }
}

impl RelayHandler {
    pub fn new(
        session: Session,
        connection: &Arc<dyn Connection>,
        start_timestamp: i64,
        ctx: RelayContext,
    ) -> Self {
        Self {
            session,
            connection: Arc::downgrade(connection),
            start_timestamp,
            ctx,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn session_id(&self) -> &str {
        &self.session.session_id
    }

    async fn should_forward(&self, message: &InboundTextMessage, key: &str) -> bool {
        let seen = match self.ctx.dedup.contains(key).await {
            Ok(seen) => seen,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id(), "{}", RelayError::from(e));
                false
            }
        };
        !seen && message.info.timestamp > self.start_timestamp && !message.info.from_me
    }

    async fn reconnect(&self, delay: Duration, cause: &TransportError) {
        let Some(connection) = self.connection.upgrade() else {
            tracing::debug!(session_id = %self.session_id(), "connection gone, skipping reconnect");
            return;
        };

        match connection.admin_ping().await {
            Ok(true) => {}
            Ok(false) => {
                self.drop_session().await;
                return;
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session_id(), "admin ping failed: {}", e);
                self.drop_session().await;
                return;
            }
        }

        tracing::info!(
            session_id = %self.session_id(),
            delay_ms = delay.as_millis() as u64,
            "reconnecting after: {}",
            cause
        );
        tokio::time::sleep(delay).await;

        match connection
            .restore_with_session(&self.session.transport_state)
            .await
        {
            Ok(()) => tracing::info!(session_id = %self.session_id(), "session restored after reconnect"),
            Err(e) => {
                tracing::warn!(session_id = %self.session_id(), "restore after reconnect failed: {}", e);
                self.ctx
                    .alerter
                    .alert(Alert::new(AlertKind::RestoreFailed, self.session_id()).with_detail(e.to_string()))
                    .await;
            }
        }
    }

    async fn drop_session(&self) {
        let session_id = self.session_id();
        tracing::warn!(session_id = %session_id, "device no longer logged in, dropping session");
        self.ctx.supervisor.remove_connection_for_session(session_id).await;
        if let Err(e) = self.ctx.store.remove_session(session_id).await {
            tracing::warn!(session_id = %session_id, "failed to remove session: {}", e);
        }
        self.ctx
            .alerter
            .alert(Alert::new(AlertKind::DeviceLost, session_id))
            .await;
    }
}

#[async_trait]
impl MessageHandler for RelayHandler {
    async fn handle_text_message(&self, message: InboundTextMessage) {
        let Some(_claim) = InFlight::claim(&self.in_flight, &message.info.id) else {
            tracing::debug!(session_id = %self.session_id(), message_id = %message.info.id, "message already in flight");
            return;
        };
        let key = sent_message_key(&message.info.id);
        if !self.should_forward(&message, &key).await {
            tracing::debug!(session_id = %self.session_id(), message_id = %message.info.id, "message skipped");
            return;
        }

        if let Err(e) = self.ctx.webhook.deliver(self.session_id(), &message).await {
            tracing::warn!(session_id = %self.session_id(), message_id = %message.info.id, "{}", e);
            return;
        }

        let now = chrono::Utc::now().timestamp();
        if let Err(e) = self.ctx.dedup.put(&key, now, self.ctx.dedup_ttl).await {
            tracing::warn!(session_id = %self.session_id(), "{}", RelayError::from(e));
        }
        tracing::debug!(session_id = %self.session_id(), message_id = %message.info.id, "message relayed");
    }

    async fn handle_error(&self, error: TransportError) {
        match error.kind() {
            TransportErrorKind::Closed => self.reconnect(self.ctx.delays.closed, &error).await,
            TransportErrorKind::Failed => self.reconnect(self.ctx.delays.failed, &error).await,
            TransportErrorKind::Other => {
                tracing::warn!(session_id = %self.session_id(), "transport error: {}", error)
            }
        }
    }
}
