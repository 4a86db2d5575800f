// In-memory test doubles for `Connection` and `Connector`.

use crate::adapter::{
    Connection, ConnectionInfo, Connector, InboundTextMessage, MessageHandler, OutgoingMessage,
    TransportError,
};
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use wagate_session::TransportState;

/// QR payload delivered by [`MockConnection::login_with_qr`]
pub const MOCK_QR_PAYLOAD: &str = "mock-qr-payload";

/// Scriptable connection that records every call
pub struct MockConnection {
    healthy: AtomicBool,
    ping_error: Mutex<Option<TransportError>>,
    restore_error: Mutex<Option<TransportError>>,
    login_error: Mutex<Option<TransportError>>,
    disconnect_error: Mutex<Option<TransportError>>,
    login_state: Mutex<TransportState>,
    login_gate: Mutex<Option<oneshot::Receiver<()>>>,
    handler: Mutex<Option<Arc<dyn MessageHandler>>>,
    sent: Mutex<Vec<OutgoingMessage>>,
    restored: Mutex<Vec<TransportState>>,
    pings: AtomicUsize,
    disconnects: AtomicUsize,
}

impl Default for MockConnection {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            ping_error: Mutex::new(None),
            restore_error: Mutex::new(None),
            login_error: Mutex::new(None),
            disconnect_error: Mutex::new(None),
            login_state: Mutex::new(TransportState::new(json!({"device": "mock"}))),
            login_gate: Mutex::new(None),
            handler: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            restored: Mutex::new(Vec::new()),
            pings: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_ping_error(&self, error: Option<TransportError>) {
        *lock(&self.ping_error) = error;
    }

    pub fn set_restore_error(&self, error: Option<TransportError>) {
        *lock(&self.restore_error) = error;
    }

    pub fn set_login_error(&self, error: Option<TransportError>) {
        *lock(&self.login_error) = error;
    }

    pub fn set_disconnect_error(&self, error: Option<TransportError>) {
        *lock(&self.disconnect_error) = error;
    }

    pub fn set_login_state(&self, state: TransportState) {
        *lock(&self.login_state) = state;
    }

    /// Keep the next QR login pending, after its QR is emitted, until the
    /// returned sender fires or is dropped.
    pub fn hold_login(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.login_gate) = Some(rx);
        tx
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        lock(&self.sent).clone()
    }

    pub fn restored(&self) -> Vec<TransportState> {
        lock(&self.restored).clone()
    }

    pub fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        lock(&self.handler).clone()
    }

    /// Deliver an inbound message to the registered handler, if any.
    pub async fn deliver_text(&self, message: InboundTextMessage) -> bool {
        match self.handler() {
            Some(handler) => {
                handler.handle_text_message(message).await;
                true
            }
            None => false,
        }
    }

    /// Deliver a transport error to the registered handler, if any.
    pub async fn deliver_error(&self, error: TransportError) -> bool {
        match self.handler() {
            Some(handler) => {
                handler.handle_error(error).await;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&self, message: OutgoingMessage) -> Result<String, TransportError> {
        let mut sent = lock(&self.sent);
        sent.push(message);
        Ok(format!("mock-{}", sent.len()))
    }

    async fn info(&self) -> Result<ConnectionInfo, TransportError> {
        Ok(ConnectionInfo {
            wid: "5500000000000@s.whatsapp.net".to_string(),
            push_name: "mock".to_string(),
            platform: "mock".to_string(),
            connected: self.healthy.load(Ordering::SeqCst),
        })
    }

    async fn admin_ping(&self) -> Result<bool, TransportError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.ping_error).clone() {
            return Err(error);
        }
        Ok(self.healthy.load(Ordering::SeqCst))
    }

    async fn disconnect(&self) -> Result<TransportState, TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.disconnect_error).clone() {
            return Err(error);
        }
        Ok(TransportState::new(json!({"device": "mock", "refreshed": true})))
    }

    async fn restore_with_session(&self, state: &TransportState) -> Result<(), TransportError> {
        lock(&self.restored).push(state.clone());
        match lock(&self.restore_error).clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn login_with_qr(
        &self,
        qr: oneshot::Sender<String>,
    ) -> Result<TransportState, TransportError> {
        let _ = qr.send(MOCK_QR_PAYLOAD.to_string());
        // Let the QR consumer run before the login resolves.
        tokio::task::yield_now().await;
        let gate = lock(&self.login_gate).take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if let Some(error) = lock(&self.login_error).clone() {
            return Err(error);
        }
        Ok(lock(&self.login_state).clone())
    }

    async fn register_handler(&self, handler: Arc<dyn MessageHandler>) {
        *lock(&self.handler) = Some(handler);
    }
}

/// Connector handing out queued connections, then fresh healthy ones
#[derive(Default)]
pub struct MockConnector {
    queued: Mutex<VecDeque<Arc<MockConnection>>>,
    created: Mutex<Vec<Arc<MockConnection>>>,
    fail_next: Mutex<Option<TransportError>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `connect` returns this connection.
    pub fn push(&self, connection: Arc<MockConnection>) {
        lock(&self.queued).push_back(connection);
    }

    pub fn fail_next(&self, error: TransportError) {
        *lock(&self.fail_next) = Some(error);
    }

    /// Every connection handed out so far, in order
    pub fn created(&self) -> Vec<Arc<MockConnection>> {
        lock(&self.created).clone()
    }

    pub fn last(&self) -> Option<Arc<MockConnection>> {
        lock(&self.created).last().cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _timeout: Duration) -> Result<Arc<dyn Connection>, TransportError> {
        if let Some(error) = lock(&self.fail_next).take() {
            return Err(error);
        }
        let connection = lock(&self.queued)
            .pop_front()
            .unwrap_or_else(MockConnection::new);
        lock(&self.created).push(connection.clone());
        Ok(connection)
    }
}
