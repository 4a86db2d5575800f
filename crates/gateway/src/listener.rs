// Message Listener
//
// One task per listening session: log in, attach the relay handler, then wait
// for process shutdown (disconnect and persist) or for the supervisor to tear
// the session down.

use crate::auth::Authenticator;
use crate::relay::{RelayContext, RelayHandler};
use crate::supervisor::ConnectionSupervisor;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use wagate_session::SessionStore;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ListenerError {
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
    #[error("session {0} is already listening")]
    AlreadyListening(String),
    #[error("listener for session {session_id} aborted: {reason}")]
    Aborted { session_id: String, reason: String },
    #[error("failed to disconnect session {session_id}: {reason}")]
    DisconnectFailed { session_id: String, reason: String },
    #[error("failed to write session {session_id}: {reason}")]
    SessionWriteFailed { session_id: String, reason: String },
}

impl ListenerError {
    pub(crate) fn aborted(session_id: &str, reason: impl ToString) -> Self {
        Self::Aborted {
            session_id: session_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type ReadySignal = oneshot::Sender<Result<(), ListenerError>>;

pub struct MessageListener {
    authenticator: Arc<Authenticator>,
    supervisor: Arc<ConnectionSupervisor>,
    store: Arc<dyn SessionStore>,
    relay: RelayContext,
    shutdown: CancellationToken,
}

fn signal(ready: ReadySignal, result: Result<(), ListenerError>) {
    // The registering side may have given up waiting.
    let _ = ready.send(result);
}

impl MessageListener {
    pub fn new(
        authenticator: Arc<Authenticator>,
        supervisor: Arc<ConnectionSupervisor>,
        store: Arc<dyn SessionStore>,
        relay: RelayContext,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            authenticator,
            supervisor,
            store,
            relay,
            shutdown,
        }
    }

    /// Listen on `session_id` until shutdown.
    ///
    /// `ready` is signalled exactly once: `Ok` as soon as the handler is
    /// attached, or the error that stopped the listener before that.
    /// Returns `Ok(true)` after a graceful shutdown and `Ok(false)` when the
    /// supervisor removed the session first.
    pub async fn listen_for_session(
        &self,
        session_id: &str,
        ready: ReadySignal,
    ) -> Result<bool, ListenerError> {
        // An entry that no longer answers a ping is replaced by the login.
        if self
            .supervisor
            .authenticated_connection_for_session(session_id)
            .await
            .is_ok()
        {
            let err = ListenerError::AlreadyListening(session_id.to_string());
            signal(ready, Err(err.clone()));
            return Err(err);
        }

        tracing::debug!(session_id = %session_id, "attaching listener");
        let (connection, mut session) = match self.authenticator.login(session_id).await {
            Ok(pair) => pair,
            Err(e) => {
                let err = ListenerError::aborted(session_id, e);
                signal(ready, Err(err.clone()));
                return Err(err);
            }
        };

        let Some(entry) = self.supervisor.entry(session_id).await else {
            let err = ListenerError::aborted(session_id, "session left supervision during login");
            signal(ready, Err(err.clone()));
            return Err(err);
        };

        let start_timestamp = chrono::Utc::now().timestamp();
        let handler = RelayHandler::new(session.clone(), &connection, start_timestamp, self.relay.clone());
        connection.register_handler(Arc::new(handler)).await;
        signal(ready, Ok(()));
        tracing::info!(session_id = %session_id, "listening");

        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = entry.cancel.cancelled() => {
                tracing::info!(session_id = %session_id, "session removed from supervision, listener stopped");
                return Ok(false);
            }
        }

        tracing::info!(session_id = %session_id, "shutting down listener");
        let result = match connection.disconnect().await {
            Ok(state) => {
                session.refresh_state(state);
                self.store
                    .write_session(&session)
                    .await
                    .map_err(|e| ListenerError::SessionWriteFailed {
                        session_id: session_id.to_string(),
                        reason: e.to_string(),
                    })
            }
            Err(e) => Err(ListenerError::DisconnectFailed {
                session_id: session_id.to_string(),
                reason: e.to_string(),
            }),
        };
        self.supervisor.detach(session_id, entry.generation).await;

        match result {
            Ok(()) => {
                tracing::info!(session_id = %session_id, "session persisted");
                Ok(true)
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, "{}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::alerts::RecordingAlerter;
    use crate::qr::QrFileResolver;
    use crate::relay::tests::{message, RecordingWebhook};
    use crate::relay::ReconnectDelays;
    use serde_json::json;
    use std::time::Duration;
    use wagate_channels::testing::{MockConnection, MockConnector};
    use wagate_channels::TransportError;
    use wagate_memory::InMemoryDedupStore;
    use wagate_session::{FileSessionStore, Session, TransportState};

    pub(crate) struct Harness {
        pub(crate) _temp: tempfile::TempDir,
        pub(crate) connector: Arc<MockConnector>,
        pub(crate) store: Arc<FileSessionStore>,
        pub(crate) supervisor: Arc<ConnectionSupervisor>,
        pub(crate) webhook: Arc<RecordingWebhook>,
        pub(crate) shutdown: CancellationToken,
        pub(crate) listener: Arc<MessageListener>,
    }

    pub(crate) fn harness() -> Harness {
        let temp = tempfile::tempdir().expect("tempdir");
        let connector = MockConnector::new();
        let store = Arc::new(FileSessionStore::new(temp.path().join("sessions")).expect("store"));
        let alerter = Arc::new(RecordingAlerter::default());
        let supervisor = Arc::new(ConnectionSupervisor::new(
            alerter.clone(),
            Duration::from_secs(3600),
            3,
        ));
        let authenticator = Arc::new(Authenticator::new(
            connector.clone(),
            store.clone(),
            supervisor.clone(),
            QrFileResolver::new(temp.path().join("qr-codes")),
            Duration::from_secs(5),
        ));
        let webhook = Arc::new(RecordingWebhook::default());
        let relay = RelayContext {
            supervisor: supervisor.clone(),
            store: store.clone(),
            dedup: Arc::new(InMemoryDedupStore::new()),
            webhook: webhook.clone(),
            alerter,
            dedup_ttl: Duration::from_secs(86_400),
            delays: ReconnectDelays::default(),
        };
        let shutdown = CancellationToken::new();
        let listener = Arc::new(MessageListener::new(
            authenticator,
            supervisor.clone(),
            store.clone(),
            relay,
            shutdown.clone(),
        ));
        Harness {
            _temp: temp,
            connector,
            store,
            supervisor,
            webhook,
            shutdown,
            listener,
        }
    }

    fn spawn_listener(
        h: &Harness,
        id: &str,
    ) -> (
        tokio::task::JoinHandle<Result<bool, ListenerError>>,
        oneshot::Receiver<Result<(), ListenerError>>,
    ) {
        let (tx, rx) = oneshot::channel();
        let listener = h.listener.clone();
        let id = id.to_string();
        let task = tokio::spawn(async move { listener.listen_for_session(&id, tx).await });
        (task, rx)
    }

    #[tokio::test]
    async fn test_shutdown_persists_refreshed_state() {
        let h = harness();
        let conn = MockConnection::new();
        h.connector.push(conn.clone());

        let (task, ready) = spawn_listener(&h, "s1");
        ready.await.expect("signalled").expect("ready");
        assert!(conn.handler().is_some());

        h.shutdown.cancel();
        assert_eq!(task.await.expect("join"), Ok(true));

        let stored = h.store.read_session("s1").await.expect("stored");
        assert_eq!(stored.transport_state.0["refreshed"], true);
        assert_eq!(conn.disconnect_count(), 1);
        assert!(!h.supervisor.is_supervised("s1").await);
    }

    #[tokio::test]
    async fn test_relays_after_attach() {
        let h = harness();
        let conn = MockConnection::new();
        h.connector.push(conn.clone());

        let (task, ready) = spawn_listener(&h, "s1");
        ready.await.expect("signalled").expect("ready");

        let future = chrono::Utc::now().timestamp() + 60;
        assert!(conn.deliver_text(message("m1", future, false)).await);
        assert_eq!(*h.webhook.delivered.lock().unwrap(), vec!["m1"]);

        h.shutdown.cancel();
        task.await.expect("join").expect("graceful");
    }

    #[tokio::test]
    async fn test_second_listener_is_rejected() {
        let h = harness();
        let (task, ready) = spawn_listener(&h, "s1");
        ready.await.expect("signalled").expect("ready");

        let (second, second_ready) = spawn_listener(&h, "s1");
        assert_eq!(
            second_ready.await.expect("signalled"),
            Err(ListenerError::AlreadyListening("s1".to_string()))
        );
        assert!(second.await.expect("join").is_err());
        assert_eq!(h.connector.created().len(), 1);

        h.shutdown.cancel();
        task.await.expect("join").expect("graceful");
    }

    #[tokio::test]
    async fn test_login_failure_aborts_before_ready() {
        let h = harness();
        h.connector.fail_next(TransportError::Timeout);

        let (task, ready) = spawn_listener(&h, "s1");
        assert!(matches!(
            ready.await.expect("signalled"),
            Err(ListenerError::Aborted { .. })
        ));
        assert!(matches!(task.await.expect("join"), Err(ListenerError::Aborted { .. })));
    }

    #[tokio::test]
    async fn test_eviction_ends_listener_without_persisting() {
        let h = harness();
        let (task, ready) = spawn_listener(&h, "s1");
        ready.await.expect("signalled").expect("ready");
        let before = h.store.read_session("s1").await.expect("stored");

        h.supervisor.remove_connection_for_session("s1").await;
        assert_eq!(task.await.expect("join"), Ok(false));

        let after = h.store.read_session("s1").await.expect("stored");
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[tokio::test]
    async fn test_disconnect_failure_is_reported() {
        let h = harness();
        h.store
            .write_session(&Session::new("s1", TransportState::new(json!({"keys": "k"}))))
            .await
            .expect("seed");
        let conn = MockConnection::new();
        conn.set_disconnect_error(Some(TransportError::NotConnected));
        h.connector.push(conn);

        let (task, ready) = spawn_listener(&h, "s1");
        ready.await.expect("signalled").expect("ready");

        h.shutdown.cancel();
        assert!(matches!(
            task.await.expect("join"),
            Err(ListenerError::DisconnectFailed { .. })
        ));
        assert!(!h.supervisor.is_supervised("s1").await);
    }

    #[tokio::test]
    async fn test_one_shutdown_releases_every_listener() {
        let h = harness();
        let mut tasks = Vec::new();
        for id in ["a", "b", "c"] {
            let (task, ready) = spawn_listener(&h, id);
            ready.await.expect("signalled").expect("ready");
            tasks.push(task);
        }

        h.shutdown.cancel();
        for task in tasks {
            assert_eq!(task.await.expect("join"), Ok(true));
        }
        assert!(h.supervisor.active_session_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_unresponsive_session_can_register_again() {
        let h = harness();
        let stale = MockConnection::new();
        h.connector.push(stale.clone());
        let (first, ready) = spawn_listener(&h, "s1");
        ready.await.expect("signalled").expect("ready");

        stale.set_healthy(false);
        let fresh = MockConnection::new();
        h.connector.push(fresh.clone());
        let (second, second_ready) = spawn_listener(&h, "s1");
        second_ready.await.expect("signalled").expect("ready");

        assert_eq!(h.connector.created().len(), 2);
        assert!(fresh.handler().is_some());
        // The replaced entry wakes the first listener.
        assert_eq!(first.await.expect("join"), Ok(false));
        assert_eq!(stale.disconnect_count(), 1);

        h.shutdown.cancel();
        assert_eq!(second.await.expect("join"), Ok(true));
    }
}
