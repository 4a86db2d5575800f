// Session Registration
//
// Starts listeners on demand or for every stored session at startup, and
// reports back once the listener's handler is attached.

use crate::listener::{ListenerError, MessageListener};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;
use wagate_session::{validate_session_id, SessionError, SessionStore};

pub struct Registration {
    listener: Arc<MessageListener>,
    store: Arc<dyn SessionStore>,
    tasks: TaskTracker,
}

impl Registration {
    pub fn new(listener: Arc<MessageListener>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            listener,
            store,
            tasks: TaskTracker::new(),
        }
    }

    /// Start listening on `session_id` and wait until its handler is attached.
    ///
    /// The listener keeps running in the background after this returns.
    pub async fn register(&self, session_id: &str) -> Result<(), ListenerError> {
        validate_session_id(session_id)
            .map_err(|e| ListenerError::InvalidSessionId(e.to_string()))?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let listener = self.listener.clone();
        let id = session_id.to_string();
        self.tasks.spawn(async move {
            match listener.listen_for_session(&id, ready_tx).await {
                Ok(true) => tracing::debug!(session_id = %id, "listener finished"),
                Ok(false) => tracing::debug!(session_id = %id, "listener evicted"),
                Err(e) => tracing::warn!(session_id = %id, "listener ended: {}", e),
            }
        });

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(ListenerError::aborted(
                session_id,
                "listener task ended without signalling",
            )),
        }
    }

    /// Register every stored session, one after another.
    ///
    /// Returns how many started; individual failures are logged and skipped.
    pub async fn auto_connect_all(&self) -> Result<usize, SessionError> {
        let session_ids = self.store.list_session_ids().await?;
        tracing::info!(count = session_ids.len(), "auto-connecting stored sessions");

        let mut started = 0;
        for session_id in session_ids {
            match self.register(&session_id).await {
                Ok(()) => started += 1,
                Err(e) => tracing::warn!(session_id = %session_id, "auto-connect failed: {}", e),
            }
        }
        tracing::info!(started, "auto-connect finished");
        Ok(started)
    }

    /// Wait for every listener to finish; call after cancelling shutdown.
    pub async fn wait_for_listeners(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}
