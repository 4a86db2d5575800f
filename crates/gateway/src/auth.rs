// Session Authentication
//
// Restore-or-QR login. A stored session is restored; otherwise a QR login is
// run and the QR is shown on the terminal and served as a PNG until the
// login resolves.

use crate::qr::{self, QrFileResolver};
use crate::supervisor::{ConnectionSupervisor, SupervisorError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use wagate_channels::{Connection, Connector, TransportError};
use wagate_session::{Session, SessionError, SessionStore};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to open connection: {0}")]
    ConnectFailed(#[source] TransportError),

    #[error("failed to restore session (permanent: {permanent}): {source}")]
    RestoreFailed {
        permanent: bool,
        #[source]
        source: TransportError,
    },

    #[error("qr login failed: {0}")]
    QrLoginFailed(#[source] TransportError),

    #[error("failed to supervise connection: {0}")]
    SupervisorBindFailed(#[source] SupervisorError),

    #[error("failed to persist session: {0}")]
    PersistFailed(#[source] SessionError),
}

pub struct Authenticator {
    connector: Arc<dyn Connector>,
    store: Arc<dyn SessionStore>,
    supervisor: Arc<ConnectionSupervisor>,
    qr_files: QrFileResolver,
    connect_timeout: Duration,
}

impl Authenticator {
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<dyn SessionStore>,
        supervisor: Arc<ConnectionSupervisor>,
        qr_files: QrFileResolver,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            store,
            supervisor,
            qr_files,
            connect_timeout,
        }
    }

    /// Log `session_id` in, bind the connection into the supervisor and
    /// persist the session.
    ///
    /// If persisting fails the connection stays supervised.
    pub async fn login(
        &self,
        session_id: &str,
    ) -> Result<(Arc<dyn Connection>, Session), AuthError> {
        let connection = self
            .connector
            .connect(self.connect_timeout)
            .await
            .map_err(AuthError::ConnectFailed)?;

        let session = match self.store.read_session(session_id).await {
            Ok(session) => self.restore(session_id, &connection, session).await,
            Err(e) => {
                if !e.is_not_found() {
                    tracing::warn!(session_id = %session_id, "session read failed, falling back to qr login: {}", e);
                }
                self.login_with_qr(session_id, &connection).await
            }
        };
        let session = match session {
            Ok(session) => session,
            Err(e) => {
                close_quietly(session_id, connection.as_ref()).await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .supervisor
            .add_authenticated_connection_for_session(session_id, connection.clone(), session.clone())
            .await
        {
            close_quietly(session_id, connection.as_ref()).await;
            return Err(AuthError::SupervisorBindFailed(e));
        }

        self.store
            .write_session(&session)
            .await
            .map_err(AuthError::PersistFailed)?;

        tracing::info!(session_id = %session_id, "session authenticated");
        Ok((connection, session))
    }

    async fn restore(
        &self,
        session_id: &str,
        connection: &Arc<dyn Connection>,
        session: Session,
    ) -> Result<Session, AuthError> {
        match connection.restore_with_session(&session.transport_state).await {
            Ok(()) => {
                tracing::info!(session_id = %session_id, "session restored");
                Ok(session)
            }
            Err(TransportError::AdminRejected) => {
                tracing::warn!(session_id = %session_id, "stored session rejected, removing it");
                if let Err(e) = self.store.remove_session(session_id).await {
                    tracing::warn!(session_id = %session_id, "failed to remove rejected session: {}", e);
                }
                Err(AuthError::RestoreFailed {
                    permanent: true,
                    source: TransportError::AdminRejected,
                })
            }
            Err(e) => Err(AuthError::RestoreFailed {
                permanent: false,
                source: e,
            }),
        }
    }

    async fn login_with_qr(
        &self,
        session_id: &str,
        connection: &Arc<dyn Connection>,
    ) -> Result<Session, AuthError> {
        let (qr_tx, qr_rx) = oneshot::channel::<String>();
        let path = self.qr_files.path_for(session_id);

        let display_path = path.clone();
        let display_id = session_id.to_string();
        let display = tokio::spawn(async move {
            let Ok(payload) = qr_rx.await else {
                return;
            };
            match qr::render_terminal(&payload) {
                Ok(rendered) => println!("Scan to log in session {}:\n{}", display_id, rendered),
                Err(e) => tracing::warn!(session_id = %display_id, "failed to render qr: {}", e),
            }
            let written = tokio::task::spawn_blocking(move || qr::write_png(&payload, &display_path)).await;
            match written {
                Ok(Ok(())) => tracing::info!(session_id = %display_id, "qr image written"),
                Ok(Err(e)) => tracing::warn!(session_id = %display_id, "failed to write qr image: {}", e),
                Err(e) => tracing::warn!(session_id = %display_id, "qr writer task failed: {}", e),
            }
        });

        let result = connection.login_with_qr(qr_tx).await;
        if let Err(e) = display.await {
            tracing::warn!(session_id = %session_id, "qr display task failed: {}", e);
        }
        qr::remove_png(&path).await;

        let state = result.map_err(AuthError::QrLoginFailed)?;
        tracing::info!(session_id = %session_id, "qr login completed");
        Ok(Session::new(session_id, state))
    }
}

async fn close_quietly(session_id: &str, connection: &dyn Connection) {
    if let Err(e) = connection.disconnect().await {
        tracing::debug!(session_id = %session_id, "disconnect after failed login: {}", e);
    }
}
