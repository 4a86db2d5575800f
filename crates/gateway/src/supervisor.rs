// Connection Supervisor
//
// In-memory registry of supervised sessions. Each entry runs a periodic
// health probe and raises alerts on failure and recovery.

use crate::alerts::{Alert, AlertKind, Alerter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use wagate_channels::Connection;
use wagate_session::Session;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("session {0} is not active")]
    NotActive(String),
    #[error("session {0} is not supervised")]
    NotFound(String),
    #[error("session {0} did not answer the health probe")]
    Unresponsive(String),
}

/// A live connection bound to its session while supervised
#[derive(Clone)]
pub struct SessionConnection {
    pub connection: Arc<dyn Connection>,
    pub session: Session,
    /// Cancelled exactly once, when the entry leaves the pool
    pub cancel: CancellationToken,
    pub generation: u64,
}

impl std::fmt::Debug for SessionConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConnection")
            .field("session_id", &self.session.session_id)
            .field("generation", &self.generation)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Failure streak bookkeeping for one supervised session
#[derive(Debug, Clone)]
pub struct NotificationState {
    consecutive_failures: u32,
    notified: u32,
    limit: u32,
}

impl NotificationState {
    pub fn new(limit: u32) -> Self {
        Self {
            consecutive_failures: 0,
            notified: 0,
            limit,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Record one probe outcome, returning the alert to raise, if any.
    pub fn record(&mut self, healthy: bool) -> Option<AlertKind> {
        if healthy {
            if self.consecutive_failures == 0 {
                return None;
            }
            self.consecutive_failures = 0;
            self.notified = 0;
            return Some(AlertKind::Recovered);
        }

        self.consecutive_failures += 1;
        if self.notified < self.limit {
            self.notified += 1;
            Some(AlertKind::Unresponsive)
        } else {
            None
        }
    }
}

pub struct ConnectionSupervisor {
    pool: Arc<RwLock<HashMap<String, SessionConnection>>>,
    alerter: Arc<dyn Alerter>,
    probe_interval: Duration,
    notification_limit: u32,
    next_generation: AtomicU64,
}

fn same_connection(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

async fn is_healthy(connection: &dyn Connection) -> bool {
    matches!(connection.admin_ping().await, Ok(true))
}

impl ConnectionSupervisor {
    pub fn new(alerter: Arc<dyn Alerter>, probe_interval: Duration, notification_limit: u32) -> Self {
        Self {
            pool: Arc::new(RwLock::new(HashMap::new())),
            alerter,
            probe_interval,
            notification_limit,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Supervise `connection` for `session_id` after one successful probe.
    ///
    /// An existing entry for the same id is torn down first.
    pub async fn add_authenticated_connection_for_session(
        &self,
        session_id: &str,
        connection: Arc<dyn Connection>,
        session: Session,
    ) -> Result<SessionConnection, SupervisorError> {
        match connection.admin_ping().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(session_id = %session_id, "admin ping reported logged out");
                return Err(SupervisorError::NotActive(session_id.to_string()));
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, "admin ping failed: {}", e);
                return Err(SupervisorError::NotActive(session_id.to_string()));
            }
        }

        let entry = SessionConnection {
            connection: connection.clone(),
            session,
            cancel: CancellationToken::new(),
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
        };

        let previous = {
            let mut pool = self.pool.write().await;
            pool.insert(session_id.to_string(), entry.clone())
        };
        if let Some(previous) = previous {
            tracing::info!(
                session_id = %session_id,
                generation = previous.generation,
                "replacing supervised connection"
            );
            previous.cancel.cancel();
            if !same_connection(&previous.connection, &connection) {
                if let Err(e) = previous.connection.disconnect().await {
                    tracing::warn!(session_id = %session_id, "disconnect of replaced connection failed: {}", e);
                }
            }
        }

        tokio::spawn(probe_loop(
            session_id.to_string(),
            connection,
            entry.cancel.clone(),
            self.alerter.clone(),
            self.probe_interval,
            self.notification_limit,
        ));

        tracing::info!(session_id = %session_id, generation = entry.generation, "connection supervised");
        Ok(entry)
    }

    /// Tear down the entry for `session_id`, if any.
    pub async fn remove_connection_for_session(&self, session_id: &str) {
        let removed = self.pool.write().await.remove(session_id);
        let Some(entry) = removed else {
            return;
        };
        if let Err(e) = entry.connection.disconnect().await {
            tracing::warn!(session_id = %session_id, "disconnect failed: {}", e);
        }
        entry.cancel.cancel();
        tracing::info!(session_id = %session_id, "connection removed from supervision");
    }

    /// Fetch the entry for `session_id` after a fresh health probe.
    pub async fn authenticated_connection_for_session(
        &self,
        session_id: &str,
    ) -> Result<SessionConnection, SupervisorError> {
        let entry = self
            .entry(session_id)
            .await
            .ok_or_else(|| SupervisorError::NotFound(session_id.to_string()))?;
        if !is_healthy(entry.connection.as_ref()).await {
            return Err(SupervisorError::Unresponsive(session_id.to_string()));
        }
        Ok(entry)
    }

    /// Entry for `session_id` without probing.
    pub async fn entry(&self, session_id: &str) -> Option<SessionConnection> {
        self.pool.read().await.get(session_id).cloned()
    }

    pub async fn is_supervised(&self, session_id: &str) -> bool {
        self.pool.read().await.contains_key(session_id)
    }

    /// Drop the entry without disconnecting, if it is still `generation`.
    pub async fn detach(&self, session_id: &str, generation: u64) -> bool {
        let mut pool = self.pool.write().await;
        match pool.get(session_id) {
            Some(entry) if entry.generation == generation => {
                entry.cancel.cancel();
                pool.remove(session_id);
                true
            }
            _ => false,
        }
    }

    pub async fn active_session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pool.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

async fn probe_loop(
    session_id: String,
    connection: Arc<dyn Connection>,
    cancel: CancellationToken,
    alerter: Arc<dyn Alerter>,
    period: Duration,
    notification_limit: u32,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    let mut state = NotificationState::new(notification_limit);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let healthy = is_healthy(connection.as_ref()).await;
                if !healthy {
                    tracing::debug!(
                        session_id = %session_id,
                        failures = state.consecutive_failures() + 1,
                        "health probe failed"
                    );
                }
                if let Some(kind) = state.record(healthy) {
                    alerter.alert(Alert::new(kind, session_id.clone())).await;
                }
            }
        }
    }
    tracing::debug!(session_id = %session_id, "probe loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::RecordingAlerter;
    use wagate_channels::testing::MockConnection;
    use wagate_session::TransportState;

    const PERIOD: Duration = Duration::from_millis(100);

    fn supervisor(alerter: Arc<RecordingAlerter>) -> ConnectionSupervisor {
        ConnectionSupervisor::new(alerter, PERIOD, 3)
    }

    fn session(id: &str) -> Session {
        Session::new(id, TransportState::default())
    }

    #[test]
    fn test_notification_state_limits_alerts() {
        let mut state = NotificationState::new(3);
        let outcomes: Vec<_> = [false, false, false, false, false, true, true]
            .into_iter()
            .map(|healthy| state.record(healthy))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                Some(AlertKind::Unresponsive),
                Some(AlertKind::Unresponsive),
                Some(AlertKind::Unresponsive),
                None,
                None,
                Some(AlertKind::Recovered),
                None,
            ]
        );

        // A new streak gets a fresh budget.
        assert_eq!(state.record(false), Some(AlertKind::Unresponsive));
    }

    #[tokio::test]
    async fn test_add_rejects_unhealthy_connection() {
        let sup = supervisor(Arc::new(RecordingAlerter::default()));
        let conn = MockConnection::new();
        conn.set_healthy(false);

        let err = sup
            .add_authenticated_connection_for_session("s1", conn, session("s1"))
            .await
            .unwrap_err();
        assert_eq!(err, SupervisorError::NotActive("s1".to_string()));
        assert!(sup.active_session_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_add_replaces_previous_entry() {
        let sup = supervisor(Arc::new(RecordingAlerter::default()));
        let first = MockConnection::new();
        let second = MockConnection::new();

        let old = sup
            .add_authenticated_connection_for_session("s1", first.clone(), session("s1"))
            .await
            .unwrap();
        let new = sup
            .add_authenticated_connection_for_session("s1", second.clone(), session("s1"))
            .await
            .unwrap();

        assert!(old.cancel.is_cancelled());
        assert!(!new.cancel.is_cancelled());
        assert_eq!(first.disconnect_count(), 1);
        assert_eq!(second.disconnect_count(), 0);
        assert_eq!(sup.active_session_ids().await, vec!["s1"]);
        assert_eq!(sup.entry("s1").await.unwrap().generation, new.generation);
    }

    #[tokio::test]
    async fn test_remove_disconnects_and_cancels() {
        let sup = supervisor(Arc::new(RecordingAlerter::default()));
        let conn = MockConnection::new();
        let entry = sup
            .add_authenticated_connection_for_session("s1", conn.clone(), session("s1"))
            .await
            .unwrap();

        sup.remove_connection_for_session("s1").await;
        assert!(entry.cancel.is_cancelled());
        assert_eq!(conn.disconnect_count(), 1);
        assert!(!sup.is_supervised("s1").await);

        sup.remove_connection_for_session("s1").await;
        assert_eq!(conn.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_lookup_reprobes() {
        let sup = supervisor(Arc::new(RecordingAlerter::default()));
        assert_eq!(
            sup.authenticated_connection_for_session("s1").await.unwrap_err(),
            SupervisorError::NotFound("s1".to_string())
        );

        let conn = MockConnection::new();
        sup.add_authenticated_connection_for_session("s1", conn.clone(), session("s1"))
            .await
            .unwrap();
        assert!(sup.authenticated_connection_for_session("s1").await.is_ok());

        conn.set_healthy(false);
        assert_eq!(
            sup.authenticated_connection_for_session("s1").await.unwrap_err(),
            SupervisorError::Unresponsive("s1".to_string())
        );
        assert!(sup.is_supervised("s1").await);
    }

    #[tokio::test]
    async fn test_detach_checks_generation() {
        let sup = supervisor(Arc::new(RecordingAlerter::default()));
        let conn = MockConnection::new();
        let entry = sup
            .add_authenticated_connection_for_session("s1", conn.clone(), session("s1"))
            .await
            .unwrap();

        assert!(!sup.detach("s1", entry.generation + 1).await);
        assert!(sup.is_supervised("s1").await);

        assert!(sup.detach("s1", entry.generation).await);
        assert!(entry.cancel.is_cancelled());
        assert!(!sup.is_supervised("s1").await);
        assert_eq!(conn.disconnect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failures_then_recovery() {
        let alerter = Arc::new(RecordingAlerter::default());
        let sup = supervisor(alerter.clone());
        let conn = MockConnection::new();
        sup.add_authenticated_connection_for_session("s1", conn.clone(), session("s1"))
            .await
            .unwrap();

        conn.set_healthy(false);
        for _ in 0..5 {
            tokio::time::sleep(PERIOD).await;
        }
        tokio::time::sleep(PERIOD / 2).await;
        assert_eq!(alerter.count(AlertKind::Unresponsive), 3);
        assert_eq!(alerter.count(AlertKind::Recovered), 0);

        conn.set_healthy(true);
        tokio::time::sleep(PERIOD).await;
        tokio::time::sleep(PERIOD).await;
        assert_eq!(alerter.count(AlertKind::Recovered), 1);
        assert_eq!(alerter.count(AlertKind::Unresponsive), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_stops_after_removal() {
        let sup = supervisor(Arc::new(RecordingAlerter::default()));
        let conn = MockConnection::new();
        sup.add_authenticated_connection_for_session("s1", conn.clone(), session("s1"))
            .await
            .unwrap();

        tokio::time::sleep(PERIOD * 3 + PERIOD / 2).await;
        let pings = conn.ping_count();
        assert_eq!(pings, 4);

        sup.remove_connection_for_session("s1").await;
        tokio::time::sleep(PERIOD * 5).await;
        assert_eq!(conn.ping_count(), pings);
    }
}
