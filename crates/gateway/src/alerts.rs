// Operator Alerts
//
// Device health notifications raised by the supervisor and the relay handler.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// Health probe failed
    Unresponsive,
    /// Health probe passed again after a failure streak
    Recovered,
    /// The remote side no longer knows the device; session dropped
    DeviceLost,
    /// Re-login after a transport error failed
    RestoreFailed,
}

impl AlertKind {
    pub fn level(self) -> AlertLevel {
        match self {
            Self::Unresponsive => AlertLevel::Warning,
            Self::Recovered => AlertLevel::Info,
            Self::DeviceLost | Self::RestoreFailed => AlertLevel::Error,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::Unresponsive => "device unresponsive",
            Self::Recovered => "device responsive again",
            Self::DeviceLost => "device lost",
            Self::RestoreFailed => "restore failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub kind: AlertKind,
    pub session_id: String,
    pub detail: Option<String>,
}

impl Alert {
    pub fn new(kind: AlertKind, session_id: impl Into<String>) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn level(&self) -> AlertLevel {
        self.kind.level()
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}: {}", self.session_id, self.kind.describe())?;
        if let Some(detail) = &self.detail {
            write!(f, " ({})", detail)?;
        }
        Ok(())
    }
}

/// Destination for operator alerts
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn alert(&self, alert: Alert);
}

fn log_alert(alert: &Alert) {
    match alert.level() {
        AlertLevel::Info => tracing::info!(target: "wagate::alert", session_id = %alert.session_id, "{}", alert),
        AlertLevel::Warning => tracing::warn!(target: "wagate::alert", session_id = %alert.session_id, "{}", alert),
        AlertLevel::Error => tracing::error!(target: "wagate::alert", session_id = %alert.session_id, "{}", alert),
    }
}

/// Alerts go to the log only
#[derive(Debug, Default, Clone)]
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn alert(&self, alert: Alert) {
        log_alert(&alert);
    }
}

/// Logs each alert and POSTs it as JSON to an operator endpoint
pub struct WebhookAlerter {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlerter {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    async fn alert(&self, alert: Alert) {
        log_alert(&alert);

        let body = json!({
            "level": alert.level(),
            "message": alert.to_string(),
        });
        let request = self.client.post(&self.url).json(&body);
        tokio::spawn(async move {
            match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(_) => {}
                Err(e) => tracing::warn!("alert delivery failed: {}", e),
            }
        });
    }
}

/// Collects alerts for assertions
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingAlerter {
    alerts: std::sync::Mutex<Vec<Alert>>,
}

#[cfg(test)]
impl RecordingAlerter {
    pub(crate) fn kinds(&self) -> Vec<AlertKind> {
        self.alerts
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.kind)
            .collect()
    }

    pub(crate) fn count(&self, kind: AlertKind) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }
}

#[cfg(test)]
#[async_trait]
impl Alerter for RecordingAlerter {
    async fn alert(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn test_alert_display() {
        let alert = Alert::new(AlertKind::RestoreFailed, "s1").with_detail("timeout");
        assert_eq!(alert.to_string(), "session s1: restore failed (timeout)");
        assert_eq!(alert.level(), AlertLevel::Error);
    }

    #[tokio::test]
    async fn test_webhook_alerter_posts_json() {
        let server = MockServer::start();
        let hook = server.mock(|when, then| {
            when.method(POST)
                .path("/alerts")
                .json_body(serde_json::json!({
                    "level": "warning",
                    "message": "session s1: device unresponsive"
                }));
            then.status(204);
        });

        let alerter = WebhookAlerter::new(reqwest::Client::new(), server.url("/alerts"));
        alerter.alert(Alert::new(AlertKind::Unresponsive, "s1")).await;

        for _ in 0..50 {
            if hook.calls() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        hook.assert_calls(1);
    }
}
