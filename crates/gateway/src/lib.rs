// wagate Gateway
//
// Device-session gateway: restore-or-QR login, connection supervision with
// health probes, inbound message relay to a webhook, and the HTTP API.

pub mod alerts;
pub mod auth;
pub mod handlers;
pub mod listener;
pub mod qr;
pub mod registration;
pub mod relay;
pub mod server;
pub mod supervisor;

pub use alerts::{Alert, AlertKind, AlertLevel, Alerter, LogAlerter, WebhookAlerter};
pub use auth::{AuthError, Authenticator};
pub use listener::{ListenerError, MessageListener};
pub use qr::QrFileResolver;
pub use registration::Registration;
pub use relay::{HttpWebhook, RelayContext, RelayHandler, WebhookSink};
pub use server::{build_app, AppState, GatewayServer};
pub use supervisor::{ConnectionSupervisor, NotificationState, SessionConnection, SupervisorError};
