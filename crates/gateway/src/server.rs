// Gateway Server
//
// Wires the stores, supervisor, authenticator, listener and registration
// together and serves the HTTP API until the shutdown token is cancelled.

use crate::alerts::{Alerter, LogAlerter, WebhookAlerter};
use crate::auth::Authenticator;
use crate::handlers;
use crate::listener::MessageListener;
use crate::qr::QrFileResolver;
use crate::registration::Registration;
use crate::relay::{HttpWebhook, ReconnectDelays, RelayContext, WebhookSink};
use crate::supervisor::ConnectionSupervisor;
use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use wagate_channels::Connector;
use wagate_core::{Config, RunMode, WagateError};
use wagate_memory::{MessageDedupStore, SqliteDedupStore};
use wagate_session::{FileSessionStore, SessionStore};

/// Shared state handed to every HTTP handler
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<ConnectionSupervisor>,
    pub registration: Arc<Registration>,
    pub store: Arc<dyn SessionStore>,
    pub qr_files: QrFileResolver,
    pub http: reqwest::Client,
}

pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/register-session/", post(handlers::register_session))
        .route("/send-message/", post(handlers::send_message))
        .route("/send-image/", post(handlers::send_image))
        .route("/get-qr-code/{session_id}/", get(handlers::get_qr_code))
        .route("/get-session-info/{session_id}/", get(handlers::get_session_info))
        .route(
            "/get-active-connection-info/{session_id}/",
            get(handlers::get_active_connection_info),
        )
        .route("/livez", get(handlers::livez))
        .layer(cors)
        .with_state(state)
}

/// Outbound HTTP client for webhooks, alerts and image fetches
pub fn build_http_client(config: &Config) -> Result<reqwest::Client, WagateError> {
    reqwest::Client::builder()
        .timeout(config.relay.http_timeout())
        .danger_accept_invalid_certs(config.server.env == RunMode::Dev)
        .build()
        .map_err(|e| WagateError::startup("http client", e.to_string()))
}

/// Webhook alerts when configured, log alerts otherwise
pub fn build_alerter(config: &Config, client: &reqwest::Client) -> Arc<dyn Alerter> {
    match &config.alerts.webhook_url {
        Some(url) if !url.is_empty() => Arc::new(WebhookAlerter::new(client.clone(), url.clone())),
        _ => Arc::new(LogAlerter),
    }
}

const TLS_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

enum ApiListener {
    Http(tokio::net::TcpListener),
    Https(SocketAddr, RustlsConfig),
}

async fn load_tls(cert: &Path, key: &Path) -> Result<RustlsConfig> {
    // Fails harmlessly when a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();
    RustlsConfig::from_pem_file(cert, key)
        .await
        .with_context(|| format!("failed to load TLS certificate {}", cert.display()))
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("failed to resolve {}", addr))?
        .next()
        .with_context(|| format!("no address for {}", addr))
}

pub struct GatewayServer {
    config: Config,
    state: AppState,
    dedup: Arc<dyn MessageDedupStore>,
    shutdown: CancellationToken,
}

impl GatewayServer {
    /// Open the on-disk stores named by `config` and wire the server.
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        shutdown: CancellationToken,
    ) -> Result<Self, WagateError> {
        let store = FileSessionStore::new(config.storage.sessions_dir())
            .map_err(|e| WagateError::startup("session store", e.to_string()))?;
        let dedup = SqliteDedupStore::open(config.storage.dedup_db_path())
            .map_err(|e| WagateError::startup("dedup store", e.to_string()))?;
        let http = build_http_client(&config)?;
        let alerter = build_alerter(&config, &http);
        let webhook = Arc::new(HttpWebhook::new(http.clone(), config.relay.webhook_url.clone()));

        Ok(Self::with_parts(
            config,
            connector,
            Arc::new(store),
            Arc::new(dedup),
            webhook,
            alerter,
            http,
            shutdown,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_parts(
        config: Config,
        connector: Arc<dyn Connector>,
        store: Arc<dyn SessionStore>,
        dedup: Arc<dyn MessageDedupStore>,
        webhook: Arc<dyn WebhookSink>,
        alerter: Arc<dyn Alerter>,
        http: reqwest::Client,
        shutdown: CancellationToken,
    ) -> Self {
        let supervisor = Arc::new(ConnectionSupervisor::new(
            alerter.clone(),
            config.supervisor.probe_interval(),
            config.supervisor.notification_limit,
        ));
        let qr_files = QrFileResolver::new(config.storage.qr_codes_dir());
        let authenticator = Arc::new(Authenticator::new(
            connector,
            store.clone(),
            supervisor.clone(),
            qr_files.clone(),
            config.transport.connection_timeout(),
        ));
        let relay = RelayContext {
            supervisor: supervisor.clone(),
            store: store.clone(),
            dedup: dedup.clone(),
            webhook,
            alerter,
            dedup_ttl: config.relay.dedup_ttl(),
            delays: ReconnectDelays::default(),
        };
        let listener = Arc::new(MessageListener::new(
            authenticator,
            supervisor.clone(),
            store.clone(),
            relay,
            shutdown.clone(),
        ));
        let registration = Arc::new(Registration::new(listener, store.clone()));

        let state = AppState {
            supervisor,
            registration,
            store,
            qr_files,
            http,
        };
        Self {
            config,
            state,
            dedup,
            shutdown,
        }
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn registration(&self) -> Arc<Registration> {
        self.state.registration.clone()
    }

    pub fn router(&self) -> Router {
        build_app(self.state.clone())
    }

    /// Serve until shutdown, then wait for every listener to persist its
    /// session.
    ///
    /// HTTPS is served when the configured certificate and key both exist,
    /// plain HTTP otherwise.
    pub async fn start(self) -> Result<()> {
        let addr = self.config.server.listen_addr.clone();
        let listener = match self.config.server.tls_files() {
            Some((cert, key)) => {
                let tls = load_tls(cert, key).await?;
                let socket = resolve(&addr).await?;
                tracing::info!("HTTPS API listening on {}", socket);
                ApiListener::Https(socket, tls)
            }
            None => {
                let listener = tokio::net::TcpListener::bind(&addr)
                    .await
                    .with_context(|| format!("failed to bind {}", addr))?;
                tracing::info!("HTTP API listening on {}", addr);
                ApiListener::Http(listener)
            }
        };

        match self.dedup.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => tracing::info!(purged, "expired dedup keys removed"),
            Err(e) => tracing::warn!("dedup purge failed: {}", e),
        }

        let registration = self.state.registration.clone();
        let auto_connect = tokio::spawn(async move {
            if let Err(e) = registration.auto_connect_all().await {
                tracing::error!("auto-connect failed: {}", e);
            }
        });

        let shutdown = self.shutdown.clone();
        match listener {
            ApiListener::Http(listener) => {
                axum::serve(listener, self.router())
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
                    .context("HTTP server failed")?;
            }
            ApiListener::Https(socket, tls) => {
                let handle = axum_server::Handle::new();
                let signal = handle.clone();
                tokio::spawn(async move {
                    shutdown.cancelled().await;
                    signal.graceful_shutdown(Some(TLS_DRAIN_TIMEOUT));
                });
                axum_server::bind_rustls(socket, tls)
                    .handle(handle)
                    .serve(self.router().into_make_service())
                    .await
                    .context("HTTPS server failed")?;
            }
        }

        tracing::info!("HTTP API stopped, waiting for listeners");
        if let Err(e) = auto_connect.await {
            tracing::warn!("auto-connect task failed: {}", e);
        }
        self.state.registration.wait_for_listeners().await;
        tracing::info!("all listeners stopped");
        Ok(())
    }
}
