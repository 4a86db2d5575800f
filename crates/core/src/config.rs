//! wagate Configuration
//!
//! Configuration structures with serde defaults, a YAML loader with
//! environment overrides, and a validator.

use crate::error::WagateError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Default HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8087";
/// Default bridge endpoint for the transport adapter
pub const DEFAULT_BRIDGE_URL: &str = "ws://127.0.0.1:8088/bridge";
/// Default transport connect timeout (seconds)
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 20;
/// Default interval between health probes (milliseconds)
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 60_000;
/// Default number of "unresponsive" alerts per failure streak
pub const DEFAULT_NOTIFICATION_LIMIT: u32 = 3;
/// Default retention of relayed message ids (days)
pub const DEFAULT_DEDUP_TTL_DAYS: u64 = 30;
/// Default timeout for outbound HTTP calls (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Environment variable names recognised by [`ConfigLoader::apply_env`]
pub const ENV_LISTEN_ADDR: &str = "WAGATE_LISTEN_ADDR";
pub const ENV_STORAGE_ROOT: &str = "WAGATE_STORAGE_ROOT";
pub const ENV_WEBHOOK_URL: &str = "WAGATE_WEBHOOK_URL";
pub const ENV_CONNECTION_TIMEOUT: &str = "WAGATE_CONNECTION_TIMEOUT_SECS";
pub const ENV_PROBE_INTERVAL: &str = "WAGATE_PROBE_INTERVAL_MS";
pub const ENV_BRIDGE_URL: &str = "WAGATE_BRIDGE_URL";
pub const ENV_RUN_MODE: &str = "WAGATE_ENV";
pub const ENV_ALERT_WEBHOOK_URL: &str = "WAGATE_ALERT_WEBHOOK_URL";
pub const ENV_CERT_FILE: &str = "WAGATE_CERT_FILE";
pub const ENV_CERT_KEY_FILE: &str = "WAGATE_CERT_KEY_FILE";

// ============================================================================
// Helper functions for paths (required for serde defaults)
// ============================================================================

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_wagate_dir() -> PathBuf {
    home_dir().join(".wagate")
}

// ============================================================================
// Main Config
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
}

// ============================================================================
// Server Config
// ============================================================================

/// Run mode. `dev` relaxes TLS verification of outbound calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Dev,
    #[default]
    Prod,
}

impl std::str::FromStr for RunMode {
    type Err = WagateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(Self::Dev),
            "prod" | "" => Ok(Self::Prod),
            other => Err(WagateError::config_invalid(
                "server.env",
                format!("allowed values: `dev`, `prod`; got `{}`", other),
            )),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP API binds to
    #[serde(default = "ServerConfig::default_listen_addr")]
    pub listen_addr: String,
    /// Run mode
    #[serde(default)]
    pub env: RunMode,
    /// PEM certificate chain; HTTPS is served when this and `key_file` exist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,
    /// PEM private key matching `cert_file`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

impl ServerConfig {
    fn default_listen_addr() -> String {
        DEFAULT_LISTEN_ADDR.to_string()
    }

    /// Certificate and key paths, when both are configured and present on disk.
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        let cert = self.cert_file.as_deref()?;
        let key = self.key_file.as_deref()?;
        (cert.is_file() && key.is_file()).then_some((cert, key))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: Self::default_listen_addr(),
            env: RunMode::default(),
            cert_file: None,
            key_file: None,
        }
    }
}

// ============================================================================
// Storage Config
// ============================================================================

/// Filesystem layout for persisted state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root under which sessions, QR images and the dedup database live
    #[serde(default = "StorageConfig::default_root")]
    pub root: PathBuf,
}

impl StorageConfig {
    fn default_root() -> PathBuf {
        default_wagate_dir()
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn qr_codes_dir(&self) -> PathBuf {
        self.root.join("qr-codes")
    }

    pub fn dedup_db_path(&self) -> PathBuf {
        self.root.join("dedup.sqlite")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: Self::default_root(),
        }
    }
}

// ============================================================================
// Transport Config
// ============================================================================

/// Transport bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// WebSocket endpoint of the protocol bridge
    #[serde(default = "TransportConfig::default_bridge_url")]
    pub bridge_url: String,
    /// Timeout for establishing a connection, in seconds
    #[serde(default = "TransportConfig::default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
}

impl TransportConfig {
    fn default_bridge_url() -> String {
        DEFAULT_BRIDGE_URL.to_string()
    }
    fn default_connection_timeout_secs() -> u64 {
        DEFAULT_CONNECTION_TIMEOUT_SECS
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bridge_url: Self::default_bridge_url(),
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
        }
    }
}

// ============================================================================
// Supervisor Config
// ============================================================================

/// Health probing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Interval between probes, in milliseconds
    #[serde(default = "SupervisorConfig::default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Alerts emitted per failure streak before going quiet
    #[serde(default = "SupervisorConfig::default_notification_limit")]
    pub notification_limit: u32,
}

impl SupervisorConfig {
    fn default_probe_interval_ms() -> u64 {
        DEFAULT_PROBE_INTERVAL_MS
    }
    fn default_notification_limit() -> u32 {
        DEFAULT_NOTIFICATION_LIMIT
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: DEFAULT_PROBE_INTERVAL_MS,
            notification_limit: DEFAULT_NOTIFICATION_LIMIT,
        }
    }
}

// ============================================================================
// Relay Config
// ============================================================================

/// Webhook relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Base webhook url; the session id is appended to it
    #[serde(default)]
    pub webhook_url: String,
    /// Retention of relayed message ids, in days
    #[serde(default = "RelayConfig::default_dedup_ttl_days")]
    pub dedup_ttl_days: u64,
    /// Timeout for webhook and image fetch requests, in seconds
    #[serde(default = "RelayConfig::default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl RelayConfig {
    fn default_dedup_ttl_days() -> u64 {
        DEFAULT_DEDUP_TTL_DAYS
    }
    fn default_http_timeout_secs() -> u64 {
        DEFAULT_HTTP_TIMEOUT_SECS
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_days * 24 * 60 * 60)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            dedup_ttl_days: DEFAULT_DEDUP_TTL_DAYS,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

// ============================================================================
// Alert Config
// ============================================================================

/// Operator alert configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Optional endpoint receiving alerts as JSON; alerts are always logged
    #[serde(default)]
    pub webhook_url: Option<String>,
}

// ============================================================================
// Config Loading and Validation
// ============================================================================

/// Configuration loader with environment overrides
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from an explicit path, a default location, or
    /// defaults, then apply process environment overrides.
    pub fn load(path: Option<&str>) -> Result<Config, WagateError> {
        let config = match Self::resolve_config_path(path)? {
            Some(config_path) => Self::load_file(&config_path)?,
            None => {
                tracing::info!("No config file found, using defaults");
                Config::default()
            }
        };
        Self::apply_env(config, |key| std::env::var(key).ok())
    }

    pub fn load_file(path: &PathBuf) -> Result<Config, WagateError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yml::from_str(&content)?)
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    pub fn apply_env<F>(mut config: Config, lookup: F) -> Result<Config, WagateError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(ENV_LISTEN_ADDR) {
            config.server.listen_addr = addr;
        }
        if let Some(root) = lookup(ENV_STORAGE_ROOT) {
            config.storage.root = PathBuf::from(root);
        }
        if let Some(url) = lookup(ENV_WEBHOOK_URL) {
            config.relay.webhook_url = url;
        }
        if let Some(url) = lookup(ENV_BRIDGE_URL) {
            config.transport.bridge_url = url;
        }
        if let Some(mode) = lookup(ENV_RUN_MODE) {
            config.server.env = mode.parse()?;
        }
        if let Some(cert) = lookup(ENV_CERT_FILE).filter(|v| !v.is_empty()) {
            config.server.cert_file = Some(PathBuf::from(cert));
        }
        if let Some(key) = lookup(ENV_CERT_KEY_FILE).filter(|v| !v.is_empty()) {
            config.server.key_file = Some(PathBuf::from(key));
        }
        if let Some(url) = lookup(ENV_ALERT_WEBHOOK_URL) {
            config.alerts.webhook_url = Some(url).filter(|u| !u.is_empty());
        }
        // Unparseable numbers fall back to whatever was already configured.
        if let Some(secs) = lookup(ENV_CONNECTION_TIMEOUT).and_then(|v| v.parse().ok()) {
            config.transport.connection_timeout_secs = secs;
        }
        if let Some(ms) = lookup(ENV_PROBE_INTERVAL).and_then(|v| v.parse().ok()) {
            config.supervisor.probe_interval_ms = ms;
        }
        Ok(config)
    }

    fn resolve_config_path(path: Option<&str>) -> Result<Option<PathBuf>, WagateError> {
        if let Some(p) = path {
            let p = PathBuf::from(p);
            if !p.exists() {
                return Err(WagateError::config_not_found(p.display().to_string()));
            }
            return Ok(Some(p));
        }

        let default_paths = [
            default_wagate_dir().join("config.yaml"),
            PathBuf::from("./wagate.yaml"),
        ];
        Ok(default_paths.into_iter().find(|p| p.exists()))
    }
}

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &Config) -> Result<(), WagateError> {
        let webhook = &config.relay.webhook_url;
        if webhook.is_empty() {
            return Err(WagateError::config_invalid(
                "relay.webhook_url",
                format!("webhook url is required (or set `{}`)", ENV_WEBHOOK_URL),
            ));
        }
        if !webhook.ends_with('/') {
            return Err(WagateError::config_invalid(
                "relay.webhook_url",
                "webhook url must contain trailing slash",
            ));
        }
        if config.supervisor.probe_interval_ms == 0 {
            return Err(WagateError::config_invalid(
                "supervisor.probe_interval_ms",
                "probe interval must be greater than zero",
            ));
        }
        if config.transport.connection_timeout_secs == 0 {
            return Err(WagateError::config_invalid(
                "transport.connection_timeout_secs",
                "connection timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Save configuration to file
    pub fn save(&self, path: &PathBuf) -> Result<(), WagateError> {
        let content = serde_yml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Generate a sample configuration
    pub fn sample() -> Self {
        Config {
            relay: RelayConfig {
                webhook_url: "https://example.com/wagate/webhook/".to_string(),
                ..RelayConfig::default()
            },
            ..Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DomainError, InfraError};
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(config.server.env, RunMode::Prod);
        assert_eq!(config.supervisor.notification_limit, 3);
        assert_eq!(config.relay.dedup_ttl(), Duration::from_secs(30 * 86_400));
        assert!(config.storage.sessions_dir().ends_with("sessions"));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "relay:\n  webhook_url: http://hook/\nsupervisor:\n  probe_interval_ms: 500\n";
        let config: Config = serde_yml::from_str(yaml).unwrap();
        assert_eq!(config.relay.webhook_url, "http://hook/");
        assert_eq!(config.supervisor.probe_interval_ms, 500);
        assert_eq!(config.supervisor.notification_limit, DEFAULT_NOTIFICATION_LIMIT);
        assert_eq!(config.transport.connection_timeout_secs, 20);
    }

    #[test]
    fn test_env_overrides() {
        let config = ConfigLoader::apply_env(
            Config::default(),
            lookup_from(&[
                (ENV_WEBHOOK_URL, "http://hook/"),
                (ENV_RUN_MODE, "dev"),
                (ENV_PROBE_INTERVAL, "1500"),
                (ENV_CONNECTION_TIMEOUT, "not-a-number"),
                (ENV_STORAGE_ROOT, "/var/lib/wagate"),
            ]),
        )
        .unwrap();
        assert_eq!(config.relay.webhook_url, "http://hook/");
        assert_eq!(config.server.env, RunMode::Dev);
        assert_eq!(config.supervisor.probe_interval_ms, 1500);
        assert_eq!(
            config.transport.connection_timeout_secs,
            DEFAULT_CONNECTION_TIMEOUT_SECS
        );
        assert_eq!(config.storage.root, PathBuf::from("/var/lib/wagate"));
    }

    #[test]
    fn test_env_rejects_unknown_mode() {
        let result =
            ConfigLoader::apply_env(Config::default(), lookup_from(&[(ENV_RUN_MODE, "staging")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_validator_requires_trailing_slash() {
        let mut config = Config::sample();
        assert!(ConfigValidator::validate(&config).is_ok());

        config.relay.webhook_url = "http://hook".to_string();
        assert!(ConfigValidator::validate(&config).is_err());

        config.relay.webhook_url = String::new();
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_validator_rejects_zero_probe_interval() {
        let mut config = Config::sample();
        config.supervisor.probe_interval_ms = 0;
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_tls_files_require_both_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "cert").unwrap();

        let config = ConfigLoader::apply_env(
            Config::default(),
            lookup_from(&[
                (ENV_CERT_FILE, cert.to_str().unwrap()),
                (ENV_CERT_KEY_FILE, key.to_str().unwrap()),
            ]),
        )
        .unwrap();
        assert_eq!(config.server.cert_file.as_deref(), Some(cert.as_path()));
        assert!(config.server.tls_files().is_none());

        std::fs::write(&key, "key").unwrap();
        assert_eq!(
            config.server.tls_files(),
            Some((cert.as_path(), key.as_path()))
        );
        assert!(Config::default().server.tls_files().is_none());
    }

    #[test]
    fn test_load_file_errors_are_typed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("wagate.yaml");

        let missing = ConfigLoader::load_file(&path).unwrap_err();
        assert!(matches!(missing, WagateError::Infra(InfraError::Io(_))));

        std::fs::write(&path, "relay: [not, a, map").unwrap();
        let broken = ConfigLoader::load_file(&path).unwrap_err();
        assert!(matches!(broken, WagateError::Infra(InfraError::Yaml(_))));

        let explicit = ConfigLoader::load(Some(path.with_extension("yml").to_str().unwrap()));
        assert!(matches!(
            explicit.unwrap_err(),
            WagateError::Domain(DomainError::ConfigNotFound { .. })
        ));
    }

    #[test]
    fn test_sample_round_trips_through_save() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sample.yaml");
        Config::sample().save(&path).unwrap();

        let loaded = ConfigLoader::load_file(&path).unwrap();
        assert_eq!(loaded.relay.webhook_url, "https://example.com/wagate/webhook/");
        assert!(ConfigValidator::validate(&loaded).is_ok());
    }
}
