use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
const MAX_SESSION_ID_LENGTH: usize = 128;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
    #[error("session not found: {0}")]
    NotFound(String),
}

impl SessionError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Opaque transport credentials produced by a login and consumed by a restore.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportState(pub serde_json::Value);

impl TransportState {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_null()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    #[serde(default)]
    pub transport_state: TransportState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, transport_state: TransportState) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            transport_state,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the stored credentials with the ones returned by the transport.
    pub fn refresh_state(&mut self, transport_state: TransportState) {
        self.transport_state = transport_state;
        self.updated_at = Utc::now();
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (created: {}, updated: {})",
            self.session_id,
            self.created_at.format("%Y-%m-%d %H:%M:%S"),
            self.updated_at.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// Durable storage of sessions keyed by session id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn read_session(&self, session_id: &str) -> Result<Session, SessionError>;
    async fn write_session(&self, session: &Session) -> Result<(), SessionError>;
    async fn list_session_ids(&self) -> Result<Vec<String>, SessionError>;
    /// Removing an absent session is not an error.
    async fn remove_session(&self, session_id: &str) -> Result<(), SessionError>;
}

/// One JSON file per session under a single directory.
pub struct FileSessionStore {
    session_dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(session_dir: PathBuf) -> Result<Self, SessionError> {
        if !session_dir.exists() {
            std::fs::create_dir_all(&session_dir)?;
        }
        let session_dir = std::fs::canonicalize(session_dir)?;
        Ok(Self { session_dir })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    fn session_file_path(&self, id: &str) -> Result<PathBuf, SessionError> {
        validate_session_id(id)?;
        let path = self.session_dir.join(format!("{}.json", id));
        if !path.starts_with(&self.session_dir) {
            return Err(SessionError::InvalidSessionId(
                "resolved path escapes session directory".to_string(),
            ));
        }
        let parent = path.parent().ok_or_else(|| {
            SessionError::InvalidSessionId("failed to resolve session file parent".to_string())
        })?;
        if parent != self.session_dir {
            return Err(SessionError::InvalidSessionId(
                "session id cannot include path separators".to_string(),
            ));
        }
        Ok(path)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn read_session(&self, session_id: &str) -> Result<Session, SessionError> {
        let path = self.session_file_path(session_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::NotFound(session_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    async fn write_session(&self, session: &Session) -> Result<(), SessionError> {
        let path = self.session_file_path(&session.session_id)?;
        let content = serde_json::to_string_pretty(session)?;
        // Atomic replace.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(session_id = %session.session_id, "session written");
        Ok(())
    }

    async fn list_session_ids(&self) -> Result<Vec<String>, SessionError> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.session_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    sessions.push(stem.to_string());
                }
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    async fn remove_session(&self, session_id: &str) -> Result<(), SessionError> {
        let path = self.session_file_path(session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(session_id = %session_id, "session removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Check that a session id is safe to use as a file name.
pub fn validate_session_id(id: &str) -> Result<(), SessionError> {
    if id.trim().is_empty() {
        return Err(SessionError::InvalidSessionId(
            "session id cannot be empty".to_string(),
        ));
    }
    if id.len() > MAX_SESSION_ID_LENGTH {
        return Err(SessionError::InvalidSessionId(format!(
            "session id too long (max {})",
            MAX_SESSION_ID_LENGTH
        )));
    }
    if id == "." || id == ".." || id.contains("..") {
        return Err(SessionError::InvalidSessionId(
            "session id cannot contain path traversal sequence".to_string(),
        ));
    }
    if id.contains('/') || id.contains('\\') {
        return Err(SessionError::InvalidSessionId(
            "session id cannot contain path separators".to_string(),
        ));
    }
    if !id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | ':'))
    {
        return Err(SessionError::InvalidSessionId(
            "session id contains unsupported characters".to_string(),
        ));
    }
    Ok(())
}
