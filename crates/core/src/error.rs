//! wagate error types
//!
//! `DomainError` covers what the operator can fix (config, stored sessions,
//! startup), `InfraError` wraps failures of the filesystem and the YAML codec,
//! and `WagateError` is what the binary returns.

use std::fmt;

#[derive(Debug)]
pub enum DomainError {
    /// An explicitly requested config file does not exist
    ConfigNotFound { path: String },
    /// A config value failed validation
    ConfigInvalid { field: String, reason: String },
    /// A stored-session command failed
    Session { operation: String, reason: String },
    /// A component could not be started
    Startup { component: String, reason: String },
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigNotFound { path } => write!(f, "no config file at {}", path),
            Self::ConfigInvalid { field, reason } => write!(f, "invalid `{}`: {}", field, reason),
            Self::Session { operation, reason } => {
                write!(f, "session {} failed: {}", operation, reason)
            }
            Self::Startup { component, reason } => {
                write!(f, "could not start {}: {}", component, reason)
            }
        }
    }
}

impl std::error::Error for DomainError {}

#[derive(Debug)]
pub enum InfraError {
    Io(std::io::Error),
    Yaml(serde_yml::Error),
}

impl fmt::Display for InfraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {}", err),
            Self::Yaml(err) => write!(f, "yaml: {}", err),
        }
    }
}

impl std::error::Error for InfraError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Yaml(e) => Some(e),
        }
    }
}

#[derive(Debug)]
pub enum WagateError {
    Domain(DomainError),
    Infra(InfraError),
}

impl fmt::Display for WagateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain(e) => e.fmt(f),
            Self::Infra(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for WagateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Domain(e) => Some(e),
            Self::Infra(e) => Some(e),
        }
    }
}

impl From<DomainError> for WagateError {
    fn from(err: DomainError) -> Self {
        Self::Domain(err)
    }
}

impl From<std::io::Error> for WagateError {
    fn from(err: std::io::Error) -> Self {
        Self::Infra(InfraError::Io(err))
    }
}

impl From<serde_yml::Error> for WagateError {
    fn from(err: serde_yml::Error) -> Self {
        Self::Infra(InfraError::Yaml(err))
    }
}

impl WagateError {
    pub fn config_not_found(path: impl Into<String>) -> Self {
        DomainError::ConfigNotFound { path: path.into() }.into()
    }

    pub fn config_invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        DomainError::ConfigInvalid {
            field: field.into(),
            reason: reason.into(),
        }
        .into()
    }

    pub fn session(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        DomainError::Session {
            operation: operation.into(),
            reason: reason.into(),
        }
        .into()
    }

    /// Startup failures are the only errors that terminate the process.
    pub fn startup(component: impl Into<String>, reason: impl Into<String>) -> Self {
        DomainError::Startup {
            component: component.into(),
            reason: reason.into(),
        }
        .into()
    }
}
