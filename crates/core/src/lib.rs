pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{
    AlertConfig, Config, ConfigLoader, ConfigValidator, RelayConfig, RunMode, ServerConfig,
    StorageConfig, SupervisorConfig, TransportConfig,
};
pub use error::{DomainError, InfraError, WagateError};
