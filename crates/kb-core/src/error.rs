//! Core error types for k-Bridge

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for a development session
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A local port needed by a forward is already taken
    #[error("Local port {port} is already in use: {source}")]
    PortInUse {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Cluster API error
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Tunnel error
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Session key pair could not be generated
    #[error("Failed to generate session key: {0}")]
    KeyGeneration(String),

    /// A forwarder task panicked or was aborted
    #[error("Task {0} ended abnormally")]
    TaskAborted(&'static str),

    /// The session was already started or stopped
    #[error("Session already {0}")]
    Lifecycle(&'static str),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a [`ClusterClient`](crate::traits::ClusterClient)
#[derive(Error, Debug)]
pub enum ClusterError {
    /// The API server rejected or failed the request
    #[error("{action} failed: {source}")]
    Api {
        action: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A named object does not exist
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// A bounded wait expired
    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    /// Backup payload could not be encoded or decoded
    #[error("Invalid backup payload: {0}")]
    Backup(#[from] serde_json::Error),
}

impl ClusterError {
    /// Wrap an API failure with the action that caused it
    pub fn api(
        action: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Api {
            action: action.into(),
            source: source.into(),
        }
    }
}

/// Tunnel and forwarding errors
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The bridge pod did not become ready in time
    #[error("Bridge pod {pod} not ready after {timeout:?}")]
    BridgeNotReady { pod: String, timeout: Duration },

    /// The bridge pod never printed its user marker
    #[error("Bridge pod {pod} did not report its user after {attempts} attempts")]
    UserMarkerMissing { pod: String, attempts: u32 },

    /// Authentication was rejected by the bridge
    #[error("Authentication rejected for user {user}")]
    AuthRejected { user: String },

    /// Authentication did not finish in time
    #[error("Authentication timed out after {0:?}")]
    AuthTimeout(Duration),

    /// SSH protocol or transport error
    #[error("SSH error: {0}")]
    Ssh(String),

    /// A forward listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
