//! kb-core: Core abstractions and configuration for k-Bridge
//!
//! This crate provides the session configuration, the per-session identity
//! shared by the forwarders, the error types, and the cluster access traits
//! used by the tunnel, orchestrator and CLI components.

pub mod config;
pub mod error;
pub mod identity;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod traits;
pub mod types;

pub use error::{BridgeError, ClusterError, ConfigError, TunnelError};
pub use identity::SessionIdentity;
pub use traits::{ClusterClient, PortTunnel};
pub use types::{BridgeLabels, RoutingType, SessionId};
