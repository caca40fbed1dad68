//! Cluster access traits

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};

use crate::error::ClusterError;

/// The slice of the Kubernetes API a development session needs
///
/// All calls are scoped to one namespace. Implementations must be safe to
/// share between the swap manager and both forwarders.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Namespace every call operates in
    fn namespace(&self) -> &str;

    /// Get a Service by name, `None` if it does not exist
    async fn get_service(&self, name: &str) -> Result<Option<Service>, ClusterError>;

    /// Create the Service, or replace the live one with the same name
    async fn create_or_replace_service(&self, service: &Service) -> Result<Service, ClusterError>;

    /// Delete a Service by name; deleting a missing Service is not an error
    async fn delete_service(&self, name: &str) -> Result<(), ClusterError>;

    /// Create a Pod
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError>;

    /// Delete a Pod by name; deleting a missing Pod is not an error
    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError>;

    /// Pods matching a label selector (`k=v,k=v`)
    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError>;

    /// Wait until the Pod reports Ready, failing after `timeout`
    async fn wait_pod_ready(&self, name: &str, timeout: Duration) -> Result<(), ClusterError>;

    /// Current log of the Pod's container
    async fn pod_logs(&self, name: &str) -> Result<String, ClusterError>;

    /// Listen on `bind` and carry every accepted connection to `pod_port`
    async fn open_tunnel(
        &self,
        pod: &str,
        bind: SocketAddr,
        pod_port: u16,
    ) -> Result<Box<dyn PortTunnel>, ClusterError>;
}

/// A running local-port to pod-port tunnel
pub trait PortTunnel: Send + Sync {
    /// Address the tunnel listens on
    fn local_addr(&self) -> SocketAddr;

    /// Whether the tunnel still accepts connections
    fn is_alive(&self) -> bool;

    /// Whether any forwarded stream reported an error
    fn error_occurred(&self) -> bool;

    /// Most recent error, if any
    fn last_error(&self) -> Option<String>;

    /// Stop listening and drop forwarded streams
    fn close(&self);
}
