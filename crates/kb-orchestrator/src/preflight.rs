//! Local checks before a session touches the cluster

use std::net::Ipv4Addr;

use tokio::net::TcpListener;

use kb_core::config::SessionConfig;
use kb_core::{BridgeError, ClusterClient};

/// Verify the local machine can host every forward
///
/// Every remote service port must be free on loopback. Remote services
/// without a Service object are only warned about, since the hostname may
/// resolve to something else inside the cluster.
pub async fn check_environment(
    cluster: &dyn ClusterClient,
    config: &SessionConfig,
) -> Result<(), BridgeError> {
    for remote in &config.remote_services {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, remote.port)).await {
            Ok(listener) => drop(listener),
            Err(source) => {
                return Err(BridgeError::PortInUse {
                    port: remote.port,
                    source,
                })
            }
        }
    }

    for remote in &config.remote_services {
        let name = service_name(&remote.hostname);
        match cluster.get_service(name).await {
            Ok(Some(_)) => {}
            Ok(None) => tracing::warn!(
                "Service {} not found in namespace {}, forwarding {}:{} anyway",
                name,
                cluster.namespace(),
                remote.hostname,
                remote.port
            ),
            Err(e) => tracing::warn!("Could not look up service {}: {}", name, e),
        }
    }

    Ok(())
}

/// First DNS label of a cluster hostname (`db.dev.svc` -> `db`)
fn service_name(hostname: &str) -> &str {
    hostname.split('.').next().unwrap_or(hostname)
}
