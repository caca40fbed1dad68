//! Bridge forwarder
//!
//! Deploys the bridge pod, waits for it, learns the container user from its
//! log, then keeps a local tunnel to the pod's SSH port open until cancelled.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use kb_core::config::SessionConfig;
use kb_core::traits::{ClusterClient, PortTunnel};
use kb_core::{BridgeError, ClusterError, SessionIdentity, TunnelError};

use super::pod::{bridge_pod, bridge_pod_name};

/// Counters exposed for observation
#[derive(Debug, Default)]
pub struct BridgeStats {
    /// Tunnels opened to the bridge pod, including restarts
    pub tunnel_opens: AtomicU32,
    /// Tunnels torn down because they died or reported an error
    pub tunnel_restarts: AtomicU32,
}

impl BridgeStats {
    pub fn tunnel_opens(&self) -> u32 {
        self.tunnel_opens.load(Ordering::SeqCst)
    }

    pub fn tunnel_restarts(&self) -> u32 {
        self.tunnel_restarts.load(Ordering::SeqCst)
    }
}

/// How a supervised tunnel ended
enum TunnelExit {
    Cancelled,
    Unhealthy,
}

/// Supervises the cluster end of a session
pub struct BridgeForwarder {
    cluster: Arc<dyn ClusterClient>,
    identity: Arc<SessionIdentity>,
    config: Arc<SessionConfig>,
    stats: Arc<BridgeStats>,
}

impl BridgeForwarder {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        identity: Arc<SessionIdentity>,
        config: Arc<SessionConfig>,
    ) -> Self {
        Self {
            cluster,
            identity,
            config,
            stats: Arc::new(BridgeStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.stats)
    }

    /// Run until cancelled or until the bridge fails to come up
    ///
    /// The bridge pod is deleted on the way out, whatever the outcome.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), BridgeError> {
        let pod = bridge_pod(&self.config, &self.identity);
        let pod_name = bridge_pod_name(&self.config, &self.identity);

        tracing::info!(
            "Deploying bridge pod {} in namespace {}",
            pod_name,
            self.cluster.namespace()
        );
        self.cluster.create_pod(&pod).await?;

        let result = self.supervise(&pod_name, &cancel).await;

        if let Err(e) = self.cluster.delete_pod(&pod_name).await {
            tracing::warn!("Failed to delete bridge pod {}: {}", pod_name, e);
        } else {
            tracing::debug!("Deleted bridge pod {}", pod_name);
        }

        result
    }

    async fn supervise(&self, pod: &str, cancel: &CancellationToken) -> Result<(), BridgeError> {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            ready = self.wait_ready(pod) => ready?,
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            user = self.discover_user(pod) => user?,
        }

        self.keep_tunnel_open(pod, cancel).await
    }

    async fn wait_ready(&self, pod: &str) -> Result<(), BridgeError> {
        let timeout = self.config.timing.pod_ready_timeout;
        tracing::debug!("Waiting up to {:?} for bridge pod {}", timeout, pod);

        match self.cluster.wait_pod_ready(pod, timeout).await {
            Ok(()) => {
                tracing::info!("Bridge pod {} is ready", pod);
                Ok(())
            }
            Err(ClusterError::Timeout { .. }) => Err(TunnelError::BridgeNotReady {
                pod: pod.to_string(),
                timeout,
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Poll the pod log for the user marker
    ///
    /// Every read counts against the attempt budget, including failed ones.
    async fn discover_user(&self, pod: &str) -> Result<(), BridgeError> {
        let timing = &self.config.timing;
        let attempts = timing.user_marker_attempts.max(1);

        for attempt in 1..=attempts {
            match self.cluster.pod_logs(pod).await {
                Ok(log) => {
                    if let Some(user) = self.config.bridge.parse_user(&log) {
                        if self.identity.set_remote_user(user.clone()) {
                            tracing::info!("Bridge pod {} runs as user {}", pod, user);
                        } else {
                            tracing::debug!(
                                "Bridge pod {} reports user {}, keeping the configured one",
                                pod,
                                user
                            );
                        }
                        return Ok(());
                    }
                    tracing::trace!("No user marker in log of {} (attempt {})", pod, attempt);
                }
                Err(e) => {
                    tracing::debug!("Reading log of {} failed (attempt {}): {}", pod, attempt, e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(timing.user_marker_interval).await;
            }
        }

        if let Some(user) = self.identity.remote_user() {
            tracing::warn!(
                "Bridge pod {} never reported its user, continuing as {}",
                pod,
                user
            );
            return Ok(());
        }

        Err(TunnelError::UserMarkerMissing {
            pod: pod.to_string(),
            attempts,
        }
        .into())
    }

    async fn keep_tunnel_open(
        &self,
        pod: &str,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        let port = self.identity.get_or_assign_ssh_port()?;
        let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let pod_port = self.config.bridge.ssh_container_port;
        let interval = self.config.timing.tunnel_health_interval;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let tunnel = match self.cluster.open_tunnel(pod, bind, pod_port).await {
                Ok(tunnel) => tunnel,
                Err(e) => {
                    tracing::warn!(
                        "Failed to open tunnel {} -> {}:{}: {}. Retrying in {:?}",
                        bind,
                        pod,
                        pod_port,
                        e,
                        interval
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(interval) => continue,
                    }
                }
            };
            self.stats.tunnel_opens.fetch_add(1, Ordering::SeqCst);
            tracing::info!(
                "Tunnel {} -> {}:{} open",
                tunnel.local_addr(),
                pod,
                pod_port
            );

            let exit = watch_tunnel(tunnel.as_ref(), interval, cancel).await;
            tunnel.close();

            match exit {
                TunnelExit::Cancelled => {
                    tracing::debug!("Tunnel to {} closed", pod);
                    return Ok(());
                }
                TunnelExit::Unhealthy => {
                    self.stats.tunnel_restarts.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }
}

async fn watch_tunnel(
    tunnel: &dyn PortTunnel,
    interval: std::time::Duration,
    cancel: &CancellationToken,
) -> TunnelExit {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return TunnelExit::Cancelled,
            _ = tokio::time::sleep(interval) => {}
        }

        if tunnel.error_occurred() {
            tracing::warn!(
                "Tunnel error: {}. Restarting tunnel",
                tunnel.last_error().unwrap_or_default()
            );
            return TunnelExit::Unhealthy;
        }
        if !tunnel.is_alive() {
            tracing::warn!("Tunnel died. Restarting tunnel");
            return TunnelExit::Unhealthy;
        }
    }
}
