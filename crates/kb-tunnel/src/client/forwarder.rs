//! Client forwarder
//!
//! Waits for the bridge user, then keeps an SSH session to the bridge alive
//! with every local and remote forward, reconnecting whenever it drops.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use russh::client::Handle;
use russh::Disconnect;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kb_core::config::SessionConfig;
use kb_core::{BridgeError, SessionIdentity, TunnelError};

use super::connector::{BridgeHandler, SshConnector};
use super::forward::start_local_forward;
use crate::reconnect::Backoff;

/// Counters exposed for observation
#[derive(Debug, Default)]
pub struct ClientStats {
    /// SSH connection attempts, successful or not
    pub connect_attempts: AtomicU32,
    /// Sessions that got all their forwards up
    pub sessions_established: AtomicU32,
}

impl ClientStats {
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn sessions_established(&self) -> u32 {
        self.sessions_established.load(Ordering::SeqCst)
    }
}

/// Why a session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Cancelled,
    Closed,
    Expired,
}

/// Supervises the developer-machine end of a session
pub struct ClientForwarder {
    identity: Arc<SessionIdentity>,
    config: Arc<SessionConfig>,
    stats: Arc<ClientStats>,
}

impl ClientForwarder {
    pub fn new(identity: Arc<SessionIdentity>, config: Arc<SessionConfig>) -> Self {
        Self {
            identity,
            config,
            stats: Arc::new(ClientStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ClientStats> {
        Arc::clone(&self.stats)
    }

    /// Run until cancelled
    ///
    /// Connection failures are retried after the reconnect delay and never
    /// end the task.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), BridgeError> {
        let user = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            user = self.identity.wait_for_remote_user() => user,
        };
        tracing::debug!("Bridge user known: {}", user);

        let mut backoff = Backoff::from_config(&self.config.timing.backoff);
        loop {
            match self.run_session(&user, &cancel).await {
                Ok(SessionEnd::Cancelled) => return Ok(()),
                Ok(SessionEnd::Closed) => {
                    tracing::info!("SSH session to bridge closed");
                    backoff.reset();
                }
                Ok(SessionEnd::Expired) => {
                    tracing::info!("SSH session to bridge reached its lifetime");
                    backoff.reset();
                }
                Err(e) => tracing::warn!("SSH session to bridge failed: {}", e),
            }

            if cancel.is_cancelled() {
                return Ok(());
            }
            let delay = backoff.next_delay();
            tracing::info!("Reconnecting to bridge in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_session(
        &self,
        user: &str,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, BridgeError> {
        let port = self.identity.get_or_assign_ssh_port()?;
        let connector = SshConnector::new(
            SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            user,
            self.identity.key_pair(),
            self.config.remote_password.clone(),
            self.config.timing.auth_timeout,
        );

        let targets: HashMap<u32, u16> = self
            .config
            .local_services
            .iter()
            .map(|local| (u32::from(local.port), local.port))
            .collect();
        let (handler, closed) = BridgeHandler::new(targets);

        self.stats.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            connected = connector.connect(handler) => connected?,
        };
        tracing::info!("SSH session to bridge at {} established", connector.addr());

        let forwards = cancel.child_token();
        let result = self.serve(handle, &closed, &forwards, cancel).await;
        forwards.cancel();
        result
    }

    async fn serve(
        &self,
        mut handle: Handle<BridgeHandler>,
        closed: &CancellationToken,
        forwards: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, BridgeError> {
        for local in &self.config.local_services {
            if let Err(e) = handle.tcpip_forward("0.0.0.0", u32::from(local.port)).await {
                disconnect(&handle, "forward refused").await;
                return Err(TunnelError::Ssh(format!(
                    "Remote forward of port {} for {} refused: {}",
                    local.port, local.service_name, e
                ))
                .into());
            }
            tracing::info!(
                "Forwarding bridge port {} -> localhost:{} ({})",
                local.port,
                local.port,
                local.service_name
            );
        }

        let handle = Arc::new(handle);
        let mut listeners: Vec<JoinHandle<()>> = Vec::new();
        for remote in &self.config.remote_services {
            match start_local_forward(Arc::clone(&handle), remote.clone(), forwards.clone()).await
            {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    forwards.cancel();
                    disconnect(&handle, "forward failed").await;
                    return Err(e.into());
                }
            }
        }
        self.stats.sessions_established.fetch_add(1, Ordering::SeqCst);

        let end = tokio::select! {
            _ = cancel.cancelled() => SessionEnd::Cancelled,
            _ = closed.cancelled() => SessionEnd::Closed,
            _ = tokio::time::sleep(self.config.timing.session_lifetime) => SessionEnd::Expired,
        };

        forwards.cancel();
        for listener in listeners {
            let _ = listener.await;
        }
        disconnect(&handle, "session ended").await;
        Ok(end)
    }
}

async fn disconnect(handle: &Handle<BridgeHandler>, reason: &str) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, reason, "en")
        .await
    {
        tracing::debug!("Disconnect from bridge failed: {}", e);
    }
}
