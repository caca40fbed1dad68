//! SSH connection to the bridge
//!
//! Connects through the local end of the bridge tunnel and authenticates
//! with the session key, falling back to a password when one is configured.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle, Msg, Session};
use russh::Channel;
use russh_keys::key::{KeyPair, PublicKey};
use tokio_util::sync::{CancellationToken, DropGuard};

use kb_core::TunnelError;

use super::forward::connect_forwarded;

/// Opens authenticated SSH sessions to the bridge
pub struct SshConnector {
    /// Local end of the bridge tunnel
    addr: SocketAddr,
    /// Bridge user
    user: String,
    /// Session key
    key: Arc<KeyPair>,
    /// Tried when the key is rejected
    password: Option<String>,
    /// Bound on connect + authentication
    timeout: Duration,
}

impl SshConnector {
    pub fn new(
        addr: SocketAddr,
        user: impl Into<String>,
        key: Arc<KeyPair>,
        password: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            addr,
            user: user.into(),
            key,
            password,
            timeout,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connect and authenticate within the configured bound
    pub async fn connect(
        &self,
        handler: BridgeHandler,
    ) -> Result<Handle<BridgeHandler>, TunnelError> {
        tokio::time::timeout(self.timeout, self.try_connect(handler))
            .await
            .map_err(|_| TunnelError::AuthTimeout(self.timeout))?
    }

    async fn try_connect(
        &self,
        handler: BridgeHandler,
    ) -> Result<Handle<BridgeHandler>, TunnelError> {
        let ssh_config = Arc::new(Config::default());

        tracing::debug!("Connecting to bridge at {}", self.addr);
        let mut session = client::connect(ssh_config, self.addr, handler)
            .await
            .map_err(|e| TunnelError::Ssh(format!("Failed to connect to {}: {}", self.addr, e)))?;

        tracing::debug!("Authenticating as user '{}'", self.user);
        let mut authenticated = session
            .authenticate_publickey(&self.user, Arc::clone(&self.key))
            .await
            .map_err(|e| TunnelError::Ssh(format!("Authentication error: {}", e)))?;

        if !authenticated {
            if let Some(password) = &self.password {
                tracing::debug!("Key rejected for '{}', trying password", self.user);
                authenticated = session
                    .authenticate_password(&self.user, password)
                    .await
                    .map_err(|e| TunnelError::Ssh(format!("Authentication error: {}", e)))?;
            }
        }

        if !authenticated {
            return Err(TunnelError::AuthRejected {
                user: self.user.clone(),
            });
        }

        tracing::debug!("Authenticated to bridge as '{}'", self.user);
        Ok(session)
    }
}

/// SSH client handler for the bridge session
///
/// Routes `forwarded-tcpip` channels opened by the bridge to the matching
/// local port. Dropping the handler, which russh does when the session ends,
/// cancels the token handed out by [`BridgeHandler::new`].
pub struct BridgeHandler {
    /// Remote-forward port on the bridge -> local port
    targets: HashMap<u32, u16>,
    /// Cancels the forwarded connections when the session ends
    _closed: DropGuard,
    /// Observed by the forwarded connections
    closed: CancellationToken,
}

impl BridgeHandler {
    /// Create a handler and the token cancelled when its session ends
    pub fn new(targets: HashMap<u32, u16>) -> (Self, CancellationToken) {
        let closed = CancellationToken::new();
        let handler = Self {
            targets,
            _closed: closed.clone().drop_guard(),
            closed: closed.clone(),
        };
        (handler, closed)
    }
}

#[async_trait]
impl client::Handler for BridgeHandler {
    type Error = anyhow::Error;

    /// The bridge host key is generated per pod and only reachable through
    /// the API server's port-forward, so any key is accepted.
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Bridge host key: {}", server_public_key.fingerprint());
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(&local_port) = self.targets.get(&connected_port) else {
            tracing::warn!(
                "Bridge opened a forward for unrequested {}:{}",
                connected_address,
                connected_port
            );
            return Ok(());
        };

        tracing::debug!(
            "Forwarded connection from {}:{} to local port {}",
            originator_address,
            originator_port,
            local_port
        );
        tokio::spawn(connect_forwarded(
            channel,
            local_port,
            self.closed.child_token(),
        ));
        Ok(())
    }
}
