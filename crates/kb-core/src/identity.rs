//! Per-session derived identity
//!
//! Holds the state both forwarders share: the local port of the bridge
//! tunnel, the user the bridge runs as, and the key pair the client
//! authenticates with. The port and the user are single-assignment; the key
//! pair is generated once when the identity is built.

use std::net::{Ipv4Addr, TcpListener};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use russh_keys::key::KeyPair;
use russh_keys::PublicKeyBase64;
use tokio::sync::watch;

use crate::error::BridgeError;
use crate::types::{BridgeLabels, SessionId};

/// Unassigned port marker
const NO_PORT: u16 = 0;

/// Shared identity of one running session
pub struct SessionIdentity {
    /// Random id embedded in selectors
    session_id: SessionId,
    /// Port from the session config, if fixed
    configured_port: Option<u16>,
    /// Resolved tunnel port, `NO_PORT` until first use
    ssh_port: AtomicU16,
    /// Bridge user, `None` until discovered
    remote_user: watch::Sender<Option<String>>,
    /// Client key pair
    key_pair: Arc<KeyPair>,
    /// `"<algorithm> <base64>"` line for the bridge's authorized keys
    public_key_line: String,
}

impl SessionIdentity {
    /// Create a fresh identity with a new session id and key pair
    pub fn new(configured_port: Option<u16>) -> Result<Self, BridgeError> {
        let key_pair = KeyPair::generate_ed25519()
            .ok_or_else(|| BridgeError::KeyGeneration("ed25519 generation failed".to_string()))?;
        let public = key_pair
            .clone_public_key()
            .map_err(|e| BridgeError::KeyGeneration(e.to_string()))?;
        let public_key_line = format!("{} {}", public.name(), public.public_key_base64());

        let (remote_user, _) = watch::channel(None);

        Ok(Self {
            session_id: SessionId::new(),
            configured_port,
            ssh_port: AtomicU16::new(configured_port.unwrap_or(NO_PORT)),
            remote_user,
            key_pair: Arc::new(key_pair),
            public_key_line,
        })
    }

    /// Session id
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Selector labels of this session's bridge pod
    pub fn labels(&self, app: &str, group: &str) -> BridgeLabels {
        BridgeLabels {
            app: app.to_string(),
            group: group.to_string(),
            session_id: self.session_id,
        }
    }

    /// Return the tunnel port, allocating a free one on first use
    ///
    /// Concurrent callers all observe the port of whichever caller won.
    pub fn get_or_assign_ssh_port(&self) -> std::io::Result<u16> {
        let current = self.ssh_port.load(Ordering::Acquire);
        if current != NO_PORT {
            return Ok(current);
        }

        let candidate = free_port()?;
        match self.ssh_port.compare_exchange(
            NO_PORT,
            candidate,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                tracing::debug!("Assigned local SSH port {}", candidate);
                Ok(candidate)
            }
            Err(winner) => Ok(winner),
        }
    }

    /// The tunnel port if it has been resolved
    pub fn ssh_port(&self) -> Option<u16> {
        match self.ssh_port.load(Ordering::Acquire) {
            NO_PORT => None,
            port => Some(port),
        }
    }

    /// The bridge user if it has been discovered
    pub fn remote_user(&self) -> Option<String> {
        self.remote_user.borrow().clone()
    }

    /// Record the bridge user; only the first non-empty value is kept
    ///
    /// Returns `true` if this call assigned the user.
    pub fn set_remote_user(&self, user: impl Into<String>) -> bool {
        let user = user.into();
        if user.is_empty() {
            return false;
        }
        self.remote_user.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(user);
            true
        })
    }

    /// Wait until the bridge user is known
    pub async fn wait_for_remote_user(&self) -> String {
        let mut rx = self.remote_user.subscribe();
        let user = match rx.wait_for(Option::is_some).await {
            Ok(user) => user.clone(),
            Err(_) => None,
        };
        match user {
            Some(user) => user,
            // The sender lives as long as `self`; a closed channel never resolves.
            None => std::future::pending().await,
        }
    }

    /// Clear the port and the user; only call with no forwarder running
    pub fn reset(&self) {
        self.ssh_port
            .store(self.configured_port.unwrap_or(NO_PORT), Ordering::Release);
        self.remote_user.send_replace(None);
    }

    /// Client key pair
    pub fn key_pair(&self) -> Arc<KeyPair> {
        Arc::clone(&self.key_pair)
    }

    /// Public key in authorized-keys format
    pub fn public_key_line(&self) -> &str {
        &self.public_key_line
    }
}

/// Ask the OS for a port that is free on all interfaces
fn free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    Ok(listener.local_addr()?.port())
}
