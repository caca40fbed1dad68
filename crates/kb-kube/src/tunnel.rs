//! Local listener forwarding into a pod port
//!
//! Every accepted connection gets its own port-forward stream over the API
//! server's websocket endpoint, the way `kubectl port-forward` works.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use kb_core::traits::PortTunnel;

/// Health shared between the tunnel handle and its tasks
#[derive(Debug)]
struct TunnelHealth {
    alive: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl TunnelHealth {
    fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            last_error: Mutex::new(None),
        }
    }

    fn record_error(&self, error: String) {
        tracing::debug!("Tunnel error: {}", error);
        let mut last = self.last_error.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(error);
    }

    fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// A listening tunnel from a local address to one pod port
pub struct KubePortTunnel {
    addr: SocketAddr,
    health: Arc<TunnelHealth>,
    cancel: CancellationToken,
}

impl KubePortTunnel {
    /// Bind `bind` and start forwarding accepted connections to `pod_port`
    pub async fn open(
        pods: Api<Pod>,
        pod: &str,
        bind: SocketAddr,
        pod_port: u16,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        let health = Arc::new(TunnelHealth::new());
        let cancel = CancellationToken::new();

        tracing::debug!("Tunnel {} -> {}:{} listening", addr, pod, pod_port);
        tokio::spawn(accept_loop(
            pods,
            pod.to_string(),
            pod_port,
            listener,
            Arc::clone(&health),
            cancel.clone(),
        ));

        Ok(Self {
            addr,
            health,
            cancel,
        })
    }
}

impl PortTunnel for KubePortTunnel {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn is_alive(&self) -> bool {
        self.health.alive.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    fn error_occurred(&self) -> bool {
        self.health.last_error().is_some()
    }

    fn last_error(&self) -> Option<String> {
        self.health.last_error()
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for KubePortTunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    pods: Api<Pod>,
    pod: String,
    pod_port: u16,
    listener: TcpListener,
    health: Arc<TunnelHealth>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    tracing::trace!("Tunnel connection from {}", peer);
                    tokio::spawn(forward_connection(
                        pods.clone(),
                        pod.clone(),
                        pod_port,
                        socket,
                        Arc::clone(&health),
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    health.record_error(format!("accept failed: {}", e));
                    break;
                }
            }
        }
    }

    health.alive.store(false, Ordering::SeqCst);
}

async fn forward_connection(
    pods: Api<Pod>,
    pod: String,
    pod_port: u16,
    mut socket: TcpStream,
    health: Arc<TunnelHealth>,
    cancel: CancellationToken,
) {
    let mut forwarder = match pods.portforward(&pod, &[pod_port]).await {
        Ok(forwarder) => forwarder,
        Err(e) => {
            health.record_error(format!("port-forward to {}:{} failed: {}", pod, pod_port, e));
            return;
        }
    };

    let Some(mut upstream) = forwarder.take_stream(pod_port) else {
        health.record_error(format!("port-forward to {}:{} has no stream", pod, pod_port));
        return;
    };
    let upstream_error = forwarder.take_error(pod_port);

    tokio::select! {
        _ = cancel.cancelled() => {}
        copied = tokio::io::copy_bidirectional(&mut socket, &mut upstream) => {
            if let Err(e) = copied {
                // Resets from either peer end the stream but not the tunnel
                tracing::debug!("Tunnel stream to {}:{} ended: {}", pod, pod_port, e);
            }
        }
        Some(message) = async move {
            match upstream_error {
                Some(error) => error.await,
                None => std::future::pending().await,
            }
        } => {
            health.record_error(format!("{}:{}: {}", pod, pod_port, message));
        }
    }

    drop(upstream);
    forwarder.abort();
}
