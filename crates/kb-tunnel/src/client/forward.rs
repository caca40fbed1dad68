//! TCP forwards carried by the bridge session
//!
//! Local forwards listen on loopback and open a `direct-tcpip` channel per
//! connection. Remote forwards arrive as `forwarded-tcpip` channels and are
//! connected to a port on this machine.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kb_core::config::RemoteServiceConfig;
use kb_core::TunnelError;

use super::connector::BridgeHandler;

/// Bind the listener for a cluster service on `127.0.0.1:<port>`
///
/// Binding happens before returning so a taken port is reported to the
/// caller instead of inside the accept task.
pub async fn start_local_forward(
    handle: Arc<Handle<BridgeHandler>>,
    remote: RemoteServiceConfig,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, TunnelError> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, remote.port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| TunnelError::Bind {
            addr: addr.to_string(),
            source,
        })?;

    tracing::info!(
        "Forwarding {} -> {}:{}",
        addr,
        remote.hostname,
        remote.port
    );
    Ok(tokio::spawn(accept_local(handle, remote, listener, cancel)))
}

async fn accept_local(
    handle: Arc<Handle<BridgeHandler>>,
    remote: RemoteServiceConfig,
    listener: TcpListener,
    cancel: CancellationToken,
) {
    loop {
        let (socket, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Accept on port {} failed: {}", remote.port, e);
                    break;
                }
            }
        };

        tokio::spawn(carry_local(
            Arc::clone(&handle),
            remote.clone(),
            socket,
            peer,
            cancel.child_token(),
        ));
    }

    tracing::debug!("Local forward on port {} stopped", remote.port);
}

async fn carry_local(
    handle: Arc<Handle<BridgeHandler>>,
    remote: RemoteServiceConfig,
    mut socket: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let channel = match handle
        .channel_open_direct_tcpip(
            remote.hostname.as_str(),
            u32::from(remote.port),
            peer.ip().to_string(),
            u32::from(peer.port()),
        )
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!(
                "Bridge refused a channel to {}:{}: {}",
                remote.hostname,
                remote.port,
                e
            );
            return;
        }
    };

    let mut stream = Box::pin(channel.into_stream());
    tokio::select! {
        _ = cancel.cancelled() => {}
        copied = tokio::io::copy_bidirectional(&mut socket, &mut stream) => {
            if let Err(e) = copied {
                tracing::debug!("Stream to {}:{} ended: {}", remote.hostname, remote.port, e);
            }
        }
    }
}

/// Connect a `forwarded-tcpip` channel to `localhost:<local_port>`
pub async fn connect_forwarded(channel: Channel<Msg>, local_port: u16, cancel: CancellationToken) {
    let mut socket = match TcpStream::connect(("localhost", local_port)).await {
        Ok(socket) => socket,
        Err(e) => {
            tracing::warn!("Nothing accepting on local port {}: {}", local_port, e);
            let _ = channel.close().await;
            return;
        }
    };

    let mut stream = Box::pin(channel.into_stream());
    tokio::select! {
        _ = cancel.cancelled() => {}
        copied = tokio::io::copy_bidirectional(&mut stream, &mut socket) => {
            if let Err(e) = copied {
                tracing::debug!("Stream to local port {} ended: {}", local_port, e);
            }
        }
    }
}
