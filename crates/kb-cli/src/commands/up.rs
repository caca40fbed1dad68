//! `k-bridge up`: run a session until it ends or is interrupted

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use kb_core::ClusterClient;
use kb_kube::KubeClusterClient;
use kb_orchestrator::SessionOrchestrator;

use super::config::{load_session, resolve_path};
use crate::output::{format_duration, format_forwards, print_info, print_success, print_warning};

/// Extra time on top of the stop grace for the final cluster cleanup
const CLEANUP_SLACK: Duration = Duration::from_secs(5);

pub async fn up_command(config_path: Option<&PathBuf>, namespace: Option<String>) -> Result<()> {
    let path = resolve_path(config_path);
    let mut session_config = load_session(&path)?;
    if namespace.is_some() {
        session_config.namespace = namespace;
    }

    let cluster = KubeClusterClient::try_default(session_config.namespace.clone())
        .await
        .context("Failed to connect to the cluster")?;
    let namespace = cluster.namespace().to_string();

    println!("{}", format_forwards(&session_config));
    let grace = session_config.timing.stop_grace;
    let lifetime = session_config.timing.session_lifetime;

    let session = SessionOrchestrator::new(Arc::new(cluster), session_config)?;
    let mut completion = session.start().await?;
    print_success(&format!(
        "Session {} running in namespace {} (SSH sessions renewed every {})",
        session.identity().session_id().short(),
        namespace,
        format_duration(lifetime)
    ));
    print_info("Press Ctrl+C to stop");

    let settled = tokio::select! {
        result = &mut completion => Some(result),
        _ = shutdown_signal() => None,
    };

    print_info("Stopping session and restoring services...");
    session.stop().await;

    let result = match settled {
        Some(result) => result,
        None => tokio::time::timeout(grace + CLEANUP_SLACK, completion)
            .await
            .unwrap_or(Ok(())),
    };
    if tokio::time::timeout(grace + CLEANUP_SLACK, session.drained())
        .await
        .is_err()
    {
        print_warning(
            "Forwarders did not finish cleaning up; run 'k-bridge restore' if services look wrong",
        );
    }

    result?;
    print_success("Session ended");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, stopping..."),
        _ = terminate => tracing::info!("Received SIGTERM, stopping..."),
    }
}
