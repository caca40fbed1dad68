//! Bridge forwarder tests against the in-memory cluster

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use kb_core::config::{LocalServiceConfig, SessionConfig};
use kb_core::testing::MemoryCluster;
use kb_core::types::RoutingType;
use kb_core::{BridgeError, SessionIdentity, TunnelError};
use kb_tunnel::BridgeForwarder;

const MARKER_LOG: &str = "Starting sshd\nCurrent container user is: developer\n";

fn test_config() -> SessionConfig {
    let mut config = SessionConfig {
        local_services: vec![LocalServiceConfig::new("web", RoutingType::ClusterIP, 8080)],
        ..Default::default()
    };
    config.timing.pod_ready_timeout = Duration::from_millis(50);
    config.timing.user_marker_attempts = 3;
    config.timing.user_marker_interval = Duration::from_millis(10);
    config.timing.tunnel_health_interval = Duration::from_millis(10);
    config
}

struct Fixture {
    cluster: Arc<MemoryCluster>,
    identity: Arc<SessionIdentity>,
    forwarder: BridgeForwarder,
}

fn fixture(config: SessionConfig) -> Fixture {
    let cluster = Arc::new(MemoryCluster::new("dev"));
    let identity = Arc::new(SessionIdentity::new(None).unwrap());
    let forwarder = BridgeForwarder::new(cluster.clone(), identity.clone(), Arc::new(config));
    Fixture {
        cluster,
        identity,
        forwarder,
    }
}

/// Poll `condition` until it holds or a second has passed
async fn eventually(condition: impl Fn() -> bool) {
    timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_discovers_user_and_restarts_failed_tunnel() {
    let Fixture {
        cluster,
        identity,
        forwarder,
    } = fixture(test_config());
    cluster.set_log(MARKER_LOG);
    let stats = forwarder.stats();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(forwarder.run(cancel.clone()));

    eventually(|| cluster.tunnels().len() == 1).await;
    assert_eq!(identity.remote_user().as_deref(), Some("developer"));
    assert_eq!(cluster.pod_names().len(), 1);

    cluster.tunnels()[0].fail();
    eventually(|| cluster.tunnels().len() == 2).await;
    assert!(cluster.tunnels()[0].is_closed());
    assert!(!cluster.tunnels()[1].is_closed());
    assert_eq!(stats.tunnel_restarts(), 1);

    cluster.tunnels()[1].kill();
    eventually(|| cluster.tunnels().len() == 3).await;
    assert_eq!(stats.tunnel_opens(), 3);

    cancel.cancel();
    let result = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(cluster.tunnels()[2].is_closed());
    assert!(cluster.pod_names().is_empty());
}

#[tokio::test]
async fn test_tunnel_binds_the_session_ssh_port() {
    let Fixture {
        cluster,
        identity,
        forwarder,
    } = fixture(test_config());
    cluster.set_log(MARKER_LOG);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(forwarder.run(cancel.clone()));
    eventually(|| !cluster.tunnels().is_empty()).await;

    let port = identity.ssh_port().expect("port assigned");
    let tunnel = cluster.tunnels()[0].clone();
    assert!(tunnel.addr().ip().is_unspecified());
    assert_eq!(tunnel.addr().port(), port);
    let calls = cluster.calls();
    assert!(calls[0].starts_with("create_pod k-bridge-"));
    assert!(calls.iter().any(|c| c.starts_with("open_tunnel k-bridge-")));

    cancel.cancel();
    task.await.unwrap().unwrap();
    assert!(tunnel.is_closed());
    assert_eq!(identity.ssh_port(), Some(port));
}

#[tokio::test]
async fn test_pod_not_ready_fails_and_cleans_up() {
    let Fixture {
        cluster, forwarder, ..
    } = fixture(test_config());
    cluster.set_pod_ready(false);

    let result = forwarder.run(CancellationToken::new()).await;
    assert!(matches!(
        result,
        Err(BridgeError::Tunnel(TunnelError::BridgeNotReady { .. }))
    ));
    assert!(cluster.pod_names().is_empty());
    assert!(cluster.tunnels().is_empty());
}

#[tokio::test]
async fn test_missing_marker_exhausts_attempts() {
    let Fixture {
        cluster, forwarder, ..
    } = fixture(test_config());
    cluster.set_log("sshd listening on 2222\n");

    let result = forwarder.run(CancellationToken::new()).await;
    match result {
        Err(BridgeError::Tunnel(TunnelError::UserMarkerMissing { attempts, .. })) => {
            assert_eq!(attempts, 3)
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(cluster.pod_names().is_empty());
}

#[tokio::test]
async fn test_failed_log_reads_count_as_attempts() {
    let Fixture {
        cluster, forwarder, ..
    } = fixture(test_config());
    cluster.set_log(MARKER_LOG);
    cluster.fail_on("pod_logs");

    let result = forwarder.run(CancellationToken::new()).await;
    assert!(matches!(
        result,
        Err(BridgeError::Tunnel(TunnelError::UserMarkerMissing { attempts: 3, .. }))
    ));
}

#[tokio::test]
async fn test_configured_user_survives_missing_marker() {
    let Fixture {
        cluster,
        identity,
        forwarder,
    } = fixture(test_config());
    identity.set_remote_user("root");

    let cancel = CancellationToken::new();
    let task = tokio::spawn(forwarder.run(cancel.clone()));
    eventually(|| cluster.tunnels().len() == 1).await;
    assert_eq!(identity.remote_user().as_deref(), Some("root"));

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cancel_while_waiting_for_pod() {
    let mut config = test_config();
    config.timing.pod_ready_timeout = Duration::from_secs(30);
    let Fixture {
        cluster, forwarder, ..
    } = fixture(config);
    cluster.set_pod_ready(false);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(forwarder.run(cancel.clone()));
    eventually(|| cluster.pod_names().len() == 1).await;

    cancel.cancel();
    let result = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(cluster.pod_names().is_empty());
}
