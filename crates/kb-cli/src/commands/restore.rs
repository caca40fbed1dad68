//! `k-bridge restore`: undo what a crashed session left in the cluster
//!
//! Sessions whose bridge pod is still Ready are assumed to be running, maybe
//! for another developer, and are left alone unless picked with `--session`
//! or overridden with `--force`.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use k8s_openapi::api::core::v1::Pod;

use kb_core::config::SessionConfig;
use kb_core::types::{APP_LABEL, GROUP_LABEL, SESSION_LABEL};
use kb_core::{BridgeLabels, ClusterClient, SessionId};
use kb_kube::client::is_pod_ready;
use kb_kube::KubeClusterClient;
use kb_orchestrator::ServiceSwapManager;

use super::config::{load_session, resolve_path};
use crate::output::{print_info, print_success, print_warning};

/// Which earlier sessions a restore may touch
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Only this session: its full id or the short form printed by `up`
    pub session: Option<String>,
    /// Include sessions whose bridge pod is still Ready
    pub force: bool,
}

impl RestoreOptions {
    fn selects(&self, session_id: &str, running: &BTreeSet<String>) -> bool {
        match &self.session {
            Some(wanted) => session_id.starts_with(wanted.as_str()),
            None => self.force || !running.contains(session_id),
        }
    }
}

pub async fn restore_command(
    config_path: Option<&PathBuf>,
    namespace: Option<String>,
    options: RestoreOptions,
) -> Result<()> {
    let path = resolve_path(config_path);
    let mut session_config = load_session(&path)?;
    if namespace.is_some() {
        session_config.namespace = namespace;
    }

    let cluster: Arc<dyn ClusterClient> = Arc::new(
        KubeClusterClient::try_default(session_config.namespace.clone())
            .await
            .context("Failed to connect to the cluster")?,
    );
    print_info(&format!(
        "Restoring services in namespace {}",
        cluster.namespace()
    ));

    let restored = restore(cluster, &session_config, &options).await?;
    for session in &restored.skipped {
        print_warning(&format!(
            "Session {} still has a running bridge, left alone (use --session {} if it is yours)",
            session,
            &session[..session.len().min(8)]
        ));
    }
    if restored.services == 0 && restored.pods == 0 {
        print_success("Nothing to restore");
    } else {
        print_success(&format!(
            "Restored {} service(s), removed {} bridge pod(s)",
            restored.services, restored.pods
        ));
    }
    Ok(())
}

/// What a restore run changed
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Restored {
    pub services: usize,
    pub pods: usize,
    /// Running sessions that were not touched
    pub skipped: Vec<String>,
}

/// Restore swapped Services and delete bridge pods of earlier sessions
pub async fn restore(
    cluster: Arc<dyn ClusterClient>,
    config: &SessionConfig,
    options: &RestoreOptions,
) -> Result<Restored> {
    if options.session.as_deref().is_some_and(str::is_empty) {
        bail!("Session id must not be empty");
    }

    let selector = format!(
        "{}={},{}={}",
        APP_LABEL, config.bridge.app_label, GROUP_LABEL, config.bridge.group_label
    );
    let pods = cluster
        .list_pods(&selector)
        .await
        .context("Failed to list bridge pods")?;
    let running: BTreeSet<String> = pods
        .iter()
        .filter(|pod| is_pod_ready(Some(*pod)))
        .filter_map(session_of)
        .collect();

    let labels = BridgeLabels {
        app: config.bridge.app_label.clone(),
        group: config.bridge.group_label.clone(),
        session_id: SessionId::new(),
    };
    let services = ServiceSwapManager::new(Arc::clone(&cluster), labels)
        .recover(&config.local_services, |id| options.selects(id, &running))
        .await
        .context("Failed to restore services")?;

    let mut removed = 0;
    for pod in &pods {
        let selected = match session_of(pod) {
            Some(id) => options.selects(&id, &running),
            None => options.force,
        };
        let Some(name) = pod.metadata.name.as_deref() else {
            continue;
        };
        if !selected {
            tracing::debug!("Keeping bridge pod {}", name);
            continue;
        }
        tracing::info!("Deleting leftover bridge pod {}", name);
        cluster.delete_pod(name).await?;
        removed += 1;
    }

    let skipped = running
        .iter()
        .filter(|id| !options.selects(id, &running))
        .cloned()
        .collect();

    Ok(Restored {
        services,
        pods: removed,
        skipped,
    })
}

fn session_of(pod: &Pod) -> Option<String> {
    pod.metadata.labels.as_ref()?.get(SESSION_LABEL).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kb_core::config::LocalServiceConfig;
    use kb_core::testing::MemoryCluster;
    use kb_core::RoutingType;
    use kb_orchestrator::SessionOrchestrator;

    fn test_config() -> SessionConfig {
        SessionConfig {
            local_services: vec![LocalServiceConfig::new("web", RoutingType::ClusterIP, 8080)],
            ..Default::default()
        }
    }

    fn session_labels(config: &SessionConfig) -> BridgeLabels {
        BridgeLabels {
            app: config.bridge.app_label.clone(),
            group: config.bridge.group_label.clone(),
            session_id: SessionId::new(),
        }
    }

    fn bridge_pod(name: &str, labels: &BridgeLabels) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.to_map()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Swap `web` for a session that then died with its pod not ready
    async fn crashed_session(cluster: &Arc<MemoryCluster>, config: &SessionConfig) -> BridgeLabels {
        let crashed = session_labels(config);
        ServiceSwapManager::new(cluster.clone(), crashed.clone())
            .activate(&config.local_services)
            .await
            .unwrap();
        cluster.set_pod_ready(false);
        cluster.create_pod(&bridge_pod("k-bridge-1", &crashed)).await.unwrap();
        cluster.create_pod(&bridge_pod("k-bridge-2", &crashed)).await.unwrap();
        cluster.set_pod_ready(true);
        crashed
    }

    #[tokio::test]
    async fn test_restore_after_crash() {
        let cluster = Arc::new(MemoryCluster::new("dev"));
        let config = test_config();
        crashed_session(&cluster, &config).await;

        let options = RestoreOptions::default();
        let restored = restore(cluster.clone(), &config, &options).await.unwrap();
        assert_eq!(restored.services, 1);
        assert_eq!(restored.pods, 2);
        assert!(restored.skipped.is_empty());
        assert!(cluster.service("web").is_none());
        assert!(cluster.pod_names().is_empty());

        let again = restore(cluster.clone(), &config, &options).await.unwrap();
        assert_eq!(again, Restored::default());
    }

    #[tokio::test]
    async fn test_restore_leaves_running_session_alone() {
        let cluster = Arc::new(MemoryCluster::new("dev"));
        cluster.set_log("Current container user is: developer\n");
        let config = test_config();

        let session = SessionOrchestrator::new(cluster.clone(), config.clone()).unwrap();
        let completion = session.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while cluster.tunnels().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let pods = cluster.pod_names();
        assert_eq!(pods.len(), 1);

        let restored = restore(cluster.clone(), &config, &RestoreOptions::default())
            .await
            .unwrap();
        assert_eq!(restored.services, 0);
        assert_eq!(restored.pods, 0);
        assert_eq!(restored.skipped, vec![session.identity().session_id().to_string()]);
        assert!(cluster.service("web").is_some());
        assert_eq!(cluster.pod_names(), pods);

        session.stop().await;
        tokio::time::timeout(Duration::from_secs(2), completion)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_restore_named_session_only() {
        let cluster = Arc::new(MemoryCluster::new("dev"));
        let config = test_config();
        let other = LocalServiceConfig::new("api", RoutingType::NodePort, 9090);

        // A running session owns `api`; a crashed one with a ready pod owns `web`
        let running = session_labels(&config);
        ServiceSwapManager::new(cluster.clone(), running.clone())
            .activate(&[other.clone()])
            .await
            .unwrap();
        cluster.create_pod(&bridge_pod("k-bridge-live", &running)).await.unwrap();
        let mine = session_labels(&config);
        ServiceSwapManager::new(cluster.clone(), mine.clone())
            .activate(&config.local_services)
            .await
            .unwrap();
        cluster.create_pod(&bridge_pod("k-bridge-mine", &mine)).await.unwrap();

        let mut both = config.clone();
        both.local_services.push(other);

        let untouched = restore(cluster.clone(), &both, &RestoreOptions::default())
            .await
            .unwrap();
        assert_eq!(untouched.services, 0);
        assert_eq!(untouched.skipped.len(), 2);

        let options = RestoreOptions {
            session: Some(mine.session_id.short()),
            force: false,
        };
        let restored = restore(cluster.clone(), &both, &options).await.unwrap();
        assert_eq!(restored.services, 1);
        assert_eq!(restored.pods, 1);
        assert_eq!(restored.skipped, vec![running.session_id.to_string()]);
        assert!(cluster.service("web").is_none());
        assert!(cluster.service("api").is_some());
        assert_eq!(cluster.pod_names(), vec!["k-bridge-live".to_string()]);

        let forced = RestoreOptions {
            session: None,
            force: true,
        };
        let restored = restore(cluster.clone(), &both, &forced).await.unwrap();
        assert_eq!(restored.services, 1);
        assert_eq!(restored.pods, 1);
        assert!(cluster.service("api").is_none());
        assert!(cluster.pod_names().is_empty());
    }

    #[tokio::test]
    async fn test_empty_session_id_is_rejected() {
        let cluster = Arc::new(MemoryCluster::new("dev"));
        let options = RestoreOptions {
            session: Some(String::new()),
            force: false,
        };
        assert!(restore(cluster, &test_config(), &options).await.is_err());
    }
}
