//! `ClusterClient` over the Kubernetes API

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::runtime::wait::await_condition;

use kb_core::error::ClusterError;
use kb_core::traits::{ClusterClient, PortTunnel};

use crate::tunnel::KubePortTunnel;

/// Field manager recorded on objects this client writes
const FIELD_MANAGER: &str = "k-bridge";

/// Namespaced access to Services and Pods
#[derive(Clone)]
pub struct KubeClusterClient {
    client: kube::Client,
    namespace: String,
}

impl KubeClusterClient {
    /// Wrap an existing client
    pub fn new(client: kube::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Build a client from the local kubeconfig or in-cluster environment
    ///
    /// Without an explicit namespace the context's default is used.
    pub async fn try_default(namespace: Option<String>) -> Result<Self, ClusterError> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| ClusterError::api("connect to cluster", e))?;
        let namespace = namespace.unwrap_or_else(|| client.default_namespace().to_string());
        tracing::debug!("Using namespace {}", namespace);
        Ok(Self::new(client, namespace))
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_string()),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_service(&self, name: &str) -> Result<Option<Service>, ClusterError> {
        self.services()
            .get_opt(name)
            .await
            .map_err(|e| ClusterError::api(format!("get service {}", name), e))
    }

    async fn create_or_replace_service(&self, service: &Service) -> Result<Service, ClusterError> {
        let name = service
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::api("replace service", "service has no name"))?;
        let api = self.services();

        let live = api
            .get_opt(&name)
            .await
            .map_err(|e| ClusterError::api(format!("get service {}", name), e))?;

        let mut desired = prepare_for_write(service.clone());
        match live {
            Some(live) => {
                desired.metadata.resource_version = live.metadata.resource_version;
                tracing::debug!("Replacing service {}", name);
                api.replace(&name, &Self::post_params(), &desired)
                    .await
                    .map_err(|e| ClusterError::api(format!("replace service {}", name), e))
            }
            None => {
                tracing::debug!("Creating service {}", name);
                api.create(&Self::post_params(), &desired)
                    .await
                    .map_err(|e| ClusterError::api(format!("create service {}", name), e))
            }
        }
    }

    async fn delete_service(&self, name: &str) -> Result<(), ClusterError> {
        let api = self.services();
        if self.get_service(name).await?.is_none() {
            return Ok(());
        }
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| ClusterError::api(format!("delete service {}", name), e))?;
        Ok(())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.pods()
            .create(&Self::post_params(), pod)
            .await
            .map_err(|e| ClusterError::api(format!("create pod {}", name), e))
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        let api = self.pods();
        let live = api
            .get_opt(name)
            .await
            .map_err(|e| ClusterError::api(format!("get pod {}", name), e))?;
        if live.is_none() {
            return Ok(());
        }
        api.delete(name, &DeleteParams::background())
            .await
            .map_err(|e| ClusterError::api(format!("delete pod {}", name), e))?;
        Ok(())
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let params = ListParams::default().labels(selector);
        let pods = self
            .pods()
            .list(&params)
            .await
            .map_err(|e| ClusterError::api(format!("list pods {}", selector), e))?;
        Ok(pods.items)
    }

    async fn wait_pod_ready(&self, name: &str, timeout: Duration) -> Result<(), ClusterError> {
        let ready = await_condition(self.pods(), name, |pod: Option<&Pod>| is_pod_ready(pod));
        match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ClusterError::api(format!("watch pod {}", name), e)),
            Err(_) => Err(ClusterError::Timeout {
                what: format!("pod {} to be ready", name),
                after: timeout,
            }),
        }
    }

    async fn pod_logs(&self, name: &str) -> Result<String, ClusterError> {
        self.pods()
            .logs(name, &LogParams::default())
            .await
            .map_err(|e| ClusterError::api(format!("read logs of pod {}", name), e))
    }

    async fn open_tunnel(
        &self,
        pod: &str,
        bind: SocketAddr,
        pod_port: u16,
    ) -> Result<Box<dyn PortTunnel>, ClusterError> {
        let tunnel = KubePortTunnel::open(self.pods(), pod, bind, pod_port)
            .await
            .map_err(|e| ClusterError::api(format!("listen on {}", bind), e))?;
        Ok(Box::new(tunnel))
    }
}

/// Whether a pod's Ready condition is True
pub fn is_pod_ready(pod: Option<&Pod>) -> bool {
    pod.and_then(|pod| pod.status.as_ref())
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Strip server-owned metadata so an object can be created or replaced
pub fn prepare_for_write<K: kube::Resource>(mut object: K) -> K {
    let meta = object.meta_mut();
    meta.resource_version = None;
    meta.uid = None;
    meta.creation_timestamp = None;
    meta.managed_fields = None;
    meta.generation = None;
    object
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod_with(conditions: Vec<(&str, &str)>) -> Pod {
        Pod {
            status: Some(PodStatus {
                conditions: Some(
                    conditions
                        .into_iter()
                        .map(|(type_, status)| PodCondition {
                            type_: type_.to_string(),
                            status: status.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_ready_requires_ready_condition() {
        assert!(!is_pod_ready(None));
        assert!(!is_pod_ready(Some(&Pod::default())));
        assert!(!is_pod_ready(Some(&pod_with(vec![("PodScheduled", "True")]))));
        assert!(!is_pod_ready(Some(&pod_with(vec![("Ready", "False")]))));
        assert!(is_pod_ready(Some(&pod_with(vec![
            ("PodScheduled", "True"),
            ("Ready", "True"),
        ]))));
    }

    #[test]
    fn test_prepare_for_write_strips_server_fields() {
        let service = Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                resource_version: Some("42".to_string()),
                uid: Some("abc".to_string()),
                generation: Some(3),
                ..Default::default()
            },
            ..Default::default()
        };

        let prepared = prepare_for_write(service);
        assert_eq!(prepared.metadata.name.as_deref(), Some("web"));
        assert!(prepared.metadata.resource_version.is_none());
        assert!(prepared.metadata.uid.is_none());
        assert!(prepared.metadata.generation.is_none());
    }
}
