//! Session configuration

use std::collections::HashSet;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};

use super::{BridgeConfig, TimingConfig};
use crate::error::ConfigError;
use crate::types::{BridgeLabels, RoutingType};

/// A cluster endpoint made reachable from the local machine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteServiceConfig {
    /// Host name as resolved inside the cluster
    pub hostname: String,
    /// Port on the cluster host, and on the local machine
    pub port: u16,
}

impl RemoteServiceConfig {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

/// A local endpoint made reachable from inside the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalServiceConfig {
    /// Name of the Service that is swapped to the bridge
    pub service_name: String,
    /// How the swapped Service is exposed
    #[serde(default)]
    pub routing_type: RoutingType,
    /// Service port, bridge port and local port
    pub port: u16,
}

impl LocalServiceConfig {
    pub fn new(service_name: impl Into<String>, routing_type: RoutingType, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            routing_type,
            port,
        }
    }

    /// Service routing traffic for this endpoint to the session's bridge pod
    pub fn to_service(&self, labels: &BridgeLabels) -> Service {
        let port = i32::from(self.port);
        Service {
            metadata: ObjectMeta {
                name: Some(self.service_name.clone()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(self.routing_type.as_str().to_string()),
                selector: Some(labels.to_map()),
                ports: Some(vec![ServicePort {
                    protocol: Some("TCP".to_string()),
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// How the session future settles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionMode {
    /// The first forwarder to finish ends the session
    #[default]
    FirstSettled,
    /// The session ends once both forwarders have finished
    AllSettled,
}

/// Caller-supplied configuration of one development session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Namespace holding the swapped Services and the bridge pod
    /// (defaults to the kube context's namespace)
    pub namespace: Option<String>,

    /// Cluster services forwarded to the local machine
    pub remote_services: Vec<RemoteServiceConfig>,

    /// Local services exposed inside the cluster
    pub local_services: Vec<LocalServiceConfig>,

    /// Fixed local port for the bridge tunnel (auto-assigned when unset)
    pub ssh_port: Option<u16>,

    /// Bridge user, skipping discovery from the pod log
    pub remote_user: Option<String>,

    /// Password tried when the bridge rejects the session key
    pub remote_password: Option<String>,

    /// Race or join the two forwarders
    pub completion: CompletionMode,

    /// Bridge pod settings
    pub bridge: BridgeConfig,

    /// Timeouts and intervals
    pub timing: TimingConfig,
}

impl SessionConfig {
    /// Check names and ports before anything touches the cluster
    pub fn validate(&self) -> Result<(), ConfigError> {
        for remote in &self.remote_services {
            if remote.hostname.is_empty() {
                return Err(ConfigError::Invalid(
                    "remote service hostname must not be empty".to_string(),
                ));
            }
            if remote.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "remote service {} has port 0",
                    remote.hostname
                )));
            }
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for local in &self.local_services {
            if !is_dns_label(&local.service_name) {
                return Err(ConfigError::Invalid(format!(
                    "{:?} is not a valid service name",
                    local.service_name
                )));
            }
            if local.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "local service {} has port 0",
                    local.service_name
                )));
            }
            if !names.insert(local.service_name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "local service {} is listed twice",
                    local.service_name
                )));
            }
            if !ports.insert(local.port) {
                return Err(ConfigError::Invalid(format!(
                    "local port {} is used by more than one service",
                    local.port
                )));
            }
        }

        if self.bridge.ssh_container_port == 0 {
            return Err(ConfigError::Invalid(
                "bridge ssh_container_port must not be 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// RFC 1035 label: lowercase alphanumerics and '-', starting with a letter
fn is_dns_label(name: &str) -> bool {
    let bytes = name.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes[0].is_ascii_lowercase()
        && bytes[bytes.len() - 1] != b'-'
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionId;

    fn labels() -> BridgeLabels {
        BridgeLabels {
            app: "k-bridge".to_string(),
            group: "remote-dev".to_string(),
            session_id: SessionId::new(),
        }
    }

    #[test]
    fn test_to_service_contract() {
        let labels = labels();
        let local = LocalServiceConfig::new("web", RoutingType::NodePort, 8080);
        let service = local.to_service(&labels);

        assert_eq!(service.metadata.name.as_deref(), Some("web"));
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        assert_eq!(spec.selector, Some(labels.to_map()));

        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].protocol.as_deref(), Some("TCP"));
        assert_eq!(ports[0].port, 8080);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(8080)));
    }

    #[test]
    fn test_to_service_is_deterministic() {
        let labels = labels();
        let local = LocalServiceConfig::new("api", RoutingType::ClusterIP, 9000);
        assert_eq!(local.to_service(&labels), local.to_service(&labels));
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        let long = "a".repeat(64);
        for name in ["", "Web", "1web", "web-", "web_app", long.as_str()] {
            let config = SessionConfig {
                local_services: vec![LocalServiceConfig::new(name, RoutingType::ClusterIP, 80)],
                ..Default::default()
            };
            assert!(config.validate().is_err(), "{:?} should be rejected", name);
        }
    }

    #[test]
    fn test_validate_rejects_duplicate_ports() {
        let config = SessionConfig {
            local_services: vec![
                LocalServiceConfig::new("web", RoutingType::ClusterIP, 8080),
                LocalServiceConfig::new("api", RoutingType::ClusterIP, 8080),
            ],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("8080"));
    }

    #[test]
    fn test_validate_accepts_typical_session() {
        let config = SessionConfig {
            remote_services: vec![RemoteServiceConfig::new("db", 5432)],
            local_services: vec![LocalServiceConfig::new("web-1", RoutingType::ClusterIP, 8080)],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_session_file() {
        let config: SessionConfig = toml::from_str(
            r#"
            namespace = "dev"
            completion = "all-settled"

            [[remote_services]]
            hostname = "db"
            port = 5432

            [[local_services]]
            service_name = "web"
            routing_type = "LoadBalancer"
            port = 8080

            [timing]
            auth_timeout = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.completion, CompletionMode::AllSettled);
        assert_eq!(config.remote_services[0], RemoteServiceConfig::new("db", 5432));
        assert_eq!(config.local_services[0].routing_type, RoutingType::LoadBalancer);
        assert_eq!(config.timing.auth_timeout.as_secs(), 5);
        assert_eq!(config.bridge.ssh_container_port, 2222);
    }
}
