//! Bridge pod manifest

use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use kb_core::config::SessionConfig;
use kb_core::identity::SessionIdentity;

/// Container name inside the bridge pod
pub const BRIDGE_CONTAINER: &str = "ssh-bridge";

/// Environment variable the bridge image reads its authorized key from
pub const PUBLIC_KEY_ENV: &str = "PUBLIC_KEY";

/// Name of the bridge pod for a session
pub fn bridge_pod_name(config: &SessionConfig, identity: &SessionIdentity) -> String {
    format!(
        "{}-{}",
        config.bridge.app_label,
        identity.session_id().short()
    )
}

/// Pod running the SSH server both forwarders talk to
///
/// Besides the SSH port it declares one container port per local service,
/// since remote forwards listen on those ports inside the pod.
pub fn bridge_pod(config: &SessionConfig, identity: &SessionIdentity) -> Pod {
    let labels = identity
        .labels(&config.bridge.app_label, &config.bridge.group_label)
        .to_map();

    let mut ports = vec![ContainerPort {
        name: Some("ssh".to_string()),
        container_port: i32::from(config.bridge.ssh_container_port),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }];
    ports.extend(config.local_services.iter().map(|local| ContainerPort {
        container_port: i32::from(local.port),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }));

    Pod {
        metadata: ObjectMeta {
            name: Some(bridge_pod_name(config, identity)),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: BRIDGE_CONTAINER.to_string(),
                image: Some(config.bridge.image.clone()),
                env: Some(vec![EnvVar {
                    name: PUBLIC_KEY_ENV.to_string(),
                    value: Some(identity.public_key_line().to_string()),
                    ..Default::default()
                }]),
                ports: Some(ports),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
