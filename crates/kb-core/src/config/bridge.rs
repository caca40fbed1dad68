//! Bridge pod configuration

use serde::{Deserialize, Serialize};

/// How the in-cluster SSH bridge pod is built and recognized
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Container image running the SSH server
    pub image: String,

    /// Value of the `app` selector label
    pub app_label: String,

    /// Value of the `group` selector label
    pub group_label: String,

    /// Port the SSH server listens on inside the pod
    pub ssh_container_port: u16,

    /// Log line prefix after which the container prints its user name
    pub user_marker: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            image: "quay.io/k-bridge/ssh-bridge:latest".to_string(),
            app_label: "k-bridge".to_string(),
            group_label: "remote-dev".to_string(),
            ssh_container_port: 2222,
            user_marker: "Current container user is: ".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Extract the user name from a bridge log, if the marker was printed
    pub fn parse_user(&self, log: &str) -> Option<String> {
        log.lines().find_map(|line| {
            let (_, rest) = line.split_once(self.user_marker.as_str())?;
            let user = rest.split_whitespace().next()?;
            Some(user.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user() {
        let config = BridgeConfig::default();
        let log = "Starting sshd\nCurrent container user is: developer\nServer listening on 0.0.0.0 port 2222.";
        assert_eq!(config.parse_user(log).as_deref(), Some("developer"));
    }

    #[test]
    fn test_parse_user_missing() {
        let config = BridgeConfig::default();
        assert_eq!(config.parse_user("Starting sshd\n"), None);
        assert_eq!(config.parse_user("Current container user is: \n"), None);
    }

    #[test]
    fn test_parse_user_with_timestamp_prefix() {
        let config = BridgeConfig::default();
        let log = "2026-01-01T00:00:00Z Current container user is: dev extra";
        assert_eq!(config.parse_user(log).as_deref(), Some("dev"));
    }
}
