//! Core domain types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Selector label naming the bridge application
pub const APP_LABEL: &str = "app";
/// Selector label naming the bridge group
pub const GROUP_LABEL: &str = "group";
/// Selector label carrying the session id
pub const SESSION_LABEL: &str = "session-id";

/// Unique identifier for a development session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    /// Generate a new random session id
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Short form used in pod names
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

/// How a swapped Service is exposed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingType {
    /// Reachable only inside the cluster
    #[default]
    ClusterIP,
    /// Exposed on every node's port
    NodePort,
    /// Exposed through an external load balancer
    LoadBalancer,
}

impl RoutingType {
    /// Value used for the Service `spec.type` field
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingType::ClusterIP => "ClusterIP",
            RoutingType::NodePort => "NodePort",
            RoutingType::LoadBalancer => "LoadBalancer",
        }
    }
}

impl fmt::Display for RoutingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Labels identifying the bridge pod of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeLabels {
    pub app: String,
    pub group: String,
    pub session_id: SessionId,
}

impl BridgeLabels {
    /// Labels as a selector map
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(APP_LABEL.to_string(), self.app.clone());
        labels.insert(GROUP_LABEL.to_string(), self.group.clone());
        labels.insert(SESSION_LABEL.to_string(), self.session_id.to_string());
        labels
    }

    /// Label selector string (`k=v,k=v`) for list queries
    pub fn selector(&self) -> String {
        self.to_map()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Whether a selector points at this session's bridge
    pub fn matches(&self, selector: &BTreeMap<String, String>) -> bool {
        selector.get(SESSION_LABEL) == Some(&self.session_id.to_string())
            && self.matches_bridge(selector)
    }

    /// Whether a selector points at any bridge of the same app and group
    pub fn matches_bridge(&self, selector: &BTreeMap<String, String>) -> bool {
        selector.get(APP_LABEL) == Some(&self.app) && selector.get(GROUP_LABEL) == Some(&self.group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> BridgeLabels {
        BridgeLabels {
            app: "k-bridge".to_string(),
            group: "dev".to_string(),
            session_id: SessionId::new(),
        }
    }

    #[test]
    fn test_session_id_roundtrip() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_selector_is_sorted() {
        let labels = labels();
        let selector = labels.selector();
        assert!(selector.starts_with("app=k-bridge,group=dev,session-id="));
    }

    #[test]
    fn test_matches_requires_session() {
        let labels = labels();
        let mut selector = labels.to_map();
        assert!(labels.matches(&selector));

        selector.insert(SESSION_LABEL.to_string(), SessionId::new().to_string());
        assert!(!labels.matches(&selector));
        assert!(labels.matches_bridge(&selector));

        selector.insert(APP_LABEL.to_string(), "web".to_string());
        assert!(!labels.matches_bridge(&selector));
    }

    #[test]
    fn test_routing_type_names() {
        assert_eq!(RoutingType::default(), RoutingType::ClusterIP);
        assert_eq!(RoutingType::NodePort.to_string(), "NodePort");
        assert_eq!(RoutingType::LoadBalancer.as_str(), "LoadBalancer");
    }
}
