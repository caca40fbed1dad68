//! Cluster side of the session: bridge pod and its tunnel

mod forwarder;
pub mod pod;

pub use forwarder::{BridgeForwarder, BridgeStats};
pub use pod::{bridge_pod, bridge_pod_name};
