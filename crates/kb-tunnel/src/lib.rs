//! kb-tunnel: the two forwarders of a k-Bridge session
//!
//! The bridge forwarder deploys the bridge pod and keeps a local tunnel to
//! its SSH port open. The client forwarder rides that tunnel with an SSH
//! session carrying local and remote TCP forwards.

pub mod bridge;
pub mod client;
pub mod reconnect;

pub use bridge::{BridgeForwarder, BridgeStats};
pub use client::{ClientForwarder, ClientStats};
pub use reconnect::Backoff;
