//! kb-kube: Kubernetes adapter for k-Bridge
//!
//! Implements the `ClusterClient` contract from `kb-core` with `kube`:
//! Service and Pod CRUD, readiness waits, logs, and a local listener that
//! port-forwards every accepted connection into a pod.

pub mod client;
pub mod tunnel;

pub use client::KubeClusterClient;
pub use tunnel::KubePortTunnel;
