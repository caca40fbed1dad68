//! In-memory cluster for tests
//!
//! `MemoryCluster` keeps Services and Pods in maps, bumps a resource version
//! on every write like the API server does, and hands out
//! [`ScriptedTunnel`]s whose health the test controls.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus, Service};

use crate::error::ClusterError;
use crate::traits::{ClusterClient, PortTunnel};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A Kubernetes namespace held in memory
pub struct MemoryCluster {
    namespace: String,
    services: Mutex<BTreeMap<String, Service>>,
    pods: Mutex<BTreeMap<String, Pod>>,
    log: Mutex<String>,
    pod_ready: AtomicBool,
    version: AtomicU64,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    tunnels: Mutex<Vec<Arc<TunnelFlags>>>,
}

impl MemoryCluster {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            services: Mutex::new(BTreeMap::new()),
            pods: Mutex::new(BTreeMap::new()),
            log: Mutex::new(String::new()),
            pod_ready: AtomicBool::new(true),
            version: AtomicU64::new(1),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            tunnels: Mutex::new(Vec::new()),
        }
    }

    /// Seed a Service, stamping a resource version
    pub fn insert_service(&self, mut service: Service) -> Service {
        service.metadata.resource_version = Some(self.next_version());
        let name = service.metadata.name.clone().unwrap_or_default();
        lock(&self.services).insert(name, service.clone());
        service
    }

    /// Live Service by name
    pub fn service(&self, name: &str) -> Option<Service> {
        lock(&self.services).get(name).cloned()
    }

    /// Names of all live Pods
    pub fn pod_names(&self) -> Vec<String> {
        lock(&self.pods).keys().cloned().collect()
    }

    /// Log returned for every Pod
    pub fn set_log(&self, log: impl Into<String>) {
        *lock(&self.log) = log.into();
    }

    /// Whether Pods become ready; applies to Pods created afterwards
    pub fn set_pod_ready(&self, ready: bool) {
        self.pod_ready.store(ready, Ordering::SeqCst);
    }

    /// Make every call of `operation` fail (e.g. `"get_service"`)
    pub fn fail_on(&self, operation: &str) {
        lock(&self.failing).insert(operation.to_string());
    }

    /// Mutating calls made so far, as `"operation name"`
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Tunnels opened so far, oldest first
    pub fn tunnels(&self) -> Vec<Arc<TunnelFlags>> {
        lock(&self.tunnels).clone()
    }

    fn next_version(&self) -> String {
        self.version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn check(&self, operation: &str) -> Result<(), ClusterError> {
        if lock(&self.failing).contains(operation) {
            return Err(ClusterError::api(operation, "injected failure"));
        }
        Ok(())
    }

    fn record(&self, operation: &str, name: &str) {
        lock(&self.calls).push(format!("{} {}", operation, name));
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_service(&self, name: &str) -> Result<Option<Service>, ClusterError> {
        self.check("get_service")?;
        Ok(self.service(name))
    }

    async fn create_or_replace_service(&self, service: &Service) -> Result<Service, ClusterError> {
        self.check("create_or_replace_service")?;
        let name = service.metadata.name.clone().unwrap_or_default();
        self.record("create_or_replace_service", &name);
        Ok(self.insert_service(service.clone()))
    }

    async fn delete_service(&self, name: &str) -> Result<(), ClusterError> {
        self.check("delete_service")?;
        self.record("delete_service", name);
        lock(&self.services).remove(name);
        Ok(())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        self.check("create_pod")?;
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.record("create_pod", &name);
        let mut pod = pod.clone();
        pod.metadata.resource_version = Some(self.next_version());
        pod.status = Some(pod_status(self.pod_ready.load(Ordering::SeqCst)));
        lock(&self.pods).insert(name, pod.clone());
        Ok(pod)
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        self.check("delete_pod")?;
        self.record("delete_pod", name);
        lock(&self.pods).remove(name);
        Ok(())
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        self.check("list_pods")?;
        let wanted: Vec<(&str, &str)> = selector
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        let pods = lock(&self.pods);
        Ok(pods
            .values()
            .filter(|pod| {
                let labels = pod.metadata.labels.clone().unwrap_or_default();
                wanted
                    .iter()
                    .all(|(k, v)| labels.get(*k).map(String::as_str) == Some(*v))
            })
            .cloned()
            .collect())
    }

    async fn wait_pod_ready(&self, name: &str, timeout: Duration) -> Result<(), ClusterError> {
        self.check("wait_pod_ready")?;
        if self.pod_ready.load(Ordering::SeqCst) && lock(&self.pods).contains_key(name) {
            return Ok(());
        }
        tokio::time::sleep(timeout).await;
        Err(ClusterError::Timeout {
            what: format!("pod {} to be ready", name),
            after: timeout,
        })
    }

    async fn pod_logs(&self, name: &str) -> Result<String, ClusterError> {
        self.check("pod_logs")?;
        if !lock(&self.pods).contains_key(name) {
            return Err(ClusterError::NotFound {
                kind: "Pod",
                name: name.to_string(),
            });
        }
        Ok(lock(&self.log).clone())
    }

    async fn open_tunnel(
        &self,
        pod: &str,
        bind: SocketAddr,
        _pod_port: u16,
    ) -> Result<Box<dyn PortTunnel>, ClusterError> {
        self.check("open_tunnel")?;
        self.record("open_tunnel", pod);
        let flags = Arc::new(TunnelFlags::new(bind));
        lock(&self.tunnels).push(Arc::clone(&flags));
        Ok(Box::new(ScriptedTunnel { flags }))
    }
}

/// Status the API server would report for a running pod
fn pod_status(ready: bool) -> PodStatus {
    PodStatus {
        phase: Some(if ready { "Running" } else { "Pending" }.to_string()),
        conditions: Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Health flags of a [`ScriptedTunnel`], flipped by tests
#[derive(Debug)]
pub struct TunnelFlags {
    addr: SocketAddr,
    alive: AtomicBool,
    errored: AtomicBool,
    closed: AtomicBool,
}

impl TunnelFlags {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            alive: AtomicBool::new(true),
            errored: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Address the tunnel was asked to listen on
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Report an error on the next health check
    pub fn fail(&self) {
        self.errored.store(true, Ordering::SeqCst);
    }

    /// Report the tunnel dead on the next health check
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Whether the owner closed the tunnel
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A tunnel that moves no bytes; its health is whatever the test says
pub struct ScriptedTunnel {
    flags: Arc<TunnelFlags>,
}

impl PortTunnel for ScriptedTunnel {
    fn local_addr(&self) -> SocketAddr {
        self.flags.addr
    }

    fn is_alive(&self) -> bool {
        self.flags.alive.load(Ordering::SeqCst) && !self.flags.is_closed()
    }

    fn error_occurred(&self) -> bool {
        self.flags.errored.load(Ordering::SeqCst)
    }

    fn last_error(&self) -> Option<String> {
        self.error_occurred()
            .then(|| "scripted tunnel failure".to_string())
    }

    fn close(&self) {
        self.flags.closed.store(true, Ordering::SeqCst);
    }
}
