//! Service swap manager
//!
//! Points each local service's Service at the session's bridge pod and puts
//! the previous routing back on teardown. A Service that existed before the
//! swap is serialized into the `previous-service` annotation of its
//! replacement, so a later process can restore it after a crash.
//!
//! There is no lock against other writers of the same Services.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Service;

use kb_core::config::LocalServiceConfig;
use kb_core::types::SESSION_LABEL;
use kb_core::{BridgeLabels, ClusterClient, ClusterError};

/// Annotation holding the JSON of the Service that was replaced
pub const BACKUP_ANNOTATION: &str = "previous-service";

/// What teardown has to do for one swapped Service
#[derive(Debug, Clone, PartialEq)]
pub enum SwapState {
    /// Nothing existed before the swap; delete the replacement
    Fresh,
    /// Put this Service back
    Replaced(Box<Service>),
}

/// Which replacements a teardown treats as its own
#[derive(Clone, Copy)]
enum Ownership<'a> {
    /// Selector carries this session's id
    Session,
    /// Selector carries the bridge app and group, any session
    AnyBridge,
    /// Bridge app and group, and a session id the filter accepts
    Sessions(&'a (dyn Fn(&str) -> bool + Sync)),
}

pub struct ServiceSwapManager {
    cluster: Arc<dyn ClusterClient>,
    labels: BridgeLabels,
    states: DashMap<String, SwapState>,
}

impl ServiceSwapManager {
    pub fn new(cluster: Arc<dyn ClusterClient>, labels: BridgeLabels) -> Self {
        Self {
            cluster,
            labels,
            states: DashMap::new(),
        }
    }

    /// Recorded state of a swapped Service
    pub fn state(&self, name: &str) -> Option<SwapState> {
        self.states.get(name).map(|state| state.clone())
    }

    /// Route every service to the bridge
    ///
    /// Stops at the first API error; Services already swapped stay recorded
    /// so `deactivate` can still undo them.
    pub async fn activate(&self, services: &[LocalServiceConfig]) -> Result<(), ClusterError> {
        for local in services {
            self.activate_one(local).await?;
        }
        Ok(())
    }

    async fn activate_one(&self, local: &LocalServiceConfig) -> Result<(), ClusterError> {
        let name = &local.service_name;
        let mut replacement = local.to_service(&self.labels);

        let state = match self.cluster.get_service(name).await? {
            None => {
                tracing::info!("Creating service {} for the bridge", name);
                SwapState::Fresh
            }
            Some(live) if self.owns(&live, Ownership::AnyBridge) => {
                if !self.owns(&live, Ownership::Session) {
                    tracing::warn!(
                        "Service {} still points at an earlier bridge session, taking it over",
                        name
                    );
                }
                let state = classify(&live)?;
                if let SwapState::Replaced(original) = &state {
                    keep_cluster_ips(&mut replacement, original);
                    annotate(&mut replacement, original)?;
                }
                state
            }
            Some(live) => {
                tracing::info!("Redirecting service {} to the bridge", name);
                let original = sanitize(live);
                keep_cluster_ips(&mut replacement, &original);
                annotate(&mut replacement, &original)?;
                SwapState::Replaced(Box::new(original))
            }
        };

        self.cluster.create_or_replace_service(&replacement).await?;
        self.states.insert(name.clone(), state);
        Ok(())
    }

    /// Undo the swap of every service
    ///
    /// Errors are logged and do not stop the remaining services.
    pub async fn deactivate(&self, services: &[LocalServiceConfig]) {
        for local in services {
            if let Err(e) = self.teardown(&local.service_name, Ownership::Session).await {
                tracing::warn!("Failed to restore service {}: {}", local.service_name, e);
            }
        }
    }

    /// Undo swaps left behind by earlier sessions of this bridge app and group
    ///
    /// Only replacements whose session id `sessions` accepts are touched.
    /// Returns how many Services were restored or deleted. Every service is
    /// attempted; the first error is returned afterwards.
    pub async fn recover<F>(
        &self,
        services: &[LocalServiceConfig],
        sessions: F,
    ) -> Result<usize, ClusterError>
    where
        F: Fn(&str) -> bool + Sync,
    {
        let ownership = Ownership::Sessions(&sessions);
        let mut recovered = 0;
        let mut first_error = None;

        for local in services {
            match self.teardown(&local.service_name, ownership).await {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Failed to recover service {}: {}", local.service_name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(recovered),
        }
    }

    /// Returns whether anything was changed
    async fn teardown(&self, name: &str, ownership: Ownership<'_>) -> Result<bool, ClusterError> {
        let state = match self.states.remove(name) {
            Some((_, state)) => state,
            None => match self.cluster.get_service(name).await? {
                Some(live) if self.owns(&live, ownership) => classify(&live)?,
                Some(_) => {
                    tracing::debug!("Service {} does not point at the bridge, leaving it", name);
                    return Ok(false);
                }
                None => return Ok(false),
            },
        };

        match state {
            SwapState::Replaced(original) => {
                tracing::info!("Restoring service {}", name);
                self.cluster.create_or_replace_service(&original).await?;
            }
            SwapState::Fresh => {
                tracing::info!("Deleting service {}", name);
                self.cluster.delete_service(name).await?;
            }
        }
        Ok(true)
    }

    fn owns(&self, service: &Service, ownership: Ownership<'_>) -> bool {
        let Some(selector) = service.spec.as_ref().and_then(|s| s.selector.as_ref()) else {
            return false;
        };
        match ownership {
            Ownership::Session => self.labels.matches(selector),
            Ownership::AnyBridge => self.labels.matches_bridge(selector),
            Ownership::Sessions(wanted) => {
                self.labels.matches_bridge(selector)
                    && selector
                        .get(SESSION_LABEL)
                        .is_some_and(|id| wanted(id.as_str()))
            }
        }
    }
}

/// Swap state carried by a live replacement
fn classify(service: &Service) -> Result<SwapState, ClusterError> {
    let backup = service
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(BACKUP_ANNOTATION));
    match backup {
        Some(json) => Ok(SwapState::Replaced(Box::new(serde_json::from_str(json)?))),
        None => Ok(SwapState::Fresh),
    }
}

fn annotate(replacement: &mut Service, original: &Service) -> Result<(), ClusterError> {
    let json = serde_json::to_string(original)?;
    replacement
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(BACKUP_ANNOTATION.to_string(), json);
    Ok(())
}

/// `clusterIP` is immutable, so the replacement has to carry the live one
fn keep_cluster_ips(replacement: &mut Service, original: &Service) {
    let (Some(spec), Some(original)) = (replacement.spec.as_mut(), original.spec.as_ref()) else {
        return;
    };
    spec.cluster_ip = original.cluster_ip.clone();
    spec.cluster_ips = original.cluster_ips.clone();
}

/// Drop server-owned fields so the object can be written back later
fn sanitize(mut service: Service) -> Service {
    let metadata = &mut service.metadata;
    metadata.resource_version = None;
    metadata.uid = None;
    metadata.creation_timestamp = None;
    metadata.managed_fields = None;
    metadata.generation = None;
    service.status = None;
    service
}
