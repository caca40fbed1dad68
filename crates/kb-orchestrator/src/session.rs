//! Session orchestrator
//!
//! Runs one development session: checks the local machine, swaps the
//! Services, then races the bridge and client forwarders.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use kb_core::config::{CompletionMode, SessionConfig};
use kb_core::{BridgeError, BridgeLabels, ClusterClient, SessionIdentity};
use kb_tunnel::{BridgeForwarder, ClientForwarder};

use crate::preflight::check_environment;
use crate::swap::ServiceSwapManager;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// The two supervised tasks of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarder {
    Bridge,
    Client,
}

impl fmt::Display for Forwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Forwarder::Bridge => f.write_str("bridge"),
            Forwarder::Client => f.write_str("client"),
        }
    }
}

type ForwarderSet = JoinSet<(Forwarder, Result<(), BridgeError>)>;

/// Resolves when the session's forwarders settle
///
/// In first-settled mode that is the first forwarder to finish, and its
/// result is the session's. In all-settled mode both have finished and the
/// first error, if any, is returned.
pub struct SessionCompletion {
    rx: oneshot::Receiver<Result<(), BridgeError>>,
}

impl Future for SessionCompletion {
    type Output = Result<(), BridgeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(BridgeError::TaskAborted("supervisor"))))
    }
}

/// Owns one development session from start to stop
pub struct SessionOrchestrator {
    cluster: Arc<dyn ClusterClient>,
    config: Arc<SessionConfig>,
    identity: Arc<SessionIdentity>,
    swap: ServiceSwapManager,
    cancel: CancellationToken,
    drained: CancellationToken,
    state: AtomicU8,
    /// Held across `start` and `stop` so a stop never interleaves a start
    lifecycle: Mutex<()>,
}

impl SessionOrchestrator {
    /// Create a session with a fresh identity
    pub fn new(cluster: Arc<dyn ClusterClient>, config: SessionConfig) -> Result<Self, BridgeError> {
        let identity = Arc::new(SessionIdentity::new(config.ssh_port)?);
        let labels = identity.labels(&config.bridge.app_label, &config.bridge.group_label);
        let swap = ServiceSwapManager::new(Arc::clone(&cluster), labels);

        Ok(Self {
            cluster,
            config: Arc::new(config),
            identity,
            swap,
            cancel: CancellationToken::new(),
            drained: CancellationToken::new(),
            state: AtomicU8::new(IDLE),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn identity(&self) -> &Arc<SessionIdentity> {
        &self.identity
    }

    pub fn labels(&self) -> BridgeLabels {
        self.identity
            .labels(&self.config.bridge.app_label, &self.config.bridge.group_label)
    }

    pub fn swap_manager(&self) -> &ServiceSwapManager {
        &self.swap
    }

    /// Start the session
    ///
    /// Local port conflicts and swap errors are returned here and leave no
    /// Service swapped. Once this returns `Ok`, both forwarders are running.
    pub async fn start(&self) -> Result<SessionCompletion, BridgeError> {
        let _lifecycle = self.lifecycle.lock().await;
        match self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {}
            Err(RUNNING) => return Err(BridgeError::Lifecycle("started")),
            Err(_) => return Err(BridgeError::Lifecycle("stopped")),
        }

        match self.launch().await {
            Ok(completion) => Ok(completion),
            Err(e) => {
                self.state.store(IDLE, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<SessionCompletion, BridgeError> {
        self.config.validate()?;
        check_environment(self.cluster.as_ref(), &self.config).await?;

        if let Some(user) = &self.config.remote_user {
            self.identity.set_remote_user(user.clone());
        }

        if let Err(e) = self.swap.activate(&self.config.local_services).await {
            tracing::error!("Failed to swap services: {}", e);
            self.swap.deactivate(&self.config.local_services).await;
            return Err(e.into());
        }

        let bridge = BridgeForwarder::new(
            Arc::clone(&self.cluster),
            Arc::clone(&self.identity),
            Arc::clone(&self.config),
        );
        let client = ClientForwarder::new(Arc::clone(&self.identity), Arc::clone(&self.config));

        let mut tasks = ForwarderSet::new();
        let cancel = self.cancel.clone();
        tasks.spawn(async move { (Forwarder::Bridge, bridge.run(cancel).await) });
        let cancel = self.cancel.clone();
        tasks.spawn(async move { (Forwarder::Client, client.run(cancel).await) });

        tracing::info!(
            "Session {} started: {} remote, {} local service(s)",
            self.identity.session_id(),
            self.config.remote_services.len(),
            self.config.local_services.len()
        );

        let (tx, rx) = oneshot::channel();
        tokio::spawn(supervise(
            tasks,
            self.config.completion,
            self.cancel.clone(),
            self.config.timing.stop_grace,
            Arc::clone(&self.identity),
            tx,
            self.drained.clone(),
        ));

        Ok(SessionCompletion { rx })
    }

    /// Restore the Services and cancel both forwarders
    ///
    /// A `start` in progress is waited for, so Services it swaps are put
    /// back too. Returns without waiting for the forwarders. Calling it
    /// again, or before `start`, does nothing.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self
            .state
            .compare_exchange(RUNNING, STOPPED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Session {} not running, nothing to stop", self.identity.session_id());
            return;
        }

        tracing::info!("Stopping session {}", self.identity.session_id());
        self.swap.deactivate(&self.config.local_services).await;
        self.cancel.cancel();
    }

    /// Wait until both forwarders have exited and the identity is reset
    ///
    /// Returns at once for a session that was never started.
    pub async fn drained(&self) {
        if self.state.load(Ordering::SeqCst) == IDLE {
            return;
        }
        self.drained.cancelled().await;
    }
}

/// Collects forwarder results and reports the session's outcome once
struct Settlement {
    mode: CompletionMode,
    first_error: Option<BridgeError>,
    tx: Option<oneshot::Sender<Result<(), BridgeError>>>,
}

impl Settlement {
    fn new(mode: CompletionMode, tx: oneshot::Sender<Result<(), BridgeError>>) -> Self {
        Self {
            mode,
            first_error: None,
            tx: Some(tx),
        }
    }

    /// Returns whether the outcome is now decided
    fn record(&mut self, result: Result<(), BridgeError>) -> bool {
        match self.mode {
            CompletionMode::FirstSettled => {
                if let Some(tx) = self.tx.take() {
                    let _ = tx.send(result);
                }
                true
            }
            CompletionMode::AllSettled => {
                if let Err(e) = result {
                    self.first_error.get_or_insert(e);
                }
                false
            }
        }
    }

    fn finish(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(match self.first_error.take() {
                Some(e) => Err(e),
                None => Ok(()),
            });
        }
    }
}

/// Settle the session, cancel what is left, then drain and reset
async fn supervise(
    mut tasks: ForwarderSet,
    mode: CompletionMode,
    cancel: CancellationToken,
    grace: Duration,
    identity: Arc<SessionIdentity>,
    tx: oneshot::Sender<Result<(), BridgeError>>,
    drained: CancellationToken,
) {
    let mut settlement = Settlement::new(mode, tx);

    loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                Some(joined) => {
                    if settlement.record(task_result(joined)) {
                        break;
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }

    // Whatever is still running lost the race or is being stopped
    cancel.cancel();
    let finished = tokio::time::timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            settlement.record(task_result(joined));
        }
    })
    .await;

    if finished.is_err() {
        tracing::warn!("Forwarders still running after {:?}, aborting them", grace);
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    settlement.finish();
    identity.reset();
    drained.cancel();
    tracing::debug!("Session {} drained", identity.session_id());
}

fn task_result(
    joined: Result<(Forwarder, Result<(), BridgeError>), JoinError>,
) -> Result<(), BridgeError> {
    match joined {
        Ok((forwarder, Ok(()))) => {
            tracing::info!("The {} forwarder finished", forwarder);
            Ok(())
        }
        Ok((forwarder, Err(e))) => {
            tracing::error!("The {} forwarder failed: {}", forwarder, e);
            Err(e)
        }
        Err(e) => {
            tracing::error!("Forwarder task ended abnormally: {}", e);
            Err(BridgeError::TaskAborted("forwarder"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarder_display() {
        assert_eq!(Forwarder::Bridge.to_string(), "bridge");
        assert_eq!(Forwarder::Client.to_string(), "client");
    }

    #[tokio::test]
    async fn test_first_settled_reports_first_result() {
        let (tx, rx) = oneshot::channel();
        let mut settlement = Settlement::new(CompletionMode::FirstSettled, tx);
        assert!(settlement.record(Err(BridgeError::TaskAborted("forwarder"))));
        assert!(settlement.record(Ok(())));
        settlement.finish();
        assert!(matches!(
            SessionCompletion { rx }.await,
            Err(BridgeError::TaskAborted("forwarder"))
        ));
    }

    #[tokio::test]
    async fn test_all_settled_keeps_first_error() {
        let (tx, rx) = oneshot::channel();
        let mut settlement = Settlement::new(CompletionMode::AllSettled, tx);
        assert!(!settlement.record(Ok(())));
        assert!(!settlement.record(Err(BridgeError::Lifecycle("stopped"))));
        settlement.finish();
        assert!(matches!(
            SessionCompletion { rx }.await,
            Err(BridgeError::Lifecycle("stopped"))
        ));
    }

    #[tokio::test]
    async fn test_completion_reports_dropped_supervisor() {
        let (tx, rx) = oneshot::channel();
        drop(tx);
        let result = SessionCompletion { rx }.await;
        assert!(matches!(result, Err(BridgeError::TaskAborted("supervisor"))));
    }
}
