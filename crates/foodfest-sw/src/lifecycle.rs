//! Worker lifecycle: registration slots, state transitions and one task per
//! lifecycle or fetch event.
//!
//! ```text
//! register ──► installing ──► installed (waiting) ──► activating ──► activated
//!                  │                                                    │
//!                  └──────────────► redundant ◄─────────────────────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use foodfest_net::{Fetcher, Request};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::worker::{ActivationReport, FetchEvent, FetchResponse, InstallReport, OfflineWorker};
use crate::ServiceWorkerError;

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Loaded, not yet registered.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

impl ServiceWorkerState {
    /// Only an activated worker intercepts fetches.
    pub fn can_intercept_fetch(&self) -> bool {
        matches!(self, ServiceWorkerState::Activated)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceWorkerState::Redundant)
    }
}

impl fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceWorkerState::Parsed => "parsed",
            ServiceWorkerState::Installing => "installing",
            ServiceWorkerState::Installed => "installed",
            ServiceWorkerState::Activating => "activating",
            ServiceWorkerState::Activated => "activated",
            ServiceWorkerState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

// ==================== Service Worker ====================

/// A worker version tracked by the registration.
#[derive(Debug)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Handlers and configuration of this version.
    pub worker: OfflineWorker,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Error message if failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,

    /// Running install task, while installing.
    install_task: Option<AbortHandle>,
}

impl ServiceWorker {
    pub fn new(worker: OfflineWorker) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            worker,
            state: ServiceWorkerState::Parsed,
            error: None,
            state_changed_at: Instant::now(),
            install_task: None,
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state.can_intercept_fetch()
    }

    /// Stop a running install. Nothing further is written for it.
    fn abort_install(&mut self) {
        if let Some(task) = self.install_task.take() {
            task.abort();
        }
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn cache_name(&self) -> &str {
        self.worker.identity().name()
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            cache: self.cache_name().to_string(),
            state: self.state,
        }
    }
}

/// Point-in-time view of one worker slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: ServiceWorkerId,
    pub cache: String,
    pub state: ServiceWorkerState,
}

/// Point-in-time view of the registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationSnapshot {
    pub installing: Option<WorkerInfo>,
    pub waiting: Option<WorkerInfo>,
    pub active: Option<WorkerInfo>,
    pub controlled_clients: usize,
}

// ==================== Registration ====================

/// Worker slots for one scope.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// Pages controlled by the active worker.
    pub controlled_clients: usize,

    /// Last registration time.
    pub last_update_check: Option<Instant>,
}

impl ServiceWorkerRegistration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            controlled_clients: 0,
            last_update_check: None,
        }
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// A waiting worker may take over once no page depends on the current one.
    pub fn can_promote_waiting(&self) -> bool {
        self.waiting.is_some() && (self.active.is_none() || self.controlled_clients == 0)
    }

    pub fn snapshot(&self) -> RegistrationSnapshot {
        RegistrationSnapshot {
            installing: self.installing.as_ref().map(ServiceWorker::info),
            waiting: self.waiting.as_ref().map(ServiceWorker::info),
            active: self.active.as_ref().map(ServiceWorker::info),
            controlled_clients: self.controlled_clients,
        }
    }
}

// ==================== Events ====================

/// Service worker events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        cache: String,
        new_state: ServiceWorkerState,
    },
    /// A new version started installing.
    UpdateFound { worker_id: ServiceWorkerId },
    /// Controlled pages now go through a different worker.
    ControllerChange { worker_id: ServiceWorkerId },
}

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub id: ServiceWorkerId,
    pub report: InstallReport,
}

// ==================== Host ====================

/// Drives a registration through its lifecycle.
///
/// Install, activate and each fetch run on their own task; the host awaits
/// the task before recording the transition.
pub struct ServiceWorkerHost {
    registration: Arc<RwLock<ServiceWorkerRegistration>>,
    network: Arc<dyn Fetcher>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerHost {
    /// Create a host for `scope`. Uncontrolled requests use `network`.
    pub fn new(
        scope: Url,
        network: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registration: Arc::new(RwLock::new(ServiceWorkerRegistration::new(scope))),
                network,
                event_tx,
            },
            event_rx,
        )
    }

    fn transition(&self, worker: &mut ServiceWorker, state: ServiceWorkerState) {
        worker.set_state(state);
        debug!(worker = worker.id.raw(), cache = %worker.cache_name(), %state, "State change");
        let _ = self.event_tx.send(ServiceWorkerEvent::StateChange {
            worker_id: worker.id,
            cache: worker.cache_name().to_string(),
            new_state: state,
        });
    }

    /// Register a new worker version and wait for its install to finish.
    ///
    /// A failed install leaves the worker redundant and the current active
    /// worker untouched. A newer registration started meanwhile supersedes
    /// this one.
    pub async fn register(
        &self,
        worker: OfflineWorker,
    ) -> Result<InstallOutcome, ServiceWorkerError> {
        let (id, install) = {
            let mut reg = self.registration.write().await;
            if worker.config().scope != reg.scope {
                return Err(ServiceWorkerError::StateError(format!(
                    "worker scope {} does not match registration scope {}",
                    worker.config().scope,
                    reg.scope
                )));
            }

            let mut sw = ServiceWorker::new(worker.clone());
            let id = sw.id;
            self.transition(&mut sw, ServiceWorkerState::Installing);
            let install = tokio::spawn(async move { worker.install().await });
            sw.install_task = Some(install.abort_handle());
            if let Some(mut previous) = reg.installing.replace(sw) {
                info!(worker = previous.id.raw(), "install superseded");
                previous.abort_install();
                self.transition(&mut previous, ServiceWorkerState::Redundant);
            }
            reg.last_update_check = Some(Instant::now());
            let _ = self.event_tx.send(ServiceWorkerEvent::UpdateFound { worker_id: id });
            (id, install)
        };

        let result = match install.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(ServiceWorkerError::Superseded),
            Err(e) => Err(ServiceWorkerError::StateError(format!(
                "install task ended abnormally: {e}"
            ))),
        };

        let mut reg = self.registration.write().await;
        let mut sw = match reg.installing.take() {
            Some(mut sw) if sw.id == id => {
                sw.install_task = None;
                sw
            }
            other => {
                reg.installing = other;
                debug!(worker = id.raw(), "discarding superseded install result");
                return Err(ServiceWorkerError::Superseded);
            }
        };

        match result {
            Ok(report) => {
                self.transition(&mut sw, ServiceWorkerState::Installed);
                if let Some(mut previous) = reg.waiting.replace(sw) {
                    self.transition(&mut previous, ServiceWorkerState::Redundant);
                }
                Ok(InstallOutcome { id, report })
            }
            Err(e) => {
                warn!(worker = id.raw(), error = %e, "install failed, worker is redundant");
                sw.error = Some(e.to_string());
                self.transition(&mut sw, ServiceWorkerState::Redundant);
                Err(e)
            }
        }
    }

    /// Promote the waiting worker if no page depends on the active one.
    ///
    /// Returns `None` when there is nothing to promote or promotion has to
    /// wait.
    pub async fn try_activate(&self) -> Result<Option<ActivationReport>, ServiceWorkerError> {
        self.activate_waiting(false).await
    }

    /// Promote the waiting worker even if pages still use the active one.
    pub async fn skip_waiting(&self) -> Result<Option<ActivationReport>, ServiceWorkerError> {
        self.activate_waiting(true).await
    }

    async fn activate_waiting(
        &self,
        force: bool,
    ) -> Result<Option<ActivationReport>, ServiceWorkerError> {
        let (id, worker) = {
            let mut reg = self.registration.write().await;
            if !force && !reg.can_promote_waiting() {
                trace!(
                    waiting = reg.waiting.is_some(),
                    clients = reg.controlled_clients,
                    "waiting worker not promoted"
                );
                return Ok(None);
            }
            let Some(mut sw) = reg.waiting.take() else {
                return Ok(None);
            };

            self.transition(&mut sw, ServiceWorkerState::Activating);
            if let Some(mut old) = reg.active.take() {
                self.transition(&mut old, ServiceWorkerState::Redundant);
            }
            let pair = (sw.id, sw.worker.clone());
            reg.active = Some(sw);
            pair
        };

        let result = match tokio::spawn(async move { worker.activate().await }).await {
            Ok(result) => result,
            Err(e) => Err(ServiceWorkerError::StateError(format!(
                "activate task ended abnormally: {e}"
            ))),
        };

        // Eviction problems do not keep a worker from becoming active.
        let mut reg = self.registration.write().await;
        if let Some(sw) = reg.active.as_mut().filter(|w| w.id == id) {
            if let Err(ref e) = result {
                warn!(worker = id.raw(), error = %e, "activation cleanup failed");
                sw.error = Some(e.to_string());
            }
            self.transition(sw, ServiceWorkerState::Activated);
            let _ = self
                .event_tx
                .send(ServiceWorkerEvent::ControllerChange { worker_id: id });
        }

        result.map(Some)
    }

    /// A page under this scope started using the active worker.
    pub async fn client_attached(&self) -> usize {
        let mut reg = self.registration.write().await;
        reg.controlled_clients += 1;
        reg.controlled_clients
    }

    /// A controlled page went away.
    pub async fn client_detached(&self) -> usize {
        let mut reg = self.registration.write().await;
        reg.controlled_clients = reg.controlled_clients.saturating_sub(1);
        reg.controlled_clients
    }

    /// Route a request through the active worker, or straight to the network
    /// when no worker is active.
    pub async fn fetch(&self, request: Request) -> Result<FetchResponse, ServiceWorkerError> {
        self.dispatch_fetch(FetchEvent::new(request)).await
    }

    pub async fn dispatch_fetch(
        &self,
        event: FetchEvent,
    ) -> Result<FetchResponse, ServiceWorkerError> {
        let controller = {
            let reg = self.registration.read().await;
            reg.get_active()
                .filter(|w| w.is_active())
                .map(|w| w.worker.clone())
        };

        match controller {
            Some(worker) => {
                let task = tokio::spawn(async move { worker.handle_fetch(event).await });
                match task.await {
                    Ok(result) => result,
                    Err(e) => Err(ServiceWorkerError::StateError(format!(
                        "fetch task ended abnormally: {e}"
                    ))),
                }
            }
            None => {
                trace!(url = %event.request.url, "no active worker, using network");
                let response = self.network.fetch(event.request).await?;
                Ok(FetchResponse::from_network(response))
            }
        }
    }

    /// Resolve a page-relative path against the registration scope.
    pub async fn resolve(&self, path: &str) -> Result<Url, ServiceWorkerError> {
        let reg = self.registration.read().await;
        reg.scope
            .join(path)
            .map_err(|e| ServiceWorkerError::StateError(format!("cannot resolve {path:?}: {e}")))
    }

    pub async fn snapshot(&self) -> RegistrationSnapshot {
        self.registration.read().await.snapshot()
    }

    /// Drop every worker. Caches are left for the next registration to evict.
    pub async fn unregister(&self) -> bool {
        let mut guard = self.registration.write().await;
        let reg = &mut *guard;
        let mut found = false;
        for slot in [&mut reg.installing, &mut reg.waiting, &mut reg.active] {
            if let Some(mut worker) = slot.take() {
                worker.abort_install();
                self.transition(&mut worker, ServiceWorkerState::Redundant);
                found = true;
            }
        }
        reg.controlled_clients = 0;
        found
    }
}
