//! The host that drives worker lifecycles.
//!
//! Lifecycle jobs (register, activate, unregister) run one at a time. Fetches
//! run concurrently with each other and with jobs; a job never holds the
//! registration lock across a network call.

use hashbrown::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};
use tvkit_net::{Fetcher, NetError, Request, Response, Url};

use crate::cache::{CacheStorage, SharedCacheStorage};
use crate::clients::{ClientId, Clients};
use crate::config::WorkerConfig;
use crate::message::{ControlEnvelope, ControlMessage};
use crate::worker::{ActivationReport, CacheWorker, FetchOutcome, FetchResponse, ResponseSource};
use crate::{
    ServiceWorker, ServiceWorkerError, ServiceWorkerId, ServiceWorkerRegistration,
    ServiceWorkerState,
};

// ==================== Events ====================

/// Lifecycle notification delivered to pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A new worker started installing in `scope`.
    UpdateFound {
        scope: Url,
        worker_id: ServiceWorkerId,
    },
    /// A worker in `scope` changed state.
    StateChange {
        scope: Url,
        worker_id: ServiceWorkerId,
        state: ServiceWorkerState,
    },
    /// The page identified by `client_id` is now controlled by `worker_id`.
    ControllerChange {
        client_id: ClientId,
        worker_id: ServiceWorkerId,
    },
}

// ==================== Snapshots & Handles ====================

/// Read-only view of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub id: ServiceWorkerId,
    pub state: ServiceWorkerState,
    pub version: String,
}

impl From<&ServiceWorker> for WorkerSnapshot {
    fn from(worker: &ServiceWorker) -> Self {
        Self {
            id: worker.id,
            state: worker.state,
            version: worker.version().to_string(),
        }
    }
}

/// Read-only view of one registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationSnapshot {
    pub scope: Url,
    pub installing: Option<WorkerSnapshot>,
    pub waiting: Option<WorkerSnapshot>,
    pub active: Option<WorkerSnapshot>,
}

impl From<&ServiceWorkerRegistration> for RegistrationSnapshot {
    fn from(registration: &ServiceWorkerRegistration) -> Self {
        Self {
            scope: registration.scope.clone(),
            installing: registration.installing.as_ref().map(Into::into),
            waiting: registration.waiting.as_ref().map(Into::into),
            active: registration.active.as_ref().map(Into::into),
        }
    }
}

/// What `register` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// The newest worker already runs this version.
    Unchanged { worker_id: ServiceWorkerId },
    /// A new worker installed. `activation` is set when it also activated.
    Installed {
        worker_id: ServiceWorkerId,
        activation: Option<ActivationReport>,
    },
}

/// A page's view of the registration covering it.
///
/// Holds only weak references, so a page outliving the host sees errors
/// instead of keeping the host alive.
#[derive(Debug, Clone)]
pub struct RegistrationHandle {
    page_url: Url,
    control: mpsc::WeakUnboundedSender<ControlEnvelope>,
    container: Weak<ServiceWorkerContainer>,
}

impl RegistrationHandle {
    /// Queue a control message for `worker_id`.
    ///
    /// Messages are delivered in order by the host's dispatch task.
    pub fn post_message(
        &self,
        worker_id: ServiceWorkerId,
        message: ControlMessage,
    ) -> Result<(), ServiceWorkerError> {
        let control = self
            .control
            .upgrade()
            .ok_or_else(|| ServiceWorkerError::StateError("Host is gone".to_string()))?;
        control
            .send(ControlEnvelope {
                target: worker_id,
                message,
            })
            .map_err(|_| ServiceWorkerError::StateError("Control channel closed".to_string()))
    }

    /// Current state of the registration covering this page, if any.
    pub async fn snapshot(&self) -> Option<RegistrationSnapshot> {
        let container = self.container.upgrade()?;
        container.get_registration(&self.page_url).await
    }
}

/// A page attached to the host.
#[derive(Debug)]
pub struct PageConnection {
    pub client_id: ClientId,
    /// Controller at connect time. Later changes arrive as events.
    pub controller: Option<ServiceWorkerId>,
    pub events: mpsc::UnboundedReceiver<ServiceWorkerEvent>,
    pub registration: RegistrationHandle,
}

// ==================== Container ====================

/// Hosts registrations, the shared cache storage and every open page.
pub struct ServiceWorkerContainer {
    registrations: RwLock<HashMap<String, ServiceWorkerRegistration>>,
    caches: SharedCacheStorage,
    clients: RwLock<Clients>,
    fetcher: Arc<dyn Fetcher>,
    jobs: Mutex<()>,
    writes: Mutex<JoinSet<()>>,
    control_tx: mpsc::UnboundedSender<ControlEnvelope>,
}

impl ServiceWorkerContainer {
    /// Create a host and start its control-message dispatch task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(fetcher: Arc<dyn Fetcher>, storage: CacheStorage) -> Arc<Self> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let container = Arc::new(Self {
            registrations: RwLock::new(HashMap::new()),
            caches: Arc::new(RwLock::new(storage)),
            clients: RwLock::new(Clients::new()),
            fetcher,
            jobs: Mutex::new(()),
            writes: Mutex::new(JoinSet::new()),
            control_tx,
        });

        tokio::spawn(Self::dispatch_control(Arc::downgrade(&container), control_rx));
        container
    }

    async fn dispatch_control(
        container: Weak<Self>,
        mut rx: mpsc::UnboundedReceiver<ControlEnvelope>,
    ) {
        while let Some(envelope) = rx.recv().await {
            let Some(container) = container.upgrade() else {
                break;
            };
            if let Err(e) = container.deliver_message(envelope).await {
                warn!(target_worker = ?envelope.target, error = %e, "Control message failed");
            }
        }
        trace!("Control dispatch stopped");
    }

    /// Shared cache storage.
    pub fn caches(&self) -> &SharedCacheStorage {
        &self.caches
    }

    // ---- Registration ----

    /// Register `script_url` running `config`.
    ///
    /// The scope is the script's directory. Registering the version the
    /// newest worker already runs is a no-op. A failed install leaves the
    /// previous active worker in place.
    pub async fn register(
        &self,
        script_url: Url,
        config: WorkerConfig,
    ) -> Result<RegistrationOutcome, ServiceWorkerError> {
        if let Err(e) = config.validate() {
            warn!(script = %script_url, category = e.category(), error = %e, "Rejected worker config");
            return Err(e.into());
        }
        let scope = scope_for(&script_url)?;
        let _job = self.jobs.lock().await;

        let (worker_id, handler) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(scope.to_string())
                .or_insert_with(|| ServiceWorkerRegistration::new(scope.clone()));

            if let Some(newest) = registration.newest_worker() {
                if newest.version() == config.cache_version {
                    debug!(scope = %scope, version = %config.cache_version, "Version unchanged");
                    return Ok(RegistrationOutcome::Unchanged {
                        worker_id: newest.id,
                    });
                }
            }

            let handler = Arc::new(CacheWorker::new(config, Arc::clone(&self.fetcher)));
            let worker = ServiceWorker::new(script_url.clone(), Arc::clone(&handler));
            let worker_id = registration.begin_install(worker)?;
            (worker_id, handler)
        };

        info!(scope = %scope, version = %handler.version(), worker_id = ?worker_id, "Installing worker");
        self.notify(
            &scope,
            ServiceWorkerEvent::UpdateFound {
                scope: scope.clone(),
                worker_id,
            },
        )
        .await;
        self.notify_state(&scope, worker_id, ServiceWorkerState::Installing)
            .await;

        let outcome = match handler.on_install(&scope, &self.caches).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(scope = %scope, worker_id = ?worker_id, error = %e, "Install failed");
                {
                    let mut registrations = self.registrations.write().await;
                    if let Some(registration) = registrations.get_mut(scope.as_str()) {
                        registration.install_failed(&e.to_string());
                        if registration.newest_worker().is_none() {
                            registrations.remove(scope.as_str());
                        }
                    }
                }
                self.notify_state(&scope, worker_id, ServiceWorkerState::Redundant)
                    .await;
                return Err(e);
            }
        };

        let (replaced, has_active) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope.as_str())
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
            let replaced = registration.install_complete()?;
            (replaced, registration.active.is_some())
        };

        if let Some(replaced) = replaced {
            debug!(worker_id = ?replaced.id, "Waiting worker replaced");
            self.notify_state(&scope, replaced.id, ServiceWorkerState::Redundant)
                .await;
        }
        self.notify_state(&scope, worker_id, ServiceWorkerState::Installed)
            .await;

        let activation = if !has_active || outcome.skip_waiting {
            Some(self.activate_waiting(&scope).await?)
        } else {
            info!(scope = %scope, worker_id = ?worker_id, "Worker waiting");
            None
        };

        Ok(RegistrationOutcome::Installed {
            worker_id,
            activation,
        })
    }

    /// Promote the waiting worker of `scope`. Caller holds the job lock.
    async fn activate_waiting(&self, scope: &Url) -> Result<ActivationReport, ServiceWorkerError> {
        let (worker, previous) = {
            let mut registrations = self.registrations.write().await;
            registrations
                .get_mut(scope.as_str())
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?
                .promote_waiting()?
        };

        if let Some(ref previous) = previous {
            self.notify_state(scope, previous.id, ServiceWorkerState::Redundant)
                .await;
        }
        self.notify_state(scope, worker.id, ServiceWorkerState::Activating)
            .await;

        let report = worker.handler().on_activate(&self.caches).await;

        self.registrations
            .write()
            .await
            .get_mut(scope.as_str())
            .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?
            .finish_activation()?;
        self.notify_state(scope, worker.id, ServiceWorkerState::Activated)
            .await;

        {
            let mut clients = self.clients.write().await;
            if let Some(ref previous) = previous {
                clients.hand_over(previous.id, worker.id);
            }
            if report.claim {
                let claimed = clients.claim(scope, worker.id);
                debug!(scope = %scope, claimed = claimed.len(), "Clients claimed");
            }
        }

        info!(scope = %scope, version = %worker.version(), worker_id = ?worker.id, "Worker activated");
        Ok(report)
    }

    /// Queue a control message for `worker_id`.
    pub fn post_message(
        &self,
        worker_id: ServiceWorkerId,
        message: ControlMessage,
    ) -> Result<(), ServiceWorkerError> {
        self.control_tx
            .send(ControlEnvelope {
                target: worker_id,
                message,
            })
            .map_err(|_| ServiceWorkerError::StateError("Control channel closed".to_string()))
    }

    /// Deliver a control message now.
    ///
    /// Returns `true` when the message activated the target.
    pub async fn deliver_message(
        &self,
        envelope: ControlEnvelope,
    ) -> Result<bool, ServiceWorkerError> {
        let _job = self.jobs.lock().await;

        let (scope, handler, waiting) = {
            let registrations = self.registrations.read().await;
            registrations
                .values()
                .find_map(|r| {
                    r.worker(envelope.target).map(|w| {
                        let waiting = r.waiting.as_ref().is_some_and(|x| x.id == w.id);
                        (r.scope.clone(), Arc::clone(w.handler()), waiting)
                    })
                })
                .ok_or_else(|| ServiceWorkerError::NotFound(format!("{:?}", envelope.target)))?
        };

        if !handler.on_message(envelope.message) {
            return Ok(false);
        }
        if !waiting {
            debug!(worker_id = ?envelope.target, "Skip waiting ignored, worker not waiting");
            return Ok(false);
        }

        self.activate_waiting(&scope).await?;
        Ok(true)
    }

    /// Remove the registration for `scope`. Every worker becomes redundant and
    /// its pages become uncontrolled. Cache generations are kept.
    pub async fn unregister(&self, scope: &Url) -> Result<bool, ServiceWorkerError> {
        let _job = self.jobs.lock().await;

        let Some(mut registration) = self.registrations.write().await.remove(scope.as_str())
        else {
            return Ok(false);
        };

        for worker in registration.unregister() {
            self.clients.write().await.release(worker.id);
            self.notify_state(scope, worker.id, ServiceWorkerState::Redundant)
                .await;
        }

        info!(scope = %scope, "Registration removed");
        Ok(true)
    }

    /// Registration whose scope covers `url`, longest scope first.
    pub async fn get_registration(&self, url: &Url) -> Option<RegistrationSnapshot> {
        let registrations = self.registrations.read().await;
        covering(&registrations, url).map(Into::into)
    }

    /// Every registration, ordered by scope.
    pub async fn registrations(&self) -> Vec<RegistrationSnapshot> {
        let registrations = self.registrations.read().await;
        let mut all: Vec<RegistrationSnapshot> = registrations.values().map(Into::into).collect();
        all.sort_by(|a, b| a.scope.as_str().cmp(b.scope.as_str()));
        all
    }

    // ---- Pages ----

    /// Attach a page at `url`. It is controlled right away when an activated
    /// worker covers it.
    pub async fn connect(self: &Arc<Self>, url: Url) -> PageConnection {
        let controller = {
            let registrations = self.registrations.read().await;
            covering(&registrations, &url)
                .and_then(|r| r.active.as_ref())
                .filter(|w| w.is_active())
                .map(|w| w.id)
        };

        let (client_id, events) = self.clients.write().await.add(url.clone(), controller);

        PageConnection {
            client_id,
            controller,
            events,
            registration: RegistrationHandle {
                page_url: url,
                control: self.control_tx.downgrade(),
                container: Arc::downgrade(self),
            },
        }
    }

    /// Detach a page.
    pub async fn disconnect(&self, client_id: ClientId) {
        let mut clients = self.clients.write().await;
        clients.remove(client_id);
        clients.prune();
    }

    /// Controller of an attached page.
    pub async fn controller_of(&self, client_id: ClientId) -> Option<ServiceWorkerId> {
        self.clients
            .read()
            .await
            .get(client_id)
            .and_then(|c| c.controller)
    }

    // ---- Fetch ----

    /// Serve a request.
    ///
    /// With a client, the page's controller handles it. Without one, the
    /// activated worker covering the URL does. Uncontrolled requests go to
    /// the network untouched. Cache writes run in the background.
    pub async fn handle_fetch(
        &self,
        client: Option<ClientId>,
        request: Request,
    ) -> Result<FetchResponse, NetError> {
        let Some(handler) = self.handler_for(client, &request.url).await else {
            return self.passthrough(&request).await;
        };

        match handler.on_fetch(&request, &self.caches).await {
            FetchOutcome::Passthrough => self.passthrough(&request).await,
            FetchOutcome::Network { response, store } => {
                if store {
                    self.spawn_write(handler, request, response.clone()).await;
                }
                Ok(FetchResponse {
                    response,
                    source: ResponseSource::Network,
                })
            }
            FetchOutcome::Cached(response) => Ok(FetchResponse {
                response,
                source: ResponseSource::Cache,
            }),
            FetchOutcome::Failed(e) => Err(e),
        }
    }

    /// Wait for every background cache write to finish.
    pub async fn wait_for_cache_writes(&self) {
        let mut writes = self.writes.lock().await;
        while let Some(joined) = writes.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Cache write task failed");
            }
        }
    }

    async fn handler_for(&self, client: Option<ClientId>, url: &Url) -> Option<Arc<CacheWorker>> {
        let registrations = self.registrations.read().await;
        match client {
            Some(client_id) => {
                let controller = self.clients.read().await.get(client_id)?.controller?;
                registrations
                    .values()
                    .find_map(|r| r.worker(controller))
                    .filter(|w| !w.is_redundant())
                    .map(|w| Arc::clone(w.handler()))
            }
            None => covering(&registrations, url)
                .and_then(|r| r.active.as_ref())
                .map(|w| Arc::clone(w.handler())),
        }
    }

    async fn passthrough(&self, request: &Request) -> Result<FetchResponse, NetError> {
        let response = self.fetcher.fetch(request).await?;
        Ok(FetchResponse {
            response,
            source: ResponseSource::Passthrough,
        })
    }

    async fn spawn_write(
        &self,
        handler: Arc<CacheWorker>,
        request: Request,
        response: Response,
    ) {
        let caches = Arc::clone(&self.caches);
        let mut writes = self.writes.lock().await;
        while writes.try_join_next().is_some() {}

        writes.spawn(async move {
            match handler.store(&caches, &request, &response).await {
                Ok(true) => trace!(url = %request.url, "Response cached"),
                Ok(false) => debug!(
                    url = %request.url,
                    version = %handler.version(),
                    "Generation gone, write skipped"
                ),
                Err(e) => debug!(url = %request.url, error = %e, "Cache write dropped"),
            }
        });
    }

    // ---- Notification ----

    async fn notify(&self, scope: &Url, event: ServiceWorkerEvent) {
        self.clients.read().await.notify_scope(scope, &event);
    }

    async fn notify_state(&self, scope: &Url, worker_id: ServiceWorkerId, state: ServiceWorkerState) {
        self.notify(
            scope,
            ServiceWorkerEvent::StateChange {
                scope: scope.clone(),
                worker_id,
                state,
            },
        )
        .await;
    }
}

impl std::fmt::Debug for ServiceWorkerContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorkerContainer").finish_non_exhaustive()
    }
}

/// Directory of the script, which becomes the registration scope.
fn scope_for(script_url: &Url) -> Result<Url, ServiceWorkerError> {
    if script_url.cannot_be_a_base() {
        return Err(ServiceWorkerError::RegistrationFailed(format!(
            "{script_url} cannot be a base URL"
        )));
    }
    script_url
        .join("./")
        .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))
}

fn covering<'a>(
    registrations: &'a HashMap<String, ServiceWorkerRegistration>,
    url: &Url,
) -> Option<&'a ServiceWorkerRegistration> {
    registrations
        .iter()
        .filter(|(scope, _)| url.as_str().starts_with(scope.as_str()))
        .max_by_key(|(scope, _)| scope.len())
        .map(|(_, registration)| registration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use http::StatusCode;

    /// Answers every request with its own path as the body.
    struct Echo;

    #[async_trait]
    impl Fetcher for Echo {
        async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
            Ok(Response::new(
                request.url.clone(),
                StatusCode::OK,
                request.url.path().to_string(),
            ))
        }
    }

    fn config(version: &str) -> WorkerConfig {
        WorkerConfig {
            cache_version: version.to_string(),
            seed_manifest: vec!["/".to_string()],
            ..Default::default()
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_scope_for_script() {
        assert_eq!(
            scope_for(&url("https://tv.example/sw.js")).unwrap().as_str(),
            "https://tv.example/"
        );
        assert_eq!(
            scope_for(&url("https://tv.example/app/sw.js")).unwrap().as_str(),
            "https://tv.example/app/"
        );
        assert!(scope_for(&url("data:text/plain,sw")).is_err());
    }

    #[tokio::test]
    async fn test_first_register_activates() {
        let container = ServiceWorkerContainer::new(Arc::new(Echo), CacheStorage::new());

        let outcome = container
            .register(url("https://tv.example/sw.js"), config("v1"))
            .await
            .unwrap();
        let RegistrationOutcome::Installed { worker_id, activation } = outcome else {
            panic!("expected install");
        };
        assert_eq!(activation.unwrap().version, "v1");

        let snapshot = container
            .get_registration(&url("https://tv.example/live"))
            .await
            .unwrap();
        let active = snapshot.active.unwrap();
        assert_eq!(active.id, worker_id);
        assert_eq!(active.state, ServiceWorkerState::Activated);
        assert!(snapshot.waiting.is_none());
    }

    #[tokio::test]
    async fn test_same_version_is_noop() {
        let container = ServiceWorkerContainer::new(Arc::new(Echo), CacheStorage::new());
        container
            .register(url("https://tv.example/sw.js"), config("v1"))
            .await
            .unwrap();

        let again = container
            .register(url("https://tv.example/sw.js"), config("v1"))
            .await
            .unwrap();
        assert!(matches!(again, RegistrationOutcome::Unchanged { .. }));
    }

    #[tokio::test]
    async fn test_waits_without_skip_waiting() {
        let container = ServiceWorkerContainer::new(Arc::new(Echo), CacheStorage::new());
        container
            .register(url("https://tv.example/sw.js"), config("v1"))
            .await
            .unwrap();

        let mut v2 = config("v2");
        v2.skip_waiting_on_install = false;
        let outcome = container
            .register(url("https://tv.example/sw.js"), v2)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            RegistrationOutcome::Installed { activation: None, .. }
        ));

        let snapshot = container.registrations().await.remove(0);
        assert_eq!(snapshot.active.unwrap().version, "v1");
        let waiting = snapshot.waiting.unwrap();
        assert_eq!(waiting.version, "v2");
        assert_eq!(waiting.state, ServiceWorkerState::Installed);

        assert!(container
            .deliver_message(ControlEnvelope {
                target: waiting.id,
                message: ControlMessage::SkipWaiting,
            })
            .await
            .unwrap());
        let snapshot = container.registrations().await.remove(0);
        assert_eq!(snapshot.active.unwrap().version, "v2");
        assert_eq!(container.caches().read().await.keys(), vec!["v2".to_string()]);
    }

    #[tokio::test]
    async fn test_connect_and_claim() {
        let container = ServiceWorkerContainer::new(Arc::new(Echo), CacheStorage::new());
        let mut page = container.connect(url("https://tv.example/")).await;
        assert!(page.controller.is_none());

        let RegistrationOutcome::Installed { worker_id, .. } = container
            .register(url("https://tv.example/sw.js"), config("v1"))
            .await
            .unwrap()
        else {
            panic!("expected install");
        };

        let mut seen = Vec::new();
        while let Ok(event) = page.events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen[0], ServiceWorkerEvent::UpdateFound { .. }));
        assert_eq!(
            seen.last(),
            Some(&ServiceWorkerEvent::ControllerChange {
                client_id: page.client_id,
                worker_id,
            })
        );
        assert_eq!(container.controller_of(page.client_id).await, Some(worker_id));

        let late = container.connect(url("https://tv.example/guide")).await;
        assert_eq!(late.controller, Some(worker_id));
    }

    #[tokio::test]
    async fn test_uncontrolled_fetch_passes_through() {
        let container = ServiceWorkerContainer::new(Arc::new(Echo), CacheStorage::new());
        let page = container.connect(url("https://tv.example/")).await;

        let fetched = container
            .handle_fetch(
                Some(page.client_id),
                Request::parse_get("https://tv.example/guide").unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(fetched.source, ResponseSource::Passthrough);
        container.wait_for_cache_writes().await;
        assert!(container.caches().read().await.keys().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_releases_pages() {
        let container = ServiceWorkerContainer::new(Arc::new(Echo), CacheStorage::new());
        container
            .register(url("https://tv.example/sw.js"), config("v1"))
            .await
            .unwrap();
        let page = container.connect(url("https://tv.example/")).await;
        assert!(page.controller.is_some());

        assert!(container.unregister(&url("https://tv.example/")).await.unwrap());
        assert!(container.controller_of(page.client_id).await.is_none());
        assert!(container.registrations().await.is_empty());
        assert!(!container.unregister(&url("https://tv.example/")).await.unwrap());
    }

    #[tokio::test]
    async fn test_handle_posts_through_dispatch() {
        let container = ServiceWorkerContainer::new(Arc::new(Echo), CacheStorage::new());
        container
            .register(url("https://tv.example/sw.js"), config("v1"))
            .await
            .unwrap();
        let mut page = container.connect(url("https://tv.example/")).await;

        let mut v2 = config("v2");
        v2.skip_waiting_on_install = false;
        container
            .register(url("https://tv.example/sw.js"), v2)
            .await
            .unwrap();

        let waiting = page.registration.snapshot().await.unwrap().waiting.unwrap();
        page.registration
            .post_message(waiting.id, ControlMessage::SkipWaiting)
            .unwrap();

        loop {
            match page.events.recv().await.unwrap() {
                ServiceWorkerEvent::ControllerChange { worker_id, .. } => {
                    assert_eq!(worker_id, waiting.id);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_handle_outliving_host() {
        let container = ServiceWorkerContainer::new(Arc::new(Echo), CacheStorage::new());
        let page = container.connect(url("https://tv.example/")).await;
        drop(container);

        assert!(page.registration.snapshot().await.is_none());
    }
}
