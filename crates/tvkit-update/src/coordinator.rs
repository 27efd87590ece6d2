//! Update coordinator running inside a page.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, trace, warn};
use tvkit_sw::{
    ClientId, ControlMessage, PageConnection, RegistrationHandle, ServiceWorkerEvent,
    ServiceWorkerId, ServiceWorkerState,
};

use crate::bus::{AppBus, AppEvent};
use crate::prompt::{InstallOffer, InstallPrompt, UserChoice};
use crate::Result;

/// Event the platform delivers to the page.
pub enum PlatformEvent {
    /// The app became installable. Carries the one-shot prompt.
    BeforeInstallPrompt(Box<dyn InstallPrompt>),
    /// The app was installed by some other path.
    AppInstalled,
}

impl std::fmt::Debug for PlatformEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BeforeInstallPrompt(_) => f.write_str("BeforeInstallPrompt"),
            Self::AppInstalled => f.write_str("AppInstalled"),
        }
    }
}

/// Action the user can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    ApplyUpdate,
}

/// The page's ability to reload itself.
pub trait PageHost: Send + Sync {
    fn reload(&self);
}

/// What `apply_update` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Skip-waiting sent; the page reloads when the worker takes control.
    Requested { worker_id: ServiceWorkerId },
    /// A newer worker already controlled the page; reloaded right away.
    Reloaded,
    /// A cutover is already in flight.
    AlreadyPending,
    /// Nothing newer than what the page runs.
    NothingToApply,
}

/// What `trigger_install` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallResult {
    Prompted(UserChoice),
    /// No offer held; nothing shown.
    NoOffer,
}

/// Tracks the page's controller, surfaces updates and owns the install offer.
pub struct UpdateCoordinator {
    client_id: ClientId,
    registration: RegistrationHandle,
    /// Controller the page was loaded with.
    loaded_with: Option<ServiceWorkerId>,
    controller: Option<ServiceWorkerId>,
    update_available: watch::Sender<bool>,
    /// Worker asked to skip waiting; the page reloads when it takes control.
    pending: Option<ServiceWorkerId>,
    offer: InstallOffer,
    bus: AppBus,
    host: Arc<dyn PageHost>,
}

impl UpdateCoordinator {
    /// Build a coordinator for `page`. The page's event receiver is handed
    /// back so the caller decides who drives it.
    pub fn new(
        page: PageConnection,
        host: Arc<dyn PageHost>,
        bus: AppBus,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let PageConnection {
            client_id,
            controller,
            events,
            registration,
        } = page;
        let (update_available, _) = watch::channel(false);

        let coordinator = Self {
            client_id,
            registration,
            loaded_with: controller,
            controller,
            update_available,
            pending: None,
            offer: InstallOffer::new(),
            bus,
            host,
        };
        (coordinator, events)
    }

    /// Observe the update-available flag.
    pub fn update_available(&self) -> watch::Receiver<bool> {
        self.update_available.subscribe()
    }

    pub fn is_update_available(&self) -> bool {
        *self.update_available.borrow()
    }

    pub fn controller(&self) -> Option<ServiceWorkerId> {
        self.controller
    }

    pub fn install_available(&self) -> bool {
        self.offer.is_available()
    }

    fn set_update_available(&self, available: bool) {
        self.update_available.send_if_modified(|current| {
            let changed = *current != available;
            *current = available;
            changed
        });
    }

    // ==================== Worker events ====================

    /// React to a lifecycle event from the host.
    pub fn handle_worker_event(&mut self, event: ServiceWorkerEvent) {
        match event {
            ServiceWorkerEvent::UpdateFound { worker_id, .. } => {
                debug!(worker_id = ?worker_id, "Update found");
            }
            ServiceWorkerEvent::StateChange {
                worker_id,
                state: ServiceWorkerState::Installed,
                ..
            } => match self.controller {
                Some(current) if current != worker_id => {
                    info!(worker_id = ?worker_id, controller = ?current, "Update available");
                    self.set_update_available(true);
                }
                // First install, or the page's own worker
                _ => debug!(worker_id = ?worker_id, "Worker installed, no update to offer"),
            },
            ServiceWorkerEvent::StateChange {
                worker_id,
                state: ServiceWorkerState::Redundant,
                ..
            } if self.pending == Some(worker_id) => {
                // Superseded before it took control
                info!(worker_id = ?worker_id, "Pending worker became redundant");
                self.pending = None;
            }
            ServiceWorkerEvent::StateChange {
                worker_id, state, ..
            } => {
                trace!(worker_id = ?worker_id, ?state, "Worker state changed");
            }
            ServiceWorkerEvent::ControllerChange {
                client_id,
                worker_id,
            } => {
                if client_id != self.client_id {
                    return;
                }
                self.controller = Some(worker_id);
                if self.pending.is_some() {
                    self.reload();
                }
            }
        }
    }

    // ==================== Update ====================

    /// Hand control to the waiting worker, then reload once.
    pub async fn apply_update(&mut self) -> Result<ApplyOutcome> {
        let snapshot = self
            .registration
            .snapshot()
            .await
            .ok_or(crate::CoordinatorError::NoRegistration)?;

        if let Some(target) = self.pending {
            let in_flight = [&snapshot.waiting, &snapshot.active]
                .into_iter()
                .flatten()
                .any(|w| w.id == target);
            if in_flight {
                return Ok(ApplyOutcome::AlreadyPending);
            }
            // Replaced by a newer deploy before the message landed
            debug!(worker_id = ?target, "Pending worker gone, retrying");
            self.pending = None;
        }

        if let Some(waiting) = snapshot.waiting {
            self.registration
                .post_message(waiting.id, ControlMessage::SkipWaiting)?;
            self.pending = Some(waiting.id);
            info!(worker_id = ?waiting.id, version = %waiting.version, "Skip waiting requested");
            return Ok(ApplyOutcome::Requested {
                worker_id: waiting.id,
            });
        }

        if self.is_update_available()
            && self.controller.is_some()
            && self.controller != self.loaded_with
        {
            self.reload();
            return Ok(ApplyOutcome::Reloaded);
        }

        debug!("No waiting worker, nothing to apply");
        self.set_update_available(false);
        Ok(ApplyOutcome::NothingToApply)
    }

    fn reload(&mut self) {
        info!(controller = ?self.controller, "Reloading page");
        self.pending = None;
        self.loaded_with = self.controller;
        self.set_update_available(false);
        self.host.reload();
    }

    // ==================== Install prompt ====================

    /// React to a platform event.
    pub fn on_platform_event(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::BeforeInstallPrompt(prompt) => {
                self.offer.capture(prompt);
                self.bus.publish(AppEvent::Installable { available: true });
                debug!("Install offer captured");
            }
            PlatformEvent::AppInstalled => {
                if self.offer.discard() {
                    debug!("Install offer discarded, app installed");
                }
                self.bus.publish(AppEvent::Installable { available: false });
            }
        }
    }

    /// Show the captured install prompt, if any. The offer is spent either way.
    pub async fn trigger_install(&mut self) -> Result<InstallResult> {
        let Some(mut prompt) = self.offer.take() else {
            debug!("Install triggered without an offer");
            return Ok(InstallResult::NoOffer);
        };

        let choice = prompt.prompt().await;
        self.bus.publish(AppEvent::Installable { available: false });

        let choice = choice?;
        info!(?choice, "Install prompt answered");
        Ok(InstallResult::Prompted(choice))
    }

    /// React to an app bus event.
    pub async fn handle_app_event(&mut self, event: AppEvent) -> Result<()> {
        match event {
            AppEvent::InstallTrigger => {
                self.trigger_install().await?;
            }
            // Published by this coordinator
            AppEvent::Installable { .. } => {}
        }
        Ok(())
    }

    // ==================== Event loop ====================

    /// Drive the coordinator until every input closes.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ServiceWorkerEvent>,
        mut platform: mpsc::Receiver<PlatformEvent>,
        mut actions: mpsc::Receiver<UserAction>,
    ) {
        let mut app = self.bus.subscribe();
        let (mut events_open, mut platform_open, mut actions_open) = (true, true, true);

        while events_open || platform_open || actions_open {
            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_worker_event(event),
                    None => events_open = false,
                },
                event = platform.recv(), if platform_open => match event {
                    Some(event) => self.on_platform_event(event),
                    None => platform_open = false,
                },
                action = actions.recv(), if actions_open => match action {
                    Some(UserAction::ApplyUpdate) => {
                        if let Err(e) = self.apply_update().await {
                            warn!(error = %e, "Apply update failed");
                        }
                    }
                    None => actions_open = false,
                },
                event = app.recv() => match event {
                    Ok(event) => {
                        if let Err(e) = self.handle_app_event(event).await {
                            warn!(error = %e, "App event failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "App bus lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        debug!(client_id = ?self.client_id, "Coordinator stopped");
    }
}
