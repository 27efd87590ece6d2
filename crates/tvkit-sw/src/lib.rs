//! # TvKit Service Worker
//!
//! The offline cache worker and the host that drives its lifecycle.
//!
//! ## Features
//!
//! - **Lifecycle**: install, activate, fetch, and control-message handlers
//! - **Generations**: one named cache store per version tag, stale ones purged
//!   on activation
//! - **Network-first fetch**: fresh responses win, the cache is a fallback
//! - **Eligibility filter**: non-GET, admin and API requests never touch the cache
//! - **Clients**: per-page ordered event channels and controller hand-over
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (host)
//!     │
//!     ├── ServiceWorkerRegistration (per scope)
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       └── active (ServiceWorker) ──► CacheWorker handlers
//!     │
//!     ├── CacheStorage
//!     │       └── Cache (generation) ── CacheKey → CacheEntry
//!     │
//!     └── Clients ── ServiceWorkerEvent ──► page
//!             ▲
//!             └── RegistrationHandle ── ControlMessage ──┘
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::trace;
use url::Url;

pub mod cache;
pub mod clients;
pub mod config;
pub mod container;
pub mod message;
pub mod worker;

pub use cache::{CacheEntry, CacheKey, CacheStorage, SharedCacheStorage};
pub use clients::{Client, ClientId, Clients};
pub use config::{StorageConfig, WorkerConfig};
pub use container::{
    PageConnection, RegistrationHandle, RegistrationOutcome, RegistrationSnapshot,
    ServiceWorkerContainer, ServiceWorkerEvent, WorkerSnapshot,
};
pub use message::{ControlEnvelope, ControlMessage};
pub use worker::{
    ActivationReport, CacheWorker, FetchOutcome, FetchResponse, InstallOutcome, ResponseSource,
};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Install of {version} failed: {reason}")]
    InstallFailed { version: String, reason: String },

    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: ServiceWorkerState,
        to: ServiceWorkerState,
    },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Quota exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] tvkit_common::TvKitError),
}

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
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
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Created, install not started.
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
    /// Whether the host may move a worker from `self` to `next`.
    pub fn can_transition_to(self, next: ServiceWorkerState) -> bool {
        use ServiceWorkerState::*;
        matches!(
            (self, next),
            (Parsed, Installing)
                | (Installing, Installed)
                | (Installed, Activating)
                | (Activating, Activated)
                | (Parsed | Installing | Installed | Activating | Activated, Redundant)
        )
    }
}

// ==================== Service Worker ====================

/// A service worker instance.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,

    handler: Arc<CacheWorker>,
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(script_url: Url, handler: Arc<CacheWorker>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            state: ServiceWorkerState::Parsed,
            error: None,
            state_changed_at: Instant::now(),
            handler,
        }
    }

    /// Version tag of the cache generation this worker owns.
    pub fn version(&self) -> &str {
        self.handler.version()
    }

    /// Event handlers of this worker.
    pub fn handler(&self) -> &Arc<CacheWorker> {
        &self.handler
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: ServiceWorkerState) -> Result<(), ServiceWorkerError> {
        if !self.state.can_transition_to(next) {
            return Err(ServiceWorkerError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        trace!(worker_id = ?self.id, from = ?self.state, to = ?next, "State transition");
        self.state = next;
        self.state_changed_at = Instant::now();
        Ok(())
    }

    /// Mark redundant regardless of current state.
    fn retire(&mut self) {
        if self.state != ServiceWorkerState::Redundant {
            self.state = ServiceWorkerState::Redundant;
            self.state_changed_at = Instant::now();
        }
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

// ==================== Registration ====================

/// A service worker registration.
///
/// Holds at most one worker per slot. The host moves workers between slots;
/// every move goes through [`ServiceWorker::transition`].
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

    /// Last update check time.
    pub last_update_check: Option<Instant>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
        }
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// The most recent worker, preferring installing over waiting over active.
    pub fn newest_worker(&self) -> Option<&ServiceWorker> {
        self.installing
            .as_ref()
            .or(self.waiting.as_ref())
            .or(self.active.as_ref())
    }

    /// Find a live worker by id in any slot.
    pub fn worker(&self, id: ServiceWorkerId) -> Option<&ServiceWorker> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .find(|w| w.id == id)
    }

    /// Put a fresh worker into the installing slot.
    pub fn begin_install(
        &mut self,
        mut worker: ServiceWorker,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        if self.installing.is_some() {
            return Err(ServiceWorkerError::StateError(
                "Another worker is already installing".to_string(),
            ));
        }
        worker.transition(ServiceWorkerState::Installing)?;
        let id = worker.id;
        self.installing = Some(worker);
        self.last_update_check = Some(Instant::now());
        Ok(id)
    }

    /// Transition installing to waiting.
    ///
    /// Returns the previously waiting worker, now redundant, if one was replaced.
    pub fn install_complete(&mut self) -> Result<Option<ServiceWorker>, ServiceWorkerError> {
        let mut worker = self.installing.take().ok_or_else(|| {
            ServiceWorkerError::StateError("No installing worker".to_string())
        })?;
        worker.transition(ServiceWorkerState::Installed)?;

        let replaced = self.waiting.replace(worker).map(|mut old| {
            old.retire();
            old
        });
        Ok(replaced)
    }

    /// Drop the installing worker after a failed install.
    pub fn install_failed(&mut self, reason: &str) -> Option<ServiceWorker> {
        self.installing.take().map(|mut worker| {
            worker.error = Some(reason.to_string());
            worker.retire();
            worker
        })
    }

    /// Move the waiting worker into the active slot in `Activating` state.
    ///
    /// Returns the new worker and the previous active worker, now redundant.
    pub fn promote_waiting(
        &mut self,
    ) -> Result<(ServiceWorker, Option<ServiceWorker>), ServiceWorkerError> {
        let mut worker = self
            .waiting
            .take()
            .ok_or_else(|| ServiceWorkerError::StateError("No waiting worker".to_string()))?;

        if let Err(e) = worker.transition(ServiceWorkerState::Activating) {
            self.waiting = Some(worker);
            return Err(e);
        }

        let previous = self.active.replace(worker.clone()).map(|mut old| {
            old.retire();
            old
        });
        Ok((worker, previous))
    }

    /// Complete activation of the worker in the active slot.
    pub fn finish_activation(&mut self) -> Result<&ServiceWorker, ServiceWorkerError> {
        let worker = self
            .active
            .as_mut()
            .ok_or_else(|| ServiceWorkerError::StateError("No activating worker".to_string()))?;
        worker.transition(ServiceWorkerState::Activated)?;
        Ok(worker)
    }

    /// Unregister: every worker becomes redundant. Returns the retired workers.
    pub fn unregister(&mut self) -> Vec<ServiceWorker> {
        [self.active.take(), self.waiting.take(), self.installing.take()]
            .into_iter()
            .flatten()
            .map(|mut worker| {
                worker.retire();
                worker
            })
            .collect()
    }
}
