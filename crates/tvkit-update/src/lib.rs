//! # TvKit Update
//!
//! Page-side coordination for the offline cache worker.
//!
//! ## Features
//!
//! - **Update detection**: a new worker reaching `installed` while another
//!   controls the page raises the update-available flag
//! - **Apply update**: asks the waiting worker to skip waiting, then reloads
//!   the page once when it takes control
//! - **Install prompt**: the platform's one-shot install offer is captured,
//!   announced on the app bus, and consumed on the first trigger
//!
//! ## Example
//!
//! ```ignore
//! let (mut coordinator, events) = UpdateCoordinator::new(page, host, AppBus::global().clone());
//! let flag = coordinator.update_available();
//! tokio::spawn(coordinator.run(events, platform_rx, action_rx));
//! ```

use thiserror::Error;
use tvkit_sw::ServiceWorkerError;

pub mod bus;
pub mod coordinator;
pub mod prompt;

pub use bus::{AppBus, AppEvent};
pub use coordinator::{
    ApplyOutcome, InstallResult, PageHost, PlatformEvent, UpdateCoordinator, UserAction,
};
pub use prompt::{InstallOffer, InstallPrompt, UserChoice};

/// Errors that can occur while coordinating updates.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("No registration covers this page")]
    NoRegistration,

    #[error("Install prompt failed: {0}")]
    Prompt(String),

    #[error(transparent)]
    Worker(#[from] ServiceWorkerError),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
