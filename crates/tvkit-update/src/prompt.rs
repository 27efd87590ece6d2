//! The platform's one-shot install capability.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::CoordinatorError;

/// How the user answered the install prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserChoice {
    Accepted,
    Dismissed,
}

/// Install offer handed over by the platform.
#[async_trait]
pub trait InstallPrompt: Send + Sync {
    /// Suppress the platform's own install banner.
    fn prevent_default(&mut self);

    /// Show the prompt and wait for the user's answer.
    async fn prompt(&mut self) -> Result<UserChoice, CoordinatorError>;
}

/// Holds at most one install offer. Taking it empties the slot.
#[derive(Default)]
pub struct InstallOffer {
    prompt: Option<Box<dyn InstallPrompt>>,
}

impl std::fmt::Debug for InstallOffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallOffer")
            .field("available", &self.is_available())
            .finish()
    }
}

impl InstallOffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fresh offer. A stale one still held is dropped.
    pub fn capture(&mut self, mut prompt: Box<dyn InstallPrompt>) {
        prompt.prevent_default();
        if self.prompt.replace(prompt).is_some() {
            debug!("Stale install offer replaced");
        }
    }

    pub fn take(&mut self) -> Option<Box<dyn InstallPrompt>> {
        self.prompt.take()
    }

    /// Drop the offer. Returns whether one was held.
    pub fn discard(&mut self) -> bool {
        self.prompt.take().is_some()
    }

    pub fn is_available(&self) -> bool {
        self.prompt.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Offer {
        suppressed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl InstallPrompt for Offer {
        fn prevent_default(&mut self) {
            self.suppressed.store(true, Ordering::SeqCst);
        }

        async fn prompt(&mut self) -> Result<UserChoice, CoordinatorError> {
            Ok(UserChoice::Accepted)
        }
    }

    #[test]
    fn test_capture_suppresses_banner() {
        let suppressed = Arc::new(AtomicBool::new(false));
        let mut offer = InstallOffer::new();
        offer.capture(Box::new(Offer {
            suppressed: suppressed.clone(),
        }));

        assert!(suppressed.load(Ordering::SeqCst));
        assert!(offer.is_available());
    }

    #[test]
    fn test_take_is_one_shot() {
        let mut offer = InstallOffer::new();
        offer.capture(Box::new(Offer {
            suppressed: Arc::default(),
        }));

        assert!(offer.take().is_some());
        assert!(offer.take().is_none());
        assert!(!offer.discard());
    }
}
