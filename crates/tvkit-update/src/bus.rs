//! Application-wide broadcast bus.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 64;

/// Notification shared between the coordinator and UI collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    /// Whether the app can currently be installed.
    Installable { available: bool },
    /// UI asks to show the install prompt.
    InstallTrigger,
}

/// Typed publish/subscribe channel living as long as the application.
#[derive(Debug, Clone)]
pub struct AppBus {
    tx: broadcast::Sender<AppEvent>,
}

impl Default for AppBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl AppBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Process-wide bus, created on first use.
    pub fn global() -> &'static AppBus {
        static GLOBAL: OnceLock<AppBus> = OnceLock::new();
        GLOBAL.get_or_init(AppBus::default)
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: AppEvent) -> usize {
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!(?event, delivered, "App event published");
        delivered
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = AppBus::new(4);
        assert_eq!(bus.publish(AppEvent::InstallTrigger), 0);
    }

    #[test]
    fn test_every_subscriber_receives() {
        let bus = AppBus::new(4);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(AppEvent::Installable { available: true }), 2);
        assert_eq!(a.try_recv().unwrap(), AppEvent::Installable { available: true });
        assert_eq!(b.try_recv().unwrap(), AppEvent::Installable { available: true });
    }

    #[test]
    fn test_global_is_shared() {
        let first = AppBus::global();
        let mut rx = first.subscribe();
        AppBus::global().publish(AppEvent::InstallTrigger);
        assert_eq!(rx.try_recv().unwrap(), AppEvent::InstallTrigger);
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_string(&AppEvent::Installable { available: false }).unwrap();
        assert_eq!(json, r#"{"type":"installable","available":false}"#);
        let parsed: AppEvent = serde_json::from_str(r#"{"type":"install_trigger"}"#).unwrap();
        assert_eq!(parsed, AppEvent::InstallTrigger);
    }
}
