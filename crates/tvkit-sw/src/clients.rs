//! Open pages and the worker controlling each of them.

use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use url::Url;

use crate::container::ServiceWorkerEvent;
use crate::ServiceWorkerId;

/// Unique identifier for an open page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// An open page.
#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    /// Worker currently controlling the page, if any.
    pub controller: Option<ServiceWorkerId>,
    events: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl Client {
    /// Queue an event for the page. Returns `false` if the page is gone.
    pub fn send(&self, event: ServiceWorkerEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Whether the page lies inside `scope`.
    pub fn in_scope(&self, scope: &Url) -> bool {
        self.url.as_str().starts_with(scope.as_str())
    }
}

/// Every open page. Each page gets its own ordered event channel.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new page and hand back its event receiver.
    pub fn add(
        &mut self,
        url: Url,
        controller: Option<ServiceWorkerId>,
    ) -> (ClientId, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let id = ClientId::new();
        debug!(client_id = id.raw(), url = %url, ?controller, "Client connected");
        self.clients.insert(
            id,
            Client {
                id,
                url,
                controller,
                events,
            },
        );
        (id, rx)
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        let removed = self.clients.remove(&id);
        if removed.is_some() {
            debug!(client_id = id.raw(), "Client disconnected");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Send `event` to every page in `scope`.
    pub fn notify_scope(&self, scope: &Url, event: &ServiceWorkerEvent) {
        for client in self.clients.values().filter(|c| c.in_scope(scope)) {
            if !client.send(event.clone()) {
                trace!(client_id = client.id.raw(), "Event dropped, page gone");
            }
        }
    }

    /// Move every page in `scope` under `worker`, whoever controlled it before.
    ///
    /// Returns the pages whose controller changed.
    pub fn claim(&mut self, scope: &Url, worker: ServiceWorkerId) -> Vec<ClientId> {
        self.reassign(worker, |c| c.in_scope(scope))
    }

    /// Move pages controlled by `old` under `new`.
    pub fn hand_over(&mut self, old: ServiceWorkerId, new: ServiceWorkerId) -> Vec<ClientId> {
        self.reassign(new, |c| c.controller == Some(old))
    }

    /// Clear the controller of pages controlled by `worker`.
    pub fn release(&mut self, worker: ServiceWorkerId) -> Vec<ClientId> {
        let mut released = Vec::new();
        for client in self.clients.values_mut() {
            if client.controller == Some(worker) {
                client.controller = None;
                released.push(client.id);
            }
        }
        released.sort();
        released
    }

    /// Drop pages whose receiver was closed.
    pub fn prune(&mut self) -> usize {
        let before = self.clients.len();
        self.clients.retain(|_, c| !c.events.is_closed());
        before - self.clients.len()
    }

    fn reassign(
        &mut self,
        worker: ServiceWorkerId,
        select: impl Fn(&Client) -> bool,
    ) -> Vec<ClientId> {
        let mut changed = Vec::new();
        for client in self.clients.values_mut() {
            if client.controller != Some(worker) && select(client) {
                client.controller = Some(worker);
                changed.push(client.id);
            }
        }
        changed.sort();
        for id in &changed {
            if let Some(client) = self.clients.get(id) {
                client.send(ServiceWorkerEvent::ControllerChange {
                    client_id: *id,
                    worker_id: worker,
                });
            }
        }
        changed
    }
}
