//! Connections known to one server.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::UnboundedSender;
use tracing::*;

pub type ClientId = u64;

/// Requests delivered to a connection task from outside
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Close(String),
    /// Outcome of a pending connection query
    Approve { accept: bool, reason: String },
    UserJoined(String),
    UserLeft(String),
    RecheckPermissions,
    /// 0 full access, 1 view only, 2 no access
    SetStatus(u8),
    RequestFrameStats,
}

#[derive(Debug)]
struct Client {
    peer: String,
    user: Option<String>,
    authenticated: bool,
    tx: UnboundedSender<Control>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: ClientId,
    clients: BTreeMap<ClientId, Client>,
    pointer_client: Option<ClientId>,
}

impl Inner {
    fn broadcast_except(&self, id: ClientId, msg: Control) {
        for (other, client) in &self.clients {
            if *other != id && client.authenticated {
                let _ = client.tx.send(msg.clone());
            }
        }
    }
}

/// Shared table of every live connection
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<Inner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The returned entry removes the connection again when dropped
    pub fn register(&self, peer: &str, tx: UnboundedSender<Control>) -> RegistryEntry {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.clients.insert(
            id,
            Client {
                peer: peer.to_string(),
                user: None,
                authenticated: false,
                tx,
            },
        );
        debug!("Registered client {} from {}", id, peer);
        RegistryEntry {
            registry: self.clone(),
            id,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.lock().clients.keys().copied().collect()
    }

    pub fn peer(&self, id: ClientId) -> Option<String> {
        self.lock().clients.get(&id).map(|c| c.peer.clone())
    }

    /// Users of all authenticated connections, in connection order
    pub fn users(&self) -> Vec<String> {
        self.lock()
            .clients
            .values()
            .filter(|c| c.authenticated)
            .filter_map(|c| c.user.clone())
            .collect()
    }

    pub fn authenticated_count(&self) -> usize {
        self.lock()
            .clients
            .values()
            .filter(|c| c.authenticated)
            .count()
    }

    pub fn send(&self, id: ClientId, msg: Control) -> bool {
        match self.lock().clients.get(&id) {
            Some(client) => client.tx.send(msg).is_ok(),
            None => false,
        }
    }

    pub fn send_all(&self, msg: Control) {
        for client in self.lock().clients.values() {
            let _ = client.tx.send(msg.clone());
        }
    }

    /// Close every connection except `keep`
    pub fn close_clients(&self, reason: &str, keep: Option<ClientId>) {
        for (id, client) in &self.lock().clients {
            if Some(*id) != keep {
                let _ = client.tx.send(Control::Close(reason.to_string()));
            }
        }
    }

    pub fn pointer_client(&self) -> Option<ClientId> {
        self.lock().pointer_client
    }

    /// Claim the pointer while buttons are held, release it otherwise
    ///
    /// Returns false when another client holds it.
    pub fn claim_pointer(&self, id: ClientId, buttons_down: bool) -> bool {
        let mut inner = self.lock();
        match inner.pointer_client {
            Some(owner) if owner != id => false,
            _ => {
                inner.pointer_client = buttons_down.then_some(id);
                true
            }
        }
    }
}

/// Membership of one connection in the [`Registry`]
#[derive(Debug)]
pub struct RegistryEntry {
    registry: Registry,
    id: ClientId,
}

impl RegistryEntry {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The connection finished its handshake
    ///
    /// Other clients hear about the user when the session is shared.
    pub fn authenticated(&self, user: Option<&str>, shared: bool) {
        let mut inner = self.registry.lock();
        if let Some(client) = inner.clients.get_mut(&self.id) {
            client.authenticated = true;
            client.user = user.map(str::to_string);
        }
        if let (true, Some(user)) = (shared, user) {
            info!("Notifying other clients that user '{}' joined the shared session", user);
            inner.broadcast_except(self.id, Control::UserJoined(user.to_string()));
        }
    }

    /// Leave the authenticated set, telling the others; idempotent
    pub fn leave(&self, reason: &str) {
        let mut inner = self.registry.lock();
        let Some(client) = inner.clients.get_mut(&self.id) else {
            return;
        };
        if !client.authenticated {
            return;
        }
        client.authenticated = false;
        if let Some(user) = client.user.clone() {
            info!("Notifying other clients that user '{}' left: {}", user, reason);
            inner.broadcast_except(self.id, Control::UserLeft(user));
        }
    }
}

impl Drop for RegistryEntry {
    fn drop(&mut self) {
        self.leave("connection closed");
        let mut inner = self.registry.lock();
        inner.clients.remove(&self.id);
        if inner.pointer_client == Some(self.id) {
            inner.pointer_client = None;
        }
        debug!("Deregistered client {}", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn entries_deregister_once() {
        let registry = Registry::new();
        let (tx, _rx) = unbounded_channel();
        let a = registry.register("10.0.0.1::5900", tx.clone());
        let b = registry.register("10.0.0.2::5900", tx);
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);
        assert!(registry.claim_pointer(b.id(), true));
        drop(b);
        assert_eq!(registry.ids(), vec![a.id()]);
        assert_eq!(registry.pointer_client(), None);
        drop(a);
        assert!(registry.is_empty());
    }

    #[test]
    fn pointer_has_one_owner() {
        let registry = Registry::new();
        let (tx, _rx) = unbounded_channel();
        let a = registry.register("a", tx.clone());
        let b = registry.register("b", tx);
        assert!(registry.claim_pointer(a.id(), true));
        assert!(!registry.claim_pointer(b.id(), true));
        assert!(registry.claim_pointer(a.id(), false));
        assert!(registry.claim_pointer(b.id(), true));
        assert_eq!(registry.pointer_client(), Some(b.id()));
    }

    #[test]
    fn join_and_leave_are_announced() {
        let registry = Registry::new();
        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        let a = registry.register("a", tx_a);
        a.authenticated(Some("alice"), true);
        let b = registry.register("b", tx_b);
        b.authenticated(Some("bob"), true);
        assert_eq!(rx_a.try_recv().unwrap(), Control::UserJoined("bob".into()));
        assert!(rx_b.try_recv().is_err());
        assert_eq!(registry.users(), vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(registry.authenticated_count(), 2);

        b.leave("bye");
        b.leave("bye again");
        drop(b);
        assert_eq!(rx_a.try_recv().unwrap(), Control::UserLeft("bob".into()));
        assert!(rx_a.try_recv().is_err());

        registry.close_clients("shutdown", None);
        assert_eq!(rx_a.try_recv().unwrap(), Control::Close("shutdown".into()));
    }
}
