use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use sdp_verbs::EndpointId;

use crate::conn::Connection;
use crate::error::SdpError;
use crate::listener::ListenState;

/// What a fabric endpoint belongs to.
#[derive(Clone)]
pub(crate) enum Registered {
    Socket(Arc<Connection>),
    Listener(Arc<ListenState>),
}

/// Maps fabric endpoints to the sockets and listeners that own them, so the
/// event dispatcher can route each event.
pub(crate) struct SocketRegistry {
    entries: DashMap<EndpointId, Registered>,
    closed: AtomicBool,
}

impl SocketRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn insert(&self, ep: EndpointId, entry: Registered) -> Result<(), SdpError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SdpError::Shutdown);
        }
        self.entries.insert(ep, entry);
        Ok(())
    }

    pub(crate) fn remove(&self, ep: EndpointId) -> Option<Registered> {
        self.entries.remove(&ep).map(|(_, entry)| entry)
    }

    pub(crate) fn get(&self, ep: EndpointId) -> Option<Registered> {
        self.entries.get(&ep).map(|e| e.value().clone())
    }

    pub(crate) fn connections(&self) -> Vec<Arc<Connection>> {
        self.entries
            .iter()
            .filter_map(|e| match e.value() {
                Registered::Socket(conn) => Some(conn.clone()),
                Registered::Listener(_) => None,
            })
            .collect()
    }

    pub(crate) fn listeners(&self) -> Vec<Arc<ListenState>> {
        self.entries
            .iter()
            .filter_map(|e| match e.value() {
                Registered::Listener(ls) => Some(ls.clone()),
                Registered::Socket(_) => None,
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Refuse further registrations and hand back everything registered.
    pub(crate) fn shutdown(&self) -> Vec<Registered> {
        self.closed.store(true, Ordering::Release);
        let keys: Vec<EndpointId> = self.entries.iter().map(|e| *e.key()).collect();
        keys.into_iter().filter_map(|ep| self.remove(ep)).collect()
    }
}
