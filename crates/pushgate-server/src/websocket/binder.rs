//! Connection registry: identity → connections, connection → identity.
//!
//! Both indices live behind one mutex so every register, unregister and
//! lookup observes them in agreement. Lookups hand back `Arc` snapshots;
//! callers write to connections after the lock is released.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::connection::EventConnection;
use crate::ids::{ConnectionId, Identity};

#[derive(Default)]
struct BinderState {
    /// Registration order, no duplicate ids, never an empty list.
    by_identity: HashMap<Identity, Vec<Arc<EventConnection>>>,
    by_connection: HashMap<ConnectionId, Identity>,
}

impl BinderState {
    fn remove(&mut self, conn_id: &str) -> Option<Arc<EventConnection>> {
        let identity = self.by_connection.remove(conn_id)?;
        let conns = self.by_identity.get_mut(identity.as_str())?;
        let pos = conns.iter().position(|c| c.id.as_str() == conn_id)?;
        let removed = conns.remove(pos);
        if conns.is_empty() {
            let _ = self.by_identity.remove(identity.as_str());
        }
        Some(removed)
    }

    fn remove_exact(&mut self, conn: &Arc<EventConnection>) -> bool {
        let registered = self
            .by_identity
            .get(conn.owner.as_str())
            .is_some_and(|conns| conns.iter().any(|c| Arc::ptr_eq(c, conn)));
        registered && self.remove(conn.id.as_str()).is_some()
    }
}

/// Live registry of open connections.
#[derive(Default)]
pub struct Binder {
    state: Mutex<BinderState>,
}

impl Binder {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its owner.
    ///
    /// A connection already registered with the same id, under any identity,
    /// is replaced and returned.
    pub fn register(&self, conn: Arc<EventConnection>) -> Option<Arc<EventConnection>> {
        let mut state = self.state.lock();
        let replaced = state.remove(conn.id.as_str());
        let _ = state
            .by_connection
            .insert(conn.id.clone(), conn.owner.clone());
        state
            .by_identity
            .entry(conn.owner.clone())
            .or_default()
            .push(conn.clone());
        drop(state);

        if replaced.is_some() {
            debug!(conn_id = %conn.id, user_id = %conn.owner, "replaced connection with same id");
        }
        replaced
    }

    /// Remove a connection. Unknown ids are a no-op returning `None`.
    pub fn unregister(&self, conn_id: &str) -> Option<Arc<EventConnection>> {
        self.state.lock().remove(conn_id)
    }

    /// Remove `conn` only if that exact connection is still registered.
    ///
    /// A newer registration reusing the same id is left alone.
    pub fn unregister_connection(&self, conn: &Arc<EventConnection>) -> bool {
        self.state.lock().remove_exact(conn)
    }

    /// Connections of `identity` that want `event`, in registration order.
    ///
    /// `None`, `""` and `"*"` select every connection of the identity.
    pub fn lookup(&self, identity: &str, event: Option<&str>) -> Vec<Arc<EventConnection>> {
        let state = self.state.lock();
        state
            .by_identity
            .get(identity)
            .map(|conns| {
                conns
                    .iter()
                    .filter(|c| c.wants(event))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether a connection id is registered.
    pub fn contains(&self, conn_id: &str) -> bool {
        self.state.lock().by_connection.contains_key(conn_id)
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.state.lock().by_connection.len()
    }

    /// Number of identities with at least one connection.
    pub fn identity_count(&self) -> usize {
        self.state.lock().by_identity.len()
    }

    /// Number of connections registered for `identity`.
    pub fn identity_connection_count(&self, identity: &str) -> usize {
        self.state
            .lock()
            .by_identity
            .get(identity)
            .map_or(0, Vec::len)
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let state = self.state.lock();
        let mut listed = 0;
        for (identity, conns) in &state.by_identity {
            assert!(!conns.is_empty(), "empty list for {identity}");
            for conn in conns {
                listed += 1;
                assert_eq!(&conn.owner, identity);
                assert_eq!(state.by_connection.get(&conn.id), Some(identity));
                assert_eq!(
                    conns.iter().filter(|c| c.id == conn.id).count(),
                    1,
                    "duplicate id {}",
                    conn.id
                );
            }
        }
        assert_eq!(listed, state.by_connection.len());
    }
}
