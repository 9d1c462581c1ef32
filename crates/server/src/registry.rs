//! Connection registry: at most one live connection per identity.
//!
//! `register` closes whatever was registered for the identity before storing
//! the new handle, inside the map's entry lock, so a lookup never resolves a
//! superseded connection. `unregister` only removes the entry if it still
//! points at the same connection, which keeps a late close of an old socket
//! from evicting its replacement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::info;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Frames queued for a connection's writer task
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Pong(Bytes),
}

struct ConnectionInner {
    id: u64,
    identity: String,
    outbound: mpsc::Sender<Outbound>,
    closed: watch::Sender<bool>,
    created_at: Instant,
}

/// Cheap-to-clone handle to one authenticated connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

impl ConnectionHandle {
    pub fn new(identity: impl Into<String>, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                identity: identity.into(),
                outbound,
                closed: watch::Sender::new(false),
                created_at: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    /// Open, and the writer task is still draining the queue.
    pub fn is_writable(&self) -> bool {
        !self.is_closed() && !self.inner.outbound.is_closed()
    }

    /// One non-blocking enqueue attempt. `false` if closed or the queue is full.
    pub fn try_send(&self, frame: Outbound) -> bool {
        if self.is_closed() {
            return false;
        }
        self.inner.outbound.try_send(frame).is_ok()
    }

    /// Enqueue, waiting for queue space. Used for handler replies only.
    pub async fn send(&self, frame: Outbound) -> bool {
        if self.is_closed() {
            return false;
        }
        self.inner.outbound.send(frame).await.is_ok()
    }

    /// Ask the connection's reader and writer to shut down. Idempotent.
    pub fn close(&self) {
        self.inner.closed.send_if_modified(|closed| {
            let changed = !*closed;
            *closed = true;
            changed
        });
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once `close` has been called. Any number of tasks may wait.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("identity", &self.inner.identity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `handle` as the connection for its identity, closing and
    /// returning the one it replaces.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        match self.connections.entry(handle.identity().to_string()) {
            Entry::Occupied(mut entry) => {
                let previous = entry.get().clone();
                previous.close();
                info!(
                    component = "registry",
                    event = "registry.connection.superseded",
                    user_id = %handle.identity(),
                    previous_connection_id = previous.id(),
                    connection_id = handle.id(),
                    "Replaced existing connection"
                );
                entry.insert(handle);
                Some(previous)
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
                None
            }
        }
    }

    pub fn lookup(&self, identity: &str) -> Option<ConnectionHandle> {
        self.connections.get(identity).map(|entry| entry.value().clone())
    }

    /// Remove `handle` if it is still the registered connection for its identity.
    pub fn unregister(&self, handle: &ConnectionHandle) -> bool {
        self.connections
            .remove_if(handle.identity(), |_, current| current.same_connection(handle))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
