//! Registry of live connections for one transport instance
//!
//! All state sits behind one lock. Fan-out operations snapshot the live
//! connections first and perform I/O after the lock is released, so a send that
//! re-enters the pool (a handler broadcasting from inside a broadcast) cannot
//! deadlock.

use std::{collections::HashMap, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A frame queued for delivery on one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// One encoded JSON-RPC document.
    Message(String),
    Event { event: String, data: Value },
}

/// Transport-specific send half of a connection.
pub trait OutboundChannel: Send + Sync {
    /// Returns `false` once the peer is gone.
    fn deliver(&self, frame: Outbound) -> bool;
}

impl OutboundChannel for UnboundedSender<Outbound> {
    fn deliver(&self, frame: Outbound) -> bool {
        self.send(frame).is_ok()
    }
}

pub struct Connection<S> {
    authenticated: bool,
    connected_at: DateTime<Utc>,
    sender: S,
}

impl<S> Connection<S> {
    pub fn new(sender: S, authenticated: bool) -> Self {
        Self {
            authenticated,
            connected_at: Utc::now(),
            sender,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }
}

impl<S: OutboundChannel> Connection<S> {
    pub fn deliver(&self, frame: Outbound) -> bool {
        self.sender.deliver(frame)
    }
}

struct PoolInner<S> {
    next_id: u64,
    connections: HashMap<ConnectionId, Arc<Connection<S>>>,
}

pub struct ConnectionPool<S> {
    inner: Mutex<PoolInner<S>>,
}

impl<S> Default for ConnectionPool<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ConnectionPool<S> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                next_id: 1,
                connections: HashMap::new(),
            }),
        }
    }

    /// Ids increase monotonically and are never handed out twice by one pool.
    pub fn add(&self, connection: Connection<S>) -> ConnectionId {
        let mut inner = self.inner.lock();
        let id = ConnectionId(inner.next_id);
        inner.next_id += 1;
        inner.connections.insert(id, Arc::new(connection));
        id
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection<S>>> {
        self.inner.lock().connections.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection<S>>> {
        self.inner.lock().connections.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.inner.lock().connections.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> Vec<(ConnectionId, Arc<Connection<S>>)> {
        let mut snapshot: Vec<_> = self
            .inner
            .lock()
            .connections
            .iter()
            .map(|(id, connection)| (*id, connection.clone()))
            .collect();
        snapshot.sort_by_key(|(id, _)| *id);
        snapshot
    }

    /// Runs `send` for every live connection outside the lock; returns how many
    /// sends reported success.
    pub fn broadcast<F>(&self, mut send: F) -> usize
    where
        F: FnMut(ConnectionId, &Connection<S>) -> bool,
    {
        self.snapshot()
            .into_iter()
            .filter(|(id, connection)| send(*id, connection))
            .count()
    }
}

impl<S: OutboundChannel> ConnectionPool<S> {
    /// Broadcasts `frame`, pruning connections whose peer has gone away.
    pub fn deliver_all(&self, frame: &Outbound) -> usize {
        let mut dead = Vec::new();
        let delivered = self.broadcast(|id, connection| {
            let sent = connection.deliver(frame.clone());
            if !sent {
                dead.push(id);
            }
            sent
        });
        for id in dead {
            self.remove(id);
        }
        delivered
    }

    pub fn deliver_to(&self, id: ConnectionId, frame: Outbound) -> bool {
        match self.get(id) {
            Some(connection) => {
                let sent = connection.deliver(frame);
                if !sent {
                    self.remove(id);
                }
                sent
            }
            None => false,
        }
    }
}
