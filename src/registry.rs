//! Connection bookkeeping for the relay.
//!
//! Each accepted socket becomes a [`Connection`] owning its stream and its own
//! [`FrameBuffer`]. Connections are addressed by an opaque [`ConnectionId`]
//! handed out from a monotonic counter, so ids are never reused and raw file
//! descriptors never leak out of this module.
//!
//! Removal is deferred: a peer that fails mid-broadcast is only marked
//! [`ConnectionState::Closed`] and swept by [`ConnectionRegistry::reap_closed`]
//! once the fan-out is done.

use std::collections::HashMap;
use std::fmt;

use tokio::net::UnixStream;

use crate::framing::FrameBuffer;

/// Opaque identifier of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reading and receiving broadcasts.
    Active,
    /// Failed or hung up; awaiting removal.
    Closed,
}

/// A client connected to the bus.
#[derive(Debug)]
pub struct Connection {
    pub(crate) stream: UnixStream,
    pub(crate) buffer: FrameBuffer,
    state: ConnectionState,
}

impl Connection {
    /// Wrap an accepted stream with an empty receive buffer.
    pub fn new(stream: UnixStream, buffer: FrameBuffer) -> Self {
        Self {
            stream,
            buffer,
            state: ConnectionState::Active,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns true while the connection takes part in the relay.
    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }

    /// Mark the connection for removal.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Receive buffer for this connection.
    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }
}

/// All connections currently known to the relay.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    next_id: u64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a newly accepted connection and return its id.
    pub fn register(&mut self, connection: Connection) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.connections.insert(id, connection);
        id
    }

    /// Remove a connection, dropping its stream and buffered bytes.
    ///
    /// Returns the removed connection, or `None` if it was already gone.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    /// Snapshot of every active connection other than `id`.
    ///
    /// The snapshot is detached from the registry, so callers may close or
    /// remove connections while walking it.
    pub fn all_except(&self, id: ConnectionId) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|(other, conn)| **other != id && conn.is_active())
            .map(|(other, _)| *other)
            .collect()
    }

    /// Snapshot of every active connection id, in ascending order.
    pub fn active_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_active())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Look up a connection.
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Look up a connection mutably.
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// Iterate over all registered connections, closed ones included.
    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &Connection)> {
        self.connections.iter().map(|(id, conn)| (*id, conn))
    }

    /// Mark a connection closed without removing it yet.
    pub fn close(&mut self, id: ConnectionId) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.close();
        }
    }

    /// Remove every closed connection, returning their ids.
    pub fn reap_closed(&mut self) -> Vec<ConnectionId> {
        let closed: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, conn)| !conn.is_active())
            .map(|(id, _)| *id)
            .collect();
        for id in &closed {
            self.connections.remove(id);
        }
        closed
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
