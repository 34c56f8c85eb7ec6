//! Connection handles and the registry that owns them.
//!
//! The registry is the single owner of every open connection. A handle leaves
//! the registry only while a handler is working on it (the entry stays behind
//! as `InFlight`), which is what keeps two handlers off the same descriptor.

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::Token;
use slab::Slab;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// One accepted client connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: usize,
    pub(crate) stream: TcpStream,
    peer: SocketAddr,
    /// Read buffer, reused across requests.
    pub(crate) buffer: BytesMut,
    last_active: Instant,
}

impl ConnectionHandle {
    pub fn new(id: usize, stream: TcpStream, peer: SocketAddr, buffer_size: usize) -> Self {
        Self {
            id,
            stream,
            peer,
            buffer: BytesMut::with_capacity(buffer_size),
            last_active: Instant::now(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Multiplexer token for this connection.
    pub fn token(&self) -> Token {
        Token(self.id)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn touch(&mut self) {
        self.last_active = Instant::now();
    }
}

/// Where a registered connection currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Parked in the registry, waiting for readiness.
    Idle,
    /// Ready, but the worker pool was full; waiting for a free slot.
    Queued,
    /// Owned by a handler.
    InFlight,
}

#[derive(Debug)]
enum Entry {
    Idle(ConnectionHandle),
    Queued(ConnectionHandle),
    InFlight { peer: SocketAddr },
}

impl Entry {
    fn state(&self) -> ConnState {
        match self {
            Entry::Idle(_) => ConnState::Idle,
            Entry::Queued(_) => ConnState::Queued,
            Entry::InFlight { .. } => ConnState::InFlight,
        }
    }
}

/// Registry of open connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. Only the dispatcher
/// thread touches it.
pub struct ConnectionRegistry {
    entries: Slab<Entry>,
    max_connections: usize,
    buffer_size: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize, buffer_size: usize) -> Self {
        Self {
            entries: Slab::with_capacity(max_connections.min(4096)),
            max_connections,
            buffer_size,
        }
    }

    /// Id the next inserted connection will receive.
    pub fn next_id(&self) -> usize {
        self.entries.vacant_key()
    }

    /// Build a handle for a freshly accepted stream, keyed by `next_id`.
    pub fn new_handle(&self, stream: TcpStream, peer: SocketAddr) -> ConnectionHandle {
        ConnectionHandle::new(self.next_id(), stream, peer, self.buffer_size)
    }

    /// Insert a handle built by `new_handle`.
    ///
    /// Hands the connection back if the registry is at capacity.
    pub fn insert(&mut self, handle: ConnectionHandle) -> Result<usize, ConnectionHandle> {
        if self.is_full() {
            return Err(handle);
        }
        let entry = self.entries.vacant_entry();
        let id = entry.key();
        debug_assert_eq!(id, handle.id, "handle built for a different slot");
        entry.insert(Entry::Idle(handle));
        Ok(id)
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn state(&self, id: usize) -> Option<ConnState> {
        self.entries.get(id).map(Entry::state)
    }

    /// Take an idle connection out for a handler, marking it in flight.
    ///
    /// Returns `None` when the id is unknown, queued, or already in flight.
    pub fn checkout(&mut self, id: usize) -> Option<ConnectionHandle> {
        self.take_if(id, ConnState::Idle)
    }

    /// Take a queued connection out for a handler, marking it in flight.
    pub fn resume(&mut self, id: usize) -> Option<ConnectionHandle> {
        self.take_if(id, ConnState::Queued)
    }

    fn take_if(&mut self, id: usize, expected: ConnState) -> Option<ConnectionHandle> {
        let entry = self.entries.get_mut(id)?;
        if entry.state() != expected {
            return None;
        }
        let peer = match entry {
            Entry::Idle(h) | Entry::Queued(h) => h.peer,
            Entry::InFlight { peer } => *peer,
        };
        match std::mem::replace(entry, Entry::InFlight { peer }) {
            Entry::Idle(handle) | Entry::Queued(handle) => Some(handle),
            Entry::InFlight { .. } => None,
        }
    }

    /// Park a checked-out connection until a worker frees up.
    pub fn defer(&mut self, handle: ConnectionHandle) -> Result<(), ConnectionHandle> {
        self.put_back(handle, Entry::Queued)
    }

    /// Return a checked-out connection to idle.
    pub fn checkin(&mut self, mut handle: ConnectionHandle) -> Result<(), ConnectionHandle> {
        handle.touch();
        self.put_back(handle, Entry::Idle)
    }

    fn put_back(
        &mut self,
        handle: ConnectionHandle,
        wrap: fn(ConnectionHandle) -> Entry,
    ) -> Result<(), ConnectionHandle> {
        match self.entries.get_mut(handle.id) {
            Some(entry) if entry.state() == ConnState::InFlight => {
                *entry = wrap(handle);
                Ok(())
            }
            _ => Err(handle),
        }
    }

    /// Drop the in-flight entry of a connection the caller is closing.
    pub fn release(&mut self, id: usize) -> bool {
        match self.entries.get(id) {
            Some(entry) if entry.state() == ConnState::InFlight => {
                self.entries.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Remove a parked (idle or queued) connection.
    ///
    /// In-flight connections are left alone: their handler owns the descriptor.
    pub fn remove(&mut self, id: usize) -> Option<ConnectionHandle> {
        match self.entries.get(id)?.state() {
            ConnState::InFlight => None,
            ConnState::Idle | ConnState::Queued => match self.entries.remove(id) {
                Entry::Idle(handle) | Entry::Queued(handle) => Some(handle),
                Entry::InFlight { .. } => None,
            },
        }
    }

    /// Remove idle connections with no activity for `timeout`.
    pub fn evict_idle(&mut self, now: Instant, timeout: Duration) -> Vec<ConnectionHandle> {
        let stale: Vec<usize> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| match entry {
                Entry::Idle(h) if now.saturating_duration_since(h.last_active) >= timeout => {
                    Some(id)
                }
                _ => None,
            })
            .collect();

        stale.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Remove every parked connection, leaving only in-flight entries.
    pub fn drain_parked(&mut self) -> Vec<ConnectionHandle> {
        let parked: Vec<usize> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.state() != ConnState::InFlight)
            .map(|(id, _)| id)
            .collect();

        parked.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn contains(&self, id: usize) -> bool {
        self.entries.contains(id)
    }

    /// Number of open connections, in flight or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_connections
    }

    pub fn in_flight(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state() == ConnState::InFlight)
            .count()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}
